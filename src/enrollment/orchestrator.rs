use std::sync::Arc;

use log::{debug, error, info, trace};
use thiserror::Error;

use crate::core::error::RemoteError;
use crate::core::types::{
    CustomField, CustomFieldValue, EnrollRequest, EnrollmentContext, EnrollmentOutcome,
    EnrollmentRequest, Profile,
};
use crate::domain::{SubjectParts, compose_san_list, parse_subject_dn};
use crate::remote::RemoteAuthority;

use super::pickup::PickupPoller;

pub const PARAM_ORGANIZATION: &str = "Organization";
pub const PARAM_DEPARTMENT: &str = "Department";
pub const PARAM_MULTI_DOMAIN: &str = "MultiDomain";
/// Host user who submitted the request; recorded in the submission comments.
pub const PARAM_REQUESTER: &str = "Keyfactor-Requester";

#[derive(Debug, Error)]
enum EnrollFailure {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl EnrollFailure {
    fn message(&self) -> String {
        match self {
            EnrollFailure::Validation(message) => message.clone(),
            EnrollFailure::Remote(err) => err.user_message(),
        }
    }
}

fn invalid(message: impl Into<String>) -> EnrollFailure {
    EnrollFailure::Validation(message.into())
}

/// Organization id and the resolved context for one submission.
struct Resolved {
    context: EnrollmentContext,
    org_id: i64,
}

/// Drives a single enrollment from request descriptor to issued bytes or a
/// pending outcome.
pub struct Enroller {
    client: Arc<dyn RemoteAuthority>,
    poller: PickupPoller,
    external_requester_field: Option<String>,
}

impl Enroller {
    pub fn new(
        client: Arc<dyn RemoteAuthority>,
        poller: PickupPoller,
        external_requester_field: Option<String>,
    ) -> Self {
        Self {
            client,
            poller,
            external_requester_field,
        }
    }

    /// Enrolls, renews or reissues. Every kind submits the request's CSR as
    /// a fresh enrollment; the prior request id is only logged.
    ///
    /// # Arguments
    /// * `request` - CSR, subject, SANs and product parameters to submit
    ///
    /// # Returns
    /// An `EnrollmentOutcome` that is issued when the certificate could be
    /// picked up, pending when it awaits approval or download, and failed
    /// otherwise. Validation problems and remote errors come back as a
    /// failed outcome carrying the message rather than as an error.
    pub async fn enroll(&self, request: &EnrollmentRequest) -> EnrollmentOutcome {
        info!("[enroll] begin {:?} enrollment for {}", request.kind, request.subject);
        match self.try_enroll(request).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                match &failure {
                    EnrollFailure::Validation(message) => error!("[enroll] {message}"),
                    EnrollFailure::Remote(err) if err.is_transport() => {
                        error!("[enroll] enrollment failed due to a HTTP error: {err}")
                    }
                    EnrollFailure::Remote(err) => {
                        error!("[enroll] enrollment failed due to an API error: {err}")
                    }
                }
                EnrollmentOutcome::failed(failure.message())
            }
        }
    }

    async fn try_enroll(
        &self,
        request: &EnrollmentRequest,
    ) -> Result<EnrollmentOutcome, EnrollFailure> {
        let subject = parse_subject_dn(&request.subject);
        let organization = parameter(request, PARAM_ORGANIZATION)
            .or(subject.organization.clone())
            .ok_or_else(|| invalid("The request is missing a O= value"))?;

        let custom_fields = self.client.list_custom_fields().await?;
        let resolved = self
            .resolve(request, subject, organization, &custom_fields)
            .await?;
        let context = &resolved.context;

        let san_list = compose_san_list(
            &context.sans,
            context.multi_domain,
            context.common_name.as_deref(),
        );
        let profile = self.resolve_profile(&request.product.product_id).await?;
        let term = profile.terms.first().copied().ok_or_else(|| {
            invalid(format!(
                "SSL Profile {} does not define any certificate terms",
                profile.id
            ))
        })?;
        trace!("[enroll] found {} profile for enroll request", profile.name);

        if let Some(prior) = request.prior_request_id.as_deref() {
            debug!("[enroll] {:?} replaces prior request {prior}", request.kind);
        }
        let submission = EnrollRequest {
            org_id: resolved.org_id,
            csr: request.csr.clone(),
            subj_alt_names: non_empty(san_list),
            cert_type: profile.id,
            number_servers: 1,
            server_type: -1,
            term,
            comments: request
                .product
                .parameters
                .get(PARAM_REQUESTER)
                .map(|requester| format!("CERTIFICATE_REQUESTOR: {requester}")),
            custom_fields: (!context.custom_fields.is_empty())
                .then(|| context.custom_fields.clone()),
            external_requester: context.external_requester.clone(),
        };
        debug!("[enroll] submit {:?} request", request.kind);
        let ssl_id = self.client.enroll(&submission).await?.ssl_id;

        let certificate = self.client.get_certificate(ssl_id).await?;
        debug!(
            "[enroll] enrolled for certificate {} (ID: {}) | status: {}; attempting pickup",
            certificate.common_name, certificate.id, certificate.status
        );
        Ok(self.poller.pickup_enrolled(&certificate).await)
    }

    /// Builds the enrollment context and resolves the submitting
    /// organization or department id.
    async fn resolve(
        &self,
        request: &EnrollmentRequest,
        subject: SubjectParts,
        organization: String,
        custom_fields: &[CustomField],
    ) -> Result<Resolved, EnrollFailure> {
        let parameters = &request.product.parameters;
        let department = parameter(request, PARAM_DEPARTMENT);
        let multi_domain = match parameter(request, PARAM_MULTI_DOMAIN) {
            None => false,
            Some(raw) => raw.parse::<bool>().map_err(|_| {
                invalid(format!("{PARAM_MULTI_DOMAIN} must be true or false, got {raw}"))
            })?,
        };

        debug!("[enroll] check for mandatory custom fields");
        for field in custom_fields.iter().filter(|field| field.mandatory) {
            if !parameters.contains_key(&field.name) {
                return Err(invalid(format!(
                    "Template {} or Enrollment Fields do not contain a mandatory custom field value for {}",
                    request.product.product_id, field.name
                )));
            }
        }
        let custom_field_values = custom_fields
            .iter()
            .filter_map(|field| {
                parameters.get(&field.name).map(|value| CustomFieldValue {
                    name: field.name.clone(),
                    value: value.clone(),
                })
            })
            .collect();

        let external_requester = self
            .external_requester_field
            .as_deref()
            .and_then(|field| parameter(request, field));

        let mut context = EnrollmentContext {
            subject: request.subject.clone(),
            common_name: subject.common_name,
            organization,
            organizational_unit: subject.organizational_unit,
            department,
            sans: request.sans.clone(),
            multi_domain,
            custom_fields: custom_field_values,
            external_requester,
        };
        let org_id = self.resolve_org_id(&mut context).await?;
        Ok(Resolved { context, org_id })
    }

    async fn resolve_org_id(&self, context: &mut EnrollmentContext) -> Result<i64, EnrollFailure> {
        debug!("[enroll] search for organization by name {}", context.organization);
        let organizations = self.client.list_organizations().await?;
        let org = organizations
            .into_iter()
            .find(|org| org.name.eq_ignore_ascii_case(&context.organization))
            .ok_or_else(|| {
                invalid(format!(
                    "Unable to find Organization by Name {}",
                    context.organization
                ))
            })?;
        context.organization = org.name.clone();

        let Some(department) = context.department.clone() else {
            let details = self.client.get_organization_details(org.id).await?;
            if details.cert_types.is_empty() {
                if context.organizational_unit.is_some() {
                    error!(
                        "[enroll] NOTE: the OU subject field is not used to select departments; set the {PARAM_DEPARTMENT} parameter instead"
                    );
                }
                return Err(invalid(format!(
                    "Organization {} does not contain a valid certificate type configuration, and no department was specified. Please verify account configuration.",
                    org.name
                )));
            }
            debug!("[enroll] organization {} is valid; using ID {}", org.name, org.id);
            return Ok(org.id);
        };

        if org.departments.is_empty() {
            return Err(invalid(format!(
                "Department {department} not found: no departments found in organization {}",
                org.name
            )));
        }
        let dep = org
            .departments
            .iter()
            .find(|dep| dep.name.eq_ignore_ascii_case(&department))
            .ok_or_else(|| {
                invalid(format!(
                    "{department} does not exist as a department of {}. Please verify configuration",
                    org.name
                ))
            })?;
        let details = self.client.get_organization_details(dep.id).await?;
        if details.cert_types.is_empty() {
            return Err(invalid(format!(
                "Department {department} does not contain a valid certificate type configuration. Please verify account configuration."
            )));
        }
        debug!("[enroll] department {} is valid; using ID {}", dep.name, dep.id);
        Ok(dep.id)
    }

    async fn resolve_profile(&self, product_id: &str) -> Result<Profile, EnrollFailure> {
        let id: i64 = product_id
            .trim()
            .parse()
            .map_err(|_| invalid(format!("Invalid SSL Profile ID {product_id}")))?;
        self.client
            .list_ssl_profiles(None)
            .await?
            .into_iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| invalid(format!("Unable to find SSL Profile with ID {id}")))
    }
}

fn parameter(request: &EnrollmentRequest, name: &str) -> Option<String> {
    request
        .product
        .parameters
        .get(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Department, Disposition, EnrollmentKind, IssuedCertificate, Organization, OrganizationDetails,
        ProductInfo,
    };
    use crate::enrollment::pickup::{PickupPolicy, REQUIRES_APPROVAL_MESSAGE};
    use crate::remote::InMemoryAuthority;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    fn authority() -> Arc<InMemoryAuthority> {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.add_organization(
            Organization {
                id: 1,
                name: "Example Corp".into(),
                departments: vec![
                    Department {
                        id: 11,
                        name: "Web".into(),
                    },
                    Department {
                        id: 12,
                        name: "Empty".into(),
                    },
                ],
            },
            OrganizationDetails {
                id: 1,
                name: "Example Corp".into(),
                cert_types: vec!["SSL".into()],
            },
        );
        authority.set_organization_details(OrganizationDetails {
            id: 11,
            name: "Web".into(),
            cert_types: vec!["SSL".into()],
        });
        authority.set_organization_details(OrganizationDetails {
            id: 12,
            name: "Empty".into(),
            cert_types: vec![],
        });
        authority.add_profile(Profile {
            id: 2846,
            name: "SSL SASP 1113276892".into(),
            description: None,
            terms: vec![365],
        });
        authority
    }

    fn enroller(authority: Arc<InMemoryAuthority>) -> Enroller {
        let poller = PickupPoller::new(
            authority.clone(),
            PickupPolicy {
                retries: 2,
                delay: Duration::from_secs(1),
                settle_delay: Duration::from_secs(5),
            },
        );
        Enroller::new(authority, poller, Some("Email".into()))
    }

    fn request(parameters: &[(&str, &str)]) -> EnrollmentRequest {
        let mut sans = BTreeMap::new();
        sans.insert("dns".to_string(), vec!["a.com".to_string(), "b.com".to_string()]);
        EnrollmentRequest {
            csr: "MIIBCSR".into(),
            subject: "CN=a.com,O=Example Corp".into(),
            sans,
            product: ProductInfo {
                product_id: "2846".into(),
                parameters: parameters
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
            },
            kind: EnrollmentKind::New,
            prior_request_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submits_enrollment_with_resolved_context() {
        let authority = authority();
        authority.add_custom_field(CustomField {
            id: Some(81),
            name: "testName".into(),
            mandatory: true,
        });
        let enroller = enroller(authority.clone());

        let outcome = enroller
            .enroll(&request(&[
                ("testName", "value-1"),
                ("Email", "owner@example.com"),
                (PARAM_REQUESTER, "DOMAIN\\alice"),
                (PARAM_MULTI_DOMAIN, "false"),
            ]))
            .await;

        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(outcome.message, REQUIRES_APPROVAL_MESSAGE);

        let journal = authority.journal();
        let submitted = &journal.enrollments[0];
        assert_eq!(submitted.org_id, 1);
        assert_eq!(submitted.cert_type, 2846);
        assert_eq!(submitted.term, 365);
        assert_eq!(submitted.number_servers, 1);
        assert_eq!(submitted.server_type, -1);
        assert_eq!(submitted.subj_alt_names.as_deref(), Some("b.com"));
        assert_eq!(
            submitted.comments.as_deref(),
            Some("CERTIFICATE_REQUESTOR: DOMAIN\\alice")
        );
        assert_eq!(
            submitted.external_requester.as_deref(),
            Some("owner@example.com")
        );
        assert_eq!(
            submitted.custom_fields,
            Some(vec![CustomFieldValue {
                name: "testName".into(),
                value: "value-1".into()
            }])
        );
        assert!(journal.pickups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_mandatory_custom_field_is_validation_failure() {
        let authority = authority();
        authority.add_custom_field(CustomField {
            id: Some(81),
            name: "testName".into(),
            mandatory: true,
        });
        let outcome = enroller(authority.clone()).enroll(&request(&[])).await;

        assert_eq!(outcome.disposition, Disposition::Failed);
        assert_eq!(outcome.disposition.code(), 30);
        assert!(outcome.message.contains("mandatory custom field value for testName"));
        assert!(authority.journal().enrollments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_organization_is_validation_failure() {
        let outcome = enroller(authority())
            .enroll(&request(&[(PARAM_ORGANIZATION, "Nobody Inc")]))
            .await;
        assert_eq!(outcome.message, "Unable to find Organization by Name Nobody Inc");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_organization_is_validation_failure() {
        let mut req = request(&[]);
        req.subject = "CN=a.com".into();
        let outcome = enroller(authority()).enroll(&req).await;
        assert_eq!(outcome.disposition, Disposition::Failed);
        assert!(outcome.message.contains("O="));
    }

    #[tokio::test(start_paused = true)]
    async fn department_lookup_is_case_insensitive_and_uses_department_id() {
        let authority = authority();
        let outcome = enroller(authority.clone())
            .enroll(&request(&[
                (PARAM_DEPARTMENT, "web"),
                (PARAM_ORGANIZATION, "example corp"),
            ]))
            .await;
        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(authority.journal().enrollments[0].org_id, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn department_failures_name_the_problem() {
        let outcome = enroller(authority())
            .enroll(&request(&[(PARAM_DEPARTMENT, "Finance")]))
            .await;
        assert_eq!(
            outcome.message,
            "Finance does not exist as a department of Example Corp. Please verify configuration"
        );

        let outcome = enroller(authority())
            .enroll(&request(&[(PARAM_DEPARTMENT, "Empty")]))
            .await;
        assert!(outcome.message.starts_with("Department Empty does not contain a valid certificate type"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_multi_domain_flag_is_validation_failure() {
        let outcome = enroller(authority())
            .enroll(&request(&[(PARAM_MULTI_DOMAIN, "sometimes")]))
            .await;
        assert_eq!(outcome.disposition, Disposition::Failed);
        assert!(outcome.message.contains(PARAM_MULTI_DOMAIN));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_api_error_message_is_passed_through() {
        let authority = authority();
        authority.fail_enrollment(RemoteError::Api {
            code: -7,
            description: "CSR is invalid".into(),
        });
        let outcome = enroller(authority).enroll(&request(&[])).await;
        assert_eq!(outcome.disposition, Disposition::Failed);
        assert_eq!(outcome.message, "CSR is invalid");
        assert!(outcome.ca_request_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn issued_enrollment_returns_bytes() {
        let authority = authority();
        authority.set_enrolled_status("Issued");
        authority.set_issued(
            10_000,
            IssuedCertificate {
                der: vec![0x30, 0x01],
                subject: "CN=a.com".into(),
                serial_hex: "01".into(),
            },
        );
        let outcome = enroller(authority).enroll(&request(&[])).await;
        assert_eq!(outcome.disposition, Disposition::Issued);
        assert_eq!(outcome.ca_request_id.as_deref(), Some("10000"));
        assert_eq!(outcome.certificate, Some(vec![0x30, 0x01]));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_and_reissue_submit_the_new_csr() {
        let authority = authority();
        authority.add_certificate(crate::core::types::RemoteCertificate {
            id: 500,
            common_name: "a.com".into(),
            status: "Issued".into(),
            ..Default::default()
        });

        let mut renew = request(&[]);
        renew.kind = EnrollmentKind::Renew;
        renew.csr = "RENEWED-CSR".into();
        renew.prior_request_id = Some("500-1".into());
        let outcome = enroller(authority.clone()).enroll(&renew).await;
        assert_eq!(outcome.ca_request_id.as_deref(), Some("10000"));

        let mut reissue = request(&[]);
        reissue.kind = EnrollmentKind::Reissue;
        reissue.csr = "REISSUED-CSR".into();
        reissue.prior_request_id = Some("500".into());
        let outcome = enroller(authority.clone()).enroll(&reissue).await;
        assert_eq!(outcome.ca_request_id.as_deref(), Some("10001"));

        let journal = authority.journal();
        let csrs: Vec<&str> = journal.enrollments.iter().map(|e| e.csr.as_str()).collect();
        assert_eq!(csrs, vec!["RENEWED-CSR", "REISSUED-CSR"]);
        assert!(journal.enrollments.iter().all(|e| e.org_id == 1 && e.cert_type == 2846));
        assert!(journal.renewals.is_empty());
        assert!(journal.reissues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_organization_is_reported_before_any_remote_call() {
        let authority = authority();
        authority.fail_custom_fields(RemoteError::Transport("connection refused".into()));
        let mut no_org = request(&[]);
        no_org.subject = "CN=a.com".into();

        let outcome = enroller(authority.clone()).enroll(&no_org).await;

        assert_eq!(outcome.disposition, Disposition::Failed);
        assert_eq!(outcome.message, "The request is missing a O= value");

        // with an organization present the listing failure surfaces
        let outcome = enroller(authority.clone()).enroll(&request(&[])).await;
        assert_eq!(outcome.disposition, Disposition::Failed);
        assert!(outcome.message.contains("connection refused"));
        assert!(authority.journal().enrollments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_without_prior_id_enrolls_fresh() {
        let authority = authority();
        let mut renew = request(&[]);
        renew.kind = EnrollmentKind::Renew;
        enroller(authority.clone()).enroll(&renew).await;
        assert_eq!(authority.journal().enrollments.len(), 1);
    }
}

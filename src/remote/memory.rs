use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::Deserialize;

use crate::core::certificate::parse_pem_chain;
use crate::core::error::RemoteError;
use crate::core::types::{
    CustomField, EnrollRequest, EnrollResponse, FilterClause, IssuedCertificate, Organization,
    OrganizationDetails, Person, Profile, RemoteCertificate, ReissueRequest, RevocationReason,
};

use super::RemoteAuthority;

const NOT_FOUND_CODE: i64 = -1;
const FIRST_ENROLLED_ID: i64 = 10_000;

/// One recorded listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCall {
    pub position: u32,
    pub size: u32,
    pub filter: Option<String>,
}

/// Requests observed by an [`InMemoryAuthority`], in arrival order.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    pub list_requests: Vec<ListCall>,
    pub detail_requests: Vec<i64>,
    pub pickups: Vec<i64>,
    pub enrollments: Vec<EnrollRequest>,
    pub renewals: Vec<i64>,
    pub reissues: Vec<(i64, ReissueRequest)>,
    pub revocations: Vec<(i64, RevocationReason)>,
}

#[derive(Default)]
struct State {
    certificates: Vec<RemoteCertificate>,
    issued: HashMap<i64, IssuedCertificate>,
    pickup_misses: HashMap<i64, usize>,
    detail_failures: HashSet<i64>,
    list_failure: Option<(u32, RemoteError)>,
    enroll_failure: Option<RemoteError>,
    custom_fields_failure: Option<RemoteError>,
    enrolled_status: Option<String>,
    organizations: Vec<Organization>,
    details: HashMap<i64, OrganizationDetails>,
    profiles: Vec<Profile>,
    custom_fields: Vec<CustomField>,
    persons: Vec<Person>,
    next_id: i64,
    journal: CallJournal,
}

/// Self-contained remote authority backed by in-process data.
///
/// Serves the sandbox mode of the binary and the test suites; every request
/// is recorded in a [`CallJournal`].
pub struct InMemoryAuthority {
    state: Mutex<State>,
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Fixture {
    certificates: Vec<RemoteCertificate>,
    organizations: Vec<Organization>,
    organization_details: Vec<OrganizationDetails>,
    profiles: Vec<Profile>,
    custom_fields: Vec<CustomField>,
    persons: Vec<Person>,
    /// PEM chains keyed by remote id.
    issued_pem: HashMap<String, String>,
    enrolled_status: Option<String>,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: FIRST_ENROLLED_ID,
                ..State::default()
            }),
        }
    }

    /// Loads a JSON fixture describing the remote account.
    pub fn from_fixture(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read sandbox fixture {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&raw)
            .with_context(|| format!("invalid sandbox fixture {}", path.display()))?;

        let authority = Self::new();
        {
            let mut state = authority.lock();
            state.certificates = fixture.certificates;
            state.organizations = fixture.organizations;
            state.details = fixture
                .organization_details
                .into_iter()
                .map(|details| (details.id, details))
                .collect();
            state.profiles = fixture.profiles;
            state.custom_fields = fixture.custom_fields;
            state.persons = fixture.persons;
            state.enrolled_status = fixture.enrolled_status;
            for (id, chain) in fixture.issued_pem {
                let id: i64 = id
                    .parse()
                    .with_context(|| format!("invalid certificate id in issuedPem: {id}"))?;
                let issued = parse_pem_chain(&chain)
                    .with_context(|| format!("invalid PEM chain for certificate {id}"))?;
                state.issued.insert(id, issued);
            }
        }
        Ok(authority)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a certificate, replacing any existing one with the same id.
    pub fn add_certificate(&self, certificate: RemoteCertificate) {
        let mut state = self.lock();
        match state
            .certificates
            .iter_mut()
            .find(|existing| existing.id == certificate.id)
        {
            Some(existing) => *existing = certificate,
            None => state.certificates.push(certificate),
        }
    }

    pub fn set_issued(&self, id: i64, certificate: IssuedCertificate) {
        self.lock().issued.insert(id, certificate);
    }

    /// Makes the next `misses` pickups of `id` come back empty.
    pub fn delay_pickup(&self, id: i64, misses: usize) {
        self.lock().pickup_misses.insert(id, misses);
    }

    pub fn fail_detail(&self, id: i64) {
        self.lock().detail_failures.insert(id);
    }

    /// Listing requests at or past `position` fail with `error`.
    pub fn fail_listing_at(&self, position: u32, error: RemoteError) {
        self.lock().list_failure = Some((position, error));
    }

    pub fn fail_enrollment(&self, error: RemoteError) {
        self.lock().enroll_failure = Some(error);
    }

    pub fn fail_custom_fields(&self, error: RemoteError) {
        self.lock().custom_fields_failure = Some(error);
    }

    /// Status newly enrolled certificates report on their first detail read.
    pub fn set_enrolled_status(&self, status: &str) {
        self.lock().enrolled_status = Some(status.to_string());
    }

    pub fn add_organization(&self, organization: Organization, details: OrganizationDetails) {
        let mut state = self.lock();
        state.details.insert(details.id, details);
        state.organizations.push(organization);
    }

    pub fn set_organization_details(&self, details: OrganizationDetails) {
        self.lock().details.insert(details.id, details);
    }

    pub fn add_profile(&self, profile: Profile) {
        self.lock().profiles.push(profile);
    }

    pub fn add_custom_field(&self, field: CustomField) {
        self.lock().custom_fields.push(field);
    }

    pub fn add_person(&self, person: Person) {
        self.lock().persons.push(person);
    }

    pub fn certificate(&self, id: i64) -> Option<RemoteCertificate> {
        self.lock().certificates.iter().find(|c| c.id == id).cloned()
    }

    pub fn journal(&self) -> CallJournal {
        self.lock().journal.clone()
    }

    fn not_found(what: &str, id: i64) -> RemoteError {
        RemoteError::Api {
            code: NOT_FOUND_CODE,
            description: format!("{what} {id} not found"),
        }
    }

    fn next_enrolled(state: &mut State, template: RemoteCertificate) -> i64 {
        let id = state.next_id;
        state.next_id += 1;
        let status = state
            .enrolled_status
            .clone()
            .unwrap_or_else(|| "Requested".to_string());
        state.certificates.push(RemoteCertificate {
            id,
            serial_number: String::new(),
            status,
            requested: Some(Utc::now()),
            approved: None,
            revoked: None,
            ..template
        });
        id
    }
}

fn matches_clause(certificate: &RemoteCertificate, clause: &FilterClause) -> bool {
    match clause.dimension.as_str() {
        "status" => certificate.status.eq_ignore_ascii_case(&clause.value),
        "sslTypeId" => certificate.product_id() == clause.value,
        "commonName" => certificate.common_name.eq_ignore_ascii_case(&clause.value),
        _ => true,
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryAuthority {
    async fn list_certificates(
        &self,
        position: u32,
        size: u32,
        filter: Option<&FilterClause>,
    ) -> Result<Vec<RemoteCertificate>, RemoteError> {
        let mut state = self.lock();
        state.journal.list_requests.push(ListCall {
            position,
            size,
            filter: filter.map(ToString::to_string),
        });
        if let Some((fail_at, error)) = &state.list_failure {
            if position >= *fail_at {
                return Err(error.clone());
            }
        }
        let page: Vec<RemoteCertificate> = state
            .certificates
            .iter()
            .filter(|certificate| filter.is_none_or(|clause| matches_clause(certificate, clause)))
            .skip(position as usize)
            .take(size as usize)
            .cloned()
            .collect();
        debug!(
            "[sandbox] listed {} certificates at position {position}",
            page.len()
        );
        Ok(page)
    }

    async fn get_certificate(&self, id: i64) -> Result<RemoteCertificate, RemoteError> {
        let mut state = self.lock();
        state.journal.detail_requests.push(id);
        if state.detail_failures.contains(&id) {
            return Err(Self::not_found("certificate", id));
        }
        state
            .certificates
            .iter()
            .find(|certificate| certificate.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found("certificate", id))
    }

    async fn pickup_certificate(&self, id: i64) -> Result<Option<IssuedCertificate>, RemoteError> {
        let mut state = self.lock();
        state.journal.pickups.push(id);
        if let Some(misses) = state.pickup_misses.get_mut(&id) {
            if *misses > 0 {
                *misses -= 1;
                return Ok(None);
            }
        }
        Ok(state.issued.get(&id).cloned())
    }

    async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, RemoteError> {
        let mut state = self.lock();
        state.journal.enrollments.push(request.clone());
        if let Some(error) = state.enroll_failure.clone() {
            return Err(error);
        }
        let cert_type = state
            .profiles
            .iter()
            .find(|profile| profile.id == request.cert_type)
            .cloned();
        let common_name = request
            .subj_alt_names
            .as_deref()
            .and_then(|sans| sans.split(',').next())
            .unwrap_or_default()
            .to_string();
        let ssl_id = Self::next_enrolled(
            &mut state,
            RemoteCertificate {
                common_name,
                cert_type,
                ..RemoteCertificate::default()
            },
        );
        Ok(EnrollResponse {
            ssl_id,
            renew_id: None,
        })
    }

    async fn renew(&self, id: i64) -> Result<EnrollResponse, RemoteError> {
        let mut state = self.lock();
        state.journal.renewals.push(id);
        let template = state
            .certificates
            .iter()
            .find(|certificate| certificate.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found("certificate", id))?;
        let ssl_id = Self::next_enrolled(&mut state, template);
        Ok(EnrollResponse {
            ssl_id,
            renew_id: Some(format!("renew-{id}")),
        })
    }

    async fn reissue(&self, id: i64, request: &ReissueRequest) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.journal.reissues.push((id, request.clone()));
        let status = state
            .enrolled_status
            .clone()
            .unwrap_or_else(|| "Requested".to_string());
        let certificate = state
            .certificates
            .iter_mut()
            .find(|certificate| certificate.id == id)
            .ok_or_else(|| Self::not_found("certificate", id))?;
        certificate.status = status;
        certificate.serial_number.clear();
        Ok(())
    }

    async fn revoke(&self, id: i64, reason: RevocationReason) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.journal.revocations.push((id, reason));
        let certificate = state
            .certificates
            .iter_mut()
            .find(|certificate| certificate.id == id)
            .ok_or_else(|| Self::not_found("certificate", id))?;
        certificate.status = "Revoked".to_string();
        certificate.revoked = Some(Utc::now());
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, RemoteError> {
        Ok(self.lock().organizations.clone())
    }

    async fn get_organization_details(&self, id: i64) -> Result<OrganizationDetails, RemoteError> {
        self.lock()
            .details
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found("organization", id))
    }

    async fn list_ssl_profiles(&self, _org_id: Option<i64>) -> Result<Vec<Profile>, RemoteError> {
        Ok(self.lock().profiles.clone())
    }

    async fn list_custom_fields(&self) -> Result<Vec<CustomField>, RemoteError> {
        let state = self.lock();
        match &state.custom_fields_failure {
            Some(error) => Err(error.clone()),
            None => Ok(state.custom_fields.clone()),
        }
    }

    async fn page_persons(
        &self,
        org_id: i64,
        position: u32,
        size: u32,
    ) -> Result<Vec<Person>, RemoteError> {
        Ok(self
            .lock()
            .persons
            .iter()
            .filter(|person| person.organization_id == org_id)
            .skip(position as usize)
            .take(size as usize)
            .cloned()
            .collect())
    }
}

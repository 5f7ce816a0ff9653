use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed lifecycle vocabulary used internally, decoupled from the remote
/// authority's free-text status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalStatus {
    Unknown,
    PendingApproval,
    Issued,
    Revoked,
}

impl CanonicalStatus {
    /// Request disposition code understood by the host.
    pub fn disposition_code(self) -> i32 {
        match self {
            CanonicalStatus::Unknown => 0,
            CanonicalStatus::PendingApproval => 13,
            CanonicalStatus::Issued => 20,
            CanonicalStatus::Revoked => 21,
        }
    }

    pub fn from_disposition_code(code: i32) -> Self {
        match code {
            13 => CanonicalStatus::PendingApproval,
            20 => CanonicalStatus::Issued,
            21 => CanonicalStatus::Revoked,
            _ => CanonicalStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Unknown => "unknown",
            CanonicalStatus::PendingApproval => "pending_approval",
            CanonicalStatus::Issued => "issued",
            CanonicalStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRL reason codes accepted by the remote revocation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
}

/// SSL profile (certificate type) as configured on the remote account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Allowed certificate terms in days; the first entry is used for enrollment.
    #[serde(default)]
    pub terms: Vec<i32>,
}

/// A certificate as reported by the remote authority.
///
/// The serial number is empty while the certificate is awaiting approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCertificate {
    #[serde(rename = "sslId")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string_or_null")]
    pub common_name: String,
    #[serde(default, deserialize_with = "lenient::vec_or_null")]
    pub subject_alternative_names: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_or_null")]
    pub serial_number: String,
    #[serde(default)]
    pub cert_type: Option<Profile>,
    #[serde(default, deserialize_with = "lenient::optional")]
    pub requested: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::optional")]
    pub approved: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::optional")]
    pub revoked: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::string_or_null")]
    pub status: String,
}

impl RemoteCertificate {
    pub fn product_id(&self) -> String {
        self.cert_type
            .as_ref()
            .map(|profile| profile.id.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for RemoteCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sslId:{} | commonName:{} | serialNumber:{}",
            self.id, self.common_name, self.serial_number
        )
    }
}

/// Leaf certificate extracted from a pickup response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub der: Vec<u8>,
    pub subject: String,
    /// Upper-case hex serial without separators.
    pub serial_hex: String,
}

/// Existing record in the host's system of record.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    /// Host request identifier; legacy reissued records use `<id>-<suffix>`.
    pub ca_request_id: String,
    pub serial_number: String,
    pub status: CanonicalStatus,
    pub certificate: Option<Vec<u8>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordInvariantError {
    #[error("issued record {0} has no certificate bytes")]
    IssuedWithoutCertificate(String),
    #[error("pending record {0} must not carry certificate bytes")]
    PendingWithCertificate(String),
}

/// Reconciled unit pushed downstream to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalSyncRecord {
    pub ca_request_id: String,
    pub product_id: String,
    pub certificate: Option<Vec<u8>>,
    pub status: CanonicalStatus,
    pub submission_date: Option<DateTime<Utc>>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub revocation_date: DateTime<Utc>,
}

impl LocalSyncRecord {
    /// Builds a record from a remote certificate, enforcing that issued
    /// records carry bytes and pending records do not.
    pub fn from_remote(
        ca_request_id: String,
        remote: &RemoteCertificate,
        status: CanonicalStatus,
        certificate: Option<Vec<u8>>,
    ) -> Result<Self, RecordInvariantError> {
        let certificate = certificate.filter(|bytes| !bytes.is_empty());
        match status {
            CanonicalStatus::Issued if certificate.is_none() => {
                return Err(RecordInvariantError::IssuedWithoutCertificate(ca_request_id));
            }
            CanonicalStatus::PendingApproval if certificate.is_some() => {
                return Err(RecordInvariantError::PendingWithCertificate(ca_request_id));
            }
            _ => {}
        }

        Ok(Self {
            ca_request_id,
            product_id: remote.product_id(),
            certificate,
            status,
            submission_date: remote.requested,
            resolution_date: remote.approved,
            revocation_reason: (status == CanonicalStatus::Revoked)
                .then_some(RevocationReason::Unspecified),
            revocation_date: remote.revoked.unwrap_or_else(Utc::now),
        })
    }

    /// Host encoding of the revocation reason: the CRL code when revoked,
    /// `0xffffff` otherwise.
    pub fn legacy_revocation_code(&self) -> u32 {
        match self.revocation_reason {
            Some(reason) => reason.code(),
            None => NOT_REVOKED_SENTINEL,
        }
    }
}

pub const NOT_REVOKED_SENTINEL: u32 = 0xff_ffff;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub departments: Vec<Department>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationDetails {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cert_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organization_id: i64,
    #[serde(default)]
    pub validation_type: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub secondary_emails: Vec<String>,
    #[serde(default)]
    pub common_name: Option<String>,
}

/// Enrollment submission body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub org_id: i64,
    pub csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subj_alt_names: Option<String>,
    pub cert_type: i64,
    pub number_servers: i32,
    pub server_type: i32,
    pub term: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<Vec<CustomFieldValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_requester: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub ssl_id: i64,
    #[serde(default)]
    pub renew_id: Option<String>,
}

/// Replacement (reissue in place) submission body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReissueRequest {
    pub csr: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_alternative_names: Option<String>,
}

/// One single-clause listing query, rendered as `dimension=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterClause {
    pub dimension: String,
    pub value: String,
}

impl fmt::Display for FilterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.dimension, self.value)
    }
}

/// Dimension → allowed values. Interpreted as a union of single-clause
/// queries, one per (dimension, value) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncFilter(pub BTreeMap<String, Vec<String>>);

impl SyncFilter {
    pub fn is_empty(&self) -> bool {
        self.clauses().is_empty()
    }

    pub fn insert(&mut self, dimension: impl Into<String>, values: Vec<String>) {
        self.0.insert(dimension.into(), values);
    }

    pub fn clauses(&self) -> Vec<FilterClause> {
        self.0
            .iter()
            .flat_map(|(dimension, values)| {
                values.iter().map(move |value| FilterClause {
                    dimension: dimension.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentKind {
    New,
    Renew,
    Reissue,
}

/// Template-level parameters the host attaches to an enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Remote SSL profile id, as the host stores it.
    pub product_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub csr: String,
    pub subject: String,
    /// SAN values grouped by category (dns, ip4, ip6, ...).
    #[serde(default)]
    pub sans: BTreeMap<String, Vec<String>>,
    pub product: ProductInfo,
    pub kind: EnrollmentKind,
    /// Request id of the certificate being renewed or reissued.
    #[serde(default)]
    pub prior_request_id: Option<String>,
}

/// Per-request aggregate resolved from the request descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentContext {
    pub subject: String,
    pub common_name: Option<String>,
    pub organization: String,
    pub organizational_unit: Option<String>,
    pub department: Option<String>,
    pub sans: BTreeMap<String, Vec<String>>,
    pub multi_domain: bool,
    pub custom_fields: Vec<CustomFieldValue>,
    pub external_requester: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Issued,
    /// Awaiting approval or not yet downloadable; synchronization picks it up later.
    Pending,
    Failed,
}

impl Disposition {
    pub fn code(self) -> i32 {
        match self {
            Disposition::Issued => 20,
            Disposition::Pending => 9,
            Disposition::Failed => 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentOutcome {
    pub ca_request_id: Option<String>,
    #[serde(skip_serializing)]
    pub certificate: Option<Vec<u8>>,
    pub disposition: Disposition,
    pub message: String,
}

impl EnrollmentOutcome {
    pub fn issued(ca_request_id: i64, certificate: IssuedCertificate) -> Self {
        Self {
            ca_request_id: Some(ca_request_id.to_string()),
            message: format!("Successfully enrolled for certificate {}", certificate.subject),
            certificate: Some(certificate.der),
            disposition: Disposition::Issued,
        }
    }

    pub fn pending(ca_request_id: i64, message: impl Into<String>) -> Self {
        Self {
            ca_request_id: Some(ca_request_id.to_string()),
            certificate: None,
            disposition: Disposition::Pending,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ca_request_id: None,
            certificate: None,
            disposition: Disposition::Failed,
            message: message.into(),
        }
    }

    pub fn status(&self) -> CanonicalStatus {
        match self.disposition {
            Disposition::Issued => CanonicalStatus::Issued,
            Disposition::Pending => CanonicalStatus::PendingApproval,
            Disposition::Failed => CanonicalStatus::Unknown,
        }
    }
}

/// Lenient readers for the remote API's timestamp and nullable string fields.
mod lenient {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw.map(|value| value.trim().to_string()) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        parse(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {raw}")))
    }

    pub fn vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let raw: Option<Vec<T>> = Option::deserialize(deserializer)?;
        Ok(raw.unwrap_or_default())
    }

    pub fn string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.unwrap_or_default())
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
            return Some(value.with_timezone(&Utc));
        }
        if let Ok(value) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(value.and_utc());
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|value| value.and_utc())
    }
}

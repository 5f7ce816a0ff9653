pub mod client;
pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::core::error::RemoteError;
use crate::core::types::{
    CustomField, EnrollRequest, EnrollResponse, FilterClause, IssuedCertificate, Organization,
    OrganizationDetails, Person, Profile, RemoteCertificate, ReissueRequest, RevocationReason,
};

pub use client::ScmApiClient;
pub use memory::InMemoryAuthority;

pub const PERSON_PAGE_SIZE: u32 = 25;

/// Single request/response operations against the remote Certificate
/// Manager. Implementations hold no per-call state.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn list_certificates(
        &self,
        position: u32,
        size: u32,
        filter: Option<&FilterClause>,
    ) -> Result<Vec<RemoteCertificate>, RemoteError>;

    async fn get_certificate(&self, id: i64) -> Result<RemoteCertificate, RemoteError>;

    /// Downloads the issued leaf. `Ok(None)` means it is not downloadable yet.
    async fn pickup_certificate(&self, id: i64) -> Result<Option<IssuedCertificate>, RemoteError>;

    async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, RemoteError>;

    async fn renew(&self, id: i64) -> Result<EnrollResponse, RemoteError>;

    /// Replaces the certificate in place; the remote id is unchanged.
    async fn reissue(&self, id: i64, request: &ReissueRequest) -> Result<(), RemoteError>;

    async fn revoke(&self, id: i64, reason: RevocationReason) -> Result<(), RemoteError>;

    async fn list_organizations(&self) -> Result<Vec<Organization>, RemoteError>;

    async fn get_organization_details(&self, id: i64) -> Result<OrganizationDetails, RemoteError>;

    async fn list_ssl_profiles(&self, org_id: Option<i64>) -> Result<Vec<Profile>, RemoteError>;

    async fn list_custom_fields(&self) -> Result<Vec<CustomField>, RemoteError>;

    async fn page_persons(
        &self,
        org_id: i64,
        position: u32,
        size: u32,
    ) -> Result<Vec<Person>, RemoteError>;

    /// Every person in an organization, paging until a short page.
    async fn list_persons(&self, org_id: i64) -> Result<Vec<Person>, RemoteError> {
        let mut persons = Vec::new();
        loop {
            let position = u32::try_from(persons.len()).unwrap_or(u32::MAX);
            let page = self.page_persons(org_id, position, PERSON_PAGE_SIZE).await?;
            let short = page.len() < PERSON_PAGE_SIZE as usize;
            persons.extend(page);
            if short {
                return Ok(persons);
            }
        }
    }
}

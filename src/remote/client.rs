use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Client, RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::core::certificate::parse_pem_chain;
use crate::core::config::GatewayConfig;
use crate::core::error::RemoteError;
use crate::core::types::{
    CustomField, EnrollRequest, EnrollResponse, FilterClause, IssuedCertificate, Organization,
    OrganizationDetails, Person, Profile, RemoteCertificate, ReissueRequest, RevocationReason,
};

use super::RemoteAuthority;
use super::http::{build_client, status_error};

/// REST client for the Certificate Manager SSL API.
///
/// Stateless apart from the pooled connection; share it through an `Arc`.
#[derive(Clone)]
pub struct ScmApiClient {
    http: Client,
    base: Url,
}

impl ScmApiClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base = Url::parse(&config.api_endpoint)
            .with_context(|| format!("invalid ApiEndpoint {}", config.api_endpoint))?;
        let http = build_client(config)?;
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|err| RemoteError::Transport(format!("invalid request path {path}: {err}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let request = self.http.get(self.url(path)?);
        Self::process(request).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let request = self.http.post(self.url(path)?).json(body);
        Self::process(request).await
    }

    /// Posts and only checks for success; the response body is ignored.
    async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), RemoteError> {
        let response = self.http.post(self.url(path)?).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn process<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        trace!("[scm-http] {status} response: {body}");
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteAuthority for ScmApiClient {
    async fn list_certificates(
        &self,
        position: u32,
        size: u32,
        filter: Option<&FilterClause>,
    ) -> Result<Vec<RemoteCertificate>, RemoteError> {
        let mut request = self
            .http
            .get(self.url("api/ssl/v1")?)
            .query(&[("position", position), ("size", size)]);
        if let Some(clause) = filter {
            request = request.query(&[(clause.dimension.as_str(), clause.value.as_str())]);
        }
        debug!(
            "[scm-http] list certificates position={position} size={size} filter={}",
            filter.map(ToString::to_string).unwrap_or_default()
        );
        Self::process(request).await
    }

    async fn get_certificate(&self, id: i64) -> Result<RemoteCertificate, RemoteError> {
        self.get(&format!("api/ssl/v1/{id}")).await
    }

    async fn pickup_certificate(&self, id: i64) -> Result<Option<IssuedCertificate>, RemoteError> {
        let response = self
            .http
            .get(self.url(&format!("api/ssl/v1/collect/{id}/x509CO"))?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            debug!("[scm-http] pickup of {id} not ready: {status}");
            return Ok(None);
        }
        let chain = response.text().await?;
        if chain.trim().is_empty() {
            return Ok(None);
        }
        parse_pem_chain(&chain)
            .map(Some)
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, RemoteError> {
        self.post("api/ssl/v1/enroll", request).await
    }

    async fn renew(&self, id: i64) -> Result<EnrollResponse, RemoteError> {
        self.post(&format!("api/ssl/v1/renewById/{id}"), "").await
    }

    async fn reissue(&self, id: i64, request: &ReissueRequest) -> Result<(), RemoteError> {
        self.post_unit(&format!("api/ssl/v1/replace/{id}"), request)
            .await
    }

    async fn revoke(&self, id: i64, reason: RevocationReason) -> Result<(), RemoteError> {
        let body = json!({ "reason": reason.remote_phrase() });
        self.post_unit(&format!("api/ssl/v1/revoke/{id}"), &body)
            .await
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, RemoteError> {
        self.get("api/organization/v1").await
    }

    async fn get_organization_details(&self, id: i64) -> Result<OrganizationDetails, RemoteError> {
        self.get(&format!("api/organization/v1/{id}")).await
    }

    async fn list_ssl_profiles(&self, org_id: Option<i64>) -> Result<Vec<Profile>, RemoteError> {
        let mut request = self.http.get(self.url("api/ssl/v1/types")?);
        if let Some(org_id) = org_id {
            request = request.query(&[("organizationId", org_id)]);
        }
        Self::process(request).await
    }

    async fn list_custom_fields(&self) -> Result<Vec<CustomField>, RemoteError> {
        self.get("api/ssl/v1/customFields").await
    }

    async fn page_persons(
        &self,
        org_id: i64,
        position: u32,
        size: u32,
    ) -> Result<Vec<Person>, RemoteError> {
        let request = self.http.get(self.url("api/person/v1")?).query(&[
            ("position", i64::from(position)),
            ("size", i64::from(size)),
            ("organizationId", org_id),
        ]);
        Self::process(request).await
    }
}

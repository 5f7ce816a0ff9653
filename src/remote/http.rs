use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Identity, StatusCode};
use serde::Deserialize;

use crate::core::config::{AuthType, GatewayConfig};
use crate::core::error::RemoteError;

pub const TIMEOUT_ENV: &str = "CM_GATEWAY_HTTP_TIMEOUT_SECS";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const CUSTOMER_URI_HEADER: &str = "customeruri";
const LOGIN_HEADER: &str = "login";
const PASSWORD_HEADER: &str = "password";

/// Builds the authenticated HTTP client for one connection section.
///
/// Password auth sends the credential as a header on every request;
/// certificate auth presents the configured PKCS#12 bundle instead.
pub fn build_client(config: &GatewayConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CUSTOMER_URI_HEADER, header_value(&config.customer_uri)?);
    headers.insert(LOGIN_HEADER, header_value(&config.username)?);

    let mut builder = Client::builder().timeout(resolve_timeout());
    match config.auth() {
        AuthType::Password => {
            let mut password = header_value(config.password.expose())?;
            password.set_sensitive(true);
            headers.insert(PASSWORD_HEADER, password);
        }
        AuthType::Certificate => {
            let bundle = config
                .client_certificate
                .as_ref()
                .ok_or_else(|| anyhow!("AuthType set to Certificate, but no certificate found"))?;
            let der = fs::read(&bundle.path).with_context(|| {
                format!("failed to read client certificate {}", bundle.path.display())
            })?;
            let identity = Identity::from_pkcs12_der(&der, bundle.password.expose())
                .context("failed to load client certificate bundle")?;
            debug!("[scm-http] using client certificate {}", bundle.path.display());
            builder = builder.identity(identity);
        }
    }

    builder
        .default_headers(headers)
        .build()
        .context("failed to build HTTP client")
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw.trim()).map_err(|err| anyhow!("invalid header value: {err}"))
}

fn resolve_timeout() -> Duration {
    parse_timeout(std::env::var(TIMEOUT_ENV).ok().as_deref())
}

pub(crate) fn parse_timeout(raw: Option<&str>) -> Duration {
    let timeout = raw
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[scm-http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i64,
    #[serde(default)]
    description: String,
}

/// Converts a non-success response into a [`RemoteError`], preferring the
/// API's structured `{code, description}` body when present.
pub fn status_error(status: StatusCode, body: &str) -> RemoteError {
    if let Ok(error) = serde_json::from_str::<ApiErrorBody>(body) {
        return RemoteError::Api {
            code: error.code,
            description: error.description,
        };
    }
    let body = body.trim();
    let body = if !body.is_empty() {
        body.to_string()
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        "authentication failed".to_string()
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        "rate limit exceeded".to_string()
    } else {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    };
    RemoteError::Status {
        status: status.as_u16(),
        body,
    }
}

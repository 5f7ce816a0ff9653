use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::error::ConfigError;
use super::types::SyncFilter;

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Credential string that is wiped from memory on drop and never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    Password,
    Certificate,
}

impl AuthType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "password" => Some(AuthType::Password),
            "certificate" => Some(AuthType::Certificate),
            _ => None,
        }
    }
}

/// PKCS#12 bundle used for mutual-TLS authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientCertificate {
    pub path: PathBuf,
    #[serde(default)]
    pub password: Secret,
}

/// Connection section written by the host, plus the pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub customer_uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Secret,
    #[serde(default)]
    pub client_certificate: Option<ClientCertificate>,
    #[serde(default = "default_pickup_retries")]
    pub pickup_retries: u32,
    /// Seconds between pickup attempts.
    #[serde(default = "default_pickup_delay")]
    pub pickup_delay: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub external_requestor_field_name: Option<String>,
    #[serde(default)]
    pub sync_filter: SyncFilter,
    #[serde(default)]
    pub force_complete_sync: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
    #[serde(default = "default_settle_delay")]
    pub pickup_settle_delay_secs: u64,
}

fn default_pickup_retries() -> u32 {
    5
}

fn default_pickup_delay() -> u64 {
    10
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_queue_capacity() -> usize {
    100
}

fn default_put_timeout_ms() -> u64 {
    50
}

fn default_settle_delay() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            auth_type: String::new(),
            customer_uri: String::new(),
            username: String::new(),
            password: Secret::default(),
            client_certificate: None,
            pickup_retries: default_pickup_retries(),
            pickup_delay: default_pickup_delay(),
            page_size: default_page_size(),
            external_requestor_field_name: None,
            sync_filter: SyncFilter::default(),
            force_complete_sync: false,
            queue_capacity: default_queue_capacity(),
            put_timeout_ms: default_put_timeout_ms(),
            pickup_settle_delay_secs: default_settle_delay(),
        }
    }
}

impl GatewayConfig {
    /// Reads a JSON connection section from disk, normalized and validated.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            serde_json::from_str(raw).context("failed to parse connection JSON")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamps the page size and makes the endpoint usable as a base URL.
    pub fn normalize(&mut self) {
        self.page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        };
        let trimmed = self.api_endpoint.trim();
        self.api_endpoint = if trimmed.is_empty() || trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        if self.queue_capacity == 0 {
            self.queue_capacity = 1;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.api_endpoint.trim().is_empty() {
            problems.push("ApiEndpoint is required".to_string());
        }
        if self.customer_uri.trim().is_empty() {
            problems.push("CustomerUri is required".to_string());
        }
        if self.username.trim().is_empty() {
            problems.push("Username is required".to_string());
        }
        match AuthType::parse(&self.auth_type) {
            None if self.auth_type.trim().is_empty() => {
                problems.push("AuthType is required".to_string());
            }
            None => problems.push(format!(
                "AuthType must be Password or Certificate, got {}",
                self.auth_type
            )),
            Some(AuthType::Password) if self.password.is_empty() => {
                problems.push("Password is required for password authentication".to_string());
            }
            Some(AuthType::Certificate) if self.client_certificate.is_none() => {
                problems.push(
                    "ClientCertificate is required for certificate authentication".to_string(),
                );
            }
            Some(_) => {}
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn auth(&self) -> AuthType {
        AuthType::parse(&self.auth_type).unwrap_or_default()
    }

    pub fn pickup_delay(&self) -> Duration {
        Duration::from_secs(self.pickup_delay)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.pickup_settle_delay_secs)
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms.max(1))
    }

    pub fn external_requester_field(&self) -> Option<&str> {
        self.external_requestor_field_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

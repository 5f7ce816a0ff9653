use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::status::is_collectable;
use crate::core::types::{EnrollmentOutcome, IssuedCertificate, RemoteCertificate};
use crate::remote::RemoteAuthority;

pub const REQUIRES_APPROVAL_MESSAGE: &str =
    "Certificate requires approval. Certificate will be picked up during synchronization after approval.";
pub const PICKUP_FAILED_MESSAGE: &str =
    "Failed to pickup certificate. Check the Certificate Manager portal to determine if additional approval is required";

/// Retry budget for collecting freshly issued certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickupPolicy {
    pub retries: u32,
    pub delay: Duration,
    /// One-off wait before the first attempt.
    pub settle_delay: Duration,
}

impl PickupPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            retries: config.pickup_retries,
            delay: config.pickup_delay(),
            settle_delay: config.settle_delay(),
        }
    }
}

pub struct PickupPoller {
    client: Arc<dyn RemoteAuthority>,
    policy: PickupPolicy,
}

impl PickupPoller {
    pub fn new(client: Arc<dyn RemoteAuthority>, policy: PickupPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> PickupPolicy {
        self.policy
    }

    /// Collects a just-submitted certificate, or reports it as pending.
    ///
    /// Certificates that are not yet issued are left for synchronization to
    /// pick up after approval; no polling happens for them.
    pub async fn pickup_enrolled(&self, certificate: &RemoteCertificate) -> EnrollmentOutcome {
        if !is_collectable(&certificate.status) {
            info!(
                "[pickup] certificate {} (ID: {}) has not been issued; it will be picked up during synchronization after approval",
                certificate.common_name, certificate.id
            );
            return EnrollmentOutcome::pending(certificate.id, REQUIRES_APPROVAL_MESSAGE);
        }

        match self.poll(certificate.id).await {
            Some(issued) => {
                info!("[pickup] successfully enrolled for certificate {}", issued.subject);
                EnrollmentOutcome::issued(certificate.id, issued)
            }
            None => EnrollmentOutcome::pending(certificate.id, PICKUP_FAILED_MESSAGE),
        }
    }

    /// Waits the settle delay, then makes up to `retries` pickup attempts
    /// spaced by `delay`. No delay follows the final attempt.
    ///
    /// # Arguments
    /// * `id` - Remote SSL id of the enrolled certificate
    ///
    /// # Returns
    /// The issued leaf, or `None` when every attempt came back empty or
    /// failed. Pickup errors are logged and retried, never returned.
    pub async fn poll(&self, id: i64) -> Option<IssuedCertificate> {
        tokio::time::sleep(self.policy.settle_delay).await;

        for attempt in 1..=self.policy.retries {
            debug!("[pickup] try number {attempt} to pickup certificate {id}");
            match self.client.pickup_certificate(id).await {
                Ok(Some(issued)) if !issued.subject.trim().is_empty() => return Some(issued),
                Ok(_) => debug!("[pickup] certificate {id} not downloadable yet"),
                Err(err) => warn!("[pickup] pickup attempt {attempt} for {id} failed: {err}"),
            }
            if attempt < self.policy.retries {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        warn!(
            "[pickup] giving up on certificate {id} after {} attempts",
            self.policy.retries
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Disposition;
    use crate::remote::InMemoryAuthority;
    use tokio::time::Instant;

    fn policy(retries: u32) -> PickupPolicy {
        PickupPolicy {
            retries,
            delay: Duration::from_secs(10),
            settle_delay: Duration::from_secs(5),
        }
    }

    fn cert(id: i64, status: &str) -> RemoteCertificate {
        RemoteCertificate {
            id,
            common_name: "ccmqa.com".into(),
            status: status.into(),
            ..RemoteCertificate::default()
        }
    }

    fn leaf() -> IssuedCertificate {
        IssuedCertificate {
            der: vec![0x30, 0x03],
            subject: "CN=ccmqa.com".into(),
            serial_hex: "0A".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_makes_exactly_retries_attempts() {
        let authority = Arc::new(InMemoryAuthority::new());
        let poller = PickupPoller::new(authority.clone(), policy(3));

        let started = Instant::now();
        let outcome = poller.pickup_enrolled(&cert(77, "Issued")).await;

        assert_eq!(authority.journal().pickups.len(), 3);
        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(outcome.message, PICKUP_FAILED_MESSAGE);
        assert_eq!(outcome.ca_request_id.as_deref(), Some("77"));
        // settle + two gaps between three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn unissued_status_returns_pending_without_polling() {
        let authority = Arc::new(InMemoryAuthority::new());
        let poller = PickupPoller::new(authority.clone(), policy(3));

        let outcome = poller.pickup_enrolled(&cert(5, "Requested")).await;

        assert!(authority.journal().pickups.is_empty());
        assert_eq!(outcome.disposition, Disposition::Pending);
        assert_eq!(outcome.message, REQUIRES_APPROVAL_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn applied_certificate_is_collected_after_misses() {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.set_issued(9, leaf());
        authority.delay_pickup(9, 2);
        let poller = PickupPoller::new(authority.clone(), policy(5));

        let outcome = poller.pickup_enrolled(&cert(9, "applied")).await;

        assert_eq!(outcome.disposition, Disposition::Issued);
        assert_eq!(outcome.certificate, Some(vec![0x30, 0x03]));
        assert!(outcome.message.contains("CN=ccmqa.com"));
        assert_eq!(authority.journal().pickups.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_subject_counts_as_miss() {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.set_issued(
            4,
            IssuedCertificate {
                subject: String::new(),
                ..leaf()
            },
        );
        let poller = PickupPoller::new(authority.clone(), policy(2));

        assert!(poller.poll(4).await.is_none());
        assert_eq!(authority.journal().pickups.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_never_calls_pickup() {
        let authority = Arc::new(InMemoryAuthority::new());
        let poller = PickupPoller::new(authority.clone(), policy(0));
        assert!(poller.poll(1).await.is_none());
        assert!(authority.journal().pickups.is_empty());
    }
}

pub mod orchestrator;
pub mod pickup;

use log::info;

use crate::core::error::RequestError;
use crate::core::types::{CanonicalStatus, RevocationReason};
use crate::domain::numeric_request_id;
use crate::remote::RemoteAuthority;

pub use orchestrator::Enroller;
pub use pickup::{PickupPoller, PickupPolicy};

/// Revokes the certificate behind a host request id using a CRL reason
/// code. Codes outside 1..=6 are sent as unspecified.
pub async fn revoke(
    client: &dyn RemoteAuthority,
    ca_request_id: &str,
    reason_code: u32,
) -> Result<CanonicalStatus, RequestError> {
    let id = numeric_request_id(ca_request_id)
        .ok_or_else(|| RequestError::InvalidRequestId(ca_request_id.to_string()))?;
    let reason = RevocationReason::from_code(reason_code);
    info!(
        "[enroll] revoking certificate {id} with reason {}",
        reason.remote_phrase()
    );
    client.revoke(id, reason).await?;
    Ok(CanonicalStatus::Revoked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::RemoteError;
    use crate::core::types::RemoteCertificate;
    use crate::remote::InMemoryAuthority;

    #[tokio::test]
    async fn revokes_with_mapped_reason() {
        let authority = InMemoryAuthority::new();
        authority.add_certificate(RemoteCertificate {
            id: 139,
            status: "Issued".into(),
            ..RemoteCertificate::default()
        });

        let status = revoke(&authority, "139-2", 4).await.expect("revoke");

        assert_eq!(status, CanonicalStatus::Revoked);
        assert_eq!(
            authority.journal().revocations,
            vec![(139, RevocationReason::Superseded)]
        );
        let revoked = authority.certificate(139).expect("certificate");
        assert_eq!(revoked.status, "Revoked");
        assert!(revoked.revoked.is_some());
    }

    #[tokio::test]
    async fn rejects_non_numeric_request_id() {
        let authority = InMemoryAuthority::new();
        let err = revoke(&authority, "abc", 1).await.expect_err("invalid id");
        assert!(matches!(err, RequestError::InvalidRequestId(_)));
        assert!(authority.journal().revocations.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_is_returned() {
        let authority = InMemoryAuthority::new();
        let err = revoke(&authority, "404", 0).await.expect_err("unknown id");
        assert!(matches!(err, RequestError::Remote(RemoteError::Api { .. })));
    }
}

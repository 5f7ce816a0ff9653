use super::types::{CanonicalStatus, RevocationReason};

/// Maps a remote status string onto the canonical vocabulary.
///
/// Matching is case-insensitive and ignores surrounding whitespace. Statuses
/// the gateway does not recognize map to [`CanonicalStatus::Unknown`].
pub fn map_remote_status(remote: &str) -> CanonicalStatus {
    match remote.trim().to_ascii_uppercase().as_str() {
        "ISSUED" | "ENROLLED - PENDING DOWNLOAD" | "APPROVED" | "APPLIED" | "DOWNLOADED" => {
            CanonicalStatus::Issued
        }
        "REQUESTED" | "AWAITING APPROVAL" | "NOT ENROLLED" => CanonicalStatus::PendingApproval,
        "REVOKED" => CanonicalStatus::Revoked,
        _ => CanonicalStatus::Unknown,
    }
}

/// Whether a freshly enrolled certificate is ready to be collected.
pub fn is_collectable(remote: &str) -> bool {
    matches!(
        remote.trim().to_ascii_uppercase().as_str(),
        "ISSUED" | "APPLIED"
    )
}

impl RevocationReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => RevocationReason::KeyCompromise,
            2 => RevocationReason::CaCompromise,
            3 => RevocationReason::AffiliationChanged,
            4 => RevocationReason::Superseded,
            5 => RevocationReason::CessationOfOperation,
            6 => RevocationReason::CertificateHold,
            _ => RevocationReason::Unspecified,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
        }
    }

    /// Phrase the remote revocation endpoint expects.
    pub fn remote_phrase(self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "Unspecified",
            RevocationReason::KeyCompromise => "Compromised Key",
            RevocationReason::CaCompromise => "CA Compromised",
            RevocationReason::AffiliationChanged => "Affiliation Changed",
            RevocationReason::Superseded => "Superseded",
            RevocationReason::CessationOfOperation => "Cessation of Operation",
            RevocationReason::CertificateHold => "Certificate Hold",
        }
    }

    pub fn from_remote_phrase(phrase: &str) -> Self {
        match phrase.trim().to_ascii_lowercase().as_str() {
            "compromised key" => RevocationReason::KeyCompromise,
            "ca compromised" => RevocationReason::CaCompromise,
            "affiliation changed" => RevocationReason::AffiliationChanged,
            "superseded" => RevocationReason::Superseded,
            "cessation of operation" => RevocationReason::CessationOfOperation,
            "certificate hold" => RevocationReason::CertificateHold,
            _ => RevocationReason::Unspecified,
        }
    }
}

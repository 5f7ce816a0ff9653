use anyhow::{Result, anyhow};
use pem::Pem;
use x509_parser::parse_x509_certificate;

use super::types::IssuedCertificate;

/// Extracts the leaf from a PEM chain as returned by the collect endpoint.
///
/// The first `CERTIFICATE` block is the leaf; intermediates follow it.
pub fn parse_pem_chain(chain_pem: &str) -> Result<IssuedCertificate> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let leaf: Pem = blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| anyhow!("no certificate PEM blocks found"))?;
    inspect_der(leaf.contents())
}

/// Reads subject and serial from DER-encoded certificate bytes.
pub fn inspect_der(der: &[u8]) -> Result<IssuedCertificate> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|err| anyhow!("failed to parse certificate DER: {err}"))?;
    Ok(IssuedCertificate {
        der: der.to_vec(),
        subject: cert.subject().to_string(),
        serial_hex: hex::encode_upper(cert.raw_serial()),
    })
}

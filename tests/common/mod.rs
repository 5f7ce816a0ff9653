#![allow(dead_code)]

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Result;
use rcgen::{CertificateParams, DnType, KeyPair, SerialNumber};
use uuid::Uuid;

use cm_gateway::core::certificate::inspect_der;
use cm_gateway::core::config::Secret;
use cm_gateway::core::types::{IssuedCertificate, Profile, RemoteCertificate};
use cm_gateway::{GatewayConfig, InMemoryAuthority};

pub const PROFILE_ID: i64 = 2846;

pub fn create_temp_dir(label: &str) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "cm_gateway_{label}_{}",
        Uuid::new_v4().as_simple()
    ));
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Connection section with pickup delays removed so tests never sleep.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        api_endpoint: "https://cert-manager.com".into(),
        auth_type: "Password".into(),
        customer_uri: "acme".into(),
        username: "svc-gateway".into(),
        password: Secret::new("not-a-real-password"),
        pickup_retries: 3,
        pickup_delay: 0,
        pickup_settle_delay_secs: 0,
        page_size: 2,
        queue_capacity: 4,
        ..GatewayConfig::default()
    }
}

/// Self-signed certificate with a fixed serial, as DER and PEM.
pub fn generate_certificate(common_name: &str, serial: &[u8]) -> Result<(IssuedCertificate, String)> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.serial_number = Some(SerialNumber::from_slice(serial));
    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((inspect_der(cert.der())?, cert.pem()))
}

pub fn profile() -> Profile {
    Profile {
        id: PROFILE_ID,
        name: "InCommon SSL (SHA-2)".into(),
        description: None,
        terms: vec![365, 730],
    }
}

pub fn remote(id: i64, common_name: &str, serial: &str, status: &str) -> RemoteCertificate {
    RemoteCertificate {
        id,
        common_name: common_name.into(),
        serial_number: serial.into(),
        status: status.into(),
        cert_type: Some(profile()),
        ..RemoteCertificate::default()
    }
}

/// Adds an issued certificate to the authority and returns its leaf.
pub fn seed_issued(authority: &InMemoryAuthority, id: i64, serial: &[u8]) -> Result<IssuedCertificate> {
    let common_name = format!("host{id}.example.com");
    let (issued, _) = generate_certificate(&common_name, serial)?;
    authority.add_certificate(remote(id, &common_name, &issued.serial_hex, "Issued"));
    authority.set_issued(id, issued.clone());
    Ok(issued)
}

pub fn authority() -> Arc<InMemoryAuthority> {
    let authority = Arc::new(InMemoryAuthority::new());
    authority.add_profile(profile());
    authority
}

//! Agent certificate management.
//!
//! Each instance carries two keypairs next to its config volume: a server
//! pair presented by the in-guest agent and a client pair the host uses
//! for mutual TLS. A pair is kept as-is when both files exist and
//! regenerated together otherwise.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{Error, Result};

/// PEM contents of the four per-instance certificate files.
#[derive(Debug, Clone)]
pub struct AgentCerts {
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

/// Ensure the agent server and client certificate pairs exist under
/// `instance_path`, generating whichever pair is incomplete, and return
/// all four PEM blobs.
pub fn find_or_generate(instance_path: &Path, name: &str) -> Result<AgentCerts> {
    let (server_cert, server_key) = find_or_gen_pair(
        &instance_path.join("agent.crt"),
        &instance_path.join("agent.key"),
        name,
        false,
    )?;

    let (client_cert, client_key) = find_or_gen_pair(
        &instance_path.join("agent-client.crt"),
        &instance_path.join("agent-client.key"),
        name,
        true,
    )?;

    Ok(AgentCerts {
        server_cert,
        server_key,
        client_cert,
        client_key,
    })
}

fn find_or_gen_pair(
    cert_path: &Path,
    key_path: &Path,
    name: &str,
    client: bool,
) -> Result<(String, String)> {
    if cert_path.exists() && key_path.exists() {
        let cert = fs::read_to_string(cert_path)?;
        let key = fs::read_to_string(key_path)?;
        return Ok((cert, key));
    }

    debug!(cert = %cert_path.display(), "generating agent certificate pair");
    let (cert, key) = generate_pair(name, client)?;

    fs::write(cert_path, &cert)?;
    fs::set_permissions(cert_path, fs::Permissions::from_mode(0o644))?;
    fs::write(key_path, &key)?;
    fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;

    Ok((cert, key))
}

fn generate_pair(name: &str, client: bool) -> Result<(String, String)> {
    let mut params = CertificateParams::new(vec![name.to_string()]);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "stoker");
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;

    // The client pair doubles as its own trust root for the agent side.
    params.is_ca = if client {
        IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(365 * 10);

    let cert = Certificate::from_params(params)
        .map_err(|e| Error::context(format!("Failed to generate certificate: {e}")))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| Error::context(format!("Failed to serialize certificate: {e}")))?;
    let key_pem = cert.serialize_private_key_pem();

    Ok((cert_pem, key_pem))
}

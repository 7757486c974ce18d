//! TLS bootstrap: load existing material or mint a self-signed certificate.
//!
//! Certificates minted here are ECDSA P-256 with SAN = the bind host,
//! valid ten years, written 0o600. The re-mint check treats a file within
//! seven days of that ten-year horizon (by mtime) as expiring; material
//! supplied by the operator at other ages is left alone.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, KeyPair, SanType};
use tracing::info;

use haya_core::{HayaError, Result};

const VALIDITY_DAYS: u64 = 3650;
const RENEW_WINDOW_DAYS: u64 = 7;

/// Ensure cert+key exist at the given paths and are not about to expire.
/// Returns true when new material was minted.
pub fn ensure_tls_material(cert_path: &Path, key_path: &Path, san_host: &str) -> Result<bool> {
    if cert_path.exists() && key_path.exists() && !near_expiry(cert_path)? {
        return Ok(false);
    }
    mint_self_signed(cert_path, key_path, san_host)?;
    Ok(true)
}

fn near_expiry(cert_path: &Path) -> Result<bool> {
    let mtime = fs::metadata(cert_path)?.modified()?;
    let lifetime = Duration::from_secs(VALIDITY_DAYS * 86_400);
    let renew_window = Duration::from_secs(RENEW_WINDOW_DAYS * 86_400);
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or_default();
    Ok(age + renew_window >= lifetime)
}

fn mint_self_signed(cert_path: &Path, key_path: &Path, san_host: &str) -> Result<()> {
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![san_entry(san_host)?];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS as i64);

    let key_pair = KeyPair::generate()
        .map_err(|e| HayaError::Internal(format!("key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| HayaError::Internal(format!("certificate generation failed: {e}")))?;

    if let Some(parent) = cert_path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_restricted(cert_path, cert.pem().as_bytes())?;
    write_restricted(key_path, key_pair.serialize_pem().as_bytes())?;
    info!(cert = %cert_path.display(), san = san_host, "self-signed certificate minted");
    Ok(())
}

fn san_entry(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .to_string()
        .try_into()
        .map_err(|_| HayaError::Config(format!("invalid TLS SAN host '{host}'")))?;
    Ok(SanType::DnsName(name))
}

fn write_restricted(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_when_material_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("haya.crt");
        let key = dir.path().join("haya.key");
        let minted = ensure_tls_material(&cert, &key, "192.168.1.20").unwrap();
        assert!(minted);
        assert!(cert.exists() && key.exists());

        let mode = fs::metadata(&cert).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let pem = fs::read_to_string(&cert).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn fresh_material_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("haya.crt");
        let key = dir.path().join("haya.key");
        ensure_tls_material(&cert, &key, "example.local").unwrap();
        let first = fs::read(&cert).unwrap();

        let minted = ensure_tls_material(&cert, &key, "example.local").unwrap();
        assert!(!minted);
        assert_eq!(fs::read(&cert).unwrap(), first);
    }

    #[test]
    fn stale_material_is_reminted() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("haya.crt");
        let key = dir.path().join("haya.key");
        ensure_tls_material(&cert, &key, "example.local").unwrap();

        // push the mtime past the renewal horizon
        let past = SystemTime::now()
            - Duration::from_secs((VALIDITY_DAYS - RENEW_WINDOW_DAYS + 1) * 86_400);
        let f = fs::File::options().append(true).open(&cert).unwrap();
        f.set_times(fs::FileTimes::new().set_modified(past)).unwrap();

        let minted = ensure_tls_material(&cert, &key, "example.local").unwrap();
        assert!(minted);
    }

    #[test]
    fn dns_and_ip_sans_both_accepted() {
        assert!(san_entry("gateway.local").is_ok());
        assert!(san_entry("10.1.2.3").is_ok());
    }
}

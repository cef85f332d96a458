//! SSH Host Key Preflight
//!
//! Captures a server's host key without authenticating, so an operator can
//! inspect the fingerprint before trusting it.
//!
//! # Flow
//! 1. `scan_host_key(host, port)` runs a handshake and aborts inside
//!    `check_server_key`, after the key is known.
//! 2. The captured key is classified against known_hosts.
//! 3. `trust_scanned_key` records it, unless the host already has a
//!    different key on file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client;
use russh::keys::PublicKey;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::{client_config, resolve};
use super::error::SshError;
use super::known_hosts::{HostKey, HostKeyVerification, KnownHostsStore};

/// Classification of a scanned key
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostKeyStatus {
    /// Key is on file for this host
    Verified,
    /// Host has no recorded key
    Unknown,
    /// Host has recorded keys and this is none of them
    Changed { expected_fingerprints: Vec<String> },
    /// Key is marked `@revoked`
    Revoked,
}

/// What `scan_host_key` saw
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint: String,
    pub status: HostKeyStatus,
    /// Fingerprints already on file for this host
    pub recorded_fingerprints: Vec<String>,
    #[serde(skip)]
    pub key: HostKey,
}

/// Handler that records the server key and aborts the handshake
struct ScanHandler {
    captured: Arc<Mutex<Option<HostKey>>>,
}

impl client::Handler for ScanHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        *self.captured.lock() = Some(HostKey::from_public_key(server_public_key));
        // Rejecting ends the handshake before any credentials are sent
        Ok(false)
    }
}

/// Handshake with `host:port` and classify the presented key.
pub async fn scan_host_key(
    host: &str,
    port: u16,
    timeout: Duration,
    known_hosts: &Path,
) -> Result<ScanReport, SshError> {
    let socket_addr = resolve(host, port, timeout).await?;
    debug!("Scanning host key of {}:{} ({})", host, port, socket_addr);

    let captured = Arc::new(Mutex::new(None));
    let handler = ScanHandler {
        captured: captured.clone(),
    };

    let connect_result = tokio::time::timeout(
        timeout,
        client::connect(Arc::new(client_config()), socket_addr, handler),
    )
    .await;

    let key = captured.lock().take();
    let Some(key) = key else {
        return Err(match connect_result {
            Err(_) => SshError::Timeout(format!("scanning {}:{} timed out", host, port)),
            Ok(Err(e)) => e,
            Ok(Ok(_)) => SshError::ProtocolError(format!(
                "{}:{} completed a handshake without presenting a host key",
                host, port
            )),
        });
    };

    let store = KnownHostsStore::shared(known_hosts)?;
    let fingerprint = key.fingerprint();
    let status = match store.verify(host, port, Some(socket_addr), &key) {
        HostKeyVerification::Verified => HostKeyStatus::Verified,
        HostKeyVerification::Unknown { .. } => HostKeyStatus::Unknown,
        HostKeyVerification::Changed {
            expected_fingerprints,
            ..
        } => {
            warn!(
                "Scan: HOST KEY CHANGED for {}:{} - expected {}, got {}",
                host,
                port,
                expected_fingerprints.join(", "),
                fingerprint
            );
            HostKeyStatus::Changed {
                expected_fingerprints,
            }
        }
        HostKeyVerification::Revoked { .. } => HostKeyStatus::Revoked,
    };

    let recorded_fingerprints = store
        .keys_for_host(host, port)
        .iter()
        .map(HostKey::fingerprint)
        .collect();

    info!("Scanned {}:{}: {} {:?}", host, port, fingerprint, status);
    Ok(ScanReport {
        host: host.to_string(),
        port,
        key_type: key.key_type().to_string(),
        fingerprint,
        status,
        recorded_fingerprints,
        key,
    })
}

/// Record the scanned key in known_hosts.
///
/// Returns `Ok(false)` when the key was already on file. A host with a
/// different recorded key is refused; the old entry has to be removed by hand.
pub fn trust_scanned_key(report: &ScanReport, known_hosts: &Path) -> Result<bool, SshError> {
    let store = KnownHostsStore::shared(known_hosts)?;
    let appended = store.add_host(&report.host, report.port, None, &report.key)?;
    if appended {
        info!(
            "Trusted {} for {}:{} in {}",
            report.fingerprint,
            report.host,
            report.port,
            known_hosts.display()
        );
    }
    Ok(appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::error::ErrorKind;
    use std::fs;
    use tempfile::tempdir;

    const K1: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAID3UstXbxnSOJsnSW/xlutl6a3+ZLT7VX4zY8lB9LZHG";
    const K2: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILANUChF4zmxBSiaWXIb+HC708pxwpU1HAi/yujbc8Cu";

    fn report(host: &str, port: u16, key: &str) -> ScanReport {
        let key = HostKey::parse(key).unwrap();
        ScanReport {
            host: host.to_string(),
            port,
            key_type: key.key_type().to_string(),
            fingerprint: key.fingerprint(),
            status: HostKeyStatus::Unknown,
            recorded_fingerprints: Vec::new(),
            key,
        }
    }

    #[test]
    fn test_trust_scanned_key_appends_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let scanned = report("db.internal", 2222, K1);
        assert!(trust_scanned_key(&scanned, &path).unwrap());
        assert!(!trust_scanned_key(&scanned, &path).unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("[db.internal]:2222 ssh-ed25519 "));
    }

    #[test]
    fn test_trust_scanned_key_refuses_changed_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("10.0.0.5 {}\n", K1)).unwrap();

        let err = trust_scanned_key(&report("10.0.0.5", 22, K2), &path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostKeyMismatch);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_report_serializes_status_tag() {
        let json = serde_json::to_value(report("10.0.0.5", 22, K1)).unwrap();
        assert_eq!(json["status"]["status"], "unknown");
        assert_eq!(
            json["fingerprint"],
            "SHA256:UxCTRqzCfF+jbcioQcStPb3VoyYOUIbVmMhW2FeXCJM"
        );
        assert!(json.get("key").is_none());
    }
}

//! Host identity verification
//!
//! Wraps the known_hosts store into the policy applied during the handshake:
//!
//! | store says | result                                                     |
//! |------------|------------------------------------------------------------|
//! | Verified   | accept                                                     |
//! | Changed    | reject, always (possible MITM), whatever the policy flags  |
//! | Revoked    | reject, always                                             |
//! | Unknown    | record + accept if `auto_trust_unknown_host`, else reject  |
//!
//! `allow_insecure_host_key` only matters when the store itself cannot be
//! created, read or written. It is logged at warning level on every use.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::config::ConnectionConfig;
use super::error::{ErrorKind, SshError};
use super::known_hosts::{HostKey, HostKeyVerification, KnownHostsStore};

/// Caller-selected trust policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostKeyPolicy {
    pub auto_trust_unknown_host: bool,
    pub allow_insecure_host_key: bool,
}

impl From<&ConnectionConfig> for HostKeyPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            auto_trust_unknown_host: config.auto_trust_unknown_host,
            allow_insecure_host_key: config.allow_insecure_host_key,
        }
    }
}

enum TrustSource {
    Store(Arc<KnownHostsStore>),
    Unverified { reason: String },
}

pub struct HostKeyVerifier {
    source: TrustSource,
    policy: HostKeyPolicy,
}

impl HostKeyVerifier {
    /// Verifier for the known_hosts file named by `config` (default `~/.ssh/known_hosts`)
    pub fn for_config(config: &ConnectionConfig) -> Result<Self, SshError> {
        let path = config
            .known_hosts_path
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path);
        Self::open(&path, HostKeyPolicy::from(config))
    }

    pub fn open(path: &Path, policy: HostKeyPolicy) -> Result<Self, SshError> {
        match KnownHostsStore::shared(path) {
            Ok(store) => Ok(Self::with_store(store, policy)),
            Err(e) if policy.allow_insecure_host_key => {
                warn!(
                    "Trust store {} unusable ({}); host key verification DISABLED by allow_insecure_host_key",
                    path.display(),
                    e
                );
                Ok(Self {
                    source: TrustSource::Unverified {
                        reason: e.to_string(),
                    },
                    policy,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn with_store(store: Arc<KnownHostsStore>, policy: HostKeyPolicy) -> Self {
        Self {
            source: TrustSource::Store(store),
            policy,
        }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        match &self.source {
            TrustSource::Store(store) => Some(store.path().to_path_buf()),
            TrustSource::Unverified { .. } => None,
        }
    }

    /// Decide whether `key`, presented by `hostname` at `remote`, is trusted.
    pub fn verify(
        &self,
        hostname: &str,
        port: u16,
        remote: Option<SocketAddr>,
        key: &HostKey,
    ) -> Result<(), SshError> {
        let store = match &self.source {
            TrustSource::Store(store) => store,
            TrustSource::Unverified { reason } => {
                warn!(
                    "INSECURE: accepting host key {} for {}:{} without verification ({})",
                    key.fingerprint(),
                    hostname,
                    port,
                    reason
                );
                return Ok(());
            }
        };

        match store.verify(hostname, port, remote, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", hostname, port);
                Ok(())
            }
            HostKeyVerification::Changed {
                expected_fingerprints,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    hostname,
                    port,
                    expected_fingerprints.join(", "),
                    actual_fingerprint
                );
                Err(SshError::HostKeyChanged {
                    host: hostname.to_string(),
                    expected: expected_fingerprints.join(", "),
                    actual: actual_fingerprint,
                    known_hosts: store.path().display().to_string(),
                })
            }
            HostKeyVerification::Revoked { fingerprint } => {
                warn!("Revoked host key {} presented by {}:{}", fingerprint, hostname, port);
                Err(SshError::HostKeyRevoked {
                    host: hostname.to_string(),
                    fingerprint,
                    known_hosts: store.path().display().to_string(),
                })
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if !self.policy.auto_trust_unknown_host {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                        hostname, port, fingerprint
                    );
                    return Err(SshError::HostKeyUnknown {
                        host: hostname.to_string(),
                        scan_host: hostname.to_string(),
                        port,
                        fingerprint,
                    });
                }

                match store.add_host(hostname, port, remote, key) {
                    Ok(appended) => {
                        info!(
                            "TOFU: trusting host key for {}:{} (fingerprint: {}, appended: {})",
                            hostname, port, fingerprint, appended
                        );
                        Ok(())
                    }
                    Err(e)
                        if e.kind() == ErrorKind::TrustStore
                            && self.policy.allow_insecure_host_key =>
                    {
                        warn!(
                            "INSECURE: could not record host key for {}:{} ({}); continuing unverified",
                            hostname, port, e
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const K1: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAID3UstXbxnSOJsnSW/xlutl6a3+ZLT7VX4zY8lB9LZHG";
    const K2: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILANUChF4zmxBSiaWXIb+HC708pxwpU1HAi/yujbc8Cu";

    fn key(line: &str) -> HostKey {
        HostKey::parse(line).unwrap()
    }

    fn policy(auto_trust: bool, insecure: bool) -> HostKeyPolicy {
        HostKeyPolicy {
            auto_trust_unknown_host: auto_trust,
            allow_insecure_host_key: insecure,
        }
    }

    #[test]
    fn test_mismatch_is_never_bypassed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("10.0.0.5 {}\n", K1)).unwrap();

        for (auto_trust, insecure) in [(false, false), (true, false), (true, true)] {
            let verifier = HostKeyVerifier::open(&path, policy(auto_trust, insecure)).unwrap();
            let err = verifier.verify("10.0.0.5", 22, None, &key(K2)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HostKeyMismatch);
            assert!(err.to_string().contains("man-in-the-middle"));
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_unknown_host_rejected_without_auto_trust() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let verifier = HostKeyVerifier::open(&path, policy(false, false)).unwrap();

        let err = verifier.verify("10.0.0.5", 22, None, &key(K1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostKeyUnknown);
        assert!(err.to_string().contains("10.0.0.5"));
        assert!(err.remediation().is_some());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_auto_trust_records_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let verifier = HostKeyVerifier::open(&path, policy(true, false)).unwrap();

        verifier.verify("10.0.0.5", 22, None, &key(K1)).unwrap();
        verifier.verify("10.0.0.5", 22, None, &key(K1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("10.0.0.5 ssh-ed25519 "));
    }

    #[test]
    fn test_concurrent_auto_trust_writes_one_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let path = path.clone();
                scope.spawn(move || {
                    let verifier = HostKeyVerifier::open(&path, policy(true, false)).unwrap();
                    verifier.verify("10.0.0.5", 22, None, &key(K1)).unwrap();
                });
            }
        });

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_unusable_store_requires_explicit_opt_in() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened as the known_hosts file
        let path = dir.path().to_path_buf();

        let err = HostKeyVerifier::open(&path, policy(false, false))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::TrustStore);

        let verifier = HostKeyVerifier::open(&path, policy(false, true)).unwrap();
        assert!(verifier.known_hosts_path().is_none());
        assert!(verifier.verify("10.0.0.5", 22, None, &key(K1)).is_ok());
    }
}

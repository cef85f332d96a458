//! Keychain Integration
//!
//! Stores per-target SSH passwords in the system keychain via the `keyring`
//! crate. Callers look a password up before building a `ConnectionConfig`;
//! nothing in the connection path prompts.

use keyring::Entry;
use tracing::{debug, info, warn};

use crate::ssh::TargetIdentity;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxide-remote.ssh";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("No password stored for {0}")]
    NotFound(String),
}

/// Keychain manager for SSH passwords
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Account name for a target, scoped to the local OS user so two local
    /// accounts never share entries.
    pub fn account_for(target: &TargetIdentity) -> String {
        format!("{}:{}", whoami::username(), target)
    }

    fn entry(&self, target: &TargetIdentity) -> Result<Entry, KeychainError> {
        Ok(Entry::new(&self.service, &Self::account_for(target))?)
    }

    pub fn store_password(&self, target: &TargetIdentity, password: &str) -> Result<(), KeychainError> {
        info!("Keychain store: service={}, target={}", self.service, target);
        self.entry(target)?.set_password(password)?;
        Ok(())
    }

    pub fn get_password(&self, target: &TargetIdentity) -> Result<String, KeychainError> {
        match self.entry(target)?.get_password() {
            Ok(secret) => {
                debug!("Keychain hit for {}", target);
                Ok(secret)
            }
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(target.to_string())),
            Err(e) => {
                warn!("Keychain get failed for {}: {:?}", target, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    /// Like [`get_password`](Self::get_password) but maps "nothing stored"
    /// to `None`.
    pub fn find_password(&self, target: &TargetIdentity) -> Result<Option<String>, KeychainError> {
        match self.get_password(target) {
            Ok(secret) => Ok(Some(secret)),
            Err(KeychainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn delete_password(&self, target: &TargetIdentity) -> Result<(), KeychainError> {
        match self.entry(target)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Touches the real system keychain under a dedicated service name

    #[test]
    #[ignore] // Run manually: cargo test keychain -- --ignored
    fn test_keychain_operations() {
        let keychain = Keychain::with_service("com.oxide-remote.test");
        let target = TargetIdentity::new("svc", "10.0.0.5", 22);

        keychain.store_password(&target, "test-secret").unwrap();
        assert_eq!(keychain.get_password(&target).unwrap(), "test-secret");

        keychain.delete_password(&target).unwrap();
        assert!(keychain.find_password(&target).unwrap().is_none());
    }

    #[test]
    fn test_account_is_scoped_to_target() {
        let a = Keychain::account_for(&TargetIdentity::new("svc", "10.0.0.5", 22));
        let b = Keychain::account_for(&TargetIdentity::new("svc", "10.0.0.5", 2222));
        assert!(a.ends_with(":svc@10.0.0.5:22"));
        assert_ne!(a, b);
    }
}

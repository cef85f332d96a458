//! SSH Configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// `{user, host, port}` key of one pooled connection.
///
/// Compared verbatim: no case folding, no DNS resolution. Two configurations
/// that reach the same endpoint through different spellings get separate
/// pool entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl TargetIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// SSH connection configuration
///
/// Immutable for the lifetime of one connection attempt.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Path to a private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    /// Optional passphrase for an encrypted key
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,

    /// Password, used directly when no key is configured, otherwise as fallback
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Dial / handshake / probe timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Override for the known_hosts file (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Record the key of a host with no known_hosts entry and continue
    #[serde(default)]
    pub auto_trust_unknown_host: bool,

    /// Skip host key verification when the trust store itself is unusable
    #[serde(default)]
    pub allow_insecure_host_key: bool,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            key_path: None,
            passphrase: None,
            password: None,
            timeout_secs: 30,
            known_hosts_path: None,
            auto_trust_unknown_host: false,
            allow_insecure_host_key: false,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("auto_trust_unknown_host", &self.auto_trust_unknown_host)
            .field("allow_insecure_host_key", &self.allow_insecure_host_key)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.key_path = Some(key_path.into());
        self.passphrase = passphrase;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(self.username.clone(), self.host.clone(), self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject configurations that can never connect. Fails fast, before any
    /// pool or network interaction.
    pub fn validate(&self) -> Result<(), SshError> {
        if self.host.trim().is_empty() {
            return Err(SshError::InvalidConfig("host is required".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(SshError::InvalidConfig("username is required".to_string()));
        }
        if self.port == 0 {
            return Err(SshError::InvalidConfig("port must be non-zero".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(SshError::InvalidConfig(
                "timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.key_path.is_none() && self.password.is_none() {
            return Err(SshError::InvalidConfig(format!(
                "no credentials for {}: configure a key path or a password",
                self.identity()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::error::ErrorKind;

    #[test]
    fn test_missing_host_is_config_error() {
        let config = ConnectionConfig::new("", 22, "svc").with_password("pw");
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let config = ConnectionConfig::new("10.0.0.5", 22, "svc");
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("svc@10.0.0.5:22"));
    }

    #[test]
    fn test_identity_is_verbatim() {
        let a = ConnectionConfig::new("Build.Example.com", 22, "svc").identity();
        let b = ConnectionConfig::new("build.example.com", 22, "svc").identity();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "svc@Build.Example.com:22");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ConnectionConfig::new("10.0.0.5", 22, "svc")
            .with_key("/home/svc/.ssh/id_ed25519", Some("hunter2".into()))
            .with_password("s3cret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"host":"10.0.0.5","username":"svc","password":"pw"}"#)
                .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.auto_trust_unknown_host);
        assert!(!config.allow_insecure_host_key);
        assert!(config.validate().is_ok());
    }
}

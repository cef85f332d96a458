//! SSH Error types
//!
//! Every failure that crosses the transport boundary is an [`SshError`].
//! Policy decisions (retry, password fallback, pool eviction) branch on
//! [`SshError::kind`], never on message text.

use thiserror::Error;

/// Name of the CLI command suggested when a host identity cannot be verified
pub const SCAN_COMMAND: &str = "oxide-remote scan-host";

/// Coarse classification of an [`SshError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied configuration is unusable. Never retried.
    Config,
    /// Presented host key differs from every recorded key. Never retried.
    HostKeyMismatch,
    /// Host has no recorded key and auto-trust is off. Never retried.
    HostKeyUnknown,
    /// Presented host key is marked `@revoked`. Never retried.
    HostKeyRevoked,
    /// Trust store cannot be created or read.
    TrustStore,
    /// Server rejected the credentials, or the credential material is unusable.
    Authentication,
    /// Dial, timeout, I/O or dropped-connection failure. Retried.
    Network,
    /// Protocol-level failure that is neither network nor auth.
    Protocol,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "HOST KEY VERIFICATION FAILED: key for {host} has changed! \
         Recorded: {expected}, presented: {actual}. \
         This may indicate a man-in-the-middle attack (host key substitution). \
         If the change is legitimate, remove the old entry from {known_hosts} and re-scan the host."
    )]
    HostKeyChanged {
        host: String,
        expected: String,
        actual: String,
        known_hosts: String,
    },

    #[error(
        "Host key verification failed: unknown host {host} (fingerprint {fingerprint}). \
         Run `{cmd} --host {scan_host} --port {port} --trust` or re-run with auto-trust of unknown hosts enabled.",
        cmd = SCAN_COMMAND
    )]
    HostKeyUnknown {
        host: String,
        scan_host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("Host key {fingerprint} for {host} is marked @revoked in {known_hosts}")]
    HostKeyRevoked {
        host: String,
        fingerprint: String,
        known_hosts: String,
    },

    #[error("Trust store unavailable: {0}")]
    TrustStoreUnavailable(String),

    #[error("Authentication failed ({method}): {reason}")]
    AuthenticationFailed { method: &'static str, reason: String },

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Connection to {target} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        last: Box<SshError>,
    },
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::InvalidConfig(_) => ErrorKind::Config,
            SshError::HostKeyChanged { .. } => ErrorKind::HostKeyMismatch,
            SshError::HostKeyUnknown { .. } => ErrorKind::HostKeyUnknown,
            SshError::HostKeyRevoked { .. } => ErrorKind::HostKeyRevoked,
            SshError::TrustStoreUnavailable(_) => ErrorKind::TrustStore,
            SshError::AuthenticationFailed { .. } | SshError::KeyError(_) => {
                ErrorKind::Authentication
            }
            SshError::ConnectionFailed(_)
            | SshError::Timeout(_)
            | SshError::IoError(_)
            | SshError::ChannelError(_)
            | SshError::Disconnected => ErrorKind::Network,
            SshError::ProtocolError(_) => ErrorKind::Protocol,
            SshError::RetriesExhausted { last, .. } => last.kind(),
        }
    }

    /// Only network-kind failures are worth another dial.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SshError::RetriesExhausted { .. }) && self.kind() == ErrorKind::Network
    }

    /// True when the server (or the key material) refused the credentials,
    /// as opposed to the connection failing underneath the attempt.
    pub fn is_credential_rejection(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    /// True for every host-identity failure; these are security relevant and
    /// must surface with their message intact.
    pub fn is_host_identity(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::HostKeyMismatch | ErrorKind::HostKeyUnknown | ErrorKind::HostKeyRevoked
        )
    }

    /// Human-actionable hint for host-identity failures
    pub fn remediation(&self) -> Option<String> {
        match self {
            SshError::HostKeyUnknown {
                scan_host, port, ..
            } => Some(format!(
                "run `{} --host {} --port {} --trust` to record the host key, \
                 or re-run with --auto-trust",
                SCAN_COMMAND, scan_host, port
            )),
            SshError::HostKeyChanged { known_hosts, .. } => Some(format!(
                "verify the new key out of band, remove the stale line from {} and run `{}` again",
                known_hosts, SCAN_COMMAND
            )),
            SshError::HostKeyRevoked { known_hosts, .. } => Some(format!(
                "the server presents a revoked key; contact the host administrator (see {})",
                known_hosts
            )),
            SshError::TrustStoreUnavailable(_) => Some(
                "fix the known_hosts path permissions, or pass --allow-insecure-host-key \
                 to skip verification explicitly"
                    .to_string(),
            ),
            SshError::RetriesExhausted { last, .. } => last.remediation(),
            _ => None,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::IoError(e),
            russh::Error::ConnectionTimeout => SshError::Timeout("connection timeout".into()),
            russh::Error::KeepaliveTimeout => SshError::Timeout("keepalive timeout".into()),
            russh::Error::InactivityTimeout => SshError::Timeout("inactivity timeout".into()),
            russh::Error::Disconnect | russh::Error::HUP => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(SshError::Timeout("dial".into()).is_retryable());
        assert!(SshError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SshError::Disconnected.is_retryable());
        assert!(!SshError::InvalidConfig("missing host".into()).is_retryable());
        assert!(!SshError::AuthenticationFailed {
            method: "publickey",
            reason: "rejected".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_host_identity_errors_are_never_retryable() {
        let err = SshError::HostKeyChanged {
            host: "10.0.0.5".into(),
            expected: "SHA256:a".into(),
            actual: "SHA256:b".into(),
            known_hosts: "/tmp/known_hosts".into(),
        };
        assert_eq!(err.kind(), ErrorKind::HostKeyMismatch);
        assert!(!err.is_retryable());
        assert!(err.is_host_identity());
        assert!(err.to_string().contains("man-in-the-middle"));
    }

    #[test]
    fn test_exhausted_retries_keep_last_kind() {
        let err = SshError::RetriesExhausted {
            target: "svc@10.0.0.5:22".into(),
            attempts: 4,
            last: Box::new(SshError::Timeout("dial".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("after 4 attempt(s)"));
    }

    #[test]
    fn test_unknown_host_has_remediation() {
        let err = SshError::HostKeyUnknown {
            host: "10.0.0.5".into(),
            scan_host: "10.0.0.5".into(),
            port: 22,
            fingerprint: "SHA256:x".into(),
        };
        let hint = err.remediation().unwrap();
        assert!(hint.contains(SCAN_COMMAND));
        assert!(hint.contains("--trust"));
        assert!(err.to_string().contains("10.0.0.5"));
    }

    #[test]
    fn test_key_error_counts_as_credential_rejection() {
        assert!(SshError::KeyError("bad passphrase".into()).is_credential_rejection());
        assert!(!SshError::Timeout("auth".into()).is_credential_rejection());
    }
}

//! Authentication negotiation
//!
//! ```text
//! NotStarted ──key configured──▶ TryKey ──ok──▶ Authenticated(key)
//!     │                             │
//!     │                       credential rejection
//!     │                             ▼
//!     │                        KeyRejected ──password + rejection──▶ TryPasswordFallback
//!     │                                                                 │
//!     │                                              ok ◀───────────────┴──▶ Failed
//!     └──no key──▶ TryPassword ──ok──▶ Authenticated(password) | Failed
//! ```
//!
//! Password fallback happens only after the key was actually tried and the
//! failure is a credential rejection ([`SshError::is_credential_rejection`]).
//! A network failure during the key attempt is returned untouched, so an
//! outage never turns into a useless password attempt.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::ConnectionConfig;
use super::error::SshError;

/// Which method authenticated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthOutcome {
    Key,
    Password,
    PasswordFallback,
    #[default]
    Unknown,
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthOutcome::Key => "key",
            AuthOutcome::Password => "password",
            AuthOutcome::PasswordFallback => "password-fallback",
            AuthOutcome::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Negotiator states, recorded in order for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NotStarted,
    TryKey,
    KeyRejected,
    TryPasswordFallback,
    TryPassword,
    Authenticated(AuthOutcome),
    Failed,
}

/// Credential material for one attempt. The negotiator never prompts.
#[derive(Clone, Default)]
pub struct Credentials {
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
}

impl From<&ConnectionConfig> for Credentials {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            key_path: config.key_path.clone(),
            passphrase: config.passphrase.clone(),
            password: config.password.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Transport-side authentication primitives.
///
/// Implementations must report a server refusal (or unusable key material) as
/// an authentication-kind [`SshError`] and everything else with its own kind.
#[async_trait]
pub trait AuthTransport: Send {
    async fn auth_publickey(
        &mut self,
        user: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), SshError>;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<(), SshError>;
}

pub struct AuthNegotiator {
    credentials: Credentials,
    state: AuthState,
    history: Vec<AuthState>,
}

impl AuthNegotiator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::NotStarted,
            history: vec![AuthState::NotStarted],
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Every state visited, starting with `NotStarted`
    pub fn history(&self) -> &[AuthState] {
        &self.history
    }

    fn transition(&mut self, next: AuthState) {
        debug!("Auth state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Drive the state machine to `Authenticated` or `Failed`.
    pub async fn negotiate<T: AuthTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        user: &str,
    ) -> Result<AuthOutcome, SshError> {
        let key_path = self.credentials.key_path.clone();
        let passphrase = self.credentials.passphrase.clone();
        let password = self.credentials.password.clone();

        let Some(key_path) = key_path else {
            let Some(password) = password else {
                self.transition(AuthState::Failed);
                return Err(SshError::InvalidConfig(
                    "no authentication method configured".to_string(),
                ));
            };
            self.transition(AuthState::TryPassword);
            return self
                .finish(
                    transport.auth_password(user, &password).await,
                    AuthOutcome::Password,
                )
                .map_err(|e| {
                    warn!("Password authentication for {} failed: {}", user, e);
                    e
                });
        };

        self.transition(AuthState::TryKey);
        let key_err = match transport
            .auth_publickey(user, &key_path, passphrase.as_deref())
            .await
        {
            Ok(()) => return self.finish(Ok(()), AuthOutcome::Key),
            Err(e) => e,
        };

        if !key_err.is_credential_rejection() {
            // Network or protocol failure: the password would not fare better
            warn!(
                "Key authentication for {} failed without a credential rejection: {}",
                user, key_err
            );
            self.transition(AuthState::Failed);
            return Err(key_err);
        }

        self.transition(AuthState::KeyRejected);
        let Some(password) = password else {
            warn!("Key rejected for {} and no password configured", user);
            self.transition(AuthState::Failed);
            return Err(key_err);
        };

        info!(
            "Key rejected for {} ({}), falling back to password",
            user, key_err
        );
        self.transition(AuthState::TryPasswordFallback);
        self.finish(
            transport.auth_password(user, &password).await,
            AuthOutcome::PasswordFallback,
        )
    }

    fn finish(
        &mut self,
        result: Result<(), SshError>,
        outcome: AuthOutcome,
    ) -> Result<AuthOutcome, SshError> {
        match result {
            Ok(()) => {
                self.transition(AuthState::Authenticated(outcome));
                Ok(outcome)
            }
            Err(e) => {
                self.transition(AuthState::Failed);
                Err(e)
            }
        }
    }
}

/// russh handle adapter; each request is bounded by `timeout`
pub struct HandleAuth<'a> {
    handle: &'a mut Handle<ClientHandler>,
    timeout: Duration,
}

impl<'a> HandleAuth<'a> {
    pub fn new(handle: &'a mut Handle<ClientHandler>, timeout: Duration) -> Self {
        Self { handle, timeout }
    }
}

#[async_trait]
impl AuthTransport for HandleAuth<'_> {
    async fn auth_publickey(
        &mut self,
        user: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), SshError> {
        let key = russh::keys::load_secret_key(key_path, passphrase).map_err(|e| {
            SshError::KeyError(format!("cannot load {}: {}", key_path.display(), e))
        })?;
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let result = tokio::time::timeout(
            self.timeout,
            self.handle.authenticate_publickey(user, key_with_hash),
        )
        .await
        .map_err(|_| SshError::Timeout("public key authentication timed out".to_string()))??;

        if result.success() {
            Ok(())
        } else {
            Err(SshError::AuthenticationFailed {
                method: "publickey",
                reason: "key rejected by server".to_string(),
            })
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<(), SshError> {
        let result = tokio::time::timeout(
            self.timeout,
            self.handle.authenticate_password(user, password),
        )
        .await
        .map_err(|_| SshError::Timeout("password authentication timed out".to_string()))??;

        if result.success() {
            Ok(())
        } else {
            Err(SshError::AuthenticationFailed {
                method: "password",
                reason: "password rejected by server".to_string(),
            })
        }
    }
}

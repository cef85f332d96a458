//! SSH Client implementation using russh

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::auth::{AuthNegotiator, Credentials, HandleAuth};
use super::config::ConnectionConfig;
use super::connection_pool::Connector;
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::HostKey;
use super::session::SshConnection;
use super::verifier::HostKeyVerifier;

/// Resolve `host:port`, bounded by `timeout`. The first address wins.
pub(crate) async fn resolve(host: &str, port: u16, timeout: Duration) -> Result<SocketAddr, SshError> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| SshError::Timeout(format!("resolving {} timed out", host)))?
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", host, e)))?;

    let mut addrs = lookup;
    addrs
        .next()
        .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", host)))
}

pub(crate) fn client_config() -> client::Config {
    client::Config {
        // Liveness is decided by the pool probe
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    }
}

/// Client handler for russh callbacks.
///
/// Host key decisions are delegated to the [`HostKeyVerifier`]; the handler
/// only records the fingerprint of the key it accepted.
pub struct ClientHandler {
    host: String,
    port: u16,
    remote: Option<SocketAddr>,
    verifier: Arc<HostKeyVerifier>,
    accepted_fingerprint: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        remote: Option<SocketAddr>,
        verifier: Arc<HostKeyVerifier>,
    ) -> Self {
        Self {
            host,
            port,
            remote,
            verifier,
            accepted_fingerprint: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared slot filled with the fingerprint once the server key is accepted
    pub fn fingerprint_slot(&self) -> Arc<Mutex<Option<String>>> {
        self.accepted_fingerprint.clone()
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = HostKey::from_public_key(server_public_key);
        self.verifier
            .verify(&self.host, self.port, self.remote, &key)?;
        *self.accepted_fingerprint.lock() = Some(key.fingerprint());
        Ok(true)
    }
}

/// One-shot connection establishment: dial, verify, authenticate
pub struct SshClient {
    config: ConnectionConfig,
}

impl SshClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let config = self.config;
        config.validate()?;
        let identity = config.identity();
        let timeout = config.timeout();

        info!("Connecting to {}", identity);

        let verifier = Arc::new(HostKeyVerifier::for_config(&config)?);
        let socket_addr = resolve(&config.host, config.port, timeout).await?;

        let handler = ClientHandler::new(
            config.host.clone(),
            config.port,
            Some(socket_addr),
            verifier,
        );
        let fingerprint = handler.fingerprint_slot();

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(client_config()), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", identity)))??;

        debug!("SSH handshake completed with {}", identity);

        let mut negotiator = AuthNegotiator::new(Credentials::from(&config));
        let outcome = {
            let mut transport = HandleAuth::new(&mut handle, timeout);
            negotiator.negotiate(&mut transport, &config.username).await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(e);
            }
        };

        info!("Authenticated to {} ({})", identity, outcome);

        let controller = spawn_handle_owner_task(handle, identity.to_string());
        let fingerprint = fingerprint.lock().take();
        Ok(SshConnection::new(identity, controller, outcome, fingerprint))
    }
}

/// Production [`Connector`] for the pool
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<SshConnection, SshError> {
        let result = SshClient::new(config.clone()).connect().await;
        if let Err(e) = &result {
            if e.is_host_identity() {
                warn!("Host identity check failed for {}: {}", config.identity(), e);
            }
        }
        result
    }
}

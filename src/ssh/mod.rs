//! SSH module - pooled, host-verified SSH connections
//!
//! This module provides the connection lifecycle on top of the russh library.
//!
//! # Features
//! - Connection pool keyed by `{user, host, port}` with liveness probing and
//!   background eviction (see `connection_pool`)
//! - Host key verification via ~/.ssh/known_hosts with trust-on-first-use
//! - Public key authentication with password fallback on credential rejection
//! - Bounded connection retry with exponential backoff
//! - Host key scanning before first contact

mod auth;
mod client;
mod config;
pub mod connection_pool;
mod error;
pub mod exec;
mod handle_owner;
pub mod known_hosts;
pub mod preflight;
mod retry;
mod session;
pub mod verifier;

pub use auth::{AuthNegotiator, AuthOutcome, AuthState, AuthTransport, Credentials};
pub use client::{ClientHandler, SshClient, SshConnector};
pub use config::{ConnectionConfig, TargetIdentity};
pub use connection_pool::{
    global_pool, init_global_pool, ConnectionPool, ConnectionPoolConfig, ConnectionPoolError,
    Connector, PoolStats, PooledConnection, PooledConnectionInfo, PooledTransport,
};
pub use error::{ErrorKind, SshError, SCAN_COMMAND};
pub use exec::{run_command, test_host, HostTestReport};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKey, HostKeyVerification, KnownHostsStore};
pub use preflight::{scan_host_key, trust_scanned_key, HostKeyStatus, ScanReport};
pub use retry::{retry_connect, RetryPolicy};
pub use session::{CommandOutput, SshConnection};
pub use verifier::{HostKeyPolicy, HostKeyVerifier};

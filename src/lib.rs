//! oxide-remote - remote command client
//!
//! Pooled SSH connections with known_hosts verification and key/password
//! authentication, built on russh.

pub mod config;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

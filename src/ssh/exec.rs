//! Session executor
//!
//! Thin consumers of the pool: run one command, or check that a host is
//! reachable and report how the connection was made.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::auth::AuthOutcome;
use super::config::{ConnectionConfig, TargetIdentity};
use super::connection_pool::{ConnectionPool, Connector, PooledConnection};
use super::error::{ErrorKind, SshError};
use super::session::{CommandOutput, SshConnection};

/// Result of [`test_host`]
#[derive(Debug, Clone, Serialize)]
pub struct HostTestReport {
    pub target: TargetIdentity,
    pub auth_outcome: AuthOutcome,
    pub host_key_fingerprint: Option<String>,
    /// When the underlying SSH connection was established
    pub connected_at: DateTime<Utc>,
    pub connect_ms: u64,
    /// Served from an existing pooled connection
    pub reused: bool,
}

/// Acquire a connection for `config`, run `command`, release.
///
/// When running fails with a network-kind error the connection is probed;
/// only a connection that no longer answers is invalidated. A command that
/// merely overran `timeout` leaves the shared connection pooled.
pub async fn run_command<C>(
    pool: &Arc<ConnectionPool<C>>,
    config: &ConnectionConfig,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, SshError>
where
    C: Connector<Transport = SshConnection>,
{
    let conn = pool.acquire(config).await?;
    debug!("Running command on {}", conn.identity());

    let result = conn.exec(command, timeout).await;
    settle(pool, &conn, result.as_ref().err()).await;
    result
}

/// Connect (or reuse), probe, and report how the target was reached.
pub async fn test_host<C>(
    pool: &Arc<ConnectionPool<C>>,
    config: &ConnectionConfig,
) -> Result<HostTestReport, SshError>
where
    C: Connector<Transport = SshConnection>,
{
    let started = Instant::now();
    let conn = pool.acquire(config).await?;
    let connect_ms = started.elapsed().as_millis() as u64;

    let probed = pool.probe(&conn).await;
    finish(pool, &conn, probed.is_ok()).await;
    probed?;

    Ok(HostTestReport {
        target: conn.identity().clone(),
        auth_outcome: conn.auth_outcome(),
        host_key_fingerprint: conn.host_key_fingerprint().map(str::to_string),
        connected_at: conn.connected_at(),
        connect_ms,
        reused: conn.reused(),
    })
}

/// Hand `conn` back after a use that ended with `failure`.
async fn settle<C: Connector>(
    pool: &Arc<ConnectionPool<C>>,
    conn: &PooledConnection<C::Transport>,
    failure: Option<&SshError>,
) {
    let alive = match failure {
        Some(e) if e.kind() == ErrorKind::Network => match pool.probe(conn).await {
            Ok(()) => {
                debug!("{} still answers after: {}", conn.identity(), e);
                true
            }
            Err(probe_err) => {
                warn!(
                    "Connection to {} failed in use ({}), probe: {}",
                    conn.identity(),
                    e,
                    probe_err
                );
                false
            }
        },
        _ => true,
    };
    finish(pool, conn, alive).await;
}

async fn finish<C: Connector>(
    pool: &Arc<ConnectionPool<C>>,
    conn: &PooledConnection<C::Transport>,
    alive: bool,
) {
    let outcome = if alive {
        pool.release(conn)
    } else {
        pool.invalidate(conn).await
    };
    if let Err(e) = outcome {
        // Maintenance may have evicted or replaced it meanwhile
        debug!("Pool bookkeeping for {}: {}", conn.identity(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection_pool::{ConnectionPoolConfig, PooledTransport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Link {
        down: AtomicBool,
        closed: AtomicBool,
    }

    struct LinkTransport(Arc<Link>);

    #[async_trait]
    impl PooledTransport for LinkTransport {
        async fn probe(&self, _timeout: Duration) -> Result<(), SshError> {
            if self.0.down.load(Ordering::SeqCst) {
                Err(SshError::Disconnected)
            } else {
                Ok(())
            }
        }

        async fn close(&self) -> Result<(), SshError> {
            self.0.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct LinkConnector {
        links: Mutex<Vec<Arc<Link>>>,
    }

    #[async_trait]
    impl Connector for LinkConnector {
        type Transport = LinkTransport;

        async fn connect(&self, _config: &ConnectionConfig) -> Result<LinkTransport, SshError> {
            let link = Arc::new(Link::default());
            self.links.lock().push(link.clone());
            Ok(LinkTransport(link))
        }
    }

    fn setup() -> (Arc<ConnectionPool<LinkConnector>>, ConnectionConfig) {
        let pool = ConnectionPool::new(LinkConnector::default(), ConnectionPoolConfig::default());
        (pool, ConnectionConfig::new("10.0.0.5", 22, "svc").with_password("pw"))
    }

    #[tokio::test]
    async fn test_command_timeout_keeps_healthy_connection() {
        let (pool, config) = setup();
        let conn = pool.acquire(&config).await.unwrap();
        let other = pool.acquire(&config).await.unwrap();

        let overran = SshError::Timeout("command did not finish".into());
        settle(&pool, &conn, Some(&overran)).await;

        let listed = pool.list_connections();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].users, 1);
        assert!(!pool.connector().links.lock()[0].closed.load(Ordering::SeqCst));
        assert!(pool.release(&other).is_ok());
    }

    #[tokio::test]
    async fn test_dead_connection_is_invalidated() {
        let (pool, config) = setup();
        let conn = pool.acquire(&config).await.unwrap();
        let link = pool.connector().links.lock()[0].clone();
        link.down.store(true, Ordering::SeqCst);

        settle(&pool, &conn, Some(&SshError::Disconnected)).await;

        assert_eq!(pool.connection_count(), 0);
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_non_network_failure_releases() {
        let (pool, config) = setup();
        let conn = pool.acquire(&config).await.unwrap();
        pool.connector().links.lock()[0].down.store(true, Ordering::SeqCst);

        let refused = SshError::ProtocolError("bad packet".into());
        settle(&pool, &conn, Some(&refused)).await;

        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_stale_failure_spares_replacement() {
        let (pool, config) = setup();
        let stale = pool.acquire(&config).await.unwrap();
        pool.connector().links.lock()[0].down.store(true, Ordering::SeqCst);
        let _current = pool.acquire(&config).await.unwrap();

        settle(&pool, &stale, Some(&SshError::Disconnected)).await;

        let links = pool.connector().links.lock().clone();
        assert_eq!(links.len(), 2);
        assert_eq!(pool.connection_count(), 1);
        assert!(!links[1].closed.load(Ordering::SeqCst));
        assert_eq!(pool.list_connections()[0].users, 1);
    }
}

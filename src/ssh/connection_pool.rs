//! SSH Connection Pool
//!
//! Process-wide registry of authenticated connections keyed by
//! [`TargetIdentity`].
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  ConnectionPool                                            │
//! │  ├── entries: RwLock<HashMap<TargetIdentity, PoolEntry>>   │
//! │  │     └── PoolEntry                                       │
//! │  │         ├── transport: Arc<T>                           │
//! │  │         └── state: Mutex<{last_used, users, retries}>   │
//! │  ├── dial_gates: DashMap<TargetIdentity, Mutex<()>>        │
//! │  └── maintenance task (Weak<ConnectionPool>)               │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lock order
//!
//! 1. dial gate (per identity, async, held across the dial)
//! 2. `entries` (never held across `.await`)
//! 3. entry `state`
//!
//! The dial gate makes the miss-then-dial path exclusive per identity, so N
//! concurrent `acquire` calls for one identity produce a single dial. Dials
//! for different identities never wait on each other.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize, Serializer};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::AuthOutcome;
use super::client::SshConnector;
use super::config::{ConnectionConfig, TargetIdentity};
use super::error::SshError;
use super::retry::{retry_connect, RetryPolicy};

/// A live transport the pool can probe and close
#[async_trait]
pub trait PooledTransport: Send + Sync + 'static {
    /// Real round trip to the remote side, bounded by `timeout`
    async fn probe(&self, timeout: Duration) -> Result<(), SshError>;

    async fn close(&self) -> Result<(), SshError>;

    fn auth_outcome(&self) -> AuthOutcome {
        AuthOutcome::Unknown
    }
}

/// Builds one authenticated transport for a configuration
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: PooledTransport;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Transport, SshError>;
}

/// Pool bookkeeping errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionPoolError {
    #[error("Connection not found: {0}")]
    NotFound(TargetIdentity),

    /// The handed-out entry was replaced; the current one belongs to others
    #[error("Connection {entry_id} for {identity} is no longer pooled")]
    Stale {
        identity: TargetIdentity,
        entry_id: String,
    },
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Idle entries older than this are evicted (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maintenance cycle period (seconds)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Upper bound on one liveness probe (seconds)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Maximum number of pooled connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_connections: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        // tokio::time::interval panics on a zero period
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// Pool statistics for the operator-facing report
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    /// Entries with at least one user
    pub active_connections: usize,
    pub idle_connections: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub max_idle_duration: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub health_check_interval: Duration,
}

/// Per-entry view returned by [`ConnectionPool::list_connections`]
#[derive(Debug, Clone, Serialize)]
pub struct PooledConnectionInfo {
    pub id: String,
    pub identity: TargetIdentity,
    pub users: u32,
    pub idle_secs: u64,
    pub auth_outcome: AuthOutcome,
    pub created_at: DateTime<Utc>,
}

struct EntryState {
    last_used: Instant,
    users: u32,
    retry_count: u32,
}

struct PoolEntry<T> {
    id: String,
    transport: Arc<T>,
    created_at: DateTime<Utc>,
    state: Mutex<EntryState>,
}

impl<T> PoolEntry<T> {
    fn new(transport: T, attempts: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transport: Arc::new(transport),
            created_at: Utc::now(),
            state: Mutex::new(EntryState {
                last_used: Instant::now(),
                users: 0,
                retry_count: attempts.saturating_sub(1),
            }),
        }
    }

    fn is_idle_past(&self, threshold: Duration) -> bool {
        let state = self.state.lock();
        state.users == 0 && state.last_used.elapsed() > threshold
    }
}

/// A connection handed out by [`ConnectionPool::acquire`].
///
/// Dropping it does not release the entry; call [`ConnectionPool::release`]
/// (or [`ConnectionPool::invalidate`] when the connection turned out bad).
/// Both act only on the entry this connection came from.
pub struct PooledConnection<T> {
    identity: TargetIdentity,
    entry_id: String,
    transport: Arc<T>,
    reused: bool,
    dial_retries: u32,
}

impl<T> PooledConnection<T> {
    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// True when an existing pooled entry was handed out
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Failed dial attempts behind this handout (0 for a reused entry)
    pub fn dial_retries(&self) -> u32 {
        self.dial_retries
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.transport
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: ConnectionPoolConfig,
    entries: RwLock<HashMap<TargetIdentity, Arc<PoolEntry<C::Transport>>>>,
    dial_gates: DashMap<TargetIdentity, Arc<tokio::sync::Mutex<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionPool<C> {
    /// The maintenance task starts with the first `acquire`.
    pub fn new(connector: C, config: ConnectionPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            entries: RwLock::new(HashMap::new()),
            dial_gates: DashMap::new(),
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Live, authenticated connection for `config`'s target identity.
    ///
    /// An existing entry is probed first and replaced if dead. A new dial is
    /// retried per the pool's [`RetryPolicy`]. On error no pooled state for
    /// the identity is left behind.
    pub async fn acquire(
        self: &Arc<Self>,
        config: &ConnectionConfig,
    ) -> Result<PooledConnection<C::Transport>, SshError> {
        config.validate()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::shut_down_error());
        }
        self.ensure_maintenance();

        let identity = config.identity();
        let gate = self.gate(&identity);
        let wait = self.config.retry.worst_case(config.timeout()) + self.config.probe_timeout();
        let _dialing = tokio::time::timeout(wait, gate.lock())
            .await
            .map_err(|_| {
                SshError::Timeout(format!("waited {:?} for a connection to {}", wait, identity))
            })?;

        let existing = self.entries.read().get(&identity).cloned();
        if let Some(entry) = existing {
            match self.probe_entry(&entry).await {
                Ok(()) => {
                    debug!("Reusing pooled connection {} for {}", entry.id, identity);
                    return Ok(Self::hand_out(identity, &entry, true));
                }
                Err(e) => {
                    warn!(
                        "Pooled connection {} for {} failed its probe ({}), replacing",
                        entry.id, identity, e
                    );
                    if self.remove_entry(&identity, &entry) {
                        self.spawn_close(identity.clone(), entry);
                    }
                }
            }
        }

        self.check_capacity(&identity)?;

        let target = identity.to_string();
        let (transport, attempts) = retry_connect(&target, &self.config.retry, || {
            self.connector.connect(config)
        })
        .await?;

        let fresh = Arc::new(PoolEntry::new(transport, attempts));
        let installed = {
            let mut entries = self.entries.write();
            // shutdown() drains under this lock after setting `closed`
            if self.closed.load(Ordering::Acquire) {
                Err(fresh)
            } else {
                Ok(match entries.get(&identity) {
                    Some(winner) => (winner.clone(), Some(fresh)),
                    None => {
                        entries.insert(identity.clone(), fresh.clone());
                        (fresh, None)
                    }
                })
            }
        };
        let (entry, loser) = match installed {
            Ok(installed) => installed,
            Err(orphan) => {
                info!("Pool shut down while dialing {}, closing the new connection", identity);
                Self::close_entry(identity, orphan, self.config.probe_timeout()).await;
                return Err(Self::shut_down_error());
            }
        };
        if let Some(loser) = loser {
            debug!("Lost install race for {}, closing the extra connection", identity);
            self.spawn_close(identity.clone(), loser);
        }

        info!(
            "Pooled new connection {} for {} ({} attempt(s), auth: {})",
            entry.id,
            identity,
            attempts,
            entry.transport.auth_outcome()
        );
        Ok(Self::hand_out(identity, &entry, false))
    }

    /// Mark one use of `conn`'s entry finished. The connection stays open.
    ///
    /// A connection whose entry was already replaced leaves the pool
    /// untouched and reports [`ConnectionPoolError::Stale`].
    pub fn release(&self, conn: &PooledConnection<C::Transport>) -> Result<(), ConnectionPoolError> {
        let entry = self
            .entries
            .read()
            .get(&conn.identity)
            .cloned()
            .ok_or_else(|| ConnectionPoolError::NotFound(conn.identity.clone()))?;
        Self::check_handed_out(conn, &entry)?;

        let mut state = entry.state.lock();
        state.users = state.users.saturating_sub(1);
        state.last_used = Instant::now();
        debug!("Released {} (users: {})", conn.identity, state.users);
        Ok(())
    }

    /// Remove and close `conn`'s entry, e.g. after a caller saw it fail.
    ///
    /// A replacement entry installed since `conn` was handed out is kept.
    pub async fn invalidate(
        &self,
        conn: &PooledConnection<C::Transport>,
    ) -> Result<(), ConnectionPoolError> {
        let entry = {
            let mut entries = self.entries.write();
            let current = entries
                .get(&conn.identity)
                .ok_or_else(|| ConnectionPoolError::NotFound(conn.identity.clone()))?;
            Self::check_handed_out(conn, current)?;
            entries.remove(&conn.identity)
        };

        if let Some(entry) = entry {
            info!("Invalidating connection {} for {}", entry.id, conn.identity);
            Self::close_entry(conn.identity.clone(), entry, self.config.probe_timeout()).await;
        }
        Ok(())
    }

    /// Liveness probe of `conn`, bounded by the pool's probe timeout
    pub async fn probe(&self, conn: &PooledConnection<C::Transport>) -> Result<(), SshError> {
        self.bounded_probe(&conn.transport, &conn.entry_id).await
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read();
        let active = entries
            .values()
            .filter(|entry| entry.state.lock().users > 0)
            .count();

        PoolStats {
            total_connections: entries.len(),
            active_connections: active,
            idle_connections: entries.len() - active,
            max_idle_duration: self.config.idle_timeout(),
            health_check_interval: self.config.health_check_interval(),
        }
    }

    pub fn list_connections(&self) -> Vec<PooledConnectionInfo> {
        let entries = self.entries.read();
        let mut list: Vec<_> = entries
            .iter()
            .map(|(identity, entry)| {
                let state = entry.state.lock();
                PooledConnectionInfo {
                    id: entry.id.clone(),
                    identity: identity.clone(),
                    users: state.users,
                    idle_secs: state.last_used.elapsed().as_secs(),
                    auth_outcome: entry.transport.auth_outcome(),
                    created_at: entry.created_at,
                }
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn connection_count(&self) -> usize {
        self.entries.read().len()
    }

    /// One maintenance cycle: evict entries idle past the threshold, then
    /// probe the rest and evict those that fail, in use or not.
    pub async fn run_maintenance(&self) {
        let idle_timeout = self.config.idle_timeout();
        let snapshot: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.clone()))
            .collect();

        let mut closing = Vec::new();
        for (identity, entry) in snapshot {
            if entry.is_idle_past(idle_timeout) {
                let evicted = {
                    let mut entries = self.entries.write();
                    // Re-check: an acquire may have picked it up meanwhile
                    let still_idle = entry.is_idle_past(idle_timeout);
                    let current = entries
                        .get(&identity)
                        .is_some_and(|e| Arc::ptr_eq(e, &entry));
                    if still_idle && current {
                        entries.remove(&identity);
                    }
                    still_idle && current
                };
                if evicted {
                    info!("Evicting idle connection {} for {}", entry.id, identity);
                    closing.push(self.spawn_close(identity, entry));
                }
                continue;
            }

            if let Err(e) = self.probe_entry(&entry).await {
                warn!(
                    "Connection {} for {} failed its health check ({}), evicting",
                    entry.id, identity, e
                );
                if self.remove_entry(&identity, &entry) {
                    closing.push(self.spawn_close(identity, entry));
                }
            }
        }

        for handle in closing {
            let _ = handle.await;
        }

        let entries = self.entries.read();
        self.dial_gates
            .retain(|identity, gate| entries.contains_key(identity) || Arc::strong_count(gate) > 1);
    }

    /// Stop maintenance and close every pooled connection. Later `acquire`
    /// calls fail with a configuration error.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }

        let drained: Vec<_> = self.entries.write().drain().collect();
        info!("Shutting down connection pool ({} connection(s))", drained.len());
        for (identity, entry) in drained {
            Self::close_entry(identity, entry, self.config.probe_timeout()).await;
        }
        self.dial_gates.clear();
    }

    fn shut_down_error() -> SshError {
        SshError::InvalidConfig("connection pool has been shut down".to_string())
    }

    fn check_handed_out(
        conn: &PooledConnection<C::Transport>,
        entry: &PoolEntry<C::Transport>,
    ) -> Result<(), ConnectionPoolError> {
        if entry.id == conn.entry_id {
            Ok(())
        } else {
            Err(ConnectionPoolError::Stale {
                identity: conn.identity.clone(),
                entry_id: conn.entry_id.clone(),
            })
        }
    }

    async fn probe_entry(&self, entry: &PoolEntry<C::Transport>) -> Result<(), SshError> {
        self.bounded_probe(&entry.transport, &entry.id).await
    }

    /// The transport gets the timeout too, but a stalled one must not hold
    /// up the caller or the maintenance cycle.
    async fn bounded_probe(&self, transport: &C::Transport, entry_id: &str) -> Result<(), SshError> {
        let timeout = self.config.probe_timeout();
        tokio::time::timeout(timeout, transport.probe(timeout))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "liveness probe of connection {} exceeded {:?}",
                    entry_id, timeout
                ))
            })?
    }

    fn hand_out(
        identity: TargetIdentity,
        entry: &Arc<PoolEntry<C::Transport>>,
        reused: bool,
    ) -> PooledConnection<C::Transport> {
        let mut state = entry.state.lock();
        state.users += 1;
        state.last_used = Instant::now();
        let dial_retries = std::mem::take(&mut state.retry_count);

        PooledConnection {
            identity,
            entry_id: entry.id.clone(),
            transport: entry.transport.clone(),
            reused,
            dial_retries,
        }
    }

    fn gate(&self, identity: &TargetIdentity) -> Arc<tokio::sync::Mutex<()>> {
        self.dial_gates
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn check_capacity(&self, identity: &TargetIdentity) -> Result<(), SshError> {
        let max = self.config.max_connections;
        let entries = self.entries.read();
        if max > 0 && entries.len() >= max && !entries.contains_key(identity) {
            return Err(SshError::InvalidConfig(format!(
                "connection limit reached ({}/{}), cannot pool {}",
                entries.len(),
                max,
                identity
            )));
        }
        Ok(())
    }

    /// Remove `entry` if it is still the registered one for `identity`
    fn remove_entry(&self, identity: &TargetIdentity, entry: &Arc<PoolEntry<C::Transport>>) -> bool {
        let mut entries = self.entries.write();
        if entries
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(identity);
            true
        } else {
            false
        }
    }

    fn spawn_close(
        &self,
        identity: TargetIdentity,
        entry: Arc<PoolEntry<C::Transport>>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::close_entry(identity, entry, self.config.probe_timeout()))
    }

    /// Close in a separate task so a panicking transport only costs a log line.
    async fn close_entry(
        identity: TargetIdentity,
        entry: Arc<PoolEntry<C::Transport>>,
        timeout: Duration,
    ) {
        let transport = entry.transport.clone();
        let task = tokio::spawn(async move { transport.close().await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => debug!("Closed connection {} for {}", entry.id, identity),
            Ok(Ok(Err(e))) => warn!("Failed to close connection {} for {}: {}", entry.id, identity, e),
            Ok(Err(join_err)) => warn!(
                "Closing connection {} for {} aborted: {}",
                entry.id, identity, join_err
            ),
            Err(_) => warn!(
                "Closing connection {} for {} timed out after {:?}",
                entry.id, identity, timeout
            ),
        }
    }

    fn ensure_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        // shutdown() sets `closed` before taking the slot
        if slot.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        info!("Connection pool maintenance started (interval {:?})", period);

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    debug!("Connection pool dropped, maintenance stopped");
                    break;
                };
                pool.run_maintenance().await;
            }
        }));
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.abort();
        }
    }
}

static GLOBAL_POOL: OnceLock<Arc<ConnectionPool<SshConnector>>> = OnceLock::new();

/// Install the process-wide pool with `config`. Returns the existing pool
/// unchanged if one was already created.
pub fn init_global_pool(config: ConnectionPoolConfig) -> Arc<ConnectionPool<SshConnector>> {
    let mut installed = false;
    let pool = GLOBAL_POOL.get_or_init(|| {
        installed = true;
        ConnectionPool::new(SshConnector, config)
    });
    if !installed {
        warn!("Global connection pool already initialized, keeping its configuration");
    }
    pool.clone()
}

/// The process-wide pool, created with defaults on first use
pub fn global_pool() -> Arc<ConnectionPool<SshConnector>> {
    GLOBAL_POOL
        .get_or_init(|| ConnectionPool::new(SshConnector, ConnectionPoolConfig::default()))
        .clone()
}

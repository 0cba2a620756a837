use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Id used when callers do not name a connection
pub const DEFAULT_CONNECTION: &str = "default";

/// Configuration for ConnectionPool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// How long an inactive connection survives before it is reaped
    pub retention: Duration,
    /// Period of the background reaper
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }
}

/// A logical connection tracked by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledConnection {
    pub id: String,
    pub created_at: Instant,
    pub is_active: bool,
}

/// Connection counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
}

/// A small pool of logical connections keyed by id.
///
/// Released connections stay in the pool, inactive, until
/// [`ConnectionPool::cleanup_connections`] finds them older than the
/// retention window.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, PooledConnection>>,
    config: PoolConfig,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            config,
            reaper: parking_lot::Mutex::new(None),
        }
    }

    /// Returns the connection for `id`, creating it if needed, marked active
    pub fn get_connection(&self, id: &str) -> PooledConnection {
        let mut connections = self.connections.write();
        if let Some(connection) = connections.get_mut(id) {
            connection.is_active = true;
            return connection.clone();
        }

        let connection = PooledConnection {
            id: id.to_string(),
            created_at: Instant::now(),
            is_active: true,
        };
        connections.insert(id.to_string(), connection.clone());
        drop(connections);

        debug!("New connection created: {}", id);
        connection
    }

    /// Marks the connection inactive; it stays pooled until reaped
    pub fn release_connection(&self, id: &str) {
        if let Some(connection) = self.connections.write().get_mut(id) {
            connection.is_active = false;
            debug!("Connection released: {}", id);
        }
    }

    /// Drops the connection from the pool outright
    pub fn remove_connection(&self, id: &str) -> bool {
        let removed = self.connections.write().remove(id).is_some();
        if removed {
            debug!("Connection removed: {}", id);
        }
        removed
    }

    /// Acquires `id` for the lifetime of the returned lease; it stays pooled,
    /// inactive, after the lease drops
    pub fn acquire(&self, id: &str) -> ConnectionLease<'_> {
        let connection = self.get_connection(id);
        ConnectionLease {
            pool: self,
            connection,
            scoped: false,
        }
    }

    /// Acquires a single-use `id` that is removed from the pool when the
    /// lease drops, for ids that are never asked for again
    pub fn acquire_scoped(&self, id: &str) -> ConnectionLease<'_> {
        let connection = self.get_connection(id);
        ConnectionLease {
            pool: self,
            connection,
            scoped: true,
        }
    }

    /// Removes connections that are inactive and older than the retention window
    pub fn cleanup_connections(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;

        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|id, connection| {
            let expired = !connection.is_active && now.duration_since(connection.created_at) > retention;
            if expired {
                debug!("Cleaned up inactive connection: {}", id);
            }
            !expired
        });
        let removed = before - connections.len();
        drop(connections);

        if removed > 0 {
            info!("Connection cleanup: removed {} inactive connections", removed);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<PooledConnection> {
        self.connections.read().get(id).cloned()
    }

    pub fn stats(&self) -> PoolStats {
        Self::count(&self.connections.read())
    }

    /// Like [`stats`](Self::stats), but gives up after `wait` if the pool is locked
    pub fn try_stats(&self, wait: Duration) -> Option<PoolStats> {
        self.connections
            .try_read_for(wait)
            .map(|connections| Self::count(&connections))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawns the periodic reaper on the current tokio runtime
    pub fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let period = self.config.reap_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.cleanup_connections();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_connections(
        &self,
    ) -> parking_lot::RwLockWriteGuard<'_, HashMap<String, PooledConnection>> {
        self.connections.write()
    }

    fn count(connections: &HashMap<String, PooledConnection>) -> PoolStats {
        PoolStats {
            total: connections.len(),
            active: connections.values().filter(|c| c.is_active).count(),
        }
    }
}

/// Releases its connection when dropped, or removes it if scoped
#[derive(Debug)]
pub struct ConnectionLease<'a> {
    pool: &'a ConnectionPool,
    connection: PooledConnection,
    scoped: bool,
}

impl ConnectionLease<'_> {
    pub fn id(&self) -> &str {
        &self.connection.id
    }

    pub fn connection(&self) -> &PooledConnection {
        &self.connection
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if self.scoped {
            self.pool.remove_connection(&self.connection.id);
        } else {
            self.pool.release_connection(&self.connection.id);
        }
    }
}

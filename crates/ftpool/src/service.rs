//! Host-facing service: opaque connection handles and one-shot file
//! operations over a [`ConnectionPool`].
//!
//! Each file operation borrows a connection, runs a single command, and
//! then either returns the connection (success, or a plain server refusal)
//! or invalidates it (anything that leaves the session in doubt).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ftpool_core::ConnectionConfig;
use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::error::{ConnectPhase, PoolError, SessionError};
use crate::health::HealthManager;
use crate::pool::ConnectionPool;

pub struct FtpService {
    pool: Arc<ConnectionPool>,
    /// Borrowed connections keyed by handle.
    checked_out: Mutex<HashMap<u64, Connection>>,
    next_handle: AtomicU64,
}

impl FtpService {
    /// Build the pool for `config` and start its evictor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ConnectionConfig) -> Result<Self, PoolError> {
        let pool = ConnectionPool::connect(config)?;
        pool.start_evictor();
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            checked_out: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        self.pool.health()
    }

    // ── Handles ──────────────────────────────────────────────────────

    pub async fn borrow_connection(&self) -> Result<u64, PoolError> {
        let conn = self.pool.borrow().await?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(handle, conn_id = conn.id(), "handed out connection handle");
        self.checked_out.lock().await.insert(handle, conn);
        Ok(handle)
    }

    pub async fn return_connection(&self, handle: u64) -> Result<(), PoolError> {
        let conn = self.take(handle).await?;
        self.pool.return_connection(conn).await;
        Ok(())
    }

    /// Discard the connection behind `handle`.
    pub async fn disconnect(&self, handle: u64) -> Result<(), PoolError> {
        let conn = self.take(handle).await?;
        self.pool.invalidate(conn).await;
        Ok(())
    }

    /// Run `f` against the session behind `handle` while it stays checked out.
    pub async fn with_connection<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&Connection) -> T,
    ) -> Result<T, PoolError> {
        let checked_out = self.checked_out.lock().await;
        let conn = checked_out
            .get(&handle)
            .ok_or(PoolError::UnknownHandle(handle))?;
        Ok(f(conn))
    }

    async fn take(&self, handle: u64) -> Result<Connection, PoolError> {
        self.checked_out
            .lock()
            .await
            .remove(&handle)
            .ok_or(PoolError::UnknownHandle(handle))
    }

    // ── Probes and stats ─────────────────────────────────────────────

    /// Borrow a connection, health-check it, and give it back.
    pub async fn test_connection(&self) -> bool {
        let mut conn = match self.pool.borrow().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(host = %self.pool.config().host(), error = %e, "connection test failed");
                return false;
            }
        };
        let healthy = self.pool.health().is_healthy(&mut conn).await;
        if healthy {
            self.pool.return_connection(conn).await;
        } else {
            self.pool.invalidate(conn).await;
        }
        healthy
    }

    /// Pool counters plus handle and health-check totals.
    pub async fn connection_stats(&self) -> BTreeMap<&'static str, u64> {
        let mut stats = self.pool.stats().await.to_map();
        let summary = self.pool.health().summary().await;
        stats.insert("handles", self.checked_out.lock().await.len() as u64);
        stats.insert("health_checks", summary.checks);
        stats.insert("health_failures", summary.failures);
        stats
    }

    // ── File operations ──────────────────────────────────────────────

    pub async fn list(&self, path: &str) -> Result<Vec<String>, PoolError> {
        let mut conn = self.pool.borrow().await?;
        let result = conn.session_mut().list(path).await;
        self.finish(conn, "LIST", result).await
    }

    pub async fn retrieve(&self, path: &str) -> Result<Vec<u8>, PoolError> {
        let mut conn = self.pool.borrow().await?;
        let result = conn.session_mut().retrieve(path).await;
        self.finish(conn, "RETR", result).await
    }

    pub async fn store(&self, path: &str, data: &[u8]) -> Result<u64, PoolError> {
        let mut conn = self.pool.borrow().await?;
        let result = conn.session_mut().store(path, data).await;
        self.finish(conn, "STOR", result).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), PoolError> {
        let mut conn = self.pool.borrow().await?;
        let result = conn.session_mut().delete(path).await;
        self.finish(conn, "DELE", result).await
    }

    async fn finish<T>(
        &self,
        conn: Connection,
        command: &'static str,
        result: Result<T, SessionError>,
    ) -> Result<T, PoolError> {
        match result {
            Ok(value) => {
                self.pool.return_connection(conn).await;
                Ok(value)
            }
            Err(SessionError::Reply { code, text }) if conn.session().is_connected() => {
                tracing::debug!(conn_id = conn.id(), command, code, "server refused command");
                self.pool.return_connection(conn).await;
                Err(PoolError::Rejected {
                    command,
                    code,
                    text,
                })
            }
            Err(e) => {
                tracing::warn!(conn_id = conn.id(), command, error = %e, "transfer failed, invalidating connection");
                self.pool.invalidate(conn).await;
                Err(PoolError::Connect(e.into_connect(ConnectPhase::Transfer)))
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Shut the pool down and destroy connections still held by handles.
    /// Returns how many handles were outstanding.
    pub async fn shutdown(&self) -> usize {
        self.pool.shutdown().await;
        let held: Vec<Connection> = self
            .checked_out
            .lock()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        let outstanding = held.len();
        for conn in held {
            self.pool.return_connection(conn).await;
        }
        if outstanding > 0 {
            tracing::info!(outstanding, "released outstanding handles at shutdown");
        }
        outstanding
    }
}

impl std::fmt::Debug for FtpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpService")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

//! Connection pool: bounded, validated, exclusively borrowed FTP sessions.
//!
//! # Accounting
//!
//! ```text
//! semaphore (max_total permits)
//!   held by: active connections (owned permit inside the connection's lease)
//!            borrowers in flight (idle pop / create / validate)
//!            idle connections taken out for an eviction health test
//! idle connections hold no permit
//! ```
//!
//! The pool keeps `idle <= available permits`: borrowers only create while
//! the idle set is empty, and a return releases the lease together with the
//! idle entry. Every live connection is either idle or backed by a held
//! permit, so `idle + active <= max_total` holds at all times. A borrowed
//! connection that is dropped, or whose return is cancelled, releases its
//! lease on drop. All bookkeeping goes
//! through one `Mutex<PoolInner>`; network I/O (create, validate, destroy)
//! always runs with the lock released.
//!
//! Borrowing is LIFO (most recently returned first) so hot connections stay
//! hot; eviction walks the idle set oldest-first.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use ftpool_core::{ConfigError, ConnectionConfig, PoolSettings};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{Connection, Lease};
use crate::error::{ConnectError, ConnectPhase, PoolError};
use crate::health::HealthManager;
use crate::manager::{ConnectionFactory, ConnectionManager};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool-wide lifecycle. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Running => write!(f, "running"),
            PoolState::ShuttingDown => write!(f, "shutting down"),
            PoolState::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently borrowed.
    pub active: usize,
    /// Connections available for borrowing.
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub invalidated: u64,
    pub evicted: u64,
    pub validation_failures: u64,
    /// Borrows that found no free capacity and had to wait.
    pub wait_count: u64,
    pub wait_timeouts: u64,
    pub total_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl PoolStats {
    /// Named counters for hosts that want a flat mapping.
    pub fn to_map(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("active", self.active as u64),
            ("idle", self.idle as u64),
            ("created", self.created),
            ("destroyed", self.destroyed),
            ("borrowed", self.borrowed),
            ("returned", self.returned),
            ("invalidated", self.invalidated),
            ("evicted", self.evicted),
            ("validation_failures", self.validation_failures),
            ("wait_count", self.wait_count),
            ("wait_timeouts", self.wait_timeouts),
            ("total_wait_ms", self.total_wait_ms),
            ("max_wait_ms", self.max_wait_ms),
        ])
    }
}

/// Result of one eviction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub inspected: usize,
    /// Evicted for exceeding the minimum evictable idle time.
    pub evicted_idle: usize,
    /// Evicted for failing a while-idle health check.
    pub evicted_unhealthy: usize,
}

impl EvictionReport {
    pub fn evicted(&self) -> usize {
        self.evicted_idle + self.evicted_unhealthy
    }
}

struct PoolInner {
    /// Front is the longest idle.
    idle: VecDeque<Connection>,
    state: PoolState,
    stats: PoolStats,
}

enum Next {
    Idle(Connection),
    Create,
}

/// Bounded pool of FTP connections.
pub struct ConnectionPool {
    id: u64,
    config: Arc<ConnectionConfig>,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    health: Arc<HealthManager>,
    inner: Mutex<PoolInner>,
    permits: Arc<Semaphore>,
    /// Outstanding leases.
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    evictor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: Arc<ConnectionConfig>,
        factory: Arc<dyn ConnectionFactory>,
        health: Arc<HealthManager>,
    ) -> Arc<Self> {
        let settings = config.pool().clone();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            permits: Arc::new(Semaphore::new(settings.max_total)),
            active: Arc::new(AtomicUsize::new(0)),
            settings,
            config,
            factory,
            health,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                state: PoolState::Running,
                stats: PoolStats::default(),
            }),
            shutdown_tx,
            evictor: std::sync::Mutex::new(None),
        })
    }

    /// Pool over the real TCP/TLS session layer.
    pub fn connect(config: ConnectionConfig) -> Result<Arc<Self>, ConfigError> {
        let config = Arc::new(config);
        let manager = ConnectionManager::new(config.clone())?;
        let health = Arc::new(HealthManager::new(*config.health()));
        Ok(Self::new(config, Arc::new(manager), health))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    pub async fn state(&self) -> PoolState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            active: self.active.load(Ordering::SeqCst),
            idle: inner.idle.len(),
            ..inner.stats.clone()
        }
    }

    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            pool_id = self.id,
            host = %self.config.host(),
            active = stats.active,
            idle = stats.idle,
            created = stats.created,
            destroyed = stats.destroyed,
            wait_count = stats.wait_count,
            wait_timeouts = stats.wait_timeouts,
            max_wait_ms = stats.max_wait_ms,
            "pool statistics"
        );
    }

    // ── Borrow ───────────────────────────────────────────────────────

    /// Borrow with the configured `max_wait`.
    pub async fn borrow(&self) -> Result<Connection, PoolError> {
        self.borrow_timeout(self.settings.max_wait).await
    }

    /// Borrow a validated connection, waiting up to `timeout` for capacity.
    pub async fn borrow_timeout(&self, timeout: Duration) -> Result<Connection, PoolError> {
        self.ensure_running().await?;
        let permit = self.acquire_permit(timeout).await?;

        let mut fresh_failures = 0;
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                if inner.state != PoolState::Running {
                    return Err(PoolError::State(inner.state));
                }
                match inner.idle.pop_back() {
                    Some(conn) => Next::Idle(conn),
                    None => Next::Create,
                }
            };

            let (mut conn, fresh) = match next {
                Next::Idle(conn) => (conn, false),
                Next::Create => {
                    let conn = self.factory.create().await.map_err(|e| {
                        tracing::debug!(
                            host = %self.config.host(),
                            phase = %e.phase,
                            error = %e.message,
                            "connection creation failed"
                        );
                        PoolError::Connect(e)
                    })?;
                    let state = {
                        let mut inner = self.inner.lock().await;
                        inner.stats.created += 1;
                        inner.state
                    };
                    if state != PoolState::Running {
                        self.destroy(conn).await;
                        return Err(PoolError::State(state));
                    }
                    (conn, true)
                }
            };

            if self.settings.test_on_borrow && !self.health.is_healthy(&mut conn).await {
                let id = conn.id();
                self.inner.lock().await.stats.validation_failures += 1;
                tracing::warn!(conn_id = id, fresh, "discarding unhealthy connection on borrow");
                self.destroy(conn).await;
                if fresh {
                    fresh_failures += 1;
                    if fresh_failures >= self.settings.max_borrow_attempts {
                        return Err(PoolError::Connect(ConnectError::new(
                            ConnectPhase::Validate,
                            format!(
                                "{fresh_failures} freshly created connections to {} failed validation",
                                self.config.address()
                            ),
                        )));
                    }
                }
                continue;
            }

            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running {
                let state = inner.state;
                drop(inner);
                self.destroy(conn).await;
                return Err(PoolError::State(state));
            }
            inner.stats.borrowed += 1;
            conn.mark_borrowed(self.id, Instant::now());
            conn.attach_lease(Lease::new(self.id, permit, Arc::clone(&self.active)));
            tracing::debug!(
                conn_id = conn.id(),
                reused = !fresh,
                active = self.active.load(Ordering::SeqCst),
                idle = inner.idle.len(),
                "borrowed connection"
            );
            return Ok(conn);
        }
    }

    async fn ensure_running(&self) -> Result<(), PoolError> {
        match self.state().await {
            PoolState::Running => Ok(()),
            state => Err(PoolError::State(state)),
        }
    }

    async fn acquire_permit(&self, timeout: Duration) -> Result<OwnedSemaphorePermit, PoolError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(PoolError::State(self.state().await)),
            Err(TryAcquireError::NoPermits) => {}
        }

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await;
        let waited = started.elapsed();
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);

        let mut inner = self.inner.lock().await;
        inner.stats.wait_count += 1;
        inner.stats.total_wait_ms = inner.stats.total_wait_ms.saturating_add(waited_ms);
        inner.stats.max_wait_ms = inner.stats.max_wait_ms.max(waited_ms);
        match result {
            Ok(Ok(permit)) => Ok(permit),
            // Closed by shutdown.
            Ok(Err(_)) => Err(PoolError::State(inner.state)),
            Err(_) => {
                inner.stats.wait_timeouts += 1;
                tracing::warn!(
                    host = %self.config.host(),
                    max_total = self.settings.max_total,
                    waited = ?waited,
                    "connection pool exhausted"
                );
                Err(PoolError::Exhausted {
                    max_total: self.settings.max_total,
                    waited,
                })
            }
        }
    }

    // ── Return / invalidate ──────────────────────────────────────────

    /// Hand a borrowed connection back.
    ///
    /// Connections without a lease from this pool, and anything returned
    /// after shutdown, are destroyed. The lease stays with the connection
    /// until the return health check completes, so cancelling this future
    /// still frees the slot.
    pub async fn return_connection(&self, mut conn: Connection) {
        let id = conn.id();
        if conn.lease_pool_id() != Some(self.id) {
            tracing::debug!(conn_id = id, "destroying connection not borrowed from this pool");
            let lease = conn.take_lease();
            self.destroy(conn).await;
            drop(lease);
            return;
        }
        let state = self.state().await;
        if state != PoolState::Running {
            tracing::debug!(conn_id = id, state = %state, "destroying connection returned after shutdown");
            let lease = conn.take_lease();
            self.destroy(conn).await;
            drop(lease);
            return;
        }

        if self.settings.test_on_return && !self.health.is_healthy(&mut conn).await {
            self.inner.lock().await.stats.validation_failures += 1;
            tracing::warn!(conn_id = id, "discarding unhealthy connection on return");
            let lease = conn.take_lease();
            self.destroy(conn).await;
            drop(lease);
            return;
        }

        let lease = conn.take_lease();
        let mut inner = self.inner.lock().await;
        if inner.state != PoolState::Running || inner.idle.len() >= self.settings.max_idle {
            let idle = inner.idle.len();
            drop(inner);
            tracing::debug!(conn_id = id, idle, max_idle = self.settings.max_idle, "idle set full, destroying returned connection");
            self.destroy(conn).await;
            drop(lease);
            return;
        }
        conn.mark_idle(self.id, Instant::now());
        inner.idle.push_back(conn);
        inner.stats.returned += 1;
        drop(lease);
        tracing::debug!(
            conn_id = id,
            active = self.active.load(Ordering::SeqCst),
            idle = inner.idle.len(),
            "returned connection to pool"
        );
    }

    /// Discard a borrowed connection without any health check.
    pub async fn invalidate(&self, mut conn: Connection) {
        let id = conn.id();
        let lease = conn.take_lease();
        let tracked = lease.as_ref().is_some_and(|l| l.pool_id() == self.id);
        if tracked {
            self.inner.lock().await.stats.invalidated += 1;
        }
        tracing::debug!(conn_id = id, tracked, "invalidating connection");
        self.destroy(conn).await;
        drop(lease);
    }

    async fn destroy(&self, conn: Connection) {
        self.factory.destroy(conn).await;
        self.inner.lock().await.stats.destroyed += 1;
    }

    // ── Warm-up ──────────────────────────────────────────────────────

    /// Create connections until `min_idle` are idle, never exceeding
    /// `max_total`. Returns how many were created.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        loop {
            // Capacity for a new idle connection is a free permit.
            let permit = match self.permits.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => return Err(PoolError::State(self.state().await)),
            };
            {
                let inner = self.inner.lock().await;
                if inner.state != PoolState::Running {
                    return Err(PoolError::State(inner.state));
                }
                if inner.idle.len() >= self.settings.min_idle
                    || inner.idle.len() > self.permits.available_permits()
                {
                    break;
                }
            }

            let mut conn = self.factory.create().await?;
            let mut inner = self.inner.lock().await;
            inner.stats.created += 1;
            if inner.state != PoolState::Running
                || inner.idle.len() >= self.settings.max_idle
                || inner.idle.len() > self.permits.available_permits()
            {
                drop(inner);
                self.destroy(conn).await;
                break;
            }
            conn.mark_idle(self.id, Instant::now());
            inner.idle.push_back(conn);
            drop(inner);
            drop(permit);
            created += 1;
        }
        tracing::info!(
            host = %self.config.host(),
            min_idle = self.settings.min_idle,
            warmed = created,
            "connection pool warmed"
        );
        Ok(created)
    }

    // ── Eviction ─────────────────────────────────────────────────────

    /// Run one eviction pass over the oldest idle connections.
    pub async fn evict_now(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut evict = Vec::new();
        let mut to_test = Vec::new();
        let now = Instant::now();

        {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running {
                return report;
            }
            let n = self.settings.tests_per_eviction_run.min(inner.idle.len());
            let batch: Vec<Connection> = inner.idle.drain(..n).collect();
            let mut remaining = inner.idle.len() + batch.len();
            let mut kept = Vec::new();
            report.inspected = batch.len();

            for conn in batch {
                let idle_for = now.saturating_duration_since(conn.idle_since());
                if idle_for >= self.settings.min_evictable_idle && remaining > self.settings.min_idle {
                    remaining -= 1;
                    evict.push(conn);
                } else if self.settings.test_while_idle {
                    // Testing takes the connection out of the idle set; a
                    // permit keeps it counted against max_total meanwhile.
                    match self.permits.try_acquire() {
                        Ok(permit) => {
                            remaining -= 1;
                            to_test.push((conn, permit));
                        }
                        Err(_) => kept.push(conn),
                    }
                } else {
                    kept.push(conn);
                }
            }
            for conn in kept.into_iter().rev() {
                inner.idle.push_front(conn);
            }
            inner.stats.evicted += evict.len() as u64;
        }

        report.evicted_idle = evict.len();
        for conn in evict {
            tracing::debug!(conn_id = conn.id(), "evicting idle connection");
            self.destroy(conn).await;
        }

        for (mut conn, permit) in to_test {
            if !self.health.is_healthy(&mut conn).await {
                {
                    let mut inner = self.inner.lock().await;
                    inner.stats.validation_failures += 1;
                    inner.stats.evicted += 1;
                }
                tracing::warn!(conn_id = conn.id(), "evicting unhealthy idle connection");
                self.destroy(conn).await;
                report.evicted_unhealthy += 1;
                continue;
            }
            let mut inner = self.inner.lock().await;
            if inner.state == PoolState::Running && inner.idle.len() < self.settings.max_idle {
                inner.idle.push_front(conn);
            } else {
                drop(inner);
                self.destroy(conn).await;
            }
            drop(permit);
        }

        if report.evicted() > 0 {
            tracing::info!(
                host = %self.config.host(),
                inspected = report.inspected,
                evicted_idle = report.evicted_idle,
                evicted_unhealthy = report.evicted_unhealthy,
                "eviction pass complete"
            );
        } else {
            tracing::debug!(inspected = report.inspected, "eviction pass found nothing to evict");
        }
        report
    }

    /// Spawn the background evictor. No-op when eviction is disabled or the
    /// evictor is already running. Must be called inside a tokio runtime.
    pub fn start_evictor(self: &Arc<Self>) {
        let Some(period) = self.settings.eviction_interval else {
            return;
        };
        let mut slot = self.evictor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || *self.shutdown_tx.borrow() {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.evict_now().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("evictor stopped");
        }));
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop the evictor and destroy every idle connection. Borrowed
    /// connections are destroyed as they come back. Idempotent.
    pub async fn shutdown(&self) {
        let idle: Vec<Connection> = {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running {
                return;
            }
            inner.state = PoolState::ShuttingDown;
            inner.idle.drain(..).collect()
        };
        tracing::info!(
            host = %self.config.host(),
            idle = idle.len(),
            "connection pool shutting down"
        );

        // Wake every waiting borrower; they observe the state and fail.
        self.permits.close();
        let _ = self.shutdown_tx.send(true);
        let evictor = self
            .evictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = evictor {
            let _ = handle.await;
        }

        for conn in idle {
            self.destroy(conn).await;
        }

        let mut inner = self.inner.lock().await;
        inner.state = PoolState::Shutdown;
        tracing::info!(
            still_active = self.active.load(Ordering::SeqCst),
            destroyed = inner.stats.destroyed,
            "connection pool shut down"
        );
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("host", &self.config.host())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use ftpool_core::HealthSettings;

    use super::*;
    use crate::manager::mock::MockFactory;

    fn settings() -> PoolSettings {
        PoolSettings {
            max_total: 3,
            max_idle: 3,
            min_idle: 0,
            max_wait: Duration::from_millis(200),
            eviction_interval: None,
            min_evictable_idle: Duration::from_secs(60),
            tests_per_eviction_run: 3,
            test_on_borrow: true,
            test_on_return: false,
            test_while_idle: false,
            max_borrow_attempts: 3,
        }
    }

    fn make_pool(settings: PoolSettings) -> (Arc<ConnectionPool>, Arc<MockFactory>) {
        let config = ConnectionConfig::builder("ftp.example.com", "alice", "secret")
            .pool(settings)
            .build()
            .unwrap();
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionPool::new(
            Arc::new(config),
            factory.clone(),
            Arc::new(HealthManager::new(HealthSettings::default())),
        );
        (pool, factory)
    }

    async fn assert_bounded(pool: &ConnectionPool) {
        let stats = pool.stats().await;
        assert!(
            stats.active + stats.idle <= pool.settings.max_total,
            "active {} + idle {} exceeds max_total {}",
            stats.active,
            stats.idle,
            pool.settings.max_total
        );
        assert!(stats.idle <= pool.settings.max_idle);
    }

    // ── Borrow / return ──────────────────────────────────────────────

    #[tokio::test]
    async fn borrow_creates_and_return_idles() {
        let (pool, factory) = make_pool(settings());

        let conn = pool.borrow().await.unwrap();
        assert_eq!(conn.pool_id(), Some(pool.id()));
        assert_eq!(conn.borrow_count(), 1);
        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle, stats.created), (1, 0, 1));

        pool.return_connection(conn).await;
        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle, stats.returned), (0, 1, 1));
        assert_eq!(factory.creates(), 1);
    }

    #[tokio::test]
    async fn idle_connection_is_reused_lifo() {
        let (pool, factory) = make_pool(settings());
        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        let b_id = b.id();
        pool.return_connection(a).await;
        pool.return_connection(b).await;

        let again = pool.borrow().await.unwrap();
        assert_eq!(again.id(), b_id, "most recently returned goes out first");
        assert_eq!(again.borrow_count(), 2);
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test]
    async fn counts_stay_bounded_through_a_borrow_return_sequence() {
        let (pool, _) = make_pool(PoolSettings {
            max_idle: 2,
            ..settings()
        });
        let mut held = Vec::new();
        for round in 0..4 {
            while held.len() < 3 {
                held.push(pool.borrow().await.unwrap());
                assert_bounded(&pool).await;
            }
            for _ in 0..(1 + round % 3) {
                if let Some(conn) = held.pop() {
                    pool.return_connection(conn).await;
                    assert_bounded(&pool).await;
                }
            }
            while held.len() > 1 {
                let conn = held.remove(0);
                pool.return_connection(conn).await;
                assert_bounded(&pool).await;
            }
        }
    }

    #[tokio::test]
    async fn return_beyond_max_idle_destroys() {
        let (pool, factory) = make_pool(PoolSettings {
            max_idle: 1,
            ..settings()
        });
        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.return_connection(a).await;
        pool.return_connection(b).await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(factory.destroys(), 1);

        // The destroyed slot is usable again.
        let _x = pool.borrow().await.unwrap();
        let _y = pool.borrow().await.unwrap();
        let _z = pool.borrow().await.unwrap();
    }

    // ── Validation ───────────────────────────────────────────────────

    #[tokio::test]
    async fn unhealthy_fresh_connection_is_replaced_once() {
        let (pool, factory) = make_pool(settings());
        factory.unhealthy_next.store(1, Ordering::SeqCst);

        let conn = pool.borrow().await.unwrap();
        assert!(conn.session().is_connected());
        assert_eq!(factory.creates(), 2);
        assert_eq!(factory.destroys(), 1);

        let stats = pool.stats().await;
        assert_eq!(stats.validation_failures, 1);
        assert_eq!((stats.active, stats.idle), (1, 0));
    }

    #[tokio::test]
    async fn unreachable_backend_caps_recreate_loop() {
        let (pool, factory) = make_pool(settings());
        factory.unhealthy_next.store(100, Ordering::SeqCst);

        let err = pool.borrow().await.unwrap_err();
        match err {
            PoolError::Connect(e) => assert_eq!(e.phase, ConnectPhase::Validate),
            other => panic!("expected validate failure, got {other:?}"),
        }
        assert_eq!(factory.creates(), 3);
        assert_eq!(factory.destroys(), 3);

        // Permit was released: a later borrow can proceed.
        factory.unhealthy_next.store(0, Ordering::SeqCst);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_idle_connection_is_discarded_on_borrow() {
        let (pool, factory) = make_pool(settings());
        let conn = pool.borrow().await.unwrap();
        let stale_id = conn.id();
        pool.return_connection(conn).await;
        factory.controls.lock().unwrap()[0]
            .disconnected
            .store(true, Ordering::SeqCst);

        let conn = pool.borrow().await.unwrap();
        assert_ne!(conn.id(), stale_id);
        assert_eq!(factory.destroyed_ids.lock().unwrap().as_slice(), &[stale_id]);
    }

    #[tokio::test]
    async fn validation_skipped_when_disabled() {
        let (pool, factory) = make_pool(PoolSettings {
            test_on_borrow: false,
            ..settings()
        });
        factory.unhealthy_next.store(1, Ordering::SeqCst);
        let conn = pool.borrow().await.unwrap();
        assert!(!conn.session().is_connected());
        assert_eq!(factory.creates(), 1);
    }

    #[tokio::test]
    async fn unhealthy_return_is_destroyed_when_testing_on_return() {
        let (pool, factory) = make_pool(PoolSettings {
            test_on_return: true,
            ..settings()
        });
        let conn = pool.borrow().await.unwrap();
        factory.controls.lock().unwrap()[0]
            .noop_fails
            .store(true, Ordering::SeqCst);
        pool.return_connection(conn).await;

        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle), (0, 0));
        assert_eq!(factory.destroys(), 1);
    }

    #[tokio::test]
    async fn creation_failure_surfaces_and_frees_capacity() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            ..settings()
        });
        factory.fail.store(true, Ordering::SeqCst);
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(ref e) if e.phase == ConnectPhase::Connect));
        assert!(err.is_transient());

        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.borrow().await.is_ok());
    }

    // ── Exhaustion ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out_with_counts_unchanged() {
        let (pool, _) = make_pool(PoolSettings {
            max_total: 2,
            max_idle: 2,
            ..settings()
        });
        let _a = pool.borrow().await.unwrap();
        let _b = pool.borrow().await.unwrap();
        let before = pool.stats().await;

        let started = Instant::now();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max_total: 2, .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let after = pool.stats().await;
        assert_eq!((after.active, after.idle, after.created), (before.active, before.idle, before.created));
        assert_eq!(after.wait_timeouts, 1);
        assert_eq!(after.wait_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_borrower_gets_returned_connection() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            max_wait: Duration::from_secs(10),
            ..settings()
        });
        let held = pool.borrow().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.return_connection(held).await;

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), held_id);
        assert_eq!(factory.creates(), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.wait_count, 1);
        assert!(stats.max_wait_ms >= 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_borrow_return_never_fails() {
        let (pool, factory) = make_pool(PoolSettings {
            max_wait: Duration::from_secs(10),
            ..settings()
        });

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let conn = pool.borrow().await?;
                    tokio::task::yield_now().await;
                    pool.return_connection(conn).await;
                }
                Ok::<_, PoolError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert!(stats.idle <= 3);
        assert!(factory.creates() <= 3);
        assert_eq!(stats.borrowed, 400);
        assert_eq!(stats.returned, 400);
    }

    // ── Invalidate / foreign returns ─────────────────────────────────

    #[tokio::test]
    async fn invalidate_destroys_and_frees_capacity() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            ..settings()
        });
        let conn = pool.borrow().await.unwrap();
        pool.invalidate(conn).await;

        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle, stats.invalidated), (0, 0, 1));
        assert_eq!(factory.destroys(), 1);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn foreign_connection_is_destroyed_and_frees_its_owner() {
        let (pool, factory) = make_pool(settings());
        let (other, _) = make_pool(settings());
        let _mine = pool.borrow().await.unwrap();
        let foreign = other.borrow().await.unwrap();

        let before = pool.stats().await;
        pool.return_connection(foreign).await;
        let after = pool.stats().await;
        assert_eq!((after.active, after.idle, after.returned), (before.active, before.idle, before.returned));
        assert_eq!(factory.destroys(), 1);
        // The lease went away with the destroyed connection.
        assert_eq!(other.stats().await.active, 0);
    }

    // ── Dropped and cancelled borrows ────────────────────────────────

    #[tokio::test]
    async fn dropped_borrowed_connection_frees_its_slot() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            ..settings()
        });
        let conn = pool.borrow().await.unwrap();
        assert!(conn.is_borrowed());
        drop(conn);

        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle), (0, 0));
        let again = pool.borrow().await.unwrap();
        assert_eq!(factory.creates(), 2);
        pool.return_connection(again).await;
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_operation_frees_its_slot() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            test_on_borrow: false,
            ..settings()
        });
        let work = async {
            let mut conn = pool.borrow().await?;
            factory.controls.lock().unwrap()[0]
                .noop_hangs
                .store(true, Ordering::SeqCst);
            let _ = conn.session_mut().noop().await;
            pool.return_connection(conn).await;
            Ok::<_, PoolError>(())
        };
        assert!(tokio::time::timeout(Duration::from_secs(1), work).await.is_err());

        assert_eq!(pool.stats().await.active, 0);
        assert!(pool.borrow().await.is_ok());
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_return_during_health_check_frees_its_slot() {
        let (pool, factory) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            test_on_return: true,
            ..settings()
        });
        let conn = pool.borrow().await.unwrap();
        factory.controls.lock().unwrap()[0]
            .noop_hangs
            .store(true, Ordering::SeqCst);

        let returned =
            tokio::time::timeout(Duration::from_secs(1), pool.return_connection(conn)).await;
        assert!(returned.is_err());

        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle, stats.returned), (0, 0, 0));
        let conn = pool.borrow().await.unwrap();
        assert!(conn.session().is_connected());
        assert_eq!(factory.creates(), 2);
    }

    // ── Eviction ─────────────────────────────────────────────────────

    async fn fill_idle(pool: &ConnectionPool, n: usize) -> Vec<u64> {
        let mut conns = Vec::new();
        for _ in 0..n {
            conns.push(pool.borrow().await.unwrap());
        }
        let mut ids = Vec::new();
        for conn in conns {
            ids.push(conn.id());
            pool.return_connection(conn).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_respects_min_idle_and_evicts_oldest_first() {
        let (pool, factory) = make_pool(PoolSettings {
            min_idle: 1,
            ..settings()
        });
        let ids = fill_idle(&pool, 3).await;
        tokio::time::advance(Duration::from_secs(120)).await;

        let report = pool.evict_now().await;
        assert_eq!(report.inspected, 3);
        assert_eq!(report.evicted_idle, 2);
        assert_eq!(pool.stats().await.idle, 1);
        assert_eq!(factory.destroyed_ids.lock().unwrap().as_slice(), &ids[..2]);

        let survivor = pool.borrow().await.unwrap();
        assert_eq!(survivor.id(), ids[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn young_idle_connections_are_kept() {
        let (pool, factory) = make_pool(settings());
        fill_idle(&pool, 3).await;

        let report = pool.evict_now().await;
        assert_eq!(report.evicted(), 0);
        assert_eq!(pool.stats().await.idle, 3);
        assert_eq!(factory.destroys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_inspects_at_most_tests_per_run() {
        let (pool, _) = make_pool(PoolSettings {
            tests_per_eviction_run: 2,
            ..settings()
        });
        fill_idle(&pool, 3).await;
        tokio::time::advance(Duration::from_secs(120)).await;

        let report = pool.evict_now().await;
        assert_eq!(report.inspected, 2);
        assert_eq!(report.evicted_idle, 2);
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_idle_evicted_below_floor() {
        let (pool, factory) = make_pool(PoolSettings {
            min_idle: 2,
            max_idle: 3,
            test_while_idle: true,
            ..settings()
        });
        let ids = fill_idle(&pool, 2).await;
        factory.controls.lock().unwrap()[0]
            .noop_fails
            .store(true, Ordering::SeqCst);

        let report = pool.evict_now().await;
        assert_eq!(report.evicted_unhealthy, 1);
        assert_eq!(report.evicted_idle, 0);
        assert_eq!(pool.stats().await.idle, 1);
        assert_eq!(factory.destroyed_ids.lock().unwrap().as_slice(), &ids[..1]);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_never_touches_active_connections() {
        let (pool, factory) = make_pool(settings());
        let held = pool.borrow().await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        let report = pool.evict_now().await;
        assert_eq!(report.inspected, 0);
        assert_eq!(factory.destroys(), 0);
        pool.return_connection(held).await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_evictor_runs_on_interval() {
        let (pool, factory) = make_pool(PoolSettings {
            eviction_interval: Some(Duration::from_secs(30)),
            min_evictable_idle: Duration::from_secs(10),
            ..settings()
        });
        fill_idle(&pool, 2).await;
        pool.start_evictor();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(factory.destroys(), 2);
        pool.shutdown().await;
    }

    // ── Warm-up ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn warm_up_fills_to_min_idle() {
        let (pool, factory) = make_pool(PoolSettings {
            min_idle: 2,
            ..settings()
        });
        assert_eq!(pool.warm_up().await.unwrap(), 2);
        assert_eq!(pool.stats().await.idle, 2);
        assert_eq!(pool.warm_up().await.unwrap(), 0);
        assert_eq!(factory.creates(), 2);
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_destroys_idle_and_rejects_borrow() {
        let (pool, factory) = make_pool(settings());
        fill_idle_now(&pool, 2).await;
        let held = pool.borrow().await.unwrap();

        pool.shutdown().await;
        assert_eq!(pool.state().await, PoolState::Shutdown);
        assert_eq!(factory.destroys(), 1);

        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, PoolError::State(PoolState::Shutdown)));
        assert_eq!(err.to_string(), "connection pool is shut down");

        pool.return_connection(held).await;
        assert_eq!(factory.destroys(), 2);
        let stats = pool.stats().await;
        assert_eq!((stats.active, stats.idle), (0, 0));

        // Idempotent.
        pool.shutdown().await;
        assert_eq!(factory.destroys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_waiting_borrowers() {
        let (pool, _) = make_pool(PoolSettings {
            max_total: 1,
            max_idle: 1,
            max_wait: Duration::from_secs(3600),
            ..settings()
        });
        let held = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await })
        };
        tokio::task::yield_now().await;

        pool.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::State(_)));
        pool.return_connection(held).await;
    }

    #[tokio::test]
    async fn connection_created_during_shutdown_is_destroyed() {
        let (pool, factory) = make_pool(settings());
        let gate = Arc::new(tokio::sync::Notify::new());
        *factory.create_gate.lock().unwrap() = Some(gate.clone());

        let borrower = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await })
        };
        while factory.creates() == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown().await;
        assert_eq!(factory.destroys(), 0);
        gate.notify_one();

        let err = borrower.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::State(_)), "{err:?}");
        assert_eq!(factory.destroys(), 1);
        assert_eq!(
            factory.controls.lock().unwrap()[0].closes.load(Ordering::SeqCst),
            1
        );
        let stats = pool.stats().await;
        assert_eq!(stats.active + stats.idle, 0);
        assert_eq!((stats.created, stats.destroyed, stats.borrowed), (1, 1, 0));
    }

    #[tokio::test]
    async fn connection_validated_during_shutdown_is_destroyed() {
        let (pool, factory) = make_pool(settings());
        let conn = pool.borrow().await.unwrap();
        let id = conn.id();
        pool.return_connection(conn).await;

        let controls = factory.controls.lock().unwrap()[0].clone();
        let noops = controls.noops.load(Ordering::SeqCst);
        controls.noop_hangs.store(true, Ordering::SeqCst);

        let borrower = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await })
        };
        while controls.noops.load(Ordering::SeqCst) == noops {
            tokio::task::yield_now().await;
        }

        // The connection under validation is out of the idle set.
        pool.shutdown().await;
        assert_eq!(factory.destroys(), 0);
        controls.noop_release.notify_one();

        let err = borrower.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::State(_)), "{err:?}");
        assert_eq!(factory.destroyed_ids.lock().unwrap().as_slice(), &[id]);
        let stats = pool.stats().await;
        assert_eq!(stats.active + stats.idle, 0);
        assert_eq!((stats.validation_failures, stats.borrowed), (0, 1));
    }

    #[test]
    fn largest_configurable_pool_fits_the_semaphore() {
        assert!(ftpool_core::MAX_POOL_SIZE <= Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn stats_map_has_every_counter() {
        let (pool, _) = make_pool(settings());
        let conn = pool.borrow().await.unwrap();
        pool.return_connection(conn).await;
        let map = pool.stats().await.to_map();
        assert_eq!(map.len(), 13);
        assert_eq!(map["created"], 1);
        assert_eq!(map["idle"], 1);
        assert_eq!(map["returned"], 1);
    }

    async fn fill_idle_now(pool: &ConnectionPool, n: usize) {
        let mut conns = Vec::new();
        for _ in 0..n {
            conns.push(pool.borrow().await.unwrap());
        }
        for conn in conns {
            pool.return_connection(conn).await;
        }
    }
}

//! A pooled connection: one live FTP session plus lifecycle bookkeeping.
//!
//! The session itself sits behind the object-safe [`FtpSession`] trait so the
//! pool, manager and health manager never depend on a concrete transport.
//! Methods return boxed futures so `Box<dyn FtpSession>` stays usable.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use ftpool_core::{
    CertificatePolicy, Credentials, DataMode, Encoding, ProxyKind, TlsVersion, TransferType,
    TransportMode,
};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::error::SessionError;

/// Boxed, sendable future returned by [`FtpSession`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Session variant, selected once from [`TransportMode`] at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionVariant {
    #[default]
    Plain,
    ImplicitTls,
    ExplicitTls,
}

impl From<&TransportMode> for SessionVariant {
    fn from(mode: &TransportMode) -> Self {
        match mode {
            TransportMode::Plain => SessionVariant::Plain,
            TransportMode::ImplicitTls(_) => SessionVariant::ImplicitTls,
            TransportMode::ExplicitTls(_) => SessionVariant::ExplicitTls,
        }
    }
}

/// What a session has actually been configured with.
///
/// Filled in by the session as each creation step succeeds, so callers can
/// observe the applied protocols, ciphers and data mode without reaching
/// into transport internals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppliedSettings {
    pub variant: SessionVariant,
    pub proxy: Option<ProxyKind>,
    /// Protocol versions offered during the TLS handshake.
    pub tls_protocols: Vec<TlsVersion>,
    /// Cipher suites offered, by IANA name. Empty for plaintext sessions.
    pub cipher_suites: Vec<String>,
    pub certificate_policy: Option<CertificatePolicy>,
    /// Version and suite agreed with the server.
    pub negotiated_protocol: Option<TlsVersion>,
    pub negotiated_cipher: Option<String>,
    /// `true` once `PROT P` was accepted and data channels are encrypted.
    pub data_protected: bool,
    pub data_mode: Option<DataMode>,
    pub transfer_type: Option<TransferType>,
    pub encoding: Option<Encoding>,
    pub buffer_size: Option<usize>,
    pub keep_alive: Option<Duration>,
}

/// One FTP control session.
///
/// Implementations must be cheap to query with [`is_connected`](Self::is_connected);
/// anything touching the network goes through the async methods.
pub trait FtpSession: Send + fmt::Debug {
    /// Socket-level liveness: `false` once the peer closed or an I/O error
    /// poisoned the session.
    fn is_connected(&self) -> bool;

    fn login<'a>(&'a mut self, credentials: &'a Credentials)
    -> BoxFuture<'a, Result<(), SessionError>>;

    /// Record (and for active mode, sanity-check) how data connections are opened.
    fn apply_data_mode<'a>(&'a mut self, mode: &'a DataMode)
    -> BoxFuture<'a, Result<(), SessionError>>;

    fn set_transfer_type(
        &mut self,
        transfer_type: TransferType,
    ) -> BoxFuture<'_, Result<(), SessionError>>;

    fn set_encoding(&mut self, encoding: Encoding) -> BoxFuture<'_, Result<(), SessionError>>;

    fn set_buffer_size(&mut self, size: usize);

    fn set_keep_alive(&mut self, interval: Option<Duration>) -> Result<(), SessionError>;

    /// Lightweight round-trip used for health probes.
    fn noop(&mut self) -> BoxFuture<'_, Result<(), SessionError>>;

    fn list<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>, SessionError>>;

    fn retrieve<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SessionError>>;

    /// Upload `data` to `path`; resolves to the number of bytes written.
    fn store<'a>(
        &'a mut self,
        path: &'a str,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, SessionError>>;

    fn delete<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<(), SessionError>>;

    /// Polite logout (`QUIT`).
    fn quit(&mut self) -> BoxFuture<'_, Result<(), SessionError>>;

    /// Tear down the transport. Never fails.
    fn close(&mut self) -> BoxFuture<'_, ()>;

    fn settings(&self) -> &AppliedSettings;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pool capacity held by a borrowed connection.
///
/// Dropping the lease gives the slot back and lowers the pool's active
/// count, so a borrowed connection that is dropped instead of returned
/// never shrinks the pool.
pub(crate) struct Lease {
    pool_id: u64,
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub(crate) fn new(pool_id: u64, permit: OwnedSemaphorePermit, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            pool_id,
            active,
            _permit: permit,
        }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("pool_id", &self.pool_id).finish()
    }
}

/// A live session plus the timestamps the pool and health manager maintain.
pub struct Connection {
    id: u64,
    pool_id: Option<u64>,
    created_at: Instant,
    last_borrowed: Option<Instant>,
    idle_since: Instant,
    last_validated: Option<Instant>,
    last_validation: Option<bool>,
    borrow_count: u64,
    lease: Option<Lease>,
    session: Box<dyn FtpSession>,
}

impl Connection {
    pub fn new(session: Box<dyn FtpSession>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            pool_id: None,
            created_at: now,
            last_borrowed: None,
            idle_since: now,
            last_validated: None,
            last_validation: None,
            borrow_count: 0,
            lease: None,
            session,
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the pool this connection was handed out by, if any.
    pub fn pool_id(&self) -> Option<u64> {
        self.pool_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_borrowed(&self) -> Option<Instant> {
        self.last_borrowed
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn last_validated(&self) -> Option<Instant> {
        self.last_validated
    }

    /// Outcome of the most recent health check. Informational only.
    pub fn last_validation(&self) -> Option<bool> {
        self.last_validation
    }

    pub fn borrow_count(&self) -> u64 {
        self.borrow_count
    }

    /// `true` while the connection holds a slot of the pool that lent it.
    pub fn is_borrowed(&self) -> bool {
        self.lease.is_some()
    }

    pub fn session(&self) -> &dyn FtpSession {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut dyn FtpSession {
        self.session.as_mut()
    }

    pub(crate) fn mark_borrowed(&mut self, pool_id: u64, now: Instant) {
        self.pool_id = Some(pool_id);
        self.last_borrowed = Some(now);
        self.borrow_count += 1;
    }

    pub(crate) fn attach_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    pub(crate) fn lease_pool_id(&self) -> Option<u64> {
        self.lease.as_ref().map(Lease::pool_id)
    }

    pub(crate) fn take_lease(&mut self) -> Option<Lease> {
        self.lease.take()
    }

    pub(crate) fn mark_idle(&mut self, pool_id: u64, now: Instant) {
        self.pool_id = Some(pool_id);
        self.idle_since = now;
    }

    pub(crate) fn record_validation(&mut self, now: Instant, healthy: bool) {
        self.last_validated = Some(now);
        self.last_validation = Some(healthy);
    }

    pub(crate) fn into_session(self) -> Box<dyn FtpSession> {
        self.session
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("borrow_count", &self.borrow_count)
            .field("borrowed", &self.lease.is_some())
            .field("last_validation", &self.last_validation)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

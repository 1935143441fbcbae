//! A bounded pool of FTP/FTPS control connections.
//!
//! Callers borrow a connection for exclusive, short-term use and hand it
//! back when done. The pool creates connections lazily, validates them
//! before handing them out, evicts long-idle ones in the background, and
//! shuts down without leaking sockets.
//!
//! # Architecture
//!
//! ```text
//! FtpService (handles, list/retrieve/store/delete)
//!   └── ConnectionPool (borrow / return / invalidate / evict / shutdown)
//!         ├── ConnectionFactory ── ConnectionManager
//!         │                          └── Dialer ── TcpDialer (TCP, proxy, TLS)
//!         │                                          └── FtpClient: FtpSession
//!         └── HealthManager (liveness + NOOP probe, history, diagnostics)
//! ```
//!
//! Configuration types live in [`ftpool_core`] and are re-exported here.

pub mod connection;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod service;
pub mod session;

pub use connection::{AppliedSettings, BoxFuture, Connection, FtpSession, SessionVariant};
pub use error::{ConnectError, ConnectPhase, PoolError, SessionError};
pub use health::{DiagnosticReport, HealthManager, HealthRecord, HealthSummary};
pub use manager::{ConnectionFactory, ConnectionManager, Dialer};
pub use pool::{ConnectionPool, EvictionReport, PoolState, PoolStats};
pub use service::FtpService;
pub use session::{FtpClient, TcpDialer, TlsContext};

pub use ftpool_core::{
    ActiveSettings, CertificatePolicy, ConfigError, ConnectionConfig, ConnectionConfigBuilder,
    Credentials, DataMode, Encoding, HealthSettings, PoolSettings, PortRange, ProxyConfig,
    ProxyKind, Timeouts, TlsSettings, TlsVersion, TransferType, TransportMode,
};

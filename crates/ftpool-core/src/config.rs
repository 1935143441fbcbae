//! Connection configuration: an immutable, validated bag of settings.
//!
//! ```text
//! ConnectionConfig::builder(host, user, password)
//!   .explicit_tls(true)
//!   .active_mode(true)
//!   .active_port_range(50000, 50100)
//!   .pool(PoolSettings { max_total: 4, ..Default::default() })
//!   .build()?            → ConnectionConfig (validated, read-only)
//! ```
//!
//! The transport mode is a tagged variant chosen once at build time; only
//! TLS variants carry [`TlsSettings`]. Likewise only [`DataMode::Active`]
//! carries a port range and external address.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Well-known FTP control port.
pub const DEFAULT_FTP_PORT: u16 = 21;
/// Well-known implicit FTPS control port.
pub const DEFAULT_IMPLICIT_FTPS_PORT: u16 = 990;
/// Default I/O buffer size for control and data channels.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Largest accepted `max_total`.
pub const MAX_POOL_SIZE: usize = 65_536;

// ── Credentials ──────────────────────────────────────────────────────

/// Username and password pair. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

// ── TLS ──────────────────────────────────────────────────────────────

/// TLS protocol version that may be enabled for FTPS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" | "TLS12" | "1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" | "TLS13" | "1.3" => Ok(TlsVersion::Tls13),
            _ => Err(ConfigError::UnknownTlsVersion(s.to_string())),
        }
    }
}

/// How the server certificate is validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CertificatePolicy {
    /// Verify the chain against the web PKI roots plus any configured trust store.
    #[default]
    Verify,
    /// Accept any certificate. Only for servers with self-signed certificates
    /// on trusted networks.
    AcceptAny,
}

/// TLS parameters carried by the TLS transport variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    /// Enabled protocol versions. Never empty after validation.
    pub protocols: Vec<TlsVersion>,
    /// Enabled cipher suites by IANA name. Empty means the provider defaults.
    pub cipher_suites: Vec<String>,
    pub certificate_policy: CertificatePolicy,
    /// PEM bundle of additional trusted CA certificates.
    pub trust_store: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            protocols: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            cipher_suites: Vec::new(),
            certificate_policy: CertificatePolicy::Verify,
            trust_store: None,
        }
    }
}

/// Control channel transport variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// Plaintext FTP.
    Plain,
    /// TLS handshake immediately after TCP connect, before any FTP command.
    ImplicitTls(TlsSettings),
    /// Plaintext connect, then `AUTH TLS` upgrade.
    ExplicitTls(TlsSettings),
}

impl TransportMode {
    pub fn tls(&self) -> Option<&TlsSettings> {
        match self {
            TransportMode::Plain => None,
            TransportMode::ImplicitTls(tls) | TransportMode::ExplicitTls(tls) => Some(tls),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportMode::Plain => "plain",
            TransportMode::ImplicitTls(_) => "implicit-tls",
            TransportMode::ExplicitTls(_) => "explicit-tls",
        }
    }
}

// ── Data channel ─────────────────────────────────────────────────────

/// Inclusive local port range for active-mode data connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        if start == 0 {
            return Err(ConfigError::DataMode(
                "active port range must start at 1 or above".to_string(),
            ));
        }
        if start > end {
            return Err(ConfigError::DataMode(format!(
                "active port range start ({start}) exceeds end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Settings that only apply to active-mode data connections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveSettings {
    pub port_range: Option<PortRange>,
    /// Address advertised in `PORT` instead of the local one (NAT traversal).
    pub external_address: Option<IpAddr>,
}

/// Which side opens the data connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataMode {
    Passive,
    Active(ActiveSettings),
}

impl DataMode {
    pub fn is_active(&self) -> bool {
        matches!(self, DataMode::Active(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataMode::Passive => "passive",
            DataMode::Active(_) => "active",
        }
    }
}

// ── Proxy ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "http"),
            ProxyKind::Socks4 => write!(f, "socks4"),
            ProxyKind::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(ProxyKind::Http),
            "socks4" => Ok(ProxyKind::Socks4),
            "socks5" | "socks" => Ok(ProxyKind::Socks5),
            other => Err(ConfigError::invalid(
                "proxy.kind",
                format!("expected http, socks4 or socks5, got '{other}'"),
            )),
        }
    }
}

/// Proxy the control (and passive data) connections are tunnelled through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self
        }
    }
}

// ── Timeouts / transfer ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on DNS + TCP connect + proxy + TLS handshake + greeting.
    pub connect: Duration,
    /// Read/write/accept bound on data connections.
    pub data: Duration,
    /// TCP keep-alive interval on the control socket. `None` disables it.
    pub keep_alive: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            data: Duration::from_secs(30),
            keep_alive: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    /// The `TYPE` command argument.
    pub fn type_code(&self) -> &'static str {
        match self {
            TransferType::Ascii => "A",
            TransferType::Binary => "I",
        }
    }
}

impl FromStr for TransferType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" | "a" => Ok(TransferType::Ascii),
            "binary" | "image" | "i" => Ok(TransferType::Binary),
            other => Err(ConfigError::invalid(
                "transfer.type",
                format!("expected ascii or binary, got '{other}'"),
            )),
        }
    }
}

/// Control channel text encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn label(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Latin1 => "ISO-8859-1",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1" => Ok(Encoding::Latin1),
            _ => Err(ConfigError::UnknownEncoding(s.to_string())),
        }
    }
}

// ── Pool / health ────────────────────────────────────────────────────

/// Pool sizing and validation policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on idle + active connections.
    pub max_total: usize,
    /// Idle connections beyond this are destroyed on return.
    pub max_idle: usize,
    /// Eviction never drops the idle set below this (except for unhealthy ones).
    pub min_idle: usize,
    /// How long `borrow` waits at capacity before failing with `Exhausted`.
    pub max_wait: Duration,
    /// Interval between background eviction passes. `None` disables eviction.
    pub eviction_interval: Option<Duration>,
    /// Idle time after which a connection becomes eligible for eviction.
    pub min_evictable_idle: Duration,
    /// Idle connections inspected per eviction pass.
    pub tests_per_eviction_run: usize,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    /// Cap on freshly created connections discarded as unhealthy within one borrow.
    pub max_borrow_attempts: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait: Duration::from_secs(30),
            eviction_interval: Some(Duration::from_secs(60)),
            min_evictable_idle: Duration::from_secs(300),
            tests_per_eviction_run: 3,
            test_on_borrow: true,
            test_on_return: false,
            test_while_idle: false,
            max_borrow_attempts: 3,
        }
    }
}

impl PoolSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total == 0 {
            return Err(ConfigError::PoolSizing(
                "max_total must be at least 1".to_string(),
            ));
        }
        if self.max_total > MAX_POOL_SIZE {
            return Err(ConfigError::PoolSizing(format!(
                "max_total ({}) exceeds the limit of {MAX_POOL_SIZE}",
                self.max_total
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(ConfigError::PoolSizing(format!(
                "min_idle ({}) exceeds max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.max_idle > self.max_total {
            return Err(ConfigError::PoolSizing(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.max_borrow_attempts == 0 {
            return Err(ConfigError::PoolSizing(
                "max_borrow_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(interval) = self.eviction_interval {
            if interval.is_zero() {
                return Err(ConfigError::PoolSizing(
                    "eviction_interval must be non-zero (omit it to disable eviction)".to_string(),
                ));
            }
            if self.tests_per_eviction_run == 0 {
                return Err(ConfigError::PoolSizing(
                    "tests_per_eviction_run must be at least 1 when eviction is enabled"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Liveness probing policy for the health manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthSettings {
    /// Issue a `NOOP` round-trip in addition to the socket-level check.
    pub probe_with_noop: bool,
    pub probe_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_with_noop: true,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ── ConnectionConfig ─────────────────────────────────────────────────

/// Validated, immutable connection configuration.
///
/// Only obtainable through [`ConnectionConfig::builder`] (or the file
/// loaders, which route through the builder).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    credentials: Credentials,
    transport: TransportMode,
    data_mode: DataMode,
    proxy: Option<ProxyConfig>,
    timeouts: Timeouts,
    transfer_type: TransferType,
    encoding: Encoding,
    buffer_size: usize,
    pool: PoolSettings,
    health: HealthSettings,
}

impl ConnectionConfig {
    pub fn builder(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(host, username, password)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the FTP server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> &TransportMode {
        &self.transport
    }

    pub fn data_mode(&self) -> &DataMode {
        &self.data_mode
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn pool(&self) -> &PoolSettings {
        &self.pool
    }

    pub fn health(&self) -> &HealthSettings {
        &self.health
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Builder for [`ConnectionConfig`].
///
/// TLS and data modes are taken as independent switches so conflicting
/// combinations can be rejected in [`build`](Self::build) rather than
/// silently resolved.
#[derive(Clone, Debug)]
pub struct ConnectionConfigBuilder {
    host: String,
    port: Option<u16>,
    credentials: Credentials,
    implicit_tls: bool,
    explicit_tls: bool,
    tls: TlsSettings,
    passive: Option<bool>,
    active: Option<bool>,
    port_range: Option<(u16, u16)>,
    external_address: Option<IpAddr>,
    proxy: Option<ProxyConfig>,
    timeouts: Timeouts,
    transfer_type: TransferType,
    encoding: String,
    buffer_size: usize,
    pool: PoolSettings,
    health: HealthSettings,
}

impl ConnectionConfigBuilder {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            credentials: Credentials::new(username, password),
            implicit_tls: false,
            explicit_tls: false,
            tls: TlsSettings::default(),
            passive: None,
            active: None,
            port_range: None,
            external_address: None,
            proxy: None,
            timeouts: Timeouts::default(),
            transfer_type: TransferType::default(),
            encoding: Encoding::default().label().to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool: PoolSettings::default(),
            health: HealthSettings::default(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn implicit_tls(mut self, enabled: bool) -> Self {
        self.implicit_tls = enabled;
        self
    }

    pub fn explicit_tls(mut self, enabled: bool) -> Self {
        self.explicit_tls = enabled;
        self
    }

    pub fn tls_protocols(mut self, protocols: Vec<TlsVersion>) -> Self {
        self.tls.protocols = protocols;
        self
    }

    pub fn cipher_suites(mut self, suites: Vec<String>) -> Self {
        self.tls.cipher_suites = suites;
        self
    }

    pub fn certificate_policy(mut self, policy: CertificatePolicy) -> Self {
        self.tls.certificate_policy = policy;
        self
    }

    pub fn trust_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.trust_store = Some(path.into());
        self
    }

    pub fn passive_mode(mut self, enabled: bool) -> Self {
        self.passive = Some(enabled);
        self
    }

    pub fn active_mode(mut self, enabled: bool) -> Self {
        self.active = Some(enabled);
        self
    }

    pub fn active_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = Some((start, end));
        self
    }

    pub fn external_address(mut self, address: IpAddr) -> Self {
        self.external_address = Some(address);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.data = timeout;
        self
    }

    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.timeouts.keep_alive = interval;
        self
    }

    pub fn transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    pub fn encoding(mut self, label: impl Into<String>) -> Self {
        self.encoding = label.into();
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn health(mut self, health: HealthSettings) -> Self {
        self.health = health;
        self
    }

    /// Validate every setting and freeze the configuration.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        let transport = match (self.implicit_tls, self.explicit_tls) {
            (true, true) => return Err(ConfigError::ConflictingTls),
            (false, false) => TransportMode::Plain,
            (true, false) => TransportMode::ImplicitTls(self.tls),
            (false, true) => TransportMode::ExplicitTls(self.tls),
        };

        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if self.credentials.username.trim().is_empty() {
            return Err(ConfigError::MissingField("username"));
        }
        if transport.tls().is_some_and(|tls| tls.protocols.is_empty()) {
            return Err(ConfigError::invalid(
                "tls.protocols",
                "at least one protocol version must be enabled",
            ));
        }

        let port = match self.port {
            Some(0) => return Err(ConfigError::invalid("port", "must be non-zero")),
            Some(port) => port,
            None if matches!(transport, TransportMode::ImplicitTls(_)) => {
                DEFAULT_IMPLICIT_FTPS_PORT
            }
            None => DEFAULT_FTP_PORT,
        };

        let active = match (self.passive, self.active) {
            (Some(true), Some(true)) => {
                return Err(ConfigError::DataMode(
                    "passive and active mode are both selected".to_string(),
                ));
            }
            (Some(false), Some(false)) | (Some(false), None) | (None, Some(false)) => {
                return Err(ConfigError::DataMode(
                    "neither passive nor active mode is selected".to_string(),
                ));
            }
            (_, Some(true)) => true,
            _ => false,
        };
        let data_mode = if active {
            let port_range = self
                .port_range
                .map(|(start, end)| PortRange::new(start, end))
                .transpose()?;
            DataMode::Active(ActiveSettings {
                port_range,
                external_address: self.external_address,
            })
        } else {
            if self.port_range.is_some() || self.external_address.is_some() {
                return Err(ConfigError::DataMode(
                    "port range and external address only apply to active mode".to_string(),
                ));
            }
            DataMode::Passive
        };

        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() {
                return Err(ConfigError::MissingField("proxy.host"));
            }
            if proxy.port == 0 {
                return Err(ConfigError::invalid("proxy.port", "must be non-zero"));
            }
        }

        if self.timeouts.connect.is_zero() {
            return Err(ConfigError::invalid("timeouts.connect", "must be non-zero"));
        }
        if self.timeouts.data.is_zero() {
            return Err(ConfigError::invalid("timeouts.data", "must be non-zero"));
        }
        if self.timeouts.keep_alive.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid(
                "timeouts.keep_alive",
                "must be non-zero (omit it to disable keep-alive)",
            ));
        }

        let encoding: Encoding = self.encoding.parse()?;

        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("buffer_size", "must be non-zero"));
        }

        self.pool.validate()?;

        if self.health.probe_with_noop && self.health.probe_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "health.probe_timeout",
                "must be non-zero when probing with NOOP",
            ));
        }

        Ok(ConnectionConfig {
            host,
            port,
            credentials: self.credentials,
            transport,
            data_mode,
            proxy: self.proxy,
            timeouts: self.timeouts,
            transfer_type: self.transfer_type,
            encoding,
            buffer_size: self.buffer_size,
            pool: self.pool,
            health: self.health,
        })
    }
}

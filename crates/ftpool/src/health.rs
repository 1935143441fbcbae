//! Health manager: liveness checks for pooled connections plus advisory
//! configuration diagnostics.
//!
//! A check never changes pool membership. The pool asks, the health
//! manager answers, and the answer is recorded for later inspection. The
//! recorded history is read-only diagnostics: nothing in the pool consults
//! it, every check starts from scratch.

use std::collections::VecDeque;
use std::net::IpAddr;

use ftpool_core::{
    CertificatePolicy, ConnectionConfig, DEFAULT_FTP_PORT, DEFAULT_IMPLICIT_FTPS_PORT, DataMode,
    HealthSettings, TlsVersion, TransportMode,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ConnectPhase;
use crate::session::{dial_tcp, tls};

/// Number of check outcomes kept for diagnostics.
pub const HISTORY_CAPACITY: usize = 64;

/// Ports below this need elevated privileges to bind on most systems.
const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Active ranges smaller than this serialise concurrent transfers.
const MIN_RECOMMENDED_RANGE: usize = 10;

/// Outcome of one health check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthRecord {
    pub conn_id: u64,
    pub checked_at: Instant,
    pub healthy: bool,
    /// Why the connection was classified unhealthy.
    pub reason: Option<String>,
}

/// Aggregate view over every check performed so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checks: u64,
    pub failures: u64,
    /// Failures since the last healthy result, across all connections.
    pub consecutive_failures: u64,
    pub last: Option<HealthRecord>,
}

/// Structured result of an advisory diagnostic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub success: bool,
    pub message: String,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl DiagnosticReport {
    fn finish(issues: Vec<String>, recommendations: Vec<String>, ok: &str, failed: &str) -> Self {
        let success = issues.is_empty();
        Self {
            success,
            message: if success { ok } else { failed }.to_string(),
            issues,
            recommendations,
        }
    }
}

#[derive(Debug, Default)]
struct History {
    records: VecDeque<HealthRecord>,
    summary: HealthSummary,
}

impl History {
    fn push(&mut self, record: HealthRecord) {
        self.summary.checks += 1;
        if record.healthy {
            self.summary.consecutive_failures = 0;
        } else {
            self.summary.failures += 1;
            self.summary.consecutive_failures += 1;
        }
        self.summary.last = Some(record.clone());
        if self.records.len() == HISTORY_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

/// Classifies connections as healthy or unhealthy.
#[derive(Debug)]
pub struct HealthManager {
    settings: HealthSettings,
    history: Mutex<History>,
}

impl HealthManager {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            history: Mutex::new(History::default()),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Check `connection`: socket-level liveness first, then (when enabled)
    /// a `NOOP` round-trip that must succeed within the probe timeout.
    ///
    /// Records the outcome on the connection and in the history.
    pub async fn is_healthy(&self, connection: &mut Connection) -> bool {
        let failure = self.probe(connection).await;
        let now = Instant::now();
        let healthy = failure.is_none();
        connection.record_validation(now, healthy);

        if let Some(reason) = &failure {
            debug!(conn_id = connection.id(), reason = %reason, "connection failed health check");
        }
        self.history.lock().await.push(HealthRecord {
            conn_id: connection.id(),
            checked_at: now,
            healthy,
            reason: failure,
        });
        healthy
    }

    async fn probe(&self, connection: &mut Connection) -> Option<String> {
        if !connection.session().is_connected() {
            return Some("session reports disconnected".to_string());
        }
        if !self.settings.probe_with_noop {
            return None;
        }
        let timeout = self.settings.probe_timeout;
        match tokio::time::timeout(timeout, connection.session_mut().noop()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("noop failed: {e}")),
            Err(_) => Some(format!("noop timed out after {timeout:?}")),
        }
    }

    /// Most recent check outcomes, oldest first.
    pub async fn history(&self) -> Vec<HealthRecord> {
        self.history.lock().await.records.iter().cloned().collect()
    }

    pub async fn summary(&self) -> HealthSummary {
        self.history.lock().await.summary.clone()
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    /// Resolve the server (or proxy) and try a TCP connect within the
    /// connect timeout. No FTP traffic is exchanged.
    pub async fn check_server_reachability(config: &ConnectionConfig) -> DiagnosticReport {
        let timeout = config.timeouts().connect;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let (host, port, what) = match config.proxy() {
            Some(proxy) => (proxy.host.as_str(), proxy.port, "proxy"),
            None => (config.host(), config.port(), "server"),
        };

        let started = Instant::now();
        match dial_tcp(host, port, timeout).await {
            Ok(stream) => {
                drop(stream);
                let elapsed = started.elapsed();
                if elapsed > timeout / 2 {
                    recommendations.push(format!(
                        "{what} took {elapsed:?} to accept a connection; consider raising the connect timeout ({timeout:?})"
                    ));
                }
                if config.proxy().is_some() {
                    recommendations.push(format!(
                        "reachability of {} through the proxy is only verified on first connect",
                        config.address()
                    ));
                }
            }
            Err(e) => {
                warn!(host = %host, port = port, error = %e, "reachability check failed");
                issues.push(format!("{what} {host}:{port} is unreachable: {e}"));
                if e.phase == ConnectPhase::Resolve {
                    recommendations.push(format!("check that '{host}' resolves from this host"));
                } else {
                    recommendations.push(format!(
                        "check firewalls and that something listens on port {port}"
                    ));
                }
            }
        }

        DiagnosticReport::finish(
            issues,
            recommendations,
            &format!("{what} {host}:{port} is reachable"),
            &format!("{what} {host}:{port} is not reachable"),
        )
    }

    /// Static sanity checks on the TLS settings. Never opens a socket.
    pub fn check_tls_configuration(config: &ConnectionConfig) -> DiagnosticReport {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let Some(tls) = config.transport().tls() else {
            recommendations.push(
                "credentials and data are sent in clear text; enable explicit or implicit TLS"
                    .to_string(),
            );
            return DiagnosticReport {
                success: true,
                message: "tls is not enabled".to_string(),
                issues,
                recommendations,
            };
        };

        match (config.transport(), config.port()) {
            (TransportMode::ImplicitTls(_), DEFAULT_FTP_PORT) => issues.push(format!(
                "implicit tls on port {DEFAULT_FTP_PORT}; servers normally expect a plaintext greeting there"
            )),
            (TransportMode::ExplicitTls(_), DEFAULT_IMPLICIT_FTPS_PORT) => issues.push(format!(
                "explicit tls on port {DEFAULT_IMPLICIT_FTPS_PORT}; that port normally expects an immediate tls handshake"
            )),
            _ => {}
        }

        if tls.certificate_policy == CertificatePolicy::AcceptAny {
            issues.push(
                "server certificates are not verified; connections are open to interception"
                    .to_string(),
            );
        }

        if !tls.protocols.contains(&TlsVersion::Tls13) {
            recommendations.push("enable TLSv1.3 if the server supports it".to_string());
        }

        if let Some(path) = tls.trust_store.as_ref().filter(|p| !p.is_file()) {
            issues.push(format!("trust store {} does not exist", path.display()));
        }

        let unknown = tls::unknown_suites(&tls.cipher_suites);
        if !unknown.is_empty() {
            issues.push(format!("unsupported cipher suites: {}", unknown.join(", ")));
        }

        DiagnosticReport::finish(
            issues,
            recommendations,
            "tls configuration looks sane",
            "tls configuration has problems",
        )
    }

    /// Static sanity checks on active-mode data settings.
    pub fn check_active_mode(config: &ConnectionConfig) -> DiagnosticReport {
        let DataMode::Active(active) = config.data_mode() else {
            return DiagnosticReport {
                success: true,
                message: "passive mode in use; active-mode checks do not apply".to_string(),
                ..DiagnosticReport::default()
            };
        };

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if let Some(proxy) = config.proxy() {
            issues.push(format!(
                "active mode cannot work through the {} proxy; the server cannot connect back",
                proxy.kind
            ));
        }

        match active.external_address {
            None => recommendations.push(
                "no external address set; behind NAT the server will be told a private address"
                    .to_string(),
            ),
            Some(addr) if is_private(addr) => recommendations.push(format!(
                "external address {addr} is not publicly routable"
            )),
            Some(_) => {}
        }

        match active.port_range {
            Some(range) => {
                if range.start() < PRIVILEGED_PORT_LIMIT {
                    issues.push(format!(
                        "port range {range} includes privileged ports below {PRIVILEGED_PORT_LIMIT}"
                    ));
                }
                if range.len() < MIN_RECOMMENDED_RANGE {
                    recommendations.push(format!(
                        "port range {range} has only {} ports; concurrent transfers may fail to bind",
                        range.len()
                    ));
                }
            }
            None => recommendations.push(
                "no port range set; ephemeral ports are hard to open in a firewall".to_string(),
            ),
        }

        DiagnosticReport::finish(
            issues,
            recommendations,
            "active mode configuration looks sane",
            "active mode configuration has problems",
        )
    }
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

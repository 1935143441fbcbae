//! `ftpool.toml` configuration parser.
//!
//! The file form is a loose, all-optional mirror of [`ConnectionConfig`].
//! It is routed through [`ConnectionConfigBuilder`] so a file-based config
//! gets exactly the same validation as one built in code.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{
    CertificatePolicy, ConnectionConfig, ConnectionConfigBuilder, Credentials, HealthSettings,
    PoolSettings, ProxyConfig, ProxyKind, TlsVersion, TransferType,
};
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub server: ServerSection,
    pub tls: Option<TlsSection>,
    pub data: Option<DataSection>,
    pub proxy: Option<ProxySection>,
    pub timeouts: Option<TimeoutsSection>,
    pub transfer: Option<TransferSection>,
    pub pool: Option<PoolSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSection {
    pub implicit: Option<bool>,
    pub explicit: Option<bool>,
    pub protocols: Option<Vec<String>>,
    pub cipher_suites: Option<Vec<String>>,
    pub verify_certificates: Option<bool>,
    pub trust_store: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSection {
    /// `"passive"` or `"active"`.
    pub mode: Option<String>,
    pub port_range: Option<[u16; 2]>,
    pub external_address: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySection {
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsSection {
    pub connect: Option<String>,
    pub data: Option<String>,
    /// Keep-alive interval, or `"off"` to disable it.
    pub keep_alive: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(rename = "type")]
    pub transfer_type: Option<String>,
    pub encoding: Option<String>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    pub max_total: Option<usize>,
    pub max_idle: Option<usize>,
    pub min_idle: Option<usize>,
    pub max_wait: Option<String>,
    /// Eviction interval, or `"off"` to disable the evictor.
    pub eviction_interval: Option<String>,
    pub min_evictable_idle: Option<String>,
    pub tests_per_eviction_run: Option<usize>,
    pub test_on_borrow: Option<bool>,
    pub test_on_return: Option<bool>,
    pub test_while_idle: Option<bool>,
    pub max_borrow_attempts: Option<usize>,
    pub probe_with_noop: Option<bool>,
    pub probe_timeout: Option<String>,
}

impl FileConfig {
    pub fn into_builder(self) -> Result<ConnectionConfigBuilder, ConfigError> {
        let server = self.server;
        let mut builder =
            ConnectionConfig::builder(server.host, server.username, server.password);
        if let Some(port) = server.port {
            builder = builder.port(port);
        }

        if let Some(tls) = self.tls {
            builder = builder
                .implicit_tls(tls.implicit.unwrap_or(false))
                .explicit_tls(tls.explicit.unwrap_or(false));
            if let Some(protocols) = tls.protocols {
                let parsed = protocols
                    .iter()
                    .map(|p| p.parse::<TlsVersion>())
                    .collect::<Result<Vec<_>, _>>()?;
                builder = builder.tls_protocols(parsed);
            }
            if let Some(suites) = tls.cipher_suites {
                builder = builder.cipher_suites(suites);
            }
            if tls.verify_certificates == Some(false) {
                builder = builder.certificate_policy(CertificatePolicy::AcceptAny);
            }
            if let Some(path) = tls.trust_store {
                builder = builder.trust_store(path);
            }
        }

        if let Some(data) = self.data {
            match data.mode.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("passive") => {}
                Some("active") => builder = builder.active_mode(true),
                Some(other) => {
                    return Err(ConfigError::DataMode(format!(
                        "expected 'passive' or 'active', got '{other}'"
                    )));
                }
            }
            if let Some([start, end]) = data.port_range {
                builder = builder.active_port_range(start, end);
            }
            if let Some(address) = data.external_address {
                builder = builder.external_address(address);
            }
        }

        if let Some(proxy) = self.proxy {
            let kind: ProxyKind = proxy.kind.parse()?;
            let mut config = ProxyConfig::new(kind, proxy.host, proxy.port);
            if let Some(username) = proxy.username {
                config = config.with_credentials(Credentials::new(
                    username,
                    proxy.password.unwrap_or_default(),
                ));
            }
            builder = builder.proxy(config);
        }

        if let Some(timeouts) = self.timeouts {
            if let Some(s) = timeouts.connect {
                builder = builder.connect_timeout(parse_duration(&s)?);
            }
            if let Some(s) = timeouts.data {
                builder = builder.data_timeout(parse_duration(&s)?);
            }
            if let Some(s) = timeouts.keep_alive {
                builder = builder.keep_alive(parse_optional_duration(&s)?);
            }
        }

        if let Some(transfer) = self.transfer {
            if let Some(t) = transfer.transfer_type {
                builder = builder.transfer_type(t.parse::<TransferType>()?);
            }
            if let Some(encoding) = transfer.encoding {
                builder = builder.encoding(encoding);
            }
            if let Some(size) = transfer.buffer_size {
                builder = builder.buffer_size(size);
            }
        }

        if let Some(pool) = self.pool {
            let (settings, health) = pool.into_settings()?;
            builder = builder.pool(settings).health(health);
        }

        Ok(builder)
    }
}

impl PoolSection {
    fn into_settings(self) -> Result<(PoolSettings, HealthSettings), ConfigError> {
        let defaults = PoolSettings::default();
        let settings = PoolSettings {
            max_total: self.max_total.unwrap_or(defaults.max_total),
            max_idle: self.max_idle.unwrap_or(defaults.max_idle),
            min_idle: self.min_idle.unwrap_or(defaults.min_idle),
            max_wait: match self.max_wait {
                Some(s) => parse_duration(&s)?,
                None => defaults.max_wait,
            },
            eviction_interval: match self.eviction_interval {
                Some(s) => parse_optional_duration(&s)?,
                None => defaults.eviction_interval,
            },
            min_evictable_idle: match self.min_evictable_idle {
                Some(s) => parse_duration(&s)?,
                None => defaults.min_evictable_idle,
            },
            tests_per_eviction_run: self
                .tests_per_eviction_run
                .unwrap_or(defaults.tests_per_eviction_run),
            test_on_borrow: self.test_on_borrow.unwrap_or(defaults.test_on_borrow),
            test_on_return: self.test_on_return.unwrap_or(defaults.test_on_return),
            test_while_idle: self.test_while_idle.unwrap_or(defaults.test_while_idle),
            max_borrow_attempts: self
                .max_borrow_attempts
                .unwrap_or(defaults.max_borrow_attempts),
        };

        let health_defaults = HealthSettings::default();
        let health = HealthSettings {
            probe_with_noop: self.probe_with_noop.unwrap_or(health_defaults.probe_with_noop),
            probe_timeout: match self.probe_timeout {
                Some(s) => parse_duration(&s)?,
                None => health_defaults.probe_timeout,
            },
        };
        Ok((settings, health))
    }
}

impl ConnectionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;
        file.into_builder()?.build()
    }

    /// Read, parse and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h". A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    let parsed = if let Some(secs) = trimmed.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.trim().parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.trim().parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = trimmed.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = trimmed.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        trimmed.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.ok_or_else(|| ConfigError::Duration(s.to_string()))
}

fn parse_optional_duration(s: &str) -> Result<Option<Duration>, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "disabled" => Ok(None),
        _ => parse_duration(s).map(Some),
    }
}

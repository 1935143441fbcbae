//! `rustls` client configuration for FTPS control and data channels.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use ftpool_core::{CertificatePolicy, ConfigError, TlsSettings, TlsVersion};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};

// ── TlsContext ───────────────────────────────────────────────────────

/// A built client configuration plus what it offers, for reporting.
#[derive(Clone)]
pub struct TlsContext {
    pub client_config: Arc<ClientConfig>,
    pub protocols: Vec<TlsVersion>,
    pub cipher_suites: Vec<String>,
    pub certificate_policy: CertificatePolicy,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("protocols", &self.protocols)
            .field("cipher_suites", &self.cipher_suites)
            .field("certificate_policy", &self.certificate_policy)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Build the client configuration once; every session and data channel
    /// of a manager shares it (and its resumption cache).
    pub fn new(settings: &TlsSettings) -> Result<Self, ConfigError> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !settings.cipher_suites.is_empty() {
            let selected = settings
                .cipher_suites
                .iter()
                .map(|name| find_suite(&provider, name))
                .collect::<Result<Vec<_>, _>>()?;
            provider.cipher_suites = selected;
        }

        let mut protocols = settings.protocols.clone();
        protocols.sort();
        protocols.dedup();
        let versions: Vec<&'static SupportedProtocolVersion> =
            protocols.iter().map(|v| protocol_version(*v)).collect();

        let cipher_suites: Vec<String> = provider
            .cipher_suites
            .iter()
            .filter(|suite| versions.iter().any(|v| v.version == suite.version().version))
            .map(suite_name)
            .collect();
        if cipher_suites.is_empty() {
            return Err(invalid_tls(
                "no configured cipher suite matches the enabled protocol versions",
            ));
        }

        let provider = Arc::new(provider);
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| invalid_tls(format!("tls protocol version error: {e}")))?;

        let config = match settings.certificate_policy {
            CertificatePolicy::Verify => {
                let roots = root_store(settings)?;
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            CertificatePolicy::AcceptAny => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCertificate::new(
                    provider,
                )))
                .with_no_client_auth(),
        };

        Ok(Self {
            client_config: Arc::new(config),
            protocols,
            cipher_suites,
            certificate_policy: settings.certificate_policy,
        })
    }

    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(Arc::clone(&self.client_config))
    }
}

/// Mozilla roots plus any extra CA certificates from the configured PEM file.
fn root_store(settings: &TlsSettings) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &settings.trust_store {
        let trust_err = |reason: String| ConfigError::TrustStore {
            path: path.clone(),
            reason,
        };
        let file = File::open(path).map_err(|e| trust_err(e.to_string()))?;
        let mut reader = BufReader::new(file);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| trust_err(format!("invalid PEM: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| trust_err(format!("rejected certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(trust_err("no certificates found".to_string()));
        }
        tracing::debug!(path = %path.display(), certificates = added, "loaded trust store");
    }
    Ok(roots)
}

fn protocol_version(version: TlsVersion) -> &'static SupportedProtocolVersion {
    match version {
        TlsVersion::Tls12 => &rustls::version::TLS12,
        TlsVersion::Tls13 => &rustls::version::TLS13,
    }
}

pub(crate) fn tls_version(version: rustls::ProtocolVersion) -> Option<TlsVersion> {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        _ => None,
    }
}

/// IANA-style name of a suite, e.g. `TLS13_AES_256_GCM_SHA384`.
pub(crate) fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Look a suite up by name. TLS 1.3 suites match with or without the `13`
/// infix (`TLS_AES_128_GCM_SHA256` and `TLS13_AES_128_GCM_SHA256`).
pub fn find_suite(
    provider: &CryptoProvider,
    name: &str,
) -> Result<SupportedCipherSuite, ConfigError> {
    let wanted = name.trim().to_ascii_uppercase();
    provider
        .cipher_suites
        .iter()
        .find(|suite| {
            let known = suite_name(suite);
            known == wanted || known.replacen("TLS13_", "TLS_", 1) == wanted
        })
        .copied()
        .ok_or_else(|| ConfigError::UnknownCipherSuite(name.to_string()))
}

/// Check a list of suite names against the ring provider without building a config.
pub fn unknown_suites(names: &[String]) -> Vec<String> {
    let provider = rustls::crypto::ring::default_provider();
    names
        .iter()
        .filter(|name| find_suite(&provider, name).is_err())
        .cloned()
        .collect()
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, String> {
    ServerName::try_from(host.to_string())
        .map_err(|e| format!("invalid tls server name '{host}': {e}"))
}

fn invalid_tls(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: "tls",
        reason: reason.into(),
    }
}

// ── Certificate verification opt-out ─────────────────────────────────

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate, but still checks handshake signatures
    /// so the peer must hold the key for the certificate it presents.
    #[derive(Debug)]
    pub struct AcceptAnyCertificate {
        provider: Arc<CryptoProvider>,
    }

    impl AcceptAnyCertificate {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

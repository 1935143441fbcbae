//! Connection manager: builds fully configured sessions and tears them down.
//!
//! Creation runs in fixed phases and stops at the first failure, closing
//! whatever was opened so far:
//!
//! ```text
//! dial (resolve, tcp, proxy, tls, greeting)   → Dialer
//! login                                       → Authenticate
//! data mode (passive / active range + NAT)    → DataMode
//! transfer type, encoding, buffer, keepalive  → Configure
//! ```

use std::sync::Arc;
use std::time::Duration;

use ftpool_core::{ConfigError, ConnectionConfig};

use crate::connection::{BoxFuture, Connection, FtpSession};
use crate::error::{ConnectError, ConnectPhase, SessionError};
use crate::session::TcpDialer;

/// How long `destroy` waits for the server to acknowledge `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens a greeted control session for a configuration.
///
/// Implementations resolve the session variant themselves; the returned
/// session is connected and, for TLS variants, secured.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn FtpSession>, ConnectError>>;
}

/// What the pool needs from a connection source. Injected for testability.
pub trait ConnectionFactory: Send + Sync {
    /// Create a connected, authenticated and configured connection.
    fn create(&self) -> BoxFuture<'_, Result<Connection, ConnectError>>;

    /// Best-effort logout and close. Never fails.
    fn destroy(&self, connection: Connection) -> BoxFuture<'_, ()>;
}

/// The production [`ConnectionFactory`].
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    dialer: Arc<dyn Dialer>,
}

impl ConnectionManager {
    /// Manager using the TCP/TLS session layer.
    pub fn new(config: Arc<ConnectionConfig>) -> Result<Self, ConfigError> {
        let dialer = TcpDialer::new(&config)?;
        Ok(Self::with_dialer(config, Arc::new(dialer)))
    }

    pub fn with_dialer(config: Arc<ConnectionConfig>, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn create_connection(&self) -> Result<Connection, ConnectError> {
        let config = &self.config;
        let mut session = self.dialer.dial(config).await?;

        if let Err(e) = configure(session.as_mut(), config).await {
            tracing::debug!(
                host = %config.host(),
                phase = %e.phase,
                error = %e.message,
                "connection setup failed, closing session"
            );
            session.close().await;
            return Err(e);
        }

        let connection = Connection::new(session);
        tracing::debug!(
            conn_id = connection.id(),
            host = %config.host(),
            port = config.port(),
            transport = config.transport().name(),
            data_mode = config.data_mode().name(),
            "created connection"
        );
        Ok(connection)
    }

    pub async fn destroy_connection(&self, connection: Connection) {
        let id = connection.id();
        let mut session = connection.into_session();

        if session.is_connected() {
            match tokio::time::timeout(QUIT_TIMEOUT, session.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(conn_id = id, error = %e, "logout failed during teardown");
                }
                Err(_) => {
                    tracing::warn!(conn_id = id, timeout = ?QUIT_TIMEOUT, "logout timed out during teardown");
                }
            }
        }
        session.close().await;
        tracing::debug!(conn_id = id, host = %self.config.host(), "destroyed connection");
    }
}

/// Post-dial steps, each mapped to its own phase.
async fn configure(
    session: &mut dyn FtpSession,
    config: &ConnectionConfig,
) -> Result<(), ConnectError> {
    session
        .login(config.credentials())
        .await
        .map_err(|e| e.into_connect(ConnectPhase::Authenticate))?;

    session
        .apply_data_mode(config.data_mode())
        .await
        .map_err(|e| e.into_connect(ConnectPhase::DataMode))?;

    let config_err = |e: SessionError| e.into_connect(ConnectPhase::Configure);
    session
        .set_transfer_type(config.transfer_type())
        .await
        .map_err(config_err)?;
    session
        .set_encoding(config.encoding())
        .await
        .map_err(config_err)?;
    session.set_buffer_size(config.buffer_size());
    session
        .set_keep_alive(config.timeouts().keep_alive)
        .map_err(config_err)?;
    Ok(())
}

impl ConnectionFactory for ConnectionManager {
    fn create(&self) -> BoxFuture<'_, Result<Connection, ConnectError>> {
        Box::pin(self.create_connection())
    }

    fn destroy(&self, connection: Connection) -> BoxFuture<'_, ()> {
        Box::pin(self.destroy_connection(connection))
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.config.host())
            .field("port", &self.config.port())
            .finish_non_exhaustive()
    }
}

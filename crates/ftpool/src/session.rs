//! TCP/TLS FTP sessions: the concrete [`FtpSession`] implementation.
//!
//! # Architecture
//!
//! ```text
//! TcpDialer::dial(config)
//!   → resolve + TCP connect (connect timeout)        [Resolve / Connect]
//!   → proxy tunnel (HTTP CONNECT / SOCKS4 / SOCKS5)  [Proxy]
//!   → variant:
//!       Plain        → 220 greeting                  [Greeting]
//!       ImplicitTls  → TLS handshake → 220           [TlsHandshake / Greeting]
//!       ExplicitTls  → 220 → AUTH TLS → TLS handshake [Greeting / TlsHandshake]
//!   → PBSZ 0 + PROT P for TLS variants               [TlsSetup]
//!   → FtpClient (Box<dyn FtpSession>)
//! ```
//!
//! Login, data mode, transfer type, encoding, buffer size and keep-alive are
//! applied afterwards by the [`ConnectionManager`](crate::manager::ConnectionManager).

pub mod client;
pub mod codec;
pub mod data;
pub mod proxy;
pub mod tls;

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use ftpool_core::{ConfigError, ConnectionConfig, TransportMode};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::connection::{BoxFuture, FtpSession};
use crate::error::{ConnectError, ConnectPhase};
use crate::manager::Dialer;

pub use client::FtpClient;
pub use tls::TlsContext;

// ── Stream ───────────────────────────────────────────────────────────

/// Underlying transport for control and data channels.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the control stream is moved into a TLS handshake,
    /// and after the session is closed.
    Detached,
}

impl Stream {
    pub fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Stream::Plain(s) => Some(s),
            Stream::Tls(s) => Some(s.get_ref().0),
            Stream::Detached => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Stream::Plain(_) => "plain",
            Stream::Tls(_) => "tls",
            Stream::Detached => "detached",
        };
        f.debug_tuple("Stream").field(&kind).finish()
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream detached")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::Detached => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::Detached => Poll::Ready(Ok(())),
        }
    }
}

// ── Socket helpers ───────────────────────────────────────────────────

/// Resolve `host:port` and connect to the first address that answers.
pub(crate) async fn dial_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> =
        match tokio::time::timeout(timeout, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                return Err(ConnectError::new(
                    ConnectPhase::Resolve,
                    format!("dns resolution failed for {host}:{port}: {e}"),
                ));
            }
            Err(_) => {
                return Err(ConnectError::new(
                    ConnectPhase::Resolve,
                    format!("dns resolution for {host} timed out after {timeout:?}"),
                ));
            }
        };
    if addrs.is_empty() {
        return Err(ConnectError::new(
            ConnectPhase::Resolve,
            format!("no address found for {host}:{port}"),
        ));
    }

    let mut last_error = String::new();
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Disable Nagle's algorithm; control traffic is small request/reply lines.
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {timeout:?}"),
        }
    }
    Err(ConnectError::new(
        ConnectPhase::Connect,
        format!("tcp connect to {host}:{port}: {last_error}"),
    ))
}

/// Non-blocking peek on the raw socket: EOF or a hard error means the peer
/// is gone, `WouldBlock` means idle but alive.
pub(crate) fn socket_alive(stream: &TcpStream) -> bool {
    let sock = SockRef::from(stream);
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

pub(crate) fn set_keepalive(stream: &TcpStream, interval: Option<Duration>) -> io::Result<()> {
    let sock = SockRef::from(stream);
    match interval {
        Some(time) => sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time)),
        None => sock.set_keepalive(false),
    }
}

// ── TcpDialer ────────────────────────────────────────────────────────

/// Opens real FTP control connections over TCP, optionally through a proxy
/// and secured with TLS.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    tls: Option<TlsContext>,
}

impl TcpDialer {
    /// Prepare a dialer for `config`. TLS settings are compiled into a
    /// `rustls` client configuration here, so bad cipher names or an
    /// unreadable trust store are reported as configuration errors.
    pub fn new(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        let tls = config.transport().tls().map(TlsContext::new).transpose()?;
        Ok(Self { tls })
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    async fn open(&self, config: &ConnectionConfig) -> Result<FtpClient, ConnectError> {
        let connect_timeout = config.timeouts().connect;

        let tcp = match config.proxy() {
            Some(proxy) => {
                let mut tcp = dial_tcp(&proxy.host, proxy.port, connect_timeout).await?;
                match tokio::time::timeout(
                    connect_timeout,
                    proxy::establish(&mut tcp, proxy, config.host(), config.port()),
                )
                .await
                {
                    Ok(Ok(())) => tcp,
                    Ok(Err(e)) => return Err(ConnectError::new(ConnectPhase::Proxy, e.to_string())),
                    Err(_) => {
                        return Err(ConnectError::new(
                            ConnectPhase::Proxy,
                            format!("proxy handshake timed out after {connect_timeout:?}"),
                        ));
                    }
                }
            }
            None => dial_tcp(config.host(), config.port(), connect_timeout).await?,
        };

        tracing::debug!(
            host = %config.host(),
            port = config.port(),
            transport = config.transport().name(),
            proxy = config.proxy().is_some(),
            "established control connection"
        );

        let mut client = FtpClient::new(Stream::Plain(tcp), config, self.tls.clone())
            .map_err(|e| e.into_connect(ConnectPhase::Connect))?;

        match config.transport() {
            TransportMode::Plain => {
                client
                    .read_greeting(connect_timeout)
                    .await
                    .map_err(|e| e.into_connect(ConnectPhase::Greeting))?;
            }
            TransportMode::ImplicitTls(_) => {
                client
                    .start_tls(connect_timeout)
                    .await
                    .map_err(|e| e.into_connect(ConnectPhase::TlsHandshake))?;
                client
                    .read_greeting(connect_timeout)
                    .await
                    .map_err(|e| e.into_connect(ConnectPhase::Greeting))?;
            }
            TransportMode::ExplicitTls(_) => {
                client
                    .read_greeting(connect_timeout)
                    .await
                    .map_err(|e| e.into_connect(ConnectPhase::Greeting))?;
                client
                    .auth_tls(connect_timeout)
                    .await
                    .map_err(|e| e.into_connect(ConnectPhase::TlsHandshake))?;
            }
        }

        if config.transport().is_tls() {
            client
                .protect_data_channel()
                .await
                .map_err(|e| e.into_connect(ConnectPhase::TlsSetup))?;
        }
        Ok(client)
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn FtpSession>, ConnectError>> {
        Box::pin(async move {
            let client = self.open(config).await?;
            Ok(Box::new(client) as Box<dyn FtpSession>)
        })
    }
}

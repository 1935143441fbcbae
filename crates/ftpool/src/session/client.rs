//! [`FtpClient`]: one FTP control connection speaking RFC 959 / RFC 4217.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ftpool_core::{
    ConnectionConfig, Credentials, DataMode, Encoding, ProxyConfig, TransferType,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::codec::{self, LineBuffer, Reply};
use super::tls::{self, TlsContext};
use super::{Stream, data, set_keepalive, socket_alive};
use crate::connection::{AppliedSettings, BoxFuture, FtpSession, SessionVariant};
use crate::error::SessionError;

/// A connected, greeted FTP control session.
pub struct FtpClient {
    stream: Stream,
    buffer: LineBuffer,
    host: String,
    local_ip: IpAddr,
    tls: Option<TlsContext>,
    proxy: Option<ProxyConfig>,
    encoding: Encoding,
    reply_timeout: Duration,
    data_timeout: Duration,
    buffer_size: usize,
    data_mode: DataMode,
    connected: bool,
    settings: AppliedSettings,
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("host", &self.host)
            .field("variant", &self.settings.variant)
            .field("stream", &self.stream)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl FtpClient {
    /// Wrap a freshly connected (not yet greeted) control stream.
    pub fn new(
        stream: Stream,
        config: &ConnectionConfig,
        tls: Option<TlsContext>,
    ) -> Result<Self, SessionError> {
        let local_ip = stream
            .tcp()
            .ok_or(SessionError::Closed)?
            .local_addr()?
            .ip();

        let mut settings = AppliedSettings {
            variant: SessionVariant::from(config.transport()),
            proxy: config.proxy().map(|p| p.kind),
            ..AppliedSettings::default()
        };
        if let Some(ctx) = &tls {
            settings.tls_protocols = ctx.protocols.clone();
            settings.cipher_suites = ctx.cipher_suites.clone();
            settings.certificate_policy = Some(ctx.certificate_policy);
        }

        Ok(Self {
            stream,
            buffer: LineBuffer::new(config.buffer_size()),
            host: config.host().to_string(),
            local_ip,
            tls,
            proxy: config.proxy().cloned(),
            encoding: config.encoding(),
            reply_timeout: config.timeouts().data,
            data_timeout: config.timeouts().data,
            buffer_size: config.buffer_size(),
            data_mode: DataMode::Passive,
            connected: true,
            settings,
        })
    }

    // ── Control channel primitives ──────────────────────────────────

    async fn send(&mut self, command: &str) -> Result<(), SessionError> {
        let bytes = codec::encode_command(command, self.encoding)?;
        tracing::trace!(host = %self.host, command = codec::redact(command), "ftp command");
        let result = async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.connected = false;
            return Err(SessionError::Io(e));
        }
        Ok(())
    }

    async fn read_reply_within(&mut self, timeout: Duration) -> Result<Reply, SessionError> {
        let result = match tokio::time::timeout(
            timeout,
            codec::read_reply(&mut self.stream, &mut self.buffer, self.encoding),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };
        match &result {
            // 421: the server is about to close the control connection.
            Ok(reply) if reply.code == 421 => self.connected = false,
            Ok(reply) => {
                tracing::trace!(host = %self.host, code = reply.code, "ftp reply");
            }
            Err(e) if e.is_transport() => self.connected = false,
            Err(_) => {}
        }
        result
    }

    async fn read_reply(&mut self) -> Result<Reply, SessionError> {
        self.read_reply_within(self.reply_timeout).await
    }

    async fn command(&mut self, command: &str) -> Result<Reply, SessionError> {
        self.send(command).await?;
        self.read_reply().await
    }

    /// Send `command` and require a 2xx completion reply.
    async fn expect_completion(&mut self, command: &str) -> Result<Reply, SessionError> {
        let reply = self.command(command).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(reply.into_error())
        }
    }

    // ── Session establishment (driven by TcpDialer) ─────────────────

    /// Read the server banner, skipping `120 service ready in nnn minutes`.
    pub(crate) async fn read_greeting(&mut self, timeout: Duration) -> Result<(), SessionError> {
        loop {
            let reply = self.read_reply_within(timeout).await?;
            match reply.code {
                120 => continue,
                220 => {
                    tracing::debug!(host = %self.host, banner = %reply.text(), "server greeting");
                    return Ok(());
                }
                _ => return Err(reply.into_error()),
            }
        }
    }

    /// Wrap the control stream in TLS (client side, always).
    pub(crate) async fn start_tls(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let ctx = self
            .tls
            .clone()
            .ok_or_else(|| SessionError::Protocol("no tls configuration".to_string()))?;
        if self.buffer.has_pending() {
            return Err(SessionError::Protocol(
                "unexpected data on control channel before tls handshake".to_string(),
            ));
        }
        let tcp = match std::mem::replace(&mut self.stream, Stream::Detached) {
            Stream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(SessionError::Protocol(
                    "control channel is already secured".to_string(),
                ));
            }
        };

        let name = tls::server_name(&self.host).map_err(SessionError::Protocol)?;
        let tls_stream =
            match tokio::time::timeout(timeout, ctx.connector().connect(name, tcp)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(SessionError::Io(e));
                }
                Err(_) => {
                    self.connected = false;
                    return Err(SessionError::Timeout(timeout));
                }
            };

        let (_, conn) = tls_stream.get_ref();
        self.settings.negotiated_protocol = conn.protocol_version().and_then(tls::tls_version);
        self.settings.negotiated_cipher = conn.negotiated_cipher_suite().map(|s| tls::suite_name(&s));
        tracing::debug!(
            host = %self.host,
            protocol = ?self.settings.negotiated_protocol,
            cipher = ?self.settings.negotiated_cipher,
            "tls handshake complete"
        );
        self.stream = Stream::Tls(Box::new(tls_stream));
        Ok(())
    }

    /// Explicit FTPS upgrade: `AUTH TLS` followed by the handshake.
    pub(crate) async fn auth_tls(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let reply = self.command("AUTH TLS").await?;
        // 334 is accepted by some servers for AUTH with no further ADAT.
        if reply.code != 234 && reply.code != 334 {
            return Err(reply.into_error());
        }
        self.start_tls(timeout).await
    }

    /// `PBSZ 0` + `PROT P`: encrypt data channels too.
    pub(crate) async fn protect_data_channel(&mut self) -> Result<(), SessionError> {
        self.expect_completion("PBSZ 0").await?;
        self.expect_completion("PROT P").await?;
        self.settings.data_protected = true;
        Ok(())
    }

    // ── Data channel ────────────────────────────────────────────────

    async fn secure_data(&mut self, tcp: TcpStream) -> Result<Stream, SessionError> {
        if !self.settings.data_protected {
            return Ok(Stream::Plain(tcp));
        }
        let ctx = self
            .tls
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("no tls configuration".to_string()))?;
        let name = tls::server_name(&self.host).map_err(SessionError::Protocol)?;
        match tokio::time::timeout(self.data_timeout, ctx.connector().connect(name, tcp)).await {
            Ok(Ok(s)) => Ok(Stream::Tls(Box::new(s))),
            Ok(Err(e)) => Err(SessionError::Io(e)),
            Err(_) => Err(SessionError::Timeout(self.data_timeout)),
        }
    }

    /// Open a data connection for `command` (LIST / RETR / STOR) and wait
    /// for the server's preliminary 1xx reply.
    async fn open_data(&mut self, command: &str) -> Result<Stream, SessionError> {
        match self.data_mode.clone() {
            DataMode::Passive => {
                let reply = self.command("PASV").await?;
                if reply.code != 227 {
                    return Err(reply.into_error());
                }
                let pasv = codec::parse_pasv(&reply.text())?;
                let addr = if pasv.ip().is_unspecified() {
                    match self.stream.tcp().map(|s| s.peer_addr()) {
                        Some(Ok(peer)) if self.proxy.is_none() => {
                            SocketAddr::new(peer.ip(), pasv.port())
                        }
                        _ => SocketAddr::V4(pasv),
                    }
                } else {
                    SocketAddr::V4(pasv)
                };
                let tcp =
                    data::connect_passive(addr, self.proxy.as_ref(), self.data_timeout).await?;

                let reply = self.command(command).await?;
                if !reply.is_preliminary() {
                    return Err(reply.into_error());
                }
                self.secure_data(tcp).await
            }
            DataMode::Active(active) => {
                let listener = data::bind_active(active.port_range, self.local_ip).await?;
                let advertised =
                    data::advertised_address(listener.local_addr()?, active.external_address);
                self.expect_completion(&codec::port_command(advertised)).await?;

                let reply = self.command(command).await?;
                if !reply.is_preliminary() {
                    return Err(reply.into_error());
                }
                let tcp = data::accept(&listener, self.data_timeout).await?;
                self.secure_data(tcp).await
            }
        }
    }

    /// Receive a whole data transfer and its closing reply.
    async fn transfer_in(&mut self, command: &str) -> Result<Vec<u8>, SessionError> {
        let mut stream = self.open_data(command).await?;
        let received = data::read_to_end(&mut stream, self.buffer_size, self.data_timeout).await;
        drop(stream);
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => {
                // The 226/426 reply is now out of step with our reads.
                self.connected = false;
                return Err(e);
            }
        };
        let done = self.read_reply().await?;
        if !done.is_completion() {
            return Err(done.into_error());
        }
        Ok(bytes)
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.connected {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

impl FtpSession for FtpClient {
    fn is_connected(&self) -> bool {
        self.connected && self.stream.tcp().is_some_and(socket_alive)
    }

    fn login<'a>(
        &'a mut self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let user = self
                .command(&format!("USER {}", credentials.username))
                .await?;
            let reply = match user.code {
                230 => return Ok(()),
                331 => {
                    self.command(&format!("PASS {}", credentials.password()))
                        .await?
                }
                _ => return Err(user.into_error()),
            };
            match reply.code {
                230 | 202 => {
                    tracing::debug!(host = %self.host, user = %credentials.username, "logged in");
                    Ok(())
                }
                332 => Err(SessionError::Protocol(
                    "server requires an ACCT, which is not supported".to_string(),
                )),
                _ => Err(reply.into_error()),
            }
        })
    }

    fn apply_data_mode<'a>(
        &'a mut self,
        mode: &'a DataMode,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if let DataMode::Active(active) = mode {
                // Probe that a listener can be bound now rather than failing
                // on the first transfer.
                let probe = data::bind_active(active.port_range, self.local_ip).await?;
                drop(probe);
            }
            self.data_mode = mode.clone();
            self.settings.data_mode = Some(mode.clone());
            Ok(())
        })
    }

    fn set_transfer_type(
        &mut self,
        transfer_type: TransferType,
    ) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.expect_completion(&format!("TYPE {}", transfer_type.type_code()))
                .await?;
            self.settings.transfer_type = Some(transfer_type);
            Ok(())
        })
    }

    fn set_encoding(&mut self, encoding: Encoding) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            if encoding == Encoding::Utf8 {
                let reply = self.command("OPTS UTF8 ON").await?;
                if !reply.is_completion() {
                    tracing::debug!(
                        host = %self.host,
                        code = reply.code,
                        "server declined OPTS UTF8 ON, continuing"
                    );
                }
            }
            self.encoding = encoding;
            self.settings.encoding = Some(encoding);
            Ok(())
        })
    }

    fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size;
        self.settings.buffer_size = Some(size);
    }

    fn set_keep_alive(&mut self, interval: Option<Duration>) -> Result<(), SessionError> {
        let tcp = self.stream.tcp().ok_or(SessionError::Closed)?;
        set_keepalive(tcp, interval)?;
        self.settings.keep_alive = interval;
        Ok(())
    }

    fn noop(&mut self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.expect_completion("NOOP").await.map(|_| ())
        })
    }

    fn list<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>, SessionError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            let command = if path.is_empty() {
                "LIST".to_string()
            } else {
                format!("LIST {path}")
            };
            let bytes = self.transfer_in(&command).await?;
            let text = codec::decode(&bytes, self.encoding);
            Ok(text
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect())
        })
    }

    fn retrieve<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SessionError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.transfer_in(&format!("RETR {path}")).await
        })
    }

    fn store<'a>(
        &'a mut self,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, SessionError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            let mut stream = self.open_data(&format!("STOR {path}")).await?;
            let sent =
                data::write_all(&mut stream, bytes, self.buffer_size, self.data_timeout).await;
            drop(stream);
            let sent = match sent {
                Ok(n) => n,
                Err(e) => {
                    self.connected = false;
                    return Err(e);
                }
            };
            let done = self.read_reply().await?;
            if !done.is_completion() {
                return Err(done.into_error());
            }
            Ok(sent)
        })
    }

    fn delete<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.expect_completion(&format!("DELE {path}")).await.map(|_| ())
        })
    }

    fn quit(&mut self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            let result = self.expect_completion("QUIT").await.map(|_| ());
            self.connected = false;
            result
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut stream = std::mem::replace(&mut self.stream, Stream::Detached);
            let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
            self.connected = false;
        })
    }

    fn settings(&self) -> &AppliedSettings {
        &self.settings
    }
}

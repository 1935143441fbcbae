//! In-process FTP server and HTTP CONNECT proxy for integration tests.
//!
//! `MockFtpServer` speaks just enough of RFC 959 / RFC 4217 for the client:
//! login, `AUTH TLS`, `PBSZ`/`PROT`, `PASV`/`PORT`, `LIST`/`RETR`/`STOR`/`DELE`
//! and `QUIT`. Files live in memory and every received command is recorded.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type Control = BufReader<Box<dyn Io>>;

// ── Certificates ─────────────────────────────────────────────────────

/// Self-signed certificate for `localhost` plus a server config built on it.
pub struct TestCert {
    pub pem: String,
    pub server_config: Arc<ServerConfig>,
}

impl TestCert {
    pub fn localhost(versions: &[&'static rustls::SupportedProtocolVersion]) -> anyhow::Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(versions)?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
        // Unread tickets on a closed data socket turn the close into a reset.
        config.send_tls13_tickets = 0;

        Ok(Self {
            pem: certified.cert.pem(),
            server_config: Arc::new(config),
        })
    }

    /// Write the certificate to a unique PEM file for use as a trust store.
    pub fn write_pem(&self, name: &str) -> anyhow::Result<std::path::PathBuf> {
        let dir = std::env::temp_dir().join(format!("ftpool-it-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.pem"));
        std::fs::write(&path, &self.pem)?;
        Ok(path)
    }
}

/// Route client logs to the test harness; `RUST_LOG=ftpool=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MockFtpServer ────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub enum TlsMode {
    #[default]
    None,
    Implicit(Arc<ServerConfig>),
    Explicit(Arc<ServerConfig>),
}

#[derive(Clone, Default)]
pub struct ServerOptions {
    pub tls: TlsMode,
    /// Greet with `421` and hang up instead of `220`.
    pub refuse_greeting: bool,
    /// Answer `OPTS UTF8 ON` with `502`.
    pub decline_utf8: bool,
}

/// Shared, inspectable server state.
#[derive(Default)]
pub struct ServerState {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub commands: Mutex<Vec<String>>,
    pub sessions: AtomicUsize,
    pub logins: AtomicUsize,
    pub quits: AtomicUsize,
}

impl ServerState {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn saw(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
}

pub struct MockFtpServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    kick: watch::Sender<u64>,
}

impl MockFtpServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> anyhow::Result<Self> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());
        let (kick, _) = watch::channel(0u64);

        let accept_state = Arc::clone(&state);
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.sessions.fetch_add(1, Ordering::SeqCst);
                let session = Session {
                    state: Arc::clone(&accept_state),
                    options: options.clone(),
                    kick: accept_kick.subscribe(),
                    pending: None,
                    protected: false,
                };
                tokio::spawn(async move {
                    let _ = session.run(stream).await;
                });
            }
        });

        Ok(Self { addr, state, kick })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Drop every open control connection without a reply.
    pub fn disconnect_all(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(path).cloned()
    }
}

enum PendingData {
    Passive(TcpListener),
    Active(SocketAddr),
}

struct Session {
    state: Arc<ServerState>,
    options: ServerOptions,
    kick: watch::Receiver<u64>,
    pending: Option<PendingData>,
    protected: bool,
}

async fn reply(control: &mut Control, line: &str) -> std::io::Result<()> {
    let inner = control.get_mut();
    inner.write_all(format!("{line}\r\n").as_bytes()).await?;
    inner.flush().await
}

impl Session {
    async fn run(mut self, stream: TcpStream) -> anyhow::Result<()> {
        let io: Box<dyn Io> = match &self.options.tls {
            TlsMode::Implicit(config) => {
                Box::new(TlsAcceptor::from(Arc::clone(config)).accept(stream).await?)
            }
            _ => Box::new(stream),
        };
        let mut control = BufReader::new(io);

        if self.options.refuse_greeting {
            reply(&mut control, "421 Too many users, try later").await?;
            return Ok(());
        }
        reply(&mut control, "220 mock ftp ready").await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = control.read_line(&mut line) => read?,
                _ = self.kick.changed() => return Ok(()),
            };
            if read == 0 {
                return Ok(());
            }
            let command = line.trim_end().to_string();
            self.state.commands.lock().unwrap().push(command.clone());
            let (verb, arg) = match command.split_once(' ') {
                Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
                None => (command.to_ascii_uppercase(), String::new()),
            };

            match verb.as_str() {
                "AUTH" => match &self.options.tls {
                    TlsMode::Explicit(config) => {
                        reply(&mut control, "234 AUTH TLS successful").await?;
                        let acceptor = TlsAcceptor::from(Arc::clone(config));
                        let plain = control.into_inner();
                        let tls = acceptor.accept(plain).await?;
                        control = BufReader::new(Box::new(tls) as Box<dyn Io>);
                    }
                    _ => reply(&mut control, "502 AUTH not supported").await?,
                },
                "PBSZ" => reply(&mut control, "200 PBSZ=0").await?,
                "PROT" => {
                    self.protected = arg.eq_ignore_ascii_case("P");
                    reply(&mut control, "200 protection level set").await?;
                }
                "USER" => reply(&mut control, "331 password required").await?,
                "PASS" => {
                    if arg == PASSWORD {
                        self.state.logins.fetch_add(1, Ordering::SeqCst);
                        reply(&mut control, "230 logged in").await?;
                    } else {
                        reply(&mut control, "530 login incorrect").await?;
                    }
                }
                "OPTS" if self.options.decline_utf8 => {
                    reply(&mut control, "502 OPTS not implemented").await?
                }
                "OPTS" => reply(&mut control, "200 UTF8 enabled").await?,
                "TYPE" => reply(&mut control, &format!("200 type set to {arg}")).await?,
                "NOOP" => reply(&mut control, "200 ok").await?,
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await?;
                    let port = listener.local_addr()?.port();
                    self.pending = Some(PendingData::Passive(listener));
                    let text = format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port >> 8,
                        port & 0xff
                    );
                    reply(&mut control, &text).await?;
                }
                "PORT" => match parse_port(&arg) {
                    Some(addr) => {
                        self.pending = Some(PendingData::Active(addr));
                        reply(&mut control, "200 PORT command successful").await?;
                    }
                    None => reply(&mut control, "501 bad PORT argument").await?,
                },
                "LIST" => {
                    let listing: String = self
                        .state
                        .files
                        .lock()
                        .unwrap()
                        .keys()
                        .map(|name| format!("{name}\r\n"))
                        .collect();
                    self.send_data(&mut control, listing.into_bytes()).await?;
                }
                "RETR" => {
                    let data = self.state.files.lock().unwrap().get(&arg).cloned();
                    match data {
                        Some(data) => self.send_data(&mut control, data).await?,
                        None => {
                            self.pending = None;
                            reply(&mut control, "550 no such file").await?;
                        }
                    }
                }
                "STOR" => {
                    reply(&mut control, "150 ok to send data").await?;
                    let mut data_stream = self.open_data().await?;
                    let mut received = Vec::new();
                    data_stream.read_to_end(&mut received).await?;
                    drop(data_stream);
                    self.state.files.lock().unwrap().insert(arg, received);
                    reply(&mut control, "226 transfer complete").await?;
                }
                "DELE" => {
                    let removed = self.state.files.lock().unwrap().remove(&arg);
                    match removed {
                        Some(_) => reply(&mut control, "250 deleted").await?,
                        None => reply(&mut control, "550 no such file").await?,
                    }
                }
                "QUIT" => {
                    self.state.quits.fetch_add(1, Ordering::SeqCst);
                    reply(&mut control, "221 goodbye").await?;
                    return Ok(());
                }
                _ => reply(&mut control, "502 command not implemented").await?,
            }
        }
    }

    async fn send_data(&mut self, control: &mut Control, data: Vec<u8>) -> anyhow::Result<()> {
        reply(control, "150 opening data connection").await?;
        let mut data_stream = self.open_data().await?;
        data_stream.write_all(&data).await?;
        data_stream.shutdown().await?;
        drop(data_stream);
        reply(control, "226 transfer complete").await?;
        Ok(())
    }

    async fn open_data(&mut self) -> anyhow::Result<Box<dyn Io>> {
        let tcp = match self.pending.take() {
            Some(PendingData::Passive(listener)) => listener.accept().await?.0,
            Some(PendingData::Active(addr)) => TcpStream::connect(addr).await?,
            None => anyhow::bail!("no PASV or PORT before transfer"),
        };
        match (&self.options.tls, self.protected) {
            (TlsMode::Implicit(config) | TlsMode::Explicit(config), true) => Ok(Box::new(
                TlsAcceptor::from(Arc::clone(config)).accept(tcp).await?,
            )),
            _ => Ok(Box::new(tcp)),
        }
    }
}

fn parse_port(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<u8> = arg
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    let [a, b, c, d, hi, lo] = parts.as_slice() else {
        return None;
    };
    let port = u16::from(*hi) << 8 | u16::from(*lo);
    Some(SocketAddr::from(([*a, *b, *c, *d], port)))
}

// ── MockHttpProxy ────────────────────────────────────────────────────

/// HTTP CONNECT proxy that tunnels to whatever target it is asked for.
pub struct MockHttpProxy {
    pub addr: SocketAddr,
    pub tunnels: Arc<AtomicUsize>,
    pub authorizations: Arc<Mutex<Vec<String>>>,
}

impl MockHttpProxy {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let tunnels = Arc::new(AtomicUsize::new(0));
        let authorizations = Arc::new(Mutex::new(Vec::new()));

        let (accept_tunnels, accept_auth) = (Arc::clone(&tunnels), Arc::clone(&authorizations));
        tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                let tunnels = Arc::clone(&accept_tunnels);
                let authorizations = Arc::clone(&accept_auth);
                tokio::spawn(async move {
                    let _ = tunnel(client, tunnels, authorizations).await;
                });
            }
        });

        Ok(Self {
            addr,
            tunnels,
            authorizations,
        })
    }

    pub fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }
}

async fn tunnel(
    mut client: TcpStream,
    tunnels: Arc<AtomicUsize>,
    authorizations: Arc<Mutex<Vec<String>>>,
) -> anyhow::Result<()> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if client.read(&mut byte).await? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&head).to_string();
    let target = text
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("CONNECT "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string);
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Proxy-Authorization: ") {
            authorizations.lock().unwrap().push(value.to_string());
        }
    }

    let Some(target) = target else {
        client
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Ok(());
    };
    let mut upstream = match TcpStream::connect(target.as_str()).await {
        Ok(upstream) => upstream,
        Err(_) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };
    tunnels.fetch_add(1, Ordering::SeqCst);
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

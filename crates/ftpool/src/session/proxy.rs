//! Proxy tunnels for control and passive data connections.
//!
//! Each handshake runs on an already-connected stream to the proxy and
//! leaves it as a transparent pipe to `host:port`. No byte past the proxy's
//! own response is consumed, so an FTP banner sent right after the tunnel
//! opens is left for the control channel reader.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ftpool_core::{ProxyConfig, ProxyKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HTTP_RESPONSE_HEAD: usize = 8 * 1024;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_PASSWORD_VERSION: u8 = 0x01;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn proxy_err(message: impl Into<String>) -> io::Error {
    io::Error::other(message.into())
}

/// Run the configured proxy handshake so `stream` reaches `host:port`.
pub async fn establish<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy.kind {
        ProxyKind::Http => http_connect(stream, proxy, host, port).await,
        ProxyKind::Socks4 => socks4_connect(stream, proxy, host, port).await,
        ProxyKind::Socks5 => socks5_connect(stream, proxy, host, port).await,
    }?;
    tracing::debug!(
        proxy = %proxy.kind,
        proxy_host = %proxy.host,
        target = %host,
        port = port,
        "proxy tunnel established"
    );
    Ok(())
}

// ── HTTP CONNECT ─────────────────────────────────────────────────────

async fn http_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(creds) = &proxy.credentials {
        let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password()));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time so nothing past the blank line is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_RESPONSE_HEAD {
            return Err(proxy_err("http proxy response head too large"));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "http proxy closed the connection during CONNECT",
            ));
        }
        head.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&head);
    let status_line = text.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| proxy_err(format!("malformed http proxy status line: {status_line:?}")))?;
    if !(200..300).contains(&status) {
        return Err(proxy_err(format!("http proxy refused CONNECT: {status_line}")));
    }
    Ok(())
}

// ── SOCKS4 / SOCKS4a ─────────────────────────────────────────────────

async fn socks4_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target: Option<Ipv4Addr> = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Some(ip),
        Ok(IpAddr::V6(_)) => return Err(proxy_err("socks4 cannot reach IPv6 targets")),
        Err(_) => None,
    };

    let mut request = vec![SOCKS4_VERSION, SOCKS_CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());
    match target {
        Some(ip) => request.extend_from_slice(&ip.octets()),
        // SOCKS4a: 0.0.0.x tells the proxy to resolve the trailing hostname.
        None => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some(creds) = &proxy.credentials {
        request.extend_from_slice(creds.username.as_bytes());
    }
    request.push(0);
    if target.is_none() {
        request.extend_from_slice(host.as_bytes());
        request.push(0);
    }
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(proxy_err(format!(
            "invalid socks4 reply version {:#04x}",
            reply[0]
        )));
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(proxy_err(format!(
            "socks4 request rejected (code {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

// ── SOCKS5 (RFC 1928 / RFC 1929) ─────────────────────────────────────

async fn socks5_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if proxy.credentials.is_some() {
        &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(proxy_err(format!(
            "invalid socks5 version: expected {SOCKS5_VERSION}, got {}",
            choice[0]
        )));
    }
    match choice[1] {
        SOCKS5_AUTH_NONE => {}
        SOCKS5_AUTH_PASSWORD => {
            let creds = proxy
                .credentials
                .as_ref()
                .ok_or_else(|| proxy_err("socks5 proxy demands credentials"))?;
            let user = creds.username.as_bytes();
            let pass = creds.password().as_bytes();
            let (ulen, plen) = match (u8::try_from(user.len()), u8::try_from(pass.len())) {
                (Ok(u), Ok(p)) => (u, p),
                _ => return Err(proxy_err("socks5 credentials longer than 255 bytes")),
            };
            let mut auth = vec![SOCKS5_PASSWORD_VERSION, ulen];
            auth.extend_from_slice(user);
            auth.push(plen);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(proxy_err("socks5 authentication failed"));
            }
        }
        SOCKS5_AUTH_NO_ACCEPTABLE => {
            return Err(proxy_err("socks5 proxy accepted no offered auth method"));
        }
        other => {
            return Err(proxy_err(format!(
                "socks5 proxy chose unsupported auth method {other:#04x}"
            )));
        }
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| proxy_err("socks5 target hostname longer than 255 bytes"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(proxy_err(format!(
            "socks5 connect failed: {} (code {:#04x})",
            socks5_reply_message(head[1]),
            head[1]
        )));
    }
    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(proxy_err(format!(
                "socks5 reply has unknown address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "ttl expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

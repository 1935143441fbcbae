//! FTP control channel framing (RFC 959 §4.2).
//!
//! Commands are single CRLF-terminated lines. Replies are one line
//! `NNN text` or a multi-line block opened by `NNN-text` and closed by the
//! first line starting with the same code followed by a space.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use ftpool_core::Encoding;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SessionError;

/// Longest control line accepted before the peer is treated as broken.
pub const MAX_LINE: usize = 16 * 1024;

/// A complete server reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Reply text without the code prefix, one entry per line.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// 1yz: the server will send another reply before the command completes.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn into_error(self) -> SessionError {
        SessionError::Reply {
            code: self.code,
            text: self.text(),
        }
    }
}

/// Byte buffer holding data read past the end of the current line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    chunk: usize,
}

impl LineBuffer {
    pub fn new(chunk: usize) -> Self {
        Self {
            pending: Vec::new(),
            chunk: chunk.clamp(512, MAX_LINE),
        }
    }

    /// `true` if bytes beyond the last line are buffered. Must be `false`
    /// before the control stream is handed to a TLS handshake.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Read one line, without its terminator.
    pub async fn read_line<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, SessionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            if self.pending.len() > MAX_LINE {
                return Err(SessionError::Protocol(format!(
                    "control line exceeds {MAX_LINE} bytes"
                )));
            }
            let mut chunk = vec![0u8; self.chunk];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(SessionError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Split `NNN text` / `NNN-text` into code, continuation flag and text.
fn split_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    match bytes.get(3) {
        None => Some((code, false, "")),
        Some(b' ') => Some((code, false, &line[4..])),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(_) => None,
    }
}

/// Read one complete (possibly multi-line) reply.
pub async fn read_reply<R>(
    reader: &mut R,
    buffer: &mut LineBuffer,
    encoding: Encoding,
) -> Result<Reply, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let first = decode(&buffer.read_line(reader).await?, encoding);
    let (code, continued, text) = split_reply_line(&first)
        .ok_or_else(|| SessionError::Protocol(format!("malformed reply line: {first:?}")))?;
    if !(100..600).contains(&code) {
        return Err(SessionError::Protocol(format!("reply code out of range: {code}")));
    }

    let mut lines = vec![text.to_string()];
    if continued {
        loop {
            let line = decode(&buffer.read_line(reader).await?, encoding);
            match split_reply_line(&line) {
                Some((c, false, text)) if c == code => {
                    lines.push(text.to_string());
                    break;
                }
                _ => lines.push(line),
            }
        }
    }
    Ok(Reply { code, lines })
}

/// Encode a command line for the wire, CRLF included.
pub fn encode_command(command: &str, encoding: Encoding) -> Result<Vec<u8>, SessionError> {
    if command.contains(['\r', '\n']) {
        return Err(SessionError::Protocol(
            "command contains a line break".to_string(),
        ));
    }
    let mut bytes = encode(command, encoding)?;
    bytes.extend_from_slice(b"\r\n");
    Ok(bytes)
}

/// Command text safe for logs.
pub fn redact(command: &str) -> &str {
    if command.len() >= 5 && command[..5].eq_ignore_ascii_case("PASS ") {
        "PASS ****"
    } else {
        command
    }
}

pub fn decode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

pub fn encode(text: &str, encoding: Encoding) -> Result<Vec<u8>, SessionError> {
    match encoding {
        Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
        Encoding::Latin1 => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| {
                    SessionError::Protocol(format!("character {c:?} is not representable in ISO-8859-1"))
                })
            })
            .collect(),
    }
}

/// Parse the `h1,h2,h3,h4,p1,p2` tuple from a `227` reply.
pub fn parse_pasv(text: &str) -> Result<SocketAddrV4, SessionError> {
    let candidate = text
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .find(|run| run.split(',').count() == 6)
        .ok_or_else(|| SessionError::Protocol(format!("no address in PASV reply: {text:?}")))?;

    let mut parts = [0u8; 6];
    for (slot, part) in parts.iter_mut().zip(candidate.split(',')) {
        *slot = part
            .parse()
            .map_err(|_| SessionError::Protocol(format!("bad PASV octet {part:?}")))?;
    }
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = (u16::from(parts[4]) << 8) | u16::from(parts[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Format the argument for `PORT` (IPv4) or `EPRT` (IPv6).
///
/// Returns the full command line.
pub fn port_command(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let [a, b, c, d] = ip.octets();
            let port = addr.port();
            format!("PORT {a},{b},{c},{d},{},{}", port >> 8, port & 0xff)
        }
        IpAddr::V6(ip) => format!("EPRT |2|{ip}|{}|", addr.port()),
    }
}

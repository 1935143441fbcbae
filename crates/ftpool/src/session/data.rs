//! Data channel plumbing: active-mode listeners, passive connects and
//! timeout-bounded bulk transfer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ftpool_core::{PortRange, ProxyConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{dial_tcp, proxy};
use crate::error::SessionError;

/// Bind a listener for an active-mode transfer on `ip`, using the first
/// free port of `range` or an ephemeral port when no range is configured.
pub async fn bind_active(range: Option<PortRange>, ip: IpAddr) -> io::Result<TcpListener> {
    let Some(range) = range else {
        return TcpListener::bind((ip, 0)).await;
    };
    for port in range.ports() {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in active range {range}"),
    ))
}

/// Address announced in `PORT`/`EPRT`: the external address when set
/// (NAT traversal), else the listener's own.
pub fn advertised_address(local: SocketAddr, external: Option<IpAddr>) -> SocketAddr {
    SocketAddr::new(external.unwrap_or(local.ip()), local.port())
}

pub async fn accept(listener: &TcpListener, timeout: Duration) -> Result<TcpStream, SessionError> {
    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            tracing::trace!(peer = %peer, "accepted active data connection");
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}

/// Connect to a passive data port, tunnelling through the proxy when one is
/// configured for the control connection.
pub async fn connect_passive(
    addr: SocketAddr,
    proxy: Option<&ProxyConfig>,
    timeout: Duration,
) -> Result<TcpStream, SessionError> {
    let host = addr.ip().to_string();
    match proxy {
        None => dial_tcp(&host, addr.port(), timeout)
            .await
            .map_err(|e| SessionError::Io(io::Error::other(e.to_string()))),
        Some(proxy_cfg) => {
            let mut tcp = dial_tcp(&proxy_cfg.host, proxy_cfg.port, timeout)
                .await
                .map_err(|e| SessionError::Io(io::Error::other(e.to_string())))?;
            match tokio::time::timeout(
                timeout,
                proxy::establish(&mut tcp, proxy_cfg, &host, addr.port()),
            )
            .await
            {
                Ok(Ok(())) => Ok(tcp),
                Ok(Err(e)) => Err(SessionError::Io(e)),
                Err(_) => Err(SessionError::Timeout(timeout)),
            }
        }
    }
}

/// Read until EOF, each read bounded by `timeout`.
pub async fn read_to_end<S>(
    stream: &mut S,
    chunk: usize,
    timeout: Duration,
) -> Result<Vec<u8>, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk.max(512)];
    loop {
        let n = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            // Servers commonly close FTPS data channels without close_notify;
            // the final transfer reply tells whether the data is complete.
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Ok(Err(e)) => return Err(SessionError::Io(e)),
            Err(_) => return Err(SessionError::Timeout(timeout)),
        };
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Write `data` in `chunk`-sized pieces, then shut the write side down so
/// the server sees end-of-file.
pub async fn write_all<S>(
    stream: &mut S,
    data: &[u8],
    chunk: usize,
    timeout: Duration,
) -> Result<u64, SessionError>
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    for piece in data.chunks(chunk.max(512)) {
        match tokio::time::timeout(timeout, stream.write_all(piece)).await {
            Ok(Ok(())) => written += piece.len() as u64,
            Ok(Err(e)) => return Err(SessionError::Io(e)),
            Err(_) => return Err(SessionError::Timeout(timeout)),
        }
    }
    match tokio::time::timeout(timeout, stream.shutdown()).await {
        Ok(Ok(())) => Ok(written),
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn bind_active_uses_first_free_port_in_range() {
        // Grab a free port, hold it, and make it the start of the range.
        let held = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let start = held.local_addr().unwrap().port();
        let Ok(range) = PortRange::new(start, start.saturating_add(20)) else {
            return;
        };

        let listener = bind_active(Some(range), LOOPBACK).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(range.contains(port));
        assert_ne!(port, start, "held port must be skipped");
    }

    #[tokio::test]
    async fn bind_active_exhausted_range() {
        let held = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let range = PortRange::new(port, port).unwrap();
        let err = bind_active(Some(range), LOOPBACK).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn bind_active_without_range_is_ephemeral() {
        let listener = bind_active(None, LOOPBACK).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn external_address_replaces_local_ip() {
        let local: SocketAddr = "10.0.0.5:50001".parse().unwrap();
        let external: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(
            advertised_address(local, Some(external)),
            "203.0.113.9:50001".parse().unwrap()
        );
        assert_eq!(advertised_address(local, None), local);
    }

    #[tokio::test]
    async fn accept_times_out() {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let err = accept(&listener, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test]
    async fn bulk_transfer_through_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_all(&mut a, &payload, 700, Duration::from_secs(2))
                .await
                .unwrap()
        });
        let received = read_to_end(&mut b, 512, Duration::from_secs(2)).await.unwrap();
        assert_eq!(writer.await.unwrap(), 10_000);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn stalled_read_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_to_end(&mut b, 512, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }
}

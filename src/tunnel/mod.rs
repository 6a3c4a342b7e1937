//! Outbound connections through a SOCKS5 intermediary.
//!
//! A [`TunnelConnection`] is an established, authenticated byte stream to a
//! target host. It is owned by exactly one upstream exchange and closed when
//! dropped, so every exit path of that exchange releases it.

pub mod socks5;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub use socks5::{Credentials, Socks5Dialer};

/// Reply codes a SOCKS5 intermediary can answer a CONNECT with (RFC 1928 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl ReplyCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyCode::Succeeded => f.write_str("succeeded"),
            ReplyCode::GeneralFailure => f.write_str("general SOCKS server failure"),
            ReplyCode::NotAllowed => f.write_str("connection not allowed by ruleset"),
            ReplyCode::NetworkUnreachable => f.write_str("network unreachable"),
            ReplyCode::HostUnreachable => f.write_str("host unreachable"),
            ReplyCode::ConnectionRefused => f.write_str("connection refused"),
            ReplyCode::TtlExpired => f.write_str("TTL expired"),
            ReplyCode::CommandNotSupported => f.write_str("command not supported"),
            ReplyCode::AddressTypeNotSupported => f.write_str("address type not supported"),
            ReplyCode::Unknown(code) => write!(f, "unknown reply code {code:#04x}"),
        }
    }
}

/// Failures while establishing a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The intermediary itself could not be reached.
    #[error("failed to reach SOCKS5 proxy {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Username/password sub-negotiation was rejected.
    #[error("SOCKS5 proxy rejected the credentials")]
    Auth,

    /// None of the offered authentication methods were acceptable.
    #[error("SOCKS5 proxy accepted none of the offered authentication methods")]
    NoAcceptableMethod,

    /// The CONNECT request was answered with a failure reply.
    #[error("SOCKS5 connect to {target} failed: {reply}")]
    Connect { target: String, reply: ReplyCode },

    /// The intermediary spoke something other than SOCKS5.
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("SOCKS5 handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error during SOCKS5 handshake: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Timeout(_))
    }
}

/// An established tunnel to `target`.
///
/// Reads and writes carry raw application bytes (TLS or plain HTTP); the
/// SOCKS5 exchange is already complete.
#[derive(Debug)]
pub struct TunnelConnection {
    stream: TcpStream,
    target: String,
}

impl TunnelConnection {
    pub(crate) fn new(stream: TcpStream, target: String) -> Self {
        Self { stream, target }
    }

    /// The `host:port` this tunnel leads to.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

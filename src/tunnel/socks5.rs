//! SOCKS5 client (RFC 1928) with username/password authentication (RFC 1929).

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::tunnel::{ReplyCode, TunnelConnection, TunnelError};

// SOCKS protocol constants
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_USERPASS: u8 = 0x02;
const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_USERPASS_VERSION: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_RSV: u8 = 0x00;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Username/password pair for the intermediary.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens tunnels through one configured SOCKS5 intermediary.
///
/// The dialer holds no connection state; each [`dial`](Self::dial) opens a
/// fresh TCP connection to the intermediary.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_host: String,
    proxy_port: u16,
    credentials: Option<Credentials>,
    connect_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(
        proxy_host: impl Into<String>,
        proxy_port: u16,
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            credentials,
            connect_timeout,
        }
    }

    pub fn proxy_addr(&self) -> String {
        join_host_port(&self.proxy_host, self.proxy_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Opens a tunnel to `host:port`.
    ///
    /// The TCP connect and the whole SOCKS5 exchange share one deadline of
    /// `connect_timeout`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TunnelConnection, TunnelError> {
        timeout(self.connect_timeout, self.establish(host, port))
            .await
            .map_err(|_| TunnelError::Timeout(self.connect_timeout))?
    }

    async fn establish(&self, host: &str, port: u16) -> Result<TunnelConnection, TunnelError> {
        let addr = self.proxy_addr();
        let mut stream = TcpStream::connect((self.proxy_host.as_str(), self.proxy_port))
            .await
            .map_err(|source| TunnelError::Dial {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        tracing::trace!(proxy = %addr, "connected to SOCKS5 proxy");

        handshake(&mut stream, host, port, self.credentials.as_ref()).await?;

        let target = join_host_port(host, port);
        tracing::debug!(proxy = %addr, target = %target, "SOCKS5 tunnel established");
        Ok(TunnelConnection::new(stream, target))
    }
}

/// Runs the client side of a SOCKS5 CONNECT exchange on `stream`.
///
/// On success the stream is positioned right after the server's reply and
/// carries raw bytes to `host:port` from then on.
pub async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = negotiate_method(stream, credentials).await?;

    if method == SOCKS5_AUTH_USERPASS {
        // negotiate_method only returns USERPASS when credentials exist
        let credentials = credentials.ok_or_else(|| {
            TunnelError::Protocol("proxy selected an authentication method we did not offer".into())
        })?;
        authenticate(stream, credentials).await?;
    }

    send_connect(stream, host, port).await?;
    read_connect_reply(stream, host, port).await
}

async fn negotiate_method<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<u8, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client greeting: version, method count, methods
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_USERPASS]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected version {:#04x} in method selection",
            response[0]
        )));
    }

    match response[1] {
        SOCKS5_AUTH_NONE => Ok(SOCKS5_AUTH_NONE),
        SOCKS5_AUTH_USERPASS if credentials.is_some() => Ok(SOCKS5_AUTH_USERPASS),
        SOCKS5_AUTH_NO_ACCEPTABLE => Err(TunnelError::NoAcceptableMethod),
        other => Err(TunnelError::Protocol(format!(
            "proxy selected unoffered authentication method {other:#04x}"
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, credentials: &Credentials) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();
    let ulen = u8::try_from(username.len())
        .map_err(|_| TunnelError::Protocol("username longer than 255 bytes".into()))?;
    let plen = u8::try_from(password.len())
        .map_err(|_| TunnelError::Protocol("password longer than 255 bytes".into()))?;

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(SOCKS5_USERPASS_VERSION);
    request.push(ulen);
    request.extend_from_slice(username);
    request.push(plen);
    request.extend_from_slice(password);
    stream.write_all(&request).await?;
    stream.flush().await?;

    // Reply: sub-negotiation version, status (0 = success)
    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS5_USERPASS_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected sub-negotiation version {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(TunnelError::Auth);
    }

    Ok(())
}

async fn send_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Format: version 5, connect command, reserved byte, dst address, dst port
    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, SOCKS5_RSV];
    encode_address(&mut request, host)?;
    request.extend_from_slice(&port.to_be_bytes());

    stream.write_all(&request).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_connect_reply<S>(stream: &mut S, host: &str, port: u16) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Reply header: version, reply code, reserved, bound address type
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected version {:#04x} in connect reply",
            header[0]
        )));
    }

    let reply = ReplyCode::from_u8(header[1]);
    if reply != ReplyCode::Succeeded {
        return Err(TunnelError::Connect {
            target: join_host_port(host, port),
            reply,
        });
    }

    // Bound address is not used, but must be drained
    match header[3] {
        SOCKS5_ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
        }
        SOCKS5_ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut addr = vec![0u8; len as usize];
            stream.read_exact(&mut addr).await?;
        }
        SOCKS5_ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
        }
        other => {
            return Err(TunnelError::Protocol(format!(
                "unknown bound address type {other:#04x}"
            )));
        }
    }

    let mut bound_port = [0u8; 2];
    stream.read_exact(&mut bound_port).await?;

    Ok(())
}

/// Appends the SOCKS5 address encoding of `host`.
///
/// IP literals (IPv6 with or without brackets) are sent as addresses, and
/// anything else as a domain name so the intermediary resolves it.
fn encode_address(buf: &mut Vec<u8>, host: &str) -> Result<(), TunnelError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');

    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ipv4)) => {
            buf.push(SOCKS5_ATYP_IPV4);
            buf.extend_from_slice(&ipv4.octets());
        }
        Ok(IpAddr::V6(ipv6)) => {
            buf.push(SOCKS5_ATYP_IPV6);
            buf.extend_from_slice(&ipv6.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| TunnelError::Protocol(format!("invalid target host length for {host:?}")))?;
            buf.push(SOCKS5_ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(name);
        }
    }

    Ok(())
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

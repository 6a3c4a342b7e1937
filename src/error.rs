//! Error types for a single relayed exchange.

use std::io;
use std::time::Duration;

use crate::http::response::StatusCode;
use crate::tunnel::TunnelError;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can end one relayed request.
///
/// None of these are fatal to the process; the orchestrator turns each into
/// a client-facing status (when nothing has been sent yet) and a log entry.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Reaching the upstream through the SOCKS5 intermediary failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// TLS handshake with the upstream failed.
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The upstream went quiet for longer than allowed.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// The inbound request cannot be mapped onto the upstream.
    #[error("cannot translate request: {0}")]
    Translation(String),

    /// The upstream sent something that is not valid HTTP/1.x.
    #[error("malformed upstream response: {0}")]
    UpstreamProtocol(String),

    /// Writing to the client failed; it went away.
    #[error("client disconnected: {0}")]
    ClientDisconnect(#[source] io::Error),

    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Status reported to the client when the failure happens before any
    /// response bytes were written.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Tunnel(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Tunnel(_) => StatusCode::BAD_GATEWAY,
            RelayError::Tls { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Translation(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            RelayError::ClientDisconnect(_) | RelayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short, client-safe description used in synthesized error bodies.
    pub fn client_message(&self) -> &'static str {
        match self {
            RelayError::Tunnel(e) if e.is_timeout() => "timed out connecting through tunnel",
            RelayError::Tunnel(_) => "tunnel connection failed",
            RelayError::Tls { .. } => "TLS handshake with upstream failed",
            RelayError::Timeout(_) => "upstream request timed out",
            RelayError::Translation(_) => "malformed request",
            RelayError::UpstreamProtocol(_) => "invalid response from upstream",
            RelayError::ClientDisconnect(_) | RelayError::Io(_) => "internal proxy error",
        }
    }
}

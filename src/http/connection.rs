use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::http::parser::{ParseError, RequestDecoder};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::Relay;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
    buffer: BytesMut,
    decoder: RequestDecoder,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter),
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, relay: Arc<Relay>) -> Self {
        Self {
            stream,
            peer,
            relay,
            buffer: BytesMut::with_capacity(8192),
            decoder: RequestDecoder::new(),
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await {
                    Ok(Some(req)) => {
                        self.state = ConnectionState::Processing(req);
                    }
                    Ok(None) => {
                        self.state = ConnectionState::Closed;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer, error = ?e, "rejecting malformed request");
                        let status = match e {
                            ParseError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                            _ => StatusCode::BAD_REQUEST,
                        };
                        let response = Response::error(status, "malformed request");
                        // Nothing more can be read reliably from this stream
                        self.state = ConnectionState::Writing(ResponseWriter::new(&response));
                    }
                },

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let outcome = self.relay.handle(req, self.peer, &mut self.stream).await;

                    if outcome.connection_reusable() && keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Writing(mut writer) => {
                    writer.write_to_stream(&mut self.stream).await?;
                    self.state = ConnectionState::Closed;
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads until one complete request is buffered.
    ///
    /// Returns `Ok(None)` when the client closes the connection between
    /// requests.
    pub async fn read_request(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            if let Some(request) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(request));
            }

            self.buffer.reserve(8192);
            let n = match self.stream.read_buf(&mut self.buffer).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "client read failed");
                    return Ok(None);
                }
            };

            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(peer = %self.peer, buffered = self.buffer.len(), "client closed mid-request");
                }
                return Ok(None);
            }
        }
    }
}

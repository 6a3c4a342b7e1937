//! Per-request control flow.
//!
//! A relay moves through
//! `Received -> Translated -> Dispatching -> {BufferedComplete | StreamingInProgress -> StreamingComplete}`
//! and can fail from any phase. Failures before the first response byte
//! become a synthesized error response; after that the only signal left is
//! closing the client connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWrite;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::error::RelayError;
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::{ResponseWriter, StreamingWriter};
use crate::proxy::translate::{translate, wants_streaming, InboundRequest};
use crate::proxy::upstream::{BufferedResponse, RelayResult, StreamedResponse, UpstreamClient};

/// Response headers that only describe the upstream-to-proxy hop.
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// How a relay ended, as far as the client connection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A complete response was written; the connection may carry another
    /// request.
    Completed,
    /// Writing to the client failed.
    ClientGone,
    /// The response was committed and then cut short.
    Aborted,
}

impl RelayOutcome {
    pub fn connection_reusable(&self) -> bool {
        *self == RelayOutcome::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Received,
    Translated,
    Dispatching,
    BufferedComplete,
    StreamingInProgress,
    StreamingComplete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Received => "received",
            Phase::Translated => "translated",
            Phase::Dispatching => "dispatching",
            Phase::BufferedComplete => "buffered_complete",
            Phase::StreamingInProgress => "streaming",
            Phase::StreamingComplete => "streaming_complete",
        };
        f.write_str(name)
    }
}

/// Relays inbound requests to the configured upstream.
///
/// Shared by every connection task; holds only read-only state.
pub struct Relay {
    config: Arc<ProxyConfig>,
    client: UpstreamClient,
}

impl Relay {
    pub fn new(config: Arc<ProxyConfig>, client: UpstreamClient) -> Self {
        Self { config, client }
    }

    pub fn from_config(config: Arc<ProxyConfig>) -> Result<Self, rustls::Error> {
        let client = UpstreamClient::from_config(&config)?;
        Ok(Self::new(config, client))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Relays one request and writes the answer to `client`.
    ///
    /// Never fails: every error is logged and turned into either an error
    /// response or a [`RelayOutcome`] telling the caller to close.
    pub async fn handle<W>(&self, request: Request, client_addr: SocketAddr, client: &mut W) -> RelayOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let inbound = InboundRequest::new(request, client_addr);
        let span = tracing::info_span!(
            "relay",
            request_id = %inbound.id,
            client_ip = %client_addr.ip(),
        );
        self.relay(inbound, client).instrument(span).await
    }

    async fn relay<W>(&self, inbound: InboundRequest, client: &mut W) -> RelayOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let request = &inbound.request;
        let method = request.method.clone();
        let mut phase = Phase::Received;

        tracing::info!(method = %method, path = %request.path, "request received");

        if !self.config.is_proxied_path(&request.path) {
            tracing::warn!(path = %request.path, prefix = %self.config.path_prefix, "path outside proxied prefix");
            return respond(client, &method, Response::not_found(), started).await;
        }

        if request.header("Authorization").is_none() {
            tracing::warn!("request has no Authorization header, forwarding anyway");
        }

        let outbound = match translate(&inbound, &self.config) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::warn!(error = %e, phase = %phase, "cannot translate request");
                return respond(client, &method, Response::error(e.status(), e.client_message()), started).await;
            }
        };
        phase = Phase::Translated;

        let streaming = wants_streaming(request);
        tracing::debug!(url = %outbound.url, streaming, phase = %phase, "dispatching upstream");
        phase = Phase::Dispatching;

        let result = match self.client.send(&outbound, streaming).await {
            Ok(result) => result,
            Err(e) => {
                log_upstream_failure(&e, phase);
                return respond(client, &method, Response::error(e.status(), e.client_message()), started).await;
            }
        };

        match result {
            RelayResult::Buffered(response) => {
                let outcome = write_buffered(client, &method, response, started).await;
                if outcome == RelayOutcome::Completed {
                    phase = Phase::BufferedComplete;
                    tracing::trace!(phase = %phase, "relay finished");
                }
                outcome
            }
            RelayResult::Streamed(response) => write_streamed(client, response, started).await,
        }
    }
}

fn log_upstream_failure(error: &RelayError, phase: Phase) {
    match error {
        RelayError::Timeout(_) => {
            tracing::warn!(error = %error, status = error.status().as_u16(), phase = %phase, "upstream timed out");
        }
        RelayError::Tunnel(e) if e.is_timeout() => {
            tracing::warn!(error = %error, status = error.status().as_u16(), phase = %phase, "tunnel timed out");
        }
        _ => {
            tracing::error!(error = %error, status = error.status().as_u16(), phase = %phase, "upstream request failed");
        }
    }
}

/// Drops hop-by-hop response headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    for name in HOP_BY_HOP_RESPONSE_HEADERS {
        headers.remove(name);
    }
    for name in &nominated {
        headers.remove(name);
    }
}

/// Client-facing form of a buffered upstream answer.
///
/// The body length is recomputed, except for HEAD where the upstream's
/// `Content-Length` describes a body that is never sent.
fn mirror_buffered(method: &Method, response: BufferedResponse) -> Response {
    let BufferedResponse { status, mut headers, body } = response;
    strip_hop_by_hop(&mut headers);

    if *method != Method::HEAD {
        if status == StatusCode::NO_CONTENT || (100..200).contains(&status.as_u16()) {
            headers.remove("Content-Length");
        } else if status != StatusCode::NOT_MODIFIED {
            headers.insert("Content-Length", body.len().to_string());
        }
    }

    Response {
        status,
        headers,
        body: body.to_vec(),
    }
}

async fn write_buffered<W>(client: &mut W, method: &Method, response: BufferedResponse, started: Instant) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
{
    respond(client, method, mirror_buffered(method, response), started).await
}

/// Writes a complete response and logs the end of the relay.
async fn respond<W>(client: &mut W, method: &Method, response: Response, started: Instant) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
{
    let mut writer = if *method == Method::HEAD {
        ResponseWriter::head_only(&response)
    } else {
        ResponseWriter::new(&response)
    };

    if let Err(e) = writer.write_to_stream(client).await {
        let err = RelayError::ClientDisconnect(e);
        tracing::info!(error = %err, status = response.status.as_u16(), "client went away before the response was written");
        return RelayOutcome::ClientGone;
    }

    tracing::info!(
        status = response.status.as_u16(),
        bytes = response.body.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    RelayOutcome::Completed
}

/// Forwards a streamed answer one chunk at a time.
///
/// The next chunk is only pulled from upstream after the previous one has
/// been flushed to the client.
async fn write_streamed<W>(client: &mut W, response: StreamedResponse, started: Instant) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
{
    let StreamedResponse { status, mut headers, mut chunks } = response;
    strip_hop_by_hop(&mut headers);
    headers.insert("Content-Type", "text/event-stream");
    headers.insert("Cache-Control", "no-cache");
    headers.insert("X-Accel-Buffering", "no");

    let mut phase = Phase::StreamingInProgress;
    let mut writer = StreamingWriter::new(client);

    if let Err(e) = writer.write_head(status, headers).await {
        let err = RelayError::ClientDisconnect(e);
        tracing::info!(error = %err, phase = %phase, "client went away before the stream started");
        return RelayOutcome::ClientGone;
    }
    tracing::debug!(status = status.as_u16(), mode = ?chunks.mode(), "streaming response");

    loop {
        match chunks.next_chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = writer.write_chunk(&chunk).await {
                    // Dropping the stream closes the tunnel right away
                    drop(chunks);
                    let err = RelayError::ClientDisconnect(e);
                    tracing::info!(
                        error = %err,
                        chunks = writer.chunks_written(),
                        phase = %phase,
                        "client disconnected mid-stream"
                    );
                    return RelayOutcome::ClientGone;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    chunks = writer.chunks_written(),
                    bytes = writer.bytes_written(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    phase = %phase,
                    "upstream stream failed, closing client connection"
                );
                return RelayOutcome::Aborted;
            }
        }
    }

    if let Err(e) = writer.finish().await {
        let err = RelayError::ClientDisconnect(e);
        tracing::info!(error = %err, "client went away before the stream ended");
        return RelayOutcome::ClientGone;
    }
    phase = Phase::StreamingComplete;

    tracing::info!(
        status = status.as_u16(),
        chunks = writer.chunks_written(),
        bytes = writer.bytes_written(),
        duration_ms = started.elapsed().as_millis() as u64,
        phase = %phase,
        "request completed"
    );
    RelayOutcome::Completed
}

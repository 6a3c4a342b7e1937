//! Upstream connection and request forwarding
//!
//! Every exchange opens its own tunnel through the SOCKS5 intermediary,
//! optionally wraps it in TLS, writes one HTTP/1.1 request with
//! `Connection: close` and reads the answer either fully into memory or as
//! a lazily pulled sequence of chunks. The connection is never reused.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::http::chunked::{ChunkedDecoder, Decoded};
use crate::http::headers::HeaderMap;
use crate::http::parser::{self, ParseError, ResponseHead};
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::proxy::translate::OutboundRequest;
use crate::tunnel::Socks5Dialer;

/// Default buffer size for socket reads
const BUFFER_SIZE: usize = 8192;

/// Largest upstream body held in memory for a buffered relay.
pub const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Largest single transfer chunk accepted while streaming.
const MAX_TRANSFER_CHUNK: usize = 16 * 1024 * 1024;

/// A pending SSE event larger than this is forwarded without waiting for
/// its delimiter.
const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Byte stream to the upstream: a bare tunnel or TLS over a tunnel.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

type BoxedIo = Box<dyn UpstreamIo>;

/// Outcome of a successful upstream exchange.
#[derive(Debug)]
pub enum RelayResult {
    Buffered(BufferedResponse),
    Streamed(StreamedResponse),
}

impl RelayResult {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayResult::Buffered(r) => r.status,
            RelayResult::Streamed(r) => r.status,
        }
    }
}

#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct StreamedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: ChunkStream,
}

/// Sends requests to the upstream through fresh tunnels.
pub struct UpstreamClient {
    dialer: Socks5Dialer,
    tls: TlsConnector,

    /// Idle limit for each individual read
    read_timeout: Duration,

    /// Deadline for a whole buffered exchange
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        dialer: Socks5Dialer,
        tls: TlsConnector,
        read_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            tls,
            read_timeout,
            request_timeout,
        }
    }

    /// Builds a client from the process configuration, trusting the
    /// webpki root set.
    pub fn from_config(config: &ProxyConfig) -> std::result::Result<Self, rustls::Error> {
        let dialer = Socks5Dialer::new(
            config.tunnel.host.clone(),
            config.tunnel.port,
            config.tunnel.credentials.clone(),
            config.connect_timeout,
        );
        Ok(Self::new(
            dialer,
            tls_connector()?,
            config.read_timeout,
            config.request_timeout,
        ))
    }

    /// Performs one upstream exchange.
    ///
    /// With `streaming` set and a 2xx answer, returns as soon as the
    /// response head has arrived; the body is pulled through
    /// [`ChunkStream::next_chunk`]. Everything else is read to the end
    /// under the whole-request deadline.
    pub async fn send(&self, request: &OutboundRequest, streaming: bool) -> Result<RelayResult> {
        if streaming {
            return self.exchange(request, true).await;
        }

        timeout(self.request_timeout, self.exchange(request, false))
            .await
            .map_err(|_| RelayError::Timeout(self.request_timeout))?
    }

    async fn exchange(&self, request: &OutboundRequest, streaming: bool) -> Result<RelayResult> {
        let mut io = self.connect(request).await?;

        let wire = encode_request(request);
        timeout(self.read_timeout, async {
            io.write_all(&wire).await?;
            io.flush().await
        })
        .await
        .map_err(|_| RelayError::Timeout(self.read_timeout))??;

        tracing::trace!(bytes = wire.len(), "request sent to upstream");

        let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
        let head = read_head(&mut io, &mut buf, self.read_timeout).await?;
        let status = StatusCode::from_u16(head.status).ok_or_else(|| {
            RelayError::UpstreamProtocol(format!("status {} out of range", head.status))
        })?;
        let stream_body = streaming && status.is_success();
        let max_chunk = if stream_body { MAX_TRANSFER_CHUNK } else { MAX_BUFFERED_BODY };
        let framing = BodyFraming::for_response(&request.method, status, &head.headers, max_chunk)?;
        // A bodyless answer has nothing to stream
        let stream_body = stream_body && !matches!(framing, BodyFraming::Empty);

        let reader = BodyReader {
            io: Some(io),
            buf,
            framing,
            read_timeout: self.read_timeout,
        };

        if stream_body {
            let mode = ChunkMode::for_headers(&head.headers);
            return Ok(RelayResult::Streamed(StreamedResponse {
                status,
                headers: head.headers,
                chunks: ChunkStream::new(reader, mode),
            }));
        }

        let body = reader.read_to_end(MAX_BUFFERED_BODY).await?;
        Ok(RelayResult::Buffered(BufferedResponse {
            status,
            headers: head.headers,
            body,
        }))
    }

    async fn connect(&self, request: &OutboundRequest) -> Result<BoxedIo> {
        let host = request.host()?;
        let tunnel = self.dialer.dial(&host, request.port()).await?;

        if !request.is_tls() {
            return Ok(Box::new(tunnel));
        }

        let server_name = ServerName::try_from(host.clone()).map_err(|e| RelayError::Tls {
            host: host.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let limit = self.dialer.connect_timeout();
        match timeout(limit, self.tls.connect(server_name, tunnel)).await {
            Ok(Ok(stream)) => {
                tracing::trace!(host = %host, "TLS established with upstream");
                Ok(Box::new(stream))
            }
            Ok(Err(source)) => Err(RelayError::Tls { host, source }),
            Err(_) => Err(RelayError::Timeout(limit)),
        }
    }
}

/// TLS client configuration with the webpki roots and the ring provider.
pub fn tls_connector() -> std::result::Result<TlsConnector, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Serializes `request` as an HTTP/1.1 message closing the connection
/// after one exchange.
pub fn encode_request(request: &OutboundRequest) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512 + request.body.len());

    // Request line
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(request.path_and_query.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");

    for (key, value) in request.headers.iter() {
        if key.eq_ignore_ascii_case("Connection") {
            continue;
        }
        buffer.extend_from_slice(key.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"Connection: close\r\n");

    // End of headers
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

/// Reads up to the first final (non-1xx) response head.
async fn read_head(io: &mut BoxedIo, buf: &mut BytesMut, read_timeout: Duration) -> Result<ResponseHead> {
    loop {
        match parser::parse_response_head(buf) {
            Ok((head, consumed)) => {
                buf.advance(consumed);
                match head.status {
                    101 => {
                        return Err(RelayError::UpstreamProtocol(
                            "unexpected protocol switch".into(),
                        ));
                    }
                    100..=199 => {
                        tracing::trace!(status = head.status, "skipping interim response");
                        continue;
                    }
                    _ => return Ok(head),
                }
            }
            Err(ParseError::Incomplete) => {}
            Err(ParseError::TooLarge) => {
                return Err(RelayError::UpstreamProtocol("response head too large".into()));
            }
            Err(e) => {
                return Err(RelayError::UpstreamProtocol(format!(
                    "unparseable response head: {e:?}"
                )));
            }
        }

        if fill(io, buf, read_timeout).await? == 0 {
            return Err(RelayError::UpstreamProtocol(
                "connection closed before response head".into(),
            ));
        }
    }
}

/// One read into `buf`, bounded by `read_timeout`. Returns 0 at end of
/// stream.
async fn fill(io: &mut BoxedIo, buf: &mut BytesMut, read_timeout: Duration) -> Result<usize> {
    buf.reserve(BUFFER_SIZE);
    match timeout(read_timeout, io.read_buf(buf)).await {
        Ok(Ok(n)) => Ok(n),
        // Peers commonly close TLS without close_notify
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Ok(Err(e)) => Err(RelayError::Io(e)),
        Err(_) => Err(RelayError::Timeout(read_timeout)),
    }
}

/// How the end of a response body is found.
#[derive(Debug)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
}

impl BodyFraming {
    fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        max_chunk: usize,
    ) -> Result<Self> {
        if *method == Method::HEAD || status.is_bodyless() {
            return Ok(BodyFraming::Empty);
        }

        if headers.contains("Transfer-Encoding") {
            if headers.has_token("Transfer-Encoding", "chunked") {
                return Ok(BodyFraming::Chunked(ChunkedDecoder::new().max_chunk(max_chunk)));
            }
            return Ok(BodyFraming::UntilClose);
        }

        match parser::content_length(headers) {
            Ok(Some(0)) => Ok(BodyFraming::Empty),
            Ok(Some(n)) => Ok(BodyFraming::Length(n)),
            Ok(None) => Ok(BodyFraming::UntilClose),
            Err(_) => Err(RelayError::UpstreamProtocol(
                "invalid Content-Length in response".into(),
            )),
        }
    }
}

/// Reads a response body piece by piece as it is framed on the wire.
///
/// Owns the upstream connection and drops it once the body ends or a read
/// fails.
struct BodyReader {
    io: Option<BoxedIo>,
    buf: BytesMut,
    framing: BodyFraming,
    read_timeout: Duration,
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("open", &self.io.is_some())
            .field("buffered", &self.buf.len())
            .field("framing", &self.framing)
            .finish()
    }
}

impl BodyReader {
    /// Next piece of the body: one transfer chunk when chunked, otherwise
    /// whatever one socket read produced.
    async fn next_piece(&mut self) -> Result<Option<Bytes>> {
        let result = self.pull().await;
        if !matches!(result, Ok(Some(_))) {
            self.release();
        }
        result
    }

    async fn pull(&mut self) -> Result<Option<Bytes>> {
        loop {
            match &mut self.framing {
                BodyFraming::Empty => return Ok(None),
                BodyFraming::Length(remaining) => {
                    if *remaining == 0 {
                        return Ok(None);
                    }
                    if !self.buf.is_empty() {
                        let take = self.buf.len().min(*remaining);
                        *remaining -= take;
                        return Ok(Some(self.buf.split_to(take).freeze()));
                    }
                }
                BodyFraming::Chunked(decoder) => {
                    let decoded = decoder
                        .decode(&mut self.buf)
                        .map_err(|e| RelayError::UpstreamProtocol(e.to_string()))?;
                    match decoded {
                        Decoded::Chunk(chunk) => return Ok(Some(chunk)),
                        Decoded::Done => return Ok(None),
                        Decoded::NeedMore => {}
                    }
                }
                BodyFraming::UntilClose => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                }
            }

            let Some(io) = self.io.as_mut() else {
                return Ok(None);
            };
            if fill(io, &mut self.buf, self.read_timeout).await? == 0 {
                if matches!(self.framing, BodyFraming::UntilClose) {
                    return Ok(None);
                }
                return Err(RelayError::UpstreamProtocol(
                    "connection closed before end of body".into(),
                ));
            }
        }
    }

    async fn read_to_end(mut self, limit: usize) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(piece) = self.next_piece().await? {
            if body.len() + piece.len() > limit {
                return Err(RelayError::UpstreamProtocol(format!(
                    "response body exceeds {limit} bytes"
                )));
            }
            body.extend_from_slice(&piece);
        }
        Ok(body.freeze())
    }

    fn release(&mut self) {
        self.io = None;
        self.framing = BodyFraming::Empty;
    }
}

/// How a streamed body is cut into chunks for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// One chunk per server-sent event, delimiter included.
    Events,
    /// One chunk per transfer chunk or socket read.
    Raw,
}

impl ChunkMode {
    /// SSE framing applies to an unencoded `text/event-stream` body.
    pub fn for_headers(headers: &HeaderMap) -> Self {
        let is_event_stream = headers
            .get("Content-Type")
            .map(|v| v.trim().to_ascii_lowercase().starts_with("text/event-stream"))
            .unwrap_or(false);
        let encoded = headers
            .get_all("Content-Encoding")
            .any(|v| !v.trim().eq_ignore_ascii_case("identity"));

        if is_event_stream && !encoded {
            ChunkMode::Events
        } else {
            ChunkMode::Raw
        }
    }
}

/// Lazy, finite sequence of body chunks.
///
/// Each [`next_chunk`](Self::next_chunk) call reads from the upstream only
/// as far as needed for one chunk. Once it returns `None` or an error the
/// connection is closed and every later call returns `None`.
#[derive(Debug)]
pub struct ChunkStream {
    reader: BodyReader,
    mode: ChunkMode,
    pending: BytesMut,
    searched: usize,
    finished: bool,
}

impl ChunkStream {
    fn new(reader: BodyReader, mode: ChunkMode) -> Self {
        Self {
            reader,
            mode,
            pending: BytesMut::new(),
            searched: 0,
            finished: false,
        }
    }

    pub fn mode(&self) -> ChunkMode {
        self.mode
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
            self.reader.release();
        }
        result
    }

    async fn advance(&mut self) -> Result<Option<Bytes>> {
        if self.mode == ChunkMode::Raw {
            return self.reader.next_piece().await;
        }

        loop {
            if let Some(end) = event_end(&self.pending, self.searched) {
                self.searched = 0;
                return Ok(Some(self.pending.split_to(end).freeze()));
            }
            if self.pending.len() > MAX_EVENT_BYTES {
                self.searched = 0;
                return Ok(Some(self.pending.split().freeze()));
            }
            self.searched = self.pending.len().saturating_sub(2);

            match self.reader.next_piece().await? {
                Some(piece) => self.pending.extend_from_slice(&piece),
                None if self.pending.is_empty() => return Ok(None),
                // Trailing bytes without a delimiter still belong to the client
                None => return Ok(Some(self.pending.split().freeze())),
            }
        }
    }
}

/// End offset of the first complete event in `buf`, searching from `from`.
///
/// An event ends at a blank line: `\n\n` or `\n\r\n`, which also covers
/// `\r\n\r\n`.
fn event_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.min(buf.len());
    buf[start..].iter().enumerate().find_map(|(offset, &b)| {
        if b != b'\n' {
            return None;
        }
        let i = start + offset;
        match &buf[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

use bytes::{Bytes, BytesMut};

use crate::http::chunked::{ChunkedDecoder, ChunkedError, Decoded};
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};

/// Largest header block accepted, in either direction.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Largest inbound request body accepted.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    InvalidStatus,
    TooLarge,
    Incomplete,
}

/// Status line and headers of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Parses one complete request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut bytes = BytesMut::from(buf);
    match RequestDecoder::new().decode(&mut bytes)? {
        Some(request) => Ok((request, buf.len() - bytes.len())),
        None => Err(ParseError::Incomplete),
    }
}

/// Incremental request parser for a connection's read buffer.
///
/// Consumes the head as soon as it is complete, then the body as it
/// arrives, so bytes already seen are never parsed again. A pending body is
/// carried over between calls.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    pending: Option<(Request, PendingBody)>,
}

#[derive(Debug)]
enum PendingBody {
    Length(usize),
    Chunked { decoder: ChunkedDecoder, body: BytesMut },
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes bytes from `buf` until one request is complete.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        let (mut request, mut body) = match self.pending.take() {
            Some(pending) => pending,
            None => match parse_request_head(buf) {
                Ok(head) => head,
                Err(ParseError::Incomplete) => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        let done = match &mut body {
            PendingBody::Length(length) => {
                if buf.len() >= *length {
                    request.body = buf.split_to(*length).freeze();
                    true
                } else {
                    false
                }
            }
            PendingBody::Chunked { decoder, body } => loop {
                match decoder.decode(buf) {
                    Ok(Decoded::Chunk(chunk)) => body.extend_from_slice(&chunk),
                    Ok(Decoded::NeedMore) => break false,
                    Ok(Decoded::Done) => {
                        request.body = body.split().freeze();
                        break true;
                    }
                    Err(ChunkedError::TooLarge(_)) => return Err(ParseError::TooLarge),
                    Err(_) => return Err(ParseError::InvalidChunk),
                }
            },
        };

        if done {
            return Ok(Some(request));
        }
        self.pending = Some((request, body));
        Ok(None)
    }
}

/// Splits a complete request head off `buf`.
fn parse_request_head(buf: &mut BytesMut) -> Result<(Request, PendingBody), ParseError> {
    let headers_end = header_block_end(buf)?;
    let head = buf.split_to(headers_end + 4);

    let headers_str =
        std::str::from_utf8(&head[..headers_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || target.is_empty() || !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };

    let headers = parse_header_lines(lines)?;

    let body = if headers.has_token("Transfer-Encoding", "chunked") {
        PendingBody::Chunked {
            decoder: ChunkedDecoder::new().max_body(MAX_BODY_BYTES),
            body: BytesMut::new(),
        }
    } else {
        let content_length = content_length(&headers)?.unwrap_or(0);
        if content_length > MAX_BODY_BYTES {
            return Err(ParseError::TooLarge);
        }
        PendingBody::Length(content_length)
    };

    let request = Request {
        method,
        path,
        query,
        version: version.to_string(),
        headers,
        body: Bytes::new(),
    };
    Ok((request, body))
}

/// Parses an upstream status line and header block.
///
/// Returns the head and the number of bytes it occupied, including the
/// blank line. The body is left to the caller.
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = header_block_end(buf)?;
    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidStatus)?;

    let mut lines = headers_str.split("\r\n");
    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidStatus);
    }
    let code = parts.next().ok_or(ParseError::InvalidStatus)?;
    if code.len() != 3 {
        return Err(ParseError::InvalidStatus);
    }
    let status: u16 = code.parse().map_err(|_| ParseError::InvalidStatus)?;
    if status < 100 {
        return Err(ParseError::InvalidStatus);
    }
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)?;

    let head = ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
    };
    Ok((head, headers_end + 4))
}

/// Reads a `Content-Length` header, rejecting conflicting duplicates.
pub fn content_length(headers: &HeaderMap) -> Result<Option<usize>, ParseError> {
    let mut found: Option<usize> = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match found {
            Some(existing) if existing != parsed => return Err(ParseError::InvalidContentLength),
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    Ok(headers)
}

fn header_block_end(buf: &[u8]) -> Result<usize, ParseError> {
    match find_headers_end(buf) {
        Some(end) if end > MAX_HEADER_BYTES => Err(ParseError::TooLarge),
        Some(end) => Ok(end),
        None if buf.len() > MAX_HEADER_BYTES => Err(ParseError::TooLarge),
        None => Err(ParseError::Incomplete),
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

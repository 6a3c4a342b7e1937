use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::HeaderMap;
use crate::http::response::{Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

fn serialize_head(buf: &mut Vec<u8>, status: StatusCode, headers: &HeaderMap) {
    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
}

fn serialize_response(resp: &Response, include_body: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + resp.body.len());
    serialize_head(&mut buf, resp.status, &resp.headers);

    if include_body {
        buf.extend_from_slice(&resp.body);
    }

    buf
}

/// Writes a fully buffered response.
pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response, true),
            written: 0,
        }
    }

    /// Writer for a HEAD reply: headers as given, body omitted.
    pub fn head_only(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response, false),
            written: 0,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }

            self.written += n;
        }

        stream.flush().await
    }
}

/// Writes a response whose body is produced incrementally.
///
/// The body uses the chunked transfer coding towards the client. Every
/// call to [`write_chunk`](Self::write_chunk) emits exactly one transfer
/// chunk and flushes it before returning, so the caller only pulls the next
/// piece of data once the previous one has left the process.
pub struct StreamingWriter<'a, W> {
    stream: &'a mut W,
    chunks: usize,
    bytes: usize,
}

impl<'a, W> StreamingWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut W) -> Self {
        Self {
            stream,
            chunks: 0,
            bytes: 0,
        }
    }

    /// Writes the status line and headers and commits the response.
    ///
    /// Any `Content-Length` is dropped and `Transfer-Encoding: chunked` is
    /// set, whatever the caller passed.
    pub async fn write_head(&mut self, status: StatusCode, mut headers: HeaderMap) -> io::Result<()> {
        headers.remove("Content-Length");
        headers.insert("Transfer-Encoding", "chunked");

        let mut buf = Vec::with_capacity(256);
        serialize_head(&mut buf, status, &headers);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        // A zero-length chunk would end the body early.
        if data.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(data.len() + 12);
        buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\r\n");
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        self.chunks += 1;
        self.bytes += data.len();
        Ok(())
    }

    /// Terminates the body cleanly.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.stream.write_all(b"0\r\n\r\n").await?;
        self.stream.flush().await
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes
    }
}

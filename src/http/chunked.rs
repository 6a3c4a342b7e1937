//! Incremental decoder for the chunked transfer coding.
//!
//! The decoder works on a caller-owned `BytesMut` so the same instance can be
//! fed from a socket read loop or from an already complete buffer. It hands
//! out whole chunks: a chunk is only returned once all of its data and the
//! trailing CRLF have arrived. Chunk extensions are ignored and trailer
//! fields are discarded.
//!
//! Since a chunk is held until complete, both the size of a single chunk and
//! the total decoded length can be capped. A size line exceeding either cap
//! is rejected before any of its data is buffered.

use bytes::{Buf, Bytes, BytesMut};

/// Longest size or trailer line accepted before giving up.
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line {0:?}")]
    InvalidSize(String),
    #[error("chunk data not terminated by CRLF")]
    MissingCrlf,
    #[error("chunk size line too long")]
    LineTooLong,
    #[error("chunk of {0} bytes exceeds the body limit")]
    TooLarge(usize),
}

/// Result of one decode step.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Chunk(Bytes),
    NeedMore,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(usize),
    Trailers,
    Done,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    decoded: usize,
    max_chunk: usize,
    max_body: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            decoded: 0,
            max_chunk: usize::MAX,
            max_body: usize::MAX,
        }
    }

    /// Caps the size of any single chunk.
    pub fn max_chunk(mut self, limit: usize) -> Self {
        self.max_chunk = limit;
        self
    }

    /// Caps the sum of all chunk sizes.
    pub fn max_body(mut self, limit: usize) -> Self {
        self.max_body = limit;
        self
    }

    /// Consumes as much of `buf` as needed to produce the next chunk.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, ChunkedError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_LINE {
                            return Err(ChunkedError::LineTooLong);
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    let line = buf.split_to(line_end + 2);
                    let size = parse_size(&line[..line_end])?;
                    if size > self.max_chunk || self.decoded.saturating_add(size) > self.max_body {
                        return Err(ChunkedError::TooLarge(size));
                    }
                    self.decoded += size;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(size) => {
                    if buf.len() < size.saturating_add(2) {
                        return Ok(Decoded::NeedMore);
                    }
                    let data = buf.split_to(size).freeze();
                    if &buf[..2] != b"\r\n" {
                        return Err(ChunkedError::MissingCrlf);
                    }
                    buf.advance(2);
                    self.state = State::Size;
                    return Ok(Decoded::Chunk(data));
                }
                State::Trailers => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_LINE {
                            return Err(ChunkedError::LineTooLong);
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    buf.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(Decoded::Done),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ChunkedError::InvalidSize(String::from_utf8_lossy(line).into_owned()))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(ChunkedError::InvalidSize(text.to_string()));
    }
    usize::from_str_radix(digits, 16).map_err(|_| ChunkedError::InvalidSize(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_whole_chunks_and_trailers() {
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-T: 1\r\n\r\nrest"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Chunk(Bytes::from_static(b"hello"))));
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Chunk(Bytes::from_static(b" world"))));
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Done));
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Done));
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn waits_for_complete_chunk() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"a\r\n01234"[..]);
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::NeedMore));

        buf.extend_from_slice(b"56789\r");
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::NeedMore));

        buf.extend_from_slice(b"\n");
        assert_eq!(
            decoder.decode(&mut buf),
            Ok(Decoded::Chunk(Bytes::from_static(b"0123456789")))
        );
    }

    #[test]
    fn rejects_bad_size_and_missing_crlf() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(ChunkedError::InvalidSize(_))));

        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"2\r\nabXY"[..]);
        assert_eq!(decoder.decode(&mut buf), Err(ChunkedError::MissingCrlf));
    }

    #[test]
    fn rejects_oversized_chunk_before_its_data() {
        let mut decoder = ChunkedDecoder::new().max_chunk(1024);
        let mut buf = BytesMut::from(&b"fffffffff\r\nxxxx"[..]);
        assert_eq!(decoder.decode(&mut buf), Err(ChunkedError::TooLarge(0xfffffffff)));
    }

    #[test]
    fn body_limit_counts_all_chunks() {
        let mut decoder = ChunkedDecoder::new().max_body(8);
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n4\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Chunk(Bytes::from_static(b"hello"))));
        assert_eq!(decoder.decode(&mut buf), Err(ChunkedError::TooLarge(4)));
    }
}

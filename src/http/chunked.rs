//! Chunked transfer-encoding decoder (spec.md §4.3, §8).
//!
//! The teacher's parser only ever compares `content-length` against the
//! bytes already in the buffer (see `check_body` in `http::request`); it has
//! no notion of chunked framing. This module adds it, built on the same
//! `memchr`-driven, bounded-buffer style as the rest of the parser.
//!
//! Decoding is incremental: [`ChunkedDecoder::feed`] consumes as much of its
//! input as forms complete chunk-size/chunk-data units and appends the
//! decoded payload to `out`, returning how many *input* bytes it consumed.
//! Bytes that form an incomplete chunk header or an incomplete chunk body
//! are left in the caller's buffer for the next read (spec.md §4.1: "Reads
//! drain into the tail of the buffer").

use crate::errors::ErrorKind;
use memchr::memchr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a `<hex-size>[;ext]\r\n` line.
    Size,
    /// Reading `remaining` bytes of chunk data.
    Data { remaining: usize },
    /// Consuming the mandatory `\r\n` after chunk data.
    DataCrlf,
    /// Reading trailer headers after the zero-size chunk, up to the blank line.
    Trailer,
    /// All chunks consumed, trailing CRLF observed.
    Done,
}

/// Decodes a chunked request body into caller-provided storage, enforcing a
/// decoded-size ceiling (spec.md §4.3: "size limit applies to *decoded*
/// bytes").
pub(crate) struct ChunkedDecoder {
    state: State,
    decoded: usize,
    max_decoded: usize,
}

impl ChunkedDecoder {
    pub(crate) fn new(max_decoded: usize) -> Self {
        Self {
            state: State::Size,
            decoded: 0,
            max_decoded,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes as many complete units from `input` as available, appending
    /// decoded payload bytes to `out`. Returns the number of bytes of
    /// `input` consumed; the remainder (an incomplete header or partial
    /// chunk) must be re-fed once more bytes arrive.
    pub(crate) fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ErrorKind> {
        let mut pos = 0;

        loop {
            match self.state {
                State::Done => return Ok(pos),
                State::Size => {
                    let Some(eol) = memchr(b'\n', &input[pos..]) else {
                        return Ok(pos);
                    };
                    let mut line = &input[pos..pos + eol];
                    if line.last() == Some(&b'\r') {
                        line = &line[..line.len() - 1];
                    }
                    let size_field = line.split(|b| *b == b';').next().unwrap_or(line);
                    let size = parse_hex(size_field).ok_or(ErrorKind::InvalidChunkFraming)?;
                    pos += eol + 1;

                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data { remaining: size }
                    };
                }
                State::Data { remaining } => {
                    let available = input.len() - pos;
                    if available == 0 {
                        return Ok(pos);
                    }
                    let take = remaining.min(available);

                    self.decoded += take;
                    if self.decoded > self.max_decoded {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;

                    self.state = if take == remaining {
                        State::DataCrlf
                    } else {
                        State::Data { remaining: remaining - take }
                    };
                }
                State::DataCrlf => {
                    if input.len() - pos < 2 {
                        return Ok(pos);
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(ErrorKind::InvalidChunkFraming);
                    }
                    pos += 2;
                    self.state = State::Size;
                }
                State::Trailer => {
                    // Trailer headers are rare in practice and not surfaced
                    // to the request's header set here; skip to the blank
                    // line that terminates the message.
                    let Some(eol) = memchr(b'\n', &input[pos..]) else {
                        return Ok(pos);
                    };
                    let mut line = &input[pos..pos + eol];
                    if line.last() == Some(&b'\r') {
                        line = &line[..line.len() - 1];
                    }
                    pos += eol + 1;
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
            }
        }
    }
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &b in bytes {
        let digit = (b as char).to_digit(16)?;
        value = value.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();
        let input = b"5\r\nhello\r\n0\r\n\r\n";

        let consumed = decoder.feed(input, &mut out).unwrap();
        assert_eq!(consumed, input.len());
        assert!(decoder.is_done());
        assert_eq!(out, b"hello");
    }

    #[test]
    fn split_across_feeds() {
        // Mirrors the connection loop: unconsumed bytes stay in the buffer
        // and are re-presented, prefixed to whatever the next read adds.
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();
        let mut buf = Vec::new();

        for piece in [&b"5\r\nhel"[..], b"lo\r\n0", b"\r\n\r\n"] {
            buf.extend_from_slice(piece);
            let consumed = decoder.feed(&buf, &mut out).unwrap();
            buf.drain(..consumed);
        }

        assert_eq!(out, b"hello");
        assert!(decoder.is_done());
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_chunks() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();
        decoder
            .feed(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n", &mut out)
            .unwrap();
        assert_eq!(out, b"foobar");
    }

    #[test]
    fn decoded_size_over_limit_errors() {
        let mut decoder = ChunkedDecoder::new(4);
        let mut out = Vec::new();
        let err = decoder.feed(b"5\r\nhello\r\n0\r\n\r\n", &mut out).unwrap_err();
        assert_eq!(err, ErrorKind::BodyTooLarge);
    }

    #[test]
    fn bad_hex_size_errors() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();
        let err = decoder.feed(b"zz\r\n", &mut out).unwrap_err();
        assert_eq!(err, ErrorKind::InvalidChunkFraming);
    }

    #[test]
    fn chunk_extension_ignored() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();
        decoder
            .feed(b"5;foo=bar\r\nhello\r\n0\r\n\r\n", &mut out)
            .unwrap();
        assert_eq!(out, b"hello");
    }
}

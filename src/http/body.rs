//! Incremental request body decoding (`Content-Length` and chunked).

use bytes::{Buf, Bytes, BytesMut};

use crate::http::parser::ParseError;
use crate::http::request::RequestHead;

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Size,
    Data,
    DataEnd,
    Trailer,
    Done,
}

/// Push decoder for one request body.
///
/// Fed from the connection's read buffer; consumes only bytes belonging to
/// this body so a pipelined request that follows stays in the buffer.
#[derive(Debug)]
pub enum BodyDecoder {
    Empty,
    Length {
        remaining: u64,
    },
    Chunked {
        state: ChunkState,
        remaining: u64,
        received: u64,
        limit: Option<u64>,
    },
}

impl BodyDecoder {
    /// Picks the framing for `head`'s body.
    pub fn for_request(head: &RequestHead, limit: Option<u64>) -> Result<Self, ParseError> {
        let chunked = head.is_chunked()?;
        let length = head.content_length()?;

        match (chunked, length) {
            (true, Some(_)) => Err(ParseError::AmbiguousLength),
            (true, None) => Ok(BodyDecoder::Chunked {
                state: ChunkState::Size,
                remaining: 0,
                received: 0,
                limit,
            }),
            (false, Some(len)) if limit.is_some_and(|max| len > max) => {
                Err(ParseError::BodyTooLarge(limit.unwrap_or_default()))
            }
            (false, Some(0)) | (false, None) => Ok(BodyDecoder::Empty),
            (false, Some(len)) => Ok(BodyDecoder::Length { remaining: len }),
        }
    }

    pub fn chunked() -> Self {
        BodyDecoder::Chunked {
            state: ChunkState::Size,
            remaining: 0,
            received: 0,
            limit: None,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            BodyDecoder::Empty => true,
            BodyDecoder::Length { remaining } => *remaining == 0,
            BodyDecoder::Chunked { state, .. } => *state == ChunkState::Done,
        }
    }

    /// Consumes as much of `buf` as possible.
    ///
    /// Returns `Ok(None)` when no progress can be made without more input,
    /// otherwise the decoded bytes (possibly empty when only framing was
    /// consumed). Check [`is_done`](Self::is_done) afterwards to know
    /// whether the body is complete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ParseError> {
        match self {
            BodyDecoder::Empty => Ok(None),
            BodyDecoder::Length { remaining } => {
                if *remaining == 0 || buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(buf.split_to(take).freeze()))
            }
            BodyDecoder::Chunked {
                state,
                remaining,
                received,
                limit,
            } => {
                let mut out = BytesMut::new();
                let mut progressed = false;
                loop {
                    match *state {
                        ChunkState::Size => {
                            let Some(line) = take_line(buf)? else { break };
                            *remaining = parse_chunk_size(&line)?;
                            *state = if *remaining == 0 {
                                ChunkState::Trailer
                            } else {
                                ChunkState::Data
                            };
                        }
                        ChunkState::Data => {
                            if buf.is_empty() {
                                break;
                            }
                            let take = (*remaining).min(buf.len() as u64) as usize;
                            *received += take as u64;
                            if let Some(max) = *limit {
                                if *received > max {
                                    return Err(ParseError::BodyTooLarge(max));
                                }
                            }
                            out.extend_from_slice(&buf[..take]);
                            buf.advance(take);
                            *remaining -= take as u64;
                            if *remaining == 0 {
                                *state = ChunkState::DataEnd;
                            }
                        }
                        ChunkState::DataEnd => {
                            if buf.len() < 2 {
                                break;
                            }
                            if &buf[..2] != b"\r\n" {
                                return Err(ParseError::InvalidChunk);
                            }
                            buf.advance(2);
                            *state = ChunkState::Size;
                        }
                        ChunkState::Trailer => {
                            let Some(line) = take_line(buf)? else { break };
                            // Trailer fields are discarded; an empty line ends the body
                            if line.is_empty() {
                                *state = ChunkState::Done;
                            }
                        }
                        ChunkState::Done => break,
                    }
                    progressed = true;
                }
                if progressed || !out.is_empty() {
                    Ok(Some(out.freeze()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Splits one CRLF-terminated line off `buf`, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(idx) if idx <= MAX_CHUNK_LINE => {
            let line = buf.split_to(idx);
            buf.advance(2);
            Ok(Some(line))
        }
        Some(_) => Err(ParseError::InvalidChunk),
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    // Chunk extensions after ';' are ignored
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = size.trim_ascii();
    if size.is_empty() || size.len() > 15 || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunk);
    }
    let size = std::str::from_utf8(size).map_err(|_| ParseError::InvalidChunk)?;
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}

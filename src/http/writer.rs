use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::http::headers::Headers;
use crate::http::request::{Method, RequestHead, Version};
use crate::http::response::StatusCode;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Terminating zero-length chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Serializes a status line and header block, including the blank line.
pub fn encode_head(status: u16, headers: &Headers, out: &mut BytesMut) {
    let reason = StatusCode(status).reason_phrase();

    // Status line
    out.extend_from_slice(format!("{} {} {}\r\n", HTTP_VERSION, status, reason).as_bytes());

    // Headers
    for (k, v) in headers.iter() {
        out.extend_from_slice(k);
        out.extend_from_slice(b": ");
        out.extend_from_slice(v);
        out.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    out.extend_from_slice(b"\r\n");
}

/// Appends one chunk in chunked transfer coding. `data` must not be empty,
/// since an empty chunk terminates the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    debug_assert!(!data.is_empty());
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("http.response.start sent twice")]
    AlreadyStarted,
    #[error("http.response.body sent before http.response.start")]
    NotStarted,
    #[error("response body already complete")]
    AlreadyComplete,
    #[error("body exceeds declared content-length")]
    LengthExceeded,
    #[error("body shorter than declared content-length")]
    LengthShort,
    #[error("invalid content-length in response headers")]
    InvalidContentLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Fixed(u64),
    Chunked,
    Empty,
    UntilClose,
}

#[derive(Debug)]
enum Phase {
    Idle,
    HeadPending { status: u16, headers: Headers },
    Body(Framing),
    Done,
}

/// Encodes one response from the application's event sequence.
///
/// The head is held back until the first body event so a response that
/// arrives complete in one event can be sent with a `content-length` in a
/// single write; anything streamed is chunked (or close-delimited for
/// HTTP/1.0 peers). Output is appended to a caller-owned buffer, which the
/// connection then writes to the socket.
#[derive(Debug)]
pub struct ResponseWriter {
    phase: Phase,
    head_request: bool,
    version: Version,
    keep_alive: bool,
    status: Option<u16>,
    body_bytes: u64,
}

impl ResponseWriter {
    pub fn new(head_request: bool, version: Version, keep_alive: bool) -> Self {
        Self {
            phase: Phase::Idle,
            head_request,
            version,
            keep_alive,
            status: None,
            body_bytes: 0,
        }
    }

    pub fn for_request(head: &RequestHead) -> Self {
        Self::new(head.method == Method::HEAD, head.version, head.keep_alive())
    }

    /// Records `http.response.start`. Nothing is written yet.
    pub fn start(&mut self, status: u16, headers: Headers) -> Result<(), WriteError> {
        match self.phase {
            Phase::Idle => {
                {
                    let mut lengths = headers.get_all("content-length").map(|v| {
                        std::str::from_utf8(v).ok().and_then(|v| v.trim().parse::<u64>().ok())
                    });
                    if let Some(first) = lengths.next() {
                        if first.is_none() || lengths.any(|other| other != first) {
                            return Err(WriteError::InvalidContentLength);
                        }
                    }
                }
                self.status = Some(status);
                self.phase = Phase::HeadPending { status, headers };
                Ok(())
            }
            _ => Err(WriteError::AlreadyStarted),
        }
    }

    /// Encodes one `http.response.body` event.
    pub fn body(&mut self, chunk: &[u8], more: bool, out: &mut BytesMut) -> Result<(), WriteError> {
        let framing = match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Idle => {
                self.phase = Phase::Idle;
                return Err(WriteError::NotStarted);
            }
            Phase::Done => return Err(WriteError::AlreadyComplete),
            Phase::HeadPending { status, headers } => {
                let complete_len = (!more).then_some(chunk.len() as u64);
                self.commit(status, headers, complete_len, out)
            }
            Phase::Body(framing) => framing,
        };

        let framing = match framing {
            Framing::Empty => Framing::Empty,
            Framing::Fixed(remaining) => {
                let len = chunk.len() as u64;
                if len > remaining {
                    return Err(WriteError::LengthExceeded);
                }
                out.put_slice(chunk);
                if !more && remaining > len {
                    return Err(WriteError::LengthShort);
                }
                Framing::Fixed(remaining - len)
            }
            Framing::Chunked => {
                if !chunk.is_empty() {
                    encode_chunk(chunk, out);
                }
                if !more {
                    out.put_slice(LAST_CHUNK);
                }
                Framing::Chunked
            }
            Framing::UntilClose => {
                out.put_slice(chunk);
                Framing::UntilClose
            }
        };
        if framing != Framing::Empty {
            self.body_bytes += chunk.len() as u64;
        }

        if more {
            self.phase = Phase::Body(framing);
        }
        Ok(())
    }

    /// Writes a held-back head immediately, committing to streamed framing.
    /// Used for forced flushes and for closing an unfinished response.
    pub fn flush_head(&mut self, out: &mut BytesMut) {
        if let Phase::HeadPending { .. } = self.phase {
            if let Phase::HeadPending { status, headers } =
                std::mem::replace(&mut self.phase, Phase::Idle)
            {
                let framing = self.commit(status, headers, None, out);
                self.phase = Phase::Body(framing);
            }
        }
    }

    fn commit(
        &mut self,
        status: u16,
        mut headers: Headers,
        complete_len: Option<u64>,
        out: &mut BytesMut,
    ) -> Framing {
        if headers.has_token("connection", "close") {
            self.keep_alive = false;
        }

        let declared = headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        let framing = if self.head_request || !StatusCode(status).allows_body() {
            Framing::Empty
        } else if let Some(len) = declared {
            Framing::Fixed(len)
        } else if headers.has_token("transfer-encoding", "chunked") {
            Framing::Chunked
        } else if let Some(len) = complete_len {
            headers.push("content-length", len.to_string());
            Framing::Fixed(len)
        } else if self.version == Version::Http11 {
            headers.push("transfer-encoding", "chunked");
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::UntilClose
        };

        if !self.keep_alive {
            if !headers.has_token("connection", "close") {
                headers.push("connection", "close");
            }
        } else if self.version == Version::Http10 && !headers.has_token("connection", "keep-alive")
        {
            headers.push("connection", "keep-alive");
        }

        encode_head(status, &headers, out);
        framing
    }

    /// Whether `http.response.start` has been received.
    pub fn is_started(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Whether any response bytes have been produced.
    pub fn is_committed(&self) -> bool {
        matches!(self.phase, Phase::Body(_) | Phase::Done)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Whether the connection may carry another request after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Body bytes emitted so far, excluding framing.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_are_hex() {
        let mut out = BytesMut::new();
        encode_chunk(&[b'x'; 26], &mut out);
        assert!(out.starts_with(b"1a\r\n"));
        assert!(out.ends_with(b"\r\n"));
    }

    #[test]
    fn http10_stream_is_close_delimited() {
        let mut writer = ResponseWriter::new(false, Version::Http10, true);
        let mut out = BytesMut::new();
        writer.start(200, Headers::new()).unwrap();
        writer.body(b"a", true, &mut out).unwrap();
        writer.body(b"b", false, &mut out).unwrap();

        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.contains("connection: close\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.ends_with("\r\n\r\nab"));
        assert!(!writer.keep_alive());
    }
}

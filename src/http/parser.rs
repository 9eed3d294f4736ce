use bytes::Bytes;
use thiserror::Error;

use crate::http::headers::Headers;
use crate::http::request::{Method, RequestHead, Version};
use crate::http::response::StatusCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unsupported method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("both content-length and transfer-encoding present")]
    AmbiguousLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("request head exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(u64),
    #[error("incomplete request")]
    Incomplete,
}

impl ParseError {
    /// The status the gateway answers with when no response has started.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::InvalidMethod | ParseError::UnsupportedTransferEncoding => {
                StatusCode::NOT_IMPLEMENTED
            }
            ParseError::InvalidVersion => StatusCode::VERSION_NOT_SUPPORTED,
            ParseError::HeadersTooLarge(_) => StatusCode::HEADERS_TOO_LARGE,
            ParseError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Parses a request line and header block from the front of `buf`.
///
/// Returns the head and the number of bytes consumed (including the blank
/// line). Body bytes, if any, are left for the body decoder. A head larger
/// than `max_head_size` is rejected instead of being truncated.
pub fn parse_request_head(
    buf: &[u8],
    max_head_size: usize,
) -> Result<(RequestHead, usize), ParseError> {
    // Tolerate empty lines between pipelined requests. They count toward
    // the head size.
    let mut start = 0;
    while start <= max_head_size && buf[start..].starts_with(b"\r\n") {
        start += 2;
    }

    // Look for header/body separator
    let Some(headers_end) = find_headers_end(&buf[start..]) else {
        if buf.len() > max_head_size {
            return Err(ParseError::HeadersTooLarge(max_head_size));
        }
        return Err(ParseError::Incomplete);
    };
    if start + headers_end + 4 > max_head_size {
        return Err(ParseError::HeadersTooLarge(max_head_size));
    }

    let header_bytes = &buf[start..start + headers_end];
    let mut lines = split_crlf(header_bytes);

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let (method, target, version) = parse_request_line(request_line)?;

    // Headers
    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = parse_header_line(line)?;
        headers.push(name, value);
    }

    let request = RequestHead {
        method,
        target,
        version,
        headers,
    };

    let total_consumed = start + headers_end + 4;
    Ok((request, total_consumed))
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Bytes, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ');

    let method = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || method.is_empty() || target.is_empty() {
        return Err(ParseError::InvalidRequest);
    }

    let method = std::str::from_utf8(method)
        .ok()
        .and_then(Method::from_str)
        .ok_or(ParseError::InvalidMethod)?;

    let version = match version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        v if v.starts_with(b"HTTP/") => return Err(ParseError::InvalidVersion),
        _ => return Err(ParseError::InvalidRequest),
    };

    if target.iter().any(|&b| b.is_ascii_control() || b >= 0x80) {
        return Err(ParseError::InvalidRequest);
    }

    Ok((method, origin_form(target)?, version))
}

/// Reduces an absolute-form target (`http://host/p?q`) to `/p?q`; other
/// forms pass through byte-for-byte.
fn origin_form(target: &[u8]) -> Result<Bytes, ParseError> {
    if target[0] == b'/' || target == b"*" {
        return Ok(Bytes::copy_from_slice(target));
    }
    let Some(scheme_end) = target.windows(3).position(|w| w == b"://") else {
        // authority-form (CONNECT host:port)
        return Ok(Bytes::copy_from_slice(target));
    };
    let after_scheme = &target[scheme_end + 3..];
    match after_scheme.iter().position(|&b| b == b'/' || b == b'?') {
        Some(idx) if after_scheme[idx] == b'/' => {
            Ok(Bytes::copy_from_slice(&after_scheme[idx..]))
        }
        Some(idx) => {
            let mut path = Vec::with_capacity(after_scheme.len() - idx + 1);
            path.push(b'/');
            path.extend_from_slice(&after_scheme[idx..]);
            Ok(Bytes::from(path))
        }
        None if !after_scheme.is_empty() => Ok(Bytes::from_static(b"/")),
        None => Err(ParseError::InvalidRequest),
    }
}

fn parse_header_line(line: &[u8]) -> Result<(Bytes, Bytes), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    // Rejects obs-fold continuation lines and whitespace before the colon
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidHeader);
    }
    let value = value.trim_ascii();
    if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(ParseError::InvalidHeader);
    }

    Ok((
        Bytes::from(name.to_ascii_lowercase()),
        Bytes::copy_from_slice(value),
    ))
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn split_crlf(mut bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::from_fn(move || {
        if bytes.is_empty() {
            return None;
        }
        match bytes.windows(2).position(|w| w == b"\r\n") {
            Some(idx) => {
                let line = &bytes[..idx];
                bytes = &bytes[idx + 2..];
                Some(line)
            }
            None => {
                let line = bytes;
                bytes = &bytes[bytes.len()..];
                Some(line)
            }
        }
    })
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

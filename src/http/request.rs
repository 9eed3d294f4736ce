use bytes::Bytes;

use crate::http::headers::Headers;
use crate::http::parser::ParseError;

/// HTTP request methods.
///
/// Represents the HTTP method/verb of a request. Anything outside this set is
/// rejected by the parser with `501 Not Implemented`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Message loop-back test
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Example
    ///
    /// ```
    /// # use pagi::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// The version as it appears in a scope (`"1.0"` / `"1.1"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

/// A parsed request line and header block.
///
/// The body is not part of the head; it is decoded incrementally by
/// [`BodyDecoder`](crate::http::body::BodyDecoder) and delivered to the
/// application as `http.request` events.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request target exactly as sent, reduced to origin-form
    /// (e.g. `/search?q=rust`)
    pub target: Bytes,
    /// HTTP version
    pub version: Version,
    /// Request headers, names lower-cased, order and duplicates preserved
    pub headers: Headers,
}

/// Builder for constructing request heads, mostly for tests and tooling.
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<Bytes>,
    version: Version,
    headers: Headers,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            target: None,
            version: Version::Http11,
            headers: Headers::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn target(mut self, target: impl Into<Bytes>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.headers
            .push(Bytes::from(key.to_ascii_lowercase()), value.into());
        self
    }

    pub fn build(self) -> Result<RequestHead, &'static str> {
        Ok(RequestHead {
            method: self.method.ok_or("method missing")?,
            target: self.target.ok_or("target missing")?,
            version: self.version,
            headers: self.headers,
        })
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHead {
    /// Retrieves the first value of a header as a string (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get_str(key)
    }

    /// Parses the `Content-Length` header.
    ///
    /// Repeated headers must agree; anything that is not a plain decimal
    /// number is an error.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        let mut length = None;
        for value in self.headers.get_all("content-length") {
            for part in value.split(|&b| b == b',') {
                let part = part.trim_ascii();
                if part.is_empty() || !part.iter().all(u8::is_ascii_digit) {
                    return Err(ParseError::InvalidContentLength);
                }
                let parsed: u64 = std::str::from_utf8(part)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ParseError::InvalidContentLength)?;
                match length {
                    Some(existing) if existing != parsed => {
                        return Err(ParseError::InvalidContentLength);
                    }
                    _ => length = Some(parsed),
                }
            }
        }
        Ok(length)
    }

    /// Whether the body uses chunked transfer coding.
    ///
    /// Returns an error for any transfer coding we cannot decode.
    pub fn is_chunked(&self) -> Result<bool, ParseError> {
        let mut codings = Vec::new();
        for value in self.headers.get_all("transfer-encoding") {
            for part in value.split(|&b| b == b',') {
                let part = part.trim_ascii();
                if !part.is_empty() {
                    codings.push(part);
                }
            }
        }
        match codings.as_slice() {
            [] => Ok(false),
            [only] if only.eq_ignore_ascii_case(b"chunked") => Ok(true),
            _ => Err(ParseError::UnsupportedTransferEncoding),
        }
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// True when the client asked to switch this connection to WebSocket.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("upgrade", "websocket")
    }

    /// True when the client asked for a `text/event-stream` response.
    pub fn accepts_event_stream(&self) -> bool {
        self.method == Method::GET
            && self.headers.get_all("accept").any(|value| {
                value.split(|&b| b == b',').any(|part| {
                    let media = part.split(|&b| b == b';').next().unwrap_or_default();
                    media.trim_ascii().eq_ignore_ascii_case(b"text/event-stream")
                })
            })
    }

    /// True when the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11 && self.headers.has_token("expect", "100-continue")
    }
}

//! Server side of the WebSocket opening handshake (RFC 6455 §4.2).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::headers::Headers;
use crate::http::request::{Method, RequestHead, Version};
use crate::http::response::{Response, StatusCode};

/// GUID appended to the client key before hashing.
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const SUPPORTED_VERSION: &str = "13";

/// Headers the gateway owns in a `101` and never takes from the application.
const RESERVED_HEADERS: [&str; 5] = [
    "upgrade",
    "connection",
    "sec-websocket-accept",
    "sec-websocket-protocol",
    "content-length",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("websocket upgrade requires GET over HTTP/1.1")]
    InvalidRequest,
    #[error("missing `Upgrade: websocket`")]
    MissingUpgrade,
    #[error("missing `Connection: upgrade`")]
    MissingConnectionUpgrade,
    #[error("missing or malformed Sec-WebSocket-Key")]
    InvalidKey,
    #[error("unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// The reply sent instead of `101`. The application is never invoked.
    pub fn response(&self) -> Response {
        let mut response = Response::error(self.status());
        if *self == HandshakeError::UnsupportedVersion {
            response
                .headers
                .push("sec-websocket-version", SUPPORTED_VERSION);
        }
        response
    }
}

/// Checks an upgrade request and returns the `Sec-WebSocket-Accept` value
/// to answer with.
pub fn validate(head: &RequestHead) -> Result<String, HandshakeError> {
    if head.method != Method::GET || head.version != Version::Http11 {
        return Err(HandshakeError::InvalidRequest);
    }
    if !head.headers.has_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !head.headers.has_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let key = head
        .headers
        .get("sec-websocket-key")
        .map(<[u8]>::trim_ascii)
        .ok_or(HandshakeError::InvalidKey)?;
    // The key is a base64-encoded 16-byte nonce
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    match head.headers.get_str("sec-websocket-version").map(str::trim) {
        Some(SUPPORTED_VERSION) => {}
        _ => return Err(HandshakeError::UnsupportedVersion),
    }

    Ok(compute_accept(key))
}

/// `base64(SHA-1(key ++ GUID))`.
///
/// # Example
///
/// ```
/// # use pagi::websocket::handshake::compute_accept;
/// assert_eq!(
///     compute_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_ACCEPT_MAGIC);
    STANDARD.encode(hasher.finalize())
}

/// Builds the `101 Switching Protocols` reply. Extra application headers
/// are appended unless they collide with handshake headers.
pub fn accept_response(accept: &str, subprotocol: Option<&str>, extra: &Headers) -> Response {
    let mut headers = Headers::with_capacity(4 + extra.len());
    headers.push("upgrade", "websocket");
    headers.push("connection", "Upgrade");
    headers.push("sec-websocket-accept", accept.to_string());
    if let Some(protocol) = subprotocol {
        headers.push("sec-websocket-protocol", protocol.to_string());
    }
    for (name, value) in extra.iter() {
        let reserved = RESERVED_HEADERS
            .iter()
            .any(|r| name.eq_ignore_ascii_case(r.as_bytes()));
        if !reserved {
            headers.push(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        }
    }

    Response {
        status: StatusCode::SWITCHING_PROTOCOLS,
        headers,
        body: Bytes::new(),
    }
}

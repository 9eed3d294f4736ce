//! Scope records handed to the application.

use std::borrow::Cow;
use std::net::SocketAddr;

use bytes::Bytes;
use percent_encoding::percent_decode;

use crate::gateway::extensions::Extensions;
use crate::gateway::state::State;
use crate::http::headers::Headers;
use crate::http::request::{Method, RequestHead, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeType {
    Http,
    WebSocket,
    Sse,
    Lifespan,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Http => "http",
            ScopeType::WebSocket => "websocket",
            ScopeType::Sse => "sse",
            ScopeType::Lifespan => "lifespan",
        }
    }
}

/// Negotiated TLS parameters of an encrypted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// e.g. `TLSv1_3`
    pub protocol: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Bytes>,
    pub server_name: Option<String>,
    /// DER-encoded client certificate chain, leaf first.
    pub peer_certificates: Vec<Bytes>,
}

/// Transport facts about an accepted connection, fixed for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub tls: Option<TlsInfo>,
}

impl ConnectionInfo {
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// Scope of an `http`, `websocket` or `sse` invocation.
#[derive(Debug, Clone)]
pub struct ConnectionScope {
    pub http_version: Version,
    pub method: Method,
    /// `http`/`https`, or `ws`/`wss` for WebSocket scopes.
    pub scheme: &'static str,
    /// Percent-decoded path. Invalid UTF-8 is replaced, so this can differ
    /// from what `raw_path` decodes to.
    pub path: String,
    /// Path bytes exactly as sent.
    pub raw_path: Bytes,
    /// Query string without the `?`, still percent-encoded.
    pub query_string: Bytes,
    pub headers: Headers,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in order.
    pub subprotocols: Vec<String>,
    pub tls: Option<TlsInfo>,
    pub extensions: Extensions,
    pub state: State,
}

#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub state: State,
}

/// The per-invocation context record, dispatched on its type.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(ConnectionScope),
    WebSocket(ConnectionScope),
    Sse(ConnectionScope),
    Lifespan(LifespanScope),
}

impl Scope {
    pub fn scope_type(&self) -> ScopeType {
        match self {
            Scope::Http(_) => ScopeType::Http,
            Scope::WebSocket(_) => ScopeType::WebSocket,
            Scope::Sse(_) => ScopeType::Sse,
            Scope::Lifespan(_) => ScopeType::Lifespan,
        }
    }

    /// Connection details; `None` for lifespan.
    pub fn connection(&self) -> Option<&ConnectionScope> {
        match self {
            Scope::Http(scope) | Scope::WebSocket(scope) | Scope::Sse(scope) => Some(scope),
            Scope::Lifespan(_) => None,
        }
    }

    pub fn state(&self) -> &State {
        match self {
            Scope::Http(scope) | Scope::WebSocket(scope) | Scope::Sse(scope) => &scope.state,
            Scope::Lifespan(scope) => &scope.state,
        }
    }

    /// Extension capability set; empty for lifespan.
    pub fn extensions(&self) -> Cow<'_, Extensions> {
        match self.connection() {
            Some(scope) => Cow::Borrowed(&scope.extensions),
            None => Cow::Owned(Extensions::default()),
        }
    }
}

/// Builds the scope for one request (http) or stream (websocket, sse).
///
/// Pure: nothing here touches the socket or shared state.
pub fn build(
    kind: ScopeType,
    head: &RequestHead,
    info: &ConnectionInfo,
    extensions: Extensions,
    state: State,
) -> Scope {
    if kind == ScopeType::Lifespan {
        return Scope::Lifespan(LifespanScope { state });
    }

    let (raw_path, query_string) = split_target(&head.target);
    let secure = info.is_secure();
    let scheme = match (kind, secure) {
        (ScopeType::WebSocket, false) => "ws",
        (ScopeType::WebSocket, true) => "wss",
        (_, false) => "http",
        (_, true) => "https",
    };
    let subprotocols = if kind == ScopeType::WebSocket {
        offered_subprotocols(&head.headers)
    } else {
        Vec::new()
    };

    let scope = ConnectionScope {
        http_version: head.version,
        method: head.method,
        scheme,
        path: decode_path(&raw_path),
        raw_path,
        query_string,
        headers: head.headers.clone(),
        client: info.client,
        server: info.server,
        subprotocols,
        tls: info.tls.clone(),
        extensions,
        state,
    };

    match kind {
        ScopeType::WebSocket => Scope::WebSocket(scope),
        ScopeType::Sse => Scope::Sse(scope),
        _ => Scope::Http(scope),
    }
}

/// Splits an origin-form target into path and query at the first `?`.
pub fn split_target(target: &Bytes) -> (Bytes, Bytes) {
    match target.iter().position(|&b| b == b'?') {
        Some(idx) => (target.slice(..idx), target.slice(idx + 1..)),
        None => (target.clone(), Bytes::new()),
    }
}

/// Percent-decodes `raw` and interprets the result as UTF-8, replacing
/// invalid sequences.
pub fn decode_path(raw: &[u8]) -> String {
    percent_decode(raw).decode_utf8_lossy().into_owned()
}

fn offered_subprotocols(headers: &Headers) -> Vec<String> {
    headers
        .get_all("sec-websocket-protocol")
        .filter_map(|value| std::str::from_utf8(value).ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

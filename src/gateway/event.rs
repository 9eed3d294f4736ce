use bytes::Bytes;

use crate::http::headers::Headers;

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One Server-Sent Event. `data` may span several lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
    pub comment: Option<String>,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event = Some(name.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }
}

/// Messages exchanged between the gateway and an application through
/// `receive` and `send`.
///
/// Which variants flow in which direction depends on the scope type; an
/// event sent on the wrong scope is an application error and aborts the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // http, gateway -> app
    HttpRequest { body: Bytes, more_body: bool },
    HttpDisconnect,
    // http, app -> gateway
    HttpResponseStart { status: u16, headers: Headers },
    HttpResponseBody { body: Bytes, more: bool },

    // websocket, gateway -> app
    WebSocketConnect,
    WebSocketReceive(Message),
    WebSocketDisconnect { code: u16 },
    // websocket, app -> gateway
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    WebSocketSend(Message),
    WebSocketClose { code: u16, reason: String },

    // sse
    SseStart { status: u16, headers: Headers },
    SseSend(SseEvent),
    SseDisconnect,

    // lifespan
    LifespanStartup,
    LifespanStartupComplete,
    LifespanStartupFailed { message: String },
    LifespanShutdown,
    LifespanShutdownComplete,
    LifespanShutdownFailed { message: String },

    // extension: fullflush
    FullFlush,
    // extension: websocket.ping
    WebSocketAutoPong { enabled: bool },
    WebSocketPing(Bytes),
    WebSocketPong(Bytes),
}

impl Event {
    /// Dotted wire-style name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Event::HttpRequest { .. } => "http.request",
            Event::HttpDisconnect => "http.disconnect",
            Event::HttpResponseStart { .. } => "http.response.start",
            Event::HttpResponseBody { .. } => "http.response.body",
            Event::WebSocketConnect => "websocket.connect",
            Event::WebSocketReceive(_) => "websocket.receive",
            Event::WebSocketDisconnect { .. } => "websocket.disconnect",
            Event::WebSocketAccept { .. } => "websocket.accept",
            Event::WebSocketSend(_) => "websocket.send",
            Event::WebSocketClose { .. } => "websocket.close",
            Event::SseStart { .. } => "sse.start",
            Event::SseSend(_) => "sse.send",
            Event::SseDisconnect => "sse.disconnect",
            Event::LifespanStartup => "lifespan.startup",
            Event::LifespanStartupComplete => "lifespan.startup.complete",
            Event::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            Event::LifespanShutdown => "lifespan.shutdown",
            Event::LifespanShutdownComplete => "lifespan.shutdown.complete",
            Event::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
            Event::FullFlush => "http.fullflush",
            Event::WebSocketAutoPong { .. } => "websocket.auto_pong",
            Event::WebSocketPing(_) => "websocket.ping",
            Event::WebSocketPong(_) => "websocket.pong",
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Event::HttpDisconnect | Event::WebSocketDisconnect { .. } | Event::SseDisconnect
        )
    }

    /// `http.response.start` with the given status and headers.
    pub fn response_start<I, N, V>(status: u16, headers: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<Bytes>,
        V: Into<Bytes>,
    {
        Event::HttpResponseStart {
            status,
            headers: headers.into_iter().collect(),
        }
    }

    /// `http.response.body`.
    pub fn response_body(body: impl Into<Bytes>, more: bool) -> Self {
        Event::HttpResponseBody {
            body: body.into(),
            more,
        }
    }
}

//! Connection-local error types shared by the protocol handlers.

use thiserror::Error;

use crate::http::parser::ParseError;
use crate::http::writer::WriteError;
use crate::websocket::frame::FrameError;
use crate::websocket::handshake::HandshakeError;

/// Returned by [`EventSender::send`](crate::gateway::EventSender::send) once
/// the connection behind it is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Disconnected,
}

/// Why a connection was aborted. Contained to that connection; only
/// logged, never propagated to the acceptor.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("websocket handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("websocket protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("application error: {0}")]
    Application(String),

    #[error("invalid response framing: {0}")]
    Framing(#[from] WriteError),

    #[error("application sent {0} which is not valid here")]
    UnexpectedEvent(&'static str),

    #[error("application made no progress within {0:?}")]
    AppTimeout(std::time::Duration),

    #[error("no data received within {0:?}")]
    IdleTimeout(std::time::Duration),
}

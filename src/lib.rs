//! PAGI - async gateway server
//!
//! Serves HTTP/1.1, WebSocket and Server-Sent Events to an application
//! written against a small `(scope, receive, send)` contract, plus a
//! lifespan protocol for process startup and shutdown.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod server;
pub mod sse;
pub mod websocket;

pub use config::Config;
pub use gateway::{Application, Event, EventReceiver, EventSender, Scope};
pub use server::{RunningServer, Server};

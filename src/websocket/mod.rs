//! WebSocket support (RFC 6455).
//!
//! - **`handshake`**: validates the upgrade request and builds the `101`
//! - **`frame`**: frame codec, close codes and message reassembly
//! - **`session`**: runs an accepted socket between the peer and the application

pub mod frame;
pub mod handshake;
pub mod session;

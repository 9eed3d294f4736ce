//! HTTP/1.1 protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: the per-socket state machine driving the application
//! - **`parser`**: parses request heads from byte buffers
//! - **`body`**: incremental `Content-Length` / chunked body decoding
//! - **`request`**: request head representation and header semantics
//! - **`response`**: status codes and gateway-generated responses
//! - **`writer`**: encodes the application's response events
//! - **`headers`**: ordered header list
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │  Accepted   │ ← Wait for a request head
//!        └──────┬──────┘
//!               │ Head parsed
//!               ▼
//!        ┌──────────────────┐
//!        │   ScopeReady     │ ← Scope built, queues created
//!        └──────┬───────────┘
//!               │ Application invoked
//!               ▼
//!        ┌──────────────────┐
//!        │   AppRunning     │ ← Body in, response events out
//!        └──────┬───────────┘
//!               │ Response complete
//!               ├─ Keep-Alive → Accepted (same connection)
//!               ├─ Close → Complete
//!               └─ Error → Aborted
//! ```
//!
//! WebSocket upgrades and event streams leave this loop and keep the socket
//! until it closes.

pub mod body;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

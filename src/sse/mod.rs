//! Server-Sent Events: GET requests that accept `text/event-stream` are
//! served as an `sse` scope instead of `http`.

pub mod encoder;
pub mod stream;

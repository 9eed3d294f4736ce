//! `text/event-stream` encoding.

use bytes::BytesMut;

use crate::gateway::SseEvent;

/// Appends one event: optional comment, `event:`, `id:` and `retry:`
/// fields, one `data:` line per line of data, then a blank line.
///
/// # Example
///
/// ```
/// # use bytes::BytesMut;
/// # use pagi::gateway::SseEvent;
/// # use pagi::sse::encoder::encode_event;
/// let mut out = BytesMut::new();
/// encode_event(&SseEvent::new("a\nb").event("update").id("7"), &mut out);
/// assert_eq!(&out[..], b"event: update\nid: 7\ndata: a\ndata: b\n\n");
/// ```
pub fn encode_event(event: &SseEvent, out: &mut BytesMut) {
    if let Some(comment) = &event.comment {
        encode_comment(comment, out);
    }
    if let Some(name) = &event.event {
        put_field("event", &single_line(name), out);
    }
    if let Some(id) = &event.id {
        // A NUL in the id makes clients ignore it
        let id: String = single_line(id).chars().filter(|&c| c != '\0').collect();
        put_field("id", &id, out);
    }
    if let Some(retry) = event.retry {
        put_field("retry", &retry.to_string(), out);
    }
    if !event.data.is_empty() || (event.event.is_none() && event.id.is_none()) {
        for line in split_lines(&event.data) {
            put_field("data", line, out);
        }
    }
    out.extend_from_slice(b"\n");
}

/// Appends comment lines, ignored by clients. Used for keep-alives.
pub fn encode_comment(text: &str, out: &mut BytesMut) {
    for line in split_lines(text) {
        out.extend_from_slice(b":");
        if !line.is_empty() {
            out.extend_from_slice(b" ");
            out.extend_from_slice(line.as_bytes());
        }
        out.extend_from_slice(b"\n");
    }
}

fn put_field(name: &str, value: &str, out: &mut BytesMut) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\n");
}

/// Splits on CRLF, CR or LF, the three line endings the format accepts.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(text);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(idx) => {
                let skip = if current[idx..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[idx + skip..]);
                Some(&current[..idx])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

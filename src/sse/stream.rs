//! A Server-Sent Events response held open for the application.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::gateway::driver::{self, AppOutcome};
use crate::gateway::extensions::Extension;
use crate::gateway::queue;
use crate::gateway::scope::{self, ConnectionInfo, ScopeType};
use crate::gateway::Event;
use crate::http::connection::{sleep_until, write_flush, ConnectionContext};
use crate::http::headers::Headers;
use crate::http::request::RequestHead;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::encode_head;
use crate::sse::encoder::{encode_comment, encode_event};

const READ_CHUNK: usize = 1024;

/// Serves one event stream. The body is close-delimited, so the connection
/// ends with the stream.
pub async fn run<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    head: RequestHead,
    ctx: &ConnectionContext,
    info: &ConnectionInfo,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cfg = &ctx.config;
    let extensions = ctx.extensions.for_connection(ScopeType::Sse, info.is_secure());
    let fullflush = extensions.contains(Extension::FullFlush);
    let scope = scope::build(ScopeType::Sse, &head, info, extensions, ctx.state.clone());
    let path = String::from_utf8_lossy(&head.target).into_owned();

    let (mut inbound, receive) = queue::inbound(cfg.queue_capacity, Event::SseDisconnect);
    let (send, mut outbound) = queue::outbound(cfg.queue_capacity);
    let mut task = driver::spawn(&ctx.app, scope, receive, send);

    let mut started = false;
    let mut app_done = false;
    let mut events = 0u64;
    let mut keepalive = cfg.sse_keepalive().map(interval);
    let mut out = BytesMut::new();
    let app_timeout = cfg.app_timeout();
    let mut app_deadline = app_timeout.map(|t| Instant::now() + t);
    // Anything the client sends on an event stream is ignored
    buffer.clear();

    let failure = loop {
        buffer.reserve(READ_CHUNK);
        tokio::select! {
            biased;

            event = outbound.next() => {
                app_deadline = app_timeout.map(|t| Instant::now() + t);
                match event {
                    Some(Event::SseStart { status, headers }) => {
                        if started {
                            break Some(ConnectionError::UnexpectedEvent("sse.start"));
                        }
                        encode_stream_head(status, headers, &mut out);
                        started = true;
                        if let Err(e) = write_flush(&mut *stream, &out).await {
                            break Some(e.into());
                        }
                        out.clear();
                    }
                    Some(Event::SseSend(event)) => {
                        if !started {
                            encode_stream_head(200, Headers::new(), &mut out);
                            started = true;
                        }
                        encode_event(&event, &mut out);
                        events += 1;
                        if let Err(e) = write_flush(&mut *stream, &out).await {
                            break Some(e.into());
                        }
                        out.clear();
                    }
                    Some(Event::FullFlush) if fullflush => {
                        if let Err(e) = stream.flush().await {
                            break Some(e.into());
                        }
                    }
                    Some(other) => break Some(ConnectionError::UnexpectedEvent(other.name())),
                    None => break None,
                }
            }

            read = stream.read_buf(&mut *buffer) => {
                match read {
                    Ok(n) if n > 0 => buffer.clear(),
                    Ok(_) => {
                        debug!("SSE client disconnected");
                        break Some(ConnectionError::PeerClosed);
                    }
                    Err(e) => break Some(e.into()),
                }
            }

            _ = &mut task, if !app_done => {
                app_done = true;
                outbound.close();
            }

            _ = tick(&mut keepalive), if started => {
                encode_comment("keepalive", &mut out);
                if let Err(e) = write_flush(&mut *stream, &out).await {
                    break Some(e.into());
                }
                out.clear();
            }

            _ = sleep_until(app_deadline) => {
                break Some(ConnectionError::AppTimeout(app_timeout.unwrap_or_default()));
            }

            _ = ctx.shutdown.cancelled() => {
                debug!("Closing SSE stream for shutdown");
                break None;
            }
        }
    };

    inbound.close();
    outbound.close();
    let outcome = task.finish_within(cfg.abort_grace()).await;
    info!("SSE {} closed after {} events", path, events);

    let failure = match (failure, outcome) {
        (Some(err), _) => Some(err),
        (None, AppOutcome::Failed(err)) => Some(ConnectionError::Application(err)),
        (None, AppOutcome::Panicked) => Some(ConnectionError::Application("panicked".into())),
        (None, _) if !started => Some(ConnectionError::Application(
            "returned without starting the stream".into(),
        )),
        (None, _) => None,
    };

    match failure {
        None => Ok(()),
        Some(ConnectionError::PeerClosed) => Ok(()),
        Some(err) => {
            if !started {
                let response = match &err {
                    ConnectionError::AppTimeout(_) => {
                        Response::error(StatusCode::SERVICE_UNAVAILABLE)
                    }
                    _ => Response::internal_error(),
                };
                let _ = write_flush(&mut *stream, &response.to_bytes()).await;
            }
            warn!("SSE {} aborted: {}", path, err);
            Err(err)
        }
    }
}

/// Status line and headers of the stream. Framing headers are the
/// gateway's; the body runs until the connection closes.
fn encode_stream_head(status: u16, mut headers: Headers, out: &mut BytesMut) {
    headers.remove("content-length");
    headers.remove("transfer-encoding");
    headers.remove("connection");
    if !headers.contains("content-type") {
        headers.push("content-type", "text/event-stream");
    }
    if !headers.contains("cache-control") {
        headers.push("cache-control", "no-cache");
    }
    headers.push("connection", "close");
    encode_head(status, &headers, out);
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::gateway::driver::{self, AppOutcome};
use crate::gateway::extensions::{Extension, ExtensionRegistry};
use crate::gateway::queue;
use crate::gateway::scope::{self, ConnectionInfo, ScopeType};
use crate::gateway::{Event, SharedApp, State};
use crate::http::body::BodyDecoder;
use crate::http::parser::{parse_request_head, ParseError};
use crate::http::request::RequestHead;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::{sse, websocket};

/// Read buffer growth step.
const READ_CHUNK: usize = 4096;

/// Everything a connection needs from the server, shared by all of them.
pub struct ConnectionContext {
    pub app: SharedApp,
    pub config: Arc<ServerConfig>,
    pub extensions: ExtensionRegistry,
    pub state: State,
    /// Cancelled when the server starts draining. Idle keep-alive
    /// connections close, open WebSockets are closed with 1001.
    pub shutdown: CancellationToken,
}

#[derive(Debug)]
pub enum ConnectionState {
    /// Waiting for (the next) request head.
    Accepted,
    ScopeReady(RequestHead),
    AppRunning(ScopeType),
    Complete,
    Aborted,
}

/// One accepted socket, plain or TLS.
///
/// Runs the request/response cycle for HTTP (looping for keep-alive) or
/// hands the socket over to the WebSocket or SSE session for the rest of
/// its life.
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
    ctx: Arc<ConnectionContext>,
    info: ConnectionInfo,
    state: ConnectionState,
    requests: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, ctx: Arc<ConnectionContext>, info: ConnectionInfo) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            ctx,
            info,
            state: ConnectionState::Accepted,
            requests: 0,
        }
    }

    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let result = loop {
            match std::mem::replace(&mut self.state, ConnectionState::Complete) {
                ConnectionState::Accepted => match self.read_head().await {
                    Ok(Some(head)) => self.state = ConnectionState::ScopeReady(head),
                    Ok(None) => self.state = ConnectionState::Complete,
                    Err(e) => break Err(e),
                },

                ConnectionState::ScopeReady(head) => {
                    self.requests += 1;
                    match self.dispatch(head).await {
                        Ok(true) => self.state = ConnectionState::Accepted,
                        Ok(false) => self.state = ConnectionState::Complete,
                        Err(e) => break Err(e),
                    }
                }

                ConnectionState::AppRunning(_)
                | ConnectionState::Complete
                | ConnectionState::Aborted => break Ok(()),
            }
        };

        if result.is_err() {
            self.state = ConnectionState::Aborted;
        }
        let _ = self.stream.shutdown().await;
        result
    }

    async fn read_head(&mut self) -> Result<Option<RequestHead>, ConnectionError> {
        let cfg = self.ctx.config.clone();
        let first = self.requests == 0;
        let limit = if first {
            cfg.header_timeout()
        } else {
            cfg.keep_alive_timeout()
        };
        let deadline = Instant::now() + limit;

        loop {
            if !self.buffer.is_empty() {
                match parse_request_head(&self.buffer, cfg.max_header_size) {
                    Ok((head, consumed)) => {
                        self.buffer.advance(consumed);
                        return Ok(Some(head));
                    }
                    Err(ParseError::Incomplete) => {}
                    Err(e) => {
                        self.reject(e.status()).await;
                        return Err(e.into());
                    }
                }
            }

            // Blank lines between requests don't count as a started request
            let idle = self.buffer.iter().all(|&b| b == b'\r' || b == b'\n');
            self.buffer.reserve(READ_CHUNK);

            tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => {
                    if read? == 0 {
                        if !idle {
                            debug!("Peer closed mid-request");
                        }
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if idle && !first {
                        debug!("Keep-alive connection idle, closing");
                        return Ok(None);
                    }
                    if !idle {
                        self.reject(StatusCode::REQUEST_TIMEOUT).await;
                    }
                    return Err(ConnectionError::IdleTimeout(limit));
                }
                _ = self.ctx.shutdown.cancelled(), if idle => return Ok(None),
            }
        }
    }

    /// Runs the application for one request head. Returns whether the
    /// connection may carry another request.
    async fn dispatch(&mut self, head: RequestHead) -> Result<bool, ConnectionError> {
        let kind = if head.is_websocket_upgrade() {
            ScopeType::WebSocket
        } else if head.accepts_event_stream() {
            ScopeType::Sse
        } else {
            ScopeType::Http
        };
        self.state = ConnectionState::AppRunning(kind);

        match kind {
            ScopeType::WebSocket => {
                let (stream, buffer) = (&mut self.stream, &mut self.buffer);
                websocket::session::run(stream, buffer, head, &self.ctx, &self.info).await?;
                Ok(false)
            }
            ScopeType::Sse => {
                sse::stream::run(&mut self.stream, &mut self.buffer, head, &self.ctx, &self.info)
                    .await?;
                Ok(false)
            }
            _ => self.serve_http(head).await,
        }
    }

    async fn serve_http(&mut self, head: RequestHead) -> Result<bool, ConnectionError> {
        let ctx = self.ctx.clone();
        let cfg = &ctx.config;

        let mut decoder = match BodyDecoder::for_request(&head, cfg.max_body_size) {
            Ok(decoder) => decoder,
            Err(e) => {
                self.reject(e.status()).await;
                return Err(e.into());
            }
        };
        let mut writer = ResponseWriter::for_request(&head);
        let method = head.method;
        let target = String::from_utf8_lossy(&head.target).into_owned();

        let extensions = ctx
            .extensions
            .for_connection(ScopeType::Http, self.info.is_secure());
        let fullflush = extensions.contains(Extension::FullFlush);
        let scope = scope::build(ScopeType::Http, &head, &self.info, extensions, ctx.state.clone());

        let (mut inbound, receive) = queue::inbound(cfg.queue_capacity, Event::HttpDisconnect);
        let (send, mut outbound) = queue::outbound(cfg.queue_capacity);
        let mut task = driver::spawn(&ctx.app, scope, receive, send);

        let mut body_done = decoder.is_done();
        let mut pending = body_done.then(|| Event::HttpRequest {
            body: Bytes::new(),
            more_body: false,
        });
        if !body_done && head.expects_continue() {
            write_flush(&mut self.stream, b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }

        let mut out = BytesMut::new();
        let mut peer_gone = false;
        let mut app_done = false;
        let mut sender_gone = false;
        let app_timeout = cfg.app_timeout();
        let mut deadline = app_timeout.map(|t| Instant::now() + t);
        let read_timeout = cfg.read_timeout();
        let mut read_deadline = Instant::now() + read_timeout;

        let failure = loop {
            if writer.is_complete() {
                break None;
            }

            if pending.is_none() && !body_done && !peer_gone {
                match decoder.decode(&mut self.buffer) {
                    Ok(Some(data)) => {
                        body_done = decoder.is_done();
                        if !data.is_empty() || body_done {
                            pending = Some(Event::HttpRequest {
                                body: data,
                                more_body: !body_done,
                            });
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => break Some(e.into()),
                }
            }

            let need_body = pending.is_none() && !body_done && !peer_gone;
            // Once the body is in, keep reading only to notice the peer leaving
            let watch_peer = pending.is_none()
                && body_done
                && !peer_gone
                && self.buffer.len() < cfg.max_header_size;
            if need_body || watch_peer {
                self.buffer.reserve(READ_CHUNK);
            }

            let mut close_inbound = false;
            tokio::select! {
                biased;

                event = outbound.next(), if !sender_gone => match event {
                    Some(event) => {
                        deadline = app_timeout.map(|t| Instant::now() + t);
                        let written =
                            self.write_http_event(event, &mut writer, &mut out, fullflush).await;
                        if let Err(e) = written {
                            break Some(e);
                        }
                    }
                    // The application let go of `send`; its task may still be running
                    None => sender_gone = true,
                },

                permit = inbound.reserve(), if pending.is_some() => {
                    if let (Some(permit), Some(event)) = (permit, pending.take()) {
                        permit.send(event);
                        deadline = app_timeout.map(|t| Instant::now() + t);
                        read_deadline = Instant::now() + read_timeout;
                    }
                }

                read = self.stream.read_buf(&mut self.buffer), if need_body || watch_peer => {
                    match read {
                        Ok(n) if n > 0 => read_deadline = Instant::now() + read_timeout,
                        Ok(_) | Err(_) => {
                            debug!("Peer went away before the response completed");
                            peer_gone = true;
                            close_inbound = true;
                        }
                    }
                }

                _ = tokio::time::sleep_until(read_deadline), if need_body => {
                    debug!("Request body stalled for {:?}", read_timeout);
                    break Some(ConnectionError::IdleTimeout(read_timeout));
                }

                _ = &mut task, if !app_done => {
                    app_done = true;
                    // Drain what the application sent before returning
                    outbound.close();
                }

                _ = sleep_until(deadline) => {
                    break Some(ConnectionError::AppTimeout(app_timeout.unwrap_or_default()));
                }
            }

            if close_inbound {
                inbound.close();
            }
            if sender_gone && app_done && !writer.is_complete() {
                let outcome = task.outcome().cloned().unwrap_or(AppOutcome::Completed);
                break Some(if peer_gone {
                    ConnectionError::PeerClosed
                } else {
                    incomplete_response(outcome)
                });
            }
        };

        inbound.close();
        outbound.close();

        match failure {
            None => {
                let outcome = task.finish_within(cfg.abort_grace()).await;
                if let AppOutcome::Failed(err) = &outcome {
                    warn!("Application failed after completing the response: {}", err);
                }
                info!(
                    "{} {} {} ({} bytes)",
                    method.as_str(),
                    target,
                    writer.status().unwrap_or_default(),
                    writer.body_bytes()
                );
                Ok(writer.keep_alive() && body_done && !peer_gone && !ctx.shutdown.is_cancelled())
            }
            Some(err) => {
                if !peer_gone {
                    self.fail_response(&mut writer, &err).await;
                }
                task.finish_within(cfg.abort_grace()).await;
                warn!("{} {} aborted: {}", method.as_str(), target, err);
                Err(err)
            }
        }
    }

    async fn write_http_event(
        &mut self,
        event: Event,
        writer: &mut ResponseWriter,
        out: &mut BytesMut,
        fullflush: bool,
    ) -> Result<(), ConnectionError> {
        match event {
            Event::HttpResponseStart { status, headers } => {
                if !(200..=999).contains(&status) {
                    return Err(ConnectionError::Application(format!(
                        "invalid response status {status}"
                    )));
                }
                writer.start(status, headers)?;
            }
            Event::HttpResponseBody { body, more } => {
                writer.body(&body, more, out)?;
                if !out.is_empty() {
                    write_flush(&mut self.stream, out).await?;
                    out.clear();
                }
            }
            Event::FullFlush if fullflush => {
                writer.flush_head(out);
                if !out.is_empty() {
                    self.stream.write_all(out).await?;
                    out.clear();
                }
                self.stream.flush().await?;
            }
            other => return Err(ConnectionError::UnexpectedEvent(other.name())),
        }
        Ok(())
    }

    /// Best-effort wire reaction to an aborted exchange: an error status if
    /// nothing was sent yet, otherwise the head (if held back) and then an
    /// unterminated close.
    async fn fail_response(&mut self, writer: &mut ResponseWriter, err: &ConnectionError) {
        if !writer.is_started() {
            let status = match err {
                ConnectionError::Protocol(e) => e.status(),
                ConnectionError::AppTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                ConnectionError::IdleTimeout(_) => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            self.reject(status).await;
        } else if !writer.is_committed() {
            let mut out = BytesMut::new();
            writer.flush_head(&mut out);
            let _ = write_flush(&mut self.stream, &out).await;
        }
    }

    /// Answers with a plain error response. Write failures are ignored; the
    /// connection is closing either way.
    async fn reject(&mut self, status: StatusCode) {
        debug!("Rejecting request with {}", status.as_u16());
        let response = Response::error(status);
        let _ = write_flush(&mut self.stream, &response.to_bytes()).await;
    }
}

fn incomplete_response(outcome: AppOutcome) -> ConnectionError {
    let reason = match outcome {
        AppOutcome::Completed => "returned without completing the response".to_string(),
        AppOutcome::Failed(err) => err,
        AppOutcome::Panicked => "panicked".to_string(),
        AppOutcome::Cancelled => "cancelled".to_string(),
    };
    ConnectionError::Application(reason)
}

pub(crate) async fn write_flush<S>(stream: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await?;
    stream.flush().await
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! A WebSocket connection from upgrade request to close.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::gateway::driver::{self, AppOutcome, AppTask};
use crate::gateway::extensions::Extension;
use crate::gateway::queue::{self, InboundQueue, OutboundQueue};
use crate::gateway::scope::{self, ConnectionInfo, ScopeType};
use crate::gateway::{Event, Message};
use crate::http::connection::{sleep_until, write_flush, ConnectionContext};
use crate::http::request::RequestHead;
use crate::http::response::{Response, StatusCode};
use crate::websocket::frame::{
    close_code, decode_frame, encode_close, encode_frame, is_valid_close_code, FrameError,
    Incoming, MessageAssembler, OpCode, MAX_CONTROL_PAYLOAD,
};
use crate::websocket::handshake;

const READ_CHUNK: usize = 4096;

/// Serves one WebSocket from its upgrade request: validates the handshake,
/// runs the application, and performs the closing handshake.
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
    let accept_key = match handshake::validate(&head) {
        Ok(key) => key,
        Err(e) => {
            let _ = write_flush(&mut *stream, &e.response().to_bytes()).await;
            return Err(e.into());
        }
    };

    let cfg = &ctx.config;
    let extensions = ctx
        .extensions
        .for_connection(ScopeType::WebSocket, info.is_secure());
    let ping_extension = extensions.contains(Extension::WebSocketPing);
    let scope = scope::build(ScopeType::WebSocket, &head, info, extensions, ctx.state.clone());
    let offered = scope
        .connection()
        .map(|s| s.subprotocols.clone())
        .unwrap_or_default();
    let path = String::from_utf8_lossy(&head.target).into_owned();

    let (mut inbound, receive) = queue::inbound(
        cfg.queue_capacity,
        Event::WebSocketDisconnect {
            code: close_code::ABNORMAL,
        },
    );
    let (send, mut outbound) = queue::outbound(cfg.queue_capacity);
    inbound.try_push(Event::WebSocketConnect);
    let mut task = driver::spawn(&ctx.app, scope, receive, send);

    // Handshake phase: wait for the application's verdict
    let app_timeout = cfg.app_timeout();
    let verdict = tokio::select! {
        biased;
        event = outbound.next() => event,
        _ = sleep_until(app_timeout.map(|t| Instant::now() + t)) => {
            let err = ConnectionError::AppTimeout(app_timeout.unwrap_or_default());
            return refuse(
                &mut *stream,
                inbound,
                outbound,
                task,
                ctx,
                StatusCode::SERVICE_UNAVAILABLE,
                err,
            )
            .await;
        }
        _ = ctx.shutdown.cancelled() => {
            let err = ConnectionError::Application("server shutting down".to_string());
            return refuse(
                &mut *stream,
                inbound,
                outbound,
                task,
                ctx,
                StatusCode::SERVICE_UNAVAILABLE,
                err,
            )
            .await;
        }
    };
    match verdict {
        Some(Event::WebSocketAccept {
            subprotocol,
            headers,
        }) => {
            if let Some(protocol) = subprotocol.as_ref().filter(|p| !offered.contains(p)) {
                let err = ConnectionError::Application(format!(
                    "subprotocol {protocol:?} was not offered"
                ));
                return refuse(
                    &mut *stream,
                    inbound,
                    outbound,
                    task,
                    ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err,
                )
                .await;
            }
            let response =
                handshake::accept_response(&accept_key, subprotocol.as_deref(), &headers);
            write_flush(&mut *stream, &response.to_bytes()).await?;
            info!("WebSocket {} accepted", path);
        }
        Some(Event::WebSocketClose { code, .. }) => {
            debug!("WebSocket {} refused by application", path);
            inbound.close_with(Event::WebSocketDisconnect { code });
            let refusal = Response::error(StatusCode::FORBIDDEN);
            let _ = write_flush(&mut *stream, &refusal.to_bytes()).await;
            outbound.close();
            task.finish_within(cfg.abort_grace()).await;
            return Ok(());
        }
        Some(other) => {
            let err = ConnectionError::UnexpectedEvent(other.name());
            return refuse(
                &mut *stream,
                inbound,
                outbound,
                task,
                ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                err,
            )
            .await;
        }
        None => {
            // The application let go of `send` without accepting
            let outcome = task.finish_within(cfg.abort_grace()).await;
            let status = if outcome.is_success() {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let _ = write_flush(&mut *stream, &Response::error(status).to_bytes()).await;
            inbound.close();
            return match outcome {
                AppOutcome::Completed => Ok(()),
                AppOutcome::Failed(err) => Err(ConnectionError::Application(err)),
                other => Err(ConnectionError::Application(format!("{other:?}"))),
            };
        }
    }

    let mut session = Session {
        stream,
        buffer,
        assembler: MessageAssembler::new(cfg.max_message_size),
        max_message: cfg.max_message_size,
        auto_pong: true,
        ping_extension,
        close_sent: false,
        close_deadline: None,
        close_timeout: cfg.ws_close_timeout(),
        app_timeout,
        code: close_code::ABNORMAL,
    };
    let result = session.serve(&mut inbound, &mut outbound, &mut task, ctx).await;
    let code = session.code;

    inbound.close_with(Event::WebSocketDisconnect { code });
    outbound.close();
    let outcome = task.finish_within(cfg.abort_grace()).await;
    info!("WebSocket {} closed with {}", path, code);

    match (result, outcome) {
        (Err(e), _) => Err(e),
        (Ok(()), AppOutcome::Failed(err)) => Err(ConnectionError::Application(err)),
        (Ok(()), _) => Ok(()),
    }
}

/// Rejects the upgrade with an HTTP error before any `101` was sent.
async fn refuse<S>(
    stream: &mut S,
    mut inbound: InboundQueue,
    mut outbound: OutboundQueue,
    mut task: AppTask,
    ctx: &ConnectionContext,
    status: StatusCode,
    err: ConnectionError,
) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    let _ = write_flush(&mut *stream, &Response::error(status).to_bytes()).await;
    inbound.close_with(Event::WebSocketDisconnect {
        code: close_code::ABNORMAL,
    });
    outbound.close();
    task.finish_within(ctx.config.abort_grace()).await;
    Err(err)
}

struct Session<'a, S> {
    stream: &'a mut S,
    buffer: &'a mut BytesMut,
    assembler: MessageAssembler,
    max_message: usize,
    auto_pong: bool,
    ping_extension: bool,
    close_sent: bool,
    close_deadline: Option<Instant>,
    close_timeout: Duration,
    /// Longest the application may go without a `send` or a delivered event.
    app_timeout: Option<Duration>,
    /// Close code reported to the application in `websocket.disconnect`.
    code: u16,
}

impl<S> Session<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn serve(
        &mut self,
        inbound: &mut InboundQueue,
        outbound: &mut OutboundQueue,
        task: &mut AppTask,
        ctx: &ConnectionContext,
    ) -> Result<(), ConnectionError> {
        let mut pending: Option<Event> = None;
        let mut app_done = false;
        let mut drained = false;
        let mut app_deadline = self.app_timeout.map(|t| Instant::now() + t);

        loop {
            // Decode buffered frames one at a time so a slow reader holds
            // back the socket rather than piling up events
            if pending.is_none() {
                match decode_frame(&mut *self.buffer, self.max_message) {
                    Ok(Some(frame)) => match self.assembler.push(frame) {
                        Ok(Some(incoming)) => {
                            match self.on_incoming(incoming).await? {
                                Step::Deliver(event) => pending = Some(event),
                                Step::Continue => {}
                                Step::Closed => return Ok(()),
                            }
                            continue;
                        }
                        Ok(None) => continue,
                        Err(e) => return self.fail(e).await,
                    },
                    Ok(None) => {}
                    Err(e) => return self.fail(e).await,
                }
            }

            if drained && !self.close_sent {
                let failed = task.is_finished() && !(&mut *task).await.is_success();
                let code = if failed {
                    close_code::INTERNAL_ERROR
                } else {
                    close_code::NORMAL
                };
                self.send_close(code, "").await?;
            }

            let reading = pending.is_none();
            if reading {
                self.buffer.reserve(READ_CHUNK);
            }

            tokio::select! {
                biased;

                event = outbound.next(), if !drained && !self.close_sent => match event {
                    Some(event) => {
                        app_deadline = self.app_timeout.map(|t| Instant::now() + t);
                        self.on_app_event(event).await?
                    }
                    None => drained = true,
                },

                permit = inbound.reserve(), if pending.is_some() => {
                    match (permit, pending.take()) {
                        (Some(permit), Some(event)) => {
                            permit.send(event);
                            app_deadline = self.app_timeout.map(|t| Instant::now() + t);
                        }
                        // Application no longer listening; drop the event
                        _ => {}
                    }
                }

                read = self.stream.read_buf(&mut *self.buffer), if reading => {
                    match read {
                        Ok(n) if n > 0 => {}
                        Ok(_) => {
                            debug!("WebSocket peer vanished without a close frame");
                            self.code = close_code::ABNORMAL;
                            return Ok(());
                        }
                        Err(e) => {
                            self.code = close_code::ABNORMAL;
                            return Err(e.into());
                        }
                    }
                }

                _ = &mut *task, if !app_done => {
                    app_done = true;
                    outbound.close();
                }

                _ = sleep_until(app_deadline), if !self.close_sent => {
                    let idle = self.app_timeout.unwrap_or_default();
                    warn!("Application idle for {:?}, closing", idle);
                    self.send_close(close_code::INTERNAL_ERROR, "application timeout").await?;
                }

                _ = sleep_until(self.close_deadline) => {
                    debug!("Peer did not answer the close frame in time");
                    return Ok(());
                }

                _ = ctx.shutdown.cancelled(), if !self.close_sent => {
                    self.send_close(close_code::GOING_AWAY, "server shutting down").await?;
                }
            }
        }
    }

    async fn on_incoming(&mut self, incoming: Incoming) -> Result<Step, ConnectionError> {
        match incoming {
            Incoming::Message(message) => {
                if self.close_sent {
                    // Data after our close frame is discarded
                    return Ok(Step::Continue);
                }
                Ok(Step::Deliver(Event::WebSocketReceive(message)))
            }
            Incoming::Ping(data) => {
                if self.close_sent {
                    Ok(Step::Continue)
                } else if self.auto_pong {
                    self.write_frame(OpCode::Pong, &data).await?;
                    Ok(Step::Continue)
                } else {
                    Ok(Step::Deliver(Event::WebSocketPing(data)))
                }
            }
            Incoming::Pong(data) => {
                if self.ping_extension && !self.auto_pong {
                    Ok(Step::Deliver(Event::WebSocketPong(data)))
                } else {
                    Ok(Step::Continue)
                }
            }
            Incoming::Close { code, reason } => {
                debug!(code, reason = %reason, "Peer sent close");
                if !self.close_sent {
                    // Echo the peer's code to complete the closing handshake
                    let mut out = BytesMut::new();
                    if code == close_code::NO_STATUS {
                        encode_frame(OpCode::Close, &[], &mut out);
                    } else {
                        encode_close(code, "", &mut out);
                    }
                    write_flush(&mut *self.stream, &out).await?;
                    self.close_sent = true;
                }
                self.code = code;
                Ok(Step::Closed)
            }
        }
    }

    async fn on_app_event(&mut self, event: Event) -> Result<(), ConnectionError> {
        match event {
            Event::WebSocketSend(Message::Text(text)) => {
                self.write_frame(OpCode::Text, text.as_bytes()).await
            }
            Event::WebSocketSend(Message::Binary(data)) => {
                self.write_frame(OpCode::Binary, &data).await
            }
            Event::WebSocketClose { code, reason } => {
                let code = if is_valid_close_code(code) {
                    code
                } else {
                    warn!(code, "Application sent an invalid close code, using 1000");
                    close_code::NORMAL
                };
                self.send_close(code, &reason).await
            }
            Event::WebSocketAutoPong { enabled } if self.ping_extension => {
                self.auto_pong = enabled;
                Ok(())
            }
            Event::WebSocketPong(data) if self.ping_extension => {
                self.write_frame(OpCode::Pong, control_payload(&data)).await
            }
            Event::WebSocketPing(data) if self.ping_extension => {
                self.write_frame(OpCode::Ping, control_payload(&data)).await
            }
            other => Err(ConnectionError::UnexpectedEvent(other.name())),
        }
    }

    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnectionError> {
        let mut out = BytesMut::with_capacity(payload.len() + 10);
        encode_frame(opcode, payload, &mut out);
        write_flush(&mut *self.stream, &out).await?;
        Ok(())
    }

    /// Starts the closing handshake from our side.
    async fn send_close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        let mut out = BytesMut::new();
        encode_close(code, reason, &mut out);
        write_flush(&mut *self.stream, &out).await?;
        self.close_sent = true;
        self.close_deadline = Some(Instant::now() + self.close_timeout);
        self.code = code;
        Ok(())
    }

    /// Closes with the error's code after a protocol violation by the peer.
    async fn fail(&mut self, err: FrameError) -> Result<(), ConnectionError> {
        warn!("WebSocket protocol error: {}", err);
        let code = err.close_code();
        if !self.close_sent {
            let mut out = BytesMut::new();
            encode_close(code, "", &mut out);
            let _ = write_flush(&mut *self.stream, &out).await;
            self.close_sent = true;
        }
        self.code = code;
        Err(err.into())
    }
}

enum Step {
    Deliver(Event),
    Continue,
    Closed,
}

fn control_payload(data: &Bytes) -> &[u8] {
    &data[..data.len().min(MAX_CONTROL_PAYLOAD)]
}

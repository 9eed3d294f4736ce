//! Bounded per-connection event queues behind `receive` and `send`.
//!
//! The inbound queue is fed by the connection and drained by the
//! application's [`EventReceiver`]; the outbound queue is fed by the
//! application's [`EventSender`] and drained by the connection. Both are
//! bounded: a full outbound queue suspends `send()` until the connection has
//! taken an event for writing, which is the gateway's flow control.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SendError;
use crate::gateway::event::{Event, Message};
use crate::http::headers::Headers;

/// Creates the inbound queue for one scope. `disconnect` is what
/// `receive()` yields once the queue is closed without a more specific
/// closing event.
pub fn inbound(capacity: usize, disconnect: Event) -> (InboundQueue, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closing = Arc::new(Mutex::new(None));
    (
        InboundQueue {
            tx: Some(tx),
            closing: closing.clone(),
        },
        EventReceiver {
            rx,
            closing,
            disconnect,
            closed: None,
        },
    )
}

/// Creates the outbound queue for one scope.
pub fn outbound(capacity: usize) -> (EventSender, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, OutboundQueue { rx })
}

/// Gateway side of the inbound queue.
pub struct InboundQueue {
    tx: Option<mpsc::Sender<Event>>,
    closing: Arc<Mutex<Option<Event>>>,
}

impl InboundQueue {
    /// Waits for room and enqueues `event`. Returns false if the queue is
    /// closed or the application dropped its receiver.
    pub async fn push(&self, event: Event) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Enqueues without waiting. Returns false when full or closed.
    pub fn try_push(&self, event: Event) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Waits for room for one event. `None` when nobody is listening.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, Event>> {
        match &self.tx {
            Some(tx) => tx.reserve().await.ok(),
            None => None,
        }
    }

    /// Closes the queue: once drained, `receive()` yields the default
    /// disconnect event.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Closes the queue; once drained, `receive()` yields `event`.
    pub fn close_with(&mut self, event: Event) {
        *self.closing.lock() = Some(event);
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// The application's `receive` operation.
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    closing: Arc<Mutex<Option<Event>>>,
    disconnect: Event,
    closed: Option<Event>,
}

impl EventReceiver {
    /// Waits for the next inbound event.
    ///
    /// After the connection is gone this resolves immediately, and every
    /// later call yields the same disconnect event.
    pub async fn receive(&mut self) -> Event {
        if let Some(event) = &self.closed {
            return event.clone();
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_disconnect() {
                    self.closed = Some(event.clone());
                }
                event
            }
            None => {
                let event = self
                    .closing
                    .lock()
                    .clone()
                    .unwrap_or_else(|| self.disconnect.clone());
                self.closed = Some(event.clone());
                event
            }
        }
    }

    /// Collects `http.request` events until `more_body` is false and
    /// returns the whole body. Stops early on disconnect.
    pub async fn read_body(&mut self) -> Bytes {
        let mut body = Vec::new();
        loop {
            match self.receive().await {
                Event::HttpRequest { body: chunk, more_body } => {
                    body.extend_from_slice(&chunk);
                    if !more_body {
                        break;
                    }
                }
                _ => break,
            }
        }
        Bytes::from(body)
    }
}

/// The application's `send` operation. Cloneable so an application may send
/// from several tasks; the connection sees events in enqueue order.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Hands `event` to the connection, suspending while the outbound queue
    /// is full.
    pub async fn send(&self, event: Event) -> Result<(), SendError> {
        self.tx.send(event).await.map_err(|_| SendError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sends a complete response: start, then a single final body event.
    pub async fn respond(
        &self,
        status: u16,
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        self.send(Event::HttpResponseStart { status, headers }).await?;
        self.send(Event::HttpResponseBody {
            body: body.into(),
            more: false,
        })
        .await
    }

    /// Accepts a WebSocket handshake without a subprotocol.
    pub async fn accept(&self) -> Result<(), SendError> {
        self.send(Event::WebSocketAccept {
            subprotocol: None,
            headers: Headers::new(),
        })
        .await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(Event::WebSocketSend(Message::Text(text.into())))
            .await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send(Event::WebSocketSend(Message::Binary(data.into())))
            .await
    }
}

/// Gateway side of the outbound queue.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Event>,
}

impl OutboundQueue {
    /// Takes the next event for writing. `None` once every sender is gone
    /// and the queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Stops accepting events; pending and future `send()` calls fail.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing_subscriber::EnvFilter;

use pagi::gateway::broadcast::{Broadcaster, LocalBroadcaster};
use pagi::gateway::{Application, ConnectionScope, Message, SseEvent};
use pagi::http::headers::Headers;
use pagi::http::request::Method;
use pagi::{Config, Event, EventReceiver, EventSender, Scope, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load()?;
    let app = Demo {
        rooms: Arc::new(LocalBroadcaster::default()),
    };

    Server::new(cfg, app)
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

/// Hello over HTTP, an echoing chat room over WebSocket and a clock over SSE.
struct Demo {
    rooms: Arc<LocalBroadcaster>,
}

impl Application for Demo {
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let rooms = self.rooms.clone();
        Box::pin(async move {
            match &scope {
                Scope::Lifespan(_) => lifespan(&scope, receive, send).await,
                Scope::Http(conn) => http(conn, rooms, receive, send).await,
                Scope::WebSocket(conn) => chat(conn, rooms, receive, send).await,
                Scope::Sse(_) => clock(receive, send).await,
            }
        })
    }
}

async fn lifespan(
    scope: &Scope,
    mut receive: EventReceiver,
    send: EventSender,
) -> anyhow::Result<()> {
    loop {
        match receive.receive().await {
            Event::LifespanStartup => {
                scope.state().insert("started_at", Instant::now());
                send.send(Event::LifespanStartupComplete).await?;
            }
            Event::LifespanShutdown => {
                send.send(Event::LifespanShutdownComplete).await?;
                return Ok(());
            }
            _ => {}
        }
    }
}

async fn http(
    conn: &ConnectionScope,
    rooms: Arc<LocalBroadcaster>,
    mut receive: EventReceiver,
    send: EventSender,
) -> anyhow::Result<()> {
    let body = receive.read_body().await;
    let text = [("content-type", "text/plain")];

    match (conn.method, conn.path.as_str()) {
        (Method::POST, path) if path.starts_with("/rooms/") => {
            let room = &path["/rooms/".len()..];
            let text_body = String::from_utf8_lossy(&body).into_owned();
            let reached = rooms.publish(room, Message::Text(text_body));
            send.respond(200, text.into_iter().collect(), format!("delivered to {}\n", reached))
                .await?;
        }
        (_, "/uptime") => {
            let uptime = conn
                .state
                .get::<Instant>("started_at")
                .map(|t| t.elapsed().as_secs())
                .unwrap_or_default();
            send.respond(200, text.into_iter().collect(), format!("{}s\n", uptime))
                .await?;
        }
        _ => {
            send.send(Event::response_start(200, text)).await?;
            send.send(Event::response_body("Hello from PAGI!", false)).await?;
        }
    }
    Ok(())
}

async fn chat(
    conn: &ConnectionScope,
    rooms: Arc<LocalBroadcaster>,
    mut receive: EventReceiver,
    send: EventSender,
) -> anyhow::Result<()> {
    if !matches!(receive.receive().await, Event::WebSocketConnect) {
        return Ok(());
    }
    send.accept().await?;

    let room = conn.path.trim_start_matches('/').to_string();
    let mut subscription = rooms.subscribe(&room);
    loop {
        tokio::select! {
            event = receive.receive() => match event {
                Event::WebSocketReceive(Message::Text(text)) => {
                    send.send_text(format!("echo: {}", text)).await?;
                }
                Event::WebSocketReceive(Message::Binary(data)) => send.send_binary(data).await?,
                Event::WebSocketDisconnect { .. } => return Ok(()),
                _ => {}
            },
            Some(message) = subscription.recv() => {
                send.send(Event::WebSocketSend(message)).await?;
            }
        }
    }
}

async fn clock(mut receive: EventReceiver, send: EventSender) -> anyhow::Result<()> {
    send.send(Event::SseStart {
        status: 200,
        headers: Headers::new(),
    })
    .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut id = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                id += 1;
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let tick = SseEvent::new(now.to_string()).event("tick").id(id.to_string());
                send.send(Event::SseSend(tick)).await?;
            }
            event = receive.receive() => {
                if event.is_disconnect() {
                    return Ok(());
                }
            }
        }
    }
}

mod common;

use tokio::sync::mpsc;

use common::{addr, config, start, start_with, Client, WAIT};
use pagi::gateway::{from_fn, Event, Scope, SseEvent};
use pagi::http::headers::Headers;

const SUBSCRIBE: &[u8] = b"GET /events HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n";

#[tokio::test]
async fn test_event_stream() {
    let app = from_fn(|scope, _, send| async move {
        assert!(matches!(scope, Scope::Sse(_)));
        let mut headers = Headers::new();
        headers.push("x-stream", "prices");
        send.send(Event::SseStart { status: 200, headers }).await?;
        send.send(Event::SseSend(SseEvent::new("101.5").event("price").id("1")))
            .await?;
        send.send(Event::SseSend(SseEvent::new("line one\nline two"))).await?;
        send.send(Event::SseSend(SseEvent::new("").id("2").retry(3000))).await?;
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    let reply = client.read_head().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("text/event-stream"));
    assert_eq!(reply.header("cache-control"), Some("no-cache"));
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(reply.header("x-stream"), Some("prices"));
    assert_eq!(reply.header("content-length"), None);
    assert_eq!(reply.header("transfer-encoding"), None);

    // The stream ends with the application
    let body = String::from_utf8(client.read_to_end().await).unwrap();
    assert_eq!(
        body,
        "event: price\nid: 1\ndata: 101.5\n\n\
         data: line one\ndata: line two\n\n\
         id: 2\nretry: 3000\n\n"
    );
}

#[tokio::test]
async fn test_first_event_starts_the_stream() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::SseSend(SseEvent::new("hello"))).await?;
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    let reply = client.read_head().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("text/event-stream"));
    assert_eq!(client.read_to_end().await, b"data: hello\n\n");
}

#[tokio::test]
async fn test_stream_never_started_is_500() {
    let app = from_fn(|_, _, _| async { Ok(()) });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    assert_eq!(client.read_response().await.status, 500);
}

#[tokio::test]
async fn test_client_disconnect_reaches_application() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = from_fn(move |_, mut receive, send| {
        let tx = tx.clone();
        async move {
            send.send(Event::SseStart {
                status: 200,
                headers: Headers::new(),
            })
            .await?;
            let _ = tx.send(receive.receive().await);
            Ok(())
        }
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    client.read_head().await;
    drop(client);

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(event, Some(Event::SseDisconnect));
}

#[tokio::test]
async fn test_keepalive_comments() {
    let mut cfg = config();
    cfg.server.sse_keepalive_secs = Some(1);
    let app = from_fn(|_, mut receive, send| async move {
        send.send(Event::SseStart {
            status: 200,
            headers: Headers::new(),
        })
        .await?;
        receive.receive().await;
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    client.read_head().await;
    assert_eq!(client.read_until(b"\n").await, b": keepalive\n");
}

#[tokio::test]
async fn test_shutdown_ends_the_stream() {
    let app = from_fn(|_, mut receive, send| async move {
        send.send(Event::SseSend(SseEvent::new("first"))).await?;
        receive.receive().await;
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    client.read_head().await;
    assert_eq!(client.read_until(b"\n\n").await, b"data: first\n\n");

    server.shutdown().await.unwrap();
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_http_events_are_rejected_on_a_stream() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::response_start(200, [("content-type", "text/plain")]))
            .await?;
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    assert_eq!(client.read_response().await.status, 500);
}

#[tokio::test]
async fn test_idle_application_before_start_is_503() {
    let mut cfg = config();
    cfg.server.app_timeout_secs = Some(1);
    let app = from_fn(|_, receive, send| async move {
        std::future::pending::<()>().await;
        drop((receive, send));
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    assert_eq!(client.read_response().await.status, 503);
}

#[tokio::test]
async fn test_idle_application_ends_the_stream() {
    let mut cfg = config();
    cfg.server.app_timeout_secs = Some(1);
    let app = from_fn(|_, receive, send| async move {
        send.send(Event::SseSend(SseEvent::new("only one"))).await?;
        std::future::pending::<()>().await;
        drop((receive, send));
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(SUBSCRIBE).await;
    client.read_head().await;
    let body = tokio::time::timeout(WAIT, client.read_to_end()).await.unwrap();
    assert_eq!(body, b"data: only one\n\n");
}

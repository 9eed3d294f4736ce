mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use common::{addr, config, dechunk, start, start_with, Client};
use pagi::config::LifespanMode;
use pagi::gateway::{from_fn, Event, Scope, SharedApp};

fn hello() -> SharedApp {
    from_fn(|scope, _receive, send| async move {
        if let Scope::Http(_) = scope {
            send.send(Event::response_start(200, [("content-type", "text/plain")]))
                .await?;
            send.send(Event::response_body("Hello from PAGI!", false)).await?;
        }
        Ok(())
    })
}

/// Responds with the request path and whatever body arrived.
fn echo() -> SharedApp {
    from_fn(|scope, mut receive, send| async move {
        let path = scope.connection().map(|c| c.path.clone()).unwrap_or_default();
        let body = receive.read_body().await;
        let mut reply = path.into_bytes();
        reply.push(b' ');
        reply.extend_from_slice(&body);
        send.respond(200, Default::default(), reply).await?;
        Ok(())
    })
}

#[tokio::test]
async fn test_simple_http_response() {
    let server = start(hello()).await;
    let mut client = Client::connect(addr(&server)).await;

    let reply = client.get("/").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("text/plain"));
    assert_eq!(reply.header("content-length"), Some("16"));
    assert_eq!(reply.text(), "Hello from PAGI!");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_streamed_body_is_chunked() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::response_start(200, [("content-type", "text/plain")]))
            .await?;
        for (chunk, more) in [("a", true), ("b", true), ("c", false)] {
            send.send(Event::response_body(chunk, more)).await?;
        }
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    let reply = client.read_head().await;
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert_eq!(reply.header("connection"), Some("close"));

    let raw = client.read_to_end().await;
    assert!(raw.ends_with(b"0\r\n\r\n"));
    assert_eq!(dechunk(&raw), b"abc");
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let server = start(echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    assert_eq!(client.get("/first").await.text(), "/first ");
    assert_eq!(client.get("/second").await.text(), "/second ");

    // Pipelined requests are answered in order
    client
        .send(b"GET /a HTTP/1.1\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
        .await;
    assert_eq!(client.read_response().await.text(), "/a ");
    assert_eq!(client.read_response().await.text(), "/b hi");
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let server = start(echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET /old HTTP/1.0\r\n\r\n").await;
    let reply = client.read_response().await;
    assert_eq!(reply.text(), "/old ");
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_request_bodies_reach_the_application() {
    let server = start(echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client
        .send(b"POST /len HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world")
        .await;
    assert_eq!(client.read_response().await.text(), "/len hello world");

    client
        .send(b"POST /chunked HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n")
        .await;
    assert_eq!(client.read_response().await.text(), "/chunked abcde");
}

#[tokio::test]
async fn test_expect_continue() {
    let server = start(echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client
        .send(b"PUT /up HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
        .await;
    assert_eq!(client.read_head().await.status, 100);

    client.send(b"data").await;
    assert_eq!(client.read_response().await.text(), "/up data");
}

#[tokio::test]
async fn test_head_request_gets_no_body() {
    let server = start(hello()).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"HEAD / HTTP/1.1\r\n\r\n").await;
    let reply = client.read_head().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), None);

    // Nothing but the next response follows
    let next = client.get("/").await;
    assert_eq!(next.text(), "Hello from PAGI!");
}

#[tokio::test]
async fn test_application_error_becomes_500() {
    let app = from_fn(|_, _, _| async { anyhow::bail!("database unavailable") });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    let reply = client.get("/").await;
    assert_eq!(reply.status, 500);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_error_after_start_closes_without_terminator() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::response_start(200, [("content-type", "text/plain")]))
            .await?;
        anyhow::bail!("lost the upstream")
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await;
    let raw = String::from_utf8(client.read_to_end().await).unwrap();

    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(raw.matches("HTTP/1.1").count(), 1);
    assert!(!raw.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn test_error_mid_body_truncates_response() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::response_start(200, Vec::<(&str, &str)>::new())).await?;
        send.send(Event::response_body("partial", true)).await?;
        anyhow::bail!("crashed mid-stream")
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await;
    let raw = String::from_utf8(client.read_to_end().await).unwrap();

    assert!(raw.contains("7\r\npartial\r\n"));
    assert!(!raw.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn test_receive_reports_disconnect_after_response() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = from_fn(move |_, mut receive, send| {
        let tx = tx.clone();
        async move {
            receive.read_body().await;
            send.respond(204, Default::default(), "").await?;
            let _ = tx.send(receive.receive().await);
            Ok(())
        }
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    assert_eq!(client.get("/").await.status, 204);
    let event = tokio::time::timeout(common::WAIT, rx.recv()).await.unwrap();
    assert_eq!(event, Some(Event::HttpDisconnect));
}

#[tokio::test]
async fn test_protocol_errors_get_status_codes() {
    let mut cfg = config();
    cfg.server.max_header_size = 256;
    cfg.server.max_body_size = Some(8);
    let server = start_with(cfg, echo()).await;

    let cases: [(&[u8], u16); 6] = [
        (b"GARBAGE\r\n\r\n", 400),
        (b"BREW / HTTP/1.1\r\n\r\n", 501),
        (b"GET / HTTP/2.0\r\n\r\n", 505),
        (b"POST / HTTP/1.1\r\nContent-Length: 1\r\nTransfer-Encoding: chunked\r\n\r\n", 400),
        (b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n", 501),
        (b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n", 413),
    ];
    for (request, status) in cases {
        let mut client = Client::connect(addr(&server)).await;
        client.send(request).await;
        let reply = client.read_response().await;
        assert_eq!(reply.status, status, "{}", String::from_utf8_lossy(request));
        assert!(client.closed().await);
    }

    let mut client = Client::connect(addr(&server)).await;
    let big = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n\r\n", "x".repeat(400));
    client.send(big.as_bytes()).await;
    assert_eq!(client.read_response().await.status, 431);
}

#[tokio::test]
async fn test_oversized_chunked_body_is_rejected() {
    let mut cfg = config();
    cfg.server.max_body_size = Some(4);
    let server = start_with(cfg, echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client
        .send(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n8\r\n12345678\r\n0\r\n\r\n")
        .await;
    assert_eq!(client.read_response().await.status, 413);
}

#[tokio::test]
async fn test_slow_application_times_out() {
    let mut cfg = config();
    cfg.server.app_timeout_secs = Some(1);
    let app = from_fn(|_, _, _| async {
        std::future::pending::<()>().await;
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;

    assert_eq!(client.get("/").await.status, 503);
}

#[tokio::test]
async fn test_application_holding_send_times_out() {
    let mut cfg = config();
    cfg.server.app_timeout_secs = Some(1);
    let app = from_fn(|_, mut receive, send| async move {
        receive.receive().await;
        std::future::pending::<()>().await;
        drop(send);
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;

    assert_eq!(client.get("/").await.status, 503);
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_stalled_request_body_times_out() {
    let mut cfg = config();
    cfg.server.read_timeout_secs = 1;
    let server = start_with(cfg, echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client
        .send(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
        .await;
    let reply = tokio::time::timeout(common::WAIT, client.read_response())
        .await
        .expect("stalled body was never cut off");
    assert_eq!(reply.status, 408);
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_slow_but_steady_body_is_not_cut_off() {
    let mut cfg = config();
    cfg.server.read_timeout_secs = 1;
    let server = start_with(cfg, echo()).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"POST /slow HTTP/1.1\r\nContent-Length: 4\r\n\r\n").await;
    for byte in [b"a", b"b", b"c", b"d"] {
        tokio::time::sleep(Duration::from_millis(400)).await;
        client.send(byte).await;
    }
    assert_eq!(client.read_response().await.text(), "/slow abcd");
}

/// Starts a response, forces the head out, then waits for the test to
/// release the body.
fn flushing_app(release: Arc<Notify>) -> SharedApp {
    from_fn(move |_, _, send| {
        let release = release.clone();
        async move {
            send.send(Event::response_start(200, [("content-type", "text/plain")]))
                .await?;
            send.send(Event::FullFlush).await?;
            release.notified().await;
            send.send(Event::response_body("late", false)).await?;
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_fullflush_writes_head_before_body() {
    let release = Arc::new(Notify::new());
    let server = start(flushing_app(release.clone())).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await;
    let reply = tokio::time::timeout(common::WAIT, client.read_head())
        .await
        .expect("head was held back");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert_eq!(reply.header("content-length"), None);

    release.notify_one();
    let raw = client.read_until(b"0\r\n\r\n").await;
    assert_eq!(dechunk(&raw), b"late");
}

#[tokio::test]
async fn test_fullflush_is_refused_when_not_offered() {
    let mut cfg = config();
    cfg.server.extensions = Some(Vec::new());
    let release = Arc::new(Notify::new());
    let server = start_with(cfg, flushing_app(release.clone())).await;
    let mut client = Client::connect(addr(&server)).await;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await;
    release.notify_one();
    let raw = String::from_utf8(client.read_to_end().await).unwrap();

    // The head went out when the exchange was aborted; the body never did
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!raw.contains("late"));
    assert!(!raw.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn test_bad_content_length_from_application_is_500() {
    let app = from_fn(|_, _, send| async move {
        send.send(Event::response_start(200, [("content-length", "lots")]))
            .await?;
        send.send(Event::response_body("body", false)).await?;
        Ok(())
    });
    let server = start(app).await;
    let mut client = Client::connect(addr(&server)).await;

    let reply = client.get("/").await;
    assert_eq!(reply.status, 500);
    assert_eq!(reply.header("transfer-encoding"), None);
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
    let mut cfg = config();
    cfg.server.header_timeout_secs = 1;
    let server = start_with(cfg, hello()).await;

    let mut silent = Client::connect(addr(&server)).await;
    assert!(silent.closed().await);

    let mut partial = Client::connect(addr(&server)).await;
    partial.send(b"GET / HTTP/1.1\r\nHost:").await;
    assert_eq!(partial.read_response().await.status, 408);
}

#[tokio::test]
async fn test_connection_limit_defers_accepts() {
    let mut cfg = config();
    cfg.server.max_connections = 1;
    let server = start_with(cfg, hello()).await;

    let mut first = Client::connect(addr(&server)).await;
    assert_eq!(first.get("/").await.status, 200);

    // Accepted by the kernel, but not served while the first is open
    let mut second = Client::connect(addr(&server)).await;
    second.send(b"GET / HTTP/1.1\r\n\r\n").await;
    assert!(second.silent_for(Duration::from_millis(300)).await);

    drop(first);
    assert_eq!(second.read_response().await.status, 200);
}

#[tokio::test]
async fn test_lifespan_runs_around_serving() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let app = {
        let log = log.clone();
        from_fn(move |scope, mut receive, send| {
            let log = log.clone();
            async move {
                match &scope {
                    Scope::Lifespan(_) => loop {
                        match receive.receive().await {
                            Event::LifespanStartup => {
                                log.lock().push("startup".into());
                                scope.state().insert("greeting", "hi from startup".to_string());
                                send.send(Event::LifespanStartupComplete).await?;
                            }
                            Event::LifespanShutdown => {
                                log.lock().push("shutdown".into());
                                send.send(Event::LifespanShutdownComplete).await?;
                                return Ok(());
                            }
                            _ => {}
                        }
                    },
                    Scope::Http(conn) => {
                        log.lock().push("request".into());
                        let greeting = conn.state.get::<String>("greeting").unwrap();
                        send.respond(200, Default::default(), greeting.as_str().to_owned())
                            .await?;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        })
    };

    let mut cfg = config();
    cfg.lifespan.mode = LifespanMode::On;
    let server = start_with(cfg, app).await;
    assert_eq!(*log.lock(), vec!["startup"]);

    let mut client = Client::connect(addr(&server)).await;
    assert_eq!(client.get("/").await.text(), "hi from startup");
    drop(client);

    server.shutdown().await.unwrap();
    assert_eq!(*log.lock(), vec!["startup", "request", "shutdown"]);
}

#[tokio::test]
async fn test_failed_startup_prevents_binding() {
    let app = from_fn(|_, mut receive, send| async move {
        if let Event::LifespanStartup = receive.receive().await {
            send.send(Event::LifespanStartupFailed {
                message: "missing model".into(),
            })
            .await?;
        }
        Ok(())
    });
    let mut cfg = config();
    cfg.lifespan.mode = LifespanMode::On;

    let err = pagi::Server::from_shared(cfg, app).start().await.err().unwrap();
    assert!(err.to_string().contains("missing model"));
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut cfg = config();
    cfg.server.listen = vec![taken.local_addr().unwrap().to_string()];

    assert!(pagi::Server::from_shared(cfg, hello()).start().await.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections_and_stops_accepting() {
    let server = start(hello()).await;
    let address = addr(&server);
    let mut client = Client::connect(address).await;
    assert_eq!(client.get("/").await.status, 200);

    server.shutdown().await.unwrap();
    assert!(client.closed().await);
    assert!(tokio::net::TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn test_shutdown_force_closes_after_grace() {
    let mut cfg = config();
    cfg.server.shutdown_grace_secs = 1;
    let app = from_fn(|_, _, _| async {
        std::future::pending::<()>().await;
        Ok(())
    });
    let server = start_with(cfg, app).await;
    let mut client = Client::connect(addr(&server)).await;
    client.send(b"GET /forever HTTP/1.1\r\n\r\n").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.open_connections(), 1);

    let started = tokio::time::Instant::now();
    server.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_listens_on_several_addresses() {
    let mut cfg = config();
    cfg.server.listen = vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()];
    let server = start_with(cfg, hello()).await;
    assert_eq!(server.local_addrs().len(), 2);

    for address in server.local_addrs() {
        let mut client = Client::connect(*address).await;
        assert_eq!(client.get("/").await.status, 200);
    }
}

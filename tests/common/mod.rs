//! Raw-socket client and server fixtures shared by the end-to-end tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pagi::config::{Config, LifespanMode};
use pagi::gateway::SharedApp;
use pagi::websocket::frame::{encode_client_frame, OpCode};
use pagi::{RunningServer, Server};

pub const WAIT: Duration = Duration::from_secs(5);
pub const WS_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const WS_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Ephemeral port, lifespan off, short timers.
pub fn config() -> Config {
    let mut cfg = Config::default();
    cfg.server.listen = vec!["127.0.0.1:0".to_string()];
    cfg.server.shutdown_grace_secs = 2;
    cfg.server.ws_close_timeout_secs = 2;
    cfg.lifespan.mode = LifespanMode::Off;
    cfg
}

pub async fn start(app: SharedApp) -> RunningServer {
    start_with(config(), app).await
}

pub async fn start_with(cfg: Config, app: SharedApp) -> RunningServer {
    Server::from_shared(cfg, app).start().await.unwrap()
}

pub fn addr(server: &RunningServer) -> SocketAddr {
    server.local_addr().unwrap()
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    /// Reads more bytes into the buffer; returns how many (0 on EOF).
    async fn fill(&mut self) -> usize {
        tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("timed out waiting for the server")
            .unwrap_or(0)
    }

    async fn fill_exact(&mut self, n: usize) {
        while self.buf.len() < n {
            assert!(self.fill().await > 0, "connection closed early");
        }
    }

    pub async fn read_head(&mut self) -> Reply {
        let end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            assert!(self.fill().await > 0, "connection closed before a response head");
        };
        let head = String::from_utf8(self.buf[..end].to_vec()).unwrap();
        self.buf.advance(end + 4);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers = lines
            .map(|line| {
                let (k, v) = line.split_once(':').unwrap();
                (k.trim().to_string(), v.trim().to_string())
            })
            .collect();
        Reply {
            status,
            headers,
            body: Vec::new(),
        }
    }

    /// One complete response, framed by content-length, chunked coding or
    /// connection close.
    pub async fn read_response(&mut self) -> Reply {
        let mut reply = self.read_head().await;
        if let Some(len) = reply.header("content-length") {
            let len: usize = len.parse().unwrap();
            self.fill_exact(len).await;
            reply.body = self.buf.split_to(len).to_vec();
        } else if reply.header("transfer-encoding") == Some("chunked") {
            reply.body = self.read_chunked().await;
        } else if reply.status >= 200 && reply.status != 204 && reply.status != 304 {
            reply.body = self.read_to_end().await;
        }
        reply
    }

    async fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line_end = loop {
                if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                    break pos;
                }
                assert!(self.fill().await > 0, "connection closed inside a chunked body");
            };
            let size_line = std::str::from_utf8(&self.buf[..line_end]).unwrap().to_string();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            self.buf.advance(line_end + 2);
            self.fill_exact(size + 2).await;
            body.extend_from_slice(&self.buf[..size]);
            self.buf.advance(size + 2);
            if size == 0 {
                return body;
            }
        }
    }

    /// Everything until the server closes the connection.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        while self.fill().await > 0 {}
        self.buf.split().to_vec()
    }

    /// Reads until `needle` has arrived; returns everything read so far.
    pub async fn read_until(&mut self, needle: &[u8]) -> Vec<u8> {
        loop {
            if let Some(pos) = self.buf.windows(needle.len()).position(|w| w == needle) {
                return self.buf.split_to(pos + needle.len()).to_vec();
            }
            let needle_text = String::from_utf8_lossy(needle);
            assert!(self.fill().await > 0, "connection closed before {:?}", needle_text);
        }
    }

    /// True if the server closes the connection within [`WAIT`].
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// True if nothing arrives within `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.stream.read_buf(&mut self.buf))
            .await
            .is_err()
    }

    pub async fn get(&mut self, path: &str) -> Reply {
        self.send(format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).as_bytes())
            .await;
        self.read_response().await
    }

    /// Sends an upgrade request and reads the handshake response head.
    pub async fn ws_upgrade(&mut self, path: &str, extra: &str) -> Reply {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n{}\r\n",
            path, WS_KEY, extra
        );
        self.send(request.as_bytes()).await;
        self.read_head().await
    }

    pub async fn send_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) {
        let mut out = BytesMut::new();
        encode_client_frame(fin, opcode, payload, [0x1f, 0x2e, 0x3d, 0x4c], &mut out);
        self.send(&out).await;
    }

    /// Reads one unmasked server frame: (fin, opcode, payload).
    pub async fn read_frame(&mut self) -> (bool, u8, Vec<u8>) {
        self.fill_exact(2).await;
        let fin = self.buf[0] & 0x80 != 0;
        let opcode = self.buf[0] & 0x0f;
        assert_eq!(self.buf[1] & 0x80, 0, "server frames are never masked");
        let (header, len) = match self.buf[1] & 0x7f {
            126 => {
                self.fill_exact(4).await;
                (4, u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize)
            }
            127 => {
                self.fill_exact(10).await;
                let mut len = [0u8; 8];
                len.copy_from_slice(&self.buf[2..10]);
                (10, u64::from_be_bytes(len) as usize)
            }
            n => (2, n as usize),
        };
        self.fill_exact(header + len).await;
        self.buf.advance(header);
        let payload = self.buf.split_to(len).to_vec();
        (fin, opcode, payload)
    }

    /// Reads a close frame and returns its code.
    pub async fn read_close(&mut self) -> u16 {
        let (_, opcode, payload) = self.read_frame().await;
        assert_eq!(opcode, 0x8, "expected a close frame, got opcode {}", opcode);
        u16::from_be_bytes([payload[0], payload[1]])
    }
}

/// Decodes a chunked body given as raw bytes.
pub fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = raw.windows(2).position(|w| w == b"\r\n").unwrap();
        let size_line = std::str::from_utf8(&raw[..line_end]).unwrap();
        let size = usize::from_str_radix(size_line, 16).unwrap();
        raw = &raw[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

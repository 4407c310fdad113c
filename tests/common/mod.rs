#![allow(dead_code)]

use fetchq::prelude::*;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const WAIT_LIMIT: Duration = Duration::from_secs(20);

/// Deterministic, non-repeating-looking payload.
pub fn sample_body(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Serves a fixed body, answering `Range: bytes=N-` with 206 when
/// `honor_ranges` is set and with the full body otherwise.
pub struct RangeBody {
    body: Arc<Vec<u8>>,
    honor_ranges: bool,
}

impl RangeBody {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body: Arc::new(body), honor_ranges: true }
    }

    pub fn ignoring_ranges(body: Vec<u8>) -> Self {
        Self { body: Arc::new(body), honor_ranges: false }
    }
}

impl Respond for RangeBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len();
        let start = range_start(request);
        match start {
            Some(start) if self.honor_ranges => {
                if start >= len {
                    return ResponseTemplate::new(416)
                        .insert_header("content-range", format!("bytes */{len}").as_str());
                }
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {}-{}/{}", start, len - 1, len).as_str(),
                    )
                    .set_body_bytes(self.body[start..].to_vec())
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        }
    }
}

pub fn range_start(request: &Request) -> Option<usize> {
    request
        .headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse().ok())
}

pub async fn serve(server: &MockServer, route: &str, responder: impl Respond + 'static) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

pub async fn serve_content_type(server: &MockServer, route: &str, content_type: &str) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", content_type))
        .mount(server)
        .await;
}

/// Serves `body` once over chunked transfer encoding, with no declared
/// length. The first `head` bytes go out right away; the rest waits until the
/// returned gate is notified. Returns the URL of `route` and the gate.
pub async fn serve_chunked(route: &str, body: Vec<u8>, head: usize) -> (String, Arc<Notify>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}{}", listener.local_addr().unwrap(), route);
    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: image/png\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        write_chunk(&mut socket, &body[..head]).await;
        release.notified().await;
        write_chunk(&mut socket, &body[head..]).await;
        socket.write_all(b"0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    });
    (url, gate)
}

async fn write_chunk(socket: &mut TcpStream, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    socket.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await.unwrap();
    socket.write_all(data).await.unwrap();
    socket.write_all(b"\r\n").await.unwrap();
}

pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default().with_download_dir(dir);
    config.pause_poll_interval = Duration::from_millis(20);
    config.connect_timeout = Duration::from_secs(5);
    config
}

pub fn registry_in(dir: &Path) -> Registry {
    Registry::new(test_config(dir)).expect("registry")
}

/// Polls the item until `done` holds for its status.
pub async fn wait_for<F>(registry: &Registry, id: ItemId, done: F) -> TransferSnapshot
where
    F: Fn(&TransferStatus) -> bool,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(snap) = registry.snapshot(id).await {
                if done(&snap.status) {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for item status")
}

pub async fn wait_terminal(registry: &Registry, id: ItemId) -> TransferSnapshot {
    wait_for(registry, id, TransferStatus::is_terminal).await
}

/// Polls until the item has been given a local name.
pub async fn wait_named(registry: &Registry, id: ItemId) -> TransferSnapshot {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(snap) = registry.snapshot(id).await {
                if snap.local_name.is_some() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for a local name")
}

/// Polls until the item has started streaming its body.
pub async fn wait_streaming(registry: &Registry, id: ItemId) -> TransferSnapshot {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(snap) = registry.snapshot(id).await {
                if snap.bytes_total.is_some() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the body to open")
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held")
}

pub async fn get_requests(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET")
        .collect()
}

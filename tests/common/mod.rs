//! Shared fixtures: a proxy on an ephemeral port and a scripted origin server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tinyproxy_rs::{Cache, Config, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache: Arc<Cache>,
    shutdown: CancellationToken,
}

impl TestProxy {
    pub async fn start(config: Config) -> Self {
        let server = ProxyServer::bind(Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            ..config
        })
        .await
        .expect("proxy binds");
        let addr = server.local_addr().unwrap();
        let cache = server.cache();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run_until(shutdown.clone()));
        Self {
            addr,
            cache,
            shutdown,
        }
    }

    /// Send raw request bytes and read until the proxy closes the connection.
    pub async fn send(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("proxy replied in time")
            .unwrap();
        out
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Origin that answers every connection with the same response and records
/// each request head it receives.
pub struct Origin {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Origin {
    pub async fn start(response: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let response = Arc::new(response);

        {
            let connections = Arc::clone(&connections);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let requests = Arc::clone(&requests);
                    let response = Arc::clone(&response);
                    tokio::spawn(async move {
                        let head = read_head(&mut stream).await;
                        requests.lock().push(head);
                        // Written in two pieces so the proxy sees a short read.
                        let split = response.len() / 2;
                        let _ = stream.write_all(&response[..split]).await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let _ = stream.write_all(&response[split..]).await;
                    });
                }
            });
        }

        Self {
            port,
            connections,
            requests,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    head
}

pub fn response_with_body(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.0 200 OK\r\nServer: origin\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Split a raw response into head (with the blank line) and body.
pub fn split_response(raw: &[u8]) -> (&[u8], &[u8]) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a head");
    raw.split_at(pos + 4)
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/*!
One client connection, one request, one response.

A session walks `ReadRequest -> Route -> (CacheLookup | Connect) -> Forward ->
ReadResponse -> Reply -> MaybeCache -> Done`. Any state may divert to `Error`,
which sends a synthesized HTML reply, or to `Abort`, which closes silently
because the client leg itself is unusable. The client connection is closed in
every case.
*/

use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cache::CacheKey;
use crate::connection::Connection;
use crate::proxy::context::Context;
use crate::proxy::http::{self, RequestHead, ResponseHead, Target};
use crate::Error;

/// Largest slice forwarded per write when relaying an uncacheable body.
const RELAY_CHUNK: u64 = 16 * 1024;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CacheHit,
    Fetched,
    Relayed,
    ErrorReply(u16),
    Aborted,
}

/// Coarse state names, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ReadRequest,
    Route,
    CacheLookup,
    Connect,
    Forward,
    ReadResponse,
    Reply,
    Relay,
    MaybeCache,
    Error,
    Abort,
    Done,
}

/// A synthesized error page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: u16,
    pub short: &'static str,
    pub long: &'static str,
    pub cause: String,
}

impl ErrorReply {
    pub fn not_found(long: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            code: 404,
            short: "Not found",
            long,
            cause: cause.to_string(),
        }
    }

    pub fn bad_gateway(long: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            code: 502,
            short: "Bad gateway",
            long,
            cause: cause.to_string(),
        }
    }

    pub fn bad_request(long: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            code: 400,
            short: "Bad request",
            long,
            cause: cause.to_string(),
        }
    }

    pub fn render(&self) -> Bytes {
        http::format_error(self.code, self.short, self.long, &self.cause)
    }
}

struct Store {
    key: CacheKey,
    content_type: Option<String>,
}

enum Step {
    ReadRequest,
    Route(RequestHead),
    CacheLookup {
        request: RequestHead,
        target: Target,
    },
    Connect {
        request: RequestHead,
        target: Target,
    },
    Forward {
        request: RequestHead,
        target: Target,
        upstream: Connection<TcpStream>,
    },
    ReadResponse {
        request: RequestHead,
        target: Target,
        upstream: Connection<TcpStream>,
    },
    Reply {
        head: Bytes,
        body: Bytes,
        store: Option<Store>,
        outcome: Outcome,
    },
    Relay {
        head: Bytes,
        upstream: Connection<TcpStream>,
        remaining: u64,
    },
    MaybeCache {
        store: Store,
        body: Bytes,
    },
    Error(ErrorReply),
    Abort(Error),
    Done(Outcome),
}

impl Step {
    fn state(&self) -> SessionState {
        match self {
            Step::ReadRequest => SessionState::ReadRequest,
            Step::Route(_) => SessionState::Route,
            Step::CacheLookup { .. } => SessionState::CacheLookup,
            Step::Connect { .. } => SessionState::Connect,
            Step::Forward { .. } => SessionState::Forward,
            Step::ReadResponse { .. } => SessionState::ReadResponse,
            Step::Reply { .. } => SessionState::Reply,
            Step::Relay { .. } => SessionState::Relay,
            Step::MaybeCache { .. } => SessionState::MaybeCache,
            Step::Error(_) => SessionState::Error,
            Step::Abort(_) => SessionState::Abort,
            Step::Done(_) => SessionState::Done,
        }
    }
}

pub struct Session<S> {
    client: Connection<S>,
    context: Context,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, context: Context) -> Self {
        Self {
            client: Connection::new(stream),
            context,
        }
    }

    /// Drive the session to completion and close the client leg.
    pub async fn run(mut self) -> Outcome {
        let mut step = Step::ReadRequest;
        loop {
            debug!(state = ?step.state(), "Session step");
            step = match step {
                Step::ReadRequest => self.read_request().await,
                Step::Route(request) => self.route(request),
                Step::CacheLookup { request, target } => self.lookup(request, target),
                Step::Connect { request, target } => self.connect(request, target).await,
                Step::Forward {
                    request,
                    target,
                    upstream,
                } => self.forward(request, target, upstream).await,
                Step::ReadResponse {
                    request,
                    target,
                    upstream,
                } => self.read_response(request, target, upstream).await,
                Step::Reply {
                    head,
                    body,
                    store,
                    outcome,
                } => self.reply(head, body, store, outcome).await,
                Step::Relay {
                    head,
                    upstream,
                    remaining,
                } => self.relay(head, upstream, remaining).await,
                Step::MaybeCache { store, body } => self.maybe_cache(store, body),
                Step::Error(reply) => self.send_error(reply).await,
                Step::Abort(err) => {
                    debug!("Session aborted: {}", err);
                    Step::Done(Outcome::Aborted)
                }
                Step::Done(outcome) => {
                    if let Err(e) = self.client.shutdown().await {
                        debug!("Client shutdown failed: {}", e);
                    }
                    return outcome;
                }
            };
        }
    }

    async fn read_request(&mut self) -> Step {
        let lines = match http::read_request_head(&mut self.client).await {
            Ok(lines) => lines,
            Err(e) => return Step::Abort(e),
        };
        match RequestHead::parse(&lines) {
            Ok(request) => {
                info!(method = %request.line.method, target = %request.line.target, "Request");
                Step::Route(request)
            }
            Err(e) => Step::Abort(e),
        }
    }

    fn route(&self, request: RequestHead) -> Step {
        if let Err(e) = request.body_length() {
            return Step::Error(ErrorReply::bad_request("Proxy couldn't frame the request body", e));
        }
        match request.target() {
            Some(target) => Step::CacheLookup { request, target },
            None => Step::Error(ErrorReply::not_found(
                "Proxy couldn't resolve the request target",
                &request.line.target,
            )),
        }
    }

    fn lookup(&self, request: RequestHead, target: Target) -> Step {
        if !request.is_get() {
            return Step::Connect { request, target };
        }
        let key = target.cache_key();
        match self.context.cache.lookup(&key) {
            Some(hit) => {
                debug!(key = %key, size = hit.body.len(), "Cache hit");
                Step::Reply {
                    head: http::cached_response_head(hit.content_type.as_deref(), hit.body.len()),
                    body: hit.body,
                    store: None,
                    outcome: Outcome::CacheHit,
                }
            }
            None => {
                debug!(key = %key, "Cache miss");
                Step::Connect { request, target }
            }
        }
    }

    async fn connect(&self, request: RequestHead, target: Target) -> Step {
        let authority = format!("{}:{}", target.host, target.port);
        let Some((host, port)) = target.socket_addr() else {
            return Step::Error(ErrorReply::not_found("Proxy couldn't connect to", authority));
        };
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                debug!(upstream = %authority, "Connected upstream");
                Step::Forward {
                    request,
                    target,
                    upstream: Connection::new(stream),
                }
            }
            Err(e) => {
                warn!("{}", Error::unreachable(&authority, e));
                Step::Error(ErrorReply::not_found("Proxy couldn't connect to", authority))
            }
        }
    }

    async fn forward(
        &mut self,
        request: RequestHead,
        target: Target,
        mut upstream: Connection<TcpStream>,
    ) -> Step {
        let outgoing = request.to_upstream(&target, &self.context.options.user_agent);
        if let Err(e) = upstream.write_all(&outgoing).await {
            warn!(upstream = %target, "Forwarding request failed: {}", e);
            return Step::Error(ErrorReply::bad_gateway(
                "Proxy couldn't send the request to",
                target,
            ));
        }

        // Validated in `route`.
        let mut remaining = request.body_length().unwrap_or(0);
        while remaining > 0 {
            let chunk = match self.client.read_some(remaining.min(RELAY_CHUNK) as usize).await {
                Ok(chunk) => chunk,
                Err(e) => return Step::Abort(e),
            };
            if let Err(e) = upstream.write_all(&chunk).await {
                warn!(upstream = %target, "Forwarding request body failed: {}", e);
                return Step::Error(ErrorReply::bad_gateway(
                    "Proxy couldn't send the request to",
                    target,
                ));
            }
            remaining -= chunk.len() as u64;
        }

        Step::ReadResponse {
            request,
            target,
            upstream,
        }
    }

    async fn read_response(
        &self,
        request: RequestHead,
        target: Target,
        mut upstream: Connection<TcpStream>,
    ) -> Step {
        let head = match http::read_response_head(&mut upstream).await {
            Ok(lines) => ResponseHead::parse(&lines),
            Err(e) => Err(e),
        };
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                warn!(upstream = %target, "Bad upstream response: {}", e);
                return Step::Error(ErrorReply::bad_gateway(
                    "Proxy got an unusable response from",
                    target,
                ));
            }
        };
        info!(status = head.status, length = head.content_length, "Response");

        let body_len = if request.is_head() { 0 } else { head.content_length };
        if body_len > self.context.options.max_object_size as u64 {
            return Step::Relay {
                head: head.raw,
                upstream,
                remaining: body_len,
            };
        }

        // Bounded by max_object_size above.
        let body = match upstream.read_exact(body_len as usize).await {
            Ok(body) => body,
            Err(e) => {
                warn!(upstream = %target, "Reading response body failed: {}", e);
                return Step::Error(ErrorReply::bad_gateway(
                    "Proxy got a truncated response from",
                    target,
                ));
            }
        };

        let store = (request.is_get() && head.status == 200).then(|| Store {
            key: target.cache_key(),
            content_type: head.content_type().map(str::to_string),
        });
        Step::Reply {
            head: head.raw,
            body,
            store,
            outcome: Outcome::Fetched,
        }
    }

    async fn reply(
        &mut self,
        head: Bytes,
        body: Bytes,
        store: Option<Store>,
        outcome: Outcome,
    ) -> Step {
        if let Err(e) = self.client.write_all(&head).await {
            return Step::Abort(e);
        }
        if let Err(e) = self.client.write_all(&body).await {
            return Step::Abort(e);
        }
        match store {
            Some(store) => Step::MaybeCache { store, body },
            None => Step::Done(outcome),
        }
    }

    async fn relay(
        &mut self,
        head: Bytes,
        mut upstream: Connection<TcpStream>,
        mut remaining: u64,
    ) -> Step {
        if let Err(e) = self.client.write_all(&head).await {
            return Step::Abort(e);
        }
        while remaining > 0 {
            // Headers are already out, so a failure here can only close the connection.
            let chunk = match upstream.read_some(remaining.min(RELAY_CHUNK) as usize).await {
                Ok(chunk) => chunk,
                Err(e) => return Step::Abort(e),
            };
            if let Err(e) = self.client.write_all(&chunk).await {
                return Step::Abort(e);
            }
            remaining -= chunk.len() as u64;
        }
        Step::Done(Outcome::Relayed)
    }

    fn maybe_cache(&self, store: Store, body: Bytes) -> Step {
        let outcome = self
            .context
            .cache
            .insert(store.key.clone(), body, store.content_type);
        debug!(key = %store.key, ?outcome, "Cache insert");
        Step::Done(Outcome::Fetched)
    }

    async fn send_error(&mut self, reply: ErrorReply) -> Step {
        info!(code = reply.code, cause = %reply.cause, "Sending error reply");
        if let Err(e) = self.client.write_all(&reply.render()).await {
            debug!("Client went away before the error reply: {}", e);
        }
        Step::Done(Outcome::ErrorReply(reply.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context(max_object_size: usize) -> Context {
        let config = Config {
            max_object_size,
            max_cache_size: 10 * max_object_size,
            ..Config::default()
        };
        Context::new(&config)
    }

    /// Send `request` through a session and collect everything written back.
    async fn exchange(context: Context, request: &[u8]) -> (Outcome, Vec<u8>) {
        let (mut client, proxy_side) = duplex(1 << 20);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let outcome = Session::new(proxy_side, context).run().await;
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        (outcome, out)
    }

    /// Origin that answers one connection with `response` and returns what it received.
    async fn one_shot_origin(response: Vec<u8>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let mut seen = Vec::new();
            for line in http::read_request_head(&mut conn).await.unwrap() {
                seen.extend_from_slice(&line);
            }
            conn.write_all(&response).await.unwrap();
            seen
        });
        (port, handle)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_fetch_forwards_and_caches() {
        let (port, origin) = one_shot_origin(
            b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
        )
        .await;
        let ctx = context(1024);
        let request = format!("GET http://127.0.0.1:{}/greet HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", port);

        let (outcome, out) = exchange(ctx.clone(), request.as_bytes()).await;
        assert_eq!(outcome, Outcome::Fetched);
        assert_eq!(
            out,
            b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"
        );

        let seen = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(seen.starts_with("GET /greet HTTP/1.0\r\nUser-Agent: "));
        assert!(seen.contains(&format!("Host: 127.0.0.1:{}\r\n", port)));
        assert!(!seen.contains("keep-alive"));
        assert!(seen.ends_with("Connection: close\r\nProxy-Connection: close\r\n\r\n"));

        let key = CacheKey::new("127.0.0.1", &port.to_string(), "/greet");
        assert_eq!(&ctx.cache.lookup(&key).unwrap().body[..], b"hello");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let port = closed_port().await;
        let ctx = context(1024);
        let key = CacheKey::new("127.0.0.1", &port.to_string(), "/cached");
        ctx.cache
            .insert(key, Bytes::from_static(b"from cache"), Some("text/html".into()));

        let request = format!("GET /cached HTTP/1.0\r\nHost: 127.0.0.1:{}\r\n\r\n", port);
        let (outcome, out) = exchange(ctx, request.as_bytes()).await;

        assert_eq!(outcome, Outcome::CacheHit);
        assert_eq!(
            out,
            b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: 10\r\n\r\nfrom cache"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_yields_404_page() {
        let port = closed_port().await;
        let request = format!("GET http://127.0.0.1:{}/ HTTP/1.0\r\n\r\n", port);
        let (outcome, out) = exchange(context(1024), request.as_bytes()).await;

        assert_eq!(outcome, Outcome::ErrorReply(404));
        let text = String::from_utf8(out).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.0 404 Not found\r\n"));
        assert!(head.contains(&format!("Content-length: {}", body.len())));
        assert!(body.contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_unroutable_request_yields_404_page() {
        let (outcome, out) = exchange(context(1024), b"GET /nohost HTTP/1.0\r\n\r\n").await;
        assert_eq!(outcome, Outcome::ErrorReply(404));
        assert!(out.starts_with(b"HTTP/1.0 404 Not found\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_request_closes_silently() {
        let (outcome, out) = exchange(context(1024), b"NONSENSE\r\n\r\n").await;
        assert_eq!(outcome, Outcome::Aborted);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_client_gone_before_request_aborts() {
        let (outcome, out) = exchange(context(1024), b"GET / HTTP/1.0\r\nHost: a").await;
        assert_eq!(outcome, Outcome::Aborted);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_length_yields_502() {
        let (port, origin) = one_shot_origin(b"HTTP/1.0 200 OK\r\n\r\nbody".to_vec()).await;
        let request = format!("GET http://127.0.0.1:{}/x HTTP/1.0\r\n\r\n", port);

        let (outcome, out) = exchange(context(1024), request.as_bytes()).await;
        origin.await.unwrap();
        assert_eq!(outcome, Outcome::ErrorReply(502));
        assert!(out.starts_with(b"HTTP/1.0 502 Bad gateway\r\n"));
    }

    #[tokio::test]
    async fn test_large_body_is_relayed_not_cached() {
        let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut response = format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        let (port, origin) = one_shot_origin(response.clone()).await;
        let ctx = Context::with_cache(
            &Config {
                max_object_size: 1000,
                ..Config::default()
            },
            Arc::new(Cache::new(10_000, 1000)),
        );

        let request = format!("GET http://127.0.0.1:{}/big HTTP/1.0\r\n\r\n", port);
        let (outcome, out) = exchange(ctx.clone(), request.as_bytes()).await;
        origin.await.unwrap();

        assert_eq!(outcome, Outcome::Relayed);
        assert_eq!(out, response);
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_head_request_reads_no_body_and_skips_cache() {
        let (port, origin) =
            one_shot_origin(b"HTTP/1.0 200 OK\r\nContent-Length: 1234\r\n\r\n".to_vec()).await;
        let ctx = context(1024);
        let request = format!("HEAD http://127.0.0.1:{}/h HTTP/1.0\r\n\r\n", port);

        let (outcome, out) = exchange(ctx.clone(), request.as_bytes()).await;
        origin.await.unwrap();

        assert_eq!(outcome, Outcome::Fetched);
        assert_eq!(out, b"HTTP/1.0 200 OK\r\nContent-Length: 1234\r\n\r\n");
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_non_200_is_not_cached() {
        let (port, origin) =
            one_shot_origin(b"HTTP/1.0 404 Not Found\r\nContent-Length: 3\r\n\r\nnah".to_vec()).await;
        let ctx = context(1024);
        let request = format!("GET http://127.0.0.1:{}/missing HTTP/1.0\r\n\r\n", port);

        let (_, out) = exchange(ctx.clone(), request.as_bytes()).await;
        origin.await.unwrap();

        assert!(out.ends_with(b"nah"));
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_post_body_is_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let head = http::read_request_head(&mut conn).await.unwrap();
            let body = conn.read_exact(5).await.unwrap();
            conn.write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            (head.concat(), body)
        });

        let ctx = context(1024);
        let request = format!(
            "POST http://127.0.0.1:{}/submit HTTP/1.0\r\nContent-Length: 5\r\n\r\nhello",
            port
        );
        let (outcome, out) = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            exchange(ctx.clone(), request.as_bytes()),
        )
        .await
        .expect("session finished");
        let (head, body) = origin.await.unwrap();

        assert_eq!(outcome, Outcome::Fetched);
        assert!(out.ends_with(b"\r\n\r\nok"));
        assert!(String::from_utf8_lossy(&head).contains("Content-Length: 5\r\n"));
        assert_eq!(&body[..], b"hello");
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_chunked_request_body_is_rejected() {
        let request = b"POST http://127.0.0.1:9/x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        let (outcome, out) = exchange(context(1024), request).await;
        assert_eq!(outcome, Outcome::ErrorReply(400));
        assert!(out.starts_with(b"HTTP/1.0 400 Bad request\r\n"));
    }

    #[test]
    fn test_error_reply_render() {
        let reply = ErrorReply::bad_gateway("Proxy got an unusable response from", "a:80/");
        let text = String::from_utf8(reply.render().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.0 502 Bad gateway\r\n"));
        assert!(text.contains("a:80/"));
    }
}

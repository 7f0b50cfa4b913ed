//! Acceptor loop: accepts client connections and hands them to the worker pool
//! through a bounded queue, so a saturated pool stops further accepts.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::Config;
use crate::proxy::context::Context;
use crate::proxy::session::Session;
use crate::queue::BoundedQueue;
use crate::worker::{Handler, WorkerPool};
use crate::Result;

/// An accepted client connection waiting for a worker.
#[derive(Debug)]
pub struct ClientConn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Runs one session per dequeued connection.
#[derive(Debug, Clone)]
pub struct SessionHandler {
    context: Context,
}

impl SessionHandler {
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Handler<ClientConn> for SessionHandler {
    async fn handle(&self, conn: ClientConn) {
        let span = info_span!("session", id = %Uuid::new_v4(), peer = %conn.peer);
        let outcome = Session::new(conn.stream, self.context.clone())
            .run()
            .instrument(span.clone())
            .await;
        span.in_scope(|| debug!(?outcome, "Session finished"));
    }
}

/// Main proxy server that accepts incoming connections.
#[derive(Debug)]
pub struct ProxyServer {
    config: Arc<Config>,
    listener: TcpListener,
    context: Context,
}

impl ProxyServer {
    /// Validate the configuration and bind the listening socket. Workers are
    /// spawned later, by `run`.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.proxy_addr()).await?;
        info!(
            address = %listener.local_addr()?,
            workers = config.workers,
            queue_depth = config.queue_depth,
            max_cache_size = config.max_cache_size,
            max_object_size = config.max_object_size,
            "Proxy listening"
        );

        let context = Context::new(&config);
        Ok(Self {
            config: Arc::new(config),
            listener,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.context.cache)
    }

    /// Serve until the process is terminated.
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Serve until `shutdown` is cancelled, then close the queue and wait for
    /// the workers to finish what was already accepted.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let queue = Arc::new(BoundedQueue::new(self.config.queue_depth));
        let handler = Arc::new(SessionHandler::new(self.context.clone()));
        let pool = WorkerPool::spawn(self.config.workers, Arc::clone(&queue), handler);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, queued = queue.len(), "Accepted connection");
                    let conn = ClientConn { stream, peer };
                    // Waits while the queue is full; that is the backpressure.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        queued = queue.enqueue(conn) => {
                            if queued.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        info!("Proxy server stopping");
        queue.close();
        pool.join().await;
        Ok(())
    }
}

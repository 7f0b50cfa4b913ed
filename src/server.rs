use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::proxy::ProxyServer;
use crate::{Error, Result};

/// How long in-flight sessions get to finish after Ctrl-C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-level wrapper: runs the proxy until Ctrl-C.
pub struct TinyProxyServer {
    proxy: ProxyServer,
}

impl TinyProxyServer {
    pub async fn new(config: Config) -> Result<Self> {
        let proxy = ProxyServer::bind(config).await?;
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &ProxyServer {
        &self.proxy
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting tinyproxy-rs server");
        info!("Proxy listening on: {}", self.proxy.local_addr()?);

        let shutdown = CancellationToken::new();
        let mut proxy_handle = tokio::spawn(self.proxy.run_until(shutdown.clone()));

        tokio::select! {
            result = &mut proxy_handle => {
                info!("Proxy server shut down");
                return result.map_err(|e| Error::internal(format!("proxy task failed: {}", e)))?;
            }
            signal = signal::ctrl_c() => match signal {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return proxy_handle
                        .await
                        .map_err(|e| Error::internal(format!("proxy task failed: {}", e)))?;
                }
            },
        }

        shutdown.cancel();
        match tokio::time::timeout(DRAIN_TIMEOUT, proxy_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::internal(format!("proxy task failed: {}", e))),
            Err(_) => {
                warn!("Sessions still running after {:?}; exiting anyway", DRAIN_TIMEOUT);
                Ok(())
            }
        }
    }
}

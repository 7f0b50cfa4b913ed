use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Total cache capacity in bytes.
pub const MAX_CACHE_SIZE: usize = 1_049_000;
/// Largest body the cache will hold.
pub const MAX_OBJECT_SIZE: usize = 102_400;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:10.0.3) Gecko/20120305 Firefox/10.0.3";

/// Startup configuration. Nothing here is reconfigurable once the proxy runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_cache_size: usize,
    pub max_object_size: usize,
    pub workers: usize,
    pub queue_depth: usize,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            max_cache_size: MAX_CACHE_SIZE,
            max_object_size: MAX_OBJECT_SIZE,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Load from a file (format inferred from its extension), with `TINYPROXY_*`
    /// environment variables layered on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("TINYPROXY").try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(Error::invalid_config("queue_depth must be at least 1"));
        }
        if self.max_cache_size == 0 {
            return Err(Error::invalid_config("max_cache_size must be non-zero"));
        }
        if self.max_object_size > self.max_cache_size {
            return Err(Error::invalid_config(format!(
                "max_object_size ({}) exceeds max_cache_size ({})",
                self.max_object_size, self.max_cache_size
            )));
        }
        Ok(())
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

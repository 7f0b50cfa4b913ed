//! State shared by every session: the object cache and the startup options
//! sessions consult.

use crate::cache::Cache;
use crate::config::Config;
use std::sync::Arc;

/// Handed to each session. Cloning is cheap; the cache is shared, never copied.
#[derive(Debug, Clone)]
pub struct Context {
    pub cache: Arc<Cache>,
    pub options: ContextOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Sent as `User-Agent` on every upstream request.
    pub user_agent: String,
    /// Bodies up to this size are buffered and offered to the cache; larger ones are relayed.
    pub max_object_size: usize,
}

impl From<&Config> for ContextOptions {
    fn from(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_object_size: config.max_object_size,
        }
    }
}

impl Context {
    pub fn new(config: &Config) -> Self {
        let cache = Arc::new(Cache::new(config.max_cache_size, config.max_object_size));
        Self::with_cache(config, cache)
    }

    pub fn with_cache(config: &Config, cache: Arc<Cache>) -> Self {
        Self {
            cache,
            options: ContextOptions::from(config),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

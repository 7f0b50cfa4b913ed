pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod server;
pub mod worker;

pub use cache::{Cache, CacheKey};
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::ProxyServer;
pub use server::TinyProxyServer;

//! The forwarding proxy: HTTP head handling, the per-connection session state
//! machine, and the acceptor that feeds sessions to the worker pool.

pub mod context;
pub mod http;
pub mod server;
pub mod session;

pub use context::*;
pub use server::*;
pub use session::{Outcome, Session};

//! Rackgate - a local-development reverse proxy for socket-speaking workers
//!
//! This library provides a reverse proxy core that:
//! - Multiplexes HTTP requests across a pool of long-lived worker processes
//! - Speaks a netstring-framed request/response protocol over UNIX sockets
//! - Supervises each worker through a FIFO readiness handshake
//! - Prefers ready workers and falls back to round-robin scheduling
//! - Reaps idle workers after a configurable timeout
//! - Supports graceful (SIGQUIT) and forcible (SIGTERM) shutdown and restart
//! - Aggregates worker stdout/stderr into tagged log streams

pub mod client;
pub mod config;
pub mod error;
pub mod logs;
pub mod netstring;
pub mod pool;
pub mod worker;

/// Crate name reported in startup logs.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Crate version reported in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Streamer - asynchronous file streaming core
//!
//! Callers queue requests (reads, queries, cache control) from any thread.
//! A single scheduler thread pumps them through a stack of nodes that
//! resolve archives, serve cached bytes, decompress blocks and dispatch
//! reads to a storage backend. Results come back through request handles
//! and completion callbacks.
//!
//! # High-Level API
//!
//! The [`Streamer`] facade wires the standard stack over local files:
//!
//! ```ignore
//! use streamer::{Streamer, StreamerConfig, SubmitOptions};
//! use streamer::backend::ArchiveIndex;
//! use std::sync::Arc;
//!
//! let streamer = Streamer::open_local(&StreamerConfig::default(), "/data", Arc::new(ArchiveIndex::new()))?;
//! let handle = streamer.read_whole_file("maps/level1.bin", SubmitOptions::default())?;
//! let status = handle.wait().await;
//! ```
//!
//! Custom stacks are assembled with [`StreamStack`] and started with
//! [`Streamer::start`]; tests drive a [`Scheduler`] tick by tick instead.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod report;
pub mod request;
pub mod scheduler;
pub mod stack;
pub mod streamer;
pub mod telemetry;

pub use config::StreamerConfig;
pub use error::{PoolError, RequestError, StreamerError};
pub use report::{Statistic, StatisticValue, StreamerReport};
pub use request::{
    Deadline, FileRange, PendingRequest, Priority, ReportKind, RequestHandle, RequestOutput,
    RequestPath, RequestStatus,
};
pub use scheduler::Scheduler;
pub use stack::{NodeOutcome, StreamStack, StreamStackNode};
pub use streamer::{Streamer, SubmitOptions};

/// Version of the streamer library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

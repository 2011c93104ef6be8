//! Streamer configuration.
//!
//! Settings are grouped per INI section and loaded with the `ini` crate:
//!
//! ```ini
//! [scheduler]
//! idle_wait_ms = 5
//! [cache]
//! budget = 64MB
//! block_size = 64KB
//! [device]
//! max_concurrent_reads = 0
//! ```
//!
//! ```
//! use streamer::config::StreamerConfig;
//!
//! let config = StreamerConfig::from_ini_str("[cache]\nbudget = 8MB\n").unwrap();
//! assert_eq!(config.cache.budget, 8 * 1024 * 1024);
//! ```

mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use file::ConfigFileError;
pub use settings::*;
pub use size::{format_size, parse_size, SizeParseError};

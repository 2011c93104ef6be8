//! Settings structs for each configuration section, with their defaults.
//!
//! Each struct represents one `[section]` of the INI file. These are pure
//! data types; parsing lives in [`super::parser`] and serialization in
//! [`super::writer`].

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// How long the scheduler sleeps on its condition variable when idle.
pub const DEFAULT_IDLE_WAIT_MS: u64 = 5;

/// Maximum requests dispatched per tick; 0 means limited only by stack slots.
pub const DEFAULT_MAX_DISPATCH_PER_TICK: usize = 0;

/// Byte budget for ordinary (unpinned) cache entries.
pub const DEFAULT_CACHE_BUDGET: u64 = 64 * 1024 * 1024;

/// Block granularity of cached data.
pub const DEFAULT_CACHE_BLOCK_SIZE: u64 = 64 * 1024;

/// Concurrent backend reads; 0 means use the backend's own concurrency.
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 0;

/// Extra device slots reported beyond the concurrency window.
pub const DEFAULT_OVER_COMMIT: usize = 2;

/// File sizes remembered by the device node.
pub const DEFAULT_METADATA_CACHE_ENTRIES: usize = 256;

pub const DEFAULT_LOG_DIRECTORY: &str = "logs";
pub const DEFAULT_LOG_FILE: &str = "streamer.log";

// =============================================================================
// Sections
// =============================================================================

/// Complete streamer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamerConfig {
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
    pub device: DeviceSettings,
    pub logging: LoggingSettings,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub idle_wait_ms: u64,
    pub max_dispatch_per_tick: usize,
}

impl SchedulerSettings {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            idle_wait_ms: DEFAULT_IDLE_WAIT_MS,
            max_dispatch_per_tick: DEFAULT_MAX_DISPATCH_PER_TICK,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Byte budget for unpinned entries. Pinned entries don't count.
    pub budget: u64,
    pub block_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: DEFAULT_CACHE_BUDGET,
            block_size: DEFAULT_CACHE_BLOCK_SIZE,
        }
    }
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub max_concurrent_reads: usize,
    pub over_commit: usize,
    pub metadata_cache_entries: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            over_commit: DEFAULT_OVER_COMMIT,
            metadata_cache_entries: DEFAULT_METADATA_CACHE_ENTRIES,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub directory: PathBuf,
    pub file: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
            file: DEFAULT_LOG_FILE.to_string(),
        }
    }
}

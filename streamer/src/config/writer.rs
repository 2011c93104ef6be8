//! INI serialization: `StreamerConfig` → commented INI string.

use super::settings::StreamerConfig;
use super::size::format_size;

/// Converts a config to the commented INI text written by `save_to`.
pub(super) fn to_config_string(config: &StreamerConfig) -> String {
    format!(
        r#"[scheduler]
; Milliseconds the scheduler sleeps when there is no work
idle_wait_ms = {}
; Requests dispatched per tick (0 = limited only by stack slots)
max_dispatch_per_tick = {}

[cache]
enabled = {}
; Byte budget for ordinary (unpinned) cache entries
budget = {}
; Block granularity of cached data
block_size = {}

[device]
; Concurrent backend reads (0 = backend default)
max_concurrent_reads = {}
; Extra slots reported beyond the concurrency window
over_commit = {}
metadata_cache_entries = {}

[logging]
directory = {}
file = {}
"#,
        config.scheduler.idle_wait_ms,
        config.scheduler.max_dispatch_per_tick,
        config.cache.enabled,
        format_size(config.cache.budget),
        format_size(config.cache.block_size),
        config.device.max_concurrent_reads,
        config.device.over_commit,
        config.device.metadata_cache_entries,
        config.logging.directory.display(),
        config.logging.file,
    )
}

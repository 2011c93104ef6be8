//! INI parsing: `Ini` → `StreamerConfig`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use ini::{Ini, Properties};
use std::path::PathBuf;
use std::str::FromStr;

use super::file::ConfigFileError;
use super::settings::StreamerConfig;
use super::size::parse_size;

/// Parses an `Ini` into a `StreamerConfig`, overlaying found values on the
/// defaults.
pub(super) fn parse_ini(ini: &Ini) -> Result<StreamerConfig, ConfigFileError> {
    let mut config = StreamerConfig::default();

    if let Some(section) = ini.section(Some("scheduler")) {
        if let Some(v) = parse_number(section, "scheduler", "idle_wait_ms")? {
            config.scheduler.idle_wait_ms = v;
        }
        if let Some(v) = parse_number(section, "scheduler", "max_dispatch_per_tick")? {
            config.scheduler.max_dispatch_per_tick = v;
        }
    }

    if let Some(section) = ini.section(Some("cache")) {
        if let Some(v) = section.get("enabled") {
            config.cache.enabled = parse_bool(v).ok_or_else(|| ConfigFileError::InvalidValue {
                section: "cache".to_string(),
                key: "enabled".to_string(),
                value: v.to_string(),
                reason: "expected true or false".to_string(),
            })?;
        }
        if let Some(v) = parse_byte_size(section, "cache", "budget")? {
            config.cache.budget = v;
        }
        if let Some(v) = parse_byte_size(section, "cache", "block_size")? {
            if v == 0 {
                return Err(ConfigFileError::InvalidValue {
                    section: "cache".to_string(),
                    key: "block_size".to_string(),
                    value: "0".to_string(),
                    reason: "block size must be greater than zero".to_string(),
                });
            }
            config.cache.block_size = v;
        }
    }

    if let Some(section) = ini.section(Some("device")) {
        if let Some(v) = parse_number(section, "device", "max_concurrent_reads")? {
            config.device.max_concurrent_reads = v;
        }
        if let Some(v) = parse_number(section, "device", "over_commit")? {
            config.device.over_commit = v;
        }
        if let Some(v) = parse_number(section, "device", "metadata_cache_entries")? {
            config.device.metadata_cache_entries = v;
        }
    }

    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.directory = PathBuf::from(v);
            }
        }
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.file = v.to_string();
            }
        }
    }

    Ok(config)
}

fn parse_number<T: FromStr>(
    section: &Properties,
    name: &str,
    key: &str,
) -> Result<Option<T>, ConfigFileError> {
    let Some(v) = section.get(key) else {
        return Ok(None);
    };
    v.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigFileError::InvalidValue {
            section: name.to_string(),
            key: key.to_string(),
            value: v.to_string(),
            reason: "expected a non-negative integer".to_string(),
        })
}

fn parse_byte_size(
    section: &Properties,
    name: &str,
    key: &str,
) -> Result<Option<u64>, ConfigFileError> {
    let Some(v) = section.get(key) else {
        return Ok(None);
    };
    parse_size(v)
        .map(Some)
        .map_err(|_| ConfigFileError::InvalidValue {
            section: name.to_string(),
            key: key.to_string(),
            value: v.to_string(),
            reason: "expected format like '64MB', '64KB', or '4096'".to_string(),
        })
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::{DEFAULT_CACHE_BLOCK_SIZE, DEFAULT_OVER_COMMIT};

    fn parse(text: &str) -> Result<StreamerConfig, ConfigFileError> {
        let ini = Ini::load_from_str(text).unwrap();
        parse_ini(&ini)
    }

    #[test]
    fn test_empty_ini_gives_defaults() {
        assert_eq!(parse("").unwrap(), StreamerConfig::default());
    }

    #[test]
    fn test_overlays_values() {
        let config = parse(
            "[scheduler]\nidle_wait_ms = 20\n\
             [cache]\nenabled = false\nbudget = 8MB\n\
             [device]\nmax_concurrent_reads = 4\n\
             [logging]\nfile = io.log\n",
        )
        .unwrap();

        assert_eq!(config.scheduler.idle_wait_ms, 20);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.budget, 8 * 1024 * 1024);
        assert_eq!(config.cache.block_size, DEFAULT_CACHE_BLOCK_SIZE);
        assert_eq!(config.device.max_concurrent_reads, 4);
        assert_eq!(config.device.over_commit, DEFAULT_OVER_COMMIT);
        assert_eq!(config.logging.file, "io.log");
    }

    #[test]
    fn test_invalid_size_reports_key() {
        let err = parse("[cache]\nbudget = lots\n").unwrap_err();
        match err {
            ConfigFileError::InvalidValue { section, key, .. } => {
                assert_eq!(section, "cache");
                assert_eq!(key, "budget");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(parse("[cache]\nblock_size = 0\n").is_err());
    }

    #[test]
    fn test_invalid_number_rejected() {
        assert!(parse("[device]\nover_commit = -1\n").is_err());
    }
}

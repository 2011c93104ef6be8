//! Human-readable byte sizes for configuration values ("64MB", "4KB").

use thiserror::Error;

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '64MB', '64KB', or '4096'")]
pub struct SizeParseError {
    input: String,
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Suffixes checked longest first so "MB" wins over "B".
const SUFFIXES: [(&str, u64); 7] = [
    ("GB", GB),
    ("MB", MB),
    ("KB", KB),
    ("G", GB),
    ("M", MB),
    ("K", KB),
    ("B", 1),
];

/// Parses a size string into bytes.
///
/// Bare numbers are bytes; `K`/`KB`, `M`/`MB` and `G`/`GB` are binary
/// multiples. Case and surrounding whitespace are ignored.
///
/// ```
/// use streamer::config::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
/// assert_eq!(parse_size("64 mb").unwrap(), 64 * 1024 * 1024);
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let err = || SizeParseError {
        input: s.to_string(),
    };
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            upper
                .strip_suffix(suffix)
                .map(|rest| (rest.trim_end().to_string(), *multiplier))
        })
        .unwrap_or((upper.clone(), 1));

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let value: u64 = digits.parse().map_err(|_| err())?;
    value.checked_mul(multiplier).ok_or_else(err)
}

/// Formats a byte count using the largest unit that divides it evenly.
///
/// ```
/// use streamer::config::format_size;
///
/// assert_eq!(format_size(64 * 1024), "64KB");
/// assert_eq!(format_size(1000), "1000");
/// ```
pub fn format_size(bytes: u64) -> String {
    match bytes {
        b if b >= GB && b % GB == 0 => format!("{}GB", b / GB),
        b if b >= MB && b % MB == 0 => format!("{}MB", b / MB),
        b if b >= KB && b % KB == 0 => format!("{}KB", b / KB),
        b => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1K").unwrap(), KB);
        assert_eq!(parse_size("1kb").unwrap(), KB);
        assert_eq!(parse_size("64MB").unwrap(), 64 * MB);
        assert_eq!(parse_size("2g").unwrap(), 2 * GB);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(parse_size("  64 KB ").unwrap(), 64 * KB);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("KB").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-1MB").is_err());
        assert!(parse_size("1.5MB").is_err());
        assert!(parse_size("2TB").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(KB), "1KB");
        assert_eq!(format_size(64 * MB), "64MB");
        assert_eq!(format_size(3 * GB), "3GB");
        assert_eq!(format_size(1500), "1500");
    }
}

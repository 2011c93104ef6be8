//! Byte ranges within a file.

use std::fmt;

/// Half-open byte range `[offset, offset + size)` within a file.
///
/// The default range covers the whole file. Ranges scope dedicated caches and
/// flushes together with a [`RequestPath`](super::RequestPath).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileRange {
    pub offset: u64,
    pub size: u64,
}

impl FileRange {
    /// Creates a range starting at `offset` covering `size` bytes.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Creates a range from start and (exclusive) end offsets.
    pub fn from_bounds(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            size: end.saturating_sub(start),
        }
    }

    /// Returns the range covering an entire file, whatever its size.
    pub fn whole_file() -> Self {
        Self {
            offset: 0,
            size: u64::MAX,
        }
    }

    /// Returns true if this is the whole-file range.
    pub fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.size == u64::MAX
    }

    /// Returns the exclusive end offset, saturating at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Returns true if the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns true if `other` lies entirely within this range.
    pub fn contains(&self, other: &FileRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Returns true if the two ranges share at least one byte.
    pub fn overlaps(&self, other: &FileRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Returns the shared part of two ranges, if any.
    pub fn intersect(&self, other: &FileRange) -> Option<FileRange> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| FileRange::from_bounds(start, end))
    }
}

impl Default for FileRange {
    fn default() -> Self {
        Self::whole_file()
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_whole_file() {
            write!(f, "[whole file]")
        } else {
            write!(f, "[{}, {})", self.offset, self.end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_whole_file() {
        let range = FileRange::default();
        assert!(range.is_whole_file());
        assert!(range.contains(&FileRange::new(1 << 40, 10)));
    }

    #[test]
    fn test_overlap_and_intersection() {
        let a = FileRange::new(0, 100);
        let b = FileRange::new(50, 100);
        let c = FileRange::new(100, 10);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersect(&b), Some(FileRange::from_bounds(50, 100)));
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_end_saturates() {
        let range = FileRange::new(10, u64::MAX);
        assert_eq!(range.end(), u64::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(FileRange::new(4, 4).to_string(), "[4, 8)");
        assert_eq!(FileRange::whole_file().to_string(), "[whole file]");
    }
}

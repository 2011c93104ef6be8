//! Archive lookup: maps relative paths to entries inside archive
//! containers.

use crate::request::{CompressionInfo, RequestPath};
use dashmap::DashMap;
use std::sync::Arc;

/// Resolves a relative path to the archive entry holding it.
pub trait ArchiveLookup: Send + Sync + 'static {
    /// Returns `None` for paths that are not inside any mounted archive.
    fn resolve(&self, path: &RequestPath) -> Option<Arc<CompressionInfo>>;
}

/// In-memory archive table.
///
/// Uses `DashMap` so that mounting archives from another thread does not
/// contend with lookups on the scheduler thread.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    entries: DashMap<RequestPath, Arc<CompressionInfo>>,
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry, replacing any previous entry for `path`.
    pub fn insert(&self, path: impl Into<RequestPath>, info: CompressionInfo) {
        self.entries.insert(path.into(), Arc::new(info));
    }

    pub fn remove(&self, path: &RequestPath) -> Option<Arc<CompressionInfo>> {
        self.entries.remove(path).map(|(_, info)| info)
    }

    /// Removes every entry stored in `archive`.
    pub fn unmount(&self, archive: &RequestPath) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, info| &info.archive != archive);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArchiveLookup for ArchiveIndex {
    fn resolve(&self, path: &RequestPath) -> Option<Arc<CompressionInfo>> {
        self.entries.get(path).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CompressionCodec;

    fn entry(archive: &str, offset: u64) -> CompressionInfo {
        CompressionInfo::single_block(
            RequestPath::new(archive),
            CompressionCodec::Stored,
            offset,
            10,
            10,
        )
    }

    #[test]
    fn test_resolve_uses_normalized_paths() {
        let index = ArchiveIndex::new();
        index.insert("data\\level.bin", entry("data.pak", 0));

        let info = index.resolve(&RequestPath::new("data/level.bin")).unwrap();
        assert_eq!(info.archive.as_str(), "data.pak");
        assert!(index.resolve(&RequestPath::new("data/other.bin")).is_none());
    }

    #[test]
    fn test_unmount_removes_archive_entries() {
        let index = ArchiveIndex::new();
        index.insert("a.bin", entry("one.pak", 0));
        index.insert("b.bin", entry("one.pak", 10));
        index.insert("c.bin", entry("two.pak", 0));

        assert_eq!(index.unmount(&RequestPath::new("one.pak")), 2);
        assert_eq!(index.len(), 1);
    }
}

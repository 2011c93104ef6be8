//! Block cache node.
//!
//! Cached bytes are kept per path in fixed-size blocks. Each block holds one
//! contiguous extent, so a block can be partly filled:
//!
//! ```text
//!   block:   |<------------ block_size ------------>|
//!   extent:        [start ......... start + len)
//! ```
//!
//! A read that is fully covered completes here. Otherwise the cached
//! segments are copied into the request's buffer and one child read is
//! created per uncached gap; child results are inserted as they arrive.
//!
//! Ordinary blocks are evicted least-recently-used first once their total
//! size exceeds the budget. Blocks overlapping a dedicated cache range are
//! pinned: they do not count against the budget and are never evicted until
//! the range is destroyed.

use super::{NodeOutcome, StreamStackNode};
use crate::config::CacheSettings;
use crate::context::StreamerContext;
use crate::report::{StatisticValue, StreamerReport};
use crate::request::{
    buffer_len, Command, FileRange, ReadData, ReportKind, RequestId, RequestPath, RequestStatus,
};
use crate::telemetry::TelemetryEvent;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

const NAME: &str = "cache";

#[derive(Debug)]
struct CacheBlock {
    /// File offset of the first cached byte.
    start: u64,
    data: Vec<u8>,
    last_used: u64,
    pinned: bool,
}

impl CacheBlock {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheStats {
    hits: u64,
    partial_hits: u64,
    misses: u64,
    bytes_served: u64,
    bytes_inserted: u64,
    evicted_blocks: u64,
    evicted_bytes: u64,
}

/// LRU block cache with pinned dedicated ranges.
#[derive(Debug)]
pub struct CacheNode {
    block_size: u64,
    budget: u64,
    files: HashMap<RequestPath, BTreeMap<u64, CacheBlock>>,
    /// Recency order of unpinned blocks: use tick → (path, block index).
    lru: BTreeMap<u64, (RequestPath, u64)>,
    pinned: HashMap<RequestPath, Vec<FileRange>>,
    clock: u64,
    unpinned_bytes: u64,
    pinned_bytes: u64,
    stats: CacheStats,
}

impl CacheNode {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            block_size: settings.block_size.max(1),
            budget: settings.budget,
            files: HashMap::new(),
            lru: BTreeMap::new(),
            pinned: HashMap::new(),
            clock: 0,
            unpinned_bytes: 0,
            pinned_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    /// Stores `data` as the contents of `path` at `offset`.
    pub fn insert(&mut self, path: &RequestPath, offset: u64, data: &[u8]) {
        self.store(path, offset, data);
    }

    /// Bytes held by ordinary blocks.
    pub fn cached_bytes(&self) -> u64 {
        self.unpinned_bytes
    }

    /// Bytes held by pinned blocks.
    pub fn pinned_bytes(&self) -> u64 {
        self.pinned_bytes
    }

    /// Returns true if every byte of `range` is cached for `path`.
    pub fn contains(&self, path: &RequestPath, range: FileRange) -> bool {
        let Some(blocks) = self.files.get(path) else {
            return range.is_empty();
        };
        let end = range.end();
        let mut pos = range.offset;
        while pos < end {
            let index = pos / self.block_size;
            match blocks.get(&index) {
                Some(block) if block.start <= pos && pos < block.end() => {
                    pos = block.end().min(end);
                }
                _ => return false,
            }
        }
        true
    }

    // =========================================================================
    // Block storage
    // =========================================================================

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_pinned(&self, path: &RequestPath, block: FileRange) -> bool {
        self.pinned
            .get(path)
            .is_some_and(|ranges| ranges.iter().any(|r| r.overlaps(&block)))
    }

    fn block_range(&self, index: u64) -> FileRange {
        FileRange::new(index * self.block_size, self.block_size)
    }

    /// Splits `data` at block boundaries and merges it into the cache.
    /// Returns the evicted block count and bytes.
    fn store(&mut self, path: &RequestPath, offset: u64, data: &[u8]) -> (usize, u64) {
        let end = offset + data.len() as u64;
        let mut pos = offset;
        while pos < end {
            let index = pos / self.block_size;
            let block_end = ((index + 1) * self.block_size).min(end);
            let chunk = &data[(pos - offset) as usize..(block_end - offset) as usize];
            self.store_block(path, index, pos, chunk);
            pos = block_end;
        }
        self.stats.bytes_inserted += data.len() as u64;
        self.evict()
    }

    fn store_block(&mut self, path: &RequestPath, index: u64, start: u64, chunk: &[u8]) {
        let pinned = self.is_pinned(path, self.block_range(index));
        let tick = self.tick();
        let blocks = self.files.entry(path.clone()).or_default();

        let Some(block) = blocks.get_mut(&index) else {
            blocks.insert(
                index,
                CacheBlock {
                    start,
                    data: chunk.to_vec(),
                    last_used: tick,
                    pinned,
                },
            );
            if pinned {
                self.pinned_bytes += chunk.len() as u64;
            } else {
                self.unpinned_bytes += chunk.len() as u64;
                self.lru.insert(tick, (path.clone(), index));
            }
            return;
        };

        let old_len = block.data.len() as u64;
        let end = start + chunk.len() as u64;
        if start <= block.end() && block.start <= end {
            // Overlapping or adjacent: keep the union, new bytes win.
            let merged_start = block.start.min(start);
            let merged_end = block.end().max(end);
            let mut merged = vec![0u8; (merged_end - merged_start) as usize];
            let old_at = (block.start - merged_start) as usize;
            merged[old_at..old_at + block.data.len()].copy_from_slice(&block.data);
            let new_at = (start - merged_start) as usize;
            merged[new_at..new_at + chunk.len()].copy_from_slice(chunk);
            block.start = merged_start;
            block.data = merged;
        } else if chunk.len() as u64 > old_len {
            block.start = start;
            block.data = chunk.to_vec();
        }
        let new_len = block.data.len() as u64;

        if block.pinned {
            self.pinned_bytes = self.pinned_bytes + new_len - old_len;
        } else {
            self.unpinned_bytes = self.unpinned_bytes + new_len - old_len;
            self.lru.remove(&block.last_used);
            self.lru.insert(tick, (path.clone(), index));
        }
        block.last_used = tick;
    }

    /// Evicts least-recently-used ordinary blocks until within budget.
    fn evict(&mut self) -> (usize, u64) {
        let mut blocks = 0;
        let mut bytes = 0;
        while self.unpinned_bytes > self.budget {
            let Some((_, (path, index))) = self.lru.pop_first() else {
                break;
            };
            let Some(file) = self.files.get_mut(&path) else {
                continue;
            };
            if let Some(block) = file.remove(&index) {
                let len = block.data.len() as u64;
                self.unpinned_bytes -= len;
                blocks += 1;
                bytes += len;
            }
            if file.is_empty() {
                self.files.remove(&path);
            }
        }
        self.stats.evicted_blocks += blocks as u64;
        self.stats.evicted_bytes += bytes;
        (blocks, bytes)
    }

    /// Copies cached bytes of `[offset, offset + out.len())` into `out` and
    /// returns the uncached gaps, coalesced.
    fn read_cached(&mut self, path: &RequestPath, offset: u64, out: &mut [u8]) -> Vec<FileRange> {
        let end = offset + out.len() as u64;
        let mut gaps: Vec<FileRange> = Vec::new();
        let mut push_gap = |start: u64, stop: u64| match gaps.last_mut() {
            Some(last) if last.end() == start => last.size += stop - start,
            _ => gaps.push(FileRange::from_bounds(start, stop)),
        };

        let mut blocks = self.files.get_mut(path);
        let mut pos = offset;
        while pos < end {
            let index = pos / self.block_size;
            let block_end = ((index + 1) * self.block_size).min(end);
            let block = blocks.as_mut().and_then(|b| b.get_mut(&index));

            match block {
                Some(block) if block.start <= pos && pos < block.end() => {
                    let stop = block.end().min(block_end);
                    let src = &block.data[(pos - block.start) as usize..(stop - block.start) as usize];
                    out[(pos - offset) as usize..(stop - offset) as usize].copy_from_slice(src);
                    if !block.pinned {
                        // Each block gets its own tick; the LRU map is keyed by it.
                        self.clock += 1;
                        let tick = self.clock;
                        self.lru.remove(&block.last_used);
                        self.lru.insert(tick, (path.clone(), index));
                        block.last_used = tick;
                    }
                    pos = stop;
                }
                Some(block) if block.start > pos && block.start < block_end => {
                    push_gap(pos, block.start);
                    pos = block.start;
                }
                _ => {
                    push_gap(pos, block_end);
                    pos = block_end;
                }
            }
        }
        gaps
    }

    // =========================================================================
    // Dedicated ranges and flushes
    // =========================================================================

    /// Pins `range` of `path`, including blocks already cached.
    fn pin(&mut self, path: &RequestPath, range: FileRange) {
        self.pinned.entry(path.clone()).or_default().push(range);
        let Some(blocks) = self.files.get_mut(path) else {
            return;
        };
        for (index, block) in blocks.iter_mut() {
            let block_range = FileRange::new(index * self.block_size, self.block_size);
            if !block.pinned && range.overlaps(&block_range) {
                block.pinned = true;
                self.lru.remove(&block.last_used);
                let len = block.data.len() as u64;
                self.unpinned_bytes -= len;
                self.pinned_bytes += len;
            }
        }
    }

    /// Removes a pinned range and drops blocks no other range still pins.
    fn unpin(&mut self, path: &RequestPath, range: FileRange) -> bool {
        let Some(ranges) = self.pinned.get_mut(path) else {
            return false;
        };
        let Some(position) = ranges.iter().position(|r| *r == range) else {
            return false;
        };
        ranges.remove(position);
        let remaining = ranges.clone();
        if remaining.is_empty() {
            self.pinned.remove(path);
        }

        let Some(blocks) = self.files.get_mut(path) else {
            return true;
        };
        let block_size = self.block_size;
        let mut freed = 0;
        blocks.retain(|index, block| {
            let block_range = FileRange::new(index * block_size, block_size);
            let release = block.pinned
                && range.overlaps(&block_range)
                && !remaining.iter().any(|r| r.overlaps(&block_range));
            if release {
                freed += block.data.len() as u64;
            }
            !release
        });
        self.pinned_bytes -= freed;
        if blocks.is_empty() {
            self.files.remove(path);
        }
        true
    }

    /// Drops ordinary blocks of `path`. Pinned blocks stay.
    fn flush_path(&mut self, path: &RequestPath) -> u64 {
        let Some(blocks) = self.files.get_mut(path) else {
            return 0;
        };
        let mut freed = 0;
        let lru = &mut self.lru;
        blocks.retain(|_, block| {
            if block.pinned {
                return true;
            }
            lru.remove(&block.last_used);
            freed += block.data.len() as u64;
            false
        });
        self.unpinned_bytes -= freed;
        if blocks.is_empty() {
            self.files.remove(path);
        }
        freed
    }

    fn flush_all(&mut self) -> u64 {
        let paths: Vec<RequestPath> = self.files.keys().cloned().collect();
        paths.iter().map(|path| self.flush_path(path)).sum()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn handle_read(&mut self, ctx: &mut StreamerContext, id: RequestId, read: ReadData) -> NodeOutcome {
        let Some(size) = read.size.filter(|s| *s > 0) else {
            return NodeOutcome::Declined;
        };
        let Some(len) = buffer_len(size) else {
            return NodeOutcome::Declined;
        };
        let Some(data) = ctx.data_mut(id) else {
            return NodeOutcome::Declined;
        };
        if data.len() != len {
            data.resize(len, 0);
        }
        let gaps = self.read_cached(&read.path, read.offset, data);
        let missing: u64 = gaps.iter().map(|g| g.size).sum();

        if gaps.is_empty() {
            self.stats.hits += 1;
            self.stats.bytes_served += size;
            ctx.emit(TelemetryEvent::CacheHit { bytes: size });
            trace!(path = %read.path, offset = read.offset, size, "Cache hit");
            ctx.complete(id);
            return NodeOutcome::Handled;
        }

        if missing == size {
            self.stats.misses += 1;
        } else {
            self.stats.partial_hits += 1;
            self.stats.bytes_served += size - missing;
        }
        ctx.emit(TelemetryEvent::CacheMiss {
            bytes: size,
            missing_bytes: missing,
        });
        trace!(path = %read.path, offset = read.offset, size, missing, gaps = gaps.len(), "Cache miss");

        let mut children = Vec::with_capacity(gaps.len());
        for gap in gaps {
            let command = Command::Read(ReadData::new(read.path.clone(), gap.offset, Some(gap.size)));
            let placement = (gap.offset - read.offset) as usize;
            match ctx.create_child(id, command, Some(placement)) {
                Ok(child) => children.push(child),
                Err(err) => ctx.report_pool_error(err),
            }
        }
        NodeOutcome::Split(children)
    }
}

impl StreamStackNode for CacheNode {
    fn name(&self) -> &'static str {
        NAME
    }

    fn try_handle(&mut self, ctx: &mut StreamerContext, id: RequestId) -> NodeOutcome {
        let Some(request) = ctx.request(id) else {
            return NodeOutcome::Declined;
        };
        match request.command() {
            Command::Read(read) => {
                let read = read.clone();
                self.handle_read(ctx, id, read)
            }
            Command::CreateDedicatedCache(dedicated) => {
                debug!(path = %dedicated.path, range = ?dedicated.range, "Pinning dedicated cache range");
                let (path, range) = (dedicated.path.clone(), dedicated.range);
                self.pin(&path, range);
                ctx.complete(id);
                NodeOutcome::Handled
            }
            Command::DestroyDedicatedCache(dedicated) => {
                let (path, range) = (dedicated.path.clone(), dedicated.range);
                let found = self.unpin(&path, range);
                debug!(path = %path, range = ?range, found, "Destroyed dedicated cache range");
                ctx.complete(id);
                NodeOutcome::Handled
            }
            Command::Flush(flush) => {
                let path = flush.path.clone();
                let freed = self.flush_path(&path);
                debug!(path = %path, freed, "Flushed cached path");
                NodeOutcome::Declined
            }
            Command::FlushAll => {
                let freed = self.flush_all();
                debug!(freed, "Flushed cache");
                NodeOutcome::Declined
            }
            _ => NodeOutcome::Declined,
        }
    }

    fn on_child_completed(&mut self, ctx: &mut StreamerContext, _parent: RequestId, child: RequestId) {
        let Some(request) = ctx.request(child) else {
            return;
        };
        if request.status() != RequestStatus::Completed {
            return;
        }
        let Command::Read(read) = request.command() else {
            return;
        };
        let (blocks, bytes) = self.store(&read.path, read.offset, request.data());
        if blocks > 0 {
            ctx.emit(TelemetryEvent::CacheEviction { blocks, bytes });
        }
    }

    fn collect_report(&self, kind: ReportKind, report: &mut StreamerReport) {
        match kind {
            ReportKind::Statistics => {
                let lookups = self.stats.hits + self.stats.partial_hits + self.stats.misses;
                let hit_rate = if lookups == 0 {
                    0.0
                } else {
                    self.stats.hits as f64 / lookups as f64
                };
                report.push(NAME, "hits", StatisticValue::Count(self.stats.hits));
                report.push(NAME, "partial_hits", StatisticValue::Count(self.stats.partial_hits));
                report.push(NAME, "misses", StatisticValue::Count(self.stats.misses));
                report.push(NAME, "hit_rate", StatisticValue::Ratio(hit_rate));
                report.push(NAME, "bytes_served", StatisticValue::Bytes(self.stats.bytes_served));
                report.push(NAME, "bytes_cached", StatisticValue::Bytes(self.unpinned_bytes));
                report.push(NAME, "bytes_pinned", StatisticValue::Bytes(self.pinned_bytes));
                report.push(NAME, "evicted_blocks", StatisticValue::Count(self.stats.evicted_blocks));
            }
            ReportKind::Configuration => {
                report.push(NAME, "budget", StatisticValue::Bytes(self.budget));
                report.push(NAME, "block_size", StatisticValue::Bytes(self.block_size));
            }
            ReportKind::Queues => {
                let blocks: usize = self.files.values().map(BTreeMap::len).sum();
                report.push(NAME, "blocks", StatisticValue::Count(blocks as u64));
                report.push(NAME, "pinned_ranges", StatisticValue::Count(
                    self.pinned.values().map(Vec::len).sum::<usize>() as u64,
                ));
            }
        }
    }
}

//! Device dispatch node: the tail of the stack.
//!
//! Reads wait in an ordered queue (deadline, priority, pending id of the
//! submission, arrival) and are
//! issued to the storage backend while fewer than `max_concurrent` are in
//! flight. Backend completions arrive on I/O threads and come back through
//! the context on a later tick; this node never finishes a request from
//! another thread.
//!
//! ```text
//!   try_handle ──► pending (OrderedQueue) ──► execute_requests ──► backend
//!                        ▲                                           │
//!   size queries ────────┘ (whole-file reads)      on_async_completion ◄┘
//! ```
//!
//! File sizes learned from the backend are kept in a small metadata cache
//! so repeated whole-file reads and queries skip the size lookup.

use super::{NodeOutcome, StreamStackNode};
use crate::backend::{BackendRead, ReadCompletion, SizeCompletion, StorageBackend};
use crate::config::DeviceSettings;
use crate::context::{AsyncResult, StreamerContext};
use crate::error::RequestError;
use crate::report::{StatisticValue, StreamerReport};
use crate::request::{
    buffer_len, Command, CommandKind, FileMetadata, FileRequest, ReportKind, RequestId, RequestOutput,
    RequestPath,
};
use crate::scheduler::queue::{OrderKey, OrderedQueue};
use crate::telemetry::TelemetryEvent;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const NAME: &str = "device";

/// Weight of the newest sample in the moving averages.
const SMOOTHING: f64 = 0.2;

/// Exponential moving average.
#[derive(Debug, Default, Clone, Copy)]
struct MovingAverage {
    value: Option<f64>,
}

impl MovingAverage {
    fn record(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(current) => current + SMOOTHING * (sample - current),
            None => sample,
        });
    }

    fn get(&self) -> Option<f64> {
        self.value
    }
}

/// File sizes keyed by path, evicted in insertion order.
#[derive(Debug)]
struct MetadataCache {
    capacity: usize,
    sizes: HashMap<RequestPath, u64>,
    order: VecDeque<RequestPath>,
    hits: u64,
}

impl MetadataCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sizes: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
        }
    }

    fn get(&mut self, path: &RequestPath) -> Option<u64> {
        let size = self.sizes.get(path).copied();
        if size.is_some() {
            self.hits += 1;
        }
        size
    }

    fn insert(&mut self, path: RequestPath, size: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.sizes.insert(path.clone(), size).is_none() {
            self.order.push_back(path);
        }
        while self.sizes.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.sizes.remove(&oldest);
        }
    }

    fn invalidate(&mut self, path: &RequestPath) {
        if self.sizes.remove(path).is_some() {
            self.order.retain(|p| p != path);
        }
    }

    fn clear(&mut self) {
        self.sizes.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedRead {
    id: RequestId,
    size: u64,
}

#[derive(Debug)]
enum InFlight {
    Read {
        id: RequestId,
        path: RequestPath,
        size: u64,
        issued_at: Instant,
    },
    Size {
        path: RequestPath,
        waiters: Vec<RequestId>,
        issued_at: Instant,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct DeviceStats {
    reads_issued: u64,
    reads_completed: u64,
    read_failures: u64,
    bytes_read: u64,
    size_queries: u64,
    canceled_before_issue: u64,
}

/// Bounded-concurrency dispatcher in front of one storage backend.
pub struct DeviceNode {
    backend: Arc<dyn StorageBackend>,
    max_concurrent: usize,
    over_commit: usize,
    pending: OrderedQueue<QueuedRead>,
    arrivals: u64,
    active: HashMap<u64, InFlight>,
    size_queries: HashMap<RequestPath, u64>,
    reads_in_flight: usize,
    next_token: u64,
    metadata: MetadataCache,
    read_latency: MovingAverage,
    /// Bytes per second of completed reads.
    throughput: MovingAverage,
    query_latency: MovingAverage,
    stats: DeviceStats,
}

impl DeviceNode {
    pub fn new(backend: Arc<dyn StorageBackend>, settings: &DeviceSettings) -> Self {
        let max_concurrent = match settings.max_concurrent_reads {
            0 => backend.available_concurrency().max(1),
            n => n,
        };
        Self {
            backend,
            max_concurrent,
            over_commit: settings.over_commit,
            pending: OrderedQueue::new(),
            arrivals: 0,
            active: HashMap::new(),
            size_queries: HashMap::new(),
            reads_in_flight: 0,
            next_token: 0,
            metadata: MetadataCache::new(settings.metadata_cache_entries),
            read_latency: MovingAverage::default(),
            throughput: MovingAverage::default(),
            query_latency: MovingAverage::default(),
            stats: DeviceStats::default(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn reads_in_flight(&self) -> usize {
        self.reads_in_flight
    }

    pub fn queued_reads(&self) -> usize {
        self.pending.len()
    }

    fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn expected_read_time(&self, size: u64) -> Option<Duration> {
        let latency = self.read_latency.get()?;
        let transfer = self
            .throughput
            .get()
            .filter(|bps| *bps > 0.0)
            .map_or(0.0, |bps| size as f64 / bps);
        Some(Duration::from_secs_f64((latency + transfer).max(0.0)))
    }

    // =========================================================================
    // Queueing
    // =========================================================================

    /// Sizes the request buffer and queues the read.
    fn enqueue_read(&mut self, ctx: &mut StreamerContext, id: RequestId, size: u64) {
        if size == 0 {
            ctx.complete(id);
            return;
        }
        let Some(request) = ctx.request(id) else {
            return;
        };
        let (deadline, priority) = (request.deadline(), request.priority());
        let Command::Read(read) = request.command() else {
            return;
        };
        let Some(len) = buffer_len(size) else {
            let err = RequestError::too_large(&read.path, size);
            ctx.fail(id, err);
            return;
        };
        let allocator = read.allocator.clone();
        let pending_id = submission_order(ctx, id);
        if let Some(data) = ctx.data_mut(id) {
            if data.is_empty() {
                if let Some(allocator) = allocator {
                    *data = allocator.allocate(len);
                }
            }
            data.resize(len, 0);
        }

        let arrival = self.arrivals;
        self.arrivals += 1;
        let key = OrderKey::new(deadline, priority, pending_id).with_sequence(arrival);
        self.pending.push(key, QueuedRead { id, size });
    }

    /// Continues a read whose size was unknown once the file size is known.
    fn resolve_whole_file(&mut self, ctx: &mut StreamerContext, id: RequestId, file_size: u64) {
        let Some(Command::Read(read)) = ctx.request(id).map(FileRequest::command) else {
            return;
        };
        if read.offset > file_size {
            let err = RequestError::InvalidRange {
                path: read.path.to_string(),
                offset: read.offset,
                size: 0,
                file_size,
            };
            ctx.fail(id, err);
            return;
        }
        let size = file_size - read.offset;
        self.enqueue_read(ctx, id, size);
    }

    /// Asks the backend for the size of `path`, sharing one lookup between
    /// all requests waiting on the same path.
    fn request_size(&mut self, ctx: &mut StreamerContext, path: RequestPath, id: RequestId) {
        if let Some(token) = self.size_queries.get(&path) {
            if let Some(InFlight::Size { waiters, .. }) = self.active.get_mut(token) {
                waiters.push(id);
                return;
            }
        }
        let token = self.token();
        self.size_queries.insert(path.clone(), token);
        self.active.insert(
            token,
            InFlight::Size {
                path: path.clone(),
                waiters: vec![id],
                issued_at: ctx.now(),
            },
        );
        self.stats.size_queries += 1;
        trace!(path = %path, token, "Size query issued");
        self.backend
            .begin_file_size(path, SizeCompletion::new(ctx.async_notifier(token)));
    }

    /// Answers a request that waited for a file size.
    fn answer_size(&mut self, ctx: &mut StreamerContext, id: RequestId, size: Option<u64>) {
        if ctx.is_canceled(id) {
            ctx.cancel(id);
            return;
        }
        let Some(request) = ctx.request(id) else {
            return;
        };
        let kind = request.command().kind();
        let path = request.command().path().cloned();
        match (kind, size) {
            (CommandKind::Read, Some(size)) => self.resolve_whole_file(ctx, id, size),
            (CommandKind::FileExistsCheck, size) => {
                ctx.complete_with(id, RequestOutput::Exists(size.is_some()))
            }
            (CommandKind::FileMetadata, Some(size)) => {
                ctx.complete_with(id, RequestOutput::Metadata(FileMetadata { size }))
            }
            _ => ctx.fail(
                id,
                RequestError::NotFound {
                    path: path.map(|p| p.to_string()).unwrap_or_default(),
                },
            ),
        }
    }

    // =========================================================================
    // Issue and completion
    // =========================================================================

    fn issue(&mut self, ctx: &mut StreamerContext, queued: QueuedRead) {
        let Some(Command::Read(read)) = ctx.request(queued.id).map(FileRequest::command) else {
            return;
        };
        let (path, offset) = (read.path.clone(), read.offset);
        let buffer = ctx.take_data(queued.id);
        let token = self.token();

        self.reads_in_flight += 1;
        self.stats.reads_issued += 1;
        self.active.insert(
            token,
            InFlight::Read {
                id: queued.id,
                path: path.clone(),
                size: queued.size,
                issued_at: ctx.now(),
            },
        );
        ctx.emit(TelemetryEvent::BackendReadIssued {
            backend: self.backend.name(),
            offset,
            size: queued.size,
            in_flight: self.reads_in_flight,
        });
        trace!(request = %queued.id, path = %path, offset, size = queued.size, "Read issued");

        self.backend.begin_read(
            BackendRead {
                path,
                offset,
                size: queued.size,
                buffer,
            },
            ReadCompletion::new(ctx.async_notifier(token)),
        );
    }

    fn read_completed(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: RequestPath,
        size: u64,
        issued_at: Instant,
        result: io::Result<Vec<u8>>,
    ) {
        self.reads_in_flight = self.reads_in_flight.saturating_sub(1);
        let elapsed = ctx.now().saturating_duration_since(issued_at);
        ctx.emit(TelemetryEvent::BackendReadCompleted {
            backend: self.backend.name(),
            size,
            duration: elapsed,
            success: result.is_ok(),
        });

        match result {
            Ok(buffer) if (buffer.len() as u64) < size => {
                self.stats.read_failures += 1;
                ctx.fail(
                    id,
                    RequestError::ShortRead {
                        path: path.to_string(),
                        expected: size,
                        actual: buffer.len() as u64,
                    },
                );
            }
            Ok(buffer) => {
                self.stats.reads_completed += 1;
                self.stats.bytes_read += size;
                let seconds = elapsed.as_secs_f64();
                self.read_latency.record(seconds);
                if seconds > 0.0 {
                    self.throughput.record(size as f64 / seconds);
                }
                if let Some(data) = ctx.data_mut(id) {
                    *data = buffer;
                }
                ctx.complete(id);
            }
            Err(err) => {
                self.stats.read_failures += 1;
                debug!(request = %id, path = %path, error = %err, "Backend read failed");
                ctx.fail(id, RequestError::io(&path, &err));
            }
        }
    }

    fn size_completed(
        &mut self,
        ctx: &mut StreamerContext,
        path: RequestPath,
        waiters: Vec<RequestId>,
        issued_at: Instant,
        result: io::Result<Option<u64>>,
    ) {
        self.size_queries.remove(&path);
        self.query_latency
            .record(ctx.now().saturating_duration_since(issued_at).as_secs_f64());
        match result {
            Ok(size) => {
                if let Some(size) = size {
                    self.metadata.insert(path, size);
                }
                for id in waiters {
                    self.answer_size(ctx, id, size);
                }
            }
            Err(err) => {
                debug!(path = %path, error = %err, "Size query failed");
                for id in waiters {
                    ctx.fail(id, RequestError::io(&path, &err));
                }
            }
        }
    }
}

/// Pending id of the request or of its nearest queued ancestor. Reads split
/// off by upper nodes inherit their submission's place in line.
fn submission_order(ctx: &StreamerContext, id: RequestId) -> u64 {
    let mut current = Some(id);
    while let Some(id) = current {
        let Some(request) = ctx.request(id) else {
            break;
        };
        if let Some(pending_id) = request.pending_id() {
            return pending_id;
        }
        current = request.parent();
    }
    u64::MAX
}

impl StreamStackNode for DeviceNode {
    fn name(&self) -> &'static str {
        NAME
    }

    fn try_handle(&mut self, ctx: &mut StreamerContext, id: RequestId) -> NodeOutcome {
        let Some(request) = ctx.request(id) else {
            return NodeOutcome::Declined;
        };
        match request.command() {
            Command::Read(read) => {
                let (path, size) = (read.path.clone(), read.size);
                match size {
                    Some(size) => self.enqueue_read(ctx, id, size),
                    None => match self.metadata.get(&path) {
                        Some(file_size) => self.resolve_whole_file(ctx, id, file_size),
                        None => self.request_size(ctx, path, id),
                    },
                }
                NodeOutcome::Handled
            }
            Command::FileExistsCheck(query) | Command::FileMetadata(query) => {
                let path = query.path.clone();
                match self.metadata.get(&path) {
                    Some(size) => self.answer_size(ctx, id, Some(size)),
                    None => self.request_size(ctx, path, id),
                }
                NodeOutcome::Handled
            }
            Command::Flush(flush) => {
                let path = flush.path.clone();
                self.metadata.invalidate(&path);
                NodeOutcome::Declined
            }
            Command::FlushAll => {
                self.metadata.clear();
                NodeOutcome::Declined
            }
            _ => NodeOutcome::Declined,
        }
    }

    /// Drops canceled reads that were never issued and refreshes completion
    /// estimates for the rest.
    fn prepare_requests(&mut self, ctx: &mut StreamerContext) {
        let canceled = self.pending.drain_where(|queued| ctx.is_canceled(queued.id));
        for (_, queued) in canceled {
            self.stats.canceled_before_issue += 1;
            trace!(request = %queued.id, "Queued read canceled before issue");
            ctx.cancel(queued.id);
        }

        let now = ctx.now();
        let lanes = self.max_concurrent.max(1);
        let estimates: Vec<(RequestId, Duration)> = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(position, (_, queued))| {
                let per_read = self.expected_read_time(queued.size)?;
                let waves = (position / lanes + 1) as u32;
                Some((queued.id, per_read * waves))
            })
            .collect();
        for (id, wait) in estimates {
            ctx.set_estimated_completion(id, now + wait);
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut worked = false;
        while self.reads_in_flight < self.max_concurrent {
            let Some((_, queued)) = self.pending.pop() else {
                break;
            };
            worked = true;
            if ctx.is_canceled(queued.id) {
                self.stats.canceled_before_issue += 1;
                ctx.cancel(queued.id);
                continue;
            }
            self.issue(ctx, queued);
        }
        worked
    }

    fn on_async_completion(&mut self, ctx: &mut StreamerContext, token: u64, result: AsyncResult) {
        let Some(in_flight) = self.active.remove(&token) else {
            warn!(token, "Completion for unknown backend operation");
            return;
        };
        match (in_flight, result) {
            (InFlight::Read { id, path, size, issued_at }, AsyncResult::Read(result)) => {
                self.read_completed(ctx, id, path, size, issued_at, result);
            }
            (InFlight::Size { path, waiters, issued_at }, AsyncResult::FileSize(result)) => {
                self.size_completed(ctx, path, waiters, issued_at, result);
            }
            (in_flight, result) => {
                warn!(token, operation = ?in_flight, result = ?result, "Mismatched backend completion");
                let err = io::Error::new(io::ErrorKind::InvalidData, "mismatched completion");
                match in_flight {
                    InFlight::Read { id, path, size, issued_at } => {
                        self.read_completed(ctx, id, path, size, issued_at, Err(err));
                    }
                    InFlight::Size { path, waiters, issued_at } => {
                        self.size_completed(ctx, path, waiters, issued_at, Err(err));
                    }
                }
            }
        }
    }

    fn estimated_request_duration(&self, request: &FileRequest) -> Option<Duration> {
        match request.command() {
            Command::Read(read) => self.expected_read_time(read.size?),
            Command::FileExistsCheck(_) | Command::FileMetadata(_) => {
                self.query_latency.get().map(Duration::from_secs_f64)
            }
            _ => None,
        }
    }

    fn available_request_slots(&self) -> Option<usize> {
        let capacity = self.max_concurrent + self.over_commit;
        Some(capacity.saturating_sub(self.pending.len() + self.reads_in_flight))
    }

    fn collect_report(&self, kind: ReportKind, report: &mut StreamerReport) {
        match kind {
            ReportKind::Statistics => {
                report.push(NAME, "reads_issued", StatisticValue::Count(self.stats.reads_issued));
                report.push(NAME, "reads_completed", StatisticValue::Count(self.stats.reads_completed));
                report.push(NAME, "read_failures", StatisticValue::Count(self.stats.read_failures));
                report.push(NAME, "bytes_read", StatisticValue::Bytes(self.stats.bytes_read));
                report.push(NAME, "size_queries", StatisticValue::Count(self.stats.size_queries));
                report.push(NAME, "metadata_hits", StatisticValue::Count(self.metadata.hits));
                report.push(
                    NAME,
                    "canceled_before_issue",
                    StatisticValue::Count(self.stats.canceled_before_issue),
                );
                if let Some(latency) = self.read_latency.get() {
                    report.push(
                        NAME,
                        "average_read_latency",
                        StatisticValue::Duration(Duration::from_secs_f64(latency)),
                    );
                }
            }
            ReportKind::Configuration => {
                report.push(NAME, "backend", StatisticValue::Text(self.backend.name().to_string()));
                report.push(NAME, "max_concurrent", StatisticValue::Count(self.max_concurrent as u64));
                report.push(NAME, "over_commit", StatisticValue::Count(self.over_commit as u64));
                report.push(
                    NAME,
                    "metadata_cache_entries",
                    StatisticValue::Count(self.metadata.capacity as u64),
                );
            }
            ReportKind::Queues => {
                report.push(NAME, "queued_reads", StatisticValue::Count(self.pending.len() as u64));
                report.push(NAME, "reads_in_flight", StatisticValue::Count(self.reads_in_flight as u64));
                report.push(
                    NAME,
                    "size_queries_in_flight",
                    StatisticValue::Count(self.size_queries.len() as u64),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_smooths() {
        let mut avg = MovingAverage::default();
        assert_eq!(avg.get(), None);
        avg.record(10.0);
        avg.record(20.0);
        assert!((avg.get().unwrap() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_metadata_cache_evicts_oldest() {
        let mut cache = MetadataCache::new(2);
        cache.insert(RequestPath::new("a"), 1);
        cache.insert(RequestPath::new("b"), 2);
        cache.insert(RequestPath::new("c"), 3);

        assert_eq!(cache.get(&RequestPath::new("a")), None);
        assert_eq!(cache.get(&RequestPath::new("c")), Some(3));
        assert_eq!(cache.hits, 1);
    }

    #[test]
    fn test_metadata_cache_disabled_at_zero() {
        let mut cache = MetadataCache::new(0);
        cache.insert(RequestPath::new("a"), 1);
        assert_eq!(cache.get(&RequestPath::new("a")), None);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let mut cache = MetadataCache::new(4);
        cache.insert(RequestPath::new("a"), 1);
        cache.invalidate(&RequestPath::new("a"));
        assert_eq!(cache.get(&RequestPath::new("a")), None);
        assert!(cache.order.is_empty());
    }
}

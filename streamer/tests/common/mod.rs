//! Shared helpers for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use streamer::backend::{
    ArchiveIndex, BackendRead, DecompressorSet, InlineJobSystem, ReadCompletion, SizeCompletion,
    StorageBackend,
};
use streamer::config::SchedulerSettings;
use streamer::context::ContextSubmitter;
use streamer::telemetry::{TelemetryEvent, TelemetrySink};
use streamer::{PendingRequest, RequestHandle, RequestPath, Scheduler, StreamStack, StreamerConfig};

/// Deterministic test bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Mock backend
// =============================================================================

/// In-memory backend that records every read and can hold completions
/// until the test releases them.
pub struct MockBackend {
    files: Mutex<HashMap<RequestPath, Vec<u8>>>,
    reads: Mutex<Vec<(String, u64, u64)>>,
    held: Mutex<Vec<(BackendRead, ReadCompletion)>>,
    hold: AtomicBool,
    concurrency: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            reads: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            concurrency: 4,
        }
    }

    pub fn with_file(self, path: &str, data: Vec<u8>) -> Self {
        self.files.lock().insert(RequestPath::new(path), data);
        self
    }

    /// Keeps completions until [`release_all`](Self::release_all).
    pub fn holding(self) -> Self {
        self.hold.store(true, Ordering::SeqCst);
        self
    }

    /// Every read issued so far as `(path, offset, size)`.
    pub fn reads(&self) -> Vec<(String, u64, u64)> {
        self.reads.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Completes every held read. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let count = held.len();
        for (read, completion) in held {
            self.serve(read, completion);
        }
        count
    }

    fn serve(&self, read: BackendRead, completion: ReadCompletion) {
        let files = self.files.lock();
        let Some(data) = files.get(&read.path) else {
            completion.complete(Err(io::Error::new(io::ErrorKind::NotFound, "no such file")));
            return;
        };
        let start = (read.offset as usize).min(data.len());
        let end = (read.offset + read.size).min(data.len() as u64) as usize;
        let mut buffer = read.buffer;
        buffer.clear();
        buffer.extend_from_slice(&data[start..end]);
        completion.complete(Ok(buffer));
    }
}

impl StorageBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available_concurrency(&self) -> usize {
        self.concurrency
    }

    fn begin_read(&self, read: BackendRead, completion: ReadCompletion) {
        self.reads
            .lock()
            .push((read.path.to_string(), read.offset, read.size));
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push((read, completion));
        } else {
            self.serve(read, completion);
        }
    }

    fn begin_file_size(&self, path: RequestPath, completion: SizeCompletion) {
        let size = self.files.lock().get(&path).map(|data| data.len() as u64);
        completion.complete(Ok(size));
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// Keeps every emitted event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A scheduler driven tick by tick from the test thread.
pub struct Harness {
    pub scheduler: Scheduler,
    pub submitter: ContextSubmitter,
}

impl Harness {
    pub fn new(stack: StreamStack) -> Self {
        let (scheduler, submitter) = Scheduler::new(SchedulerSettings::default(), stack);
        Self {
            scheduler,
            submitter,
        }
    }

    pub fn with_sink(stack: StreamStack, sink: Arc<dyn TelemetrySink>) -> Self {
        let (scheduler, submitter) =
            Scheduler::with_telemetry(SchedulerSettings::default(), stack, sink);
        Self {
            scheduler,
            submitter,
        }
    }

    /// Standard stack over `backend` with inline jobs.
    pub fn standard(
        config: &StreamerConfig,
        backend: Arc<MockBackend>,
        archives: Arc<ArchiveIndex>,
    ) -> Self {
        Self::new(standard_stack(config, backend, archives))
    }

    pub fn submit(&self, configure: impl FnOnce(&mut PendingRequest)) -> RequestHandle {
        let mut request = PendingRequest::new();
        configure(&mut request);
        self.submitter
            .queue_external_request(request)
            .expect("submitter open")
    }

    pub fn settle(&mut self) {
        self.scheduler.run_until_idle(1_000);
    }
}

pub fn standard_stack(
    config: &StreamerConfig,
    backend: Arc<MockBackend>,
    archives: Arc<ArchiveIndex>,
) -> StreamStack {
    StreamStack::standard(
        config,
        backend,
        archives,
        Arc::new(DecompressorSet::default()),
        Arc::new(InlineJobSystem),
    )
}

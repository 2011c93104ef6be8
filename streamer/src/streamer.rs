//! Streamer facade.
//!
//! [`Streamer`] owns the scheduler thread and turns convenience calls into
//! [`PendingRequest`]s. Every method is safe to call from any thread and
//! returns as soon as the request is queued; results are observed through
//! the returned [`RequestHandle`] or a completion callback.
//!
//! ```ignore
//! use streamer::{Streamer, StreamerConfig, SubmitOptions};
//! use streamer::backend::ArchiveIndex;
//! use std::sync::Arc;
//!
//! let streamer = Streamer::open_local(&StreamerConfig::default(), "/data", Arc::new(ArchiveIndex::new()))?;
//! let handle = streamer.read("textures/grass.bin", 0, 4096, SubmitOptions::default())?;
//! handle.wait_blocking()?;
//! let bytes = handle.take_data();
//! ```

use crate::backend::{ArchiveLookup, DecompressorSet, JobSystem, LocalFileBackend, TokioJobSystem};
use crate::config::StreamerConfig;
use crate::context::{is_scheduler_thread, mark_scheduler_thread, ContextSubmitter};
use crate::error::StreamerError;
use crate::request::{
    BufferAllocator, CompletionCallback, Deadline, FileRange, PendingRequest, Priority,
    ReportKind, RequestHandle, RequestPath,
};
use crate::scheduler::Scheduler;
use crate::stack::StreamStack;
use crate::telemetry::{TelemetrySink, TracingTelemetrySink};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the scheduler thread.
pub const SCHEDULER_THREAD_NAME: &str = "streamer-scheduler";

/// Thread name of the runtime built when no tokio runtime is running.
pub const IO_THREAD_NAME: &str = "streamer-io";

/// Ordering keys and callback applied to a convenience submission.
#[derive(Default)]
pub struct SubmitOptions {
    pub deadline: Deadline,
    pub priority: Priority,
    callback: Option<CompletionCallback>,
}

impl SubmitOptions {
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Runs `callback` on the scheduler thread when the request finishes.
    pub fn with_callback(mut self, callback: impl FnOnce(&RequestHandle) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    fn apply(self, request: &mut PendingRequest) {
        request.with_deadline(self.deadline).with_priority(self.priority);
        if let Some(callback) = self.callback {
            request.callback = Some(callback);
        }
    }
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Handle to a running streaming core.
///
/// Dropping the streamer shuts the scheduler down: queued requests are
/// canceled and in-flight reads get up to
/// [`DRAIN_TIMEOUT`](crate::scheduler::DRAIN_TIMEOUT) to finish.
pub struct Streamer {
    submitter: ContextSubmitter,
    shutdown: CancellationToken,
    thread_handle: Option<JoinHandle<()>>,
    /// Runtime owned for blocking file work; shut down after the scheduler.
    runtime: Option<Runtime>,
}

impl Streamer {
    /// Starts the scheduler thread over `stack`.
    pub fn start(config: &StreamerConfig, stack: StreamStack) -> Result<Self, StreamerError> {
        Self::with_telemetry(config, stack, Arc::new(TracingTelemetrySink))
    }

    /// Starts the scheduler thread with a custom telemetry sink.
    pub fn with_telemetry(
        config: &StreamerConfig,
        stack: StreamStack,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, StreamerError> {
        let (scheduler, submitter) =
            Scheduler::with_telemetry(config.scheduler.clone(), stack, telemetry);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let thread_handle = thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_string())
            .spawn(move || {
                mark_scheduler_thread();
                scheduler.run(token);
            })
            .map_err(StreamerError::ThreadSpawn)?;

        info!(thread = SCHEDULER_THREAD_NAME, "Streamer started");
        Ok(Self {
            submitter,
            shutdown,
            thread_handle: Some(thread_handle),
            runtime: None,
        })
    }

    /// Starts a streamer reading loose files under `root`, with archived
    /// paths resolved through `archives`.
    ///
    /// Blocking file work runs on the current tokio runtime when there is
    /// one. Otherwise the streamer builds and owns a small runtime for it, so
    /// reads never block the scheduler thread.
    pub fn open_local(
        config: &StreamerConfig,
        root: impl Into<PathBuf>,
        archives: Arc<dyn ArchiveLookup>,
    ) -> Result<Self, StreamerError> {
        let (jobs, runtime) = match TokioJobSystem::current() {
            Some(jobs) => (jobs, None),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(IO_THREAD_NAME)
                    .build()
                    .map_err(StreamerError::Runtime)?;
                debug!(thread = IO_THREAD_NAME, "Built owned I/O runtime");
                (TokioJobSystem::new(runtime.handle().clone()), Some(runtime))
            }
        };
        let jobs: Arc<dyn JobSystem> = Arc::new(jobs);
        let backend = Arc::new(LocalFileBackend::new(root, Arc::clone(&jobs)));
        let stack = StreamStack::standard(
            config,
            backend,
            archives,
            Arc::new(DecompressorSet::default()),
            jobs,
        );
        let mut streamer = Self::start(config, stack)?;
        streamer.runtime = runtime;
        Ok(streamer)
    }

    /// True when blocking file work runs on a runtime this streamer owns.
    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    /// Loads configuration from an INI file, then behaves like
    /// [`open_local`](Self::open_local).
    pub fn from_config_file(
        config_path: &Path,
        root: impl Into<PathBuf>,
        archives: Arc<dyn ArchiveLookup>,
    ) -> Result<Self, StreamerError> {
        let config = StreamerConfig::load_from(config_path)?;
        Self::open_local(&config, root, archives)
    }

    /// Returns a submitter that queues requests without going through the
    /// facade.
    pub fn submitter(&self) -> ContextSubmitter {
        self.submitter.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Returns an empty request builder.
    pub fn create_request(&self) -> PendingRequest {
        PendingRequest::new()
    }

    /// Queues a configured request.
    pub fn queue(&self, request: PendingRequest) -> Result<RequestHandle, StreamerError> {
        self.submitter.queue_external_request(request)
    }

    /// Queues a request and blocks until it finishes.
    ///
    /// Returns [`StreamerError::WaitOnSchedulerThread`] without queuing when
    /// called from the scheduler thread or a completion callback.
    pub fn start_and_wait(&self, request: PendingRequest) -> Result<RequestHandle, StreamerError> {
        if is_scheduler_thread() {
            return Err(StreamerError::WaitOnSchedulerThread);
        }
        let handle = self.queue(request)?;
        handle.wait_blocking()?;
        Ok(handle)
    }

    fn submit(
        &self,
        options: SubmitOptions,
        configure: impl FnOnce(&mut PendingRequest),
    ) -> Result<RequestHandle, StreamerError> {
        let mut request = PendingRequest::new();
        configure(&mut request);
        options.apply(&mut request);
        self.queue(request)
    }

    /// Reads `size` bytes at `offset`.
    pub fn read(
        &self,
        path: impl Into<RequestPath>,
        offset: u64,
        size: u64,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.read(path, offset, size);
        })
    }

    /// Reads a whole file.
    pub fn read_whole_file(
        &self,
        path: impl Into<RequestPath>,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.read_whole_file(path);
        })
    }

    /// Reads into a caller-owned buffer, handed back through
    /// [`RequestHandle::take_data`].
    pub fn read_into(
        &self,
        path: impl Into<RequestPath>,
        offset: u64,
        buffer: Vec<u8>,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        let size = buffer.len() as u64;
        self.submit(options, |r| {
            r.read(path, offset, size).with_buffer(buffer);
        })
    }

    /// Reads into a buffer provided by `allocator`.
    pub fn read_with_allocator(
        &self,
        path: impl Into<RequestPath>,
        offset: u64,
        size: u64,
        allocator: Arc<dyn BufferAllocator>,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.read(path, offset, size).with_allocator(allocator);
        })
    }

    /// Reads several ranges of one file into one contiguous buffer.
    pub fn read_ranges(
        &self,
        path: impl Into<RequestPath>,
        ranges: &[FileRange],
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.read_ranges(path, ranges);
        })
    }

    /// Pins `range` of `path` in the cache until destroyed.
    pub fn create_dedicated_cache(
        &self,
        path: impl Into<RequestPath>,
        range: FileRange,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.create_dedicated_cache(path, range);
        })
    }

    pub fn destroy_dedicated_cache(
        &self,
        path: impl Into<RequestPath>,
        range: FileRange,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.destroy_dedicated_cache(path, range);
        })
    }

    pub fn file_exists(
        &self,
        path: impl Into<RequestPath>,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.file_exists(path);
        })
    }

    pub fn file_metadata(
        &self,
        path: impl Into<RequestPath>,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.file_metadata(path);
        })
    }

    /// Cancels `target`. Takes effect only while the target is queued.
    pub fn cancel(&self, target: &RequestHandle) -> Result<RequestHandle, StreamerError> {
        self.submit(SubmitOptions::default(), |r| {
            r.cancel(target);
        })
    }

    /// Moves a queued request to new ordering keys.
    pub fn reschedule(
        &self,
        target: &RequestHandle,
        deadline: Deadline,
        priority: Priority,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(SubmitOptions::default(), |r| {
            r.reschedule(target, deadline, priority);
        })
    }

    /// Drops cached data for `path`. Pinned ranges survive.
    pub fn flush_cache(&self, path: impl Into<RequestPath>) -> Result<RequestHandle, StreamerError> {
        self.submit(SubmitOptions::default(), |r| {
            r.flush(path);
        })
    }

    pub fn flush_all(&self) -> Result<RequestHandle, StreamerError> {
        self.submit(SubmitOptions::default(), |r| {
            r.flush_all();
        })
    }

    /// Queues an opaque command for extension nodes.
    pub fn custom(
        &self,
        name: &'static str,
        payload: impl Any + Send,
        fail_when_unhandled: bool,
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.custom(name, payload, fail_when_unhandled);
        })
    }

    /// Collects a report snapshot from every node.
    pub fn report(&self, kind: ReportKind) -> Result<RequestHandle, StreamerError> {
        self.submit(SubmitOptions::default(), |r| {
            r.report(kind);
        })
    }

    /// Completes once every target has finished.
    pub fn wait_group(
        &self,
        targets: &[RequestHandle],
        options: SubmitOptions,
    ) -> Result<RequestHandle, StreamerError> {
        self.submit(options, |r| {
            r.wait_for(targets);
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops the scheduler and waits for it to drain.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        self.shutdown.cancel();
        self.submitter.wake();
        if handle.thread().id() == thread::current().id() {
            warn!("Streamer dropped on its own scheduler thread, not joining");
            if let Some(runtime) = self.runtime.take() {
                runtime.shutdown_background();
            }
            return;
        }
        if let Err(e) = handle.join() {
            warn!("Scheduler thread panicked: {:?}", e);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("Streamer stopped");
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("running", &self.is_running())
            .field("closed", &self.submitter.is_closed())
            .field("owns_runtime", &self.owns_runtime())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ArchiveIndex;
    use crate::request::RequestStatus;
    use crate::telemetry::NullTelemetrySink;

    fn empty_streamer() -> Streamer {
        Streamer::with_telemetry(
            &StreamerConfig::default(),
            StreamStack::new(),
            Arc::new(NullTelemetrySink),
        )
        .unwrap()
    }

    #[test]
    fn test_unclaimed_read_fails_and_flush_completes() {
        let streamer = empty_streamer();

        let read = streamer.read("a.bin", 0, 16, SubmitOptions::default()).unwrap();
        let flush = streamer.flush_cache("a.bin").unwrap();

        assert_eq!(read.wait_blocking().unwrap(), RequestStatus::Failed);
        assert_eq!(flush.wait_blocking().unwrap(), RequestStatus::Completed);
    }

    #[test]
    fn test_queue_after_shutdown_is_rejected() {
        let mut streamer = empty_streamer();
        let submitter = streamer.submitter();
        streamer.shutdown();

        assert!(!streamer.is_running());
        assert!(matches!(
            submitter.queue_external_request(PendingRequest::new()),
            Err(StreamerError::Stopped)
        ));
    }

    #[test]
    fn test_callback_runs_on_scheduler_thread() {
        let streamer = empty_streamer();
        let (tx, rx) = std::sync::mpsc::channel();
        let options = SubmitOptions::default().with_callback(move |handle| {
            let name = thread::current().name().map(str::to_string);
            let blocked = handle.wait_blocking().is_err();
            let _ = tx.send((name, blocked));
        });

        streamer.file_exists("missing.bin", options).unwrap();
        let (name, blocked) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some(SCHEDULER_THREAD_NAME));
        assert!(blocked, "blocking wait must be refused inside callbacks");
    }

    #[test]
    fn test_report_lists_scheduler_rows() {
        let streamer = empty_streamer();
        let handle = streamer.report(ReportKind::Queues).unwrap();
        assert_eq!(handle.wait_blocking().unwrap(), RequestStatus::Completed);

        let has_queue_row = handle
            .with_output(|output| {
                output
                    .report()
                    .is_some_and(|report| report.get("scheduler", "queued").is_some())
            })
            .unwrap_or(false);
        assert!(has_queue_row);
    }

    #[test]
    fn test_open_local_builds_runtime_outside_tokio() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.bin"), vec![7u8; 32]).unwrap();
        let mut streamer = Streamer::open_local(
            &StreamerConfig::default(),
            temp.path(),
            Arc::new(ArchiveIndex::new()),
        )
        .unwrap();
        assert!(streamer.owns_runtime());

        let read = streamer.read("a.bin", 8, 16, SubmitOptions::default()).unwrap();
        assert_eq!(read.wait_blocking().unwrap(), RequestStatus::Completed);
        assert_eq!(read.take_data(), Some(vec![7u8; 16]));

        streamer.shutdown();
        assert!(!streamer.owns_runtime());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_local_uses_ambient_runtime() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.bin"), vec![1u8; 8]).unwrap();
        let streamer = Streamer::open_local(
            &StreamerConfig::default(),
            temp.path(),
            Arc::new(ArchiveIndex::new()),
        )
        .unwrap();
        assert!(!streamer.owns_runtime());

        let read = streamer.read("a.bin", 0, 8, SubmitOptions::default()).unwrap();
        assert_eq!(read.wait().await, RequestStatus::Completed);
    }
}

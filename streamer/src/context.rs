//! Streamer context: the hand-off point between caller threads and the
//! scheduler thread.
//!
//! ```text
//!   caller threads                 backend / job threads
//!        │ queue_external_request        │ AsyncNotifier::notify
//!        ▼                               ▼
//!   ┌──────────────── Shared (mutex + condvar) ────────────────┐
//!   │   submissions: Vec<PendingRequest>                       │
//!   │   completions: Vec<AsyncCompletion>                      │
//!   └──────────────────────────┬───────────────────────────────┘
//!                              │ take_incoming (scheduler thread)
//!                              ▼
//!   StreamerContext: pool, pending ids, completed queue, link watchers
//! ```
//!
//! Only [`Shared`] is touched by more than one thread. Every other field of
//! [`StreamerContext`] is owned by the scheduler thread, which is also the
//! only thread that runs stack nodes and completion callbacks.

use crate::error::{PoolError, RequestError, StreamerError};
use crate::request::{
    Command, CommandKind, FileRequest, PendingRequest, RequestHandle, RequestId, RequestOutcome,
    RequestOutput, RequestPool, RequestStatus, Usage,
};
use crate::stack::StreamStackNode;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

thread_local! {
    static ON_SCHEDULER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Returns true when called on a streamer's scheduler thread, including
/// from inside a completion callback.
pub fn is_scheduler_thread() -> bool {
    ON_SCHEDULER_THREAD.with(Cell::get)
}

pub(crate) fn mark_scheduler_thread() {
    ON_SCHEDULER_THREAD.with(|flag| flag.set(true));
}

// =============================================================================
// Cross-thread plumbing
// =============================================================================

/// Result of work that finished off the scheduler thread.
#[derive(Debug)]
pub enum AsyncResult {
    /// A backend read, carrying the filled buffer.
    Read(io::Result<Vec<u8>>),
    /// A backend size query. `Ok(None)` means the file does not exist.
    FileSize(io::Result<Option<u64>>),
    /// A job-system work item, carrying its output bytes.
    Job(Result<Vec<u8>, RequestError>),
}

#[derive(Debug)]
pub(crate) struct AsyncCompletion {
    pub node: usize,
    pub token: u64,
    pub result: AsyncResult,
}

#[derive(Default)]
pub(crate) struct Incoming {
    pub submissions: Vec<PendingRequest>,
    pub completions: Vec<AsyncCompletion>,
    closed: bool,
}

impl Incoming {
    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty() && self.completions.is_empty()
    }
}

#[derive(Default)]
struct Shared {
    incoming: Mutex<Incoming>,
    wake: Condvar,
}

/// Thread-safe submission side of the context.
#[derive(Clone)]
pub struct ContextSubmitter {
    shared: Arc<Shared>,
}

impl ContextSubmitter {
    /// Enqueues a request for the scheduler and wakes it.
    ///
    /// The critical section is a push and a notify.
    pub fn queue_external_request(
        &self,
        request: PendingRequest,
    ) -> Result<RequestHandle, StreamerError> {
        let handle = request.handle();
        {
            let mut incoming = self.shared.incoming.lock();
            if incoming.closed {
                return Err(StreamerError::Stopped);
            }
            incoming.submissions.push(request);
        }
        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Returns true once the scheduler stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.shared.incoming.lock().closed
    }

    /// Wakes the scheduler without submitting anything.
    pub(crate) fn wake(&self) {
        self.shared.wake.notify_one();
    }
}

impl fmt::Debug for ContextSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSubmitter").finish_non_exhaustive()
    }
}

/// Posts the result of off-thread work back to the node that started it.
///
/// Results are delivered on the scheduler thread at the start of the next
/// tick, never on the thread that calls [`notify`](Self::notify).
pub struct AsyncNotifier {
    shared: Arc<Shared>,
    node: usize,
    token: u64,
}

impl AsyncNotifier {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn notify(self, result: AsyncResult) {
        self.shared.incoming.lock().completions.push(AsyncCompletion {
            node: self.node,
            token: self.token,
            result,
        });
        self.shared.wake.notify_one();
    }
}

impl fmt::Debug for AsyncNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncNotifier")
            .field("node", &self.node)
            .field("token", &self.token)
            .finish()
    }
}

// =============================================================================
// StreamerContext
// =============================================================================

/// Counters kept by the context for reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextStats {
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub callbacks: u64,
}

/// Scheduler-owned request state plus the shared submission queue.
pub struct StreamerContext {
    shared: Arc<Shared>,
    pool: RequestPool,
    next_pending_id: u64,
    /// Requests that reached a terminal status and await `main_update`.
    completed: VecDeque<RequestId>,
    /// External handle id → root request.
    external_index: HashMap<u64, RequestId>,
    /// External handle id → link requests waiting for it.
    link_watchers: HashMap<u64, Vec<RequestId>>,
    telemetry: Arc<dyn TelemetrySink>,
    now: Instant,
    current_node: usize,
    stats: ContextStats,
}

impl StreamerContext {
    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            pool: RequestPool::new(),
            next_pending_id: 0,
            completed: VecDeque::new(),
            external_index: HashMap::new(),
            link_watchers: HashMap::new(),
            telemetry,
            now: Instant::now(),
            current_node: 0,
            stats: ContextStats::default(),
        }
    }

    /// Returns a submitter that producer threads can use.
    pub fn submitter(&self) -> ContextSubmitter {
        ContextSubmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    // =========================================================================
    // Scheduler-side plumbing
    // =========================================================================

    pub(crate) fn begin_tick(&mut self) {
        self.now = Instant::now();
    }

    pub(crate) fn take_incoming(&mut self) -> Incoming {
        let mut incoming = self.shared.incoming.lock();
        Incoming {
            submissions: std::mem::take(&mut incoming.submissions),
            completions: std::mem::take(&mut incoming.completions),
            closed: incoming.closed,
        }
    }

    /// Stops accepting submissions and returns the ones still waiting.
    pub(crate) fn close_submissions(&mut self) -> Vec<PendingRequest> {
        let mut incoming = self.shared.incoming.lock();
        incoming.closed = true;
        std::mem::take(&mut incoming.submissions)
    }

    /// Parks the scheduler until something arrives or `timeout` passes.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut incoming = self.shared.incoming.lock();
        if incoming.is_empty() {
            self.shared.wake.wait_for(&mut incoming, timeout);
        }
    }

    pub(crate) fn enter(&mut self, node: usize) {
        self.current_node = node;
    }

    pub(crate) fn next_pending_id(&mut self) -> u64 {
        let id = self.next_pending_id;
        self.next_pending_id += 1;
        id
    }

    pub(crate) fn pool_mut(&mut self) -> &mut RequestPool {
        &mut self.pool
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    pub(crate) fn register_external(&mut self, handle: &RequestHandle, id: RequestId) {
        self.external_index.insert(handle.id(), id);
    }

    pub(crate) fn external(&self, handle: &RequestHandle) -> Option<RequestId> {
        self.external_index.get(&handle.id()).copied()
    }

    /// Completes `link` once `target` is finished.
    pub(crate) fn add_link_watcher(&mut self, target: &RequestHandle, link: RequestId) {
        if target.is_done() {
            self.complete(link);
        } else {
            self.link_watchers.entry(target.id()).or_default().push(link);
        }
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// Number of finished requests waiting for `main_update`.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Logs a pool error and fails fast in debug builds.
    pub(crate) fn report_pool_error(&self, err: PoolError) {
        error!(error = %err, "Request pool invariant violated");
        if cfg!(debug_assertions) {
            panic!("request pool invariant violated: {err}");
        }
    }

    // =========================================================================
    // Node-facing API
    // =========================================================================

    /// Time at the start of the current tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn request(&self, id: RequestId) -> Option<&FileRequest> {
        self.pool.get(id)
    }

    pub(crate) fn request_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        self.pool.get_mut(id)
    }

    /// Mutable access to a request's output buffer.
    pub fn data_mut(&mut self, id: RequestId) -> Option<&mut Vec<u8>> {
        self.pool.get_mut(id).map(|r| &mut r.data)
    }

    /// Moves a request's output buffer out, leaving it empty.
    pub fn take_data(&mut self, id: RequestId) -> Vec<u8> {
        self.pool
            .get_mut(id)
            .map(|r| std::mem::take(&mut r.data))
            .unwrap_or_default()
    }

    pub fn set_output(&mut self, id: RequestId, output: RequestOutput) {
        if let Some(request) = self.pool.get_mut(id) {
            request.output = output;
        }
    }

    pub fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }

    /// Returns a notifier that routes an off-thread result back to the node
    /// currently being run, tagged with `token`.
    pub fn async_notifier(&self, token: u64) -> AsyncNotifier {
        AsyncNotifier {
            shared: Arc::clone(&self.shared),
            node: self.current_node,
            token,
        }
    }

    /// Creates an internal child of `parent`, inheriting its ordering keys.
    ///
    /// `placement` is the offset in the parent's data buffer where the
    /// child's data is copied when it completes.
    pub fn create_child(
        &mut self,
        parent: RequestId,
        command: Command,
        placement: Option<usize>,
    ) -> Result<RequestId, PoolError> {
        let (deadline, priority, pending_id) = {
            let parent_request = self.pool.get(parent).ok_or(PoolError::StaleHandle(parent))?;
            (
                parent_request.deadline,
                parent_request.priority,
                parent_request.pending_id,
            )
        };

        let child = self.pool.create(Usage::Internal);
        if let Some(request) = self.pool.get_mut(child) {
            request.command = command;
            request.deadline = deadline;
            request.priority = priority;
            request.pending_id = pending_id;
            request.placement = placement;
            request.queued_at = Some(self.now);
        }

        if let Err(err) = self.pool.link_child(parent, child) {
            if let Some(request) = self.pool.get_mut(child) {
                request.advance(RequestStatus::Canceled);
            }
            if let Err(release_err) = self.pool.release(child) {
                self.report_pool_error(release_err);
                self.pool.isolate(child);
            }
            return Err(err);
        }
        Ok(child)
    }

    pub fn complete(&mut self, id: RequestId) {
        self.finish(id, RequestStatus::Completed, None);
    }

    pub fn complete_with(&mut self, id: RequestId, output: RequestOutput) {
        self.set_output(id, output);
        self.finish(id, RequestStatus::Completed, None);
    }

    pub fn fail(&mut self, id: RequestId, error: RequestError) {
        self.finish(id, RequestStatus::Failed, Some(error));
    }

    pub fn cancel(&mut self, id: RequestId) {
        self.finish(id, RequestStatus::Canceled, None);
    }

    /// Finishes a request whose children have all resolved: Failed if any
    /// child failed, Canceled if any was canceled, Completed otherwise.
    pub fn finish_from_children(&mut self, id: RequestId) {
        let Some(request) = self.pool.get(id) else {
            self.report_pool_error(PoolError::StaleHandle(id));
            return;
        };
        if let Some(err) = request.child_error.clone() {
            self.fail(id, err);
        } else if request.child_canceled {
            self.cancel(id);
        } else {
            self.complete(id);
        }
    }

    /// Applies the fail-when-unhandled policy to a request no node claimed.
    pub(crate) fn finish_unhandled(&mut self, id: RequestId) {
        let Some(request) = self.pool.get_mut(id) else {
            return;
        };
        let kind = request.command.kind();
        if request.command.fail_when_unhandled() {
            trace!(request = %id, command = %kind, "Unhandled request failed");
            self.fail(id, RequestError::Unhandled { command: kind });
            return;
        }
        if kind == CommandKind::FileExistsCheck && request.output == RequestOutput::None {
            request.output = RequestOutput::Exists(false);
        }
        self.complete(id);
    }

    /// Returns true if a cancel was requested for `id` or any ancestor.
    pub fn is_canceled(&self, id: RequestId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(request) = self.pool.get(id) else {
                return false;
            };
            if request.cancel_requested {
                return true;
            }
            current = request.parent;
        }
        false
    }

    /// Records a completion estimate on a request and its immediate parent.
    pub fn set_estimated_completion(&mut self, id: RequestId, at: Instant) {
        let parent = match self.pool.get_mut(id) {
            Some(request) => {
                request.estimated_completion = Some(at);
                if let Some(handle) = request.handle() {
                    handle.set_estimated_completion(at);
                }
                request.parent
            }
            None => return,
        };
        if let Some(parent) = parent.and_then(|p| self.pool.get_mut(p)) {
            let later = parent.estimated_completion.map_or(at, |e| e.max(at));
            parent.estimated_completion = Some(later);
            if let Some(handle) = parent.handle() {
                handle.set_estimated_completion(later);
            }
        }
    }

    /// Moves a request to a terminal status and schedules it for
    /// `main_update`. Finishing a request twice is a programmer error.
    fn finish(&mut self, id: RequestId, status: RequestStatus, error: Option<RequestError>) {
        let Some(request) = self.pool.get_mut(id) else {
            self.report_pool_error(PoolError::StaleHandle(id));
            return;
        };
        if !request.advance(status) {
            let current = request.status;
            error!(request = %id, status = %current, "Request finished twice");
            if cfg!(debug_assertions) {
                panic!("request {id} finished twice");
            }
            return;
        }
        if request.dependencies > 0 {
            error!(
                request = %id,
                dependencies = request.dependencies,
                "Request finished with outstanding children"
            );
        }
        request.error = error;
        match status {
            RequestStatus::Completed => self.stats.completed += 1,
            RequestStatus::Failed => self.stats.failed += 1,
            _ => self.stats.canceled += 1,
        }
        self.completed.push_back(id);
    }

    // =========================================================================
    // main_update
    // =========================================================================

    /// Retires every finished request: publishes external outcomes, runs
    /// callbacks, merges children into parents, finalizes parents whose last
    /// child resolved and recycles slots.
    ///
    /// Runs on the scheduler thread only, once per tick. Returns true if any
    /// request was retired.
    pub fn main_update(&mut self, nodes: &mut [Box<dyn StreamStackNode>]) -> bool {
        let mut progressed = false;
        while let Some(id) = self.completed.pop_front() {
            progressed = true;
            self.retire(id, nodes);
        }
        progressed
    }

    fn retire(&mut self, id: RequestId, nodes: &mut [Box<dyn StreamStackNode>]) {
        let Some(request) = self.pool.get_mut(id) else {
            self.report_pool_error(PoolError::StaleHandle(id));
            return;
        };
        let parent = request.parent;

        if let Usage::External(handle) = &request.usage {
            let handle = handle.clone();
            let kind = request.command.kind();
            let duration = request
                .queued_at
                .map(|at| self.now.saturating_duration_since(at))
                .unwrap_or_default();
            let callback = request.callback.take();
            let outcome = build_outcome(request);
            let status = outcome.status;

            self.external_index.remove(&handle.id());
            if !handle.finish(outcome) {
                error!(request = %handle, "External request published twice");
            }
            self.telemetry.emit(TelemetryEvent::RequestCompleted {
                handle_id: handle.id(),
                command: kind,
                status,
                duration,
            });
            if let Some(callback) = callback {
                self.stats.callbacks += 1;
                callback(&handle);
            }
            if let Some(links) = self.link_watchers.remove(&handle.id()) {
                for link in links {
                    if self.pool.contains(link) {
                        self.complete(link);
                    }
                }
            }
        }

        if let Some(parent) = parent {
            let handler = self.pool.get(parent).and_then(|p| p.handler);
            if let Some(handler) = handler {
                if let Some(node) = nodes.get_mut(handler) {
                    self.enter(handler);
                    node.on_child_completed(self, parent, id);
                }
            }
            self.merge_into_parent(id, parent);

            match self.pool.complete_child(id) {
                Ok(Some((parent, true))) => {
                    let parent_done = self
                        .pool
                        .get(parent)
                        .map_or(true, |p| p.status.is_terminal());
                    if !parent_done {
                        match handler.and_then(|h| nodes.get_mut(h).map(|node| (h, node))) {
                            Some((h, node)) => {
                                self.enter(h);
                                node.finalize_request(self, parent);
                            }
                            None => self.finish_from_children(parent),
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => self.report_pool_error(err),
            }
        }

        if let Err(err) = self.pool.release(id) {
            self.report_pool_error(err);
            self.pool.isolate(id);
        }
    }

    /// Copies a completed child's data into its parent at the child's
    /// placement and records failed or canceled children on the parent.
    fn merge_into_parent(&mut self, child: RequestId, parent: RequestId) {
        let Some(child_request) = self.pool.get_mut(child) else {
            return;
        };
        let status = child_request.status;
        let error = child_request.error.clone();
        let placed = match (status, child_request.placement) {
            (RequestStatus::Completed, Some(offset)) => {
                Some((offset, std::mem::take(&mut child_request.data)))
            }
            _ => None,
        };

        let Some(parent_request) = self.pool.get_mut(parent) else {
            return;
        };
        match status {
            RequestStatus::Failed => {
                if parent_request.child_error.is_none() {
                    parent_request.child_error = error;
                }
            }
            RequestStatus::Canceled => parent_request.child_canceled = true,
            _ => {}
        }
        if let Some((offset, data)) = placed {
            let end = offset + data.len();
            if parent_request.data.len() < end {
                parent_request.data.resize(end, 0);
            }
            parent_request.data[offset..end].copy_from_slice(&data);
        }
    }
}

/// Builds the caller-visible outcome, moving read data out of the request.
fn build_outcome(request: &mut FileRequest) -> RequestOutcome {
    match request.status {
        RequestStatus::Completed => {
            let output = match std::mem::take(&mut request.output) {
                RequestOutput::None
                    if matches!(
                        request.command.kind(),
                        CommandKind::Read | CommandKind::CompressedRead | CommandKind::PathStore
                    ) =>
                {
                    RequestOutput::Data(std::mem::take(&mut request.data))
                }
                other => other,
            };
            RequestOutcome::completed(output)
        }
        RequestStatus::Failed => RequestOutcome::failed(request.error.clone().unwrap_or(
            RequestError::Unhandled {
                command: request.command.kind(),
            },
        )),
        _ => RequestOutcome::canceled(),
    }
}

impl fmt::Debug for StreamerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerContext")
            .field("live_requests", &self.pool.live_count())
            .field("completed", &self.completed.len())
            .field("external", &self.external_index.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReadData;
    use crate::telemetry::NullTelemetrySink;

    fn context() -> StreamerContext {
        StreamerContext::new(Arc::new(NullTelemetrySink))
    }

    fn root(ctx: &mut StreamerContext) -> (RequestId, RequestHandle) {
        let handle = RequestHandle::new();
        let id = ctx.pool_mut().create(Usage::External(handle.clone()));
        ctx.request_mut(id).unwrap().command =
            Command::Read(ReadData::new("a.bin".into(), 0, Some(8)));
        ctx.register_external(&handle, id);
        (id, handle)
    }

    #[test]
    fn test_scheduler_thread_flag_is_thread_local() {
        assert!(!is_scheduler_thread());
        std::thread::spawn(|| {
            mark_scheduler_thread();
            assert!(is_scheduler_thread());
        })
        .join()
        .unwrap();
        assert!(!is_scheduler_thread());
    }

    #[test]
    fn test_submitter_rejects_after_close() {
        let mut ctx = context();
        let submitter = ctx.submitter();
        submitter.queue_external_request(PendingRequest::new()).unwrap();

        let waiting = ctx.close_submissions();
        assert_eq!(waiting.len(), 1);
        assert!(matches!(
            submitter.queue_external_request(PendingRequest::new()),
            Err(StreamerError::Stopped)
        ));
    }

    #[test]
    fn test_child_data_lands_at_placement() {
        let mut ctx = context();
        let (parent, handle) = root(&mut ctx);
        ctx.data_mut(parent).unwrap().resize(8, 0);

        let left = ctx
            .create_child(parent, Command::FlushAll, Some(0))
            .unwrap();
        let right = ctx
            .create_child(parent, Command::FlushAll, Some(4))
            .unwrap();
        *ctx.data_mut(left).unwrap() = vec![1, 2, 3, 4];
        *ctx.data_mut(right).unwrap() = vec![5, 6, 7, 8];
        ctx.complete(right);
        ctx.complete(left);

        ctx.main_update(&mut []);

        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(handle.take_data(), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(ctx.pool().live_count(), 0);
    }

    #[test]
    fn test_failed_child_fails_parent() {
        let mut ctx = context();
        let (parent, handle) = root(&mut ctx);
        let child = ctx.create_child(parent, Command::FlushAll, None).unwrap();
        ctx.fail(
            child,
            RequestError::NotFound {
                path: "a.bin".into(),
            },
        );

        ctx.main_update(&mut []);

        assert_eq!(handle.status(), RequestStatus::Failed);
        assert!(matches!(handle.error(), Some(RequestError::NotFound { .. })));
    }

    #[test]
    fn test_parent_callback_after_children() {
        let mut ctx = context();
        let (parent, handle) = root(&mut ctx);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        ctx.request_mut(parent).unwrap().callback = Some(Box::new(move |_| {
            seen.lock().push("parent");
        }));

        let child = ctx.create_child(parent, Command::FlushAll, None).unwrap();
        assert_eq!(ctx.request(parent).unwrap().dependencies(), 1);
        ctx.complete(child);
        ctx.main_update(&mut []);

        assert_eq!(*order.lock(), vec!["parent"]);
        assert!(handle.is_done());
    }

    #[test]
    fn test_is_canceled_walks_ancestors() {
        let mut ctx = context();
        let (parent, _handle) = root(&mut ctx);
        let child = ctx.create_child(parent, Command::FlushAll, None).unwrap();
        assert!(!ctx.is_canceled(child));
        ctx.request_mut(parent).unwrap().cancel_requested = true;
        assert!(ctx.is_canceled(child));
    }

    #[test]
    fn test_estimate_propagates_to_parent() {
        let mut ctx = context();
        let (parent, handle) = root(&mut ctx);
        let child = ctx.create_child(parent, Command::FlushAll, None).unwrap();
        let at = Instant::now() + Duration::from_millis(30);
        ctx.set_estimated_completion(child, at);

        assert_eq!(ctx.request(parent).unwrap().estimated_completion(), Some(at));
        assert_eq!(handle.estimated_completion(), Some(at));
    }

    #[test]
    fn test_link_watcher_completes_when_target_finishes() {
        let mut ctx = context();
        let (target, target_handle) = root(&mut ctx);

        let wait_handle = RequestHandle::new();
        let wait = ctx.pool_mut().create(Usage::External(wait_handle.clone()));
        ctx.request_mut(wait).unwrap().command = Command::Wait;
        let link = ctx
            .create_child(
                wait,
                Command::ExternalLink(crate::request::TargetData {
                    target: target_handle.clone(),
                }),
                None,
            )
            .unwrap();
        ctx.add_link_watcher(&target_handle, link);

        ctx.cancel(target);
        ctx.main_update(&mut []);

        assert_eq!(target_handle.status(), RequestStatus::Canceled);
        assert_eq!(wait_handle.status(), RequestStatus::Completed);
    }
}

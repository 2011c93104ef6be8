//! External request handles.
//!
//! A [`RequestHandle`] is the caller's view of an externally observable
//! request. It is reference counted: clones share one state block, and the
//! context holds its own clone while the request is being processed, so the
//! last reference can never be dropped while work is still in flight.
//!
//! ```text
//!   caller thread                       scheduler thread
//!   ─────────────                       ────────────────
//!   handle.status()  ◄── watch ───────  set_status(Queued/Processing)
//!   handle.wait()    ◄── watch ───────  finish(outcome)
//!   handle.wait_blocking() ◄─ condvar ┘
//! ```

use super::outcome::{RequestOutcome, RequestOutput};
use super::status::RequestStatus;
use crate::context::is_scheduler_thread;
use crate::error::{RequestError, StreamerError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind every clone of a [`RequestHandle`].
struct ExternalState {
    id: u64,
    status_tx: watch::Sender<RequestStatus>,
    outcome: Mutex<Option<RequestOutcome>>,
    finished: Condvar,
    cancel_requested: AtomicBool,
    estimated_completion: Mutex<Option<Instant>>,
}

/// Reference-counted handle to an external request.
///
/// Cloneable and `Send + Sync`; all clones refer to the same request.
#[derive(Clone)]
pub struct RequestHandle(Arc<ExternalState>);

impl RequestHandle {
    pub(crate) fn new() -> Self {
        let (status_tx, _) = watch::channel(RequestStatus::Pending);
        Self(Arc::new(ExternalState {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            status_tx,
            outcome: Mutex::new(None),
            finished: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            estimated_completion: Mutex::new(None),
        }))
    }

    /// Returns the handle's process-unique id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Returns the most recent status without blocking.
    pub fn status(&self) -> RequestStatus {
        *self.0.status_tx.borrow()
    }

    /// Returns true once the request has reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns true if a cancel was issued after the request left the queue.
    ///
    /// The request may still complete successfully; the flag lets callers
    /// tell that the result is no longer wanted.
    pub fn cancel_requested(&self) -> bool {
        self.0.cancel_requested.load(Ordering::Acquire)
    }

    /// Returns the scheduler's most recent completion estimate.
    pub fn estimated_completion(&self) -> Option<Instant> {
        *self.0.estimated_completion.lock()
    }

    /// Returns the error of a failed request.
    pub fn error(&self) -> Option<RequestError> {
        self.0
            .outcome
            .lock()
            .as_ref()
            .and_then(|outcome| outcome.error.clone())
    }

    /// Takes the read data out of a completed request.
    ///
    /// Returns `None` if the request hasn't finished, produced no data, or the
    /// data was already taken.
    pub fn take_data(&self) -> Option<Vec<u8>> {
        let mut guard = self.0.outcome.lock();
        let outcome = guard.as_mut()?;
        match std::mem::take(&mut outcome.output) {
            RequestOutput::Data(data) => Some(data),
            other => {
                outcome.output = other;
                None
            }
        }
    }

    /// Takes the full output of a finished request, leaving `None` behind.
    pub fn take_output(&self) -> Option<RequestOutput> {
        let mut guard = self.0.outcome.lock();
        guard
            .as_mut()
            .map(|outcome| std::mem::take(&mut outcome.output))
    }

    /// Applies `f` to the output of a finished request.
    pub fn with_output<R>(&self, f: impl FnOnce(&RequestOutput) -> R) -> Option<R> {
        self.0.outcome.lock().as_ref().map(|outcome| f(&outcome.output))
    }

    /// Waits for the request to reach a terminal status.
    pub async fn wait(&self) -> RequestStatus {
        let mut rx = self.0.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Blocks the calling thread until the request reaches a terminal status.
    ///
    /// Must not be called from the scheduler thread or from a completion
    /// callback, both of which run on the thread that would have to finish
    /// the request. Doing so returns [`StreamerError::WaitOnSchedulerThread`].
    pub fn wait_blocking(&self) -> Result<RequestStatus, StreamerError> {
        if is_scheduler_thread() {
            return Err(StreamerError::WaitOnSchedulerThread);
        }
        let mut guard = self.0.outcome.lock();
        while guard.is_none() {
            self.0.finished.wait(&mut guard);
        }
        Ok(guard.as_ref().map(|o| o.status).unwrap_or_default())
    }

    // =========================================================================
    // Scheduler-side updates
    // =========================================================================

    /// Publishes a non-terminal status. Regressions are ignored.
    pub(crate) fn set_status(&self, status: RequestStatus) {
        self.0.status_tx.send_if_modified(|current| {
            if current.can_advance_to(status) && *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    /// Stores the outcome and publishes the terminal status.
    ///
    /// Returns false if the request was already finished.
    pub(crate) fn finish(&self, outcome: RequestOutcome) -> bool {
        let status = outcome.status;
        {
            let mut guard = self.0.outcome.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(outcome);
            self.0.finished.notify_all();
        }
        self.0.status_tx.send_replace(status);
        true
    }

    pub(crate) fn mark_cancel_requested(&self) {
        self.0.cancel_requested.store(true, Ordering::Release);
    }

    pub(crate) fn set_estimated_completion(&self, estimate: Instant) {
        *self.0.estimated_completion.lock() = Some(estimate);
    }

    /// Number of live references, including the context's own.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RequestHandle {}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.0.id)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ids_are_unique() {
        let a = RequestHandle::new();
        let b = RequestHandle::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_never_regresses() {
        let handle = RequestHandle::new();
        handle.set_status(RequestStatus::Processing);
        handle.set_status(RequestStatus::Queued);
        assert_eq!(handle.status(), RequestStatus::Processing);
    }

    #[test]
    fn test_finish_only_once() {
        let handle = RequestHandle::new();
        assert!(handle.finish(RequestOutcome::completed(RequestOutput::Data(vec![1, 2]))));
        assert!(!handle.finish(RequestOutcome::canceled()));
        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(handle.take_data(), Some(vec![1, 2]));
        assert_eq!(handle.take_data(), None);
    }

    #[test]
    fn test_take_data_leaves_other_outputs() {
        let handle = RequestHandle::new();
        handle.finish(RequestOutcome::completed(RequestOutput::Exists(true)));
        assert_eq!(handle.take_data(), None);
        assert_eq!(
            handle.with_output(|output| output.exists()),
            Some(Some(true))
        );
    }

    #[test]
    fn test_wait_blocking_wakes_on_finish() {
        let handle = RequestHandle::new();
        let finisher = handle.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            finisher.finish(RequestOutcome::failed(RequestError::Job("boom".into())));
        });

        let status = handle.wait_blocking().expect("not on scheduler thread");
        assert_eq!(status, RequestStatus::Failed);
        assert_eq!(handle.error(), Some(RequestError::Job("boom".into())));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_wait() {
        let handle = RequestHandle::new();
        let finisher = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            finisher.set_status(RequestStatus::Processing);
            finisher.finish(RequestOutcome::completed(RequestOutput::None));
        });

        assert_eq!(handle.wait().await, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_done() {
        let handle = RequestHandle::new();
        handle.finish(RequestOutcome::canceled());
        assert_eq!(handle.wait().await, RequestStatus::Canceled);
    }
}

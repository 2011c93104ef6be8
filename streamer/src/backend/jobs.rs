//! Job system used for blocking reads and CPU-bound decompression.
//!
//! Jobs are fire-and-forget closures. Each submission returns a
//! [`JobToken`] that other jobs can depend on through
//! [`JobSystem::run_after`], so a group of block jobs can be followed by a
//! single assembly job without the scheduler thread ever waiting.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// A unit of work for the job system.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion latch for a submitted job.
#[derive(Clone, Default)]
pub struct JobToken {
    latch: Arc<Latch>,
}

#[derive(Default)]
struct Latch {
    done: Mutex<bool>,
    signal: Condvar,
}

impl JobToken {
    /// Returns a token that is already complete.
    pub fn completed() -> Self {
        let token = Self::default();
        token.set();
        token
    }

    pub fn is_done(&self) -> bool {
        *self.latch.done.lock()
    }

    /// Blocks the calling thread until the job finished.
    ///
    /// Only job threads wait on tokens; the scheduler thread never does.
    pub fn wait(&self) {
        let mut done = self.latch.done.lock();
        while !*done {
            self.latch.signal.wait(&mut done);
        }
    }

    fn set(&self) {
        *self.latch.done.lock() = true;
        self.latch.signal.notify_all();
    }
}

impl fmt::Debug for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobToken")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Runs jobs off the scheduler thread.
pub trait JobSystem: Send + Sync + 'static {
    /// Submits a job.
    fn run(&self, job: Job) -> JobToken;

    /// Submits a job that starts once every token in `dependencies` is done.
    fn run_after(&self, job: Job, dependencies: Vec<JobToken>) -> JobToken;

    /// Returns the name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Tokio
// ============================================================================

/// Job system backed by tokio's blocking thread pool.
#[derive(Clone, Debug)]
pub struct TokioJobSystem {
    handle: Handle,
}

impl TokioJobSystem {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl JobSystem for TokioJobSystem {
    fn run(&self, job: Job) -> JobToken {
        let token = JobToken::default();
        let done = token.clone();
        self.handle.spawn_blocking(move || {
            job();
            done.set();
        });
        token
    }

    fn run_after(&self, job: Job, dependencies: Vec<JobToken>) -> JobToken {
        let token = JobToken::default();
        let done = token.clone();
        self.handle.spawn_blocking(move || {
            for dependency in &dependencies {
                dependency.wait();
            }
            job();
            done.set();
        });
        token
    }

    fn name(&self) -> &str {
        "tokio"
    }
}

// ============================================================================
// Inline
// ============================================================================

/// Runs every job immediately on the submitting thread.
///
/// Results still travel through the context's completion queue, so nodes
/// observe them on the next tick exactly as with a threaded job system.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineJobSystem;

impl JobSystem for InlineJobSystem {
    fn run(&self, job: Job) -> JobToken {
        job();
        JobToken::completed()
    }

    fn run_after(&self, job: Job, dependencies: Vec<JobToken>) -> JobToken {
        // Inline jobs finish before run() returns, so dependencies are done.
        debug_assert!(dependencies.iter().all(JobToken::is_done));
        job();
        JobToken::completed()
    }

    fn name(&self) -> &str {
        "inline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_inline_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let token = InlineJobSystem.run(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(token.is_done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_run_after_waits_for_dependencies() {
        let jobs = TokioJobSystem::current().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            jobs.run(Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                order.lock().push("block");
            }))
        };
        let last = {
            let order = Arc::clone(&order);
            jobs.run_after(
                Box::new(move || order.lock().push("assemble")),
                vec![first],
            )
        };

        let waiter = last.clone();
        tokio::task::spawn_blocking(move || waiter.wait())
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec!["block", "assemble"]);
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(TokioJobSystem::current().is_none());
    }
}

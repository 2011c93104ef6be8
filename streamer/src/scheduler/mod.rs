//! Scheduler: the single thread that drives the stream stack.
//!
//! Every tick runs three phases:
//!
//! ```text
//!   1. ingest     completions → owning node, submissions → ordered queue
//!   2. pump       prepare all nodes, dispatch queued requests through the
//!                 node chain while slots allow, execute all nodes
//!   3. retire     context.main_update: outcomes, callbacks, recycling
//! ```
//!
//! Handler methods are split across modules:
//! - `ingest`: admission by queue class, cancel and reschedule
//! - `dispatch`: ordered dispatch, node walk, reports

mod dispatch;
mod ingest;
pub mod queue;

use crate::config::SchedulerSettings;
use crate::context::{ContextSubmitter, StreamerContext};
use crate::request::RequestId;
use crate::stack::{StreamStack, StreamStackNode};
use crate::telemetry::{NullTelemetrySink, TelemetrySink};
use queue::OrderedQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest time shutdown waits for in-flight requests to drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SchedulerStats {
    pub ticks: u64,
    pub submitted: u64,
    pub dispatched: u64,
    pub unhandled: u64,
    pub cancels_applied: u64,
    pub reschedules_applied: u64,
    pub not_applied: u64,
    pub reports: u64,
}

/// Owns the context, the node chain and the global ordered queue.
pub struct Scheduler {
    pub(crate) context: StreamerContext,
    pub(crate) nodes: Vec<Box<dyn StreamStackNode>>,
    pub(crate) queue: OrderedQueue<RequestId>,
    /// Container roots → their queued children, for cancel and reschedule.
    pub(crate) containers: HashMap<RequestId, Vec<RequestId>>,
    pub(crate) settings: SchedulerSettings,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) stats: SchedulerStats,
}

impl Scheduler {
    /// Creates a scheduler and the submitter callers use to reach it.
    pub fn new(settings: SchedulerSettings, stack: StreamStack) -> (Self, ContextSubmitter) {
        Self::with_telemetry(settings, stack, Arc::new(NullTelemetrySink))
    }

    /// Creates a scheduler with a telemetry sink.
    pub fn with_telemetry(
        settings: SchedulerSettings,
        stack: StreamStack,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, ContextSubmitter) {
        let context = StreamerContext::new(Arc::clone(&telemetry));
        let submitter = context.submitter();
        let scheduler = Self {
            context,
            nodes: stack.into_nodes(),
            queue: OrderedQueue::new(),
            containers: HashMap::new(),
            settings,
            telemetry,
            stats: SchedulerStats::default(),
        };
        (scheduler, submitter)
    }

    pub fn context(&self) -> &StreamerContext {
        &self.context
    }

    /// Requests waiting in the ordered queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Requests alive in the pool, queued or in flight.
    pub fn live_requests(&self) -> usize {
        self.context.pool().live_count()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.live_requests() == 0
    }

    /// Runs one tick. Returns true if anything happened.
    pub fn tick(&mut self) -> bool {
        self.context.begin_tick();
        self.stats.ticks += 1;

        // Phase 1: ingest.
        let incoming = self.context.take_incoming();
        let mut progressed = !incoming.is_empty();
        for completion in incoming.completions {
            let Some(node) = self.nodes.get_mut(completion.node) else {
                warn!(node = completion.node, token = completion.token, "Completion for unknown node");
                continue;
            };
            self.context.enter(completion.node);
            node.on_async_completion(&mut self.context, completion.token, completion.result);
        }
        for pending in incoming.submissions {
            self.ingest(pending);
        }

        // Phase 2: pump the stack.
        for (index, node) in self.nodes.iter_mut().enumerate() {
            self.context.enter(index);
            node.prepare_requests(&mut self.context);
        }
        progressed |= self.dispatch();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            self.context.enter(index);
            progressed |= node.execute_requests(&mut self.context);
        }

        // Phase 3: retire.
        progressed |= self.context.main_update(&mut self.nodes);

        if !self.containers.is_empty() {
            let pool = self.context.pool();
            self.containers.retain(|root, _| pool.contains(*root));
        }
        progressed
    }

    /// Ticks until nothing happens or `max_ticks` is reached. Returns the
    /// number of ticks that made progress.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
        let mut busy = 0;
        for _ in 0..max_ticks {
            if !self.tick() {
                break;
            }
            busy += 1;
        }
        busy
    }

    /// Scheduler thread body: ticks until `shutdown` fires, then drains.
    pub fn run(mut self, shutdown: CancellationToken) {
        info!(stack = ?self.node_names(), "Scheduler started");
        while !shutdown.is_cancelled() {
            if !self.tick() {
                self.context.wait_for_work(self.settings.idle_wait());
            }
        }
        self.drain();
        info!(
            ticks = self.stats.ticks,
            dispatched = self.stats.dispatched,
            "Scheduler stopped"
        );
    }

    /// Stops admissions, cancels everything still queued and ticks until
    /// in-flight requests finish or the drain timeout passes.
    fn drain(&mut self) {
        let leftovers = self.context.close_submissions();
        debug!(leftovers = leftovers.len(), queued = self.queue.len(), "Draining scheduler");
        for pending in leftovers {
            self.ingest(pending);
        }
        while let Some((_, id)) = self.queue.pop() {
            self.context.cancel(id);
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.live_requests() > 0 {
            if Instant::now() >= deadline {
                warn!(live = self.live_requests(), "Drain timed out with requests in flight");
                break;
            }
            if !self.tick() {
                self.context.wait_for_work(self.settings.idle_wait());
            }
        }
    }

    fn node_names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|node| node.name()).collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("nodes", &self.node_names())
            .field("queued", &self.queue.len())
            .field("live", &self.live_requests())
            .finish()
    }
}

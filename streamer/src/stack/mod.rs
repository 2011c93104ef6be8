//! The stream stack: an ordered list of nodes the scheduler walks for every
//! dispatched request.
//!
//! ```text
//!   request ──► [0] CacheNode ──► [1] ArchiveNode ──► [2] CompressionNode ──► [3] DeviceNode
//!                  │ Handled        │ Split (CompressedRead child)
//!                  │ Split (gaps)   │ Declined (loose file)
//!                  ▼                ▼
//!             children continue at the next node down
//! ```
//!
//! The chain is data, not control flow: nodes never call each other. A node
//! answers [`StreamStackNode::try_handle`] with one of three outcomes:
//!
//! - [`NodeOutcome::Handled`]: the node owns the request and finishes it now
//!   or on a later tick
//! - [`NodeOutcome::Split`]: the node created children; the scheduler offers
//!   them to the nodes below, and calls [`StreamStackNode::finalize_request`]
//!   once the last child resolved
//! - [`NodeOutcome::Declined`]: the next node gets a try; if nobody claims the
//!   request its fail-when-unhandled policy decides the result
//!
//! All node methods run on the scheduler thread, so node state needs no
//! locking.

mod archive;
mod cache;
mod compression;
mod device;

pub use archive::ArchiveNode;
pub use cache::CacheNode;
pub use compression::CompressionNode;
pub use device::DeviceNode;

use crate::backend::{ArchiveLookup, Decompressor, JobSystem, StorageBackend};
use crate::config::StreamerConfig;
use crate::context::{AsyncResult, StreamerContext};
use crate::report::StreamerReport;
use crate::request::{FileRequest, ReportKind, RequestId};
use std::sync::Arc;
use std::time::Duration;

/// Result of offering a request to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Handled,
    Declined,
    Split(Vec<RequestId>),
}

/// One stage of the stream stack.
pub trait StreamStackNode: Send {
    /// Returns the node name for logging and reports.
    fn name(&self) -> &'static str;

    /// Called once per tick before any dispatch.
    fn prepare_requests(&mut self, _ctx: &mut StreamerContext) {}

    /// Offers a dispatched request to this node.
    fn try_handle(&mut self, ctx: &mut StreamerContext, id: RequestId) -> NodeOutcome;

    /// Called once per tick after dispatch. Returns true if work was done.
    fn execute_requests(&mut self, _ctx: &mut StreamerContext) -> bool {
        false
    }

    /// Called when a child of a request this node split has finished, before
    /// the child's data is merged into the parent.
    fn on_child_completed(&mut self, _ctx: &mut StreamerContext, _parent: RequestId, _child: RequestId) {}

    /// Called when the last child of a request this node split has resolved.
    fn finalize_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        ctx.finish_from_children(id);
    }

    /// Receives the result of work this node started through an
    /// [`AsyncNotifier`](crate::context::AsyncNotifier).
    fn on_async_completion(&mut self, _ctx: &mut StreamerContext, _token: u64, _result: AsyncResult) {}

    /// Expected time for this node to finish `request`, if it can tell.
    fn estimated_request_duration(&self, _request: &FileRequest) -> Option<Duration> {
        None
    }

    /// How many more requests the node wants this tick. `None` is unlimited.
    fn available_request_slots(&self) -> Option<usize> {
        None
    }

    /// Adds this node's rows to a report.
    fn collect_report(&self, _kind: ReportKind, _report: &mut StreamerReport) {}
}

/// Builder for the ordered node list handed to the scheduler.
#[derive(Default)]
pub struct StreamStack {
    nodes: Vec<Box<dyn StreamStackNode>>,
}

impl StreamStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node below the ones already added.
    pub fn push(mut self, node: impl StreamStackNode + 'static) -> Self {
        self.nodes.push(Box::new(node));
        self
    }

    /// Builds cache, archive, compression and device nodes from `config`.
    ///
    /// The cache node is left out when `[cache] enabled = false`.
    pub fn standard(
        config: &StreamerConfig,
        backend: Arc<dyn StorageBackend>,
        archives: Arc<dyn ArchiveLookup>,
        decompressor: Arc<dyn Decompressor>,
        jobs: Arc<dyn JobSystem>,
    ) -> Self {
        let mut stack = Self::new();
        if config.cache.enabled {
            stack = stack.push(CacheNode::new(&config.cache));
        }
        stack
            .push(ArchiveNode::new(archives))
            .push(CompressionNode::new(decompressor, jobs))
            .push(DeviceNode::new(backend, &config.device))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|node| node.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn into_nodes(self) -> Vec<Box<dyn StreamStackNode>> {
        self.nodes
    }
}

impl std::fmt::Debug for StreamStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArchiveIndex, DecompressorSet, InlineJobSystem, LocalFileBackend};

    fn stack(config: &StreamerConfig) -> StreamStack {
        let jobs: Arc<dyn JobSystem> = Arc::new(InlineJobSystem);
        StreamStack::standard(
            config,
            Arc::new(LocalFileBackend::new("/tmp", Arc::clone(&jobs))),
            Arc::new(ArchiveIndex::new()),
            Arc::new(DecompressorSet::default()),
            jobs,
        )
    }

    #[test]
    fn test_standard_order() {
        let stack = stack(&StreamerConfig::default());
        assert_eq!(stack.names(), vec!["cache", "archive", "compression", "device"]);
    }

    #[test]
    fn test_cache_can_be_disabled() {
        let mut config = StreamerConfig::default();
        config.cache.enabled = false;
        assert_eq!(stack(&config).names(), vec!["archive", "compression", "device"]);
    }
}

//! Request arena and recycle pool.
//!
//! Every request the scheduler works on lives in a slot of the
//! [`RequestPool`]. Slots are addressed by [`RequestId`], an index plus a
//! generation. Parent links are ids, not references: a child names its
//! parent, and the parent's `dependencies` counter records how many children
//! are still outstanding.
//!
//! ```text
//!   slots: [ A(gen 3) ][ B(gen 1, in bin) ][ C(gen 2) ] ...
//!   free:  [ 1 ]  ← LIFO, the most recently released slot is reused first
//! ```
//!
//! The generation is bumped each time a slot is handed out again, so an id
//! that outlived its request is detected as stale. A released slot keeps
//! its generation until reuse, which is what makes a second `release` on the
//! same id detectable as a double release.
//!
//! The pool is owned by the scheduler thread and needs no locking.

use super::command::Command;
use super::handle::RequestHandle;
use super::outcome::RequestOutput;
use super::status::{Deadline, Priority, RequestStatus};
use crate::error::{PoolError, RequestError};
use std::fmt;
use std::time::Instant;

/// Generational index of a request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    /// Returns the slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation this id was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Callback invoked on the scheduler thread once a request is finished.
pub type CompletionCallback = Box<dyn FnOnce(&RequestHandle) + Send + 'static>;

/// Who observes a request.
#[derive(Clone, Debug, Default)]
pub enum Usage {
    /// Created by a stack node; recycled once its graph resolves.
    #[default]
    Internal,
    /// Created by the facade; the caller observes it through the handle.
    External(RequestHandle),
}

// =============================================================================
// FileRequest
// =============================================================================

/// A unit of work flowing through the stream stack.
#[derive(Default)]
pub struct FileRequest {
    pub(crate) command: Command,
    pub(crate) parent: Option<RequestId>,
    pub(crate) dependencies: u32,
    pub(crate) status: RequestStatus,
    pub(crate) usage: Usage,
    pub(crate) callback: Option<CompletionCallback>,
    pub(crate) estimated_completion: Option<Instant>,
    pub(crate) queued_at: Option<Instant>,
    pub(crate) pending_id: Option<u64>,
    pub(crate) deadline: Deadline,
    pub(crate) priority: Priority,
    /// Stack position of the node that claimed or split this request.
    pub(crate) handler: Option<usize>,
    /// Offset in the parent's data buffer where this request's data lands.
    pub(crate) placement: Option<usize>,
    pub(crate) data: Vec<u8>,
    pub(crate) output: RequestOutput,
    pub(crate) error: Option<RequestError>,
    pub(crate) cancel_requested: bool,
    pub(crate) child_error: Option<RequestError>,
    pub(crate) child_canceled: bool,
}

impl FileRequest {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// Number of children that have not completed yet.
    pub fn dependencies(&self) -> u32 {
        self.dependencies
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Returns the external handle, if the caller observes this request.
    pub fn handle(&self) -> Option<&RequestHandle> {
        match &self.usage {
            Usage::External(handle) => Some(handle),
            Usage::Internal => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.usage, Usage::External(_))
    }

    pub fn pending_id(&self) -> Option<u64> {
        self.pending_id
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn estimated_completion(&self) -> Option<Instant> {
        self.estimated_completion
    }

    /// When the scheduler first saw this request.
    pub fn queued_at(&self) -> Option<Instant> {
        self.queued_at
    }

    pub fn handler(&self) -> Option<usize> {
        self.handler
    }

    pub fn placement(&self) -> Option<usize> {
        self.placement
    }

    /// Output buffer of a read.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn output(&self) -> &RequestOutput {
        &self.output
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    /// True if a cancel arrived after this request left the queue.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Moves the status forward, mirroring it to the external handle.
    ///
    /// Returns false and leaves the status alone if `status` would regress.
    pub(crate) fn advance(&mut self, status: RequestStatus) -> bool {
        if !self.status.can_advance_to(status) {
            return false;
        }
        self.status = status;
        if !status.is_terminal() {
            if let Usage::External(handle) = &self.usage {
                handle.set_status(status);
            }
        }
        true
    }

    fn reset(&mut self, usage: Usage) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        *self = FileRequest {
            usage,
            data,
            ..FileRequest::default()
        };
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRequest")
            .field("command", &self.command)
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("dependencies", &self.dependencies)
            .field("pending_id", &self.pending_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RequestPool
// =============================================================================

struct Slot {
    generation: u32,
    in_recycle_bin: bool,
    /// Set when a faulty request was pulled out of circulation.
    isolated: bool,
    request: FileRequest,
}

/// Generational arena of requests with a LIFO free list.
#[derive(Default)]
pub struct RequestPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh request in `Pending` status, reusing the most
    /// recently released slot when one is available.
    pub fn create(&mut self, usage: Usage) -> RequestId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.in_recycle_bin = false;
            slot.request.reset(usage);
            return RequestId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            in_recycle_bin: false,
            isolated: false,
            request: FileRequest {
                usage,
                ..FileRequest::default()
            },
        });
        RequestId {
            index,
            generation: 0,
        }
    }

    /// Returns the live request for `id`, or `None` if it was released or
    /// recycled.
    pub fn get(&self, id: RequestId) -> Option<&FileRequest> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation && !slot.in_recycle_bin).then_some(&slot.request)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        let slot = self.slots.get_mut(id.index as usize)?;
        (slot.generation == id.generation && !slot.in_recycle_bin).then_some(&mut slot.request)
    }

    /// Returns the live request or the matching pool error.
    pub fn try_get_mut(&mut self, id: RequestId) -> Result<&mut FileRequest, PoolError> {
        self.check(id)?;
        Ok(&mut self.slots[id.index as usize].request)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.get(id).is_some()
    }

    /// Makes `child` a dependency of `parent`.
    pub fn link_child(&mut self, parent: RequestId, child: RequestId) -> Result<(), PoolError> {
        self.check(parent)?;
        self.check(child)?;
        if self.slots[child.index as usize].request.parent.is_some() {
            return Err(PoolError::AlreadyParented { child });
        }
        let parent_request = &mut self.slots[parent.index as usize].request;
        if parent_request.status.is_terminal() {
            return Err(PoolError::ParentFinished { parent });
        }
        parent_request.dependencies += 1;
        self.slots[child.index as usize].request.parent = Some(parent);
        Ok(())
    }

    /// Records that `child` finished and decrements its parent's dependency
    /// count.
    ///
    /// Returns the parent and whether its last dependency just resolved.
    pub fn complete_child(&mut self, child: RequestId) -> Result<Option<(RequestId, bool)>, PoolError> {
        self.check(child)?;
        let Some(parent) = self.slots[child.index as usize].request.parent else {
            return Ok(None);
        };
        let parent_request = self.try_get_mut(parent)?;
        parent_request.dependencies = parent_request.dependencies.saturating_sub(1);
        Ok(Some((parent, parent_request.dependencies == 0)))
    }

    /// Returns a finished request's slot to the free list.
    ///
    /// The request must be terminal with no outstanding children. Releasing
    /// the same id twice is reported as [`PoolError::DoubleRelease`].
    pub fn release(&mut self, id: RequestId) -> Result<(), PoolError> {
        self.check(id)?;
        let request = &self.slots[id.index as usize].request;
        if request.dependencies > 0 {
            return Err(PoolError::StillReferenced {
                id,
                dependencies: request.dependencies,
            });
        }
        if !request.status.is_terminal() {
            return Err(PoolError::NotTerminal {
                id,
                status: request.status,
            });
        }

        let slot = &mut self.slots[id.index as usize];
        slot.in_recycle_bin = true;
        slot.request.reset(Usage::Internal);
        self.free.push(id.index);
        self.live -= 1;
        Ok(())
    }

    /// Pulls a faulty request out of circulation without touching the free
    /// list. The slot is never handed out again.
    pub fn isolate(&mut self, id: RequestId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation || slot.in_recycle_bin || slot.isolated {
            return;
        }
        slot.isolated = true;
        slot.in_recycle_bin = true;
        slot.request.reset(Usage::Internal);
        self.live -= 1;
    }

    /// Number of requests currently handed out.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total number of slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, id: RequestId) -> Result<(), PoolError> {
        let Some(slot) = self.slots.get(id.index as usize) else {
            return Err(PoolError::StaleHandle(id));
        };
        if slot.generation != id.generation {
            return Err(PoolError::StaleHandle(id));
        }
        if slot.in_recycle_bin {
            return Err(PoolError::DoubleRelease(id));
        }
        Ok(())
    }
}

//! Caller-side request builder.
//!
//! A [`PendingRequest`] is configured on the caller's thread and handed to
//! [`Streamer::queue`](crate::Streamer::queue). Command setters overwrite
//! whatever command was set before, so one builder can be reconfigured
//! freely until it is queued. The [`RequestHandle`] exists from the moment
//! the builder is created and can be cloned out before queuing.

use super::command::{
    BufferAllocator, Command, CompressedReadData, CompressionInfo, CustomData, DedicatedCacheData,
    FileQueryData, FlushData, PathStoreData, ReadData, RescheduleData, ReportData, ReportKind,
    TargetData,
};
use super::handle::RequestHandle;
use super::path::RequestPath;
use super::pool::CompletionCallback;
use super::range::FileRange;
use super::status::{Deadline, Priority};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Child request materialized together with its root.
pub(crate) struct PendingChild {
    pub command: Command,
    /// Offset in the root's output buffer where the child's data lands.
    pub placement: Option<usize>,
}

/// An external request that has not been queued yet.
pub struct PendingRequest {
    pub(crate) handle: RequestHandle,
    pub(crate) command: Command,
    pub(crate) deadline: Deadline,
    pub(crate) priority: Priority,
    pub(crate) callback: Option<CompletionCallback>,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) children: Vec<PendingChild>,
}

impl PendingRequest {
    /// Creates an empty request with default deadline and priority.
    pub fn new() -> Self {
        Self {
            handle: RequestHandle::new(),
            command: Command::Empty,
            deadline: Deadline::NONE,
            priority: Priority::default(),
            callback: None,
            buffer: None,
            children: Vec::new(),
        }
    }

    /// Returns a handle to this request.
    pub fn handle(&self) -> RequestHandle {
        self.handle.clone()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    fn set(&mut self, command: Command) -> &mut Self {
        self.command = command;
        self.children.clear();
        self
    }

    // =========================================================================
    // Command setters
    // =========================================================================

    /// Reads `size` bytes at `offset`.
    pub fn read(&mut self, path: impl Into<RequestPath>, offset: u64, size: u64) -> &mut Self {
        self.set(Command::Read(ReadData::new(path.into(), offset, Some(size))))
    }

    /// Reads the whole file.
    pub fn read_whole_file(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.set(Command::Read(ReadData::new(path.into(), 0, None)))
    }

    /// Reads `size` decompressed bytes at `offset` of an archive entry.
    pub fn compressed_read(&mut self, info: CompressionInfo, offset: u64, size: u64) -> &mut Self {
        self.set(Command::CompressedRead(CompressedReadData {
            info: Arc::new(info),
            offset,
            size,
        }))
    }

    pub fn create_dedicated_cache(
        &mut self,
        path: impl Into<RequestPath>,
        range: FileRange,
    ) -> &mut Self {
        self.set(Command::CreateDedicatedCache(DedicatedCacheData {
            path: path.into(),
            range,
        }))
    }

    pub fn destroy_dedicated_cache(
        &mut self,
        path: impl Into<RequestPath>,
        range: FileRange,
    ) -> &mut Self {
        self.set(Command::DestroyDedicatedCache(DedicatedCacheData {
            path: path.into(),
            range,
        }))
    }

    pub fn file_exists(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.set(Command::FileExistsCheck(FileQueryData { path: path.into() }))
    }

    pub fn file_metadata(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.set(Command::FileMetadata(FileQueryData { path: path.into() }))
    }

    pub fn cancel(&mut self, target: &RequestHandle) -> &mut Self {
        self.set(Command::Cancel(TargetData {
            target: target.clone(),
        }))
    }

    pub fn reschedule(
        &mut self,
        target: &RequestHandle,
        deadline: Deadline,
        priority: Priority,
    ) -> &mut Self {
        self.set(Command::Reschedule(RescheduleData {
            target: target.clone(),
            deadline,
            priority,
        }))
    }

    pub fn flush(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.set(Command::Flush(FlushData { path: path.into() }))
    }

    pub fn flush_all(&mut self) -> &mut Self {
        self.set(Command::FlushAll)
    }

    pub fn report(&mut self, kind: ReportKind) -> &mut Self {
        self.set(Command::Report(ReportData { kind }))
    }

    /// Opaque command for extension nodes.
    pub fn custom(
        &mut self,
        name: &'static str,
        payload: impl Any + Send,
        fail_when_unhandled: bool,
    ) -> &mut Self {
        self.set(Command::Custom(CustomData {
            name,
            payload: Box::new(payload),
            fail_when_unhandled,
        }))
    }

    /// Reads several ranges of one file into one contiguous buffer, in the
    /// order given.
    ///
    /// Every range needs an explicit size. A whole-file range, or ranges
    /// adding up to more than [`MAX_READ_SIZE`](super::MAX_READ_SIZE), fail
    /// the request with [`RequestError::ReadTooLarge`](crate::RequestError::ReadTooLarge)
    /// once it is queued.
    pub fn read_ranges(&mut self, path: impl Into<RequestPath>, ranges: &[FileRange]) -> &mut Self {
        let path = path.into();
        self.set(Command::PathStore(PathStoreData { path: path.clone() }));
        let mut placement = 0usize;
        for range in ranges {
            self.children.push(PendingChild {
                command: Command::Read(ReadData::new(path.clone(), range.offset, Some(range.size))),
                placement: Some(placement),
            });
            let len = usize::try_from(range.size).unwrap_or(usize::MAX);
            placement = placement.saturating_add(len);
        }
        self
    }

    /// Completes once every target has reached a terminal status.
    pub fn wait_for(&mut self, targets: &[RequestHandle]) -> &mut Self {
        self.set(Command::Wait);
        for target in targets {
            self.children.push(PendingChild {
                command: Command::ExternalLink(TargetData {
                    target: target.clone(),
                }),
                placement: None,
            });
        }
        self
    }

    // =========================================================================
    // Options
    // =========================================================================

    pub fn with_deadline(&mut self, deadline: Deadline) -> &mut Self {
        self.deadline = deadline;
        self
    }

    pub fn with_priority(&mut self, priority: Priority) -> &mut Self {
        self.priority = priority;
        self
    }

    /// Sets the callback invoked on the scheduler thread when the request
    /// finishes. The callback must not block on other requests.
    pub fn with_callback(
        &mut self,
        callback: impl FnOnce(&RequestHandle) + Send + 'static,
    ) -> &mut Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Reads into a caller-provided buffer instead of a fresh allocation.
    ///
    /// The buffer is resized to the read size and handed back through
    /// [`RequestHandle::take_data`].
    pub fn with_buffer(&mut self, buffer: Vec<u8>) -> &mut Self {
        self.buffer = Some(buffer);
        self
    }

    /// Uses `allocator` for the output buffer of a read.
    pub fn with_allocator(&mut self, allocator: Arc<dyn BufferAllocator>) -> &mut Self {
        if let Command::Read(data) = &mut self.command {
            data.allocator = Some(allocator);
        }
        self
    }
}

impl Default for PendingRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("handle", &self.handle)
            .field("command", &self.command)
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CommandKind;

    #[test]
    fn test_setters_overwrite_command() {
        let mut request = PendingRequest::new();
        request.read("a.bin", 0, 16);
        request.file_exists("b.bin");
        assert_eq!(request.command().kind(), CommandKind::FileExistsCheck);
    }

    #[test]
    fn test_read_ranges_places_children_contiguously() {
        let mut request = PendingRequest::new();
        request.read_ranges(
            "a.bin",
            &[FileRange::new(100, 10), FileRange::new(0, 5), FileRange::new(50, 20)],
        );
        let placements: Vec<_> = request.children.iter().map(|c| c.placement).collect();
        assert_eq!(placements, vec![Some(0), Some(10), Some(15)]);
        assert_eq!(request.command().kind(), CommandKind::PathStore);
    }

    #[test]
    fn test_overwriting_drops_children() {
        let mut request = PendingRequest::new();
        request.read_ranges("a.bin", &[FileRange::new(0, 1)]);
        request.flush_all();
        assert!(request.children.is_empty());
    }

    #[test]
    fn test_allocator_applies_to_reads_only() {
        struct Zeroed;
        impl BufferAllocator for Zeroed {
            fn allocate(&self, size: usize) -> Vec<u8> {
                vec![0; size]
            }
        }

        let mut request = PendingRequest::new();
        request.read("a.bin", 0, 4).with_allocator(Arc::new(Zeroed));
        match request.command() {
            Command::Read(data) => assert!(data.allocator.is_some()),
            other => panic!("unexpected command {other:?}"),
        }
    }
}

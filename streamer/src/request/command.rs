//! Command payloads carried by requests.
//!
//! Every request carries exactly one [`Command`]. Per-kind static
//! properties (whether an unclaimed request fails, and how the scheduler
//! queues it) live in a small table on [`CommandKind`] rather than behind
//! dynamic dispatch.

use super::handle::RequestHandle;
use super::path::RequestPath;
use super::range::FileRange;
use super::status::{Deadline, Priority};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Command
// =============================================================================

/// The tagged payload of a request.
pub enum Command {
    /// No command assigned yet. Pooled requests start out in this state.
    Empty,
    /// Read a byte range (or the whole file) of a path.
    Read(ReadData),
    /// Read a logical range out of a compressed archive entry.
    CompressedRead(CompressedReadData),
    /// Pin cache entries for a path and range until destroyed.
    CreateDedicatedCache(DedicatedCacheData),
    /// Release a dedicated cache region.
    DestroyDedicatedCache(DedicatedCacheData),
    /// Check whether a file exists.
    FileExistsCheck(FileQueryData),
    /// Retrieve file size metadata.
    FileMetadata(FileQueryData),
    /// Cancel a previously queued external request.
    Cancel(TargetData),
    /// Change the deadline and priority of a queued external request.
    Reschedule(RescheduleData),
    /// Drop cached data for one path.
    Flush(FlushData),
    /// Drop all cached data.
    FlushAll,
    /// Completes once all of its children have completed.
    Wait,
    /// Collect a statistics snapshot from every node.
    Report(ReportData),
    /// Opaque command for extension nodes.
    Custom(CustomData),
    /// Holds a path for a group of range reads and concatenates their output.
    PathStore(PathStoreData),
    /// Completes when the linked external request reaches a terminal state.
    ExternalLink(TargetData),
}

impl Command {
    /// Returns the fieldless kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Empty => CommandKind::Empty,
            Self::Read(_) => CommandKind::Read,
            Self::CompressedRead(_) => CommandKind::CompressedRead,
            Self::CreateDedicatedCache(_) => CommandKind::CreateDedicatedCache,
            Self::DestroyDedicatedCache(_) => CommandKind::DestroyDedicatedCache,
            Self::FileExistsCheck(_) => CommandKind::FileExistsCheck,
            Self::FileMetadata(_) => CommandKind::FileMetadata,
            Self::Cancel(_) => CommandKind::Cancel,
            Self::Reschedule(_) => CommandKind::Reschedule,
            Self::Flush(_) => CommandKind::Flush,
            Self::FlushAll => CommandKind::FlushAll,
            Self::Wait => CommandKind::Wait,
            Self::Report(_) => CommandKind::Report,
            Self::Custom(_) => CommandKind::Custom,
            Self::PathStore(_) => CommandKind::PathStore,
            Self::ExternalLink(_) => CommandKind::ExternalLink,
        }
    }

    /// Returns true if a request with this command fails when no stack node
    /// claims it. Otherwise it completes as a successful no-op.
    pub fn fail_when_unhandled(&self) -> bool {
        match self {
            Self::Custom(custom) => custom.fail_when_unhandled,
            other => other.kind().fail_when_unhandled(),
        }
    }

    /// Returns the path this command is about, if any.
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            Self::Read(data) => Some(&data.path),
            Self::CompressedRead(data) => Some(&data.info.archive),
            Self::CreateDedicatedCache(data) | Self::DestroyDedicatedCache(data) => {
                Some(&data.path)
            }
            Self::FileExistsCheck(data) | Self::FileMetadata(data) => Some(&data.path),
            Self::Flush(data) => Some(&data.path),
            Self::PathStore(data) => Some(&data.path),
            _ => None,
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(data) => write!(
                f,
                "Read({} @ {} +{:?})",
                data.path, data.offset, data.size
            ),
            Self::CompressedRead(data) => write!(
                f,
                "CompressedRead({} @ {} +{})",
                data.info.archive, data.offset, data.size
            ),
            Self::CreateDedicatedCache(data) => {
                write!(f, "CreateDedicatedCache({} {})", data.path, data.range)
            }
            Self::DestroyDedicatedCache(data) => {
                write!(f, "DestroyDedicatedCache({} {})", data.path, data.range)
            }
            Self::FileExistsCheck(data) => write!(f, "FileExistsCheck({})", data.path),
            Self::FileMetadata(data) => write!(f, "FileMetadata({})", data.path),
            Self::Cancel(data) => write!(f, "Cancel(#{})", data.target.id()),
            Self::Reschedule(data) => write!(
                f,
                "Reschedule(#{} priority={})",
                data.target.id(),
                data.priority
            ),
            Self::Flush(data) => write!(f, "Flush({})", data.path),
            Self::Report(data) => write!(f, "Report({:?})", data.kind),
            Self::Custom(data) => write!(f, "Custom({})", data.name),
            Self::PathStore(data) => write!(f, "PathStore({})", data.path),
            Self::ExternalLink(data) => write!(f, "ExternalLink(#{})", data.target.id()),
            other => write!(f, "{}", other.kind()),
        }
    }
}

// =============================================================================
// Command kind and static properties
// =============================================================================

/// Fieldless mirror of [`Command`] used for static per-kind properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Empty,
    Read,
    CompressedRead,
    CreateDedicatedCache,
    DestroyDedicatedCache,
    FileExistsCheck,
    FileMetadata,
    Cancel,
    Reschedule,
    Flush,
    FlushAll,
    Wait,
    Report,
    Custom,
    PathStore,
    ExternalLink,
}

/// How the scheduler admits a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueClass {
    /// Enters the ordered queue and is pumped through the stack.
    Ordered,
    /// Acted on by the scheduler as soon as it is ingested (cancel,
    /// reschedule) and completed in the same tick.
    Control,
    /// Never dispatched itself; completes when its children complete.
    Container,
    /// Completes when the external request it links to completes.
    Link,
}

impl CommandKind {
    /// Static fail-when-unhandled policy for this kind.
    pub const fn fail_when_unhandled(&self) -> bool {
        match self {
            Self::Empty
            | Self::Read
            | Self::CompressedRead
            | Self::CreateDedicatedCache
            | Self::DestroyDedicatedCache
            | Self::FileMetadata => true,
            Self::FileExistsCheck
            | Self::Cancel
            | Self::Reschedule
            | Self::Flush
            | Self::FlushAll
            | Self::Wait
            | Self::Report
            | Self::Custom
            | Self::PathStore
            | Self::ExternalLink => false,
        }
    }

    /// Static queueing class for this kind.
    pub const fn queue_class(&self) -> QueueClass {
        match self {
            Self::Cancel | Self::Reschedule => QueueClass::Control,
            Self::Wait | Self::PathStore => QueueClass::Container,
            Self::ExternalLink => QueueClass::Link,
            _ => QueueClass::Ordered,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Provides output buffers for reads that don't supply their own.
pub trait BufferAllocator: Send + Sync + 'static {
    /// Returns a buffer of exactly `size` bytes.
    fn allocate(&self, size: usize) -> Vec<u8>;
}

/// Largest buffer a single read may fill, 4 GiB.
pub const MAX_READ_SIZE: u64 = 1 << 32;

/// Converts a read size into a buffer length. Returns `None` above
/// [`MAX_READ_SIZE`] or when the size does not fit in memory.
pub fn buffer_len(size: u64) -> Option<usize> {
    if size > MAX_READ_SIZE {
        return None;
    }
    usize::try_from(size).ok()
}

/// A read of `size` bytes at `offset`, or of the whole file when `size` is
/// `None`.
#[derive(Clone)]
pub struct ReadData {
    pub path: RequestPath,
    pub offset: u64,
    pub size: Option<u64>,
    pub allocator: Option<Arc<dyn BufferAllocator>>,
}

impl ReadData {
    pub fn new(path: RequestPath, offset: u64, size: Option<u64>) -> Self {
        Self {
            path,
            offset,
            size,
            allocator: None,
        }
    }

    /// Returns the requested range, if the size is known.
    pub fn range(&self) -> Option<FileRange> {
        self.size.map(|size| FileRange::new(self.offset, size))
    }
}

/// Codec tag for compressed archive entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionCodec {
    /// Stored without compression.
    Stored,
    /// Raw deflate stream per block.
    Deflate,
    /// Codec identified by an application-defined tag.
    Other(u32),
}

/// One independently decompressible block of an archive entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedBlock {
    /// Offset of the block's compressed bytes, relative to the entry start.
    pub compressed_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// Describes where an archive entry lives and how it is compressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionInfo {
    /// Path of the archive container.
    pub archive: RequestPath,
    pub codec: CompressionCodec,
    /// Offset of the entry's first compressed byte within the archive.
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Block layout. Empty means a single block spanning the whole entry.
    pub blocks: Vec<CompressedBlock>,
}

impl CompressionInfo {
    /// Creates info for a single-block entry.
    pub fn single_block(
        archive: RequestPath,
        codec: CompressionCodec,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Self {
        Self {
            archive,
            codec,
            offset,
            compressed_size,
            uncompressed_size,
            blocks: Vec::new(),
        }
    }

    /// Returns the block layout, synthesizing one block when none is given.
    pub fn block_layout(&self) -> Vec<CompressedBlock> {
        if self.blocks.is_empty() {
            vec![CompressedBlock {
                compressed_offset: 0,
                compressed_size: self.compressed_size,
                uncompressed_size: self.uncompressed_size,
            }]
        } else {
            self.blocks.clone()
        }
    }
}

/// A read of `size` decompressed bytes at `offset` within an archive entry.
#[derive(Clone, Debug)]
pub struct CompressedReadData {
    pub info: Arc<CompressionInfo>,
    pub offset: u64,
    pub size: u64,
}

/// Path and range of a dedicated cache region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedicatedCacheData {
    pub path: RequestPath,
    pub range: FileRange,
}

/// Target of an existence or metadata query.
#[derive(Clone, Debug)]
pub struct FileQueryData {
    pub path: RequestPath,
}

/// Reference to another external request.
#[derive(Clone, Debug)]
pub struct TargetData {
    pub target: RequestHandle,
}

/// New ordering keys for a queued request.
#[derive(Clone, Debug)]
pub struct RescheduleData {
    pub target: RequestHandle,
    pub deadline: Deadline,
    pub priority: Priority,
}

/// Path whose cached data should be dropped.
#[derive(Clone, Debug)]
pub struct FlushData {
    pub path: RequestPath,
}

/// Which report to collect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// Runtime statistics (hit rates, in-flight counts, averages).
    Statistics,
    /// Effective configuration of every node.
    Configuration,
    /// Queue depths.
    Queues,
}

/// Report selection.
#[derive(Clone, Copy, Debug)]
pub struct ReportData {
    pub kind: ReportKind,
}

/// Opaque payload for extension nodes.
pub struct CustomData {
    /// Short name used in logs and reports.
    pub name: &'static str,
    pub payload: Box<dyn Any + Send>,
    pub fail_when_unhandled: bool,
}

impl CustomData {
    /// Returns the payload as `T` if it has that type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

/// Shared path for a group of range reads.
#[derive(Clone, Debug)]
pub struct PathStoreData {
    pub path: RequestPath,
}

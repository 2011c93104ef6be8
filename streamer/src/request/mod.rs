//! Request objects and their supporting value types.
//!
//! - [`RequestPath`] and [`FileRange`]: what a request is about
//! - [`Command`]: the tagged payload, with per-kind static properties
//! - [`RequestPool`]: generational arena with a LIFO free list
//! - [`RequestHandle`]: reference-counted caller view of an external request
//! - [`PendingRequest`]: caller-side builder, queued through the facade

mod command;
mod handle;
mod outcome;
mod path;
mod pending;
mod pool;
mod range;
mod status;

pub use command::{
    buffer_len, BufferAllocator, Command, CommandKind, CompressedBlock, CompressedReadData,
    CompressionCodec, CompressionInfo, CustomData, DedicatedCacheData, FileQueryData, FlushData,
    PathStoreData, QueueClass, ReadData, ReportData, ReportKind, RescheduleData, TargetData,
    MAX_READ_SIZE,
};
pub use handle::RequestHandle;
pub use outcome::{FileMetadata, NotApplied, RequestOutcome, RequestOutput};
pub use path::RequestPath;
pub(crate) use pending::PendingChild;
pub use pending::PendingRequest;
pub use pool::{CompletionCallback, FileRequest, RequestId, RequestPool, Usage};
pub use range::FileRange;
pub use status::{Deadline, Priority, RequestStatus};

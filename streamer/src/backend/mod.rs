//! Collaborators the stream stack talks to.
//!
//! ```text
//!   ArchiveNode ──► ArchiveLookup      (relative path → archive entry)
//!   CompressionNode ──► Decompressor   (one block at a time, on JobSystem)
//!   DeviceNode ──► StorageBackend      (positioned reads, size queries)
//! ```
//!
//! Every collaborator is a trait so tests can substitute counting or
//! deferred mocks. Concrete implementations cover the local filesystem,
//! an in-memory archive table, stored and deflate blocks, and tokio or
//! inline job execution.

mod archive;
mod compression;
mod jobs;
mod storage;

pub use archive::{ArchiveIndex, ArchiveLookup};
pub use compression::{
    DecompressError, Decompressor, DecompressorSet, DeflateDecompressor, StoredDecompressor,
};
pub use jobs::{InlineJobSystem, Job, JobSystem, JobToken, TokioJobSystem};
pub use storage::{BackendRead, LocalFileBackend, ReadCompletion, SizeCompletion, StorageBackend};

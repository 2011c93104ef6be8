//! Error types for the streaming core.
//!
//! Errors fall into three groups:
//!
//! - [`RequestError`]: recoverable, attached to a single failed request and
//!   delivered through its handle and completion callback.
//! - [`PoolError`]: programmer errors detected by the request pool (double
//!   release, re-parenting, stale ids). Never silently ignored.
//! - [`StreamerError`]: facade-level failures (stopped streamer, misuse of the
//!   blocking wait, configuration).

use crate::config::ConfigFileError;
use crate::request::{CommandKind, RequestId, RequestPath, RequestStatus, MAX_READ_SIZE};
use std::io;
use thiserror::Error;

/// Failure recorded on a request that finished with [`RequestStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No stack node claimed a request whose command fails when unhandled.
    #[error("No stack node handled the {command} request")]
    Unhandled { command: CommandKind },

    /// The file does not exist on any device or archive.
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// The storage backend reported an I/O error.
    #[error("I/O error on {path}: {message}")]
    Io {
        path: String,
        kind: io::ErrorKind,
        message: String,
    },

    /// The backend returned fewer bytes than requested.
    #[error("Short read on {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The decompressor rejected a block.
    #[error("Decompression failed for {archive}: {message}")]
    Decompression { archive: String, message: String },

    /// The requested range lies outside the file.
    #[error("Invalid range {offset}+{size} for {path} (file size {file_size})")]
    InvalidRange {
        path: String,
        offset: u64,
        size: u64,
        file_size: u64,
    },

    /// The read would need a buffer larger than one request may hold.
    #[error("Read of {size} bytes from {path} exceeds the {limit} byte limit")]
    ReadTooLarge { path: String, size: u64, limit: u64 },

    /// A job-system work item could not run to completion.
    #[error("Job failed: {0}")]
    Job(String),
}

impl RequestError {
    /// Builds an I/O error for `path`, mapping `NotFound` to its own variant.
    pub fn io(path: &RequestPath, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return Self::NotFound {
                path: path.to_string(),
            };
        }
        Self::Io {
            path: path.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Builds the error for a read whose size exceeds [`MAX_READ_SIZE`].
    pub fn too_large(path: &RequestPath, size: u64) -> Self {
        Self::ReadTooLarge {
            path: path.to_string(),
            size,
            limit: MAX_READ_SIZE,
        }
    }
}

/// Programmer errors detected by the request pool.
///
/// The scheduler treats these as bugs: `debug_assert!` in debug builds, a
/// logged error in release builds. The offending slot is isolated and never
/// pushed back on the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The id refers to a slot that has since been recycled.
    #[error("Request {0} is stale or was recycled")]
    StaleHandle(RequestId),

    /// The request is already in the recycle bin.
    #[error("Request {0} was already released")]
    DoubleRelease(RequestId),

    /// The child already belongs to another parent.
    #[error("Request {child} already has a parent")]
    AlreadyParented { child: RequestId },

    /// Children cannot be linked to a parent that has already finished.
    #[error("Parent {parent} has already finished")]
    ParentFinished { parent: RequestId },

    /// The request still has outstanding children.
    #[error("Request {id} still has {dependencies} outstanding children")]
    StillReferenced { id: RequestId, dependencies: u32 },

    /// The request has not reached a terminal status.
    #[error("Request {id} is not finished (status {status})")]
    NotTerminal { id: RequestId, status: RequestStatus },
}

/// Facade-level errors.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// The scheduler thread has shut down.
    #[error("Streamer has stopped")]
    Stopped,

    /// A blocking wait was attempted on the scheduler thread, which would
    /// deadlock.
    #[error("Blocking wait called on the scheduler thread")]
    WaitOnSchedulerThread,

    /// The scheduler thread could not be spawned.
    #[error("Failed to spawn scheduler thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The runtime for blocking file work could not be built.
    #[error("Failed to build I/O runtime: {0}")]
    Runtime(#[source] io::Error),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigFileError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let path = RequestPath::new("missing.bin");
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            RequestError::io(&path, &err),
            RequestError::NotFound {
                path: "missing.bin".to_string()
            }
        );
    }

    #[test]
    fn test_io_error_keeps_kind() {
        let path = RequestPath::new("locked.bin");
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        match RequestError::io(&path, &err) {
            RequestError::Io { kind, path, .. } => {
                assert_eq!(kind, io::ErrorKind::PermissionDenied);
                assert_eq!(path, "locked.bin");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unhandled_display() {
        let err = RequestError::Unhandled {
            command: CommandKind::Read,
        };
        assert_eq!(err.to_string(), "No stack node handled the Read request");
    }
}

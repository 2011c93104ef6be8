//! Storage backends: where the device node's reads actually happen.
//!
//! A backend starts a read and returns immediately. The result is posted
//! through the [`ReadCompletion`] it was given, from whatever thread did
//! the I/O; the context carries it back to the scheduler thread.

use super::jobs::JobSystem;
use crate::context::{AsyncNotifier, AsyncResult};
use crate::request::RequestPath;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// One positioned read handed to a backend.
#[derive(Debug)]
pub struct BackendRead {
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
    /// Destination buffer, `size` bytes long. Returned, possibly truncated
    /// at end of file, through the completion.
    pub buffer: Vec<u8>,
}

/// One-shot completion for a backend read.
///
/// Dropping it without calling [`complete`](Self::complete) posts an
/// `Interrupted` error, so a lost completion can never strand a request.
#[derive(Debug)]
pub struct ReadCompletion {
    notifier: Option<AsyncNotifier>,
}

impl ReadCompletion {
    pub(crate) fn new(notifier: AsyncNotifier) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    pub fn complete(mut self, result: io::Result<Vec<u8>>) {
        if let Some(notifier) = self.notifier.take() {
            notifier.notify(AsyncResult::Read(result));
        }
    }
}

impl Drop for ReadCompletion {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            notifier.notify(AsyncResult::Read(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "read dropped before completion",
            ))));
        }
    }
}

/// One-shot completion for a backend size query.
#[derive(Debug)]
pub struct SizeCompletion {
    notifier: Option<AsyncNotifier>,
}

impl SizeCompletion {
    pub(crate) fn new(notifier: AsyncNotifier) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    /// Posts the file size, or `Ok(None)` if the file does not exist.
    pub fn complete(mut self, result: io::Result<Option<u64>>) {
        if let Some(notifier) = self.notifier.take() {
            notifier.notify(AsyncResult::FileSize(result));
        }
    }
}

impl Drop for SizeCompletion {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            notifier.notify(AsyncResult::FileSize(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "query dropped before completion",
            ))));
        }
    }
}

/// A device the streamer reads from.
///
/// Both operations must return quickly; the work itself belongs on the
/// backend's own threads or job system.
pub trait StorageBackend: Send + Sync + 'static {
    /// Returns the backend name for logging and reports.
    fn name(&self) -> &'static str;

    /// Number of reads the device serves well in parallel.
    fn available_concurrency(&self) -> usize;

    /// Starts a read of `read.size` bytes at `read.offset`.
    fn begin_read(&self, read: BackendRead, completion: ReadCompletion);

    /// Starts a size lookup for `path`.
    fn begin_file_size(&self, path: RequestPath, completion: SizeCompletion);
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Reads loose files below a root directory using blocking positioned
/// reads on a job system.
pub struct LocalFileBackend {
    root: PathBuf,
    jobs: Arc<dyn JobSystem>,
    concurrency: usize,
}

impl LocalFileBackend {
    pub fn new(root: impl Into<PathBuf>, jobs: Arc<dyn JobSystem>) -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            root: root.into(),
            jobs,
            concurrency,
        }
    }

    /// Overrides the reported concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageBackend for LocalFileBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn available_concurrency(&self) -> usize {
        self.concurrency
    }

    fn begin_read(&self, read: BackendRead, completion: ReadCompletion) {
        let location = read.path.resolve_against(&self.root);
        self.jobs.run(Box::new(move || {
            trace!(path = %location.display(), offset = read.offset, size = read.size, "Local read");
            completion.complete(read_at(&location, read.offset, read.buffer));
        }));
    }

    fn begin_file_size(&self, path: RequestPath, completion: SizeCompletion) {
        let location = path.resolve_against(&self.root);
        self.jobs.run(Box::new(move || {
            completion.complete(file_size(&location));
        }));
    }
}

impl std::fmt::Debug for LocalFileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileBackend")
            .field("root", &self.root)
            .field("jobs", &self.jobs.name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Fills `buffer` from `offset`, truncating it if the file ends first.
fn read_at(location: &Path, offset: u64, mut buffer: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut file = File::open(location)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

fn file_size(location: &Path) -> io::Result<Option<u64>> {
    match std::fs::metadata(location) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

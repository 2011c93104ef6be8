//! Results delivered to request owners.

use super::status::RequestStatus;
use crate::error::RequestError;
use crate::report::StreamerReport;

/// Size metadata for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
}

/// Why a control command had no effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotApplied {
    /// The target had already left the ordered queue.
    TargetDeparted,
    /// The target had already finished.
    TargetFinished,
}

/// Payload produced by a finished request.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestOutput {
    #[default]
    None,
    /// Bytes produced by a read.
    Data(Vec<u8>),
    /// Answer to an existence check.
    Exists(bool),
    /// Answer to a metadata query.
    Metadata(FileMetadata),
    /// Snapshot produced by a report command.
    Report(StreamerReport),
    /// A cancel or reschedule that arrived too late.
    NotApplied(NotApplied),
}

impl RequestOutput {
    /// Returns the existence answer, if this is one.
    pub fn exists(&self) -> Option<bool> {
        match self {
            Self::Exists(exists) => Some(*exists),
            _ => None,
        }
    }

    /// Returns the file size, if this is a metadata answer.
    pub fn file_size(&self) -> Option<u64> {
        match self {
            Self::Metadata(metadata) => Some(metadata.size),
            _ => None,
        }
    }

    /// Returns the report, if this is one.
    pub fn report(&self) -> Option<&StreamerReport> {
        match self {
            Self::Report(report) => Some(report),
            _ => None,
        }
    }

    /// Returns the not-applied reason, if any.
    pub fn not_applied(&self) -> Option<NotApplied> {
        match self {
            Self::NotApplied(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Terminal state of a request as seen by its owner.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOutcome {
    pub status: RequestStatus,
    pub error: Option<RequestError>,
    pub output: RequestOutput,
}

impl RequestOutcome {
    pub fn completed(output: RequestOutput) -> Self {
        Self {
            status: RequestStatus::Completed,
            error: None,
            output,
        }
    }

    pub fn failed(error: RequestError) -> Self {
        Self {
            status: RequestStatus::Failed,
            error: Some(error),
            output: RequestOutput::None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: RequestStatus::Canceled,
            error: None,
            output: RequestOutput::None,
        }
    }
}

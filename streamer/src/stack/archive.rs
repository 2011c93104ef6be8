//! Archive resolver node.
//!
//! Reads of paths found in the archive lookup become a single
//! [`Command::CompressedRead`] child pointing into the archive container.
//! Paths that are not archived are declined, so the device node reads them
//! as loose files. Existence and size queries for archived paths are
//! answered here without touching the device.

use super::{NodeOutcome, StreamStackNode};
use crate::backend::ArchiveLookup;
use crate::context::StreamerContext;
use crate::error::RequestError;
use crate::report::{StatisticValue, StreamerReport};
use crate::request::{
    buffer_len, Command, CompressedReadData, FileMetadata, ReadData, ReportKind, RequestId,
    RequestOutput,
};
use std::sync::Arc;
use tracing::trace;

const NAME: &str = "archive";

/// Resolves relative paths to archive entries.
pub struct ArchiveNode {
    lookup: Arc<dyn ArchiveLookup>,
    resolved_reads: u64,
    loose_reads: u64,
    answered_queries: u64,
}

impl ArchiveNode {
    pub fn new(lookup: Arc<dyn ArchiveLookup>) -> Self {
        Self {
            lookup,
            resolved_reads: 0,
            loose_reads: 0,
            answered_queries: 0,
        }
    }

    fn handle_read(&mut self, ctx: &mut StreamerContext, id: RequestId, read: ReadData) -> NodeOutcome {
        let Some(info) = self.lookup.resolve(&read.path) else {
            self.loose_reads += 1;
            return NodeOutcome::Declined;
        };
        self.resolved_reads += 1;

        let file_size = info.uncompressed_size;
        let size = read
            .size
            .unwrap_or_else(|| file_size.saturating_sub(read.offset));
        if read.offset > file_size || size > file_size - read.offset {
            ctx.fail(
                id,
                RequestError::InvalidRange {
                    path: read.path.to_string(),
                    offset: read.offset,
                    size,
                    file_size,
                },
            );
            return NodeOutcome::Handled;
        }
        let Some(len) = buffer_len(size) else {
            ctx.fail(id, RequestError::too_large(&read.path, size));
            return NodeOutcome::Handled;
        };
        if let Some(data) = ctx.data_mut(id) {
            data.resize(len, 0);
        }
        if size == 0 {
            ctx.complete(id);
            return NodeOutcome::Handled;
        }

        trace!(
            path = %read.path,
            archive = %info.archive,
            offset = read.offset,
            size,
            "Resolved archived read"
        );
        let command = Command::CompressedRead(CompressedReadData {
            info,
            offset: read.offset,
            size,
        });
        match ctx.create_child(id, command, Some(0)) {
            Ok(child) => NodeOutcome::Split(vec![child]),
            Err(err) => {
                ctx.report_pool_error(err);
                ctx.fail(id, RequestError::Job(err.to_string()));
                NodeOutcome::Handled
            }
        }
    }
}

impl StreamStackNode for ArchiveNode {
    fn name(&self) -> &'static str {
        NAME
    }

    fn try_handle(&mut self, ctx: &mut StreamerContext, id: RequestId) -> NodeOutcome {
        let Some(request) = ctx.request(id) else {
            return NodeOutcome::Declined;
        };
        match request.command() {
            Command::Read(read) => {
                let read = read.clone();
                self.handle_read(ctx, id, read)
            }
            Command::FileExistsCheck(query) => {
                if self.lookup.resolve(&query.path).is_none() {
                    return NodeOutcome::Declined;
                }
                self.answered_queries += 1;
                ctx.complete_with(id, RequestOutput::Exists(true));
                NodeOutcome::Handled
            }
            Command::FileMetadata(query) => {
                let Some(info) = self.lookup.resolve(&query.path) else {
                    return NodeOutcome::Declined;
                };
                self.answered_queries += 1;
                let metadata = FileMetadata {
                    size: info.uncompressed_size,
                };
                ctx.complete_with(id, RequestOutput::Metadata(metadata));
                NodeOutcome::Handled
            }
            _ => NodeOutcome::Declined,
        }
    }

    fn collect_report(&self, kind: ReportKind, report: &mut StreamerReport) {
        if kind == ReportKind::Statistics {
            report.push(NAME, "resolved_reads", StatisticValue::Count(self.resolved_reads));
            report.push(NAME, "loose_reads", StatisticValue::Count(self.loose_reads));
            report.push(NAME, "answered_queries", StatisticValue::Count(self.answered_queries));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ArchiveIndex;
    use crate::request::{CompressionCodec, CompressionInfo, RequestHandle, RequestPath, Usage};
    use crate::telemetry::NullTelemetrySink;

    fn setup() -> (ArchiveNode, StreamerContext) {
        let index = ArchiveIndex::new();
        index.insert(
            "level/map.bin",
            CompressionInfo::single_block(
                RequestPath::new("data.pak"),
                CompressionCodec::Stored,
                512,
                1000,
                1000,
            ),
        );
        (
            ArchiveNode::new(Arc::new(index)),
            StreamerContext::new(Arc::new(NullTelemetrySink)),
        )
    }

    fn request(ctx: &mut StreamerContext, command: Command) -> RequestId {
        let id = ctx.pool_mut().create(Usage::External(RequestHandle::new()));
        ctx.request_mut(id).unwrap().command = command;
        id
    }

    #[test]
    fn test_archived_read_becomes_compressed_child() {
        let (mut node, mut ctx) = setup();
        let id = request(
            &mut ctx,
            Command::Read(ReadData::new("level/map.bin".into(), 100, None)),
        );

        let NodeOutcome::Split(children) = node.try_handle(&mut ctx, id) else {
            panic!("expected split");
        };
        assert_eq!(children.len(), 1);
        let child = ctx.request(children[0]).unwrap();
        match child.command() {
            Command::CompressedRead(read) => {
                assert_eq!(read.offset, 100);
                assert_eq!(read.size, 900);
                assert_eq!(read.info.archive.as_str(), "data.pak");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(ctx.request(id).unwrap().data().len(), 900);
    }

    #[test]
    fn test_loose_read_is_declined() {
        let (mut node, mut ctx) = setup();
        let id = request(
            &mut ctx,
            Command::Read(ReadData::new("loose.txt".into(), 0, Some(10))),
        );
        assert_eq!(node.try_handle(&mut ctx, id), NodeOutcome::Declined);
    }

    #[test]
    fn test_read_past_entry_end_fails() {
        let (mut node, mut ctx) = setup();
        let id = request(
            &mut ctx,
            Command::Read(ReadData::new("level/map.bin".into(), 990, Some(20))),
        );
        assert_eq!(node.try_handle(&mut ctx, id), NodeOutcome::Handled);
        assert!(matches!(
            ctx.request(id).unwrap().error(),
            Some(RequestError::InvalidRange { file_size: 1000, .. })
        ));
    }

    #[test]
    fn test_metadata_answered_from_index() {
        let (mut node, mut ctx) = setup();
        let id = request(
            &mut ctx,
            Command::FileMetadata(crate::request::FileQueryData {
                path: "level/map.bin".into(),
            }),
        );
        assert_eq!(node.try_handle(&mut ctx, id), NodeOutcome::Handled);
        assert_eq!(ctx.request(id).unwrap().output().file_size(), Some(1000));
    }
}

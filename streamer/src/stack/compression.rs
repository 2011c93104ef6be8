//! Compression node.
//!
//! A compressed read fans out into one raw read per compression block the
//! requested range touches. When the last raw read has resolved, every block
//! is decompressed on the job system and a final job stitches the requested
//! sub-range together:
//!
//! ```text
//!   CompressedRead [60000, 68000)
//!        ├─ raw Read block 0 ─► decompress ─┐
//!        └─ raw Read block 1 ─► decompress ─┴─► assemble ─► AsyncNotifier
//! ```
//!
//! The assembled bytes come back through the context on a later tick and
//! complete the request.

use super::{NodeOutcome, StreamStackNode};
use crate::backend::{DecompressError, Decompressor, JobSystem, JobToken};
use crate::context::{AsyncResult, StreamerContext};
use crate::error::RequestError;
use crate::report::{StatisticValue, StreamerReport};
use crate::request::{
    buffer_len, Command, CompressedBlock, CompressedReadData, CompressionCodec, ReadData, ReportKind,
    RequestId, RequestStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const NAME: &str = "compression";

type BlockResults = Arc<Mutex<Vec<Option<Result<Vec<u8>, DecompressError>>>>>;

#[derive(Debug)]
struct BlockSlot {
    block: CompressedBlock,
    child: RequestId,
    compressed: Option<Vec<u8>>,
}

#[derive(Debug)]
struct BlockFetch {
    read: CompressedReadData,
    /// Logical offset of the first fetched block within the entry.
    first_block_start: u64,
    slots: Vec<BlockSlot>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CompressionStats {
    reads: u64,
    blocks: u64,
    bytes_decompressed: u64,
    failures: u64,
}

/// Serves compressed reads through raw block reads and the decompressor.
pub struct CompressionNode {
    decompressor: Arc<dyn Decompressor>,
    jobs: Arc<dyn JobSystem>,
    fetching: HashMap<RequestId, BlockFetch>,
    decoding: HashMap<u64, (RequestId, String)>,
    next_token: u64,
    stats: CompressionStats,
}

impl CompressionNode {
    pub fn new(decompressor: Arc<dyn Decompressor>, jobs: Arc<dyn JobSystem>) -> Self {
        Self {
            decompressor,
            jobs,
            fetching: HashMap::new(),
            decoding: HashMap::new(),
            next_token: 0,
            stats: CompressionStats::default(),
        }
    }

    fn handle(&mut self, ctx: &mut StreamerContext, id: RequestId, read: CompressedReadData) -> NodeOutcome {
        let info = Arc::clone(&read.info);
        let archive = info.archive.to_string();
        if read.offset > info.uncompressed_size || read.size > info.uncompressed_size - read.offset {
            ctx.fail(
                id,
                RequestError::InvalidRange {
                    path: archive,
                    offset: read.offset,
                    size: read.size,
                    file_size: info.uncompressed_size,
                },
            );
            return NodeOutcome::Handled;
        }
        let Some(len) = buffer_len(read.size) else {
            ctx.fail(id, RequestError::too_large(&info.archive, read.size));
            return NodeOutcome::Handled;
        };
        if let Some(data) = ctx.data_mut(id) {
            data.resize(len, 0);
        }
        if read.size == 0 {
            ctx.complete(id);
            return NodeOutcome::Handled;
        }
        if !self.decompressor.supports(info.codec) {
            self.stats.failures += 1;
            ctx.fail(
                id,
                RequestError::Decompression {
                    archive,
                    message: DecompressError::UnsupportedCodec(info.codec).to_string(),
                },
            );
            return NodeOutcome::Handled;
        }

        let end = read.offset + read.size;
        let mut logical = 0u64;
        let mut first_block_start = None;
        let mut slots = Vec::new();
        for block in info.block_layout() {
            let block_start = logical;
            logical += block.uncompressed_size;
            if logical <= read.offset || block_start >= end {
                continue;
            }
            first_block_start.get_or_insert(block_start);
            let raw = ReadData::new(
                info.archive.clone(),
                info.offset + block.compressed_offset,
                Some(block.compressed_size),
            );
            match ctx.create_child(id, Command::Read(raw), None) {
                Ok(child) => slots.push(BlockSlot {
                    block,
                    child,
                    compressed: None,
                }),
                Err(err) => ctx.report_pool_error(err),
            }
        }

        self.stats.reads += 1;
        self.stats.blocks += slots.len() as u64;
        debug!(
            request = %id,
            archive = %info.archive,
            offset = read.offset,
            size = read.size,
            blocks = slots.len(),
            "Compressed read"
        );
        let children = slots.iter().map(|slot| slot.child).collect();
        self.fetching.insert(
            id,
            BlockFetch {
                read,
                first_block_start: first_block_start.unwrap_or(0),
                slots,
            },
        );
        NodeOutcome::Split(children)
    }

    /// Decompresses every block on the job system, then assembles the
    /// requested range in a job that depends on all of them.
    fn start_decode(&mut self, ctx: &mut StreamerContext, id: RequestId, fetch: BlockFetch) {
        let token = self.next_token;
        self.next_token += 1;
        self.decoding.insert(token, (id, fetch.read.info.archive.to_string()));
        let notifier = ctx.async_notifier(token);

        let codec: CompressionCodec = fetch.read.info.codec;
        let results: BlockResults = Arc::new(Mutex::new(vec![None; fetch.slots.len()]));
        let mut tokens: Vec<JobToken> = Vec::with_capacity(fetch.slots.len());
        for (index, slot) in fetch.slots.into_iter().enumerate() {
            let decompressor = Arc::clone(&self.decompressor);
            let results = Arc::clone(&results);
            let compressed = slot.compressed.unwrap_or_default();
            let uncompressed_size = slot.block.uncompressed_size;
            tokens.push(self.jobs.run(Box::new(move || {
                let out = decompressor.decompress(codec, &compressed, uncompressed_size);
                results.lock()[index] = Some(out);
            })));
        }

        let skip = (fetch.read.offset - fetch.first_block_start) as usize;
        let size = fetch.read.size as usize;
        self.jobs.run_after(
            Box::new(move || {
                let mut assembled = Vec::with_capacity(skip + size);
                for result in results.lock().drain(..) {
                    match result {
                        Some(Ok(block)) => assembled.extend_from_slice(&block),
                        Some(Err(err)) => {
                            notifier.notify(AsyncResult::Job(Err(RequestError::Job(err.to_string()))));
                            return;
                        }
                        None => {
                            notifier.notify(AsyncResult::Job(Err(RequestError::Job(
                                "block was not decompressed".to_string(),
                            ))));
                            return;
                        }
                    }
                }
                let out = assembled
                    .get(skip..skip + size)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| RequestError::Job("decompressed blocks too short".to_string()));
                notifier.notify(AsyncResult::Job(out));
            }),
            tokens,
        );
    }
}

impl StreamStackNode for CompressionNode {
    fn name(&self) -> &'static str {
        NAME
    }

    fn try_handle(&mut self, ctx: &mut StreamerContext, id: RequestId) -> NodeOutcome {
        match ctx.request(id).map(|r| r.command()) {
            Some(Command::CompressedRead(read)) => {
                let read = read.clone();
                self.handle(ctx, id, read)
            }
            _ => NodeOutcome::Declined,
        }
    }

    fn on_child_completed(&mut self, ctx: &mut StreamerContext, parent: RequestId, child: RequestId) {
        let completed = ctx
            .request(child)
            .is_some_and(|r| r.status() == RequestStatus::Completed);
        if !completed {
            return;
        }
        let Some(fetch) = self.fetching.get_mut(&parent) else {
            return;
        };
        if let Some(slot) = fetch.slots.iter_mut().find(|slot| slot.child == child) {
            slot.compressed = Some(ctx.take_data(child));
        }
    }

    fn finalize_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(fetch) = self.fetching.remove(&id) else {
            ctx.finish_from_children(id);
            return;
        };
        // A cancel that arrives after the raw reads were issued does not stop
        // the decode: fetched bytes are always delivered.
        let all_fetched = fetch.slots.iter().all(|slot| slot.compressed.is_some());
        if all_fetched {
            self.start_decode(ctx, id, fetch);
            return;
        }
        let explained = ctx
            .request(id)
            .is_some_and(|r| r.child_error.is_some() || r.child_canceled);
        if explained {
            ctx.finish_from_children(id);
        } else {
            self.stats.failures += 1;
            ctx.fail(id, RequestError::Job("compressed blocks missing".to_string()));
        }
    }

    fn on_async_completion(&mut self, ctx: &mut StreamerContext, token: u64, result: AsyncResult) {
        let Some((id, archive)) = self.decoding.remove(&token) else {
            warn!(token, "Completion for unknown decode");
            return;
        };
        match result {
            AsyncResult::Job(Ok(bytes)) => {
                self.stats.bytes_decompressed += bytes.len() as u64;
                if let Some(data) = ctx.data_mut(id) {
                    if data.len() == bytes.len() {
                        data.copy_from_slice(&bytes);
                    } else {
                        *data = bytes;
                    }
                }
                ctx.complete(id);
            }
            AsyncResult::Job(Err(err)) => {
                self.stats.failures += 1;
                warn!(request = %id, archive = %archive, error = %err, "Decompression failed");
                ctx.fail(
                    id,
                    RequestError::Decompression {
                        archive,
                        message: err.to_string(),
                    },
                );
            }
            other => {
                warn!(request = %id, result = ?other, "Unexpected completion kind");
                ctx.fail(id, RequestError::Job("unexpected completion kind".to_string()));
            }
        }
    }

    fn collect_report(&self, kind: ReportKind, report: &mut StreamerReport) {
        match kind {
            ReportKind::Statistics => {
                report.push(NAME, "reads", StatisticValue::Count(self.stats.reads));
                report.push(NAME, "blocks", StatisticValue::Count(self.stats.blocks));
                report.push(
                    NAME,
                    "bytes_decompressed",
                    StatisticValue::Bytes(self.stats.bytes_decompressed),
                );
                report.push(NAME, "failures", StatisticValue::Count(self.stats.failures));
            }
            ReportKind::Queues => {
                report.push(NAME, "fetching", StatisticValue::Count(self.fetching.len() as u64));
                report.push(NAME, "decoding", StatisticValue::Count(self.decoding.len() as u64));
            }
            ReportKind::Configuration => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DecompressorSet, InlineJobSystem};
    use crate::request::{CompressionInfo, RequestHandle, RequestPath, Usage};
    use crate::telemetry::NullTelemetrySink;

    fn two_block_info() -> Arc<CompressionInfo> {
        Arc::new(CompressionInfo {
            archive: RequestPath::new("data.pak"),
            codec: CompressionCodec::Stored,
            offset: 4096,
            compressed_size: 131_072,
            uncompressed_size: 131_072,
            blocks: vec![
                CompressedBlock {
                    compressed_offset: 0,
                    compressed_size: 65_536,
                    uncompressed_size: 65_536,
                },
                CompressedBlock {
                    compressed_offset: 65_536,
                    compressed_size: 65_536,
                    uncompressed_size: 65_536,
                },
            ],
        })
    }

    fn setup() -> (CompressionNode, StreamerContext) {
        (
            CompressionNode::new(Arc::new(DecompressorSet::default()), Arc::new(InlineJobSystem)),
            StreamerContext::new(Arc::new(NullTelemetrySink)),
        )
    }

    fn compressed_read(ctx: &mut StreamerContext, offset: u64, size: u64) -> RequestId {
        let id = ctx.pool_mut().create(Usage::External(RequestHandle::new()));
        ctx.request_mut(id).unwrap().command = Command::CompressedRead(CompressedReadData {
            info: two_block_info(),
            offset,
            size,
        });
        id
    }

    #[test]
    fn test_range_spanning_two_blocks_reads_both() {
        let (mut node, mut ctx) = setup();
        let id = compressed_read(&mut ctx, 60_000, 8_000);

        let NodeOutcome::Split(children) = node.try_handle(&mut ctx, id) else {
            panic!("expected split");
        };
        assert_eq!(children.len(), 2);
        let offsets: Vec<(u64, Option<u64>)> = children
            .iter()
            .map(|c| match ctx.request(*c).unwrap().command() {
                Command::Read(read) => (read.offset, read.size),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(offsets, vec![(4096, Some(65_536)), (4096 + 65_536, Some(65_536))]);
    }

    #[test]
    fn test_range_inside_one_block_reads_one() {
        let (mut node, mut ctx) = setup();
        let id = compressed_read(&mut ctx, 70_000, 100);
        let NodeOutcome::Split(children) = node.try_handle(&mut ctx, id) else {
            panic!("expected split");
        };
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn test_out_of_range_fails() {
        let (mut node, mut ctx) = setup();
        let id = compressed_read(&mut ctx, 131_000, 100);
        assert_eq!(node.try_handle(&mut ctx, id), NodeOutcome::Handled);
        assert_eq!(ctx.request(id).unwrap().status(), RequestStatus::Failed);
    }

    #[test]
    fn test_unsupported_codec_fails() {
        let (mut node, mut ctx) = setup();
        let id = ctx.pool_mut().create(Usage::Internal);
        let mut info = (*two_block_info()).clone();
        info.codec = CompressionCodec::Other(9);
        ctx.request_mut(id).unwrap().command = Command::CompressedRead(CompressedReadData {
            info: Arc::new(info),
            offset: 0,
            size: 10,
        });
        assert_eq!(node.try_handle(&mut ctx, id), NodeOutcome::Handled);
        assert!(matches!(
            ctx.request(id).unwrap().error(),
            Some(RequestError::Decompression { .. })
        ));
    }
}

//! Phase 2: ordered dispatch and the node walk.
//!
//! Requests leave the ordered queue in key order for as long as the nodes
//! report free slots. Each one is offered to the nodes top to bottom; split
//! children continue at the node below the one that split them.

use super::queue::OrderKey;
use super::Scheduler;
use crate::report::{StatisticValue, StreamerReport};
use crate::request::{Command, ReportKind, RequestId, RequestOutput, RequestStatus};
use crate::stack::NodeOutcome;
use crate::telemetry::TelemetryEvent;
use std::collections::VecDeque;
use tracing::trace;

const NAME: &str = "scheduler";

impl Scheduler {
    /// Dispatches queued requests. Returns true if any left the queue.
    pub(crate) fn dispatch(&mut self) -> bool {
        let limit = match self.settings.max_dispatch_per_tick {
            0 => usize::MAX,
            n => n,
        };
        let mut dispatched = 0;
        while dispatched < limit {
            if self.available_slots() == Some(0) {
                break;
            }
            let Some((key, id)) = self.queue.pop() else {
                break;
            };
            self.dispatch_one(key, id);
            dispatched += 1;
        }
        dispatched > 0
    }

    /// Smallest slot count any node reports. `None` when nobody limits.
    fn available_slots(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|node| node.available_request_slots())
            .min()
    }

    fn dispatch_one(&mut self, key: OrderKey, id: RequestId) {
        let now = self.context.now();
        let Some(request) = self.context.request_mut(id) else {
            return;
        };
        if request.status().is_terminal() {
            return;
        }
        request.advance(RequestStatus::Processing);
        let command = request.command.kind();
        let wait_time = request
            .queued_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        let report = match &request.command {
            Command::Report(data) => Some(data.kind),
            _ => None,
        };

        self.stats.dispatched += 1;
        self.telemetry.emit(TelemetryEvent::RequestDispatched {
            pending_id: key.pending_id,
            command,
            wait_time,
        });

        match report {
            Some(kind) => self.answer_report(id, kind),
            None => self.walk(id),
        }
    }

    /// Offers `root` and every child split off it to the node chain.
    fn walk(&mut self, root: RequestId) {
        let mut offered = VecDeque::from([(root, 0usize)]);
        while let Some((id, start)) = offered.pop_front() {
            let Some(request) = self.context.request_mut(id) else {
                continue;
            };
            if request.status().is_terminal() {
                continue;
            }
            request.advance(RequestStatus::Processing);

            let mut claimed = false;
            for index in start..self.nodes.len() {
                self.context.enter(index);
                match self.nodes[index].try_handle(&mut self.context, id) {
                    NodeOutcome::Declined => continue,
                    NodeOutcome::Handled => {
                        self.claim(id, index);
                        claimed = true;
                    }
                    NodeOutcome::Split(children) => {
                        self.claim(id, index);
                        trace!(
                            request = %id,
                            node = self.nodes[index].name(),
                            children = children.len(),
                            "Request split"
                        );
                        if children.is_empty() {
                            self.finalize_childless(id, index);
                        }
                        offered.extend(children.into_iter().map(|child| (child, index + 1)));
                        claimed = true;
                    }
                }
                break;
            }

            if !claimed {
                self.stats.unhandled += 1;
                self.context.finish_unhandled(id);
            }
        }
    }

    /// Records the handling node and its completion estimate.
    fn claim(&mut self, id: RequestId, index: usize) {
        let now = self.context.now();
        let Some(request) = self.context.request_mut(id) else {
            return;
        };
        request.handler = Some(index);
        if request.status().is_terminal() || request.estimated_completion.is_some() {
            return;
        }
        let estimate = self.nodes[index].estimated_request_duration(request);
        if let Some(duration) = estimate {
            self.context.set_estimated_completion(id, now + duration);
        }
    }

    /// A split with no children has nothing to wait for.
    fn finalize_childless(&mut self, id: RequestId, index: usize) {
        let ready = self
            .context
            .request(id)
            .is_some_and(|r| r.dependencies() == 0 && !r.status().is_terminal());
        if ready {
            self.context.enter(index);
            self.nodes[index].finalize_request(&mut self.context, id);
        }
    }

    // =========================================================================
    // Reports
    // =========================================================================

    fn answer_report(&mut self, id: RequestId, kind: ReportKind) {
        self.stats.reports += 1;
        let mut report = StreamerReport::new(kind);
        self.collect_report(kind, &mut report);
        for node in &self.nodes {
            node.collect_report(kind, &mut report);
        }
        self.context.complete_with(id, RequestOutput::Report(report));
    }

    fn collect_report(&self, kind: ReportKind, report: &mut StreamerReport) {
        match kind {
            ReportKind::Statistics => {
                let context = self.context.stats();
                let stats = self.stats;
                report.push(NAME, "ticks", StatisticValue::Count(stats.ticks));
                report.push(NAME, "submitted", StatisticValue::Count(stats.submitted));
                report.push(NAME, "dispatched", StatisticValue::Count(stats.dispatched));
                report.push(NAME, "unhandled", StatisticValue::Count(stats.unhandled));
                report.push(NAME, "completed", StatisticValue::Count(context.completed));
                report.push(NAME, "failed", StatisticValue::Count(context.failed));
                report.push(NAME, "canceled", StatisticValue::Count(context.canceled));
                report.push(NAME, "callbacks", StatisticValue::Count(context.callbacks));
                report.push(NAME, "cancels_applied", StatisticValue::Count(stats.cancels_applied));
                report.push(
                    NAME,
                    "reschedules_applied",
                    StatisticValue::Count(stats.reschedules_applied),
                );
                report.push(NAME, "not_applied", StatisticValue::Count(stats.not_applied));
            }
            ReportKind::Configuration => {
                report.push(NAME, "idle_wait", StatisticValue::Duration(self.settings.idle_wait()));
                report.push(
                    NAME,
                    "max_dispatch_per_tick",
                    StatisticValue::Count(self.settings.max_dispatch_per_tick as u64),
                );
                report.push(NAME, "stack", StatisticValue::Text(self.node_names().join(" > ")));
            }
            ReportKind::Queues => {
                let pool = self.context.pool();
                report.push(NAME, "queued", StatisticValue::Count(self.queue.len() as u64));
                report.push(NAME, "live_requests", StatisticValue::Count(pool.live_count() as u64));
                report.push(NAME, "free_slots", StatisticValue::Count(pool.free_count() as u64));
            }
        }
    }
}

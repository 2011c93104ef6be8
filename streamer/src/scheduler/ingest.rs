//! Phase 1: admission of submitted requests.
//!
//! Each command kind belongs to a queue class:
//! - Ordered requests enter the global ordered queue
//! - Control requests (cancel, reschedule) act on their target at once
//! - Container requests (wait groups, path stores) queue their children
//! - Link requests complete when the linked external request does

use super::queue::OrderKey;
use super::Scheduler;
use crate::error::RequestError;
use crate::request::{
    buffer_len, Command, CompletionCallback, Deadline, NotApplied, PendingChild, PendingRequest, Priority,
    QueueClass, RequestHandle, RequestId, RequestOutput, RequestStatus, RescheduleData,
    TargetData, Usage, MAX_READ_SIZE,
};
use crate::telemetry::TelemetryEvent;
use tracing::{debug, warn};

impl Scheduler {
    pub(crate) fn ingest(&mut self, pending: PendingRequest) {
        let PendingRequest {
            handle,
            command,
            deadline,
            priority,
            callback,
            buffer,
            children,
        } = pending;
        self.stats.submitted += 1;

        let class = command.kind().queue_class();
        let id = self.admit(&handle, command, deadline, priority, callback);
        match class {
            QueueClass::Ordered => self.ingest_ordered(id, buffer),
            QueueClass::Control => self.ingest_control(id),
            QueueClass::Container => self.ingest_container(id, buffer, children),
            QueueClass::Link => {
                self.advance(id, RequestStatus::Processing);
                let target = match self.context.request(id).map(|r| r.command()) {
                    Some(Command::ExternalLink(TargetData { target })) => Some(target.clone()),
                    _ => None,
                };
                match target {
                    Some(target) => self.context.add_link_watcher(&target, id),
                    None => self.context.complete(id),
                }
            }
        }
    }

    /// Creates the external root for a submission.
    fn admit(
        &mut self,
        handle: &RequestHandle,
        command: Command,
        deadline: Deadline,
        priority: Priority,
        callback: Option<CompletionCallback>,
    ) -> RequestId {
        let pending_id = self.context.next_pending_id();
        let now = self.context.now();
        let id = self.context.pool_mut().create(Usage::External(handle.clone()));
        if let Some(request) = self.context.request_mut(id) {
            request.command = command;
            request.deadline = deadline;
            request.priority = priority;
            request.pending_id = Some(pending_id);
            request.queued_at = Some(now);
            request.callback = callback;
        }
        self.context.register_external(handle, id);
        id
    }

    fn advance(&mut self, id: RequestId, status: RequestStatus) {
        if let Some(request) = self.context.request_mut(id) {
            request.advance(status);
        }
    }

    /// Fails a request before it reaches any queue.
    fn reject(&mut self, id: RequestId, error: RequestError) {
        warn!(request = %id, error = %error, "Request rejected at admission");
        self.advance(id, RequestStatus::Processing);
        self.context.fail(id, error);
    }

    fn enqueue(&mut self, id: RequestId) {
        let Some(request) = self.context.request_mut(id) else {
            return;
        };
        let Some(pending_id) = request.pending_id else {
            return;
        };
        request.advance(RequestStatus::Queued);
        let key = OrderKey::new(request.deadline, request.priority, pending_id);
        let command = request.command.kind();
        self.queue.push(key, id);
        self.telemetry.emit(TelemetryEvent::RequestQueued {
            pending_id,
            command,
            priority: key.priority,
            queue_depth: self.queue.len(),
        });
    }

    // =========================================================================
    // Ordered
    // =========================================================================

    /// Sets up the output buffer of a sized read and queues the request.
    fn ingest_ordered(&mut self, id: RequestId, buffer: Option<Vec<u8>>) {
        if let Some(request) = self.context.request_mut(id) {
            if let Command::Read(read) = &request.command {
                let mut data = buffer.unwrap_or_default();
                if let Some(size) = read.size {
                    let Some(len) = buffer_len(size) else {
                        let error = RequestError::too_large(&read.path, size);
                        self.reject(id, error);
                        return;
                    };
                    if data.is_empty() {
                        if let Some(allocator) = &read.allocator {
                            data = allocator.allocate(len);
                        }
                    }
                    data.resize(len, 0);
                }
                request.data = data;
            }
        }
        self.enqueue(id);
    }

    // =========================================================================
    // Control
    // =========================================================================

    fn ingest_control(&mut self, id: RequestId) {
        self.advance(id, RequestStatus::Processing);
        let command = self.context.request(id).and_then(|r| control_of(r.command()));
        let output = match command {
            Some(ControlCommand::Cancel(target)) => self.apply_cancel(&target),
            Some(ControlCommand::Reschedule(reschedule)) => self.apply_reschedule(reschedule),
            None => RequestOutput::None,
        };
        self.context.complete_with(id, output);
    }

    /// Looks up a live, unfinished target.
    fn live_target(&self, target: &RequestHandle) -> Option<RequestId> {
        let id = self.context.external(target)?;
        let request = self.context.request(id)?;
        (!request.status().is_terminal()).then_some(id)
    }

    fn not_applied(&mut self, target: &RequestHandle, reason: NotApplied, action: &str) -> RequestOutput {
        self.stats.not_applied += 1;
        warn!(handle = %target, reason = ?reason, action, "Control command not applied");
        RequestOutput::NotApplied(reason)
    }

    fn apply_cancel(&mut self, target: &RequestHandle) -> RequestOutput {
        let Some(id) = self.live_target(target) else {
            return self.not_applied(target, NotApplied::TargetFinished, "cancel");
        };

        let queued = self
            .context
            .request(id)
            .and_then(|r| r.pending_id())
            .is_some_and(|pending_id| self.queue.remove(pending_id).is_some());
        self.telemetry.emit(TelemetryEvent::CancelRequested {
            handle_id: target.id(),
            immediate: queued,
        });
        self.stats.cancels_applied += 1;

        if queued {
            debug!(handle = %target, "Canceled queued request");
            self.context.cancel(id);
            return RequestOutput::None;
        }

        // Dispatched or a container: advisory from here on.
        target.mark_cancel_requested();
        if let Some(request) = self.context.request_mut(id) {
            request.cancel_requested = true;
        }
        for child in self.containers.get(&id).cloned().unwrap_or_default() {
            let child_queued = self
                .context
                .request(child)
                .and_then(|r| r.pending_id())
                .is_some_and(|pending_id| self.queue.remove(pending_id).is_some());
            if child_queued {
                self.context.cancel(child);
            }
        }
        debug!(handle = %target, "Cancel recorded for dispatched request");
        RequestOutput::None
    }

    fn apply_reschedule(&mut self, reschedule: RescheduleData) -> RequestOutput {
        let RescheduleData {
            target,
            deadline,
            priority,
        } = reschedule;
        let Some(id) = self.live_target(&target) else {
            return self.not_applied(&target, NotApplied::TargetFinished, "reschedule");
        };

        let mut moved = self.requeue(id, deadline, priority);
        for child in self.containers.get(&id).cloned().unwrap_or_default() {
            moved |= self.requeue(child, deadline, priority);
        }
        if !moved {
            return self.not_applied(&target, NotApplied::TargetDeparted, "reschedule");
        }

        if let Some(request) = self.context.request_mut(id) {
            request.deadline = deadline;
            request.priority = priority;
        }
        self.stats.reschedules_applied += 1;
        self.telemetry.emit(TelemetryEvent::RequestRescheduled {
            handle_id: target.id(),
            deadline,
            priority,
        });
        RequestOutput::None
    }

    /// Moves a queued request to new ordering keys.
    fn requeue(&mut self, id: RequestId, deadline: Deadline, priority: Priority) -> bool {
        let Some(request) = self.context.request_mut(id) else {
            return false;
        };
        let Some(pending_id) = request.pending_id else {
            return false;
        };
        if !self.queue.reschedule(pending_id, deadline, priority) {
            return false;
        }
        request.deadline = deadline;
        request.priority = priority;
        true
    }

    // =========================================================================
    // Containers
    // =========================================================================

    fn ingest_container(&mut self, id: RequestId, buffer: Option<Vec<u8>>, children: Vec<PendingChild>) {
        self.advance(id, RequestStatus::Processing);

        let mut total = 0usize;
        for child in &children {
            let (Command::Read(read), Some(at)) = (&child.command, child.placement) else {
                continue;
            };
            let size = read.size.unwrap_or(u64::MAX);
            let end = buffer_len(size)
                .and_then(|len| at.checked_add(len))
                .filter(|end| (*end as u64) <= MAX_READ_SIZE);
            match end {
                Some(end) => total = total.max(end),
                None => {
                    let error = RequestError::too_large(&read.path, (at as u64).saturating_add(size));
                    self.reject(id, error);
                    return;
                }
            }
        }
        if let Some(request) = self.context.request_mut(id) {
            if matches!(request.command, Command::PathStore(_)) {
                let mut data = buffer.unwrap_or_default();
                data.resize(total, 0);
                request.data = data;
            }
        }

        if children.is_empty() {
            self.context.complete(id);
            return;
        }

        let mut queued = Vec::new();
        for PendingChild { command, placement } in children {
            let link_target = match &command {
                Command::ExternalLink(TargetData { target }) => Some(target.clone()),
                _ => None,
            };
            let child = match self.context.create_child(id, command, placement) {
                Ok(child) => child,
                Err(err) => {
                    self.context.report_pool_error(err);
                    continue;
                }
            };
            match link_target {
                Some(target) => {
                    self.advance(child, RequestStatus::Processing);
                    self.context.add_link_watcher(&target, child);
                }
                None => {
                    let pending_id = self.context.next_pending_id();
                    if let Some(request) = self.context.request_mut(child) {
                        request.pending_id = Some(pending_id);
                    }
                    self.enqueue(child);
                    queued.push(child);
                }
            }
        }
        if !queued.is_empty() {
            self.containers.insert(id, queued);
        }
    }
}

/// Owned copy of a control command's target data.
enum ControlCommand {
    Cancel(RequestHandle),
    Reschedule(RescheduleData),
}

fn control_of(command: &Command) -> Option<ControlCommand> {
    match command {
        Command::Cancel(TargetData { target }) => Some(ControlCommand::Cancel(target.clone())),
        Command::Reschedule(data) => Some(ControlCommand::Reschedule(data.clone())),
        _ => None,
    }
}

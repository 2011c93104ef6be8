//! Telemetry events emitted by the scheduler and stack nodes.
//!
//! The core follows the "emit, don't present" pattern: the scheduler and the
//! nodes push structured [`TelemetryEvent`]s into a [`TelemetrySink`] and
//! never decide how they are shown. Sinks are invoked on the scheduler
//! thread, so they must be fast and must not block.

use crate::request::{CommandKind, Deadline, Priority, RequestStatus};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Telemetry Events
// =============================================================================

/// Events emitted while requests move through the stack.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    // -------------------------------------------------------------------------
    // Request lifecycle
    // -------------------------------------------------------------------------
    /// A request entered the ordered queue.
    RequestQueued {
        pending_id: u64,
        command: CommandKind,
        priority: Priority,
        queue_depth: usize,
    },

    /// A request was handed to the stack.
    RequestDispatched {
        pending_id: u64,
        command: CommandKind,
        wait_time: Duration,
    },

    /// An external request reached a terminal status.
    RequestCompleted {
        handle_id: u64,
        command: CommandKind,
        status: RequestStatus,
        duration: Duration,
    },

    /// A queued request got new ordering keys.
    RequestRescheduled {
        handle_id: u64,
        deadline: Deadline,
        priority: Priority,
    },

    /// A cancel arrived for a request.
    CancelRequested {
        handle_id: u64,
        /// True if the target was still queued and was canceled outright.
        immediate: bool,
    },

    // -------------------------------------------------------------------------
    // Device
    // -------------------------------------------------------------------------
    /// A backend read was issued.
    BackendReadIssued {
        backend: &'static str,
        offset: u64,
        size: u64,
        in_flight: usize,
    },

    /// A backend read finished.
    BackendReadCompleted {
        backend: &'static str,
        size: u64,
        duration: Duration,
        success: bool,
    },

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------
    /// A read was served entirely from cache.
    CacheHit { bytes: u64 },

    /// A read needed at least one backend read.
    CacheMiss { bytes: u64, missing_bytes: u64 },

    /// Unpinned cache blocks were evicted to stay within budget.
    CacheEviction { blocks: usize, bytes: u64 },
}

impl TelemetryEvent {
    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestDispatched { .. } => "request_dispatched",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestRescheduled { .. } => "request_rescheduled",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::BackendReadIssued { .. } => "backend_read_issued",
            Self::BackendReadCompleted { .. } => "backend_read_completed",
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::CacheEviction { .. } => "cache_eviction",
        }
    }
}

// =============================================================================
// Telemetry Sink Trait
// =============================================================================

/// Receives telemetry events.
pub trait TelemetrySink: Send + Sync {
    /// Called when an event occurs. Must be fast and non-blocking.
    fn emit(&self, event: TelemetryEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::RequestQueued {
                pending_id,
                command,
                priority,
                queue_depth,
            } => {
                tracing::trace!(
                    pending_id,
                    command = %command,
                    priority = %priority,
                    queue_depth,
                    "Request queued"
                );
            }
            TelemetryEvent::RequestDispatched {
                pending_id,
                command,
                wait_time,
            } => {
                tracing::trace!(
                    pending_id,
                    command = %command,
                    wait_time_us = wait_time.as_micros() as u64,
                    "Request dispatched"
                );
            }
            TelemetryEvent::RequestCompleted {
                handle_id,
                command,
                status,
                duration,
            } => {
                tracing::debug!(
                    request = handle_id,
                    command = %command,
                    status = %status,
                    duration_ms = duration.as_millis() as u64,
                    "Request completed"
                );
            }
            TelemetryEvent::RequestRescheduled {
                handle_id,
                deadline,
                priority,
            } => {
                tracing::debug!(
                    request = handle_id,
                    deadline = ?deadline.instant(),
                    priority = %priority,
                    "Request rescheduled"
                );
            }
            TelemetryEvent::CancelRequested {
                handle_id,
                immediate,
            } => {
                tracing::debug!(request = handle_id, immediate, "Cancel requested");
            }
            TelemetryEvent::BackendReadIssued {
                backend,
                offset,
                size,
                in_flight,
            } => {
                tracing::trace!(backend, offset, size, in_flight, "Backend read issued");
            }
            TelemetryEvent::BackendReadCompleted {
                backend,
                size,
                duration,
                success,
            } => {
                tracing::trace!(
                    backend,
                    size,
                    duration_us = duration.as_micros() as u64,
                    success,
                    "Backend read completed"
                );
            }
            TelemetryEvent::CacheHit { bytes } => {
                tracing::trace!(bytes, "Cache hit");
            }
            TelemetryEvent::CacheMiss {
                bytes,
                missing_bytes,
            } => {
                tracing::trace!(bytes, missing_bytes, "Cache miss");
            }
            TelemetryEvent::CacheEviction { blocks, bytes } => {
                tracing::debug!(blocks, bytes, "Cache eviction");
            }
        }
    }
}

/// Forwards events to several sinks.
pub struct MultiplexTelemetrySink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl MultiplexTelemetrySink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

impl TelemetrySink for MultiplexTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

impl std::fmt::Debug for MultiplexTelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexTelemetrySink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

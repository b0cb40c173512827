//! # Change Scheduler
//!
//! Turns dirty reported-state fields into coalesced outbound events.
//!
//! ## Flush Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           flush(record, sink)                           │
//! │                                                                         │
//! │  dirty FieldSet ──► event kinds (static field → kind map)              │
//! │                          │                                              │
//! │                          ▼                                              │
//! │   ┌─────────────────────────────────────────────┐                      │
//! │   │ per kind:                                   │                      │
//! │   │   pairing and not setup-safe?   → stay dirty│                      │
//! │   │   rate-limited and not urgent?  → stay dirty│                      │
//! │   │   build payload from latest values          │                      │
//! │   │   sink.send(envelope, version)              │                      │
//! │   │     ok  → clear those dirty bits            │                      │
//! │   │     err → stop, keep everything dirty       │                      │
//! │   └─────────────────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any number of mutations between two flushes collapse into one event per
//! kind carrying the latest value, because payloads are read from the state at
//! flush time rather than recorded per mutation.

use printlink_core::{DispatchMode, EventKind, IntervalKind, IntervalTracker, Intervals, SessionRecord};
use std::time::Instant;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::error::{SyncError, SyncResult};
use crate::protocol::Envelope;

// =============================================================================
// Outbound Sink
// =============================================================================

/// Where flushed envelopes go.
pub trait OutboundSink {
    /// Live connection version to tag envelopes with.
    fn version(&self) -> u64;

    fn is_online(&self) -> bool;

    /// Hands one envelope over. Must not block.
    fn send(&self, envelope: Envelope, version: u64) -> SyncResult<()>;
}

impl OutboundSink for ConnectionHandle {
    fn version(&self) -> u64 {
        ConnectionHandle::version(self)
    }

    fn is_online(&self) -> bool {
        ConnectionHandle::is_online(self)
    }

    fn send(&self, envelope: Envelope, version: u64) -> SyncResult<()> {
        ConnectionHandle::send(self, envelope, version)
    }
}

// =============================================================================
// Flush Report
// =============================================================================

/// Outcome of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Kinds handed to the sink, in send order.
    pub sent: Vec<EventKind>,

    /// Dirty kinds held back by pairing or rate limits.
    pub deferred: Vec<EventKind>,

    /// First send failure. Nothing after it was attempted.
    pub error: Option<SyncError>,
}

impl FlushReport {
    pub fn events_sent(&self) -> usize {
        self.sent.len()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Per-record flush state: interval bookkeeping and the outstanding ping.
#[derive(Debug, Default)]
pub struct Scheduler {
    tracker: IntervalTracker,
    ping_sent_at: Option<Instant>,
}

impl Scheduler {
    pub fn new(intervals: Intervals) -> Self {
        Scheduler {
            tracker: IntervalTracker::new(intervals),
            ping_sent_at: None,
        }
    }

    pub fn intervals(&self) -> &Intervals {
        self.tracker.intervals()
    }

    pub fn update_intervals(&mut self, intervals: Intervals) {
        debug!(?intervals, "Interval table updated");
        self.tracker.update(intervals);
    }

    /// A fresh transport: nothing has been sent on it yet.
    pub fn on_established(&mut self) {
        self.tracker.reset();
        self.ping_sent_at = None;
    }

    /// Sends every dirty kind that is allowed to go out now.
    pub fn flush<S: OutboundSink + ?Sized>(
        &mut self,
        record: &mut SessionRecord,
        sink: &S,
        now: Instant,
    ) -> FlushReport {
        let mut report = FlushReport::default();

        let dirty = record.state.dirty();
        if dirty.is_empty() || !sink.is_online() {
            return report;
        }

        let urgent = record.state.urgent();
        let pairing = record.config.is_pending();
        let version = sink.version();

        for kind in dirty.event_kinds() {
            if pairing && !kind.allowed_while_pending() {
                report.deferred.push(kind);
                continue;
            }

            let fields = kind.fields().intersection(dirty);
            let interval = kind.interval(&record.state);
            let bypass = !urgent.intersection(fields).is_empty();

            if let Some(interval) = interval {
                if !bypass && self.tracker.dispatch_mode(interval, now) == DispatchMode::RateLimit {
                    report.deferred.push(kind);
                    continue;
                }
            }

            let Some(data) = kind.payload(&record.state, fields) else {
                record.state.clear_dirty(fields);
                continue;
            };

            match sink.send(Envelope::event(kind, data), version) {
                Ok(()) => {
                    record.state.clear_dirty(fields);
                    if let Some(interval) = interval {
                        self.tracker.mark_used(interval, now);
                    }
                    debug!(kind = %kind, version, urgent = bypass, "Event queued");
                    report.sent.push(kind);
                }
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Flush stopped");
                    report.error = Some(e);
                    break;
                }
            }
        }

        report
    }

    /// Sends a latency `ping` when the ping interval allows it.
    pub fn poll_ping<S: OutboundSink + ?Sized>(&mut self, sink: &S, now: Instant) -> bool {
        if !sink.is_online() || !self.tracker.is_ready(IntervalKind::Ping, now) {
            return false;
        }
        match sink.send(Envelope::ping(), sink.version()) {
            Ok(()) => {
                self.tracker.mark_used(IntervalKind::Ping, now);
                self.ping_sent_at = Some(now);
                true
            }
            Err(_) => false,
        }
    }

    /// Round trip of the outstanding ping, in milliseconds.
    pub fn on_pong(&mut self, now: Instant) -> Option<u32> {
        self.ping_sent_at
            .take()
            .map(|sent| now.saturating_duration_since(sent).as_millis().min(u32::MAX as u128) as u32)
    }
}

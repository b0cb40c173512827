//! # Intervals
//!
//! Server-provided rate limits for the chattier event kinds.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  IntervalTracker::dispatch_mode(kind, now)                              │
//! │                                                                         │
//! │    last_used[kind] + interval[kind] <= now  ──► Dispatch                │
//! │    otherwise                                 ──► RateLimit (stay dirty)  │
//! │                                                                         │
//! │  mark_used(kind, now) is called once the event left the scheduler.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are passed in by the caller so this module stays clock-free.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// =============================================================================
// Interval Kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalKind {
    Job,
    Temps,
    /// Temperature updates while a heater approaches its target.
    TempsTarget,
    Cpu,
    Reconnect,
    Ping,
    Webcam,
}

impl std::fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntervalKind::Job => "job",
            IntervalKind::Temps => "temps",
            IntervalKind::TempsTarget => "temps_target",
            IntervalKind::Cpu => "cpu",
            IntervalKind::Reconnect => "reconnect",
            IntervalKind::Ping => "ping",
            IntervalKind::Webcam => "webcam",
        };
        f.write_str(s)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Dispatch,
    RateLimit,
}

// =============================================================================
// Intervals (milliseconds)
// =============================================================================

fn default_job() -> u64 {
    5000
}

fn default_temps() -> u64 {
    5000
}

fn default_temps_target() -> u64 {
    2500
}

fn default_cpu() -> u64 {
    30000
}

fn default_reconnect() -> u64 {
    1000
}

fn default_ping() -> u64 {
    20000
}

fn default_webcam() -> u64 {
    1000
}

/// Interval table in milliseconds, as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervals {
    #[serde(default = "default_job")]
    pub job: u64,
    #[serde(default = "default_temps")]
    pub temps: u64,
    #[serde(default = "default_temps_target")]
    pub temps_target: u64,
    #[serde(default = "default_cpu")]
    pub cpu: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect: u64,
    #[serde(default = "default_ping")]
    pub ping: u64,
    #[serde(default = "default_webcam")]
    pub webcam: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            job: default_job(),
            temps: default_temps(),
            temps_target: default_temps_target(),
            cpu: default_cpu(),
            reconnect: default_reconnect(),
            ping: default_ping(),
            webcam: default_webcam(),
        }
    }
}

impl Intervals {
    pub fn get(&self, kind: IntervalKind) -> Duration {
        let ms = match kind {
            IntervalKind::Job => self.job,
            IntervalKind::Temps => self.temps,
            IntervalKind::TempsTarget => self.temps_target,
            IntervalKind::Cpu => self.cpu,
            IntervalKind::Reconnect => self.reconnect,
            IntervalKind::Ping => self.ping,
            IntervalKind::Webcam => self.webcam,
        };
        Duration::from_millis(ms)
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Remembers when each interval kind was last used.
#[derive(Debug, Clone, Default)]
pub struct IntervalTracker {
    intervals: Intervals,
    last_used: HashMap<IntervalKind, Instant>,
}

impl IntervalTracker {
    pub fn new(intervals: Intervals) -> Self {
        Self {
            intervals,
            last_used: HashMap::new(),
        }
    }

    pub fn intervals(&self) -> &Intervals {
        &self.intervals
    }

    /// Replaces the table. Last-used timestamps are kept.
    pub fn update(&mut self, intervals: Intervals) {
        self.intervals = intervals;
    }

    pub fn is_ready(&self, kind: IntervalKind, now: Instant) -> bool {
        self.time_until_ready(kind, now).is_zero()
    }

    pub fn time_until_ready(&self, kind: IntervalKind, now: Instant) -> Duration {
        match self.last_used.get(&kind) {
            Some(last) => (*last + self.intervals.get(kind)).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn dispatch_mode(&self, kind: IntervalKind, now: Instant) -> DispatchMode {
        if self.is_ready(kind, now) {
            DispatchMode::Dispatch
        } else {
            DispatchMode::RateLimit
        }
    }

    pub fn mark_used(&mut self, kind: IntervalKind, now: Instant) {
        self.last_used.insert(kind, now);
    }

    /// Forgets all timestamps, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last_used.clear();
    }
}

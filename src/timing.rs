//! Phase timings for sandbox setup and turns.
//!
//! Purely observational: a trace is rendered as `timing` events for the
//! client and as one summary log line, and never changes control flow.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::ipc::WorkerEvent;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    phase: String,
    duration: Duration,
    elapsed: Duration,
}

/// Ordered list of timed phases.
#[derive(Debug, Clone)]
pub(crate) struct TimingTrace {
    started: Instant,
    entries: Vec<Entry>,
}

impl Default for TimingTrace {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 10_000.0).round() / 10.0
}

impl TimingTrace {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Record a phase that started at `since`, returning its timing event.
    pub(crate) fn record(&mut self, phase: &str, since: Instant) -> WorkerEvent {
        let entry = Entry {
            phase: phase.to_string(),
            duration: since.elapsed(),
            elapsed: self.started.elapsed(),
        };
        let event = Self::event(&entry);
        self.entries.push(entry);
        event
    }

    fn event(entry: &Entry) -> WorkerEvent {
        WorkerEvent::Timing {
            phase: entry.phase.clone(),
            duration_ms: millis(entry.duration),
            elapsed_ms: millis(entry.elapsed),
        }
    }

    /// All recorded phases as `timing` events.
    pub(crate) fn events(&self) -> Vec<WorkerEvent> {
        self.entries.iter().map(Self::event).collect()
    }

    /// One-line rendering, e.g. `sandbox_lookup=12.3ms start_worker=80.0ms total=92.3ms`
    pub(crate) fn summary(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let _ = write!(out, "{}={:.1}ms ", entry.phase, millis(entry.duration));
        }
        let _ = write!(out, "total={:.1}ms", millis(self.started.elapsed()));
        out
    }
}

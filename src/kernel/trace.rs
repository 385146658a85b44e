//! Task event tracing
//!
//! A bounded ring buffer of recent lifecycle and scheduling events plus
//! running counters. Complements the `tracing` log output: the buffer can be
//! inspected programmatically (diagnostics, tests) after the fact.

use super::task::{CpuId, TaskId};
use serde::Serialize;
use std::collections::VecDeque;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceCategory {
    /// Create, destroy, exit
    Lifecycle,
    /// Block, resume, dispatch
    Scheduler,
    /// Sender bookkeeping and notifications
    Ipc,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            TraceCategory::Lifecycle => "TASK",
            TraceCategory::Scheduler => "SCHED",
            TraceCategory::Ipc => "IPC",
        })
    }
}

/// A single trace event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    /// Monotonic sequence number
    pub seq: u64,
    pub category: TraceCategory,
    pub name: &'static str,
    pub tid: TaskId,
    pub cpu: Option<CpuId>,
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>6}] {:<5} {} {}", self.seq, self.category, self.name, self.tid)?;
        if let Some(cpu) = self.cpu {
            write!(f, " on {}", cpu)?;
        }
        Ok(())
    }
}

/// Running counters, kept even when event recording is disabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    pub created: u64,
    pub destroyed: u64,
    pub switches: u64,
    pub ipis: u64,
    pub aborted_senders: u64,
}

/// Event recorder
#[derive(Debug)]
pub struct Tracer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    next_seq: u64,
    stats: TraceStats,
}

impl Tracer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
            stats: TraceStats::default(),
        }
    }

    pub fn record(
        &mut self,
        category: TraceCategory,
        name: &'static str,
        tid: TaskId,
        cpu: Option<CpuId>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(TraceEvent {
            seq,
            category,
            name,
            tid,
            cpu,
        });
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TraceStats {
        &mut self.stats
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

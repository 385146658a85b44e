//! Task records
//!
//! A task is a schedulable execution context with its own address space and
//! register state. Records live in the fixed-capacity task table and are
//! addressed by [`TaskId`]; they are never allocated or freed individually.

use super::config::TASK_NAME_LEN;
use super::list::{List, ListOwner};
use super::memory::OwnedPages;
use super::table::PagerRef;
use crate::platform::Arch;
use serde::{Serialize, Serializer};

/// Task handle: slot index + 1, reused after the task is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Handle of the per-core idle task. Never returned by lookups.
    pub const IDLE: TaskId = TaskId(0);
    /// The bootstrap task; it can never be destroyed.
    pub const ROOT: TaskId = TaskId(1);

    pub(crate) fn from_index(index: usize) -> Self {
        TaskId(index as u32 + 1)
    }

    /// Slot index, or `None` for the idle handle
    pub(crate) fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }

    pub fn is_idle(self) -> bool {
        self == TaskId::IDLE
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Core identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CpuId(pub usize);

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Task slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Free slot
    Unused,
    /// Eligible for dispatch (queued or executing)
    Runnable,
    /// Waiting for someone to resume it
    Blocked,
}

/// Whom a task is waiting to receive from. Interpreted by the IPC layer only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitFor {
    /// Not receiving
    Deny,
    /// Any sender
    Any,
    /// One specific sender
    Task(TaskId),
}

/// Fixed-size task name
///
/// Longer names are truncated on a character boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskName {
    buf: [u8; TASK_NAME_LEN],
    len: usize,
}

impl TaskName {
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(TASK_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = [0u8; TASK_NAME_LEN];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { buf, len }
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from a &str cut on a char boundary.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl Default for TaskName {
    fn default() -> Self {
        Self::new("")
    }
}

impl std::fmt::Debug for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A slot in the task table
pub(crate) struct Task<A: Arch> {
    pub tid: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    /// Destruction requested; never scheduled again
    pub destroyed: bool,
    pub pager: Option<PagerRef>,
    /// Number of live tasks using this one as their pager
    pub ref_count: u32,
    pub quantum: u32,
    pub timeout: u32,
    pub wait_for: WaitFor,
    /// Core currently executing this task
    pub running_on: Option<CpuId>,
    /// Tasks blocked sending to this one
    pub senders: List,
    pub pages: Vec<OwnedPages>,
    pub vm: Option<A::Vm>,
    pub context: Option<A::Context>,
}

impl<A: Arch> Task<A> {
    pub fn vacant(index: usize) -> Self {
        Self {
            tid: TaskId::from_index(index),
            name: TaskName::default(),
            state: TaskState::Unused,
            destroyed: false,
            pager: None,
            ref_count: 0,
            quantum: 0,
            timeout: 0,
            wait_for: WaitFor::Deny,
            running_on: None,
            senders: List::new(ListOwner::Senders(index)),
            pages: Vec::new(),
            vm: None,
            context: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != TaskState::Unused
    }
}

/// Snapshot of a task, for lookups and diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub tid: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    pub destroyed: bool,
    pub pager: Option<TaskId>,
    pub ref_count: u32,
    pub quantum: u32,
    pub timeout: u32,
    pub wait_for: WaitFor,
    pub running_on: Option<CpuId>,
    pub senders: Vec<TaskId>,
    pub owned_pages: usize,
}

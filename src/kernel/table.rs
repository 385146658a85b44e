//! The task table
//!
//! A fixed-capacity arena of task slots plus everything threaded through it:
//! the shared ready queue, the active task list, per-slot link arrays and
//! the per-core variables. One instance lives behind the kernel's lock.

use super::error::{TaskError, TaskResult};
use super::list::{Link, List, ListOwner};
use super::task::{CpuId, Task, TaskId, TaskInfo, TaskState};
use super::trace::Tracer;
use crate::platform::Arch;

/// A counted reference to a pager task
///
/// Only [`TaskTable::acquire_pager`] creates one (incrementing the pager's
/// reference count) and only [`TaskTable::release_pager`] consumes one
/// (decrementing it), so the two always pair up.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub(crate) struct PagerRef(TaskId);

impl PagerRef {
    pub fn tid(&self) -> TaskId {
        self.0
    }
}

/// Per-core variables
pub(crate) struct CpuVar<A: Arch> {
    /// Task executing on this core (`TaskId::IDLE` for the idle task)
    pub current: TaskId,
    pub idle: A::Context,
}

pub(crate) struct TaskTable<A: Arch> {
    pub tasks: Vec<Task<A>>,
    /// Ready queue or sender list membership, one per slot
    pub wait_links: Vec<Link>,
    /// Active list membership, one per slot
    pub active_links: Vec<Link>,
    /// ABORTED notifications still to be delivered to the task in each
    /// slot. A pinned slot is never reallocated, so a notification cannot
    /// reach a later task that reused the handle.
    pub abort_pins: Vec<u32>,
    pub ready: List,
    pub active: List,
    pub cpus: Vec<CpuVar<A>>,
    pub tracer: Tracer,
}

impl<A: Arch> TaskTable<A> {
    pub fn new(max_tasks: usize, idle: Vec<A::Context>, trace_capacity: usize) -> Self {
        Self {
            tasks: (0..max_tasks).map(Task::vacant).collect(),
            wait_links: vec![Link::default(); max_tasks],
            active_links: vec![Link::default(); max_tasks],
            abort_pins: vec![0; max_tasks],
            ready: List::new(ListOwner::Ready),
            active: List::new(ListOwner::Active),
            cpus: idle
                .into_iter()
                .map(|idle| CpuVar {
                    current: TaskId::IDLE,
                    idle,
                })
                .collect(),
            tracer: Tracer::new(trace_capacity),
        }
    }

    /// Live task by handle; `None` for the idle handle, out-of-range and
    /// unused slots
    pub fn get(&self, tid: TaskId) -> Option<&Task<A>> {
        self.tasks.get(tid.index()?).filter(|task| task.is_alive())
    }

    pub fn get_mut(&mut self, tid: TaskId) -> Option<&mut Task<A>> {
        self.tasks.get_mut(tid.index()?).filter(|task| task.is_alive())
    }

    /// Like [`get_mut`](Self::get_mut), for callers whose contract requires
    /// a live task
    pub fn expect_mut(&mut self, tid: TaskId, op: &str) -> &mut Task<A> {
        self.get_mut(tid)
            .unwrap_or_else(|| panic!("{}: task {} does not exist", op, tid))
    }

    /// First unused, unpinned slot, by linear scan
    pub fn alloc_slot(&self) -> Option<usize> {
        self.tasks
            .iter()
            .zip(&self.abort_pins)
            .position(|(task, &pins)| task.state == TaskState::Unused && pins == 0)
    }

    pub fn acquire_pager(&mut self, pager: TaskId) -> TaskResult<PagerRef> {
        let task = self
            .get_mut(pager)
            .filter(|task| !task.destroyed)
            .ok_or(TaskError::InvalidArgument)?;
        task.ref_count += 1;
        Ok(PagerRef(pager))
    }

    pub fn release_pager(&mut self, pager: PagerRef) {
        // A referenced pager cannot have been destroyed.
        let task = self.expect_mut(pager.0, "release_pager");
        assert!(task.ref_count > 0, "pager {} reference count underflow", pager.0);
        task.ref_count -= 1;
    }

    pub fn enqueue(&mut self, index: usize) {
        self.ready.push_back(&mut self.wait_links, index);
    }

    pub fn dequeue(&mut self, index: usize) -> bool {
        self.ready.remove(&mut self.wait_links, index)
    }

    pub fn deactivate(&mut self, index: usize) -> bool {
        self.active.remove(&mut self.active_links, index)
    }

    /// Take a slot out of whichever wait list holds it
    pub fn unlink_wait(&mut self, index: usize) {
        match self.wait_links[index].owner() {
            Some(ListOwner::Ready) => {
                self.ready.remove(&mut self.wait_links, index);
            }
            Some(ListOwner::Senders(receiver)) => {
                self.tasks[receiver]
                    .senders
                    .remove(&mut self.wait_links, index);
            }
            Some(ListOwner::Active) | None => {}
        }
    }

    /// Empty a task's sender list, returning the senders in order.
    ///
    /// Each returned sender is pinned until [`unpin_abort`](Self::unpin_abort).
    pub fn detach_senders(&mut self, index: usize) -> Vec<TaskId> {
        let mut senders = Vec::new();
        while let Some(sender) = self.tasks[index].senders.pop_front(&mut self.wait_links) {
            self.abort_pins[sender] += 1;
            senders.push(TaskId::from_index(sender));
        }
        senders
    }

    pub fn unpin_abort(&mut self, index: usize) {
        assert!(self.abort_pins[index] > 0, "slot {} is not pinned", index);
        self.abort_pins[index] -= 1;
    }

    /// Register context of `tid` as seen from core `cpu`
    pub fn context(&self, tid: TaskId, cpu: usize) -> &A::Context {
        match tid.index() {
            None => &self.cpus[cpu].idle,
            Some(index) => self.tasks[index]
                .context
                .as_ref()
                .unwrap_or_else(|| panic!("task {} has no register context", tid)),
        }
    }

    pub fn info(&self, index: usize) -> TaskInfo {
        let task = &self.tasks[index];
        TaskInfo {
            tid: task.tid,
            name: task.name,
            state: task.state,
            destroyed: task.destroyed,
            pager: task.pager.as_ref().map(PagerRef::tid),
            ref_count: task.ref_count,
            quantum: task.quantum,
            timeout: task.timeout,
            wait_for: task.wait_for,
            running_on: task.running_on,
            senders: task
                .senders
                .iter(&self.wait_links)
                .map(TaskId::from_index)
                .collect(),
            owned_pages: task.pages.len(),
        }
    }

    /// Check the table's structural invariants
    pub fn verify(&self) -> Result<(), String> {
        let mut queued = 0;
        let mut alive = 0;

        for (index, task) in self.tasks.iter().enumerate() {
            let tid = task.tid;
            let in_ready = self.ready.contains(&self.wait_links, index);
            queued += in_ready as usize;

            if !task.is_alive() {
                if self.wait_links[index].owner().is_some()
                    || self.active_links[index].owner().is_some()
                {
                    return Err(format!("unused slot {} is still linked", tid));
                }
                if task.ref_count != 0 || task.pager.is_some() || task.running_on.is_some() {
                    return Err(format!("unused slot {} holds stale state", tid));
                }
                continue;
            }
            alive += 1;

            let should_queue =
                task.state == TaskState::Runnable && !task.destroyed && task.running_on.is_none();
            if in_ready != should_queue {
                return Err(format!(
                    "{} ({:?}, destroyed={}, running_on={:?}) in ready queue: {}",
                    tid, task.state, task.destroyed, task.running_on, in_ready
                ));
            }

            if let Some(cpu) = task.running_on
                && self.cpus.get(cpu.0).map(|var| var.current) != Some(tid)
            {
                return Err(format!("{} claims to run on {} but is not current there", tid, cpu));
            }

            let dependents = self
                .tasks
                .iter()
                .filter(|other| other.is_alive())
                .filter(|other| other.pager.as_ref().map(PagerRef::tid) == Some(tid))
                .count();
            if task.ref_count as usize != dependents {
                return Err(format!(
                    "{} has ref_count {} but {} dependents",
                    tid, task.ref_count, dependents
                ));
            }

            if !task.destroyed && !self.active.contains(&self.active_links, index) {
                return Err(format!("{} is missing from the active list", tid));
            }
        }

        if queued != self.ready.len() {
            return Err(format!(
                "ready queue length {} but {} slots are queued",
                self.ready.len(),
                queued
            ));
        }
        if self.active.len() > alive {
            return Err(format!(
                "active list has {} entries for {} live tasks",
                self.active.len(),
                alive
            ));
        }

        for (cpu, var) in self.cpus.iter().enumerate() {
            if var.current.is_idle() {
                continue;
            }
            match self.get(var.current) {
                Some(task) if task.running_on == Some(CpuId(cpu)) => {}
                _ => {
                    return Err(format!(
                        "cpu{} runs {} which does not point back",
                        cpu, var.current
                    ));
                }
            }
        }

        Ok(())
    }
}

//! Round-robin scheduler
//!
//! One FIFO ready queue shared by all cores. A core picks the front of the
//! queue; if the queue is empty it keeps running its current task (when that
//! task is still runnable) or falls back to its idle task. A task that is
//! switched away from while runnable goes to the back of the queue.

use super::Kernel;
use super::table::TaskTable;
use super::task::{CpuId, TaskId, TaskState};
use super::trace::TraceCategory;
use crate::platform::{Arch, Hal, Ipi};

impl<A: Arch> TaskTable<A> {
    /// Choose the next task for core `cpu`. Never fails.
    pub(crate) fn pick_next(&mut self, cpu: usize) -> TaskId {
        while let Some(index) = self.ready.pop_front(&mut self.wait_links) {
            if !self.tasks[index].destroyed {
                return TaskId::from_index(index);
            }
        }

        let current = self.cpus[cpu].current;
        match self.get(current) {
            Some(task) if task.state == TaskState::Runnable && !task.destroyed => current,
            _ => TaskId::IDLE,
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Run the scheduler on `cpu` and switch to its choice.
    ///
    /// Returns the task now current on `cpu`.
    pub fn switch(&self, cpu: CpuId) -> TaskId {
        let index = self.cpu_index(cpu);
        let mut table = self.table.lock();
        let next = self.switch_locked(&mut table, index);
        drop(table);
        self.quiesced.notify_all();
        next
    }

    /// Give up the rest of the current time slice
    pub fn yield_now(&self, cpu: CpuId) -> TaskId {
        self.switch(cpu)
    }

    /// Timer interrupt on `cpu`: charge the current task one tick and
    /// preempt it once its quantum is used up. The idle task is always
    /// preempted.
    pub fn tick(&self, cpu: CpuId) -> TaskId {
        let index = self.cpu_index(cpu);
        let mut table = self.table.lock();
        let current = table.cpus[index].current;
        let expired = match table.get_mut(current) {
            Some(task) => {
                task.quantum = task.quantum.saturating_sub(1);
                task.quantum == 0
            }
            None => true,
        };
        if !expired {
            return current;
        }

        let next = self.switch_locked(&mut table, index);
        drop(table);
        self.quiesced.notify_all();
        next
    }

    /// Inter-processor interrupt received on `cpu`
    pub fn handle_ipi(&self, cpu: CpuId, ipi: Ipi) -> TaskId {
        match ipi {
            Ipi::Reschedule => self.switch(cpu),
        }
    }

    pub(crate) fn switch_locked(&self, table: &mut TaskTable<H>, cpu: usize) -> TaskId {
        let prev = table.cpus[cpu].current;
        let next = table.pick_next(cpu);

        if let Some(task) = table.get_mut(next) {
            task.quantum = self.config.quantum;
        }
        if next == prev {
            return next;
        }

        if let Some(index) = prev.index() {
            let task = &mut table.tasks[index];
            task.running_on = None;
            if task.state == TaskState::Runnable && !task.destroyed {
                table.enqueue(index);
            }
        }
        if let Some(index) = next.index() {
            table.tasks[index].running_on = Some(CpuId(cpu));
        }
        table.cpus[cpu].current = next;

        table.tracer.stats_mut().switches += 1;
        table
            .tracer
            .record(TraceCategory::Scheduler, "dispatch", next, Some(CpuId(cpu)));
        tracing::debug!(cpu, %prev, %next, "switching tasks");

        self.hal
            .switch(CpuId(cpu), table.context(prev, cpu), table.context(next, cpu));
        next
    }
}

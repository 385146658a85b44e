//! Task lifecycle: create, block, resume, exit, destroy
//!
//! These are the only places where a slot changes state:
//!
//! ```text
//! Unused --create--> Blocked --resume--> Runnable --block--> Blocked
//!                                            |                  |
//!                                            +-----destroy------+--> Unused
//! ```
//!
//! Destruction is the delicate one: the target may be executing on another
//! core. It is marked destroyed first (so no core picks it again), then the
//! destroyer waits until it has been switched out everywhere before any of
//! its resources are released. The slot only becomes `Unused` once every
//! release has finished, so a concurrent `create` can never reuse it early.

use super::Kernel;
use super::error::{TaskError, TaskResult};
use super::hinavm::{Image, Instruction};
use super::memory::{AllocKind, OwnedPages, VAddr};
use super::table::TaskTable;
use super::task::{CpuId, Task, TaskId, TaskName, TaskState};
use super::trace::TraceCategory;
use crate::platform::{EntryPoint, Exception, Hal, Ipi, Notifications};
use parking_lot::MutexGuard;

impl<H: Hal> Kernel<H> {
    /// Create a task starting at user address `ip`.
    ///
    /// The task is runnable when this returns. `pager`, if given, must be a
    /// live task; it cannot be destroyed while the new task exists.
    pub fn create(&self, name: &str, ip: VAddr, pager: Option<TaskId>) -> TaskResult<TaskId> {
        let mut table = self.table.lock();
        let index = table.alloc_slot().ok_or(TaskError::TooManyTasks)?;
        let tid = self.init_task(&mut table, index, name, EntryPoint::user(ip), pager)?;
        self.activate(&mut table, index);

        tracing::trace!(%tid, name, "created a task");
        Ok(tid)
    }

    /// Create a task running a HinaVM program.
    ///
    /// The instructions are copied into a freshly allocated block owned by
    /// the task, and the interpreter's run routine becomes its entry point.
    pub fn create_hinavm(
        &self,
        name: &str,
        insts: &[Instruction],
        pager: Option<TaskId>,
    ) -> TaskResult<TaskId> {
        let Some(image) = Image::new(insts) else {
            tracing::warn!(name, num_insts = insts.len(), "too many HinaVM instructions");
            return Err(TaskError::InvalidArgument);
        };

        let mut table = self.table.lock();
        let index = table.alloc_slot().ok_or(TaskError::TooManyTasks)?;

        let size = Image::block_size();
        let paddr = self
            .hal
            .alloc_pages(size, AllocKind::Uninitialized)
            .ok_or(TaskError::NoMemory)?;
        let vaddr = self.hal.paddr_to_vaddr(paddr);
        let bytes = image.as_bytes();
        // SAFETY: `paddr` was just allocated with `size >= bytes.len()` bytes
        // and nothing else refers to it yet.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), vaddr.as_mut_ptr(), bytes.len()) };

        let entry = EntryPoint::kernel(self.hal.hinavm_entry(), vaddr);
        let tid = match self.init_task(&mut table, index, name, entry, pager) {
            Ok(tid) => tid,
            Err(e) => {
                self.hal.free_pages(paddr, size);
                return Err(e);
            }
        };
        table.tasks[index].pages.push(OwnedPages { paddr, size });
        self.activate(&mut table, index);

        tracing::trace!(%tid, name, num_insts = insts.len(), "created a HinaVM task");
        Ok(tid)
    }

    /// Mark a runnable task blocked and take it off the ready queue.
    ///
    /// A task executing on some core keeps running until that core next
    /// switches.
    ///
    /// # Panics
    /// If `tid` is the idle task, unused, or not runnable.
    pub fn block(&self, tid: TaskId) {
        let mut table = self.table.lock();
        Self::block_locked(&mut table, tid);
    }

    /// Make a blocked task runnable again, queueing it at the back.
    ///
    /// # Panics
    /// If `tid` is the idle task, unused, or not blocked.
    pub fn resume(&self, tid: TaskId) {
        let mut table = self.table.lock();
        Self::resume_locked(&mut table, tid);
    }

    /// The current task on `cpu` stops: its pager is told why, the task
    /// blocks, and the core switches away. The pager is expected to destroy
    /// it.
    ///
    /// Returns the task now current on `cpu`.
    ///
    /// # Panics
    /// If `cpu` is idle, or the exiting task has no pager (the root task).
    pub fn exit(&self, cpu: CpuId, exception: Exception) -> TaskId {
        let index = self.cpu_index(cpu);
        let mut table = self.table.lock();
        let tid = table.cpus[index].current;
        assert!(!tid.is_idle(), "the idle task on {} tried to exit", cpu);

        let task = table.expect_mut(tid, "exit");
        let pager = match &task.pager {
            Some(pager) => pager.tid(),
            None => panic!("task {} without a pager exited ({})", tid, exception),
        };
        if task.state == TaskState::Runnable {
            Self::block_locked(&mut table, tid);
        }
        table
            .tracer
            .record(TraceCategory::Lifecycle, "exit", tid, Some(cpu));

        let next = self.switch_locked(&mut table, index);
        drop(table);
        self.quiesced.notify_all();

        tracing::trace!(%tid, %pager, %exception, "task exited");
        self.hal.exception(pager, tid, exception);
        next
    }

    /// Destroy a task, releasing everything it owns.
    ///
    /// `cpu` is the calling core. If the task is executing elsewhere this
    /// waits, re-sending reschedule IPIs, until it is switched out; there
    /// is no deadline.
    ///
    /// # Errors
    /// - [`TaskError::InvalidArgument`] for the root task, or a task whose
    ///   destruction is already in progress
    /// - [`TaskError::StillUsed`] while other tasks use it as their pager
    ///
    /// # Panics
    /// If `tid` is the idle task, unused, or the current task of `cpu`.
    pub fn destroy(&self, cpu: CpuId, tid: TaskId) -> TaskResult<()> {
        let cpu_index = self.cpu_index(cpu);
        assert!(!tid.is_idle(), "tried to destroy an idle task");

        let mut table = self.table.lock();
        let Some(task) = table.get(tid) else {
            panic!("tried to destroy unused task {}", tid);
        };

        if tid == TaskId::ROOT {
            tracing::warn!("tried to destroy the root task");
            return Err(TaskError::InvalidArgument);
        }
        assert_ne!(
            table.cpus[cpu_index].current, tid,
            "{} tried to destroy its own current task",
            cpu
        );
        if task.destroyed {
            tracing::warn!(%tid, "task is already being destroyed");
            return Err(TaskError::InvalidArgument);
        }
        if task.ref_count > 0 {
            tracing::warn!(
                %tid,
                name = %task.name,
                ref_count = task.ref_count,
                "task is still referenced by other tasks"
            );
            return Err(TaskError::StillUsed);
        }

        tracing::trace!(%tid, name = %task.name, "destroying a task");
        let index = tid.index().unwrap_or_default();
        table.tasks[index].destroyed = true;
        table.dequeue(index);

        self.wait_until_switched_out(&mut table, cpu, index);

        // Quiescent: no core touches the task any more. Detach it.
        let senders = table.detach_senders(index);
        table.unlink_wait(index);
        table.deactivate(index);
        let task = &mut table.tasks[index];
        let vm = task.vm.take();
        let context = task.context.take();
        let pages = std::mem::take(&mut task.pages);
        drop(table);

        self.abort_senders(&senders);
        if let Some(context) = context {
            self.hal.task_destroy(context);
        }
        if let Some(vm) = vm {
            self.hal.vm_destroy(vm);
        }
        for block in pages {
            self.hal.free_pages(block.paddr, block.size);
        }

        let mut table = self.table.lock();
        let pager = table.tasks[index].pager.take();
        table.tasks[index] = Task::vacant(index);
        if let Some(pager) = pager {
            table.release_pager(pager);
        }

        table.tracer.stats_mut().destroyed += 1;
        table
            .tracer
            .record(TraceCategory::Lifecycle, "destroy", tid, Some(cpu));
        Ok(())
    }

    /// Deliver ABORTED to senders detached from a destroyed receiver.
    ///
    /// The notifier runs unlocked and may destroy or create tasks. Senders
    /// stay pinned until their turn, so a sender destroyed in the meantime
    /// is skipped and its handle cannot have been reused.
    fn abort_senders(&self, senders: &[TaskId]) {
        for &sender in senders {
            let Some(index) = sender.index() else {
                continue;
            };
            let deliver = {
                let mut table = self.table.lock();
                let alive = table.get(sender).is_some_and(|task| !task.destroyed);
                if alive {
                    table.tracer.stats_mut().aborted_senders += 1;
                    table
                        .tracer
                        .record(TraceCategory::Ipc, "aborted", sender, None);
                }
                alive
            };

            if deliver {
                self.hal.notify(sender, Notifications::ABORTED);
            } else {
                tracing::trace!(%sender, "sender went away before it could be aborted");
            }
            self.table.lock().unpin_abort(index);
        }
    }

    fn wait_until_switched_out(
        &self,
        table: &mut MutexGuard<'_, TaskTable<H>>,
        cpu: CpuId,
        index: usize,
    ) {
        let warn_every = self.config.stall_warn_rounds.max(1);
        let mut rounds: u32 = 0;

        while let Some(remote) = table.tasks[index].running_on {
            self.hal.send_ipi(cpu, Ipi::Reschedule);
            table.tracer.stats_mut().ipis += 1;

            rounds = rounds.wrapping_add(1);
            if rounds % warn_every == 0 {
                tracing::warn!(
                    tid = %TaskId::from_index(index),
                    %remote,
                    rounds,
                    "still waiting for the task to be switched out"
                );
            }
            self.quiesced.wait_for(table, self.config.ipi_retry);
        }
    }

    /// Fill slot `index` with a new Blocked task.
    ///
    /// Either succeeds completely or leaves the slot, the pager and the
    /// platform exactly as they were.
    fn init_task(
        &self,
        table: &mut TaskTable<H>,
        index: usize,
        name: &str,
        entry: EntryPoint,
        pager: Option<TaskId>,
    ) -> TaskResult<TaskId> {
        let tid = TaskId::from_index(index);
        let pager = match pager {
            Some(pager) => Some(table.acquire_pager(pager)?),
            None => None,
        };

        let arch = self.hal.vm_init().and_then(|vm| {
            match self.hal.task_init(tid, &vm, entry) {
                Ok(context) => Ok((vm, context)),
                Err(e) => {
                    self.hal.vm_destroy(vm);
                    Err(e)
                }
            }
        });
        let (vm, context) = match arch {
            Ok(arch) => arch,
            Err(e) => {
                if let Some(pager) = pager {
                    table.release_pager(pager);
                }
                return Err(e);
            }
        };

        let mut task = Task::vacant(index);
        task.name = TaskName::new(name);
        task.state = TaskState::Blocked;
        task.pager = pager;
        task.vm = Some(vm);
        task.context = Some(context);
        table.tasks[index] = task;
        Ok(tid)
    }

    /// Link a freshly initialized task into the active list and make it
    /// runnable
    fn activate(&self, table: &mut TaskTable<H>, index: usize) {
        let tid = TaskId::from_index(index);
        table.active.push_back(&mut table.active_links, index);
        table.tracer.stats_mut().created += 1;
        table
            .tracer
            .record(TraceCategory::Lifecycle, "create", tid, None);
        Self::resume_locked(table, tid);
    }

    pub(crate) fn block_locked(table: &mut TaskTable<H>, tid: TaskId) {
        assert!(!tid.is_idle(), "tried to block an idle task");
        let task = table.expect_mut(tid, "block");
        assert_eq!(
            task.state,
            TaskState::Runnable,
            "tried to block {} which is not runnable",
            tid
        );
        task.state = TaskState::Blocked;

        if let Some(index) = tid.index() {
            table.dequeue(index);
        }
        table
            .tracer
            .record(TraceCategory::Scheduler, "block", tid, None);
    }

    pub(crate) fn resume_locked(table: &mut TaskTable<H>, tid: TaskId) {
        assert!(!tid.is_idle(), "tried to resume an idle task");
        let task = table.expect_mut(tid, "resume");
        assert_eq!(
            task.state,
            TaskState::Blocked,
            "tried to resume {} which is not blocked",
            tid
        );
        task.state = TaskState::Runnable;
        let queue = !task.destroyed && task.running_on.is_none();

        if let Some(index) = tid.index() {
            // A resumed task is no longer waiting to send anywhere.
            table.unlink_wait(index);
            if queue {
                table.enqueue(index);
            }
        }
        table
            .tracer
            .record(TraceCategory::Scheduler, "resume", tid, None);
    }
}

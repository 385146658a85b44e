//! The kernel - task table, scheduling, and task lifecycle
//!
//! All task state lives in one [`Kernel`] object:
//! - A fixed-capacity task table, indexed by [`TaskId`]
//! - One FIFO ready queue shared by every core
//! - Per-core current/idle task variables
//!
//! Cores call in with their [`CpuId`]. Every mutation happens under a single
//! lock with short, non-blocking critical sections; the only wait is a
//! destroyer waiting for a remote core to stop running its target.

pub mod config;
pub mod error;
pub mod hinavm;
pub mod ipc;
pub mod lifecycle;
pub mod memory;
pub mod sched;
pub mod task;
pub mod trace;

mod list;
mod table;


pub use config::Config;
pub use error::{TaskError, TaskResult};
pub use task::{CpuId, TaskId, TaskInfo, TaskName, TaskState, WaitFor};

use crate::platform::Hal;
use memory::OwnedPages;
use parking_lot::{Condvar, Mutex};
use table::TaskTable;
use trace::{TraceEvent, TraceStats};

/// The task management core
pub struct Kernel<H: Hal> {
    config: Config,
    hal: H,
    table: Mutex<TaskTable<H>>,
    /// Signalled whenever a core switches away from a task
    quiesced: Condvar,
}

impl<H: Hal> Kernel<H> {
    /// Create a kernel with an empty task table and one idle task per core
    pub fn new(config: Config, hal: H) -> TaskResult<Self> {
        config.validate()?;
        let idle = (0..config.num_cpus)
            .map(|cpu| hal.idle_init(CpuId(cpu)))
            .collect::<TaskResult<Vec<_>>>()?;
        let table = TaskTable::new(config.max_tasks, idle, config.trace_capacity);

        tracing::debug!(
            max_tasks = config.max_tasks,
            num_cpus = config.num_cpus,
            "task table initialized"
        );

        Ok(Self {
            config,
            hal,
            table: Mutex::new(table),
            quiesced: Condvar::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Task executing on `cpu` (`TaskId::IDLE` when idle)
    pub fn current(&self, cpu: CpuId) -> TaskId {
        let cpu = self.cpu_index(cpu);
        self.table.lock().cpus[cpu].current
    }

    /// Look up a live task. Never returns the idle task.
    pub fn find(&self, tid: TaskId) -> Option<TaskInfo> {
        let table = self.table.lock();
        table.get(tid)?;
        tid.index().map(|index| table.info(index))
    }

    /// All active tasks, oldest first
    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        let table = self.table.lock();
        table
            .active
            .iter(&table.active_links)
            .map(|index| table.info(index))
            .collect()
    }

    /// Tasks waiting in the ready queue, front first
    pub fn ready_queue(&self) -> Vec<TaskId> {
        let table = self.table.lock();
        table
            .ready
            .iter(&table.wait_links)
            .map(TaskId::from_index)
            .collect()
    }

    /// Page blocks owned by `tid`
    pub fn owned_pages(&self, tid: TaskId) -> Vec<OwnedPages> {
        let table = self.table.lock();
        table
            .get(tid)
            .map(|task| task.pages.clone())
            .unwrap_or_default()
    }

    /// Log every active task
    pub fn dump(&self) {
        for task in self.active_tasks() {
            tracing::info!(
                tid = %task.tid,
                name = %task.name,
                state = ?task.state,
                destroyed = task.destroyed,
                pager = ?task.pager,
                ref_count = task.ref_count,
                running_on = ?task.running_on,
                senders = ?task.senders,
                "task"
            );
        }
    }

    /// Active tasks as pretty-printed JSON
    pub fn dump_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.active_tasks())
    }

    pub fn stats(&self) -> TraceStats {
        self.table.lock().tracer.stats()
    }

    /// Recorded events, oldest first
    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.table.lock().tracer.events().cloned().collect()
    }

    pub fn trace_reset(&self) {
        self.table.lock().tracer.clear();
    }

    /// Check the task table invariants, describing the first violation
    pub fn verify(&self) -> Result<(), String> {
        self.table.lock().verify()
    }

    fn cpu_index(&self, cpu: CpuId) -> usize {
        assert!(
            cpu.0 < self.config.num_cpus,
            "{} is not configured ({} cores)",
            cpu,
            self.config.num_cpus
        );
        cpu.0
    }
}

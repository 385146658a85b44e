//! Kernel configuration
//!
//! Sizes of the fixed tables are compile-time maxima; the actual table sizes
//! and scheduling parameters are picked per kernel instance.

use super::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timer interrupt frequency
pub const TICK_HZ: u32 = 1000;

/// Upper bound for the task table size
pub const NUM_TASKS_MAX: usize = 64;

/// Upper bound for the number of cores
pub const NUM_CPUS_MAX: usize = 32;

/// Size of the task name buffer, in bytes
pub const TASK_NAME_LEN: usize = 16;

/// Time slice handed to a task on dispatch (20ms), in ticks
pub const TASK_QUANTUM: u32 = 20 * (TICK_HZ / 1000);

/// Configuration for a [`Kernel`](super::Kernel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of slots in the task table
    pub max_tasks: usize,
    /// Number of cores (one idle task each)
    pub num_cpus: usize,
    /// Ticks given to a task each time it is dispatched
    pub quantum: u32,
    /// How long a destroyer waits before re-sending the reschedule IPI
    pub ipi_retry: Duration,
    /// Log a warning every this many unanswered IPI rounds
    pub stall_warn_rounds: u32,
    /// Number of trace events kept (0 disables event recording)
    pub trace_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tasks: NUM_TASKS_MAX,
            num_cpus: 1,
            quantum: TASK_QUANTUM,
            ipi_retry: Duration::from_micros(100),
            stall_warn_rounds: 10_000,
            trace_capacity: 256,
        }
    }
}

impl Config {
    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    pub fn num_cpus(mut self, n: usize) -> Self {
        self.num_cpus = n;
        self
    }

    pub fn quantum(mut self, ticks: u32) -> Self {
        self.quantum = ticks;
        self
    }

    pub fn ipi_retry(mut self, interval: Duration) -> Self {
        self.ipi_retry = interval;
        self
    }

    pub fn trace_capacity(mut self, n: usize) -> Self {
        self.trace_capacity = n;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TaskResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration against the compile-time maxima
    pub fn validate(&self) -> TaskResult<()> {
        if self.max_tasks == 0 || self.max_tasks > NUM_TASKS_MAX {
            return Err(TaskError::InvalidConfig(format!(
                "max_tasks must be in 1..={}, got {}",
                NUM_TASKS_MAX, self.max_tasks
            )));
        }
        if self.num_cpus == 0 || self.num_cpus > NUM_CPUS_MAX {
            return Err(TaskError::InvalidConfig(format!(
                "num_cpus must be in 1..={}, got {}",
                NUM_CPUS_MAX, self.num_cpus
            )));
        }
        if self.quantum == 0 {
            return Err(TaskError::InvalidConfig("quantum must be non-zero".into()));
        }
        Ok(())
    }
}

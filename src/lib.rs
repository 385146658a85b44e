//! taskcore - the task-management core of a small SMP microkernel
//!
//! Design principles:
//! - Tractable: a fixed-capacity task table, one shared ready queue
//! - No hidden global state: everything hangs off one [`kernel::Kernel`]
//! - The hardware is a trait: architecture, page allocator and IPC
//!   delivery live behind [`platform::Hal`]
//!
//! Platform support:
//! - Host simulation ([`platform::sim::SimHal`]): cores are threads
//! - Real hardware: implement [`platform::Arch`], [`platform::PageAllocator`]
//!   and [`platform::Notifier`]

pub mod kernel;
pub mod platform;

pub use kernel::{Config, CpuId, Kernel, TaskError, TaskId, TaskInfo, TaskResult, TaskState};

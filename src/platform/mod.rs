//! Platform Abstraction Layer
//!
//! This module defines the traits the task core calls out to:
//!
//! - [`Arch`]: register contexts, address spaces, context switches, IPIs
//! - [`PageAllocator`]: the physical memory allocator
//! - [`Notifier`]: notification and exception delivery (the IPC layer)
//!
//! The kernel is platform-agnostic. Only the [`Hal`] implementation knows
//! about the hardware (or, for [`sim`], about the host).

pub mod sim;

use crate::kernel::error::TaskResult;
use crate::kernel::memory::{AllocKind, PAddr, VAddr};
use crate::kernel::task::{CpuId, TaskId};
use serde::Serialize;

/// Where a new task starts executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    /// User-mode instruction pointer
    pub ip: VAddr,
    /// Kernel-mode routine to run instead of entering user mode
    pub kernel_entry: Option<VAddr>,
    /// Opaque argument passed to `kernel_entry`
    pub arg: VAddr,
}

impl EntryPoint {
    pub fn user(ip: VAddr) -> Self {
        Self {
            ip,
            kernel_entry: None,
            arg: VAddr(0),
        }
    }

    pub fn kernel(entry: VAddr, arg: VAddr) -> Self {
        Self {
            ip: VAddr(0),
            kernel_entry: Some(entry),
            arg,
        }
    }
}

/// Inter-processor interrupt kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    /// Ask the receiving cores to run the scheduler
    Reschedule,
}

/// Notification bits delivered to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Notifications(pub u32);

impl Notifications {
    pub const TIMER: Notifications = Notifications(1 << 0);
    pub const IRQ: Notifications = Notifications(1 << 1);
    /// The task this one was sending to has been destroyed
    pub const ABORTED: Notifications = Notifications(1 << 2);
    pub const ASYNC: Notifications = Notifications(1 << 3);

    pub fn contains(self, other: Notifications) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Notifications {
    type Output = Notifications;

    fn bitor(self, rhs: Notifications) -> Notifications {
        Notifications(self.0 | rhs.0)
    }
}

/// Why a task stopped, reported to its pager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Exception {
    /// The task exited on its own
    GracefulExit,
    /// The kernel ran out of memory on the task's behalf
    NoKernelMemory,
    /// The task passed a bad user pointer
    InvalidUaddr,
    /// The pager replied with something that made no sense
    InvalidPagerReply,
    /// An exception the architecture could not handle
    IllegalException,
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exception::GracefulExit => write!(f, "graceful exit"),
            Exception::NoKernelMemory => write!(f, "no kernel memory"),
            Exception::InvalidUaddr => write!(f, "invalid user address"),
            Exception::InvalidPagerReply => write!(f, "invalid pager reply"),
            Exception::IllegalException => write!(f, "illegal exception"),
        }
    }
}

/// Architecture adapter
///
/// The kernel owns the per-task state this trait creates ([`Arch::Vm`] and
/// [`Arch::Context`]) and hands it back for switching and teardown.
pub trait Arch: Send + Sync {
    /// A task's address space
    type Vm: Send;
    /// A task's saved register state
    type Context: Send;

    fn vm_init(&self) -> TaskResult<Self::Vm>;

    fn vm_destroy(&self, vm: Self::Vm);

    fn task_init(&self, tid: TaskId, vm: &Self::Vm, entry: EntryPoint)
    -> TaskResult<Self::Context>;

    fn task_destroy(&self, context: Self::Context);

    /// Context of the idle task running on `cpu`
    fn idle_init(&self, cpu: CpuId) -> TaskResult<Self::Context>;

    /// Save `prev`'s registers and restore `next`'s on `cpu`.
    ///
    /// Called with the task table locked.
    fn switch(&self, cpu: CpuId, prev: &Self::Context, next: &Self::Context);

    /// Send `ipi` to every core except `from`
    fn send_ipi(&self, from: CpuId, ipi: Ipi);

    fn paddr_to_vaddr(&self, paddr: PAddr) -> VAddr;

    /// Address of the guest bytecode interpreter's run routine
    fn hinavm_entry(&self) -> VAddr;
}

/// Physical memory allocator
pub trait PageAllocator: Send + Sync {
    /// Allocate a page-aligned block of `size` bytes
    fn alloc_pages(&self, size: usize, kind: AllocKind) -> Option<PAddr>;

    fn free_pages(&self, paddr: PAddr, size: usize);
}

/// Notification delivery, provided by the IPC layer
///
/// Never called with the task table locked, so implementations may call
/// back into the kernel.
pub trait Notifier: Send + Sync {
    fn notify(&self, task: TaskId, notifications: Notifications);

    /// Tell `pager` that `task` stopped because of `exception`
    fn exception(&self, pager: TaskId, task: TaskId, exception: Exception);
}

/// Everything the kernel needs from the platform
pub trait Hal: Arch + PageAllocator + Notifier {}

impl<T: Arch + PageAllocator + Notifier> Hal for T {}

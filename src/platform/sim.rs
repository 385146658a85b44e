//! Host simulation platform
//!
//! Implements [`Hal`](super::Hal) on an ordinary host so the task core can be
//! driven by threads standing in for cores:
//!
//! - address spaces and register contexts are counters plus small records
//! - context switches, IPIs and notifications are recorded for inspection
//! - IPIs also land in a per-core inbox; a thread playing a core drains it
//!   with [`SimHal::take_ipi`] and passes what it finds to
//!   `Kernel::handle_ipi`. A core that never drains only reschedules on
//!   its own timer ticks.
//! - pages are real page-aligned heap blocks, identity-mapped
//! - every fallible operation can be made to fail on demand
//! - a notification hook can call back into the kernel, like a real IPC
//!   layer would

use super::{Arch, EntryPoint, Exception, Ipi, Notifications, Notifier, PageAllocator};
use crate::kernel::config::NUM_CPUS_MAX;
use crate::kernel::error::{TaskError, TaskResult};
use crate::kernel::memory::{AllocKind, PAGE_SIZE, PAddr, VAddr};
use crate::kernel::task::{CpuId, TaskId};
use parking_lot::Mutex;
use slab::Slab;
use std::alloc::{self, Layout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Fake address of the guest interpreter's run routine
pub const HINAVM_ENTRY: VAddr = VAddr(0xffff_8000_0010_0000);

/// A simulated address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVm {
    pub id: u64,
}

/// A simulated register context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimContext {
    pub tid: TaskId,
    /// `None` for idle contexts
    pub entry: Option<EntryPoint>,
}

/// One recorded context switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    pub cpu: CpuId,
    pub prev: TaskId,
    pub next: TaskId,
}

/// Called after every recorded notification, without any lock held
pub type NotifyHook = Arc<dyn Fn(TaskId, Notifications) + Send + Sync>;

struct Block {
    addr: usize,
    layout: Layout,
}

/// Host implementation of the platform traits
pub struct SimHal {
    next_vm: AtomicU64,
    live_vms: AtomicUsize,
    live_contexts: AtomicUsize,
    fail_vm_init: AtomicBool,
    fail_task_init: AtomicBool,
    fail_alloc: AtomicBool,
    ipis: AtomicUsize,
    pending_ipis: [AtomicBool; NUM_CPUS_MAX],
    notify_hook: Mutex<Option<NotifyHook>>,
    switches: Mutex<Vec<SwitchRecord>>,
    notifications: Mutex<Vec<(TaskId, Notifications)>>,
    exceptions: Mutex<Vec<(TaskId, TaskId, Exception)>>,
    blocks: Mutex<Slab<Block>>,
}

impl SimHal {
    pub fn new() -> Self {
        Self {
            next_vm: AtomicU64::new(1),
            live_vms: AtomicUsize::new(0),
            live_contexts: AtomicUsize::new(0),
            fail_vm_init: AtomicBool::new(false),
            fail_task_init: AtomicBool::new(false),
            fail_alloc: AtomicBool::new(false),
            ipis: AtomicUsize::new(0),
            pending_ipis: std::array::from_fn(|_| AtomicBool::new(false)),
            notify_hook: Mutex::new(None),
            switches: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
            blocks: Mutex::new(Slab::new()),
        }
    }

    /// Make address space setup fail until turned off
    pub fn set_fail_vm_init(&self, fail: bool) {
        self.fail_vm_init.store(fail, Ordering::SeqCst);
    }

    /// Make register context setup fail until turned off
    pub fn set_fail_task_init(&self, fail: bool) {
        self.fail_task_init.store(fail, Ordering::SeqCst);
    }

    /// Make page allocation fail until turned off
    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Address spaces created and not yet destroyed
    pub fn live_vms(&self) -> usize {
        self.live_vms.load(Ordering::SeqCst)
    }

    /// Task contexts (idle ones excluded) created and not yet destroyed
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    /// Page blocks allocated and not yet freed
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Install (or with `None`, remove) the notification hook
    pub fn set_notify_hook(&self, hook: Option<NotifyHook>) {
        *self.notify_hook.lock() = hook;
    }

    /// Take the pending IPI for `cpu`, if any. Repeated IPIs coalesce.
    pub fn take_ipi(&self, cpu: CpuId) -> Option<Ipi> {
        let pending = self.pending_ipis.get(cpu.0)?;
        pending.swap(false, Ordering::SeqCst).then_some(Ipi::Reschedule)
    }

    pub fn ipi_count(&self) -> usize {
        self.ipis.load(Ordering::SeqCst)
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn notifications(&self) -> Vec<(TaskId, Notifications)> {
        self.notifications.lock().clone()
    }

    /// Recorded `(pager, task, exception)` reports
    pub fn exceptions(&self) -> Vec<(TaskId, TaskId, Exception)> {
        self.exceptions.lock().clone()
    }

    /// Copy `len` bytes out of an allocated block
    pub fn read_bytes(&self, paddr: PAddr, len: usize) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let block = blocks
            .iter()
            .map(|(_, block)| block)
            .find(|block| block.addr == paddr.0)
            .unwrap_or_else(|| panic!("no block at {}", paddr));
        assert!(len <= block.layout.size(), "read past the end of {}", paddr);
        // SAFETY: the block is live (we hold the lock) and at least `len` long.
        unsafe { std::slice::from_raw_parts(block.addr as *const u8, len).to_vec() }
    }
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimHal {
    fn drop(&mut self) {
        for block in self.blocks.get_mut().drain() {
            // SAFETY: allocated in `alloc_pages` with this layout, never freed.
            unsafe { alloc::dealloc(block.addr as *mut u8, block.layout) };
        }
    }
}

impl Arch for SimHal {
    type Vm = SimVm;
    type Context = SimContext;

    fn vm_init(&self) -> TaskResult<SimVm> {
        if self.fail_vm_init.load(Ordering::SeqCst) {
            return Err(TaskError::NoMemory);
        }
        self.live_vms.fetch_add(1, Ordering::SeqCst);
        Ok(SimVm {
            id: self.next_vm.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn vm_destroy(&self, _vm: SimVm) {
        self.live_vms.fetch_sub(1, Ordering::SeqCst);
    }

    fn task_init(&self, tid: TaskId, _vm: &SimVm, entry: EntryPoint) -> TaskResult<SimContext> {
        if self.fail_task_init.load(Ordering::SeqCst) {
            return Err(TaskError::NoMemory);
        }
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(SimContext {
            tid,
            entry: Some(entry),
        })
    }

    fn task_destroy(&self, _context: SimContext) {
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }

    fn idle_init(&self, _cpu: CpuId) -> TaskResult<SimContext> {
        Ok(SimContext {
            tid: TaskId::IDLE,
            entry: None,
        })
    }

    fn switch(&self, cpu: CpuId, prev: &SimContext, next: &SimContext) {
        self.switches.lock().push(SwitchRecord {
            cpu,
            prev: prev.tid,
            next: next.tid,
        });
    }

    fn send_ipi(&self, from: CpuId, ipi: Ipi) {
        self.ipis.fetch_add(1, Ordering::SeqCst);
        match ipi {
            Ipi::Reschedule => {
                for (cpu, pending) in self.pending_ipis.iter().enumerate() {
                    if cpu != from.0 {
                        pending.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    fn paddr_to_vaddr(&self, paddr: PAddr) -> VAddr {
        VAddr(paddr.0)
    }

    fn hinavm_entry(&self) -> VAddr {
        HINAVM_ENTRY
    }
}

impl PageAllocator for SimHal {
    fn alloc_pages(&self, size: usize, _kind: AllocKind) -> Option<PAddr> {
        if self.fail_alloc.load(Ordering::SeqCst) || size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // Uninitialized requests are zeroed too; callers must not care.
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        self.blocks.lock().insert(Block { addr, layout });
        Some(PAddr(addr))
    }

    fn free_pages(&self, paddr: PAddr, size: usize) {
        let mut blocks = self.blocks.lock();
        let key = blocks
            .iter()
            .find(|(_, block)| block.addr == paddr.0 && block.layout.size() == size)
            .map(|(key, _)| key)
            .unwrap_or_else(|| panic!("freeing unknown block {} ({} bytes)", paddr, size));
        let block = blocks.remove(key);
        // SAFETY: allocated in `alloc_pages` with this layout and now untracked.
        unsafe { alloc::dealloc(block.addr as *mut u8, block.layout) };
    }
}

impl Notifier for SimHal {
    fn notify(&self, task: TaskId, notifications: Notifications) {
        self.notifications.lock().push((task, notifications));
        let hook = self.notify_hook.lock().clone();
        if let Some(hook) = hook {
            hook(task, notifications);
        }
    }

    fn exception(&self, pager: TaskId, task: TaskId, exception: Exception) {
        self.exceptions.lock().push((pager, task, exception));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned_and_tracked() {
        let hal = SimHal::new();
        let paddr = hal.alloc_pages(2 * PAGE_SIZE, AllocKind::Zeroed).unwrap();
        assert_eq!(paddr.0 % PAGE_SIZE, 0);
        assert_eq!(hal.live_blocks(), 1);
        assert_eq!(hal.read_bytes(paddr, 8), vec![0u8; 8]);

        hal.free_pages(paddr, 2 * PAGE_SIZE);
        assert_eq!(hal.live_blocks(), 0);
    }

    #[test]
    fn test_alloc_failure_injection() {
        let hal = SimHal::new();
        hal.set_fail_alloc(true);
        assert!(hal.alloc_pages(PAGE_SIZE, AllocKind::Uninitialized).is_none());
        hal.set_fail_alloc(false);
        assert!(hal.alloc_pages(PAGE_SIZE, AllocKind::Uninitialized).is_some());
    }

    #[test]
    #[should_panic(expected = "freeing unknown block")]
    fn test_double_free_panics() {
        let hal = SimHal::new();
        let paddr = hal.alloc_pages(PAGE_SIZE, AllocKind::Zeroed).unwrap();
        hal.free_pages(paddr, PAGE_SIZE);
        hal.free_pages(paddr, PAGE_SIZE);
    }

    #[test]
    fn test_vm_and_context_counters() {
        let hal = SimHal::new();
        let vm = hal.vm_init().unwrap();
        let ctx = hal
            .task_init(TaskId(3), &vm, EntryPoint::user(VAddr(0x1000)))
            .unwrap();
        assert_eq!(ctx.tid, TaskId(3));
        assert_eq!((hal.live_vms(), hal.live_contexts()), (1, 1));

        hal.task_destroy(ctx);
        hal.vm_destroy(vm);
        assert_eq!((hal.live_vms(), hal.live_contexts()), (0, 0));
    }

    #[test]
    fn test_ipi_inbox_skips_sender() {
        let hal = SimHal::new();
        hal.send_ipi(CpuId(0), Ipi::Reschedule);
        hal.send_ipi(CpuId(0), Ipi::Reschedule);

        assert_eq!(hal.ipi_count(), 2);
        assert_eq!(hal.take_ipi(CpuId(0)), None);
        assert_eq!(hal.take_ipi(CpuId(1)), Some(Ipi::Reschedule));
        assert_eq!(hal.take_ipi(CpuId(1)), None);
        assert_eq!(hal.take_ipi(CpuId(NUM_CPUS_MAX)), None);
    }

    #[test]
    fn test_notify_hook_sees_notifications() {
        let hal = SimHal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hal.set_notify_hook(Some(Arc::new(move |tid: TaskId, n: Notifications| {
            sink.lock().push((tid, n))
        })));

        hal.notify(TaskId(2), Notifications::ABORTED);
        hal.set_notify_hook(None);
        hal.notify(TaskId(3), Notifications::TIMER);

        assert_eq!(*seen.lock(), vec![(TaskId(2), Notifications::ABORTED)]);
        assert_eq!(hal.notifications().len(), 2);
    }

    #[test]
    fn test_init_failure_injection() {
        let hal = SimHal::new();
        hal.set_fail_vm_init(true);
        assert_eq!(hal.vm_init(), Err(TaskError::NoMemory));
        assert_eq!(hal.live_vms(), 0);
    }
}

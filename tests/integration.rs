//! Integration tests for the task core
//!
//! Drives the kernel through the public API on the host simulation
//! platform, with threads standing in for cores where it matters.

use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use taskcore::kernel::hinavm::Instruction;
use taskcore::kernel::memory::VAddr;
use taskcore::platform::Notifications;
use taskcore::platform::sim::SimHal;
use taskcore::{Config, CpuId, Kernel, TaskError, TaskId, TaskState};

const CPU0: CpuId = CpuId(0);
const ENTRY: VAddr = VAddr(0x4000);

fn kernel(max_tasks: usize, num_cpus: usize) -> Kernel<SimHal> {
    let config = Config::default()
        .max_tasks(max_tasks)
        .num_cpus(num_cpus)
        .quantum(1);
    Kernel::new(config, SimHal::new()).unwrap()
}

/// Spawn a thread that plays core `cpu`, handling IPIs and taking timer
/// ticks until stopped
fn run_core(
    kernel: Arc<Kernel<SimHal>>,
    cpu: CpuId,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match kernel.hal().take_ipi(cpu) {
                Some(ipi) => kernel.handle_ipi(cpu, ipi),
                None => kernel.tick(cpu),
            };
            thread::yield_now();
        }
    })
}

// ============================================================================
// Single core
// ============================================================================

#[test]
fn test_round_robin_cycles_fifo() {
    let kernel = kernel(8, 1);
    let tasks: Vec<TaskId> = (0..4)
        .map(|i| kernel.create(&format!("t{}", i), ENTRY, None).unwrap())
        .collect();

    let mut seen = Vec::new();
    for _ in 0..12 {
        seen.push(kernel.tick(CPU0));
    }
    let expected: Vec<TaskId> = tasks.iter().cycle().take(12).copied().collect();
    assert_eq!(seen, expected);
    kernel.verify().unwrap();
}

#[test]
fn test_find_after_destroy_and_reuse() {
    let kernel = kernel(4, 1);
    let root = kernel.create("root", ENTRY, None).unwrap();
    let a = kernel.create("a", ENTRY, Some(root)).unwrap();

    kernel.destroy(CPU0, a).unwrap();
    assert!(kernel.find(a).is_none());
    assert!(kernel.senders(a).is_empty());

    let b = kernel.create("b", ENTRY, Some(root)).unwrap();
    assert_eq!(b, a);
    assert_eq!(kernel.find(b).unwrap().name.as_str(), "b");
    assert_eq!(kernel.find(root).unwrap().ref_count, 1);
}

#[test]
fn test_pager_chain_teardown() {
    let kernel = kernel(8, 1);
    let root = kernel.create("root", ENTRY, None).unwrap();
    let vm_server = kernel.create("vm", ENTRY, Some(root)).unwrap();
    let shell = kernel.create("shell", ENTRY, Some(vm_server)).unwrap();
    let app = kernel
        .create_hinavm("app", &[Instruction::new(1, 0, 0, 0, 7)], Some(shell))
        .unwrap();

    assert_eq!(kernel.destroy(CPU0, vm_server), Err(TaskError::StillUsed));
    assert_eq!(kernel.destroy(CPU0, shell), Err(TaskError::StillUsed));

    for tid in [app, shell, vm_server] {
        kernel.destroy(CPU0, tid).unwrap();
    }
    assert_eq!(kernel.active_tasks().len(), 1);
    assert_eq!(kernel.hal().live_blocks(), 0);
    assert_eq!(kernel.stats().created, 4);
    assert_eq!(kernel.stats().destroyed, 3);
    kernel.verify().unwrap();
}

#[test]
fn test_dump_json_lists_active_tasks() {
    let kernel = kernel(4, 1);
    let root = kernel.create("root", ENTRY, None).unwrap();
    kernel.create("child", ENTRY, Some(root)).unwrap();

    let json = kernel.dump_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let tasks = value.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["name"], "root");
    assert_eq!(tasks[1]["pager"], 1);
    assert_eq!(tasks[1]["state"], "Runnable");
}

// ============================================================================
// Multiple cores
// ============================================================================

#[test]
fn test_destroy_task_running_on_another_core() {
    let kernel = Arc::new(kernel(8, 2));
    let stop = Arc::new(AtomicBool::new(false));
    let root = kernel.create("root", ENTRY, None).unwrap();
    let remote = run_core(kernel.clone(), CpuId(1), stop.clone());

    for round in 0..20 {
        let victim = kernel
            .create(&format!("victim{}", round), ENTRY, Some(root))
            .unwrap();
        while kernel.find(victim).and_then(|task| task.running_on) != Some(CpuId(1)) {
            thread::yield_now();
        }

        kernel.destroy(CPU0, victim).unwrap();
        assert!(kernel.find(victim).is_none());
        assert_ne!(kernel.current(CpuId(1)), victim);
        kernel.verify().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    remote.join().unwrap();
    assert_eq!(kernel.find(root).unwrap().ref_count, 0);
    assert_eq!(kernel.hal().live_vms(), 1);
    assert_eq!(kernel.hal().live_contexts(), 1);
}

#[test]
fn test_destroy_waits_for_ipi_on_busy_core() {
    // The remote core never takes a tick; only the reschedule IPI can move
    // it off the victim.
    let config = Config::default().max_tasks(4).num_cpus(2).quantum(u32::MAX);
    let kernel = Arc::new(Kernel::new(config, SimHal::new()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    let victim = kernel.create("victim", ENTRY, None).unwrap();
    assert_eq!(kernel.switch(CpuId(1)), victim);

    let remote = {
        let kernel = kernel.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Some(ipi) = kernel.hal().take_ipi(CpuId(1)) {
                    kernel.handle_ipi(CpuId(1), ipi);
                }
                thread::yield_now();
            }
        })
    };

    kernel.destroy(CPU0, victim).unwrap();
    stop.store(true, Ordering::Relaxed);
    remote.join().unwrap();

    assert!(kernel.hal().ipi_count() >= 1);
    assert_eq!(kernel.current(CpuId(1)), TaskId::IDLE);
    assert!(kernel.find(victim).is_none());
    kernel.verify().unwrap();
}

#[test]
fn test_concurrent_create_destroy() {
    const CORES: usize = 4;
    let kernel = Arc::new(kernel(16, CORES));
    let stop = Arc::new(AtomicBool::new(false));
    let root = kernel.create("root", ENTRY, None).unwrap();
    let scheduler = run_core(kernel.clone(), CPU0, stop.clone());

    let workers: Vec<_> = (1..CORES)
        .map(|cpu| {
            let kernel = kernel.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let tid = match kernel.create("worker", ENTRY, Some(root)) {
                        Ok(tid) => tid,
                        Err(TaskError::TooManyTasks) => continue,
                        Err(e) => panic!("create failed: {}", e),
                    };
                    kernel.destroy(CpuId(cpu), tid).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    scheduler.join().unwrap();
    kernel.verify().unwrap();
    assert_eq!(kernel.active_tasks().len(), 1);
    assert_eq!(kernel.find(root).unwrap().ref_count, 0);
    assert_eq!(kernel.hal().live_vms(), 1);
}

#[test]
fn test_pager_and_child_destroyed_concurrently() {
    let kernel = Arc::new(kernel(8, 3));
    let stop = Arc::new(AtomicBool::new(false));
    let _root = kernel.create("root", ENTRY, None).unwrap();
    let pager = kernel.create("pager", ENTRY, None).unwrap();
    let child = kernel.create("child", ENTRY, Some(pager)).unwrap();
    let scheduler = run_core(kernel.clone(), CPU0, stop.clone());

    let pager_killer = {
        let kernel = kernel.clone();
        thread::spawn(move || {
            loop {
                match kernel.destroy(CpuId(1), pager) {
                    Ok(()) => break,
                    Err(TaskError::StillUsed) => thread::yield_now(),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        })
    };
    let child_killer = {
        let kernel = kernel.clone();
        thread::spawn(move || kernel.destroy(CpuId(2), child))
    };

    assert_eq!(child_killer.join().unwrap(), Ok(()));
    pager_killer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    scheduler.join().unwrap();

    assert!(kernel.find(pager).is_none());
    assert!(kernel.find(child).is_none());
    kernel.verify().unwrap();
}

#[test]
fn test_receiver_destroyed_while_senders_wait() {
    let kernel = Arc::new(kernel(8, 2));
    let stop = Arc::new(AtomicBool::new(false));
    let _root = kernel.create("root", ENTRY, None).unwrap();
    let server = kernel.create("server", ENTRY, None).unwrap();
    let clients: Vec<TaskId> = (0..3)
        .map(|_| kernel.create("client", ENTRY, None).unwrap())
        .collect();
    for &client in &clients {
        kernel.block(client);
        kernel.add_sender(server, client).unwrap();
    }
    let remote = run_core(kernel.clone(), CpuId(1), stop.clone());

    kernel.destroy(CPU0, server).unwrap();
    stop.store(true, Ordering::Relaxed);
    remote.join().unwrap();

    let aborted: Vec<TaskId> = kernel
        .hal()
        .notifications()
        .into_iter()
        .filter(|(_, n)| n.contains(Notifications::ABORTED))
        .map(|(tid, _)| tid)
        .collect();
    assert_eq!(aborted, clients);
    for &client in &clients {
        assert_eq!(kernel.find(client).unwrap().state, TaskState::Blocked);
    }
    kernel.verify().unwrap();
}

// ============================================================================
// Random operation sequences
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Create { pager: Option<u32> },
    CreateHinavm { len: usize },
    Block(u32),
    Resume(u32),
    Destroy(u32),
    AddSender(u32, u32),
    Tick,
    Switch,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::option::of(1..=8u32).prop_map(|pager| Op::Create { pager }),
        (0..=130usize).prop_map(|len| Op::CreateHinavm { len }),
        (1..=8u32).prop_map(Op::Block),
        (1..=8u32).prop_map(Op::Resume),
        (1..=8u32).prop_map(Op::Destroy),
        (1..=8u32, 1..=8u32).prop_map(|(r, s)| Op::AddSender(r, s)),
        Just(Op::Tick),
        Just(Op::Switch),
    ]
}

fn apply(kernel: &Kernel<SimHal>, op: &Op) {
    let state = |tid: u32| kernel.find(TaskId(tid)).map(|task| task.state);
    match *op {
        Op::Create { pager } => {
            let _ = kernel.create("p", ENTRY, pager.map(TaskId));
        }
        Op::CreateHinavm { len } => {
            let insts = vec![Instruction::default(); len];
            let _ = kernel.create_hinavm("vm", &insts, None);
        }
        Op::Block(tid) => {
            if state(tid) == Some(TaskState::Runnable) {
                kernel.block(TaskId(tid));
            }
        }
        Op::Resume(tid) => {
            if state(tid) == Some(TaskState::Blocked) {
                kernel.resume(TaskId(tid));
            }
        }
        Op::Destroy(tid) => {
            if state(tid).is_some() && kernel.current(CPU0) != TaskId(tid) {
                let _ = kernel.destroy(CPU0, TaskId(tid));
            }
        }
        Op::AddSender(r, s) => {
            let _ = kernel.add_sender(TaskId(r), TaskId(s));
        }
        Op::Tick => {
            kernel.tick(CPU0);
        }
        Op::Switch => {
            kernel.switch(CPU0);
        }
    }
}

proptest! {
    #[test]
    fn prop_table_stays_consistent(ops in proptest::collection::vec(op(), 1..80)) {
        let kernel = kernel(8, 1);
        for op in &ops {
            apply(&kernel, op);
            prop_assert_eq!(kernel.verify(), Ok(()), "after {:?}", op);
        }

        let active = kernel.active_tasks();
        prop_assert!(active.len() <= 8);
        prop_assert_eq!(kernel.hal().live_vms(), active.len());
        prop_assert_eq!(kernel.hal().live_contexts(), active.len());
        let blocks: usize = active.iter().map(|task| task.owned_pages).sum();
        prop_assert_eq!(kernel.hal().live_blocks(), blocks);
    }

    #[test]
    fn prop_every_runnable_task_gets_dispatched(count in 1usize..8) {
        let kernel = kernel(8, 1);
        let tasks: Vec<TaskId> = (0..count)
            .map(|_| kernel.create("t", ENTRY, None).unwrap())
            .collect();

        let mut dispatched: Vec<TaskId> = (0..count).map(|_| kernel.tick(CPU0)).collect();
        dispatched.sort();
        prop_assert_eq!(dispatched, tasks);
    }
}

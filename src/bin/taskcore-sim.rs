//! taskcore simulator - run the task core on host threads
//!
//! Usage: taskcore-sim [config.json]
//!
//! Boots a root pager and a handful of workers, lets every core take timer
//! ticks for a while, tears the workers down again, and prints the final
//! task table as JSON.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use taskcore::kernel::hinavm::Instruction;
use taskcore::kernel::memory::VAddr;
use taskcore::platform::sim::SimHal;
use taskcore::kernel::config::NUM_CPUS_MAX;
use taskcore::{Config, CpuId, Kernel, TaskError, TaskResult};

fn load_config() -> TaskResult<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                TaskError::InvalidConfig(format!("{}: {}", path, e))
            })?;
            Config::from_json(&json)
        }
        None => Ok(Config::default().num_cpus(2).quantum(2)),
    }
}

fn run() -> TaskResult<()> {
    // One extra core for this thread: it never schedules, so it can
    // destroy any task without ever running it.
    let config = load_config()?;
    let num_cpus = config.num_cpus;
    if num_cpus >= NUM_CPUS_MAX {
        return Err(TaskError::InvalidConfig(format!(
            "the simulator needs a spare core: num_cpus must be below {}, got {}",
            NUM_CPUS_MAX, num_cpus
        )));
    }
    let control = CpuId(num_cpus);
    let config = config.num_cpus(num_cpus + 1);
    let kernel = Arc::new(Kernel::new(config, SimHal::new())?);

    let root = kernel.create("root", VAddr(0x1000), None)?;
    let mut workers = Vec::new();
    for i in 0..4 {
        workers.push(kernel.create(&format!("worker{}", i), VAddr(0x2000), Some(root))?);
    }
    let program = [
        Instruction::new(1, 0, 0, 0, 42),
        Instruction::new(2, 0, 1, 0, 0),
    ];
    workers.push(kernel.create_hinavm("hinavm", &program, Some(root))?);

    let stop = Arc::new(AtomicBool::new(false));
    let cores: Vec<_> = (0..num_cpus)
        .map(|cpu| {
            let kernel = kernel.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match kernel.hal().take_ipi(CpuId(cpu)) {
                        Some(ipi) => kernel.handle_ipi(CpuId(cpu), ipi),
                        None => kernel.tick(CpuId(cpu)),
                    };
                    thread::sleep(Duration::from_micros(50));
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    kernel.dump();

    for tid in workers {
        if let Err(e) = kernel.destroy(control, tid) {
            tracing::warn!(%tid, error = %e, "could not destroy worker");
        }
    }

    stop.store(true, Ordering::Relaxed);
    for (cpu, core) in cores.into_iter().enumerate() {
        if core.join().is_err() {
            tracing::error!(cpu, "core thread panicked");
        }
    }

    if let Err(e) = kernel.verify() {
        tracing::error!(error = %e, "task table is inconsistent");
    }
    let stats = kernel.stats();
    tracing::info!(
        created = stats.created,
        destroyed = stats.destroyed,
        switches = stats.switches,
        ipis = stats.ipis,
        "simulation finished"
    );

    let json = kernel.dump_json()?;
    println!("{}", json);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("taskcore-sim: {}", e);
        std::process::exit(1);
    }
}

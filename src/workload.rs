//! Workload driving: loaders, frequency-weighted transaction mixes, and a
//! multi-threaded runner with a two-barrier rendezvous.
//!
//! Loaders populate tables one at a time before measurement. Workers then
//! count down on one barrier as they become ready and block on a second
//! until the runner releases them all at once, so every worker starts
//! issuing transactions simultaneously. Each iteration draws a uniform
//! number and walks the frequency-weighted workload list; the last entry
//! is the fallback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use crate::db::Engine;

/// A spinning count-down barrier.
pub struct SpinBarrier {
    remaining: CachePadded<AtomicUsize>,
}

impl SpinBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: CachePadded::new(AtomicUsize::new(count)),
        }
    }

    pub fn count_down(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn wait_for(&self) {
        let backoff = Backoff::new();
        while self.remaining.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }
}

/// Per-worker state handed to workload functions.
pub struct WorkerCtx {
    pub engine: Arc<Engine>,
    pub worker_id: usize,
    pub rng: fastrand::Rng,
}

/// A workload function runs one transaction attempt and reports whether it
/// committed.
pub type WorkloadFn = Arc<dyn Fn(&mut WorkerCtx) -> bool + Send + Sync>;

/// One entry of a worker's transaction mix.
#[derive(Clone)]
pub struct WorkloadDesc {
    pub name: &'static str,
    /// Probability mass of this entry; the last entry absorbs the rest.
    pub frequency: f64,
    pub run: WorkloadFn,
}

impl WorkloadDesc {
    pub fn new(
        name: &'static str,
        frequency: f64,
        run: impl Fn(&mut WorkerCtx) -> bool + Send + Sync + 'static,
    ) -> Self {
        assert!(frequency > 0.0 && frequency <= 1.0);
        Self {
            name,
            frequency,
            run: Arc::new(run),
        }
    }
}

/// Totals reported by a finished run.
#[derive(Debug, Default, Clone)]
pub struct WorkloadReport {
    pub commits: u64,
    pub aborts: u64,
    /// Per-workload attempt counts, in mix order.
    pub txn_counts: Vec<(&'static str, u64)>,
}

/// A loader populates tables before the measured run; each loader runs
/// alone on one thread.
pub type LoaderFn = Box<dyn FnOnce(&mut WorkerCtx) + Send>;

/// Drives a workload mix over an engine for a fixed duration.
pub struct WorkloadRunner {
    engine: Arc<Engine>,
    nworkers: usize,
    duration: Duration,
    seed: u64,
    workloads: Vec<WorkloadDesc>,
}

impl WorkloadRunner {
    pub fn new(
        engine: Arc<Engine>,
        nworkers: usize,
        duration: Duration,
        workloads: Vec<WorkloadDesc>,
    ) -> Self {
        assert!(nworkers > 0);
        assert!(!workloads.is_empty());
        Self {
            engine,
            nworkers,
            duration,
            seed: 0xbeef,
            workloads,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Runs `loaders` to completion, then the measured worker phase.
    pub fn run(&self, loaders: Vec<LoaderFn>) -> WorkloadReport {
        for (i, loader) in loaders.into_iter().enumerate() {
            let mut ctx = WorkerCtx {
                engine: self.engine.clone(),
                worker_id: i,
                rng: fastrand::Rng::with_seed(self.seed ^ (i as u64)),
            };
            loader(&mut ctx);
        }

        let running = AtomicBool::new(true);
        let barrier_a = SpinBarrier::new(self.nworkers);
        let barrier_b = SpinBarrier::new(1);

        let mut report = WorkloadReport {
            txn_counts: self.workloads.iter().map(|w| (w.name, 0)).collect(),
            ..WorkloadReport::default()
        };

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.nworkers);
            for wid in 0..self.nworkers {
                let running = &running;
                let barrier_a = &barrier_a;
                let barrier_b = &barrier_b;
                let workloads = &self.workloads;
                let engine = self.engine.clone();
                let seed = self.seed;
                handles.push(scope.spawn(move || {
                    let mut ctx = WorkerCtx {
                        engine,
                        worker_id: wid,
                        rng: fastrand::Rng::with_seed(seed.wrapping_mul(0x9e37_79b9).wrapping_add(wid as u64)),
                    };
                    let mut commits = 0u64;
                    let mut aborts = 0u64;
                    let mut counts = vec![0u64; workloads.len()];

                    barrier_a.count_down();
                    barrier_b.wait_for();
                    while running.load(Ordering::Relaxed) {
                        let mut d = ctx.rng.f64();
                        for (i, w) in workloads.iter().enumerate() {
                            if i + 1 == workloads.len() || d < w.frequency {
                                if (w.run)(&mut ctx) {
                                    commits += 1;
                                } else {
                                    aborts += 1;
                                }
                                counts[i] += 1;
                                break;
                            }
                            d -= w.frequency;
                        }
                    }
                    (commits, aborts, counts)
                }));
            }

            // Release all workers at once, let them run, then stop them.
            barrier_a.wait_for();
            barrier_b.count_down();
            std::thread::sleep(self.duration);
            running.store(false, Ordering::Relaxed);

            for handle in handles {
                let (commits, aborts, counts) = handle.join().expect("worker panicked");
                report.commits += commits;
                report.aborts += aborts;
                for (slot, n) in report.txn_counts.iter_mut().zip(counts) {
                    slot.1 += n;
                }
            }
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnFlags;

    #[test]
    fn spin_barrier_releases_waiters() {
        let barrier = Arc::new(SpinBarrier::new(2));
        let b = barrier.clone();
        let t = std::thread::spawn(move || {
            b.count_down();
            b.wait_for();
        });
        barrier.count_down();
        barrier.wait_for();
        t.join().unwrap();
    }

    #[test]
    fn mixed_workload_runs_and_counts() {
        let engine = Arc::new(Engine::new());
        engine.open_table("bench");

        let put = WorkloadDesc::new("put", 0.5, |ctx: &mut WorkerCtx| {
            let table = ctx.engine.open_table("bench");
            let key = format!("k{}", ctx.rng.usize(0..64));
            let mut txn = ctx.engine.begin(TxnFlags::NONE);
            txn.put(&table, key.as_bytes(), b"v").unwrap();
            txn.commit().is_ok()
        });
        let get = WorkloadDesc::new("get", 0.5, |ctx: &mut WorkerCtx| {
            let table = ctx.engine.open_table("bench");
            let key = format!("k{}", ctx.rng.usize(0..64));
            let mut txn = ctx.engine.begin(TxnFlags::NONE);
            let _ = txn.get(&table, key.as_bytes()).unwrap();
            txn.commit().is_ok()
        });

        let loader: LoaderFn = Box::new(|ctx: &mut WorkerCtx| {
            let table = ctx.engine.open_table("bench");
            for i in 0..64 {
                let key = format!("k{}", i);
                let mut txn = ctx.engine.begin(TxnFlags::NONE);
                txn.put(&table, key.as_bytes(), b"seed").unwrap();
                txn.commit().unwrap();
            }
        });

        let report = WorkloadRunner::new(
            engine,
            4,
            Duration::from_millis(100),
            vec![put, get],
        )
        .seed(7)
        .run(vec![loader]);

        assert!(report.commits > 0);
        let attempts: u64 = report.txn_counts.iter().map(|(_, n)| n).sum();
        assert_eq!(attempts, report.commits + report.aborts);
    }
}

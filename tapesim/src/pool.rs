use crossbeam_channel::{Sender, unbounded};
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded background worker pool for read-only side computations
/// (risk-monitor recalculation, bulk mark-to-market reads).
///
/// Opt-in: with `size == 0` every job runs inline on the caller's thread,
/// which keeps replay bit-reproducible. Jobs must be commutative with
/// replay order and must not mutate position state.
#[derive(Debug)]
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self { tx: None, workers: Vec::new() };
        }

        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size)
            .map(|index| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("tapesim-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        debug!(index, "worker drained");
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        Self { tx: Some(tx), workers }
    }

    pub fn is_inline(&self) -> bool {
        self.tx.is_none()
    }

    /// Run `job` on a worker, or inline when the pool is disabled.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.tx {
            // A send only fails during shutdown, where dropping the side
            // computation is acceptable.
            Some(tx) => {
                let _ = tx.send(Box::new(job));
            }
            None => job(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel drains and stops the workers.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Shared risk-monitor slot recalculated off the scheduler thread.
///
/// Updates for older dates never overwrite newer ones, so out-of-order
/// completion across workers cannot corrupt the final snapshot.
#[derive(Debug, Clone, Default)]
pub struct RiskMonitor {
    slot: std::sync::Arc<parking_lot::Mutex<crate::output::RiskSnapshot>>,
}

impl RiskMonitor {
    /// Post a recalculation of the risk snapshot from a fund copy.
    pub fn update(&self, pool: &WorkerPool, fund: crate::portfolio::FundInfo, date: u32) {
        let slot = std::sync::Arc::clone(&self.slot);
        pool.execute(move || {
            let fresh = crate::output::RiskSnapshot::recalc(&fund, date);
            let mut guard = slot.lock();
            if fresh.date >= guard.date {
                *guard = fresh;
            }
        });
    }

    pub fn snapshot(&self) -> crate::output::RiskSnapshot {
        self.slot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn test_inline_pool_runs_on_caller() {
        let pool = WorkerPool::new(0);
        assert!(pool.is_inline());
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        pool.execute(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        // Inline execution completes before execute returns.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_drains_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2);
            for _ in 0..16 {
                let seen = Arc::clone(&counter);
                pool.execute(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}

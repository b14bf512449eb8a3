use scoped_threadpool::Pool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Per-phase parallel dispatch. A fixed pool of worker threads runs one
/// closure per worker; the calling thread is the distinguished master
/// and performs single-threaded setup/teardown around each dispatch.
pub struct Dispatcher {
    pool: Pool,
    workers: usize,
}

impl Dispatcher {
    pub fn new(workers: usize) -> Self {
        assert!(workers >= 1);
        Self {
            pool: Pool::new(workers as u32),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Direct access to the scoped pool for phases that move per-worker
    /// state (work-stealing deques) into their tasks.
    pub fn scoped<'pool, 'scope, F, R>(&'pool mut self, f: F) -> R
    where
        F: FnOnce(&scoped_threadpool::Scope<'pool, 'scope>) -> R,
    {
        self.pool.scoped(f)
    }

    /// Runs `task` on every worker. `task` receives the worker index;
    /// index 0 belongs to the master-adjacent worker, but all indices run
    /// on pool threads. Returns when every worker has finished.
    pub fn dispatch<F>(&mut self, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let task = &task;
        let workers = self.workers;
        self.pool.scoped(|scoped| {
            for worker_id in 0..workers {
                scoped.execute(move || task(worker_id));
            }
        });
    }
}

/// Lightweight work-stealing termination protocol: a worker that runs
/// out of work votes to stop, then re-checks whether anyone re-armed.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );

            match result {
                Ok(_) => {
                    // Increased again before everyone terminated; there
                    // is still work left.
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_runs_every_worker_once() {
        let mut dispatcher = Dispatcher::new(4);
        let hits: [AtomicUsize; 4] = std::array::from_fn(|_| AtomicUsize::new(0));
        dispatcher.dispatch(|worker_id| {
            hits[worker_id].fetch_add(1, Ordering::Relaxed);
        });
        for hit in hits.iter() {
            assert_eq!(hit.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn single_worker_terminates_immediately() {
        let terminator = Terminator::new(1);
        assert!(terminator.try_terminate());
    }
}

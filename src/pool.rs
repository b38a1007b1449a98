//! Persistent worker-thread pool. Threads are spawned once and parked on a
//! condvar between batches; a batch hands every worker a shared, lock-free
//! job counter so there is no per-job scheduling overhead.
//!
//! An outer `Mutex`-guarded "is there a batch, and am I still running"
//! wait, and an inner lock-free claim loop (`fetch_add` on
//! `next_job_idx`) once a batch is live.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;

/// A unit of work handed to every claimed job: `(job_id, worker_idx)`.
/// `worker_idx` is stable across a worker's lifetime and is how callers
/// index into their own per-worker scratch (e.g. one [`crate::memory::Arena`]
/// per worker).
pub type JobFn = dyn Fn(u32, usize) + Send + Sync;

/// Thread pool sizing/naming, the ambient configuration layer threaded in
/// from [`crate::config::EngineConfig`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// `None` defers to `std::thread::available_parallelism()`.
    pub num_threads: Option<usize>,
    pub name: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            num_threads: None,
            name: "sionflow-worker".to_string(),
        }
    }
}

struct Batch {
    running: bool,
    job: Option<Arc<JobFn>>,
}

struct Shared {
    batch: Mutex<Batch>,
    work_cond: Condvar,
    done_cond: Condvar,
    total_jobs: AtomicU32,
    next_job_idx: CachePadded<AtomicU32>,
    completed_count: CachePadded<AtomicU32>,
    /// Bumped on every `run()` so a worker that wakes spuriously between
    /// batches (after one batch finishes, before the next starts) can tell
    /// whether the batch it sees is new or the one it already finished.
    generation: AtomicU32,
}

/// A persistent pool of worker threads dispatching flat `0..job_count`
/// index ranges. One call to [`ThreadPool::run`] blocks the calling thread
/// until every job in the batch has completed.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `config.num_threads` (or `available_parallelism()`) worker
    /// threads, each running `worker_init(worker_idx)` once up front to
    /// build its long-lived local state.
    pub fn new<T, I>(config: ThreadPoolConfig, worker_init: I) -> ThreadPool
    where
        T: Send + 'static,
        I: Fn(usize) -> T + Send + Sync + 'static,
    {
        let num_threads = config.num_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let shared = Arc::new(Shared {
            batch: Mutex::new(Batch {
                running: true,
                job: None,
            }),
            work_cond: Condvar::new(),
            done_cond: Condvar::new(),
            total_jobs: AtomicU32::new(0),
            next_job_idx: CachePadded::new(AtomicU32::new(0)),
            completed_count: CachePadded::new(AtomicU32::new(0)),
            generation: AtomicU32::new(0),
        });

        let worker_init = Arc::new(worker_init);
        let mut workers = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared = shared.clone();
            let worker_init = worker_init.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name, idx))
                .spawn(move || worker_loop(shared, idx, worker_init))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        ThreadPool { shared, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Runs `job_fn` over `0..job_count`, blocking until every job has been
    /// claimed and completed by some worker. A `job_count` of zero returns
    /// immediately without waking any worker.
    pub fn run(&self, job_count: u32, job_fn: Arc<JobFn>) {
        if job_count == 0 {
            return;
        }

        {
            let mut batch = self.shared.batch.lock().unwrap();
            batch.job = Some(job_fn);
            self.shared.total_jobs.store(job_count, Ordering::SeqCst);
            self.shared.next_job_idx.store(0, Ordering::SeqCst);
            self.shared.completed_count.store(0, Ordering::SeqCst);
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.work_cond.notify_all();
        }

        let mut batch = self.shared.batch.lock().unwrap();
        while self.shared.completed_count.load(Ordering::SeqCst) < job_count {
            batch = self.shared.done_cond.wait(batch).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut batch = self.shared.batch.lock().unwrap();
            batch.running = false;
            self.shared.work_cond.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop<T, I>(shared: Arc<Shared>, worker_idx: usize, worker_init: Arc<I>)
where
    T: Send + 'static,
    I: Fn(usize) -> T + Send + Sync + 'static,
{
    // Thread-local data lives for the worker's whole lifetime, built once
    // here, unlike the per-job closures passed to `run`.
    let _worker_local: T = worker_init(worker_idx);
    let mut seen_generation = 0u32;

    loop {
        let job = {
            let mut batch = shared.batch.lock().unwrap();
            loop {
                if !batch.running {
                    return;
                }
                let current_generation = shared.generation.load(Ordering::SeqCst);
                if current_generation != seen_generation
                    && shared.next_job_idx.load(Ordering::SeqCst) < shared.total_jobs.load(Ordering::SeqCst)
                {
                    seen_generation = current_generation;
                    break;
                }
                batch = shared.work_cond.wait(batch).unwrap();
            }
            batch.job.clone()
        };

        let Some(job) = job else { continue };
        let total_jobs = shared.total_jobs.load(Ordering::SeqCst);

        loop {
            let job_id = shared.next_job_idx.fetch_add(1, Ordering::SeqCst);
            if job_id >= total_jobs {
                break;
            }
            job(job_id, worker_idx);
            let finished = shared.completed_count.fetch_add(1, Ordering::SeqCst) + 1;
            if finished == total_jobs {
                let _guard = shared.batch.lock().unwrap();
                shared.done_cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_every_job_exactly_once() {
        let pool = ThreadPool::new(
            ThreadPoolConfig {
                num_threads: Some(4),
                ..Default::default()
            },
            |_idx| (),
        );
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
        let seen_for_job = seen.clone();
        pool.run(
            100,
            Arc::new(move |job_id, _worker_idx| {
                seen_for_job[job_id as usize].fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(seen.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn empty_batch_returns_immediately() {
        let pool = ThreadPool::new(ThreadPoolConfig::default(), |_| ());
        pool.run(0, Arc::new(|_, _| panic!("should never be called")));
    }

    #[test]
    fn sequential_batches_each_complete_fully() {
        let pool = ThreadPool::new(
            ThreadPoolConfig {
                num_threads: Some(2),
                ..Default::default()
            },
            |_| (),
        );
        for _ in 0..5 {
            let counter = Arc::new(AtomicUsize::new(0));
            let c = counter.clone();
            pool.run(16, Arc::new(move |_job_id, _w| { c.fetch_add(1, Ordering::SeqCst); }));
            assert_eq!(counter.load(Ordering::SeqCst), 16);
        }
    }

    #[test]
    fn worker_local_state_is_built_once_per_worker() {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let init_calls_for_pool = init_calls.clone();
        let pool = ThreadPool::new(
            ThreadPoolConfig {
                num_threads: Some(3),
                ..Default::default()
            },
            move |_idx| {
                init_calls_for_pool.fetch_add(1, Ordering::SeqCst);
            },
        );
        pool.run(10, Arc::new(|_, _| {}));
        pool.run(10, Arc::new(|_, _| {}));
        assert_eq!(init_calls.load(Ordering::SeqCst), 3);
    }
}

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// A fixed-size worker pool draining a priority queue: larger priorities
/// run first, and tasks sharing a priority run in submission order.
///
/// Writer tasks carry positive priorities and reader tasks negative ones,
/// so a pending write always displaces pending reads when workers contend.
pub struct PriorityPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

struct PoolState {
    queue: BinaryHeap<Job>,
    next_seq: u64,
    shutdown: bool,
}

struct Job {
    priority: i32,
    seq: u64,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: highest priority first, then earliest submission
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PriorityPool {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });

        let handles = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("lanesplit-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("could not spawn a worker thread")
            })
            .collect();

        PriorityPool {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueues a task. Silently dropped after `shutdown_now`.
    pub fn execute<F>(&self, priority: i32, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            if state.shutdown {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Job {
                priority,
                seq,
                run: Box::new(task),
            });
        }
        self.shared.work_ready.notify_one();
    }

    /// Cancels every pending task and tells workers to stop once their
    /// current task finishes.
    pub fn shutdown_now(&self) {
        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.shutdown = true;
            state.queue.clear();
        }
        self.shared.work_ready.notify_all();
    }

    /// Waits for every worker to exit. Call `shutdown_now` first.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().expect("pool lock poisoned");
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.queue.pop() {
                    break job;
                }
                state = shared
                    .work_ready
                    .wait(state)
                    .expect("pool lock poisoned");
            }
        };
        // tasks report their own failures; a panic slipping through must
        // not take the worker down with it
        if std::panic::catch_unwind(AssertUnwindSafe(job.run)).is_err() {
            error!("a pool task panicked");
        }
    }
}

/// Resolves the worker count from the user override: positive values are
/// exact, zero means every core, and negative values leave that many cores
/// free. Except for explicit overrides the pool never exceeds the tile
/// count, since at most one reader per tile can run.
pub fn resolve_pool_size(num_threads: i32, num_tiles: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let tiles = num_tiles.max(1);
    match num_threads {
        n if n > 0 => n as usize,
        0 => cores.min(tiles),
        n => cores
            .saturating_sub(n.unsigned_abs() as usize)
            .max(1)
            .min(tiles),
    }
}

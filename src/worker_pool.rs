//! Bounded-queue thread pool with core/max elasticity (§4.7).
//!
//! The reference pool guards a `std::queue` with a mutex and two condition
//! variables (not-empty, not-full). Here the queue itself is a bounded
//! `crossbeam_channel`, which gives the same block-when-full / wake-one-
//! waiter behavior without hand-rolled condvars, matching how the rest of
//! this crate already uses `crossbeam_channel` for cross-thread handoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::ThreadPoolConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// A bounded FIFO task queue backed by `core..=max` worker threads.
pub struct WorkerPool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    max_threads: usize,
    current_threads: Arc<AtomicUsize>,
    active_threads: Arc<AtomicUsize>,
    rejected_count: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Builds a pool from `config`, resolving `0` fields to sane defaults
    /// (`core_threads` and `max_threads` to available parallelism,
    /// `queue_capacity` to 1024) and spawning `core_threads` workers.
    pub fn new(config: &ThreadPoolConfig) -> Self {
        let core_threads = if config.core_threads == 0 {
            available_parallelism()
        } else {
            config.core_threads
        };
        let max_threads = if config.max_threads == 0 {
            core_threads.max(available_parallelism())
        } else {
            config.max_threads.max(core_threads)
        };
        let queue_capacity = if config.queue_capacity == 0 { 1024 } else { config.queue_capacity };

        let (sender, receiver) = crossbeam_channel::bounded(queue_capacity);
        let pool = WorkerPool {
            sender,
            receiver,
            max_threads,
            current_threads: Arc::new(AtomicUsize::new(0)),
            active_threads: Arc::new(AtomicUsize::new(0)),
            rejected_count: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..core_threads {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let receiver = self.receiver.clone();
        let active_threads = self.active_threads.clone();
        let current_threads = self.current_threads.clone();
        let handle = std::thread::Builder::new()
            .name("worker-pool".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    active_threads.fetch_add(1, Ordering::SeqCst);
                    job();
                    active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                current_threads.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("failed to spawn worker pool thread");
        self.current_threads.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().push(handle);
    }

    /// Spawns one more worker if the queue is deeper than the current
    /// thread count and there's headroom under `max_threads`.
    fn grow_if_needed(&self) {
        let current = self.current_threads.load(Ordering::SeqCst);
        if self.sender.len() > current && current < self.max_threads {
            self.spawn_worker();
        }
    }

    /// Enqueues `task`, blocking the caller while the queue is full. A task
    /// submitted after `shutdown` has dropped the receiving end is silently
    /// discarded rather than panicking the caller.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.grow_if_needed();
        let _ = self.sender.send(Box::new(task));
    }

    /// Enqueues `task` without blocking; `false` (and a bumped rejected
    /// counter) if the queue is full or the pool has been shut down.
    pub fn try_post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.grow_if_needed();
        match self.sender.try_send(Box::new(task)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.rejected_count.fetch_add(1, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Approximate number of queued-but-not-yet-started tasks.
    pub fn queue_size(&self) -> usize {
        self.sender.len()
    }

    /// Number of live worker threads, `core_threads..=max_threads`.
    pub fn current_thread_count(&self) -> usize {
        self.current_threads.load(Ordering::SeqCst)
    }

    /// Number of workers currently executing a task.
    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Total tasks rejected by `try_post` since construction.
    pub fn rejected_count(&self) -> usize {
        self.rejected_count.load(Ordering::SeqCst)
    }

    /// Stops accepting new work, lets queued tasks drain, and joins every
    /// worker thread.
    pub fn shutdown(self) {
        drop(self.sender);
        let handles = self.handles.into_inner().unwrap();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config(core: usize, max: usize, capacity: usize) -> ThreadPoolConfig {
        ThreadPoolConfig {
            core_threads: core,
            max_threads: max,
            queue_capacity: capacity,
            io_threads: 0,
        }
    }

    #[test]
    fn post_runs_task_on_a_worker_thread() {
        let pool = WorkerPool::new(&config(1, 1, 4));
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.post(move || {
            let _ = tx.send(42);
        });
        assert_eq!(42, rx.recv_timeout(Duration::from_secs(1)).unwrap());
        pool.shutdown();
    }

    #[test]
    fn try_post_rejects_when_queue_is_full() {
        // One worker, kept busy, and a one-slot queue: the first try_post
        // fills the queue behind the busy worker, the second has nowhere
        // to go.
        let pool = WorkerPool::new(&config(1, 1, 1));
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        pool.post(move || {
            let _ = release_rx.recv();
        });
        std::thread::sleep(Duration::from_millis(50));

        assert!(pool.try_post(|| {}));
        assert!(!pool.try_post(|| {}));
        assert_eq!(1, pool.rejected_count());
        let _ = release_tx.send(());
    }

    #[test]
    fn current_thread_count_starts_at_core_threads() {
        let pool = WorkerPool::new(&config(3, 5, 16));
        assert_eq!(3, pool.current_thread_count());
        pool.shutdown();
    }

    #[test]
    fn shutdown_joins_all_workers() {
        let pool = WorkerPool::new(&config(2, 2, 16));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let counter = counter.clone();
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(2, counter.load(Ordering::SeqCst));
    }
}

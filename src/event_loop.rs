//! Thread-local reactor: poll, dispatch channels, run pending tasks.
//!
//! Every mutation of an `EventLoop`'s channels or pending-task queue happens
//! on the loop's own thread. Other threads reach it only through a
//! [`LoopHandle`], which posts closures down a channel and wakes the loop.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::poller::{Poller, ReadyEvent};
use crate::timer::{TimerId, TimerQueue};

/// Reserved for the loop's own wake-up notifications.
const WAKE_TOKEN: Token = Token(usize::MAX);
/// Reserved for the loop's `timerfd`.
const TIMER_TOKEN: Token = Token(usize::MAX - 1);

type Job = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_ON_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// A cloneable, `Send + Sync` reference to a running [`EventLoop`], usable
/// from any thread to post work onto it.
#[derive(Clone)]
pub struct LoopHandle {
    sender: crossbeam_channel::Sender<Job>,
    waker: Arc<mio::Waker>,
    thread_id: ThreadId,
}

impl LoopHandle {
    /// Posts `f` to run on the owning loop's thread. If called from that
    /// thread, still queues (use [`EventLoop::run_in_loop`] from inside the
    /// loop itself for synchronous inline execution).
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(f));
        let _ = self.waker.wake();
    }

    /// Whether the calling thread is the loop's own thread.
    pub fn is_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

/// Single-threaded reactor. Construction asserts no other `EventLoop` is
/// already running on this OS thread.
pub struct EventLoop {
    poller: Poller,
    timers: TimerQueue,
    waker: Arc<mio::Waker>,
    job_tx: crossbeam_channel::Sender<Job>,
    job_rx: crossbeam_channel::Receiver<Job>,
    calling_pending_functors: AtomicBool,
    thread_id: ThreadId,
}

impl EventLoop {
    /// Creates a new event loop bound to the calling thread.
    pub fn new() -> io::Result<Self> {
        LOOP_ON_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "two EventLoops must not coexist on the same thread"
            );
            flag.set(true);
        });

        let poller = Poller::new(1024)?;
        let waker = Arc::new(mio::Waker::new(poller.registry(), WAKE_TOKEN)?);
        let timers = TimerQueue::new()?;

        let timer_fd = timers.as_raw_fd();
        poller.add_or_update(
            &mut SourceFd(&timer_fd),
            TIMER_TOKEN,
            Interest::READABLE,
            false,
        )?;

        let (job_tx, job_rx) = crossbeam_channel::unbounded();

        Ok(EventLoop {
            poller,
            timers,
            waker,
            job_tx,
            job_rx,
            calling_pending_functors: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
        })
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            sender: self.job_tx.clone(),
            waker: self.waker.clone(),
            thread_id: self.thread_id,
        }
    }

    /// Access to the poller's registry, for registering connection/listener
    /// sources directly.
    pub fn registry(&self) -> &mio::Registry {
        self.poller.registry()
    }

    /// Whether the calling thread is this loop's thread.
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Runs `f` inline if called from the loop's own thread; otherwise
    /// queues it and wakes the loop.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always queues `f`, waking the loop if necessary (called from another
    /// thread, or called while the loop is already executing its pending
    /// queue and thus must wake itself to avoid missing the new job).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.job_tx.send(Box::new(f));
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::SeqCst) {
            self.wake();
        }
    }

    /// Writes to the internal wake-up mechanism so a blocked `poll` returns.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Schedules `cb` to run once at `when`.
    pub fn run_at(&mut self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add_timer(when, None, Box::new(cb))
    }

    /// Schedules `cb` to run once after `delay`.
    pub fn run_after(&mut self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Schedules `cb` to run every `interval`, starting after the first
    /// interval elapses.
    pub fn run_every(&mut self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timers
            .add_timer(Instant::now() + interval, Some(interval), Box::new(cb))
    }

    /// Cancels a previously scheduled timer.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Performs one iteration: poll for I/O, drain the wake/timer tokens
    /// internally, and run pending tasks snapshotted under the queue. Returns
    /// the events for tokens the caller owns (i.e. everything besides the
    /// loop's own wake and timer fds) so the caller can dispatch connection
    /// I/O.
    pub fn poll_and_dispatch(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let (events, _now) = self.poller.poll(timeout)?;

        let mut rest = Vec::with_capacity(events.len());
        for event in events {
            match event.token {
                WAKE_TOKEN => {}
                TIMER_TOKEN => self.timers.handle_expiry(),
                _ => rest.push(event),
            }
        }

        self.run_pending_jobs();
        Ok(rest)
    }

    fn run_pending_jobs(&mut self) {
        let mut jobs = Vec::new();
        while let Ok(job) = self.job_rx.try_recv() {
            jobs.push(job);
        }

        self.calling_pending_functors.store(true, Ordering::SeqCst);
        for job in jobs {
            job();
        }
        self.calling_pending_functors.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        LOOP_ON_THIS_THREAD.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    #[should_panic(expected = "two EventLoops must not coexist")]
    fn second_loop_on_same_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn run_in_loop_on_owning_thread_executes_inline() {
        let loop_ = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        loop_.run_in_loop(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_jobs_run_in_submission_order() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order2 = order.clone();
        let t = std::thread::spawn(move || {
            for i in 0..5 {
                let order3 = order2.clone();
                handle.post(move || order3.lock().unwrap().push(i));
            }
        });
        t.join().unwrap();

        // Drain until all 5 jobs have run (poll with a short timeout; the
        // waker will wake it promptly).
        let mut seen = 0;
        while seen < 5 {
            let _ = loop_
                .poll_and_dispatch(Some(Duration::from_millis(50)))
                .unwrap();
            seen = order.lock().unwrap().len();
        }

        assert_eq!(vec![0, 1, 2, 3, 4], *order.lock().unwrap());
    }
}

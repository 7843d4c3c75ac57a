//! Monotonic priority queue of timers backed by a single `timerfd` expiry
//! descriptor, so the event loop can wait on timers with the same `poll`
//! call it uses for sockets instead of computing its own shortest sleep.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Opaque handle returned by [`TimerQueue::add_timer`], usable with
/// [`TimerQueue::cancel`].
pub type TimerId = u64;

struct Entry {
    interval: Option<Duration>,
    callback: Box<dyn FnMut() + Send>,
}

/// A monotonic, `timerfd`-backed timer queue. Timers fire in non-decreasing
/// `when` order; ties break by insertion order (the `TimerId` counter is
/// monotonically increasing and used as the tiebreaker key).
pub struct TimerQueue {
    fd: RawFd,
    order: BTreeSet<(Instant, TimerId)>,
    entries: HashMap<TimerId, Entry>,
    next_id: TimerId,
}

impl TimerQueue {
    /// Creates a new, disarmed timer queue with its own `timerfd`.
    pub fn new() -> io::Result<Self> {
        // Safety: `timerfd_create` has no preconditions beyond valid flags.
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(TimerQueue {
            fd,
            order: BTreeSet::new(),
            entries: HashMap::new(),
            next_id: 0,
        })
    }

    /// Raw fd to register with a [`crate::poller::Poller`] for readability.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Schedules `callback` to run at `when`, and every `interval`
    /// thereafter if given. Returns an id usable with [`TimerQueue::cancel`].
    pub fn add_timer(
        &mut self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.order.insert((when, id));
        self.entries.insert(id, Entry { interval, callback });

        if self.order.iter().next() == Some(&(when, id)) {
            self.rearm();
        }

        id
    }

    /// Cancels a pending timer. No-op if it already fired and was not
    /// repeating, or if the id is unknown.
    pub fn cancel(&mut self, id: TimerId) {
        if self.entries.remove(&id).is_some() {
            self.order.retain(|(_, entry_id)| *entry_id != id);
            self.rearm();
        }
    }

    /// Call when the `timerfd` reports readable. Drains the kernel's expiry
    /// counter, fires every due callback in `when` order, re-arms repeating
    /// timers, and re-arms the `timerfd` to the next earliest deadline.
    pub fn handle_expiry(&mut self) {
        let mut counter = [0u8; 8];
        // Safety: reading an 8-byte counter into a correctly sized stack buffer.
        // timerfd read may legitimately return EAGAIN if another thread/woke
        // us spuriously; that's fine, we still scan for due entries below.
        unsafe {
            libc::read(self.fd, counter.as_mut_ptr() as *mut libc::c_void, counter.len());
        }

        let now = Instant::now();
        let due: Vec<(Instant, TimerId)> = self
            .order
            .range(..=(now, TimerId::MAX))
            .cloned()
            .collect();

        for (when, id) in due {
            self.order.remove(&(when, id));
            if let Some(mut entry) = self.entries.remove(&id) {
                (entry.callback)();
                if let Some(interval) = entry.interval {
                    let next_when = now + interval;
                    self.order.insert((next_when, id));
                    self.entries.insert(id, entry);
                }
            }
        }

        self.rearm();
    }

    fn rearm(&self) {
        let next = self.order.iter().next().map(|(when, _)| *when);
        let now = Instant::now();

        let value = match next {
            Some(when) => {
                let delta = when.saturating_duration_since(now).max(Duration::from_nanos(1));
                duration_to_timespec(delta)
            }
            None => duration_to_timespec(Duration::ZERO),
        };

        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: value,
        };

        // Safety: `fd` is a valid timerfd owned by this struct; `new_value`
        // is fully initialized and `old_value` is not requested.
        unsafe {
            libc::timerfd_settime(self.fd, 0, &new_value, std::ptr::null_mut());
        }
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        // Safety: `fd` was obtained from `timerfd_create` and is owned solely
        // by this struct.
        unsafe {
            libc::close(self.fd);
        }
        // silence unused-import warnings on platforms without mem use elsewhere
        let _ = mem::size_of::<Entry>();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn timers_fire_in_expiry_order() {
        let mut queue = TimerQueue::new().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, delay_ms) in [("C", 30), ("A", 10), ("B", 20)] {
            let order = order.clone();
            queue.add_timer(
                now + Duration::from_millis(delay_ms),
                None,
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        std::thread::sleep(Duration::from_millis(40));
        queue.handle_expiry();

        assert_eq!(vec!["A", "B", "C"], *order.lock().unwrap());
    }

    #[test]
    fn cancel_prevents_callback_from_firing() {
        let mut queue = TimerQueue::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let id = queue.add_timer(
            Instant::now() + Duration::from_millis(5),
            None,
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.cancel(id);

        std::thread::sleep(Duration::from_millis(15));
        queue.handle_expiry();

        assert_eq!(0, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn repeating_timer_fires_more_than_once() {
        let mut queue = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        queue.add_timer(
            Instant::now() + Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            queue.handle_expiry();
        }

        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}

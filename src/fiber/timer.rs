//! Deadline-ordered timer set.
//!
//! Timers live in a set ordered by `(absolute deadline ms, unique id)`, so
//! the earliest timer is always the head and equal deadlines fire in
//! creation order. A timer is one-shot unless `period > 0`, in which case it
//! is re-inserted at `deadline + period` in the same critical section that
//! collected it.
//!
//! A *condition* timer is bound to a liveness token: its callback only runs
//! while `Weak::upgrade` still observes the token. The hook layer uses this
//! to let an I/O timeout evaporate when the awaited operation already
//! completed and dropped the token.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::clock;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    period: u64,
    cb: TimerCallback,
}

struct Inner {
    /// (deadline ms, id) → timer. Iteration order is the firing order.
    timers: BTreeMap<(u64, u64), TimerEntry>,
    /// id → current deadline, for O(log n) cancellation.
    by_id: HashMap<u64, u64>,
    /// Set when the current head has already produced a wake-up, cleared on
    /// every `next_timeout_ms`. Suppresses redundant tickles when several
    /// timers land at the front back-to-back.
    tickled: bool,
}

pub struct TimerWheel {
    inner: Mutex<Inner>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            inner: Mutex::new(Inner {
                timers: BTreeMap::new(),
                by_id: HashMap::new(),
                tickled: false,
            }),
        }
    }

    /// Arm a timer `ms` from now. `period > 0` makes it periodic. Returns
    /// `(id, inserted_at_front)`; the caller is responsible for waking its
    /// wait loop when the head changed.
    pub fn add_timer<F>(&self, ms: u64, cb: F, period: u64) -> (u64, bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(clock::monotonic_ms() + ms, Arc::new(cb), period)
    }

    /// Like [`TimerWheel::add_timer`], but the callback runs only if `cond`
    /// still upgrades at fire time.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, period: u64) -> (u64, bool)
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let wrapped = move || {
            if cond.upgrade().is_some() {
                cb();
            }
        };
        self.add_timer(ms, wrapped, period)
    }

    fn insert(&self, deadline: u64, cb: TimerCallback, period: u64) -> (u64, bool) {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.timers.insert((deadline, id), TimerEntry { period, cb });
        inner.by_id.insert(id, deadline);
        let at_front =
            inner.timers.keys().next() == Some(&(deadline, id)) && !inner.tickled;
        if at_front {
            inner.tickled = true;
        }
        (id, at_front)
    }

    /// Disarm. Returns whether the timer was still armed.
    pub fn cancel_timer(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_id.remove(&id) {
            Some(deadline) => {
                inner.timers.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    /// Milliseconds until the head fires (0 if overdue), or `None` when the
    /// set is empty. Clears the tickled flag.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.tickled = false;
        let &(deadline, _) = inner.timers.keys().next()?;
        Some(deadline.saturating_sub(clock::monotonic_ms()))
    }

    /// Remove and return the callbacks of every timer with
    /// `deadline <= now`, in deadline order. Periodic timers are refreshed
    /// and re-inserted before returning.
    pub fn collect_expired(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock().unwrap();
        if inner.timers.is_empty() {
            return Vec::new();
        }
        let unexpired = inner.timers.split_off(&(now + 1, 0));
        let expired = mem::replace(&mut inner.timers, unexpired);

        let mut cbs = Vec::with_capacity(expired.len());
        for ((deadline, id), entry) in expired {
            cbs.push(entry.cb.clone());
            if entry.period > 0 {
                let refreshed = deadline + entry.period;
                inner.by_id.insert(id, refreshed);
                inner.timers.insert((refreshed, id), entry);
            } else {
                inner.by_id.remove(&id);
            }
        }
        cbs
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadline currently recorded for `id`, if armed. Test hook.
    #[cfg(test)]
    pub(crate) fn deadline_of(&self, id: u64) -> Option<u64> {
        self.inner.lock().unwrap().by_id.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = clock::monotonic_ms();

        for (ms, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')].iter().copied() {
            let order = order.clone();
            wheel.add_timer(ms, move || order.lock().unwrap().push(tag), 0);
        }

        let cbs = wheel.collect_expired(now + 100);
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
        assert!(wheel.is_empty());
    }

    #[test]
    fn collect_expired_takes_exactly_the_due_set() {
        let wheel = TimerWheel::new();
        let now = clock::monotonic_ms();
        wheel.add_timer(10, || {}, 0);
        wheel.add_timer(50, || {}, 0);

        let cbs = wheel.collect_expired(now + 20);
        assert_eq!(cbs.len(), 1);
        assert_eq!(wheel.len(), 1);
        assert!(wheel.next_timeout_ms().unwrap() > 0);
    }

    #[test]
    fn periodic_timer_is_refreshed_in_place() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let now = clock::monotonic_ms();
        let (id, _) = wheel.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            10,
        );

        for round in 1..=3 {
            let cbs = wheel.collect_expired(now + round * 10 + 5);
            assert_eq!(cbs.len(), 1, "round {}", round);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // still armed, deadline pushed past the last collection point
        let deadline = wheel.deadline_of(id).expect("timer still armed");
        assert!(deadline > now + 35 && deadline <= now + 45);
    }

    #[test]
    fn cancel_removes_the_timer() {
        let wheel = TimerWheel::new();
        let (id, _) = wheel.add_timer(10, || panic!("cancelled timer fired"), 0);
        assert!(wheel.cancel_timer(id));
        assert!(!wheel.cancel_timer(id));
        assert!(wheel.collect_expired(clock::monotonic_ms() + 100).is_empty());
    }

    #[test]
    fn condition_timer_skips_a_dead_token() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let live = Arc::new(());
        let dead = Arc::new(());
        let dead_weak = Arc::downgrade(&dead);
        drop(dead);

        let f = fired.clone();
        wheel.add_condition_timer(
            5,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&live),
            0,
        );
        let f = fired.clone();
        wheel.add_condition_timer(
            5,
            move || {
                f.fetch_add(100, Ordering::SeqCst);
            },
            dead_weak,
            0,
        );

        for cb in wheel.collect_expired(clock::monotonic_ms() + 50) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_insertion_reports_once_until_rearmed() {
        let wheel = TimerWheel::new();
        let (_, front) = wheel.add_timer(100, || {}, 0);
        assert!(front);
        // an earlier timer lands at the front, but the head wake-up is
        // already outstanding
        let (_, front) = wheel.add_timer(50, || {}, 0);
        assert!(!front);
        // the wait loop recomputed its timeout; front insertions report again
        let _ = wheel.next_timeout_ms();
        let (_, front) = wheel.add_timer(10, || {}, 0);
        assert!(front);
    }
}

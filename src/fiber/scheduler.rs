//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns N worker threads draining one FIFO queue of tasks —
//! fibers or bare closures — under a single mutex. A task may be pinned to a
//! specific worker thread (by OS tid); pinned tasks are never taken by other
//! threads. Closures run inside a reusable per-worker *callback fiber*, so
//! they may suspend like any fiber.
//!
//! With `use_caller`, the constructing thread contributes an extra worker
//! slot: a synthesized *root fiber* runs the worker loop when the caller
//! enters [`Scheduler::run_root`]. This is how the process main thread ends
//! up serving the work reactor.
//!
//! Stopping is cooperative: [`Scheduler::stop`] raises a flag and wakes the
//! workers; each worker exits once the flag is up, the queue has drained,
//! no worker is mid-task, and the parker reports nothing pending.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::fiber::{self, Fiber, State};
use crate::hook;

/// OS thread id of the calling thread.
pub fn os_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
}

/// The scheduler driving the calling thread, if it is a worker thread.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHED.with(|c| c.borrow().clone())
}

////////////////////////////////////////////////////////////////////////////////
// Parker
////////////////////////////////////////////////////////////////////////////////

/// What a worker does when it runs out of tasks, and how it is woken.
///
/// The reactor implements this: `idle` runs one epoll/timer cycle, `tickle`
/// writes the self-pipe, `pending` reports outstanding timers (which keep
/// the scheduler from stopping).
pub(crate) trait Parker: Send + Sync {
    /// One park cycle. Runs on the idle fiber; returning yields back to the
    /// worker loop.
    fn idle(&self, sched: &Arc<Scheduler>);

    /// Wake one parked worker.
    fn tickle(&self);

    /// Whether the parker still holds work that must keep the scheduler
    /// alive (armed timers).
    fn pending(&self) -> bool;

    /// Invoked once on each worker thread before it starts scheduling.
    fn register_thread(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

pub(crate) enum Work {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

pub(crate) struct Task {
    work: Work,
    /// Pinned worker tid; `None` runs anywhere.
    thread: Option<libc::pid_t>,
}

impl Task {
    pub(crate) fn from_fiber(fiber: Arc<Fiber>, thread: Option<libc::pid_t>) -> Task {
        Task {
            work: Work::Fiber(fiber),
            thread,
        }
    }

    pub(crate) fn from_call(call: Box<dyn FnOnce() + Send>, thread: Option<libc::pid_t>) -> Task {
        Task {
            work: Work::Call(call),
            thread,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Worker threads spawned by `start` (excludes the caller slot).
    thread_count: usize,
    stopping: AtomicBool,
    active: AtomicUsize,
    idle_workers: AtomicUsize,
    use_caller: bool,
    root_tid: AtomicI32,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    parker: Mutex<Option<Weak<dyn Parker>>>,
    weak_self: OnceCell<Weak<Scheduler>>,
}

impl Scheduler {
    /// A scheduler with `threads` worker slots. With `use_caller`, one slot
    /// is the constructing thread (enter it later via
    /// [`Scheduler::run_root`]); the remaining slots become OS threads on
    /// [`Scheduler::start`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Scheduler>> {
        assert!(threads > 0, "scheduler needs at least one worker");
        let spawned = if use_caller { threads - 1 } else { threads };
        let sched = Arc::new(Scheduler {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count: spawned,
            stopping: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            use_caller,
            root_tid: AtomicI32::new(-1),
            root_fiber: Mutex::new(None),
            parker: Mutex::new(None),
            weak_self: OnceCell::new(),
        });
        sched
            .weak_self
            .set(Arc::downgrade(&sched))
            .ok()
            .expect("weak_self set twice");

        if use_caller {
            let s = sched.clone();
            let root = Fiber::new(move || s.worker_loop())?;
            *sched.root_fiber.lock().unwrap() = Some(root);
            sched.root_tid.store(os_tid(), Ordering::SeqCst);
        }
        Ok(sched)
    }

    pub(crate) fn set_parker(&self, parker: Weak<dyn Parker>) {
        *self.parker.lock().unwrap() = Some(parker);
    }

    fn parker(&self) -> Option<Arc<dyn Parker>> {
        self.parker.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.weak_self
            .get()
            .and_then(Weak::upgrade)
            .expect("scheduler already dropped")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tid the caller slot is bound to, or -1.
    pub fn root_tid(&self) -> libc::pid_t {
        self.root_tid.load(Ordering::SeqCst)
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        if !self.stopping.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.thread_count {
            let s = self.arc();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || s.worker_loop())
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
        log::debug!(
            "scheduler {} started with {} worker thread(s){}",
            self.name,
            self.thread_count,
            if self.use_caller { " + caller slot" } else { "" }
        );
    }

    /// Run the caller-inclusive worker slot on the current thread. Blocks
    /// until the scheduler stops.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was built without `use_caller` or if called
    /// from a different thread than the constructor ran on.
    pub fn run_root(&self) {
        let root = self
            .root_fiber
            .lock()
            .unwrap()
            .clone()
            .expect("scheduler has no caller slot");
        assert_eq!(
            self.root_tid(),
            os_tid(),
            "run_root must run on the constructing thread"
        );
        while !root.state().is_terminal() {
            Fiber::resume(&root);
        }
    }

    /// Queue a fiber, optionally pinned to one worker tid.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<libc::pid_t>) {
        self.push(Task::from_fiber(fiber, thread));
    }

    /// Queue a closure. It runs inside a callback fiber and may suspend.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::from_call(Box::new(f), None));
    }

    pub fn schedule_pinned<F>(&self, f: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::from_call(Box::new(f), Some(thread)));
    }

    /// Queue a batch with at most one wake-up.
    pub(crate) fn schedule_batch(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty
        };
        if was_empty {
            if let Some(p) = self.parker() {
                p.tickle();
            }
        }
    }

    fn push(&self, task: Task) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            if let Some(p) = self.parker() {
                p.tickle();
            }
        }
    }

    /// Move the current fiber to the worker with tid `thread`.
    pub fn switch_to(&self, thread: libc::pid_t) {
        if thread == os_tid() {
            return;
        }
        let cur = fiber::current().expect("switch_to outside of a fiber");
        self.schedule_fiber(cur, Some(thread));
        fiber::yield_to_hold();
    }

    /// True once the scheduler may terminate: stop requested, queue drained,
    /// nobody mid-task and no armed timers.
    pub fn stopping(&self) -> bool {
        let parker_pending = self.parker().map_or(false, |p| p.pending());
        self.stopping.load(Ordering::SeqCst)
            && !parker_pending
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().unwrap().is_empty()
    }

    /// Whether stop has been requested (the full drain may still be in
    /// progress).
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Request cooperative shutdown and join the worker threads. Must not be
    /// called from a worker fiber.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(p) = self.parker() {
            for _ in 0..self.thread_count {
                p.tickle();
            }
            if self.use_caller {
                p.tickle();
            }
        }
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Like [`Scheduler::stop`], but waking the workers through `wake`.
    /// Used during reactor teardown, when the parker weak no longer
    /// upgrades.
    pub(crate) fn stop_now<F: Fn()>(&self, wake: F) {
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..=self.thread_count {
            wake();
        }
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of workers currently parked in the idle fiber.
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    fn worker_loop(self: Arc<Scheduler>) {
        hook::set_enabled(true);
        CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(self.clone()));
        if let Some(p) = self.parker() {
            p.register_thread();
        }
        let tid = os_tid();
        log::debug!("scheduler {} worker loop on tid {}", self.name, tid);

        let idle = {
            let sched = self.clone();
            Fiber::new(move || {
                while !sched.stopping() {
                    match sched.parker() {
                        Some(p) => p.idle(&sched),
                        // a bare scheduler has nothing to wait on
                        None => thread::sleep(Duration::from_millis(1)),
                    }
                    fiber::yield_to_hold();
                }
            })
            .expect("failed to allocate the idle fiber")
        };

        let mut cb_fiber: Option<Arc<Fiber>> = None;
        loop {
            let mut picked: Option<Task> = None;
            let mut need_tickle = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    if let Some(pin) = q[i].thread {
                        if pin != tid {
                            // someone else's task; make sure they hear about it
                            need_tickle = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Work::Fiber(f) = &q[i].work {
                        if f.state() == State::Exec {
                            i += 1;
                            continue;
                        }
                    }
                    picked = q.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                need_tickle = need_tickle || (picked.is_some() && !q.is_empty());
            }
            if need_tickle {
                if let Some(p) = self.parker() {
                    p.tickle();
                }
            }

            match picked.map(|t| t.work) {
                Some(Work::Fiber(f)) => {
                    let state = f.state();
                    if state != State::Exec && state != State::Except {
                        Fiber::resume(&f);
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        match f.state() {
                            State::Ready => self.schedule_fiber(f, None),
                            State::Term | State::Except => {}
                            _ => f.set_state(State::Hold),
                        }
                    } else {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(Work::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => match f.reset(cb) {
                            Ok(()) => f,
                            Err(e) => {
                                log::error!("{}: callback fiber reset failed: {}", self.name, e);
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                        None => match Fiber::new(cb) {
                            Ok(f) => f,
                            Err(e) => {
                                log::error!("{}: callback fiber alloc failed: {}", self.name, e);
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };
                    Fiber::resume(&fiber);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber, None),
                        // finished: keep the fiber around, its stack is reused
                        State::Term | State::Except => cb_fiber = Some(fiber),
                        // suspended in the reactor; it now lives in an event
                        // context and cannot be reused
                        _ => fiber.set_state(State::Hold),
                    }
                }
                None => {
                    if idle.state() == State::Term {
                        log::debug!("scheduler {} worker tid {} exits", self.name, tid);
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::SeqCst);
                    Fiber::resume(&idle);
                    self.idle_workers.fetch_sub(1, Ordering::SeqCst);
                    if !idle.state().is_terminal() {
                        idle.set_state(State::Hold);
                    }
                }
            }
        }

        CURRENT_SCHED.with(|c| *c.borrow_mut() = None);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(ms) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn callbacks_run_on_worker_threads() {
        let sched = Scheduler::new(2, false, "cb-test").unwrap();
        sched.start();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = done.clone();
            sched.schedule(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 50, 2000));
        sched.stop();
    }

    #[test]
    fn ready_fibers_are_requeued() {
        let sched = Scheduler::new(1, false, "ready-test").unwrap();
        sched.start();
        let rounds = Arc::new(AtomicUsize::new(0));
        let r = rounds.clone();
        sched.schedule(move || {
            r.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
            r.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(|| rounds.load(Ordering::SeqCst) == 3, 2000));
        sched.stop();
    }

    #[test]
    fn pinned_tasks_stay_on_their_worker() {
        let sched = Scheduler::new(2, false, "pin-test").unwrap();
        sched.start();

        // learn one worker's tid
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        sched.schedule(move || {
            *s.lock().unwrap() = Some(os_tid());
        });
        assert!(wait_until(|| seen.lock().unwrap().is_some(), 2000));
        let target = seen.lock().unwrap().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let hits = hits.clone();
            sched.schedule_pinned(
                move || {
                    assert_eq!(os_tid(), target);
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                target,
            );
        }
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 20, 2000));
        sched.stop();
    }

    #[test]
    fn worker_threads_enable_the_hook() {
        let sched = Scheduler::new(1, false, "hook-test").unwrap();
        sched.start();
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        sched.schedule(move || {
            if hook::is_enabled() && current().is_some() {
                f.store(1, Ordering::SeqCst);
            }
        });
        assert!(wait_until(|| flag.load(Ordering::SeqCst) == 1, 2000));
        sched.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let sched = Scheduler::new(1, false, "panic-test").unwrap();
        sched.start();
        sched.schedule(|| panic!("session blew up"));
        let after = Arc::new(AtomicUsize::new(0));
        let a = after.clone();
        sched.schedule(move || {
            a.store(1, Ordering::SeqCst);
        });
        assert!(wait_until(|| after.load(Ordering::SeqCst) == 1, 2000));
        sched.stop();
    }
}

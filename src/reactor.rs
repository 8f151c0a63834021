//! Edge-triggered I/O reactor.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle fibers park in
//! `epoll_wait` instead of spinning. It owns one epoll instance, a self-pipe
//! for cross-thread wake-ups (*tickle*), a [`TimerWheel`] and a table of
//! per-descriptor event contexts.
//!
//! Registrations are edge-triggered and one-shot in spirit: when a
//! direction becomes ready the reactor removes it from the residual epoll
//! interest and *triggers* it — schedules the bound fiber or callback on the
//! scheduler recorded at registration time — exactly once. Re-arming always
//! requires a fresh [`IoManager::add_event`].
//!
//! Everything here may be called from any fiber on any thread; the FD
//! context mutex is the synchronization point for one descriptor, and the
//! epoll view is only ever mutated under it, which keeps the two in
//! agreement.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;
use crate::error::{Error, Result};
use crate::fiber::scheduler::{self, Parker, Task, Scheduler};
use crate::fiber::{self, Fiber, TimerWheel};

/// Upper bound for one epoll_wait nap, so timer insertion latency is
/// bounded even when a tickle gets lost.
const MAX_IDLE_TIMEOUT_MS: u64 = 3000;

/// Default readiness batch per wheel spin.
pub const DEFAULT_EVENT_BATCH: usize = 256;

/// epoll data token marking the tickle pipe.
const TICKLE_TOKEN: u64 = u64::MAX;

bitflags::bitflags! {
    /// Readiness directions a registration can wait for.
    pub struct Interest: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

thread_local! {
    // weak, so parked worker threads never keep a dropped reactor alive
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = RefCell::new(None);
}

/// The reactor driving the calling thread, if it is a reactor worker.
pub fn current() -> Option<Arc<IoManager>> {
    CURRENT_IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// Per-direction registration: who to wake, and where.
struct EventCtx {
    sched: Weak<Scheduler>,
    waiter: Waiter,
}

#[derive(Default)]
struct FdInner {
    events: Interest,
    read: Option<EventCtx>,
    write: Option<EventCtx>,
}

impl Default for Interest {
    fn default() -> Self {
        Interest::empty()
    }
}

struct FdCtx {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

pub struct IoManager {
    epfd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    event_batch: usize,
    timers: TimerWheel,
    contexts: RwLock<Vec<Option<Arc<FdCtx>>>>,
    sched: OnceCell<Arc<Scheduler>>,
    weak_self: OnceCell<Weak<IoManager>>,
}

impl IoManager {
    /// Reactor with `threads` workers. See [`Scheduler::new`] for the
    /// `use_caller` slot. Worker threads are started immediately.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        Self::with_event_batch(threads, use_caller, name, DEFAULT_EVENT_BATCH)
    }

    pub fn with_event_batch(
        threads: usize,
        use_caller: bool,
        name: &str,
        event_batch: usize,
    ) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os());
        }
        let mut pipe = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = Error::last_os();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } != 0 {
            let err = Error::last_os();
            unsafe {
                libc::close(epfd);
                libc::close(pipe[0]);
                libc::close(pipe[1]);
            }
            return Err(err);
        }

        let iom = Arc::new(IoManager {
            epfd,
            tickle_r: pipe[0],
            tickle_w: pipe[1],
            event_batch: event_batch.max(1),
            timers: TimerWheel::new(),
            contexts: RwLock::new(Vec::new()),
            sched: OnceCell::new(),
            weak_self: OnceCell::new(),
        });
        iom.weak_self
            .set(Arc::downgrade(&iom))
            .ok()
            .expect("weak_self set twice");

        let sched = Scheduler::new(threads, use_caller, name)?;
        let iom_dyn: Arc<dyn Parker> = iom.clone();
        let parker: Weak<dyn Parker> = Arc::downgrade(&iom_dyn);
        sched.set_parker(parker);
        iom.sched.set(sched).ok().expect("scheduler set twice");
        iom.scheduler().start();
        Ok(iom)
    }

    fn arc(&self) -> Arc<IoManager> {
        self.weak_self
            .get()
            .and_then(Weak::upgrade)
            .expect("reactor already dropped")
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.sched.get().expect("scheduler not wired")
    }

    pub fn name(&self) -> &str {
        self.scheduler().name()
    }

    ////////////////////////////////////////////////////////////////////////
    // scheduling façade
    ////////////////////////////////////////////////////////////////////////

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler().schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<libc::pid_t>) {
        self.scheduler().schedule_fiber(fiber, thread);
    }

    /// Run the caller-inclusive worker slot; blocks until stop.
    pub fn run_root(&self) {
        self.scheduler().run_root();
    }

    /// Cooperative shutdown: flag, wake every worker, join.
    pub fn stop(&self) {
        self.scheduler().stop();
    }

    ////////////////////////////////////////////////////////////////////////
    // timers
    ////////////////////////////////////////////////////////////////////////

    /// Arm a timer on this reactor's wheel; wakes a parked worker when the
    /// new timer became the earliest deadline.
    pub fn add_timer<F>(&self, ms: u64, cb: F, period: u64) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (id, at_front) = self.timers.add_timer(ms, cb, period);
        if at_front {
            self.tickle();
        }
        id
    }

    /// Timer whose callback only runs while `cond` still upgrades.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, period: u64) -> u64
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let (id, at_front) = self.timers.add_condition_timer(ms, cb, cond, period);
        if at_front {
            self.tickle();
        }
        id
    }

    pub fn cancel_timer(&self, id: u64) -> bool {
        self.timers.cancel_timer(id)
    }

    ////////////////////////////////////////////////////////////////////////
    // event registration
    ////////////////////////////////////////////////////////////////////////

    /// Register interest in one direction on `fd`.
    ///
    /// With `cb` the callback is scheduled on trigger; without it the
    /// *calling fiber* is suspended-bound and rescheduled on trigger (the
    /// caller is expected to yield right after). Registering an
    /// already-armed direction is an error.
    pub fn add_event(
        &self,
        fd: RawFd,
        interest: Interest,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        assert!(
            interest == Interest::READ || interest == Interest::WRITE,
            "add_event takes exactly one direction"
        );
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.contains(interest) {
            log::warn!(
                "fd {} direction {:?} is already registered",
                fd,
                interest
            );
            return Err(Error::ReactorRegistration {
                fd,
                source: io::Error::from(io::ErrorKind::AlreadyExists),
            });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events.bits() | interest.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let source = io::Error::last_os_error();
            log::error!("epoll_ctl(add fd {} {:?}) failed: {}", fd, interest, source);
            return Err(Error::ReactorRegistration { fd, source });
        }

        let sched = scheduler::current().expect("add_event outside a scheduler thread");
        let waiter = match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let cur = fiber::current().expect("add_event without callback outside a fiber");
                debug_assert_eq!(cur.state(), fiber::State::Exec);
                Waiter::Fiber(cur)
            }
        };
        inner.events |= interest;
        let slot = if interest == Interest::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        debug_assert!(slot.is_none(), "armed direction had a stale event context");
        *slot = Some(EventCtx {
            sched: Arc::downgrade(&sched),
            waiter,
        });
        Ok(())
    }

    /// Drop interest in one direction without firing its waiter.
    pub fn del_event(&self, fd: RawFd, interest: Interest) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(interest) {
            return false;
        }
        if !self.mutate_epoll(fd, inner.events - interest) {
            return false;
        }
        inner.events -= interest;
        let slot = if interest == Interest::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        *slot = None;
        true
    }

    /// Drop interest in one direction and fire its waiter immediately.
    /// This is the cancellation path for timeouts and close.
    pub fn cancel_event(&self, fd: RawFd, interest: Interest) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(interest) {
            return false;
        }
        if !self.mutate_epoll(fd, inner.events - interest) {
            return false;
        }
        Self::trigger(&mut inner, interest);
        true
    }

    /// Fire every registered direction on `fd` and forget the descriptor.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc != 0 {
            log::error!(
                "epoll_ctl(del fd {}) failed: {}",
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        if inner.events.contains(Interest::READ) {
            Self::trigger(&mut inner, Interest::READ);
        }
        if inner.events.contains(Interest::WRITE) {
            Self::trigger(&mut inner, Interest::WRITE);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Whether the direction is currently armed. Test and diagnostics hook.
    pub fn has_event(&self, fd: RawFd, interest: Interest) -> bool {
        self.lookup(fd)
            .map(|ctx| ctx.inner.lock().unwrap().events.contains(interest))
            .unwrap_or(false)
    }

    ////////////////////////////////////////////////////////////////////////
    // internals
    ////////////////////////////////////////////////////////////////////////

    /// Apply the residual interest mask for `fd` to epoll.
    fn mutate_epoll(&self, fd: RawFd, left: Interest) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            log::error!(
                "epoll_ctl(fd {} -> {:?}) failed: {}",
                fd,
                left,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Clear one direction and schedule its waiter on the scheduler it was
    /// registered from. Idempotent per registration: the event context is
    /// consumed.
    fn trigger(inner: &mut FdInner, interest: Interest) {
        inner.events -= interest;
        let slot = if interest == Interest::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        let ec = match slot.take() {
            Some(ec) => ec,
            None => return,
        };
        let sched = match ec.sched.upgrade() {
            Some(s) => s,
            // scheduler is gone; the waiter has nowhere to run
            None => return,
        };
        match ec.waiter {
            Waiter::Fiber(f) => sched.schedule_fiber(f, None),
            Waiter::Call(cb) => sched.schedule(cb),
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        self.contexts
            .read()
            .unwrap()
            .get(fd as usize)
            .and_then(|slot| slot.clone())
    }

    fn context(&self, fd: RawFd) -> Arc<FdCtx> {
        assert!(fd >= 0, "invalid descriptor");
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let mut slots = self.contexts.write().unwrap();
        let idx = fd as usize;
        if idx >= slots.len() {
            let grown = (idx + 1).max(slots.len() * 3 / 2).max(64);
            slots.resize(grown, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx {
                fd,
                inner: Mutex::new(FdInner::default()),
            }));
        }
        slots[idx].clone().unwrap()
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_r,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One wheel spin: wait for readiness or the next deadline, drain
    /// expired timers, dispatch ready events.
    fn spin(&self, sched: &Arc<Scheduler>) {
        let timeout = self
            .timers
            .next_timeout_ms()
            .map_or(MAX_IDLE_TIMEOUT_MS, |t| t.min(MAX_IDLE_TIMEOUT_MS));

        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.event_batch];
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait failed: {}", err);
                break 0;
            }
            break rc as usize;
        };

        let expired = self.timers.collect_expired(clock::monotonic_ms());
        if !expired.is_empty() {
            let tasks = expired
                .into_iter()
                .map(|cb| Task::from_call(Box::new(move || cb()), None))
                .collect();
            sched.schedule_batch(tasks);
        }

        for ev in &events[..n] {
            let mask = ev.events;
            if ev.u64 == TICKLE_TOKEN {
                self.drain_tickle();
                continue;
            }
            let fd = ev.u64 as RawFd;
            let ctx = match self.lookup(fd) {
                Some(ctx) => ctx,
                None => continue,
            };
            let mut inner = ctx.inner.lock().unwrap();

            let mut effective = mask;
            if mask & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // error/hangup wakes whatever is registered
                effective |=
                    (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
            }
            let mut ready = Interest::empty();
            if effective & libc::EPOLLIN as u32 != 0 {
                ready |= Interest::READ;
            }
            if effective & libc::EPOLLOUT as u32 != 0 {
                ready |= Interest::WRITE;
            }
            ready &= inner.events;
            if ready.is_empty() {
                continue;
            }

            if !self.mutate_epoll(ctx.fd, inner.events - ready) {
                continue;
            }
            if ready.contains(Interest::READ) {
                Self::trigger(&mut inner, Interest::READ);
            }
            if ready.contains(Interest::WRITE) {
                Self::trigger(&mut inner, Interest::WRITE);
            }
        }
    }
}

impl Parker for IoManager {
    fn idle(&self, sched: &Arc<Scheduler>) {
        self.spin(sched);
    }

    fn tickle(&self) {
        if self.scheduler().idle_workers() == 0 {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_w, b"T".as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // a full pipe already guarantees a pending wake-up
            if err.raw_os_error() != Some(libc::EAGAIN) {
                log::error!("tickle write failed: {}", err);
            }
        }
    }

    fn pending(&self) -> bool {
        self.timers.has_pending()
    }

    fn register_thread(&self) {
        let weak = self.weak_self.get().cloned().expect("weak_self not wired");
        CURRENT_IO.with(|c| *c.borrow_mut() = Some(weak));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if let Some(sched) = self.sched.get() {
            // By now weak upgrades fail, so the scheduler cannot tickle
            // through the parker any more; poke the pipe directly so parked
            // workers notice the stop flag without waiting out a full nap.
            sched.stop_now(|| {
                let rc = unsafe {
                    libc::write(self.tickle_w, b"T".as_ptr() as *const libc::c_void, 1)
                };
                let _ = rc;
            });
        }
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.name())
            .field("epfd", &self.epfd)
            .finish()
    }
}

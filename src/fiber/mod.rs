//! Cooperative multitasking primitives.
//!
//! A [`Fiber`] is a stackful coroutine: it owns a guard-paged stack and a
//! saved machine context, and is switched in and out with
//! `swapcontext`. Fibers are cooperative — a running fiber keeps its worker
//! thread until it yields through [`yield_to_hold`] / [`yield_to_ready`] or
//! suspends inside the hook layer.
//!
//! A fiber has six states. `Init` (never run, or re-armed via
//! [`Fiber::reset`]), `Exec` (running right now on exactly one thread),
//! `Hold` (suspended, waiting for an external wake-up), `Ready` (suspended
//! but immediately runnable), `Term` (entry returned) and `Except` (entry
//! panicked). Exactly one fiber per thread is the *thread main* — the
//! implicit context a worker runs between fibers; it is never represented as
//! a `Fiber` object.
//!
//! See also [`scheduler`] for the M:N run queue and [`timer`] for the
//! deadline set both reactors spin on.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod scheduler;
pub mod timer;

pub use scheduler::Scheduler;
pub use timer::TimerWheel;

/// Default fiber stack size.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Innermost-last chain of fibers active on this thread. The top of the
    /// chain is the thread's current fiber; an empty chain means the thread
    /// main is running.
    static CHAIN: RefCell<Vec<Arc<Fiber>>> = RefCell::new(Vec::new());

    /// Context slot the outermost fiber switches back into. Boxed so the
    /// address stays stable for the lifetime of the thread.
    static BASE_CTX: Box<UnsafeCell<libc::ucontext_t>> =
        Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Hold = 1,
    Exec = 2,
    Ready = 3,
    Term = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Ready,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }

    /// Terminal states: the stack holds no live frames.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

/// Anonymous mmap with a leading `PROT_NONE` guard page. An overflowing
/// fiber faults instead of silently corrupting a neighbour allocation.
struct Stack {
    mapping: *mut u8,
    mmap_len: usize,
    page: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    fn new(size: usize) -> Result<Stack> {
        let page = page_size();
        // one guard page + the usable area rounded up to a page boundary
        let usable = (size + page - 1) & !(page - 1);
        let mmap_len = usable + page;

        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::last_os());
            }
            let stack = Stack {
                mapping: mapping as *mut u8,
                mmap_len,
                page,
            };
            if libc::mprotect(
                stack.mapping.add(page) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                // stack drops here and unmaps the reservation
                return Err(Error::last_os());
            }
            Ok(stack)
        }
    }

    /// Lowest usable address (just above the guard page).
    fn bottom(&self) -> *mut u8 {
        unsafe { self.mapping.add(self.page) }
    }

    fn usable_len(&self) -> usize {
        self.mmap_len - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.mapping as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(rc, 0);
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page.is_power_of_two());
    page
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A stackful cooperative coroutine.
///
/// Shared as `Arc<Fiber>` between the scheduler queue, the reactor's event
/// contexts and timer closures. The state machine guarantees at most one
/// thread executes (or mutates the context of) a fiber at any instant: a
/// fiber enters `Exec` only through [`Fiber::resume`], the scheduler never
/// picks an `Exec` fiber from its queue, and a suspended fiber is re-queued
/// exactly once per trigger.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    stack: Stack,
    ctx: UnsafeCell<libc::ucontext_t>,
    /// Context of whoever resumed us; valid while state is Exec.
    parent: Cell<*mut libc::ucontext_t>,
    /// State a yielding fiber asked for. Published by the resumer once the
    /// context switch has completed, so the fiber stays `Exec` (and thus
    /// unclaimable by other workers) until its stack is fully saved.
    pending_state: AtomicU8,
    entry: UnsafeCell<Option<Entry>>,
}

const NO_PENDING: u8 = u8::MAX;

// Safety: see the struct docs. `ctx`, `parent` and `entry` are only touched
// by the thread that currently owns the fiber per the state machine; handing
// a suspended fiber to another thread happens through mutex-guarded queues,
// which provide the necessary happens-before edges.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocate a fiber with the default stack, ready to run `f` on first
    /// resume.
    pub fn new<F>(f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(DEFAULT_STACK_SIZE, f)
    }

    pub fn with_stack_size<F>(size: usize, f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Init as u8),
            stack: Stack::new(size)?,
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            parent: Cell::new(ptr::null_mut()),
            pending_state: AtomicU8::new(NO_PENDING),
            entry: UnsafeCell::new(Some(Box::new(f))),
        });
        // getcontext must run against the context's final address, hence
        // after the Arc allocation.
        unsafe { fiber.init_context()? };
        Ok(fiber)
    }

    unsafe fn init_context(&self) -> Result<()> {
        let ctx = self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            return Err(Error::last_os());
        }
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = self.stack.bottom() as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = self.stack.usable_len();
        (*ctx).uc_stack.ss_flags = 0;
        libc::makecontext(ctx, fiber_main, 0);
        Ok(())
    }

    /// Re-arm a finished (or never started) fiber with a new entry, reusing
    /// its stack.
    ///
    /// # Panics
    ///
    /// Panics when called on a fiber whose stack may still hold live frames
    /// (any state other than `Init`, `Term` or `Except`).
    pub fn reset<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            state == State::Init || state.is_terminal(),
            "reset on a live fiber (state {:?})",
            state
        );
        unsafe {
            *self.entry.get() = Some(Box::new(f));
            self.init_context()?;
        }
        self.set_state(State::Init);
        Ok(())
    }

    /// Switch the calling thread onto the fiber's stack.
    ///
    /// Returns when the fiber yields or finishes; inspect
    /// [`Fiber::state`] afterwards to tell which. Must only be called when
    /// the fiber is `Init`, `Ready` or `Hold`.
    pub fn resume(this: &Arc<Fiber>) {
        let state = this.state();
        assert!(
            matches!(state, State::Init | State::Ready | State::Hold),
            "resume on fiber {} in state {:?}",
            this.id,
            state
        );

        let parent = current_ctx_ptr();
        this.parent.set(parent);
        this.set_state(State::Exec);
        CHAIN.with(|c| c.borrow_mut().push(this.clone()));

        let rc = unsafe { libc::swapcontext(parent, this.ctx.get()) };
        debug_assert_eq!(rc, 0, "swapcontext failed");

        CHAIN.with(|c| {
            c.borrow_mut().pop();
        });

        // The fiber either finished (the trampoline already stored Term or
        // Except) or yielded, leaving its requested state here. Publishing it
        // only now — after swapcontext saved the fiber's stack — keeps other
        // workers from resuming a half-suspended fiber.
        let pending = this.pending_state.swap(NO_PENDING, Ordering::SeqCst);
        if pending != NO_PENDING {
            this.set_state(State::from_u8(pending));
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Context slot of the thread's current fiber, or the thread-main slot when
/// no fiber is active.
fn current_ctx_ptr() -> *mut libc::ucontext_t {
    let fiber_ctx = CHAIN.with(|c| c.borrow().last().map(|f| f.ctx.get()));
    match fiber_ctx {
        Some(ctx) => ctx,
        None => BASE_CTX.with(|b| b.get()),
    }
}

/// Entry trampoline every fiber starts in. Runs the entry closure under
/// `catch_unwind`, records the outcome and switches back to the resumer.
extern "C" fn fiber_main() {
    let (ctx, parent) = {
        let cur = current().expect("fiber entry without a current fiber");
        let entry = unsafe { &mut *cur.entry.get() }.take();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            if let Some(f) = entry {
                f();
            }
        }));
        match outcome {
            Ok(()) => cur.set_state(State::Term),
            Err(payload) => {
                log::error!("fiber {} faulted: {}", cur.id, panic_message(&payload));
                cur.set_state(State::Except);
            }
        }
        (cur.ctx.get(), cur.parent.get())
        // `cur` (an Arc clone) drops here; the resume chain still owns the
        // fiber, so the stack we are standing on stays mapped across the
        // final switch.
    };
    unsafe { libc::swapcontext(ctx, parent) };
    unreachable!("terminated fiber was resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// The fiber currently executing on this thread, if any.
pub fn current() -> Option<Arc<Fiber>> {
    CHAIN.with(|c| c.borrow().last().cloned())
}

/// Id of the current fiber; 0 on the thread main.
pub fn current_id() -> u64 {
    CHAIN.with(|c| c.borrow().last().map_or(0, |f| f.id))
}

fn yield_with(state: State) {
    let (ctx, parent) = CHAIN.with(|c| {
        let chain = c.borrow();
        let cur = chain.last().expect("yield outside of a fiber");
        cur.pending_state.store(state as u8, Ordering::SeqCst);
        (cur.ctx.get(), cur.parent.get())
    });
    let rc = unsafe { libc::swapcontext(ctx, parent) };
    debug_assert_eq!(rc, 0, "swapcontext failed");
}

/// Suspend the current fiber until something re-queues it (reactor trigger,
/// timer, explicit schedule).
pub fn yield_to_hold() {
    yield_with(State::Hold);
}

/// Suspend the current fiber and mark it immediately runnable again; the
/// scheduler will re-queue it.
pub fn yield_to_ready() {
    yield_with(State::Ready);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_to_completion() {
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fiber.state(), State::Init);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_and_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            yield_to_hold();
            s.fetch_add(1, Ordering::SeqCst);
            yield_to_ready();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Ready);
        assert_eq!(steps.load(Ordering::SeqCst), 2);

        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn current_tracks_the_innermost_fiber() {
        assert!(current().is_none());
        assert_eq!(current_id(), 0);
        let fiber = Fiber::new(|| {
            let me = current().expect("running fiber is current");
            assert_eq!(me.state(), State::Exec);
            assert_eq!(current_id(), me.id());
        })
        .unwrap();
        Fiber::resume(&fiber);
        assert!(current().is_none());
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panic_marks_except_and_is_contained() {
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hit = Arc::new(AtomicUsize::new(0));
        let fiber = Fiber::new(|| {}).unwrap();
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);

        let h = hit.clone();
        fiber
            .reset(move || {
                h.fetch_add(7, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(fiber.state(), State::Init);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hit.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn nested_resume_keeps_chain_order() {
        let inner = Fiber::new(|| {
            assert_ne!(current_id(), 0);
            yield_to_hold();
        })
        .unwrap();
        let inner2 = inner.clone();
        let outer = Fiber::new(move || {
            let my_id = current_id();
            Fiber::resume(&inner2);
            // control came back to the outer fiber
            assert_eq!(current_id(), my_id);
        })
        .unwrap();
        Fiber::resume(&outer);
        assert_eq!(outer.state(), State::Term);
        assert_eq!(inner.state(), State::Hold);
        // finish the inner fiber so its stack can be reclaimed
        Fiber::resume(&inner);
        assert_eq!(inner.state(), State::Term);
    }

    #[test]
    fn ids_are_unique_and_monotone() {
        let a = Fiber::new(|| {}).unwrap();
        let b = Fiber::new(|| {}).unwrap();
        assert!(b.id() > a.id());
        Fiber::resume(&a);
        Fiber::resume(&b);
    }
}

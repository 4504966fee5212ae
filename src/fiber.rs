//! Cooperative multitasking primitive.
//!
//! A fiber is a stackful coroutine with explicit entry, yield and resume.
//! Fibers are cheap to create (one stack allocation) and are switched with
//! `swapcontext`, so a switch never enters the kernel scheduler.
//!
//! Every thread that touches fibers owns a *main fiber*: a stackless
//! [`Fiber`] standing for the thread's native execution, created lazily by
//! [`Fiber::current`]. A fiber constructed with `caller_owned = true`
//! resumes from and yields back to that main fiber; a fiber constructed
//! with `caller_owned = false` belongs to a [scheduler](crate::scheduler)
//! worker and swaps against the worker's dispatch fiber instead. The flag
//! is fixed at construction; mixing the two paths would either skip the
//! dispatch loop or re-enter the main fiber, so it is not possible.
//!
//! Example:
//! ```
//! use fiberio::fiber::Fiber;
//!
//! let fiber = Fiber::new(|| println!("I'm a fiber"), 0, true);
//! fiber.resume();
//! println!("fiber done");
//! ```

use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::config;
use crate::scheduler::Scheduler;

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Yielded with a reschedule request; eligible for the dispatch loop.
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Yielded without a reschedule request; resumed explicitly later.
    Hold = 3,
    /// Callback returned.
    Term = 4,
    /// Callback panicked.
    Except = 5,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", raw),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Stack buffer for one fiber, 16-byte aligned, freed with the fiber.
struct FiberStack {
    base: *mut u8,
    size: usize,
}

impl FiberStack {
    fn alloc(size: usize) -> FiberStack {
        let layout = Layout::from_size_align(size, 16).expect("fiber stack layout");
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null(), "fiber stack allocation of {} bytes failed", size);
        FiberStack { base, size }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, 16).expect("fiber stack layout");
        unsafe { dealloc(self.base, layout) };
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// A stackful coroutine.
///
/// Handles are shared (`Arc<Fiber>`): the creator, the scheduler's task
/// list and an I/O event context may all hold one. The state machine
/// guarantees a fiber is `Exec` on at most one thread, which is what makes
/// the interior mutability below sound.
pub struct Fiber {
    id: u64,
    caller_owned: bool,
    state: AtomicU8,
    stack: Option<FiberStack>,
    ctx: UnsafeCell<libc::ucontext_t>,
    cb: UnsafeCell<Option<Callback>>,
    self_weak: Weak<Fiber>,
}

// Safety: `ctx` and `cb` are only touched by the thread that currently
// resumes or runs the fiber, and resumes are serialized by the single-Exec
// invariant (the dispatch loop skips Exec fibers, and a suspended fiber is
// resumed by exactly one waker).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a new fiber running `cb` on its own stack.
    ///
    /// `stack_size == 0` selects [`config::fiber_stack_size`]. The fiber
    /// starts in [`State::Init`] and runs only when resumed.
    ///
    /// `caller_owned` fixes the resume target: `true` swaps against the
    /// thread main fiber (direct use from application code), `false`
    /// against the current worker's dispatch fiber (fibers submitted to a
    /// scheduler).
    pub fn new<F>(cb: F, stack_size: usize, caller_owned: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_boxed(Box::new(cb), stack_size, caller_owned)
    }

    pub(crate) fn new_boxed(cb: Callback, stack_size: usize, caller_owned: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            config::fiber_stack_size()
        } else {
            stack_size
        };
        let fiber = Arc::new_cyclic(|weak: &Weak<Fiber>| Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            caller_owned,
            state: AtomicU8::new(State::Init as u8),
            stack: Some(FiberStack::alloc(stack_size)),
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            cb: UnsafeCell::new(Some(cb)),
            self_weak: weak.clone(),
        });
        unsafe { fiber.make_context() };
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!("fiber {} created", fiber.id);
        fiber
    }

    /// The main fiber of the calling thread.
    fn main(self_weak: Weak<Fiber>) -> Fiber {
        let fiber = Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            caller_owned: false,
            state: AtomicU8::new(State::Exec as u8),
            stack: None,
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            cb: UnsafeCell::new(None),
            self_weak,
        };
        let rc = unsafe { libc::getcontext(fiber.ctx.get()) };
        assert_eq!(rc, 0, "getcontext");
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber
    }

    /// Prepare `ctx` to enter [`fiber_entry`] on this fiber's stack.
    unsafe fn make_context(&self) {
        let stack = self
            .stack
            .as_ref()
            .expect("make_context on a stackless fiber");
        let ctx = self.ctx.get();
        let rc = libc::getcontext(ctx);
        assert_eq!(rc, 0, "getcontext");
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.base as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.size;
        libc::makecontext(ctx, fiber_entry, 0);
    }

    /// The fiber currently executing on this thread; lazily creates the
    /// thread main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        CURRENT.with(|cell| {
            let mut current = cell.borrow_mut();
            if let Some(fiber) = &*current {
                return fiber.clone();
            }
            let main = Arc::new_cyclic(|weak: &Weak<Fiber>| Fiber::main(weak.clone()));
            *current = Some(main.clone());
            THREAD_MAIN.with(|main_cell| *main_cell.borrow_mut() = Some(main.clone()));
            main
        })
    }

    /// Id of the currently executing fiber, or 0 when the thread has not
    /// touched fibers yet.
    pub fn fiber_id() -> u64 {
        CURRENT.with(|cell| cell.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Number of live fibers in the process (main fibers included).
    pub fn total() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_caller_owned(&self) -> bool {
        self.caller_owned
    }

    /// Rebind the callback and rewind to [`State::Init`], reusing the
    /// stack. Valid only in `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(cb));
    }

    pub(crate) fn reset_boxed(&self, cb: Callback) {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "reset of fiber {} in state {:?}",
            self.id,
            state,
        );
        assert!(self.stack.is_some(), "reset of a main fiber");
        unsafe {
            *self.cb.get() = Some(cb);
            self.make_context();
        }
        self.set_state(State::Init);
    }

    /// Switch execution from the resume target to this fiber.
    ///
    /// Scheduler-owned fibers swap against the worker's dispatch fiber and
    /// must not be `Exec` already; caller-owned fibers swap against the
    /// thread main fiber and may be re-entered after a bare
    /// [`yield_to_hold`](Fiber::yield_to_hold) (their state still reads
    /// `Exec` then, there is no dispatch loop to flip it to `Hold`).
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            !matches!(state, State::Term | State::Except),
            "resume of finished fiber {} ({:?})",
            self.id,
            state,
        );
        let from = if self.caller_owned {
            thread_main_fiber()
        } else {
            assert_ne!(state, State::Exec, "resume of running fiber {}", self.id);
            Scheduler::main_fiber().expect("scheduler resume outside a worker thread")
        };
        let this = self
            .self_weak
            .upgrade()
            .expect("resume of a fiber with no live handle");
        set_current(this);
        self.set_state(State::Exec);
        unsafe { swap(&from, self) };
    }

    /// Swap back to this fiber's resume target.
    fn swap_out(&self) {
        let target = if self.caller_owned {
            thread_main_fiber()
        } else {
            Scheduler::main_fiber().expect("scheduler yield outside a worker thread")
        };
        set_current(target.clone());
        unsafe { swap(self, &target) };
    }

    /// Yield the current fiber and mark it `Ready` so the scheduler picks
    /// it up again.
    pub fn yield_to_ready() {
        let current = Fiber::current();
        assert_eq!(current.state(), State::Exec);
        current.set_state(State::Ready);
        current.swap_out();
    }

    /// Yield the current fiber without requesting a reschedule. Somebody
    /// else (an I/O event, a timer, an explicit resume) brings it back.
    pub fn yield_to_hold() {
        let current = Fiber::current();
        assert_eq!(current.state(), State::Exec);
        current.swap_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            debug_assert!(
                matches!(state, State::Init | State::Term | State::Except),
                "fiber {} dropped in state {:?}",
                self.id,
                state,
            );
        }
        log::debug!("fiber {} dropped, {} left", self.id, Fiber::total());
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("caller_owned", &self.caller_owned)
            .finish()
    }
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// Main fiber of the calling thread, materialized on demand.
fn thread_main_fiber() -> Arc<Fiber> {
    Fiber::current();
    THREAD_MAIN.with(|cell| cell.borrow().clone()).expect("thread main fiber missing")
}

/// Save the current machine context into `from`, switch to `to`.
unsafe fn swap(from: &Fiber, to: &Fiber) {
    let rc = libc::swapcontext(from.ctx.get(), to.ctx.get());
    assert_eq!(rc, 0, "swapcontext");
}

/// Entry point of every stackful fiber.
///
/// Runs the callback under `catch_unwind`, records the terminal state and
/// swaps back to the resume target. Control never returns past that swap.
extern "C" fn fiber_entry() {
    let current = Fiber::current();
    let cb = unsafe { (*current.cb.get()).take() }.expect("fiber entered without a callback");
    match catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => current.set_state(State::Term),
        Err(payload) => {
            current.set_state(State::Except);
            log::error!(
                "fiber {} panicked: {}\nbacktrace:\n{}",
                current.id,
                panic_message(&payload),
                Backtrace::force_capture(),
            );
        }
    }
    // Release our handle before leaving the stack; the resumer still holds
    // one, so the fiber outlives the swap.
    let raw: *const Fiber = Arc::as_ptr(&current);
    drop(current);
    unsafe { (*raw).swap_out() };
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

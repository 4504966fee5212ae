//! N:M cooperative scheduler.
//!
//! A [`Scheduler`] multiplexes fibers and plain callbacks onto a fixed
//! pool of worker threads. The ready queue is strictly FIFO; a task may
//! carry a target worker index, everything else is picked up by whichever
//! worker gets there first. There is no work stealing, no preemption and
//! no fairness beyond FIFO order.
//!
//! With `use_caller` the constructing thread becomes worker 0: its
//! dispatch loop lives in a dedicated *root fiber* that runs when
//! [`Scheduler::stop`] is called, which is also where the caller thread
//! drains outstanding work before the pool is joined.
//!
//! Example:
//! ```no_run
//! use fiberio::scheduler::Scheduler;
//!
//! let sched = Scheduler::new(2, false, "demo");
//! sched.start();
//! sched.schedule(|| println!("on a worker"));
//! sched.stop();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use crate::fiber::{Fiber, State};
use crate::hook;

type Callback = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// A unit of work for the dispatch loop: a fiber to resume or a callback
/// to run inside a reusable worker-local fiber.
pub struct Task(pub(crate) TaskPayload);

pub(crate) enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

impl Task {
    pub fn call<F: FnOnce() + Send + 'static>(f: F) -> Task {
        Task(TaskPayload::Call(Box::new(f)))
    }

    pub(crate) fn call_boxed(f: Callback) -> Task {
        Task(TaskPayload::Call(f))
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task(TaskPayload::Fiber(fiber))
    }
}

struct ReadyTask {
    payload: TaskPayload,
    /// Target worker index; `None` lets any worker take it.
    worker: Option<usize>,
}

/// Extension seam for the worker loop, overridden by the I/O manager.
///
/// `tickle` wakes an idle worker, `run_idle` is the body of the per-worker
/// idle fiber, `stopping` widens the shutdown predicate and
/// `register_worker` runs once per worker thread at dispatch-loop entry.
pub(crate) trait Reactor: Send + Sync {
    fn tickle(&self);
    fn run_idle(&self);
    fn stopping(&self) -> bool;
    fn register_worker(&self) {}
}

pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<ReadyTask>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Number of threads spawned by `start` (excludes the caller thread).
    spawned_count: usize,
    /// Worker index of the caller thread, `Some(0)` iff `use_caller`.
    root_worker: Option<usize>,
    root_fiber: Option<Arc<Fiber>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Set between `stop` and worker exit (also set before `start`).
    stop_flag: AtomicBool,
    auto_stop: AtomicBool,
    reactor: RwLock<Weak<dyn Reactor>>,
    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers total.
    ///
    /// With `use_caller` the constructing thread counts as worker 0 and
    /// `threads - 1` threads are spawned by [`start`](Scheduler::start);
    /// otherwise all `threads` workers are spawned and the constructing
    /// thread stays outside the pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            Scheduler::build(threads, use_caller, name, weak.clone(), weak.clone())
        });
        Scheduler::bind_caller(&sched);
        sched
    }

    /// Like [`new`](Scheduler::new) but dispatching through an external
    /// reactor (the I/O manager).
    pub(crate) fn with_reactor(
        threads: usize,
        use_caller: bool,
        name: &str,
        reactor: Weak<dyn Reactor>,
    ) -> Arc<Scheduler> {
        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            Scheduler::build(threads, use_caller, name, weak.clone(), reactor)
        });
        Scheduler::bind_caller(&sched);
        sched
    }

    fn build(
        threads: usize,
        use_caller: bool,
        name: &str,
        weak_self: Weak<Scheduler>,
        reactor: Weak<dyn Reactor>,
    ) -> Scheduler {
        assert!(threads >= 1, "scheduler needs at least one worker");
        let (spawned_count, root_worker, root_fiber) = if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already belongs to a scheduler"
            );
            Fiber::current();
            let weak = weak_self.clone();
            let root_fiber = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        let reactor = sched.reactor().expect("reactor gone before root fiber ran");
                        sched.run(0, reactor);
                    }
                },
                0,
                true,
            );
            (threads - 1, Some(0), Some(root_fiber))
        } else {
            (threads, None, None)
        };
        Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            spawned_count,
            root_worker,
            root_fiber,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            reactor: RwLock::new(reactor),
            self_weak: weak_self,
        }
    }

    /// Publish the caller-thread state a `use_caller` scheduler needs.
    fn bind_caller(sched: &Arc<Scheduler>) {
        if sched.root_worker.is_none() {
            return;
        }
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = Some(sched.clone()));
        DISPATCH_FIBER.with(|cell| *cell.borrow_mut() = sched.root_fiber.clone());
        WORKER_ID.with(|cell| cell.set(sched.root_worker));
    }

    /// The scheduler the calling thread dispatches for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
    }

    /// The dispatch fiber of the calling worker thread.
    ///
    /// Scheduler-owned fibers swap against this fiber when they are
    /// resumed or yield.
    pub fn main_fiber() -> Option<Arc<Fiber>> {
        DISPATCH_FIBER.with(|cell| cell.borrow().clone())
    }

    /// Index of the calling worker within its scheduler, if any.
    pub fn worker_id() -> Option<usize> {
        WORKER_ID.with(|cell| cell.get())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.spawned_count + self.root_worker.map_or(0, |_| 1)
    }

    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    pub fn idle_thread_count(&self) -> usize {
        self.idle_threads.load(Ordering::SeqCst)
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_thread_count() > 0
    }

    fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.reactor.read().unwrap().upgrade()
    }

    /// Spawn the worker pool. No-op if already started.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if !self.stop_flag.swap(false, Ordering::SeqCst) {
            return;
        }
        assert!(threads.is_empty(), "scheduler restarted with live workers");
        let this = self
            .self_weak
            .upgrade()
            .expect("scheduler started without a live handle");
        let reactor = self.reactor().expect("scheduler started without a reactor");
        let offset = if self.root_worker.is_some() { 1 } else { 0 };
        for i in 0..self.spawned_count {
            let worker = i + offset;
            let sched = this.clone();
            let reactor = reactor.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, worker))
                .spawn(move || sched.run(worker, reactor))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Append one task; wakes a worker when the queue was empty.
    pub fn submit(&self, task: Task, worker: Option<usize>) {
        let need_tickle = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(ReadyTask {
                payload: task.0,
                worker,
            });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.submit(Task::call(f), None);
    }

    pub fn schedule_fiber(&self, fiber: &Arc<Fiber>) {
        self.submit(Task::fiber(fiber.clone()), None);
    }

    /// Insert a batch atomically with respect to the tickle check.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| ReadyTask {
                payload: task.0,
                worker: None,
            }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Move the current fiber onto the given worker and yield until the
    /// dispatch loop over there picks it up.
    pub fn switch_to(&self, worker: Option<usize>) {
        if Scheduler::current().map_or(false, |s| std::ptr::eq(&*s, self))
            && (worker.is_none() || worker == Scheduler::worker_id())
        {
            return;
        }
        self.submit(Task::fiber(Fiber::current()), worker);
        Fiber::yield_to_hold();
    }

    fn tickle(&self) {
        match self.reactor() {
            Some(reactor) => reactor.tickle(),
            None => log::debug!("{} tickle", self.name),
        }
    }

    /// Shutdown predicate of the bare scheduler: stop requested, queue
    /// drained, nobody running a task.
    pub(crate) fn base_stopping(&self) -> bool {
        let queue = self.tasks.lock().unwrap();
        self.auto_stop.load(Ordering::SeqCst)
            && self.stop_flag.load(Ordering::SeqCst)
            && queue.is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    fn reactor_stopping(&self) -> bool {
        match self.reactor() {
            Some(reactor) => reactor.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Request shutdown, drain outstanding work and join the pool.
    ///
    /// For a `use_caller` scheduler this must run on the constructing
    /// thread: the caller's dispatch loop (the root fiber) runs here until
    /// the scheduler reports stopping. Idempotent.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root_fiber) = &self.root_fiber {
            if self.spawned_count == 0
                && matches!(root_fiber.state(), State::Term | State::Init)
            {
                log::info!("{} stopped", self.name);
                self.stop_flag.store(true, Ordering::SeqCst);
                if self.reactor_stopping() {
                    self.unbind_caller();
                    return;
                }
            }
        }

        if self.root_worker.is_some() {
            assert!(
                Scheduler::current().map_or(false, |s| std::ptr::eq(&*s, self)),
                "stop() of a use_caller scheduler must run on the caller thread"
            );
        } else {
            assert!(
                Scheduler::current().map_or(true, |s| !std::ptr::eq(&*s, self)),
                "stop() must not run on a worker thread"
            );
        }

        self.stop_flag.store(true, Ordering::SeqCst);
        for _ in 0..self.spawned_count {
            self.tickle();
        }
        if self.root_fiber.is_some() {
            self.tickle();
        }
        if let Some(root_fiber) = &self.root_fiber {
            if !self.reactor_stopping() {
                root_fiber.resume();
            }
        }

        let handles = mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }

        self.unbind_caller();
    }

    /// Undo [`bind_caller`](Scheduler::bind_caller) once the caller
    /// thread is done dispatching.
    fn unbind_caller(&self) {
        if self.root_worker.is_none() {
            return;
        }
        let bound_here = CURRENT_SCHEDULER
            .with(|cell| cell.borrow().as_ref().map_or(false, |s| std::ptr::eq(&**s, self)));
        if !bound_here {
            return;
        }
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = None);
        DISPATCH_FIBER.with(|cell| *cell.borrow_mut() = None);
        WORKER_ID.with(|cell| cell.set(None));
    }

    /// Per-worker dispatch loop.
    fn run(self: Arc<Scheduler>, worker: usize, reactor: Arc<dyn Reactor>) {
        log::debug!("{} worker {} run", self.name, worker);
        hook::set_enabled(true);
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = Some(self.clone()));
        WORKER_ID.with(|cell| cell.set(Some(worker)));
        reactor.register_worker();
        if Some(worker) != self.root_worker {
            // A spawned worker dispatches from its thread main fiber.
            DISPATCH_FIBER.with(|cell| *cell.borrow_mut() = Some(Fiber::current()));
        }

        let idle_reactor = reactor.clone();
        let idle_fiber = Fiber::new(move || idle_reactor.run_idle(), 0, false);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut taken: Option<ReadyTask> = None;
            {
                let mut queue = self.tasks.lock().unwrap();
                let mut index = 0;
                while index < queue.len() {
                    let entry = &queue[index];
                    if entry.worker.map_or(false, |w| w != worker) {
                        // Someone else's task; make sure they hear about it.
                        tickle_me = true;
                        index += 1;
                        continue;
                    }
                    if let TaskPayload::Fiber(fiber) = &entry.payload {
                        if fiber.state() == State::Exec {
                            index += 1;
                            continue;
                        }
                    }
                    taken = queue.remove(index);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= taken.is_some() && index < queue.len();
            }
            if tickle_me {
                reactor.tickle();
            }

            match taken {
                Some(ReadyTask {
                    payload: TaskPayload::Fiber(fiber),
                    ..
                }) => {
                    if !matches!(fiber.state(), State::Term | State::Except) {
                        fiber.resume();
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        match fiber.state() {
                            State::Ready => self.schedule_fiber(&fiber),
                            State::Term | State::Except => {}
                            _ => fiber.set_state(State::Hold),
                        }
                    } else {
                        // Finished while queued; nothing left to run.
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(ReadyTask {
                    payload: TaskPayload::Call(cb),
                    ..
                }) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(cb);
                            fiber
                        }
                        None => Fiber::new_boxed(cb, 0, false),
                    };
                    fiber.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(&fiber),
                        // Keep the fiber around for the next callback.
                        State::Term | State::Except => cb_fiber = Some(fiber),
                        // Held by whoever parked it (event context, timer).
                        _ => fiber.set_state(State::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!("{} worker {} idle fiber term", self.name, worker);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }

        if Some(worker) != self.root_worker {
            CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = None);
            DISPATCH_FIBER.with(|cell| *cell.borrow_mut() = None);
            WORKER_ID.with(|cell| cell.set(None));
        }
    }
}

impl Reactor for Scheduler {
    fn tickle(&self) {
        log::debug!("{} tickle", self.name);
    }

    fn run_idle(&self) {
        log::debug!("{} idle", self.name);
        while !self.base_stopping() {
            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        self.base_stopping()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.stop_flag.load(Ordering::SeqCst),
            "scheduler {} dropped while running",
            self.name
        );
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[Scheduler name={} workers={} active={} idle={} stopping={}]",
            self.name,
            self.worker_count(),
            self.active_thread_count(),
            self.idle_thread_count(),
            self.stop_flag.load(Ordering::SeqCst),
        )
    }
}

//! Epoll-driven I/O manager.
//!
//! [`IoManager`] extends the [scheduler](crate::scheduler) with an epoll
//! instance and a [timer queue](crate::timer): each worker's idle fiber
//! blocks in `epoll_wait`, bounded by the next timer deadline, and
//! resumes the fibers (or schedules the callbacks) parked on descriptor
//! readiness or timer expiry. A pipe registered with the epoll instance
//! serves as the wake signal (`tickle`) for task submission and
//! front-of-queue timer inserts.
//!
//! Registration is edge-triggered only. Every descriptor has at most one
//! pending read and one pending write interest; registering the same
//! event twice is a programming error.
//!
//! Example:
//! ```no_run
//! use fiberio::io::IoManager;
//! use fiberio::timer::TimerManager;
//!
//! let iom = IoManager::new(2, false, "io");
//! iom.add_timer(100, || println!("tick"), false);
//! iom.schedule(|| println!("on a worker"));
//! iom.stop();
//! ```

use std::cell::RefCell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{Error, Result};
use crate::fiber::{Fiber, State};
use crate::scheduler::{Reactor, Scheduler, Task};
use crate::timer::{TimerManager, TimerNotify, TimerQueue};

const EP_IN: u32 = libc::EPOLLIN as u32;
const EP_OUT: u32 = libc::EPOLLOUT as u32;
const EP_ERR: u32 = libc::EPOLLERR as u32;
const EP_HUP: u32 = libc::EPOLLHUP as u32;
const EP_ET: u32 = libc::EPOLLET as u32;

/// Epoll payload marking the wake pipe; fd contexts carry their address,
/// which is never null.
const WAKE_TOKEN: u64 = 0;

const MAX_EVENTS: usize = 256;
/// Upper bound on one `epoll_wait`, so workers re-check `stopping`.
const MAX_TIMEOUT_MS: u64 = 3000;

bitflags! {
    /// Event interest, numerically identical to `EPOLLIN`/`EPOLLOUT`.
    pub struct Event: u32 {
        const READ = EP_IN;
        const WRITE = EP_OUT;
    }
}

type Callback = Box<dyn FnOnce() + Send>;

enum HandlerTask {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

/// Dispatch target of one (fd, event) registration: the scheduler chosen
/// at registration time plus either a fiber to resume or a callback.
struct EventHandler {
    scheduler: Weak<Scheduler>,
    task: Option<HandlerTask>,
}

impl EventHandler {
    fn empty() -> EventHandler {
        EventHandler {
            scheduler: Weak::new(),
            task: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.task.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.task = None;
    }
}

struct FdEvents {
    registered: Event,
    read: EventHandler,
    write: EventHandler,
}

impl FdEvents {
    fn new() -> FdEvents {
        FdEvents {
            registered: Event::empty(),
            read: EventHandler::empty(),
            write: EventHandler::empty(),
        }
    }

    fn handler_mut(&mut self, event: Event) -> &mut EventHandler {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => unreachable!("handler_mut for {:?}", event),
        }
    }

    /// Hand the registered task of `event` to its scheduler and clear the
    /// registration.
    fn trigger(&mut self, fd: RawFd, event: Event) {
        assert!(
            self.registered.contains(event),
            "trigger of unregistered event {:?} on fd {}",
            event,
            fd,
        );
        self.registered.remove(event);
        let handler = self.handler_mut(event);
        let scheduler = handler.scheduler.upgrade();
        let task = handler.task.take();
        handler.reset();
        match (scheduler, task) {
            (Some(scheduler), Some(HandlerTask::Fiber(fiber))) => {
                scheduler.submit(Task::fiber(fiber), None)
            }
            (Some(scheduler), Some(HandlerTask::Call(cb))) => {
                scheduler.submit(Task::call_boxed(cb), None)
            }
            _ => log::error!("event {:?} on fd {} lost its dispatcher", event, fd),
        }
    }
}

/// Per-descriptor event bookkeeping. The manager's context table owns
/// these for its whole lifetime, so the raw address handed to epoll stays
/// valid until the manager is dropped.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

impl FdContext {
    /// Lock the event state. An assert may unwind out of a locked region
    /// before mutating anything, so a poisoned lock still guards
    /// consistent state.
    fn lock(&self) -> std::sync::MutexGuard<FdEvents> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

thread_local! {
    static CURRENT_IOM: RefCell<Weak<IoManager>> = RefCell::new(Weak::new());
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerQueue>,
    epfd: RawFd,
    /// `[read end, write end]`; one byte per wake, drained by the idle loop.
    wake_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    self_weak: Weak<IoManager>,
}

impl IoManager {
    /// Create the manager and start its worker pool. See
    /// [`Scheduler::new`] for the `threads`/`use_caller` semantics.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let sched =
                Scheduler::with_reactor(threads, use_caller, name, weak.clone() as Weak<dyn Reactor>);

            let epfd = unsafe { libc::epoll_create(5000) };
            assert!(epfd >= 0, "epoll_create: {}", io::Error::last_os_error());

            let mut wake_fds = [-1; 2];
            let rc = unsafe { libc::pipe(wake_fds.as_mut_ptr()) };
            assert_eq!(rc, 0, "pipe: {}", io::Error::last_os_error());
            unsafe {
                let rc = libc::fcntl(wake_fds[0], libc::F_SETFL, libc::O_NONBLOCK);
                assert_eq!(rc, 0, "wake pipe O_NONBLOCK: {}", io::Error::last_os_error());
                let mut event = libc::epoll_event {
                    events: EP_IN | EP_ET,
                    u64: WAKE_TOKEN,
                };
                let rc = libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fds[0], &mut event);
                assert_eq!(rc, 0, "wake pipe epoll_ctl: {}", io::Error::last_os_error());
            }

            IoManager {
                sched,
                timers: TimerQueue::new(),
                epfd,
                wake_fds,
                pending_events: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
                self_weak: weak.clone(),
            }
        });
        iom.timers
            .set_notify(Arc::downgrade(&iom) as Weak<dyn TimerNotify>);
        iom.grow_contexts(32);
        if use_caller {
            CURRENT_IOM.with(|cell| *cell.borrow_mut() = Arc::downgrade(&iom));
        }
        iom.sched.start();
        iom
    }

    /// The manager whose worker the calling thread is (or whose caller
    /// thread it is, for `use_caller` managers).
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|cell| cell.borrow().upgrade())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Number of (fd, event) registrations currently armed in epoll.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Request shutdown and join the workers. The call blocks until all
    /// pending events and timers are gone; see [`Scheduler::stop`].
    pub fn stop(&self) {
        self.sched.stop();
    }

    fn grow_contexts(&self, size: usize) {
        let mut contexts = self.contexts.write().unwrap();
        while contexts.len() < size {
            let fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext {
                fd,
                inner: Mutex::new(FdEvents::new()),
            }));
        }
    }

    /// Context for `fd`, growing the table by half steps on demand.
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "event registration for negative fd");
        let index = fd as usize;
        {
            let contexts = self.contexts.read().unwrap();
            if index < contexts.len() {
                return contexts[index].clone();
            }
        }
        self.grow_contexts((index * 3 / 2).max(index + 1));
        self.contexts.read().unwrap()[index].clone()
    }

    fn try_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.contexts.read().unwrap();
        contexts.get(fd as usize).cloned()
    }

    /// Register interest in `event` on `fd`.
    ///
    /// Without a callback the current fiber is parked: it must
    /// yield-to-hold right after and is rescheduled when the event fires.
    /// Registering an event that is already registered is a programming
    /// error and panics; an `epoll_ctl` failure is reported as
    /// [`Error::EventRegistration`].
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event wants exactly one of READ/WRITE, got {:?}",
            event,
        );
        let context = self.context(fd);
        let mut inner = context.lock();
        assert!(
            !inner.registered.contains(event),
            "event {:?} already registered for fd {} (registered {:?})",
            event,
            fd,
            inner.registered,
        );

        let op = if inner.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epoll_event = libc::epoll_event {
            events: EP_ET | inner.registered.bits() | event.bits(),
            u64: Arc::as_ptr(&context) as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epoll_event) };
        if rc != 0 {
            log::error!(
                "epoll_ctl({}, {}, {}) failed: {}",
                self.epfd,
                op_name(op),
                fd,
                io::Error::last_os_error(),
            );
            return Err(Error::epoll(fd, op_name(op)));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.registered.insert(event);
        let handler = inner.handler_mut(event);
        assert!(handler.is_empty(), "stale handler for {:?} on fd {}", event, fd);
        let scheduler = Scheduler::current().unwrap_or_else(|| self.sched.clone());
        handler.scheduler = Arc::downgrade(&scheduler);
        match cb {
            Some(cb) => handler.task = Some(HandlerTask::Call(cb)),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    State::Exec,
                    "fiber event registration from a non-running fiber",
                );
                handler.task = Some(HandlerTask::Fiber(fiber));
            }
        }
        Ok(())
    }

    /// Drop the registration of `event` on `fd` without waking anyone.
    /// Returns false when the event was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let context = match self.try_context(fd) {
            Some(context) => context,
            None => return false,
        };
        let mut inner = context.lock();
        if !inner.registered.contains(event) {
            return false;
        }

        let remaining = inner.registered - event;
        if !self.update_epoll(fd, remaining) {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.registered = remaining;
        inner.handler_mut(event).reset();
        true
    }

    /// Like [`del_event`](IoManager::del_event), but fires the
    /// registration on its way out: the parked fiber or callback is
    /// scheduled immediately.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let context = match self.try_context(fd) {
            Some(context) => context,
            None => return false,
        };
        let mut inner = context.lock();
        if !inner.registered.contains(event) {
            return false;
        }

        let remaining = inner.registered - event;
        if !self.update_epoll(fd, remaining) {
            return false;
        }
        inner.trigger(fd, event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel both directions on `fd`, firing whatever was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let context = match self.try_context(fd) {
            Some(context) => context,
            None => return false,
        };
        let mut inner = context.lock();
        if inner.registered.is_empty() {
            return false;
        }

        if !self.update_epoll(fd, Event::empty()) {
            return false;
        }
        if inner.registered.contains(Event::READ) {
            inner.trigger(fd, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.registered.contains(Event::WRITE) {
            inner.trigger(fd, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(inner.registered.is_empty());
        true
    }

    /// MOD or DEL `fd` down to `remaining`; logs and returns false on
    /// failure.
    fn update_epoll(&self, fd: RawFd, remaining: Event) -> bool {
        let context = self.try_context(fd).expect("update_epoll without a context");
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epoll_event = libc::epoll_event {
            events: EP_ET | remaining.bits(),
            u64: Arc::as_ptr(&context) as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epoll_event) };
        if rc != 0 {
            log::error!(
                "epoll_ctl({}, {}, {}) failed: {}",
                self.epfd,
                op_name(op),
                fd,
                io::Error::last_os_error(),
            );
            return false;
        }
        true
    }

    /// One idle-loop sweep over the readiness `events` returned by
    /// `epoll_wait`.
    fn dispatch_ready(&self, events: &[libc::epoll_event]) {
        for event in events {
            let mut bits = event.events;
            let token = event.u64;
            if token == WAKE_TOKEN {
                // Drain the wake pipe so the next tickle byte shows up as
                // a fresh edge.
                let mut buf = [0u8; 256];
                loop {
                    let n = unsafe {
                        libc::read(
                            self.wake_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                }
                continue;
            }

            let context = unsafe { &*(token as usize as *const FdContext) };
            let mut inner = context.lock();

            if bits & (EP_ERR | EP_HUP) != 0 {
                // Error or peer close: wake whichever direction waits.
                bits |= (EP_IN | EP_OUT) & inner.registered.bits();
            }
            let mut ready = Event::empty();
            if bits & EP_IN != 0 {
                ready |= Event::READ;
            }
            if bits & EP_OUT != 0 {
                ready |= Event::WRITE;
            }
            ready &= inner.registered;
            if ready.is_empty() {
                continue;
            }

            let remaining = inner.registered - ready;
            self.update_epoll(context.fd, remaining);
            if ready.contains(Event::READ) {
                inner.trigger(context.fd, Event::READ);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if ready.contains(Event::WRITE) {
                inner.trigger(context.fd, Event::WRITE);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn stopping_with(&self, next_timeout: Option<u64>) -> bool {
        next_timeout.is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl TimerManager for IoManager {
    fn timer_queue(&self) -> &Arc<TimerQueue> {
        &self.timers
    }
}

impl TimerNotify for IoManager {
    fn on_timer_inserted_at_front(&self) {
        Reactor::tickle(self);
    }
}

impl Reactor for IoManager {
    /// Wake one epoll-waiting worker with a byte through the pipe.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.wake_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rc, 1, "wake pipe write: {}", io::Error::last_os_error());
    }

    /// Per-worker idle fiber: wait for readiness or timers, dispatch, and
    /// give the loop back to the worker.
    fn run_idle(&self) {
        log::debug!("{} idle", self.sched.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let next_timeout = self.timers.next_timeout();
            if self.stopping_with(next_timeout) {
                log::info!("{} idle stopping exit", self.sched.name());
                break;
            }

            let timeout_ms = next_timeout
                .map(|ms| ms.min(MAX_TIMEOUT_MS))
                .unwrap_or(MAX_TIMEOUT_MS) as libc::c_int;
            let ready = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout_ms,
                    )
                };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log::error!("epoll_wait({}) failed: {}", self.epfd, err);
                }
                break rc.max(0) as usize;
            };

            // Timer expiries are dispatched before fd readiness.
            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                self.sched
                    .schedule_batch(expired.into_iter().map(|cb| Task::call(move || cb())));
            }

            self.dispatch_ready(&events[..ready]);

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        let next_timeout = self.timers.next_timeout();
        self.stopping_with(next_timeout)
    }

    fn register_worker(&self) {
        CURRENT_IOM.with(|cell| *cell.borrow_mut() = self.self_weak.clone());
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fds[0]);
            libc::close(self.wake_fds[1]);
        }
    }
}

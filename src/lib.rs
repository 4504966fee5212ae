//! Stackful coroutine runtime for Linux with a fiber-aware syscall layer.
//!
//! The crate provides:
//!
//! - [Fibers](fiber): stackful coroutines with explicit resume/yield
//! - [Scheduler](scheduler): an N:M cooperative dispatcher over a fixed
//!   thread pool
//! - [Timers](timer): an ordered timer set with condition timers and
//!   clock-rollover defense
//! - [I/O manager](io): an epoll reactor that resumes fibers on
//!   descriptor readiness or timer expiry
//! - [Fd registry](fd): process-wide per-descriptor state (socket
//!   detection, forced non-blocking mode, per-fd timeouts)
//! - [Hooked syscalls](hook): `read`/`write`/`connect`/`accept`/`sleep`
//!   and friends with libc signatures that yield the calling fiber
//!   instead of blocking the thread
//!
//! The pieces compose bottom-up: a hooked syscall consults the fd
//! registry, registers interest with the I/O manager when the raw call
//! would block, optionally arms a timeout timer, and parks the fiber.
//! Workers run the scheduler's dispatch loop; when there is nothing to
//! run they sit in `epoll_wait` inside the idle fiber.
//!
//! ```no_run
//! use fiberio::hook;
//! use fiberio::io::IoManager;
//!
//! let iom = IoManager::new(2, false, "rt");
//! iom.schedule(|| {
//!     // Hooked on worker threads: parks the fiber, not the thread.
//!     hook::sleep(1);
//! });
//! iom.stop();
//! ```
//!
//! Linux only: the event backend is epoll and the context engine is
//! `ucontext`.

#[macro_use]
extern crate bitflags;

pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod log;
pub mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::{Timer, TimerManager};

//! Fiber-aware replacements for blocking libc calls.
//!
//! Every function here keeps the signature and the return/`errno`
//! conventions of its libc counterpart, but turns a would-block condition
//! into a fiber yield: the calling fiber parks on the descriptor through
//! the [I/O manager](crate::io) and is resumed on readiness, timer expiry
//! or cancellation. The sleep family parks on a timer instead of blocking
//! the worker thread.
//!
//! Interception is gated per thread ([`set_enabled`]); scheduler workers
//! enable it at dispatch-loop entry, everything else sees plain libc
//! behavior. The original entry points are resolved once through
//! `dlsym(RTLD_NEXT, ...)` so the raw calls go past any interposer.
//!
//! Timeouts configured with `setsockopt(SO_RCVTIMEO/SO_SNDTIMEO)` are
//! captured into the [fd registry](crate::fd) and honored here — the
//! kernel itself never sees them (a non-blocking socket never waits in
//! the kernel). A descriptor the user switched to non-blocking mode
//! explicitly is passed through untouched.

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config;
use crate::fd;
use crate::fiber::Fiber;
use crate::io::{Event, IoManager};
use crate::scheduler::Task;
use crate::timer::TimerManager;

// Not exposed by the `libc` crate on this target; values match glibc's
// bits/fcntl-linux.h.
const F_SETSIG: libc::c_int = 10;
const F_GETSIG: libc::c_int = 11;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked calls on this thread are fiber-aware.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

/// Flip the per-thread hook gate. Workers call this with `true` when they
/// enter the dispatch loop.
pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|cell| cell.set(enabled));
}

/// Resolve `name` past this module with `dlsym(RTLD_NEXT)`.
///
/// Safety: `T` must be the correct fn-pointer type for the symbol.
unsafe fn resolve_next<T: Copy>(name: &'static str) -> T {
    assert_eq!(
        mem::size_of::<T>(),
        mem::size_of::<*mut libc::c_void>(),
        "resolve_next target must be a fn pointer",
    );
    let symbol = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char);
    assert!(
        !symbol.is_null(),
        "dlsym(RTLD_NEXT, {:?}) returned NULL",
        &name[..name.len() - 1],
    );
    mem::transmute_copy(&symbol)
}

macro_rules! hooked_symbols {
    ($($name:ident: $ty:ty,)*) => {
        /// The original libc entry points.
        struct RawApi {
            $($name: $ty,)*
        }

        impl RawApi {
            fn resolve() -> RawApi {
                RawApi {
                    $($name: unsafe { resolve_next(concat!(stringify!($name), "\0")) },)*
                }
            }
        }
    };
}

hooked_symbols! {
    sleep: unsafe extern "C" fn(libc::c_uint) -> libc::c_uint,
    usleep: unsafe extern "C" fn(libc::useconds_t) -> libc::c_int,
    nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> libc::c_int,
    socket: unsafe extern "C" fn(libc::c_int, libc::c_int, libc::c_int) -> libc::c_int,
    connect: unsafe extern "C" fn(libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::c_int,
    accept: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    read: unsafe extern "C" fn(libc::c_int, *mut libc::c_void, libc::size_t) -> libc::ssize_t,
    readv: unsafe extern "C" fn(libc::c_int, *const libc::iovec, libc::c_int) -> libc::ssize_t,
    recv: unsafe extern "C" fn(libc::c_int, *mut libc::c_void, libc::size_t, libc::c_int) -> libc::ssize_t,
    recvfrom: unsafe extern "C" fn(libc::c_int, *mut libc::c_void, libc::size_t, libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::ssize_t,
    recvmsg: unsafe extern "C" fn(libc::c_int, *mut libc::msghdr, libc::c_int) -> libc::ssize_t,
    write: unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t) -> libc::ssize_t,
    writev: unsafe extern "C" fn(libc::c_int, *const libc::iovec, libc::c_int) -> libc::ssize_t,
    send: unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t, libc::c_int) -> libc::ssize_t,
    sendto: unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t, libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::ssize_t,
    sendmsg: unsafe extern "C" fn(libc::c_int, *const libc::msghdr, libc::c_int) -> libc::ssize_t,
    close: unsafe extern "C" fn(libc::c_int) -> libc::c_int,
    fcntl: unsafe extern "C" fn(libc::c_int, libc::c_int, ...) -> libc::c_int,
    ioctl: unsafe extern "C" fn(libc::c_int, libc::c_ulong, ...) -> libc::c_int,
    getsockopt: unsafe extern "C" fn(libc::c_int, libc::c_int, libc::c_int, *mut libc::c_void, *mut libc::socklen_t) -> libc::c_int,
    setsockopt: unsafe extern "C" fn(libc::c_int, libc::c_int, libc::c_int, *const libc::c_void, libc::socklen_t) -> libc::c_int,
}

static RAW: Lazy<RawApi> = Lazy::new(RawApi::resolve);

fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(code: libc::c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// Cancellation flag shared between a waiting fiber and its timeout
/// timer. Whoever CASes first wins; `ETIMEDOUT` marks a fired timer.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The generic would-block driver behind every hooked I/O call.
///
/// Retries `raw` over `EINTR`; on `EAGAIN` arms the per-direction fd
/// timeout (if any), registers `event` interest with the current fiber
/// and yields. On resume either the timeout fired (`errno = ETIMEDOUT`)
/// or the descriptor became ready and the raw call is retried.
fn do_io<F>(
    fd: libc::c_int,
    fun_name: &str,
    event: Event,
    timeout_kind: libc::c_int,
    mut raw: F,
) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return raw();
    }
    let state = match fd::registry().get(fd, false) {
        Some(state) => state,
        None => return raw(),
    };
    if state.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !state.is_socket() || state.user_nonblock() {
        return raw();
    }

    let timeout_ms = state.timeout(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let iom = match IoManager::current() {
            Some(iom) => iom,
            // Not on an I/O manager thread; hand the EAGAIN back.
            None => return n,
        };

        let timer = timeout_ms.map(|ms| {
            let winfo = Arc::downgrade(&tinfo);
            let wiom = Arc::downgrade(&iom);
            iom.add_condition_timer(
                ms,
                move || {
                    let tinfo = match winfo.upgrade() {
                        Some(tinfo) => tinfo,
                        None => return,
                    };
                    if tinfo
                        .cancelled
                        .compare_exchange(0, libc::ETIMEDOUT, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        return;
                    }
                    if let Some(iom) = wiom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&tinfo),
                false,
            )
        });

        match iom.add_event(fd, event, None) {
            Err(err) => {
                log::error!("{} add_event({}, {:?}): {}", fun_name, fd, event, err);
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_to_hold();
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Woken by readiness; retry the syscall.
            }
        }
    }
}

/// Park the current fiber on a timer for `ms`. False when there is no
/// I/O manager to park on (the caller falls back to the raw call).
fn sleep_ms(ms: u64) -> bool {
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return false,
    };
    let fiber = Fiber::current();
    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || sched.submit(Task::fiber(fiber.clone()), None),
        false,
    );
    Fiber::yield_to_hold();
    true
}

pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if is_enabled() && sleep_ms(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { (RAW.sleep)(seconds) }
}

pub fn usleep(usec: libc::useconds_t) -> libc::c_int {
    if is_enabled() && sleep_ms(usec as u64 / 1000) {
        return 0;
    }
    unsafe { (RAW.usleep)(usec) }
}

/// Millisecond resolution; `rem` is never populated (no signal
/// interruption in this model).
///
/// # Safety
/// `req` and `rem` follow the `nanosleep(2)` contract.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> libc::c_int {
    if is_enabled() && !req.is_null() {
        let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
        if sleep_ms(ms) {
            return 0;
        }
    }
    (RAW.nanosleep)(req, rem)
}

/// `socket(2)`; the new descriptor is registered (and forced
/// non-blocking) right away.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> libc::c_int {
    if !is_enabled() {
        return unsafe { (RAW.socket)(domain, ty, protocol) };
    }
    let fd = unsafe { (RAW.socket)(domain, ty, protocol) };
    if fd == -1 {
        return fd;
    }
    fd::registry().get(fd, true);
    fd
}

/// `connect(2)` with an explicit timeout (`None` waits forever).
///
/// # Safety
/// `addr`/`addrlen` follow the `connect(2)` contract.
pub unsafe fn connect_with_timeout(
    fd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: Option<u64>,
) -> libc::c_int {
    if !is_enabled() {
        return (RAW.connect)(fd, addr, addrlen);
    }
    let state = match fd::registry().get(fd, false) {
        Some(state) => state,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if state.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !state.is_socket() || state.user_nonblock() {
        return (RAW.connect)(fd, addr, addrlen);
    }

    let n = (RAW.connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: wait for writability, then read the outcome from
    // SO_ERROR.
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return n,
    };
    let tinfo = Arc::new(TimerInfo::default());
    let timer = timeout_ms.map(|ms| {
        let winfo = Arc::downgrade(&tinfo);
        let wiom = Arc::downgrade(&iom);
        iom.add_condition_timer(
            ms,
            move || {
                let tinfo = match winfo.upgrade() {
                    Some(tinfo) => tinfo,
                    None => return,
                };
                if tinfo
                    .cancelled
                    .compare_exchange(0, libc::ETIMEDOUT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return;
                }
                if let Some(iom) = wiom.upgrade() {
                    iom.cancel_event(fd, Event::WRITE);
                }
            },
            Arc::downgrade(&tinfo),
            false,
        )
    });

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect add_event({}, WRITE): {}", fd, err);
        }
    }

    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    if (RAW.getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// `connect(2)` bounded by the `tcp.connect.timeout` setting.
///
/// # Safety
/// `addr`/`addrlen` follow the `connect(2)` contract.
pub unsafe fn connect(
    fd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    connect_with_timeout(fd, addr, addrlen, config::tcp_connect_timeout())
}

/// `accept(2)`; the accepted descriptor is registered right away.
///
/// # Safety
/// `addr`/`addrlen` follow the `accept(2)` contract.
pub unsafe fn accept(
    sockfd: libc::c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::c_int {
    let fd = do_io(sockfd, "accept", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.accept)(sockfd, addr, addrlen) as libc::ssize_t
    }) as libc::c_int;
    if fd >= 0 {
        fd::registry().get(fd, true);
    }
    fd
}

/// # Safety
/// `buf`/`count` follow the `read(2)` contract.
pub unsafe fn read(fd: libc::c_int, buf: *mut libc::c_void, count: libc::size_t) -> libc::ssize_t {
    do_io(fd, "read", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.read)(fd, buf, count)
    })
}

/// # Safety
/// `iov`/`iovcnt` follow the `readv(2)` contract.
pub unsafe fn readv(fd: libc::c_int, iov: *const libc::iovec, iovcnt: libc::c_int) -> libc::ssize_t {
    do_io(fd, "readv", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.readv)(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf`/`len` follow the `recv(2)` contract.
pub unsafe fn recv(
    sockfd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(sockfd, "recv", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.recv)(sockfd, buf, len, flags)
    })
}

/// # Safety
/// Pointer arguments follow the `recvfrom(2)` contract.
pub unsafe fn recvfrom(
    sockfd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    do_io(sockfd, "recvfrom", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.recvfrom)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` follows the `recvmsg(2)` contract.
pub unsafe fn recvmsg(
    sockfd: libc::c_int,
    msg: *mut libc::msghdr,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(sockfd, "recvmsg", Event::READ, libc::SO_RCVTIMEO, || {
        (RAW.recvmsg)(sockfd, msg, flags)
    })
}

/// # Safety
/// `buf`/`count` follow the `write(2)` contract.
pub unsafe fn write(
    fd: libc::c_int,
    buf: *const libc::c_void,
    count: libc::size_t,
) -> libc::ssize_t {
    do_io(fd, "write", Event::WRITE, libc::SO_SNDTIMEO, || {
        (RAW.write)(fd, buf, count)
    })
}

/// # Safety
/// `iov`/`iovcnt` follow the `writev(2)` contract.
pub unsafe fn writev(
    fd: libc::c_int,
    iov: *const libc::iovec,
    iovcnt: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "writev", Event::WRITE, libc::SO_SNDTIMEO, || {
        (RAW.writev)(fd, iov, iovcnt)
    })
}

/// # Safety
/// `msg`/`len` follow the `send(2)` contract.
pub unsafe fn send(
    fd: libc::c_int,
    msg: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "send", Event::WRITE, libc::SO_SNDTIMEO, || {
        (RAW.send)(fd, msg, len, flags)
    })
}

/// # Safety
/// Pointer arguments follow the `sendto(2)` contract.
pub unsafe fn sendto(
    fd: libc::c_int,
    msg: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    to: *const libc::sockaddr,
    tolen: libc::socklen_t,
) -> libc::ssize_t {
    do_io(fd, "sendto", Event::WRITE, libc::SO_SNDTIMEO, || {
        (RAW.sendto)(fd, msg, len, flags, to, tolen)
    })
}

/// # Safety
/// `msg` follows the `sendmsg(2)` contract.
pub unsafe fn sendmsg(
    fd: libc::c_int,
    msg: *const libc::msghdr,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, libc::SO_SNDTIMEO, || {
        (RAW.sendmsg)(fd, msg, flags)
    })
}

/// `close(2)`; cancels any parked waiters and forgets the registry entry
/// before the descriptor goes away.
pub fn close(fd: libc::c_int) -> libc::c_int {
    if !is_enabled() {
        return unsafe { (RAW.close)(fd) };
    }
    if let Some(state) = fd::registry().get(fd, false) {
        state.set_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd::registry().del(fd);
    }
    unsafe { (RAW.close)(fd) }
}

/// `fcntl(2)` with the variadic argument flattened into `arg`.
///
/// `F_SETFL` records the user's `O_NONBLOCK` intent but keeps the kernel
/// flag the runtime forced; `F_GETFL` reports the user's view, not the
/// kernel's.
///
/// # Safety
/// For lock commands `arg` must be a valid `*mut libc::flock`.
pub unsafe fn fcntl(fd: libc::c_int, cmd: libc::c_int, arg: usize) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as libc::c_int;
            let state = match fd::registry().get(fd, false) {
                Some(state) => state,
                None => return (RAW.fcntl)(fd, cmd, flags),
            };
            if state.is_closed() || !state.is_socket() {
                return (RAW.fcntl)(fd, cmd, flags);
            }
            state.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if state.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            (RAW.fcntl)(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = (RAW.fcntl)(fd, cmd);
            let state = match fd::registry().get(fd, false) {
                Some(state) => state,
                None => return flags,
            };
            if state.is_closed() || !state.is_socket() {
                return flags;
            }
            if state.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => (RAW.fcntl)(fd, cmd, arg as libc::c_int),
        libc::F_GETFD
        | libc::F_GETOWN
        | F_GETSIG
        | libc::F_GETLEASE
        | libc::F_GETPIPE_SZ => (RAW.fcntl)(fd, cmd),
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => {
            (RAW.fcntl)(fd, cmd, arg as *mut libc::flock)
        }
        _ => (RAW.fcntl)(fd, cmd),
    }
}

/// `ioctl(2)`; `FIONBIO` is tracked like the `O_NONBLOCK` branch of
/// [`fcntl`].
///
/// # Safety
/// `arg` follows the `ioctl(2)` contract for `request`.
pub unsafe fn ioctl(fd: libc::c_int, request: libc::c_ulong, arg: *mut libc::c_void) -> libc::c_int {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = !arg.is_null() && *(arg as *mut libc::c_int) != 0;
        if let Some(state) = fd::registry().get(fd, false) {
            if !state.is_closed() && state.is_socket() {
                state.set_user_nonblock(user_nonblock);
            }
        }
    }
    (RAW.ioctl)(fd, request, arg)
}

/// Plain delegation to the raw symbol.
///
/// # Safety
/// Pointer arguments follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    sockfd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    (RAW.getsockopt)(sockfd, level, optname, optval, optlen)
}

/// Delegates to the raw symbol; `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured
/// into the fd registry (whole milliseconds) when the hook is enabled.
///
/// # Safety
/// Pointer arguments follow the `setsockopt(2)` contract.
pub unsafe fn setsockopt(
    sockfd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= mem::size_of::<libc::timeval>()
    {
        if let Some(state) = fd::registry().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            state.set_timeout(optname, tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000);
        }
    }
    (RAW.setsockopt)(sockfd, level, optname, optval, optlen)
}

//! Process-wide per-descriptor state.
//!
//! The [`FdRegistry`] is the single source of truth the
//! [hook layer](crate::hook) consults before touching a descriptor: is it
//! a socket, has the user asked for non-blocking mode themselves, which
//! send/recv timeouts apply. Sockets are forced into kernel non-blocking
//! mode the moment they are registered — the hook layer depends on
//! `EAGAIN` to turn would-block conditions into fiber yields — while the
//! user-visible flags keep reporting whatever the application configured.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// State of one descriptor. Created lazily on first touch (or eagerly by
/// the hooked `socket`/`accept`), dropped on `close`.
pub struct FdState {
    fd: RawFd,
    /// False when the `fstat` probe failed.
    initialized: bool,
    is_socket: bool,
    /// Non-blocking forced by the runtime.
    sys_nonblock: AtomicBool,
    /// Non-blocking requested by the user via `fcntl`/`ioctl`.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdState {
    fn probe(fd: RawFd) -> FdState {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        let (initialized, is_socket) = if rc == -1 {
            log::error!("fstat({}) failed: {}", fd, io::Error::last_os_error());
            (false, false)
        } else {
            let stat = unsafe { stat.assume_init() };
            (true, stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags == -1 {
                log::error!("fcntl({}, F_GETFL) failed: {}", fd, io::Error::last_os_error());
            } else if flags & libc::O_NONBLOCK == 0 {
                let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                if rc == -1 {
                    log::error!("fcntl({}, F_SETFL) failed: {}", fd, io::Error::last_os_error());
                } else {
                    sys_nonblock = true;
                }
            }
        }

        FdState {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::SeqCst);
    }

    /// Store a timeout keyed the way `setsockopt` names them.
    pub fn set_timeout(&self, kind: libc::c_int, ms: i64) {
        match kind {
            libc::SO_RCVTIMEO => self.recv_timeout_ms.store(ms, Ordering::SeqCst),
            libc::SO_SNDTIMEO => self.send_timeout_ms.store(ms, Ordering::SeqCst),
            _ => {}
        }
    }

    /// Timeout for the given direction, `None` when unset.
    pub fn timeout(&self, kind: libc::c_int) -> Option<u64> {
        let ms = match kind {
            libc::SO_RCVTIMEO => self.recv_timeout_ms.load(Ordering::SeqCst),
            libc::SO_SNDTIMEO => self.send_timeout_ms.load(Ordering::SeqCst),
            _ => return None,
        };
        if ms < 0 {
            None
        } else {
            Some(ms as u64)
        }
    }
}

/// Registry of [`FdState`]s indexed by descriptor, growing geometrically.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdState>>>>,
}

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up the state of `fd`, probing and registering it first when
    /// `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdState>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if index < slots.len() {
                if let Some(state) = &slots[index] {
                    return Some(state.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if index >= slots.len() {
            let target = (index * 3 / 2).max(slots.len() * 2).max(index + 1);
            slots.resize(target, None);
        }
        if let Some(state) = &slots[index] {
            return Some(state.clone());
        }
        let state = Arc::new(FdState::probe(fd));
        slots[index] = Some(state.clone());
        Some(state)
    }

    /// Forget `fd`. The next `get(fd, true)` probes from scratch.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

static REGISTRY: Lazy<FdRegistry> = Lazy::new(FdRegistry::new);

/// The process-wide registry.
pub fn registry() -> &'static FdRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fd_without_create_is_none() {
        let reg = FdRegistry::new();
        assert!(reg.get(10_000, false).is_none());
        assert!(reg.get(-1, true).is_none());
    }

    #[test]
    fn socket_is_probed_and_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let reg = FdRegistry::new();
        let state = reg.get(fd, true).unwrap();
        assert!(state.is_initialized());
        assert!(state.is_socket());
        assert!(state.sys_nonblock());
        assert!(!state.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        reg.del(fd);
        assert!(reg.get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn regular_file_is_not_a_socket() {
        // stdin may be anything, so probe an fd we control.
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        assert!(fd >= 0);
        let reg = FdRegistry::new();
        let state = reg.get(fd, true).unwrap();
        assert!(state.is_initialized());
        assert!(!state.is_socket());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn timeouts_default_to_unset() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let reg = FdRegistry::new();
        let state = reg.get(fd, true).unwrap();
        assert_eq!(state.timeout(libc::SO_RCVTIMEO), None);
        assert_eq!(state.timeout(libc::SO_SNDTIMEO), None);
        state.set_timeout(libc::SO_RCVTIMEO, 250);
        assert_eq!(state.timeout(libc::SO_RCVTIMEO), Some(250));
        assert_eq!(state.timeout(libc::SO_SNDTIMEO), None);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn registry_grows_past_initial_capacity() {
        let reg = FdRegistry::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let target = 300;
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD, target) };
        assert!(dup >= target);
        assert!(reg.get(dup, true).is_some());
        assert!(reg.get(dup, false).is_some());
        unsafe {
            libc::close(dup);
            libc::close(fd);
        }
    }
}

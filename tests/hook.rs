use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use fiberio::config;
use fiberio::fd;
use fiberio::hook;
use fiberio::io::IoManager;

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(std::net::Ipv4Addr::LOCALHOST).to_be(),
    };
    addr
}

/// Bind-and-listen a raw loopback listener, returning (fd, port).
fn raw_listener(backlog: libc::c_int) -> (RawFd, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket: {}", io::Error::last_os_error());
        let addr = loopback_addr(0);
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind: {}", io::Error::last_os_error());
        let rc = libc::listen(fd, backlog);
        assert_eq!(rc, 0, "listen: {}", io::Error::last_os_error());

        let mut bound: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        assert_eq!(rc, 0, "getsockname: {}", io::Error::last_os_error());
        (fd, u16::from_be(bound.sin_port))
    }
}

#[test]
fn sleep_parks_the_fiber_not_the_worker() {
    let iom = IoManager::new(1, false, "h_sleep");
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let order_a = order.clone();
    let tx_a = tx.clone();
    let started = Instant::now();
    iom.schedule(move || {
        hook::usleep(100_000);
        order_a.lock().unwrap().push('a');
        tx_a.send(started.elapsed()).unwrap();
    });
    let order_b = order.clone();
    iom.schedule(move || {
        order_b.lock().unwrap().push('b');
        tx.send(Duration::from_millis(0)).unwrap();
    });

    let mut elapsed = Duration::from_millis(0);
    for _ in 0..2 {
        elapsed = elapsed.max(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }
    // The sleeper yielded its worker: b ran first, a came back later.
    assert_eq!(*order.lock().unwrap(), vec!['b', 'a']);
    assert!(elapsed >= Duration::from_millis(100), "woke early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "woke late: {:?}", elapsed);
    iom.stop();
}

#[test]
fn connect_times_out_on_a_full_backlog() {
    let iom = IoManager::new(1, false, "h_connect");
    let (listener, port) = raw_listener(1);

    // Saturate the accept queue so further handshakes are left pending.
    let mut fillers = Vec::new();
    unsafe {
        for _ in 0..4 {
            let fd = libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
            );
            assert!(fd >= 0);
            let addr = loopback_addr(port);
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            fillers.push(fd);
        }
    }
    std::thread::sleep(Duration::from_millis(100));

    config::set_tcp_connect_timeout(300);
    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let addr = loopback_addr(port);
        let started = Instant::now();
        let rc = unsafe {
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let err = errno();
        tx.send((rc, err, started.elapsed())).unwrap();
        hook::close(fd);
    });

    let (rc, err, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(rc, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(300), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "returned late: {:?}", elapsed);

    iom.stop();
    unsafe {
        for fd in fillers {
            libc::close(fd);
        }
        libc::close(listener);
    }
}

#[test]
fn accept_wakes_up_on_an_incoming_connection() {
    let iom = IoManager::new(1, false, "h_accept");
    let (tx, rx) = mpsc::channel();

    let (tx_accept, tx_connect) = (tx.clone(), tx);
    let (listener_tx, listener_rx) = mpsc::channel();

    iom.schedule(move || {
        let listener = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(listener >= 0);
        unsafe {
            let addr = loopback_addr(0);
            let rc = libc::bind(
                listener,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            assert_eq!(rc, 0);
            assert_eq!(libc::listen(listener, 16), 0);
            let mut bound: libc::sockaddr_in = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            assert_eq!(
                libc::getsockname(
                    listener,
                    &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut len,
                ),
                0
            );
            listener_tx.send(u16::from_be(bound.sin_port)).unwrap();

            // Parks on READ until the peer below connects.
            let accepted = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
            assert!(accepted >= 0, "accept: {}", io::Error::last_os_error());
            let state = fd::registry().get(accepted, false).expect("accepted fd registered");
            assert!(state.is_socket());
            tx_accept.send(("accept", accepted)).unwrap();
            hook::close(accepted);
            hook::close(listener);
        }
    });

    iom.schedule(move || {
        let port = listener_rx.recv().unwrap();
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let addr = loopback_addr(port);
        let rc = unsafe {
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "connect: {}", io::Error::last_os_error());
        tx_connect.send(("connect", fd)).unwrap();
        hook::close(fd);
    });

    let mut tags = Vec::new();
    for _ in 0..2 {
        tags.push(rx.recv_timeout(Duration::from_secs(10)).unwrap().0);
    }
    tags.sort_unstable();
    assert_eq!(tags, vec!["accept", "connect"]);
    iom.stop();
}

#[test]
fn read_honors_the_recv_timeout() {
    let iom = IoManager::new(1, false, "h_recv_to");
    let (tx, rx) = mpsc::channel();

    iom.schedule(move || unsafe {
        let mut fds = [-1; 2];
        assert_eq!(
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
            0
        );
        let (a, b) = (fds[0], fds[1]);
        fd::registry().get(a, true);

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 150_000,
        };
        let rc = hook::setsockopt(
            a,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        assert_eq!(rc, 0);

        let mut buf = [0u8; 16];
        let started = Instant::now();
        let n = hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        let err = errno();
        tx.send((n, err, started.elapsed())).unwrap();
        libc::close(a);
        libc::close(b);
    });

    let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(150), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "returned late: {:?}", elapsed);
    iom.stop();
}

#[test]
fn read_wakes_up_when_the_peer_writes() {
    let iom = IoManager::new(1, false, "h_echo");
    let (tx, rx) = mpsc::channel();

    let mut fds = [-1; 2];
    unsafe {
        assert_eq!(
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
            0
        );
    }
    let (a, b) = (fds[0], fds[1]);
    fd::registry().get(a, true);
    fd::registry().get(b, true);

    iom.schedule(move || unsafe {
        let mut buf = [0u8; 16];
        // No data yet: parks until the writer fiber runs.
        let n = hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        assert_eq!(n, 4, "read: {}", io::Error::last_os_error());
        tx.send(buf[..4].to_vec()).unwrap();
    });
    iom.schedule(move || unsafe {
        hook::usleep(50_000);
        let n = hook::write(b, b"ping".as_ptr() as *const libc::c_void, 4);
        assert_eq!(n, 4, "write: {}", io::Error::last_os_error());
    });

    let got = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(got, b"ping");
    iom.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn fcntl_reports_the_user_view_of_nonblock() {
    let iom = IoManager::new(1, false, "h_fcntl");
    let (tx, rx) = mpsc::channel();

    iom.schedule(move || unsafe {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        assert!(fd >= 0);

        // The kernel flag is forced, the user never asked for it.
        let kernel_flags = libc::fcntl(fd, libc::F_GETFL, 0);
        let user_flags = hook::fcntl(fd, libc::F_GETFL, 0);
        let forced = kernel_flags & libc::O_NONBLOCK != 0;
        let user_sees = user_flags & libc::O_NONBLOCK != 0;

        // After the user opts in, their view changes and the hook becomes
        // transparent for this fd.
        let rc = hook::fcntl(fd, libc::F_SETFL, (user_flags | libc::O_NONBLOCK) as usize);
        assert_eq!(rc, 0);
        let user_sees_after = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;
        let state = fd::registry().get(fd, false).unwrap();
        tx.send((forced, user_sees, user_sees_after, state.user_nonblock()))
            .unwrap();
        hook::close(fd);
    });

    let (forced, user_sees, user_sees_after, user_nonblock) =
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(forced, "kernel flag must be forced on");
    assert!(!user_sees, "user view must hide the forced flag");
    assert!(user_sees_after);
    assert!(user_nonblock);
    iom.stop();
}

#[test]
fn close_forgets_the_descriptor() {
    let iom = IoManager::new(1, false, "h_close");
    let (tx, rx) = mpsc::channel();

    iom.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        assert!(fd >= 0);
        assert!(fd::registry().get(fd, false).is_some());
        assert_eq!(hook::close(fd), 0);
        tx.send(fd::registry().get(fd, false).is_none()).unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    iom.stop();
}

#[test]
fn hook_is_disabled_off_the_workers() {
    assert!(!hook::is_enabled());
    // Raw passthrough: a plain sleep-like call must not need a runtime.
    let started = Instant::now();
    assert_eq!(hook::usleep(10_000), 0);
    assert!(started.elapsed() >= Duration::from_millis(10));
}

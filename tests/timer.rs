use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use fiberio::io::IoManager;
use fiberio::timer::TimerManager;

#[test]
fn zero_delay_timer_fires_without_io_activity() {
    let iom = IoManager::new(1, false, "t_zero");
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    iom.add_timer(
        0,
        move || {
            tx.send(()).unwrap();
        },
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    iom.stop();
}

#[test]
fn timer_fires_close_to_its_deadline() {
    let iom = IoManager::new(1, false, "t_deadline");
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    iom.add_timer(
        150,
        move || {
            tx.send(()).unwrap();
        },
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "fired late: {:?}", elapsed);
    iom.stop();
}

#[test]
fn cancelled_timer_never_fires() {
    let iom = IoManager::new(1, false, "t_cancel");
    let fired = Arc::new(AtomicUsize::new(0));
    let target = fired.clone();
    let timer = iom.add_timer(
        500,
        move || {
            target.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    thread::sleep(Duration::from_millis(100));
    assert!(timer.cancel());
    thread::sleep(Duration::from_millis(1000));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn recurring_timer_fires_repeatedly_until_cancel() {
    let iom = IoManager::new(1, false, "t_recurring");
    let count = Arc::new(AtomicUsize::new(0));
    let target = count.clone();
    let timer = iom.add_timer(
        50,
        move || {
            target.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );
    thread::sleep(Duration::from_millis(525));
    assert!(timer.cancel());
    let at_cancel = count.load(Ordering::SeqCst);
    assert!(
        (6..=12).contains(&at_cancel),
        "expected ~10 ticks, got {}",
        at_cancel
    );
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    iom.stop();
}

#[test]
fn condition_timer_skips_dropped_condition() {
    let iom = IoManager::new(1, false, "t_cond");
    let fired = Arc::new(AtomicUsize::new(0));
    let target = fired.clone();
    let cond = Arc::new(());
    iom.add_condition_timer(
        50,
        move || {
            target.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&cond),
        false,
    );
    drop(cond);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    iom.stop();
}

#[test]
fn condition_timer_fires_while_condition_lives() {
    let iom = IoManager::new(1, false, "t_cond_live");
    let (tx, rx) = mpsc::channel();
    let cond = Arc::new(());
    iom.add_condition_timer(
        50,
        move || {
            tx.send(()).unwrap();
        },
        Arc::downgrade(&cond),
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(cond);
    iom.stop();
}

#[test]
fn front_insert_shortens_the_poll() {
    let iom = IoManager::new(1, false, "t_front");
    let (tx, rx) = mpsc::channel();
    // A long timer parks the idle loop in a long poll first.
    let long = iom.add_timer(5000, || {}, false);
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    iom.add_timer(
        100,
        move || {
            tx.send(()).unwrap();
        },
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(2000));
    assert!(long.cancel());
    iom.stop();
}

#[test]
fn reset_pushes_the_deadline_out() {
    let iom = IoManager::new(1, false, "t_reset");
    let fired = Arc::new(AtomicUsize::new(0));
    let target = fired.clone();
    let timer = iom.add_timer(
        100,
        move || {
            target.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(timer.reset(600, true));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0, "fired before the new deadline");
    thread::sleep(Duration::from_millis(500));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    iom.stop();
}

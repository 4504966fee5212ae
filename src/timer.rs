//! Timers ordered by absolute deadline.
//!
//! A [`TimerQueue`] keeps timers sorted by `(deadline, insertion id)` on
//! the wall clock ([`clock::now_ms`]). The owner drains it from its event
//! loop: [`TimerManager::next_timeout`] bounds the poll timeout and
//! [`TimerManager::list_expired`] hands back the callbacks that are due.
//! When an insert lands at the front of the queue the registered
//! [`TimerNotify`] is poked once (deduplicated by a flag that
//! `next_timeout` clears), which the I/O manager wires to its wake pipe.
//!
//! A backward wall-clock jump of more than one hour is treated as a clock
//! adjustment: the next sweep fires every outstanding timer once.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

/// Backward jump below this is attributed to clock adjustment.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Receiver of the "new head timer" notification.
pub(crate) trait TimerNotify: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

/// Placeholder notify target for a queue nobody has claimed yet.
struct NoNotify;

impl TimerNotify for NoNotify {
    fn on_timer_inserted_at_front(&self) {}
}

/// A single timer. Handles are returned by [`TimerManager::add_timer`] and
/// stay valid after expiry (operations on a fired or cancelled timer
/// return `false`).
pub struct Timer {
    /// Period in ms; the deadline is re-derived from it on refresh/reset.
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    recurring: bool,
    seq: u64,
    cb: Mutex<Option<TimerCallback>>,
    queue: Weak<TimerQueue>,
    self_weak: Weak<Timer>,
}

impl Timer {
    /// Remove the timer so it never fires. Returns `false` if it already
    /// fired (non-recurring) or was cancelled.
    pub fn cancel(&self) -> bool {
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return false,
        };
        let mut timers = queue.timers.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&(self.deadline_ms.load(Ordering::SeqCst), self.seq));
        true
    }

    /// Push the deadline to `now + period` (heartbeat-style renewal).
    pub fn refresh(&self) -> bool {
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return false,
        };
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => return false,
        };
        let mut timers = queue.timers.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        let old_key = (self.deadline_ms.load(Ordering::SeqCst), self.seq);
        if timers.remove(&old_key).is_none() {
            return false;
        }
        let deadline = clock::now_ms() + self.period_ms.load(Ordering::SeqCst);
        self.deadline_ms.store(deadline, Ordering::SeqCst);
        timers.insert((deadline, self.seq), this);
        true
    }

    /// Change the period. The new deadline is based on `now` when
    /// `from_now`, on the original start otherwise.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.period_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return false,
        };
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => return false,
        };
        let at_front;
        {
            let mut timers = queue.timers.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            let old_key = (self.deadline_ms.load(Ordering::SeqCst), self.seq);
            if timers.remove(&old_key).is_none() {
                return false;
            }
            let start = if from_now {
                clock::now_ms()
            } else {
                old_key.0 - self.period_ms.load(Ordering::SeqCst)
            };
            self.period_ms.store(ms, Ordering::SeqCst);
            self.deadline_ms.store(start + ms, Ordering::SeqCst);
            at_front = queue.insert_locked(&mut timers, this);
        }
        if at_front {
            queue.notify_front();
        }
        true
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }
}

type TimerMap = BTreeMap<(u64, u64), Arc<Timer>>;

/// Shared timer storage, one per I/O manager.
pub struct TimerQueue {
    timers: RwLock<TimerMap>,
    /// Deduplicates front-insert notifications until `next_timeout` runs.
    tickled: AtomicBool,
    /// Last wall-clock sample, for rollover detection.
    previous_ms: AtomicU64,
    next_seq: AtomicU64,
    notify: RwLock<Weak<dyn TimerNotify>>,
    self_weak: Weak<TimerQueue>,
}

impl TimerQueue {
    pub(crate) fn new() -> Arc<TimerQueue> {
        Arc::new_cyclic(|weak: &Weak<TimerQueue>| TimerQueue {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(clock::now_ms()),
            next_seq: AtomicU64::new(0),
            notify: RwLock::new(Weak::<NoNotify>::new() as Weak<dyn TimerNotify>),
            self_weak: weak.clone(),
        })
    }

    pub(crate) fn set_notify(&self, notify: Weak<dyn TimerNotify>) {
        *self.notify.write().unwrap() = notify;
    }

    pub(crate) fn add(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new_cyclic(|weak: &Weak<Timer>| Timer {
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(clock::now_ms() + ms),
            recurring,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            cb: Mutex::new(Some(cb)),
            queue: self.self_weak.clone(),
            self_weak: weak.clone(),
        });
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            self.insert_locked(&mut timers, timer.clone())
        };
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Insert under the caller's write lock; true when the timer became
    /// the new head and nobody has been notified since the last
    /// `next_timeout`.
    fn insert_locked(&self, timers: &mut TimerMap, timer: Arc<Timer>) -> bool {
        let key = (timer.deadline_ms.load(Ordering::SeqCst), timer.seq);
        timers.insert(key, timer);
        let is_front = timers.keys().next() == Some(&key);
        is_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    fn notify_front(&self) {
        if let Some(notify) = self.notify.read().unwrap().upgrade() {
            notify.on_timer_inserted_at_front();
        }
    }

    /// Milliseconds until the next deadline: `Some(0)` when the head is
    /// already due, `None` when the queue is empty. Re-arms the
    /// front-insert notification.
    pub fn next_timeout(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read().unwrap();
        let (&(deadline, _), _) = timers.iter().next()?;
        Some(deadline.saturating_sub(clock::now_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Extract the callbacks of all due timers, deadline order, insertion
    /// order within one deadline. Recurring timers are re-armed at
    /// `now + period`, one-shot timers are disarmed.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = clock::now_ms();
        {
            let timers = self.timers.read().unwrap();
            if timers.is_empty() {
                return Vec::new();
            }
        }
        let mut timers = self.timers.write().unwrap();
        if timers.is_empty() {
            return Vec::new();
        }

        let rollover = self.detect_rollover(now);
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return Vec::new(),
            }
        }

        let expired: Vec<Arc<Timer>> = if rollover {
            mem::take(&mut *timers).into_iter().map(|(_, t)| t).collect()
        } else {
            let rest = timers.split_off(&(now + 1, 0));
            mem::replace(&mut *timers, rest)
                .into_iter()
                .map(|(_, t)| t)
                .collect()
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for timer in expired {
            let cb = {
                let mut slot = timer.cb.lock().unwrap();
                if timer.recurring {
                    slot.clone()
                } else {
                    slot.take()
                }
            };
            let cb = match cb {
                Some(cb) => cb,
                None => continue,
            };
            if timer.recurring {
                let deadline = now + timer.period_ms.load(Ordering::SeqCst);
                timer.deadline_ms.store(deadline, Ordering::SeqCst);
                timers.insert((deadline, timer.seq), timer.clone());
            }
            cbs.push(cb);
        }
        cbs
    }

    /// True when `now` jumped back by more than [`ROLLOVER_MS`] since the
    /// previous sample. Always updates the sample.
    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::SeqCst);
        now < previous.saturating_sub(ROLLOVER_MS)
    }
}

/// Timer mix-in implemented by the I/O manager (and usable by anything
/// that owns a [`TimerQueue`]).
pub trait TimerManager {
    fn timer_queue(&self) -> &Arc<TimerQueue>;

    /// Arm a timer firing in `ms` milliseconds; recurring timers re-arm
    /// themselves on expiry.
    fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        Self: Sized,
    {
        self.timer_queue().add(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](TimerManager::add_timer), but the callback runs
    /// only while `cond` can still be upgraded at fire time.
    fn add_condition_timer<F, C>(&self, ms: u64, cb: F, cond: Weak<C>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        C: Send + Sync + 'static,
        Self: Sized,
    {
        self.timer_queue().add(
            ms,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb()
                }
            }),
            recurring,
        )
    }

    fn next_timeout(&self) -> Option<u64> {
        self.timer_queue().next_timeout()
    }

    fn list_expired(&self) -> Vec<TimerCallback> {
        self.timer_queue().list_expired()
    }

    fn has_timer(&self) -> bool {
        self.timer_queue().has_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        queue: Arc<TimerQueue>,
    }

    impl TimerManager for Harness {
        fn timer_queue(&self) -> &Arc<TimerQueue> {
            &self.queue
        }
    }

    fn harness() -> Harness {
        Harness {
            queue: TimerQueue::new(),
        }
    }

    #[test]
    fn zero_delay_fires_on_next_sweep() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let target = fired.clone();
        h.add_timer(0, move || {
            target.fetch_add(1, Ordering::SeqCst);
        }, false);
        assert_eq!(h.next_timeout(), Some(0));
        let cbs = h.list_expired();
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!h.has_timer());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let target = fired.clone();
        let timer = h.add_timer(0, move || {
            target.fetch_add(1, Ordering::SeqCst);
        }, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(h.list_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_rearms() {
        let h = harness();
        let timer = h.add_timer(0, || {}, true);
        assert_eq!(h.list_expired().len(), 1);
        // Re-armed at now + period, still present.
        assert!(h.has_timer());
        assert_eq!(h.list_expired().len(), 1);
        assert!(timer.cancel());
        assert!(!h.has_timer());
    }

    #[test]
    fn expiry_order_is_deadline_then_insertion() {
        let h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let order = order.clone();
            h.add_timer(0, move || order.lock().unwrap().push(tag), false);
        }
        for cb in h.list_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn condition_timer_skips_dead_condition() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let target = fired.clone();
        let cond = Arc::new(());
        h.add_condition_timer(
            0,
            move || {
            target.fetch_add(1, Ordering::SeqCst);
        },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);
        for cb in h.list_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_tracks_the_head() {
        let h = harness();
        assert_eq!(h.next_timeout(), None);
        h.add_timer(5000, || {}, false);
        let first = h.next_timeout().unwrap();
        assert!(first <= 5000);
        h.add_timer(100, || {}, false);
        let second = h.next_timeout().unwrap();
        assert!(second <= 100);
        assert!(second <= first);
    }

    #[test]
    fn backward_clock_jump_fires_everything_once() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let target = fired.clone();
            h.add_timer(600_000, move || {
            target.fetch_add(1, Ordering::SeqCst);
        }, false);
        }
        // Pretend the previous sweep saw a clock two hours ahead.
        h.queue
            .previous_ms
            .store(clock::now_ms() + 2 * 60 * 60 * 1000, Ordering::SeqCst);
        let cbs = h.list_expired();
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(h.list_expired().is_empty());
    }

    #[test]
    fn reset_and_refresh_move_the_deadline() {
        let h = harness();
        let timer = h.add_timer(10_000, || {}, false);
        assert!(timer.reset(20_000, true));
        let timeout = h.next_timeout().unwrap();
        assert!(timeout > 10_000 && timeout <= 20_000);
        assert!(timer.refresh());
        assert!(h.next_timeout().unwrap() <= 20_000);
        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(5, true));
    }
}

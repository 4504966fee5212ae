//! Millisecond clocks used by the runtime.
//!
//! Timer deadlines are kept on the wall clock so that a manual clock
//! adjustment is observable (see the rollover handling in
//! [`timer`](crate::timer)); the monotonic clock is available for
//! measurements.

use std::mem::MaybeUninit;

#[inline(always)]
pub fn now_ms() -> u64 {
    clock_ms(libc::CLOCK_REALTIME)
}

#[inline(always)]
pub fn monotonic_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC)
}

#[inline(always)]
pub fn now() -> f64 {
    now_ms() as f64 / 1000.0
}

#[inline(always)]
pub fn monotonic() -> f64 {
    monotonic_ms() as f64 / 1000.0
}

#[inline]
fn clock_ms(clock_id: libc::clockid_t) -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock_id, ts.as_mut_ptr()) };
    assert_eq!(rc, 0, "clock_gettime({})", clock_id);
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backward() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn now_is_reasonable() {
        // Sometime after 2020-01-01 and before 2100.
        let ms = now_ms();
        assert!(ms > 1_577_836_800_000);
        assert!(ms < 4_102_444_800_000);
    }
}

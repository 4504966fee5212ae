//! Runtime-tunable settings.
//!
//! Each value is initialized once, from the environment if the matching
//! `FIBERIO_*` variable is set, and can be changed at runtime afterwards.
//! Consumers read the current value on every use, so an update takes
//! effect immediately.

use std::env;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use once_cell::sync::Lazy;

/// Default per-fiber stack size in bytes (`fiber.stack_size`).
pub const DEFAULT_FIBER_STACK_SIZE: u32 = 128 * 1024;

/// Default timeout in milliseconds applied by the hooked `connect`
/// (`tcp.connect.timeout`). `-1` would mean no timeout.
pub const DEFAULT_TCP_CONNECT_TIMEOUT: i64 = 5000;

static FIBER_STACK_SIZE: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(env_or("FIBERIO_FIBER_STACK_SIZE", DEFAULT_FIBER_STACK_SIZE)));

static TCP_CONNECT_TIMEOUT: Lazy<AtomicI64> =
    Lazy::new(|| AtomicI64::new(env_or("FIBERIO_TCP_CONNECT_TIMEOUT", DEFAULT_TCP_CONNECT_TIMEOUT)));

fn env_or<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[inline]
pub fn fiber_stack_size() -> usize {
    FIBER_STACK_SIZE.load(Ordering::Relaxed) as usize
}

pub fn set_fiber_stack_size(bytes: u32) {
    let old = FIBER_STACK_SIZE.swap(bytes, Ordering::Relaxed);
    if old != bytes {
        log::info!("fiber.stack_size changed from {} to {}", old, bytes);
    }
}

/// Current `tcp.connect.timeout` in milliseconds, `None` when disabled.
#[inline]
pub fn tcp_connect_timeout() -> Option<u64> {
    match TCP_CONNECT_TIMEOUT.load(Ordering::Relaxed) {
        ms if ms < 0 => None,
        ms => Some(ms as u64),
    }
}

pub fn set_tcp_connect_timeout(ms: i64) {
    let old = TCP_CONNECT_TIMEOUT.swap(ms, Ordering::Relaxed);
    if old != ms {
        log::info!("tcp.connect.timeout changed from {} to {}", old, ms);
    }
}

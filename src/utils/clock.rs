use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use quanta::Clock;

/// Global high-performance clock for hot-path timing.
/// Uses TSC (Time Stamp Counter) on x86/x86_64 for minimal overhead.
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Get current instant (precise, ~10ns overhead).
/// Used where the reactor times itself, e.g. per-pass select accounting.
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}

// Cached wall clock. The reactor refreshes it once per pump iteration so
// timeout math and TTL stamps do not hit the VDSO on every handler.
static CURRENT_SECS: AtomicI64 = AtomicI64::new(0);
static CURRENT_DSECS: AtomicU64 = AtomicU64::new(0);

/// Re-read the system wall clock into the cached copy. Returns whole seconds.
pub fn update_current_time() -> i64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = d.as_secs() as i64;
    CURRENT_SECS.store(secs, Ordering::Relaxed);
    CURRENT_DSECS.store(d.as_secs_f64().to_bits(), Ordering::Relaxed);
    secs
}

/// Cached wall clock, whole seconds since the epoch.
#[inline]
pub fn current_time() -> i64 {
    let t = CURRENT_SECS.load(Ordering::Relaxed);
    if t == 0 {
        update_current_time()
    } else {
        t
    }
}

/// Cached wall clock with sub-second precision.
#[inline]
pub fn current_dtime() -> f64 {
    let bits = CURRENT_DSECS.load(Ordering::Relaxed);
    if bits == 0 {
        update_current_time();
        return f64::from_bits(CURRENT_DSECS.load(Ordering::Relaxed));
    }
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reflects_wall_clock() {
        let t = update_current_time();
        assert!(t > 1_500_000_000);
        assert_eq!(current_time(), t);
        assert!((current_dtime() - t as f64).abs() < 1.5);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!((b - a).as_secs() < 1);
    }
}

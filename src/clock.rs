//! Time values derived from Posix `clock_gettime`.
//!
//! The substrate works in milliseconds throughout: timer deadlines, socket
//! timeouts and the UDP liveness map all use [`monotonic_ms`]. Wall clock
//! time only appears in the wire header (`send_time`, epoch seconds).

use std::mem::MaybeUninit;

#[inline]
fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // clock_gettime only fails for invalid clock ids.
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    assert_eq!(rc, 0, "clock_gettime failed");
    unsafe { ts.assume_init() }
}

/// Monotonic time in milliseconds since an unspecified epoch.
///
/// Not affected by wall clock adjustments; the only clock timer deadlines
/// are compared against.
#[inline]
pub fn monotonic_ms() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Wall clock time in seconds since the Unix epoch.
#[inline]
pub fn realtime_secs() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(realtime_secs() > 1_577_836_800);
    }
}

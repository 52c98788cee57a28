// src/clock.rs

/// Current time in milliseconds on the monotonic clock.
///
/// Not affected by system time changes; the epoch is unspecified. Every
/// timestamp in the crate (task start times, timer deadlines, payload slot
/// ages) is measured on this clock.
pub fn now_ms() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as i64) * 1000 + (ts.tv_nsec as i64) / 1_000_000
}

/// Absolute deadline `timeout_ms` from now on the realtime clock.
///
/// `pthread_cond_timedwait` measures against the condvar's clock, which is
/// `CLOCK_REALTIME` unless reconfigured; the shared condvars in this crate
/// keep the default, so their deadlines must come from here.
pub fn realtime_deadline(timeout_ms: u64) -> libc::timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let mut ts = libc::timespec {
        tv_sec: now.tv_sec + (timeout_ms / 1000) as libc::time_t,
        tv_nsec: now.tv_nsec + ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
    };
    if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_sec += 1;
        ts.tv_nsec -= 1_000_000_000;
    }
    ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let t1 = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = now_ms();
        assert!(t2 > t1);
        assert!(t2 - t1 >= 10);
    }

    #[test]
    fn deadline_is_in_the_future() {
        let d = realtime_deadline(1500);
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let d_ns = d.tv_sec as i128 * 1_000_000_000 + d.tv_nsec as i128;
        let now_ns = now.tv_sec as i128 * 1_000_000_000 + now.tv_nsec as i128;
        let diff_ms = (d_ns - now_ns) / 1_000_000;
        assert!(diff_ms > 1000 && diff_ms <= 1500, "diff_ms = {diff_ms}");
    }

    #[test]
    fn deadline_normalizes_nanos() {
        let d = realtime_deadline(999);
        assert!(d.tv_nsec < 1_000_000_000);
    }
}

use crate::error::{ShmError, ShmResult};

/// Longest accepted POSIX shared-memory object name, including the
/// leading `/` but excluding the NUL terminator.
pub const MAX_NAME_LEN: usize = 63;

/// Returns a monotonic timestamp in ns.
///
/// Used for the writer heartbeat and per-frame timestamps. Monotonic
/// (not wall-clock) so that liveness arithmetic survives clock steps.
#[cfg(unix)]
#[inline]
pub fn mono_time_ns() -> i64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as i64) * 1_000_000_000 + (ts.tv_nsec as i64)
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline(always)]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Validates a channel name against POSIX shared-memory naming rules.
///
/// A valid name:
///
/// * starts with `'/'`,
/// * contains no other `'/'` and no NUL bytes,
/// * is at most [`MAX_NAME_LEN`] bytes long,
/// * has at least one character after the slash.
pub(crate) fn validate_name(name: &str) -> ShmResult<()> {
    let invalid = |reason| ShmError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if !name.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if name.len() < 2 {
        return Err(invalid("empty object name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 63 bytes"));
    }
    if name[1..].contains('/') {
        return Err(invalid("'/' only allowed as the first character"));
    }
    if name.contains('\0') {
        return Err(invalid("contains NUL byte"));
    }
    Ok(())
}

/// Builds a shared-memory name unique across tests and processes.
///
/// Parallel test binaries share `/dev/shm`, so names carry the pid and a
/// process-wide counter.
#[cfg(test)]
pub(crate) fn unique_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/{}_{}_{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- mono_time_ns tests -------------------------------------------------

    #[cfg(unix)]
    #[test]
    fn mono_time_ns_returns_positive() {
        let t = mono_time_ns();
        assert!(t > 0, "mono_time_ns should return a positive timestamp");
    }

    #[cfg(unix)]
    #[test]
    fn mono_time_ns_is_monotonic_non_decreasing() {
        // Not strictly guaranteed to be strictly increasing for back-to-back calls,
        // but it should not go backwards.
        let t1 = mono_time_ns();
        let t2 = mono_time_ns();
        assert!(
            t2 >= t1,
            "mono_time_ns should be monotonic: t2={} < t1={}",
            t2,
            t1
        );
    }

    #[cfg(unix)]
    #[test]
    fn mono_time_ns_increases_over_sleep() {
        use std::thread;
        use std::time::Duration;

        let t1 = mono_time_ns();
        thread::sleep(Duration::from_millis(5));
        let t2 = mono_time_ns();

        assert!(
            t2 > t1,
            "mono_time_ns should increase over time: t2={} <= t1={}",
            t2,
            t1
        );
    }

    // --- align_up tests -----------------------------------------------------

    #[test]
    fn align_up_rounds_to_cache_line() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1024, 64), 1024);
    }

    #[test]
    fn align_up_rounds_to_huge_page() {
        const HUGE: usize = 2 * 1024 * 1024;
        assert_eq!(align_up(1, HUGE), HUGE);
        assert_eq!(align_up(HUGE, HUGE), HUGE);
        assert_eq!(align_up(HUGE + 1, HUGE), 2 * HUGE);
    }

    // --- validate_name tests ------------------------------------------------

    #[test]
    fn validate_name_accepts_posix_names() {
        assert!(validate_name("/sensor").is_ok());
        assert!(validate_name("/a").is_ok());
        assert!(validate_name("/ch_rb1234_0").is_ok());
    }

    #[test]
    fn validate_name_rejects_bad_names() {
        assert!(validate_name("sensor").is_err(), "missing leading slash");
        assert!(validate_name("/").is_err(), "empty object name");
        assert!(validate_name("/a/b").is_err(), "interior slash");
        assert!(validate_name("/nul\0byte").is_err(), "NUL byte");

        let long = format!("/{}", "x".repeat(MAX_NAME_LEN));
        assert!(validate_name(&long).is_err(), "name longer than 63 bytes");
    }
}

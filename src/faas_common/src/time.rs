use nix::time::{clock_gettime, ClockId};

/// Microseconds on the system-wide monotonic clock.
///
/// Unlike `minstant::Instant`, values are comparable across processes on the
/// same host, so they can be carried inside messages.
#[inline]
pub fn monotonic_micros() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as i64 * 1_000_000 + ts.tv_nsec() as i64 / 1_000,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(a > 0);
        assert!(b >= a);
    }
}

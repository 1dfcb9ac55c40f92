use std::sync::OnceLock;
use std::time::Instant;

// ─── Process clock ──────────────────────────────────────────────────────────

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Monotonic seconds since process start.
///
/// All scheduling state (flood-control windows, retry wakeups, long-poll
/// deadlines) is kept in this timebase so it is immune to wall-clock jumps.
pub fn monotonic_now() -> f64 {
    process_start().elapsed().as_secs_f64()
}

/// Current unix time as the 32-bit value used by queue records (`expires_at`).
pub fn unix_time() -> i32 {
    chrono::Utc::now().timestamp() as i32
}

/// Force initialization of the process clock; called first thing in `main`.
pub fn init() {
    process_start();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }

    #[test]
    fn unix_time_is_sane() {
        // Some time after 2024-01-01 and far from i32 overflow.
        let now = unix_time();
        assert!(now > 1_704_067_200);
    }
}

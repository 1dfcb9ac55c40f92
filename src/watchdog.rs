use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

// A liveness watchdog on its own OS thread, deliberately outside the async
// runtime: if the manager stops kicking it, the runtime itself is likely
// wedged and the watchdog must still be able to report that.

pub struct Watchdog {
    last_kick_micros: Arc<AtomicU64>,
    timeout: Duration,
}

impl Watchdog {
    /// `timeout` is how late a kick may be before the stall is reported.
    /// The watchdog stays silent until the first kick arrives.
    pub fn spawn(timeout: Duration) -> Watchdog {
        let last_kick_micros = Arc::new(AtomicU64::new(0));
        let shared = last_kick_micros.clone();
        std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || loop {
                std::thread::sleep(timeout);
                let last = shared.load(Ordering::Relaxed);
                if last == 0 {
                    continue;
                }
                let now = crate::clock::monotonic_now();
                let overdue = now - (last as f64 / 1e6) - timeout.as_secs_f64();
                if overdue > 0.0 {
                    error!(
                        overdue_seconds = overdue + timeout.as_secs_f64(),
                        "watchdog timeout expired; the main scheduler appears stalled"
                    );
                }
            })
            .expect("failed to spawn watchdog thread");
        Watchdog {
            last_kick_micros,
            timeout,
        }
    }

    pub fn kick(&self) {
        let now = crate::clock::monotonic_now();
        self.last_kick_micros
            .store((now * 1e6) as u64, Ordering::Relaxed);
    }

    /// How often the owner should kick to stay well within the timeout.
    pub fn kick_interval(&self) -> Duration {
        self.timeout / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_interval_is_a_tenth() {
        let watchdog = Watchdog::spawn(Duration::from_millis(250));
        assert_eq!(watchdog.kick_interval(), Duration::from_millis(25));
        watchdog.kick();
        assert!(watchdog.last_kick_micros.load(Ordering::Relaxed) > 0);
    }
}

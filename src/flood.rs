// src/flood.rs
//
// Multi-window event-rate limiter.
//
// A `FloodControl` holds a set of `(window, max_events)` limits and answers
// one question: given the events recorded so far, at what time would one
// more event stay within every limit?  Callers are expected to consult
// `wakeup_at()` before `add_event()` and to schedule a retry at the returned
// time when it lies in the future.
//
// Used for bot-creation flood control (per source IP), the listener accept
// loop, and webhook connection creation (active/pending regimes).

use std::collections::VecDeque;

struct Limit {
    window: f64,
    max_events: usize,
    events: VecDeque<f64>,
}

pub struct FloodControl {
    limits: Vec<Limit>,
}

impl FloodControl {
    /// `limits` are `(window_seconds, max_events)` pairs.
    pub fn with_limits(limits: &[(f64, usize)]) -> Self {
        Self {
            limits: limits
                .iter()
                .map(|&(window, max_events)| Limit {
                    window,
                    max_events,
                    events: VecDeque::new(),
                })
                .collect(),
        }
    }

    /// Record one event at time `now` (monotonic seconds).
    pub fn add_event(&mut self, now: f64) {
        for limit in &mut self.limits {
            while let Some(&front) = limit.events.front() {
                if front <= now - limit.window {
                    limit.events.pop_front();
                } else {
                    break;
                }
            }
            limit.events.push_back(now);
        }
    }

    /// Earliest time at which `add_event` would not exceed any limit.
    /// Returns 0.0 when an event is admissible immediately.
    pub fn wakeup_at(&self) -> f64 {
        let mut wakeup: f64 = 0.0;
        for limit in &self.limits {
            if limit.events.len() >= limit.max_events {
                // The event that must fall out of the window first.
                let blocking = limit.events[limit.events.len() - limit.max_events];
                wakeup = wakeup.max(blocking + limit.window);
            }
        }
        wakeup
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_limit_is_free() {
        let mut fc = FloodControl::with_limits(&[(60.0, 3)]);
        fc.add_event(1.0);
        fc.add_event(2.0);
        assert_eq!(fc.wakeup_at(), 0.0);
    }

    #[test]
    fn at_limit_reports_wakeup() {
        let mut fc = FloodControl::with_limits(&[(60.0, 3)]);
        fc.add_event(1.0);
        fc.add_event(2.0);
        fc.add_event(3.0);
        // The oldest event (t=1) must leave the 60s window first.
        assert_eq!(fc.wakeup_at(), 61.0);
    }

    #[test]
    fn window_expiry_frees_slots() {
        let mut fc = FloodControl::with_limits(&[(10.0, 2)]);
        fc.add_event(0.0);
        fc.add_event(1.0);
        assert_eq!(fc.wakeup_at(), 10.0);

        // t=10.5: the t=0 event has left the window, so the slot taken now
        // is blocked only by the t=1 event.
        fc.add_event(10.5);
        assert_eq!(fc.wakeup_at(), 1.0 + 10.0);

        // t=25: everything has expired.
        fc.add_event(25.0);
        assert_eq!(fc.wakeup_at(), 0.0);
    }

    #[test]
    fn strictest_limit_wins() {
        // 2 per second plus 3 per minute.
        let mut fc = FloodControl::with_limits(&[(1.0, 2), (60.0, 3)]);
        fc.add_event(0.0);
        fc.add_event(0.1);
        // Second window full -> wait for t=0 to leave it.
        assert_eq!(fc.wakeup_at(), 1.0);

        fc.add_event(1.5);
        // Minute window now full -> that limit dominates.
        assert_eq!(fc.wakeup_at(), 60.0);
    }

    #[test]
    fn creation_flood_shape() {
        // The bot-creation limits: 20/minute and 600/hour.
        let mut fc = FloodControl::with_limits(&[(60.0, 20), (3600.0, 600)]);
        for i in 0..20 {
            assert_eq!(fc.wakeup_at(), 0.0, "event {i} should be admissible");
            fc.add_event(i as f64 * 0.1);
        }
        let wakeup = fc.wakeup_at();
        assert!(wakeup > 0.0);
        // First event was at t=0, so the window frees at t=60.
        assert_eq!(wakeup, 60.0);
    }
}

// src/stats.rs
//
// Windowed request/response/update counters, kept per bot and aggregated
// process-wide.
//
// Every counter is tracked over four windows (all-time, 5s, 1m, 1h) using a
// two-bucket rotating accumulator: rates reported for a window always cover
// between one and two window lengths of history.  The per-bot instance
// forwards each event to the process-wide parent so the aggregate stays in
// sync without a separate collection pass.

use std::sync::{Arc, Mutex};

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum StatEvent {
    Request {
        size: u64,
        file_count: u64,
        files_size: u64,
    },
    Response {
        ok: bool,
        size: u64,
        file_count: u64,
        files_size: u64,
    },
    Update,
}

// ─── Counters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    request_count: f64,
    request_bytes: f64,
    request_file_count: f64,
    request_files_bytes: f64,
    request_files_max_bytes: u64,
    response_count: f64,
    response_count_ok: f64,
    response_count_error: f64,
    response_bytes: f64,
    update_count: f64,
}

impl Counters {
    fn on_event(&mut self, event: &StatEvent) {
        match *event {
            StatEvent::Request {
                size,
                file_count,
                files_size,
            } => {
                self.request_count += 1.0;
                self.request_bytes += size as f64;
                self.request_file_count += file_count as f64;
                self.request_files_bytes += files_size as f64;
                self.request_files_max_bytes = self.request_files_max_bytes.max(files_size);
            }
            StatEvent::Response { ok, size, .. } => {
                self.response_count += 1.0;
                if ok {
                    self.response_count_ok += 1.0;
                } else {
                    self.response_count_error += 1.0;
                }
                self.response_bytes += size as f64;
            }
            StatEvent::Update => {
                self.update_count += 1.0;
            }
        }
    }

    fn add(&mut self, other: &Counters) {
        self.request_count += other.request_count;
        self.request_bytes += other.request_bytes;
        self.request_file_count += other.request_file_count;
        self.request_files_bytes += other.request_files_bytes;
        self.request_files_max_bytes = self.request_files_max_bytes.max(other.request_files_max_bytes);
        self.response_count += other.response_count;
        self.response_count_ok += other.response_count_ok;
        self.response_count_error += other.response_count_error;
        self.response_bytes += other.response_bytes;
        self.update_count += other.update_count;
    }

    fn normalize(&mut self, duration: f64) {
        if duration < 1e-9 {
            return;
        }
        self.request_count /= duration;
        self.request_bytes /= duration;
        self.request_file_count /= duration;
        self.request_files_bytes /= duration;
        self.response_count /= duration;
        self.response_count_ok /= duration;
        self.response_count_error /= duration;
        self.response_bytes /= duration;
        self.update_count /= duration;
    }
}

// ─── Two-bucket rotating window ─────────────────────────────────────────────

struct TimedStat {
    /// Window length; 0 means all-time (never rotates).
    duration: f64,
    since: f64,
    current: Counters,
    prev: Counters,
    prev_duration: f64,
}

impl TimedStat {
    fn new(duration: f64, now: f64) -> Self {
        Self {
            duration,
            since: now,
            current: Counters::default(),
            prev: Counters::default(),
            prev_duration: 0.0,
        }
    }

    fn rotate(&mut self, now: f64) {
        if self.duration > 0.0 && now >= self.since + self.duration {
            self.prev = self.current;
            self.prev_duration = now - self.since;
            self.current = Counters::default();
            self.since = now;
        }
    }

    fn add_event(&mut self, event: &StatEvent, now: f64) {
        self.rotate(now);
        self.current.on_event(event);
    }

    /// Per-second rates over the covered history.
    fn rates(&mut self, now: f64) -> Counters {
        self.rotate(now);
        let mut combined = self.prev;
        combined.add(&self.current);
        combined.normalize(self.prev_duration + (now - self.since));
        combined
    }
}

// ─── Per-bot stats ──────────────────────────────────────────────────────────

pub const STAT_DESCRIPTIONS: [&str; 4] = ["inf", "5sec", "1min", "1hour"];
const STAT_DURATIONS: [f64; 4] = [0.0, 5.0, 60.0, 3600.0];

/// A bot is counted as active if it has seen traffic within a day.
const ACTIVITY_WINDOW: f64 = 86400.0;

#[derive(Debug, Clone, Copy)]
pub struct StatItem {
    pub key: &'static str,
    pub values: [f64; 4],
}

struct BotStatsInner {
    windows: [TimedStat; 4],
    last_activity: f64,
    active_request_count: i64,
    active_file_upload_count: i64,
    active_file_upload_bytes: i64,
}

/// Windowed counters plus live gauges for one bot (or, for the parent
/// instance, the whole process).
pub struct BotStats {
    inner: Mutex<BotStatsInner>,
    parent: Option<Arc<BotStats>>,
}

impl BotStats {
    pub fn new(now: f64, parent: Option<Arc<BotStats>>) -> Self {
        Self {
            inner: Mutex::new(BotStatsInner {
                windows: STAT_DURATIONS.map(|d| TimedStat::new(d, now)),
                last_activity: f64::MIN,
                active_request_count: 0,
                active_file_upload_count: 0,
                active_file_upload_bytes: 0,
            }),
            parent,
        }
    }

    pub fn add_event(&self, event: StatEvent, now: f64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_activity = now;
            for window in &mut inner.windows {
                window.add_event(&event, now);
            }
            match event {
                StatEvent::Request {
                    file_count,
                    files_size,
                    ..
                } => {
                    inner.active_request_count += 1;
                    inner.active_file_upload_count += file_count as i64;
                    inner.active_file_upload_bytes += files_size as i64;
                }
                StatEvent::Response {
                    file_count,
                    files_size,
                    ..
                } => {
                    inner.active_request_count = (inner.active_request_count - 1).max(0);
                    inner.active_file_upload_count =
                        (inner.active_file_upload_count - file_count as i64).max(0);
                    inner.active_file_upload_bytes =
                        (inner.active_file_upload_bytes - files_size as i64).max(0);
                }
                StatEvent::Update => {}
            }
        }
        if let Some(parent) = &self.parent {
            parent.add_event(event, now);
        }
    }

    /// One item per counter; `values` holds the per-second rate for each of
    /// the four windows.
    pub fn as_vector(&self, now: f64) -> Vec<StatItem> {
        let mut inner = self.inner.lock().unwrap();
        let rates: Vec<Counters> = inner.windows.iter_mut().map(|w| w.rates(now)).collect();
        let pick = |f: fn(&Counters) -> f64| -> [f64; 4] {
            [f(&rates[0]), f(&rates[1]), f(&rates[2]), f(&rates[3])]
        };
        vec![
            StatItem {
                key: "request_count",
                values: pick(|c| c.request_count),
            },
            StatItem {
                key: "request_bytes",
                values: pick(|c| c.request_bytes),
            },
            StatItem {
                key: "request_file_count",
                values: pick(|c| c.request_file_count),
            },
            StatItem {
                key: "request_files_bytes",
                values: pick(|c| c.request_files_bytes),
            },
            StatItem {
                key: "request_files_max_bytes",
                values: pick(|c| c.request_files_max_bytes as f64),
            },
            StatItem {
                key: "response_count",
                values: pick(|c| c.response_count),
            },
            StatItem {
                key: "response_count_ok",
                values: pick(|c| c.response_count_ok),
            },
            StatItem {
                key: "response_count_error",
                values: pick(|c| c.response_count_error),
            },
            StatItem {
                key: "response_bytes",
                values: pick(|c| c.response_bytes),
            },
            StatItem {
                key: "update_count",
                values: pick(|c| c.update_count),
            },
        ]
    }

    /// Ranking score for the stats endpoint: short-window rps plus
    /// long-window rps plus live load.
    pub fn score(&self, now: f64) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let minute = inner.windows[2].rates(now).request_count;
        let hour = inner.windows[3].rates(now).request_count;
        let active = inner.active_request_count as f64;
        let upload_mb = inner.active_file_upload_bytes as f64 / (1 << 20) as f64;
        minute + hour + active + upload_mb
    }

    pub fn is_active(&self, now: f64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.last_activity > now - ACTIVITY_WINDOW
    }

    pub fn active_request_count(&self) -> i64 {
        self.inner.lock().unwrap().active_request_count
    }

    pub fn active_file_upload_count(&self) -> i64 {
        self.inner.lock().unwrap().active_file_upload_count
    }

    pub fn active_file_upload_bytes(&self) -> i64 {
        self.inner.lock().unwrap().active_file_upload_bytes
    }
}

// ─── Per-bot info published to the stats endpoint ───────────────────────────

/// Slow-changing bot facts, written by the bot's client actor and read by
/// the manager when rendering the stats page.
#[derive(Debug, Clone, Default)]
pub struct BotInfo {
    pub id: i64,
    pub token: String,
    pub username: String,
    pub webhook_url: String,
    pub has_webhook_certificate: bool,
    pub webhook_max_connections: i32,
    pub head_update_id: i32,
    pub tail_update_id: i32,
    pub pending_update_count: usize,
    pub start_time: f64,
}

pub type SharedBotInfo = Arc<Mutex<BotInfo>>;

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size: u64) -> StatEvent {
        StatEvent::Request {
            size,
            file_count: 0,
            files_size: 0,
        }
    }

    #[test]
    fn all_time_window_counts_everything() {
        let stats = BotStats::new(0.0, None);
        for i in 0..10 {
            stats.add_event(request(100), i as f64);
        }
        let items = stats.as_vector(10.0);
        let rc = items.iter().find(|i| i.key == "request_count").unwrap();
        // 10 requests over 10 seconds -> 1 rps on the all-time window.
        assert!((rc.values[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_window_forgets() {
        let stats = BotStats::new(0.0, None);
        stats.add_event(request(1), 0.0);
        // After two full 5s rotations the event is out of both buckets.
        let items = stats.as_vector(11.0);
        let _ = stats.as_vector(17.0);
        let items_late = stats.as_vector(23.0);
        let early = items.iter().find(|i| i.key == "request_count").unwrap();
        let late = items_late.iter().find(|i| i.key == "request_count").unwrap();
        assert!(late.values[1] <= early.values[1]);
        assert_eq!(late.values[1], 0.0);
    }

    #[test]
    fn gauges_track_request_lifecycle() {
        let stats = BotStats::new(0.0, None);
        stats.add_event(
            StatEvent::Request {
                size: 10,
                file_count: 2,
                files_size: 2048,
            },
            1.0,
        );
        assert_eq!(stats.active_request_count(), 1);
        assert_eq!(stats.active_file_upload_count(), 2);
        assert_eq!(stats.active_file_upload_bytes(), 2048);

        stats.add_event(
            StatEvent::Response {
                ok: true,
                size: 5,
                file_count: 2,
                files_size: 2048,
            },
            2.0,
        );
        assert_eq!(stats.active_request_count(), 0);
        assert_eq!(stats.active_file_upload_bytes(), 0);
    }

    #[test]
    fn events_propagate_to_parent() {
        let parent = Arc::new(BotStats::new(0.0, None));
        let child_a = BotStats::new(0.0, Some(parent.clone()));
        let child_b = BotStats::new(0.0, Some(parent.clone()));

        child_a.add_event(StatEvent::Update, 1.0);
        child_b.add_event(StatEvent::Update, 1.0);
        child_b.add_event(StatEvent::Update, 1.5);

        let items = parent.as_vector(2.0);
        let uc = items.iter().find(|i| i.key == "update_count").unwrap();
        // 3 updates over 2 seconds on the all-time window.
        assert!((uc.values[0] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn activity_and_score() {
        let stats = BotStats::new(0.0, None);
        assert!(!stats.is_active(1000.0));
        stats.add_event(request(1), 1000.0);
        assert!(stats.is_active(1000.0));
        assert!(!stats.is_active(1000.0 + ACTIVITY_WINDOW + 1.0));
        // One in-flight request contributes at least 1.0 to the score.
        assert!(stats.score(1000.5) >= 1.0);
    }
}

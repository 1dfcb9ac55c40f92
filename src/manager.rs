// src/manager.rs
//
// Client manager: routes each incoming query to the right per-bot client
// actor, creating actors on first contact (behind a per-source-IP flood
// control), replays the persistent webhook registry at startup, drives the
// queue garbage collector, assembles the stats page and coordinates
// graceful shutdown.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{spawn_client, ClientHandle};
use crate::clock;
use crate::error::ApiError;
use crate::flood::FloodControl;
use crate::params::SharedParams;
use crate::query::Query;
use crate::stats::{BotStats, SharedBotInfo, STAT_DESCRIPTIONS};
use crate::watchdog::Watchdog;
use crate::webhook;
use crate::webhook_db::{parse_registry_key, registry_key, WebhookDescriptor};

// ─── Admission filter ───────────────────────────────────────────────────────

/// Shard predicate partitioning bots across instances: a token with numeric
/// prefix `id` is served here iff `id % modulo == remainder`.
#[derive(Debug, Clone, Copy)]
pub struct TokenRange {
    pub remainder: u64,
    pub modulo: u64,
}

impl Default for TokenRange {
    fn default() -> Self {
        Self {
            remainder: 0,
            modulo: 1,
        }
    }
}

impl TokenRange {
    pub fn admits(&self, user_id: u64) -> bool {
        user_id % self.modulo == self.remainder
    }
}

/// Maximum bot user id; the test-DC bit sits just above it.
const MAX_USER_ID: i64 = 1 << 54;

const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(250);

/// Warn once this many additional events were garbage-collected.
const GC_WARNING_STEP: u64 = 10_000;

pub fn get_tqueue_id(user_id: i64, is_test_dc: bool) -> i64 {
    user_id + ((is_test_dc as i64) << 54)
}

// ─── Public surface ─────────────────────────────────────────────────────────

pub enum ManagerMsg {
    Query(Box<Query>),
    Stats {
        args: Vec<(String, String)>,
        reply: oneshot::Sender<String>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerMsg>,
}

impl ManagerHandle {
    pub fn send(&self, query: Box<Query>) {
        let _ = self.tx.send(ManagerMsg::Query(query));
    }

    pub async fn get_stats(&self, args: Vec<(String, String)>) -> String {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerMsg::Stats { args, reply }).is_err() {
            return "Closing\n".to_string();
        }
        rx.await.unwrap_or_else(|_| "Closing\n".to_string())
    }

    /// Begin graceful shutdown; resolves when every client actor is gone
    /// and the persistent stores are closed.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerMsg::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub fn spawn_manager(params: Arc<SharedParams>, token_range: TokenRange) -> ManagerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        ManagerActor::new(params, token_range).run(rx).await;
    });
    ManagerHandle { tx }
}

// ─── Actor ──────────────────────────────────────────────────────────────────

struct ClientEntry {
    handle: ClientHandle,
    stats: Arc<BotStats>,
    bot_info: SharedBotInfo,
    token: String,
}

struct ManagerActor {
    params: Arc<SharedParams>,
    token_range: TokenRange,
    clients: HashMap<String, ClientEntry>,
    flood_controls: HashMap<String, FloodControl>,
    aggregate_stats: Arc<BotStats>,
    hangup_tx: mpsc::UnboundedSender<String>,
    hangup_rx: mpsc::UnboundedReceiver<String>,
    watchdog: Watchdog,
    close_flag: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    done: bool,
    next_gc_time: f64,
    gc_deleted_total: u64,
    gc_deleted_warned: u64,
}

impl ManagerActor {
    fn new(params: Arc<SharedParams>, token_range: TokenRange) -> Self {
        let (hangup_tx, hangup_rx) = mpsc::unbounded_channel();
        let aggregate_stats = Arc::new(BotStats::new(clock::monotonic_now(), None));
        Self {
            params,
            token_range,
            clients: HashMap::new(),
            flood_controls: HashMap::new(),
            aggregate_stats,
            hangup_tx,
            hangup_rx,
            watchdog: Watchdog::spawn(WATCHDOG_TIMEOUT),
            close_flag: false,
            close_waiters: Vec::new(),
            done: false,
            next_gc_time: 0.0,
            gc_deleted_total: 0,
            gc_deleted_warned: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ManagerMsg>) {
        self.restore_webhooks();

        let mut tick = tokio::time::interval(self.watchdog.kick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.done {
            tokio::select! {
                msg = cmd_rx.recv() => match msg {
                    Some(ManagerMsg::Query(query)) => self.send(query),
                    Some(ManagerMsg::Stats { args, reply }) => {
                        let _ = reply.send(self.render_stats(&args));
                    }
                    Some(ManagerMsg::Close { reply }) => self.close(reply),
                    None => break,
                },
                token_with_dc = self.hangup_rx.recv() => {
                    if let Some(token_with_dc) = token_with_dc {
                        self.on_client_hangup(&token_with_dc);
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
        info!("client manager stopped");
    }

    // ── Startup restore ─────────────────────────────────────────────────

    /// Replay every persisted webhook as a synthetic internal setWebhook
    /// through the normal routing path.  Entries outside the admission
    /// range are dropped.
    fn restore_webhooks(&mut self) {
        for (key, value) in self.params.webhook_db.get_all() {
            let numeric_prefix: String =
                key.chars().take_while(|c| c.is_ascii_digit()).collect();
            let admitted = numeric_prefix
                .parse::<u64>()
                .map(|id| self.token_range.admits(id))
                .unwrap_or(false);
            if !admitted {
                warn!(key = %key, "dropping webhook outside the token range");
                self.params.webhook_db.erase(&key);
                continue;
            }
            info!(key = %key, webhook = %value, "restoring webhook");
            let (token, is_test_dc) = parse_registry_key(&key);
            let descriptor = WebhookDescriptor::parse(&value);
            let query = Query::internal(
                token.to_string(),
                is_test_dc,
                "setwebhook",
                descriptor.restore_args(),
            );
            self.send(Box::new(query));
        }
    }

    // ── Routing ─────────────────────────────────────────────────────────

    fn send(&mut self, mut query: Box<Query>) {
        if self.close_flag {
            // The dropped promise answers with 429.
            return;
        }

        let token = query.token.clone();
        if token.is_empty()
            || token.starts_with('0')
            || token.len() > 80
            || token.contains('/')
            || !token.contains(':')
        {
            query.answer_error(ApiError::unauthorized("invalid token specified"));
            return;
        }
        let user_id = match token[..token.find(':').unwrap()].parse::<i64>() {
            Ok(user_id) => user_id,
            Err(_) => {
                query.answer_error(ApiError::misdirected("unallowed token specified"));
                return;
            }
        };
        if user_id <= 0 || user_id >= MAX_USER_ID {
            query.answer_error(ApiError::unauthorized("invalid token specified"));
            return;
        }
        if !self.token_range.admits(user_id as u64) {
            query.answer_error(ApiError::misdirected("unallowed token specified"));
            return;
        }

        let token_with_dc = if query.is_test_dc {
            format!("{token}/test")
        } else {
            token.clone()
        };

        if !self.clients.contains_key(&token_with_dc) {
            if query.method == "close" {
                query.answer_error(ApiError::bad_request("the bot has already been closed"));
                return;
            }

            if !query.is_internal {
                let ip_address = canonicalize_peer_ip(&query.peer_ip);
                if !ip_address.is_empty() {
                    debug!(ip = %ip_address, "checking client creation flood control");
                    let flood = self
                        .flood_controls
                        .entry(ip_address.clone())
                        .or_insert_with(|| {
                            FloodControl::with_limits(&[(60.0, 20), (60.0 * 60.0, 600)])
                        });
                    let now = clock::monotonic_now();
                    let wakeup_at = flood.wakeup_at();
                    if wakeup_at > now {
                        info!(ip = %ip_address, "refusing to create client: flood control");
                        query.answer_error(ApiError::retry_after(
                            (wakeup_at - now) as u64 + 1,
                        ));
                        return;
                    }
                    flood.add_event(now);
                }
            }

            let tqueue_id = get_tqueue_id(user_id, query.is_test_dc);
            let stats = Arc::new(BotStats::new(
                clock::monotonic_now(),
                Some(self.aggregate_stats.clone()),
            ));
            let bot_info = SharedBotInfo::default();
            let handle = spawn_client(
                self.params.clone(),
                token.clone(),
                query.is_test_dc,
                tqueue_id,
                stats.clone(),
                bot_info.clone(),
                self.hangup_tx.clone(),
            );
            debug!(token_id = tqueue_id, "created bot client");

            // Re-apply a persisted webhook before the first query, unless
            // that query is about to change the webhook anyway.
            if query.method != "setwebhook" && query.method != "deletewebhook" {
                let key = registry_key(&token, query.is_test_dc);
                if let Some(value) = self.params.webhook_db.get(&key) {
                    let descriptor = WebhookDescriptor::parse(&value);
                    let restore = Query::internal(
                        token.clone(),
                        query.is_test_dc,
                        "setwebhook",
                        descriptor.restore_args(),
                    );
                    handle.send(Box::new(restore));
                }
            }

            self.clients.insert(
                token_with_dc.clone(),
                ClientEntry {
                    handle,
                    stats,
                    bot_info,
                    token,
                },
            );
        }

        self.clients[&token_with_dc].handle.send(query);
    }

    fn on_client_hangup(&mut self, token_with_dc: &str) {
        if self.clients.remove(token_with_dc).is_some() {
            debug!(token = %token_with_dc, "bot client deregistered");
        }
        if self.close_flag && self.clients.is_empty() {
            self.finish_close();
        }
    }

    // ── Periodic work ───────────────────────────────────────────────────

    fn on_tick(&mut self) {
        self.watchdog.kick();

        let now = clock::monotonic_now();
        if now >= self.next_gc_time && !self.close_flag {
            let unix_now = clock::unix_time();
            let (deleted, finished) = self.params.tqueue.run_gc(unix_now);
            self.next_gc_time = now + if finished { 60.0 } else { 1.0 };
            self.gc_deleted_total += deleted;
            if self.gc_deleted_total > self.gc_deleted_warned + GC_WARNING_STEP {
                warn!(
                    total = self.gc_deleted_total,
                    "queue GC has deleted many events since start"
                );
                self.gc_deleted_warned = self.gc_deleted_total;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    fn close(&mut self, reply: oneshot::Sender<()>) {
        self.close_waiters.push(reply);
        if self.close_flag {
            return;
        }
        info!(clients = self.clients.len(), "client manager closing");
        self.close_flag = true;
        for entry in self.clients.values() {
            entry.handle.close();
        }
        if self.clients.is_empty() {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        info!("closing databases");
        self.params.tqueue.close();
        self.params.webhook_db.close();
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.done = true;
    }

    // ── Stats ───────────────────────────────────────────────────────────

    fn render_stats(&self, args: &[(String, String)]) -> String {
        let id_filter = args
            .iter()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        let now = clock::monotonic_now();

        let mut out = String::new();
        out.push_str("DURATION");
        for description in STAT_DESCRIPTIONS {
            out.push('\t');
            out.push_str(description);
        }
        out.push('\n');

        if id_filter.is_empty() {
            let active_count = self
                .clients
                .values()
                .filter(|c| c.stats.is_active(now))
                .count();
            out.push_str(&format!("uptime\t{:.3}\n", now - self.params.start_time));
            out.push_str(&format!("bot_count\t{}\n", self.clients.len()));
            out.push_str(&format!("active_bot_count\t{active_count}\n"));
            if let Some(rss) = resident_set_size_bytes() {
                out.push_str(&format!("rss\t{rss}\n"));
            }
            out.push_str(&format!(
                "active_webhook_connections\t{}\n",
                webhook::total_connection_count()
            ));
            out.push_str(&format!(
                "active_requests\t{}\n",
                self.params
                    .query_count
                    .load(std::sync::atomic::Ordering::Relaxed)
            ));
            for item in self.aggregate_stats.as_vector(now) {
                out.push_str(&format!("{}\t{}\n", item.key, format_rates(&item.values)));
            }
        }

        // Per-bot sections, top clients by score first.
        let mut scored: Vec<(&String, &ClientEntry, f64)> = self
            .clients
            .iter()
            .filter(|(_, entry)| entry.token.starts_with(id_filter))
            .map(|(key, entry)| (key, entry, entry.stats.score(now)))
            .collect();
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (_, entry, _) in scored.into_iter().take(50) {
            let bot_info = entry.bot_info.lock().unwrap().clone();
            out.push('\n');
            out.push_str(&format!("id\t{}\n", bot_info.id));
            out.push_str(&format!("uptime\t{:.3}\n", now - bot_info.start_time));
            out.push_str(&format!("token\t{}\n", bot_info.token));
            out.push_str(&format!("username\t{}\n", bot_info.username));
            let active_request_count = entry.stats.active_request_count();
            if active_request_count != 0 {
                out.push_str(&format!("active_request_count\t{active_request_count}\n"));
            }
            let upload_bytes = entry.stats.active_file_upload_bytes();
            if upload_bytes != 0 {
                out.push_str(&format!("active_file_upload_bytes\t{upload_bytes}\n"));
            }
            let upload_count = entry.stats.active_file_upload_count();
            if upload_count != 0 {
                out.push_str(&format!("active_file_upload_count\t{upload_count}\n"));
            }
            if !bot_info.webhook_url.is_empty() {
                out.push_str(&format!("webhook\t{}\n", bot_info.webhook_url));
                if bot_info.has_webhook_certificate {
                    out.push_str("has_custom_certificate\ttrue\n");
                }
                if bot_info.webhook_max_connections
                    != self.params.default_max_webhook_connections
                {
                    out.push_str(&format!(
                        "webhook_max_connections\t{}\n",
                        bot_info.webhook_max_connections
                    ));
                }
            }
            out.push_str(&format!("head_update_id\t{}\n", bot_info.head_update_id));
            if bot_info.pending_update_count != 0 {
                out.push_str(&format!("tail_update_id\t{}\n", bot_info.tail_update_id));
                out.push_str(&format!(
                    "pending_update_count\t{}\n",
                    bot_info.pending_update_count
                ));
            }
            for item in entry.stats.as_vector(now) {
                if item.key == "update_count" || item.key == "request_count" {
                    out.push_str(&format!(
                        "{}/sec\t{}\n",
                        item.key,
                        format_rates(&item.values)
                    ));
                }
            }
        }
        out
    }
}

fn format_rates(values: &[f64; 4]) -> String {
    values
        .iter()
        .map(|v| {
            if *v == 0.0 {
                "0".to_string()
            } else {
                format!("{v:.3}")
            }
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Peer IPs are canonicalized before flood-control bucketing; the IPv6
/// scope/interface suffix never distinguishes clients.
fn canonicalize_peer_ip(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let stripped = raw.split('%').next().unwrap_or(raw);
    match stripped.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// VmRSS from /proc/self/status, in bytes.
fn resident_set_size_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryResponse, ResponsePromise};
    use crate::upstream::LoopbackUpstream;

    fn start_manager() -> (ManagerHandle, Arc<SharedParams>) {
        let upstream = LoopbackUpstream::new();
        let params = SharedParams::for_tests(upstream);
        let handle = spawn_manager(params.clone(), TokenRange::default());
        (handle, params)
    }

    fn make_query(
        token: &str,
        method: &str,
        peer_ip: &str,
    ) -> (Box<Query>, oneshot::Receiver<QueryResponse>) {
        let (promise, rx) = ResponsePromise::new();
        let query = Query::new(
            token.to_string(),
            false,
            method,
            Vec::new(),
            Vec::new(),
            peer_ip.to_string(),
            0,
            promise,
        );
        (Box::new(query), rx)
    }

    async fn call(
        manager: &ManagerHandle,
        token: &str,
        method: &str,
        peer_ip: &str,
    ) -> QueryResponse {
        let (query, rx) = make_query(token, method, peer_ip);
        manager.send(query);
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("query timed out")
            .expect("promise dropped")
    }

    #[tokio::test]
    async fn invalid_tokens_are_401() {
        let (manager, _params) = start_manager();
        for bad in ["", "noseparator", "0123:abc", "has/slash:x"] {
            let response = call(&manager, bad, "getMe", "1.2.3.4").await;
            assert_eq!(response.status_code, 401, "token {bad:?}");
        }
        // Too long.
        let long = format!("123:{}", "x".repeat(90));
        let response = call(&manager, &long, "getMe", "1.2.3.4").await;
        assert_eq!(response.status_code, 401);
    }

    #[tokio::test]
    async fn token_range_rejects_with_421() {
        let upstream = LoopbackUpstream::new();
        let params = SharedParams::for_tests(upstream);
        let manager = spawn_manager(
            params,
            TokenRange {
                remainder: 1,
                modulo: 3,
            },
        );

        let response = call(&manager, "2:abc", "getMe", "1.2.3.4").await;
        assert_eq!(response.status_code, 421);
        assert!(response.body["description"]
            .as_str()
            .unwrap()
            .starts_with("Misdirected Request"));

        // 4 % 3 == 1: admitted.
        let response = call(&manager, "4:abc", "getMe", "1.2.3.4").await;
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn valid_token_routes_to_client() {
        let (manager, _params) = start_manager();
        let response = call(&manager, "123:abc", "getMe", "1.2.3.4").await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["result"]["id"], 123);
    }

    #[tokio::test]
    async fn creation_flood_limits_per_ip() {
        let (manager, _params) = start_manager();

        // 20 distinct new bots from one IP pass, the 21st is throttled.
        for i in 1..=20 {
            let response = call(&manager, &format!("{i}:tok"), "getMe", "9.9.9.9").await;
            assert_eq!(response.status_code, 200, "bot {i}");
        }
        let response = call(&manager, "21:tok", "getMe", "9.9.9.9").await;
        assert_eq!(response.status_code, 429);
        assert!(response.body["parameters"]["retry_after"].as_u64().unwrap() >= 1);

        // A different source IP is unaffected.
        let response = call(&manager, "22:tok", "getMe", "8.8.8.8").await;
        assert_eq!(response.status_code, 200);

        // Existing bots keep working from the throttled IP.
        let response = call(&manager, "1:tok", "getMe", "9.9.9.9").await;
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn close_resolves_after_drain() {
        let (manager, _params) = start_manager();
        let _ = call(&manager, "123:abc", "getMe", "1.2.3.4").await;

        tokio::time::timeout(Duration::from_secs(5), manager.close())
            .await
            .expect("close did not resolve");

        // After closing, new queries get the shutdown answer.
        let (query, rx) = make_query("124:abc", "getMe", "1.2.3.4");
        manager.send(query);
        let response = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("no response after close")
            .unwrap();
        assert_eq!(response.status_code, 429);
    }

    #[tokio::test]
    async fn webhook_restore_replays_registry() {
        let upstream = LoopbackUpstream::new();
        let params = SharedParams::for_tests(upstream);

        // A listener so webhook verification succeeds.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let descriptor = WebhookDescriptor {
            url: format!("http://{addr}/hook"),
            max_connections: Some(7),
            ..Default::default()
        };
        params.webhook_db.set("123:abc", &descriptor.encode());

        let manager = spawn_manager(params.clone(), TokenRange::default());
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The restored webhook is visible through the API.
        let (promise, rx) = ResponsePromise::new();
        let query = Query::new(
            "123:abc".to_string(),
            false,
            "getWebhookInfo",
            Vec::new(),
            Vec::new(),
            "1.2.3.4".to_string(),
            0,
            promise,
        );
        manager.send(Box::new(query));
        let response = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.body["result"]["url"], format!("http://{addr}/hook"));
        assert_eq!(response.body["result"]["max_connections"], 7);
    }

    #[tokio::test]
    async fn restore_drops_entries_outside_token_range() {
        let upstream = LoopbackUpstream::new();
        let params = SharedParams::for_tests(upstream);
        params.webhook_db.set("2:abc", "https://example.com/hook");

        let _manager = spawn_manager(
            params.clone(),
            TokenRange {
                remainder: 1,
                modulo: 3,
            },
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(params.webhook_db.get("2:abc").is_none());
    }

    #[tokio::test]
    async fn stats_page_has_process_section() {
        let (manager, _params) = start_manager();
        let _ = call(&manager, "123:abc", "getMe", "1.2.3.4").await;

        let stats = manager.get_stats(Vec::new()).await;
        assert!(stats.starts_with("DURATION\tinf\t5sec\t1min\t1hour\n"), "{stats}");
        assert!(stats.contains("\nbot_count\t1\n"));
        assert!(stats.contains("uptime\t"));
        assert!(stats.contains("request_count\t"));
        // Per-bot section.
        assert!(stats.contains("token\t123:abc"));
    }

    #[test]
    fn peer_ip_canonicalization() {
        assert_eq!(canonicalize_peer_ip("1.2.3.4"), "1.2.3.4");
        assert_eq!(canonicalize_peer_ip("fe80::1%eth0"), "fe80::1");
        assert_eq!(canonicalize_peer_ip(""), "");
        assert_eq!(canonicalize_peer_ip("garbage"), "garbage");
    }

    #[test]
    fn tqueue_id_encodes_test_dc() {
        assert_eq!(get_tqueue_id(5, false), 5);
        assert_eq!(get_tqueue_id(5, true), 5 + (1 << 54));
    }
}

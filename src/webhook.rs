// src/webhook.rs
//
// Webhook delivery actor: one per configured webhook.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   TQueue ──load_updates()──> update_map / queue_updates / queues
//                                  │
//                                  ├─ pick conversation with earliest wakeup
//                                  ├─ POST {"update_id":N,"<kind>":{...}}
//                                  ├─ 2xx: ack (forget) + answer-via-webhook
//                                  └─ failure: per-event retry with backoff
//
// ─ Connection policy ────────────────────────────────────────────────────────
//
//   The actor accounts for "slots": one slot is one concurrent in-flight
//   request over the endpoint-pinned HTTP client.  Opening a slot is gated
//   by one of two flood controls: the *active* regime (a success within the
//   last 10 s) opens aggressively, the *pending* regime allows a single
//   probing slot until a success arrives.  When the resolved endpoint IP
//   changes the generation counter is bumped and the pooled client is
//   discarded, so no keep-alive connection outlives its address.
//
// ─ Per-event retry ──────────────────────────────────────────────────────────
//
//   delay starts at 1 s and doubles on failure, capped at random(60..120).
//   A Retry-After header overrides the next delay (clamped to 3600).  An
//   event whose next attempt would land past its expiry is dropped.  A
//   webhook answering 410 for 23 hours straight is closed permanently.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::clock;
use crate::flood::FloodControl;
use crate::query::{Query, ResponsePromise};
use crate::tqueue::{Event, EventId, TQueue};
use crate::updates::encode_update_json;

// ─── Constants ──────────────────────────────────────────────────────────────

const MIN_PENDING_UPDATES_WARNING: usize = 50;
const IP_ADDRESS_CACHE_TIME: f64 = 30.0 * 60.0;
const WEBHOOK_MAX_RESEND_TIMEOUT: i64 = 60;
const WEBHOOK_DROP_TIMEOUT: f64 = 60.0 * 60.0 * 23.0;
const MAX_RETRY_AFTER: i64 = 3600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_BATCH_SIZE: usize = 128;

/// Synthetic conversation ids for updates without one.
const UNIQUE_QUEUE_ID_START: i64 = 1 << 60;

/// Response bodies are read only far enough to find an embedded method call.
const MAX_ANSWER_BODY_SIZE: usize = 1 << 16;

static TOTAL_CONNECTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Process-wide count of open webhook connection slots, for stats.
pub fn total_connection_count() -> u64 {
    TOTAL_CONNECTION_COUNT.load(Ordering::Relaxed)
}

// ─── Public surface ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub token: String,
    pub is_test_dc: bool,
    pub tqueue_id: i64,
    pub url: Url,
    pub max_connections: i32,
    pub secret_token: String,
    /// PEM bundle of a pinned self-signed CA, if one was uploaded.
    pub cert_path: Option<PathBuf>,
    /// Restored from the registry rather than freshly set.
    pub from_db: bool,
    pub cached_ip_address: Option<IpAddr>,
    pub fix_ip_address: bool,
    pub local_mode: bool,
    /// Bodies above this are failed without retry.
    pub max_update_body_size: usize,
    /// Outbound HTTP proxy; verification is skipped when set.
    pub proxy: Option<Url>,
}

/// What the actor reports back to its owning bot client.
#[derive(Debug)]
pub enum WebhookUpcall {
    /// The endpoint checked out; `ip_address` is the cached resolution
    /// (empty when unknown, e.g. behind a proxy).
    Verified { ip_address: String },
    /// The queue was fully drained after successful deliveries.
    Success,
    /// A delivery attempt failed (only reported once verified).
    Error { description: String },
    /// The actor is gone.
    Closed { reason: WebhookClosedReason },
    /// A query embedded in a 2xx response body (answer-via-webhook).
    Send(Box<Query>),
}

#[derive(Debug)]
pub enum WebhookClosedReason {
    /// Closed on request (deleteWebhook, replacement, shutdown).
    Graceful,
    /// The endpoint answered 410 for 23 hours; unregister the webhook.
    Gone,
    /// Verification never completed; the descriptive error goes to the
    /// pending setWebhook caller.
    Failed(String),
}

pub enum WebhookCmd {
    /// New events were pushed to the queue.
    NewUpdates,
    Close,
}

#[derive(Clone)]
pub struct WebhookHandle {
    tx: mpsc::UnboundedSender<WebhookCmd>,
}

impl WebhookHandle {
    pub fn notify_new_updates(&self) {
        let _ = self.tx.send(WebhookCmd::NewUpdates);
    }

    pub fn close(&self) {
        let _ = self.tx.send(WebhookCmd::Close);
    }
}

pub fn spawn(
    settings: WebhookSettings,
    tqueue: Arc<TQueue>,
    upcalls: mpsc::UnboundedSender<WebhookUpcall>,
) -> WebhookHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        WebhookActor::new(settings, tqueue, upcalls).run(rx).await;
    });
    WebhookHandle { tx }
}

// ─── Backoff ────────────────────────────────────────────────────────────────

/// One retry decision: returns `(next_effective_delay, new_delay)`.
/// `cap` is the randomized doubling ceiling, drawn from 60..=120 by the
/// caller.
fn compute_backoff(
    delay: i64,
    fail_count: i32,
    retry_after: Option<i64>,
    cap: i64,
) -> (i64, i64) {
    match retry_after {
        Some(k) => {
            let k = k.clamp(0, MAX_RETRY_AFTER);
            if k == 0 && fail_count > 0 {
                let new_delay = (delay * 2).min(cap);
                (new_delay, new_delay)
            } else {
                (k, delay)
            }
        }
        None => ((delay).min(cap), (delay * 2).min(cap)),
    }
}

fn random_resend_cap() -> i64 {
    rand::thread_rng().gen_range(WEBHOOK_MAX_RESEND_TIMEOUT..=WEBHOOK_MAX_RESEND_TIMEOUT * 2)
}

// ─── Address policy ─────────────────────────────────────────────────────────

fn is_reserved_ipv4(ip: std::net::Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || octets[0] == 0
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        || (octets[0] == 192 && octets[1] == 88 && octets[2] == 99)
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        || octets[0] >= 224
}

/// Public webhook endpoints must resolve to a routable IPv4 address.
fn check_ip_address(ip: IpAddr, local_mode: bool) -> Result<(), String> {
    if local_mode {
        return Ok(());
    }
    match ip {
        IpAddr::V6(_) => Err("IPv6-only addresses are not allowed".to_string()),
        IpAddr::V4(v4) => {
            if is_reserved_ipv4(v4) {
                Err(format!("IP address {v4} is reserved"))
            } else {
                Ok(())
            }
        }
    }
}

/// Ports a public webhook may listen on.
pub fn is_allowed_webhook_port(port: u16) -> bool {
    matches!(port, 80 | 88 | 443 | 8443)
}

// ─── Answer-via-webhook ─────────────────────────────────────────────────────

/// Methods that may not be invoked through a webhook response body.
fn is_forbidden_answer_method(method: &str) -> bool {
    method.is_empty()
        || method == "setwebhook"
        || method == "deletewebhook"
        || method == "close"
        || method == "logout"
        || method.starts_with("get")
}

/// Extract bot-API call arguments from a 2xx response body.  Supports JSON
/// objects and form-urlencoded bodies; returns None when no usable `method`
/// field is present.
fn parse_answer_body(content_type: &str, body: &[u8]) -> Option<Vec<(String, String)>> {
    let args: Vec<(String, String)> = if content_type.contains("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;
        object
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    } else if content_type.contains("application/x-www-form-urlencoded") {
        url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    } else {
        return None;
    };

    let method = args
        .iter()
        .find(|(k, _)| k == "method")
        .map(|(_, v)| v.to_ascii_lowercase())?;
    if is_forbidden_answer_method(&method) {
        return None;
    }
    Some(args)
}

// ─── Actor state ────────────────────────────────────────────────────────────

struct PendingUpdate {
    json: String,
    queue_id: i64,
    expires_at: i32,
    wakeup_at: f64,
    delay: i64,
    fail_count: i32,
    last_send_time: f64,
}

fn wakeup_key(wakeup_at: f64, queue_id: i64) -> (i64, i64) {
    ((wakeup_at * 1e9) as i64, queue_id)
}

struct SendOutcome {
    event_id: EventId,
    generation: u64,
    result: SendResult,
}

enum SendResult {
    Ok {
        answer_args: Option<Vec<(String, String)>>,
    },
    Status {
        code: u16,
        reason: String,
        retry_after: Option<i64>,
    },
    Transport {
        error: String,
    },
}

enum Wake {
    Cmd(Option<WebhookCmd>),
    Outcome(SendOutcome),
    Resolved(Result<IpAddr, String>),
    Probe(Result<(), String>),
    Timer,
}

struct WebhookActor {
    settings: WebhookSettings,
    tqueue: Arc<TQueue>,
    upcalls: mpsc::UnboundedSender<WebhookUpcall>,

    /// Request URL with userinfo stripped.
    request_url: Url,
    userinfo: Option<String>,
    host: String,
    port: u16,

    ip_address: Option<IpAddr>,
    ip_generation: u64,
    next_resolve_time: f64,
    resolving: bool,
    resolve_rx: mpsc::UnboundedReceiver<Result<IpAddr, String>>,
    resolve_tx: mpsc::UnboundedSender<Result<IpAddr, String>>,

    probe_in_flight: bool,
    probe_rx: mpsc::UnboundedReceiver<Result<(), String>>,
    probe_tx: mpsc::UnboundedSender<Result<(), String>>,

    client: Option<reqwest::Client>,
    custom_cert: Option<reqwest::Certificate>,

    update_map: HashMap<EventId, PendingUpdate>,
    queue_updates: HashMap<i64, VecDeque<EventId>>,
    queues: BTreeSet<(i64, i64)>,
    unique_queue_id: i64,

    tqueue_offset: EventId,
    tqueue_empty: bool,
    max_loaded_updates: usize,
    last_pending_update_count: usize,

    open_slots: usize,
    busy_slots: usize,
    active_flood: FloodControl,
    pending_flood: FloodControl,
    last_success_time: f64,
    last_update_was_successful: bool,

    first_error_410_time: f64,
    last_error_time: f64,
    last_error_message: String,

    was_checked: bool,
    stop_flag: bool,
    wakeup_at: f64,

    in_flight: FuturesUnordered<futures::future::BoxFuture<'static, SendOutcome>>,
}

impl WebhookActor {
    fn new(
        settings: WebhookSettings,
        tqueue: Arc<TQueue>,
        upcalls: mpsc::UnboundedSender<WebhookUpcall>,
    ) -> Self {
        let mut request_url = settings.url.clone();
        let userinfo = if request_url.username().is_empty() {
            None
        } else {
            let mut userinfo = request_url.username().to_string();
            if let Some(password) = request_url.password() {
                userinfo.push(':');
                userinfo.push_str(password);
            }
            let _ = request_url.set_username("");
            let _ = request_url.set_password(None);
            Some(userinfo)
        };
        let host = request_url.host_str().unwrap_or_default().to_string();
        let port = request_url
            .port_or_known_default()
            .unwrap_or(if request_url.scheme() == "http" { 80 } else { 443 });

        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();

        let max_loaded_updates = (settings.max_connections.max(1) as usize) * 2;

        Self {
            ip_address: settings.cached_ip_address,
            tqueue,
            upcalls,
            request_url,
            userinfo,
            host,
            port,
            ip_generation: 0,
            next_resolve_time: 0.0,
            resolving: false,
            resolve_rx,
            resolve_tx,
            probe_in_flight: false,
            probe_rx,
            probe_tx,
            client: None,
            custom_cert: None,
            update_map: HashMap::new(),
            queue_updates: HashMap::new(),
            queues: BTreeSet::new(),
            unique_queue_id: UNIQUE_QUEUE_ID_START,
            tqueue_offset: EventId::empty(),
            tqueue_empty: false,
            max_loaded_updates,
            last_pending_update_count: MIN_PENDING_UPDATES_WARNING,
            open_slots: 0,
            busy_slots: 0,
            // Active regime: 10 connections per half second.
            active_flood: FloodControl::with_limits(&[(0.5, 10)]),
            // Pending regime: one attempt per two seconds.
            pending_flood: FloodControl::with_limits(&[(2.0, 1)]),
            last_success_time: clock::monotonic_now() - 2.0 * IP_ADDRESS_CACHE_TIME,
            last_update_was_successful: true,
            first_error_410_time: 0.0,
            last_error_time: 0.0,
            last_error_message: "<none>".to_string(),
            was_checked: false,
            stop_flag: false,
            wakeup_at: 0.0,
            in_flight: FuturesUnordered::new(),
            settings,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    fn start_up(&mut self) {
        let now = clock::monotonic_now();
        info!(
            tqueue_id = self.settings.tqueue_id,
            url = %self.settings.url,
            max_connections = self.settings.max_connections,
            from_db = self.settings.from_db,
            fix_ip_address = self.settings.fix_ip_address,
            "starting webhook"
        );

        if self.settings.from_db {
            // Restored webhooks re-resolve lazily, spread over the cache
            // window to avoid a resolve burst at startup.
            self.next_resolve_time =
                now + rand::thread_rng().gen_range(0.0..IP_ADDRESS_CACHE_TIME);
        }

        if !self.settings.local_mode {
            if self.settings.url.scheme() == "https" {
                if !is_allowed_webhook_port(self.port) {
                    self.on_error(
                        "Webhook can be set up only on ports 80, 88, 443 or 8443".to_string(),
                    );
                    return;
                }
            } else {
                self.on_error("An HTTPS URL must be provided for webhook".to_string());
                return;
            }
        }

        if let Some(cert_path) = self.settings.cert_path.clone() {
            match load_certificate(&cert_path) {
                Ok(cert) => self.custom_cert = Some(cert),
                Err(e) => {
                    self.on_error(format!("Can't load the certificate: {e}"));
                    return;
                }
            }
        }

        if self.settings.fix_ip_address {
            match self.ip_address {
                Some(ip) => {
                    if let Err(e) = check_ip_address(ip, self.settings.local_mode) {
                        self.on_error(e);
                        return;
                    }
                }
                None => {
                    self.on_error("Invalid IP address specified".to_string());
                    return;
                }
            }
        }

        if self.settings.proxy.is_some() {
            // Behind a proxy the endpoint is verified as soon as the proxy
            // accepts connections; report immediately.
            self.was_checked = true;
            self.on_webhook_verified();
        } else if self.settings.from_db {
            self.was_checked = true;
            self.on_webhook_verified();
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<WebhookCmd>) {
        self.start_up();

        while !self.stop_flag {
            self.wakeup_at = 0.0;
            self.load_updates();
            if self.stop_flag {
                break;
            }
            self.start_resolve_if_needed();
            self.create_new_connections();
            self.send_updates();
            if self.stop_flag {
                break;
            }

            let now = clock::monotonic_now();
            let sleep_for = if self.wakeup_at > 0.0 {
                Duration::from_secs_f64((self.wakeup_at - now).max(0.0))
            } else {
                Duration::from_secs(3600)
            };

            let wake = tokio::select! {
                cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                Some(outcome) = self.in_flight.next() => Wake::Outcome(outcome),
                Some(result) = self.resolve_rx.recv() => Wake::Resolved(result),
                Some(result) = self.probe_rx.recv() => Wake::Probe(result),
                _ = tokio::time::sleep(sleep_for) => Wake::Timer,
            };
            match wake {
                Wake::Cmd(Some(WebhookCmd::NewUpdates)) => {
                    trace!("new updates in queue");
                    self.tqueue_empty = false;
                }
                Wake::Cmd(Some(WebhookCmd::Close)) | Wake::Cmd(None) => {
                    self.close_with(WebhookClosedReason::Graceful);
                }
                Wake::Outcome(outcome) => self.on_send_outcome(outcome),
                Wake::Resolved(result) => self.on_resolved(result),
                Wake::Probe(result) => self.on_probe(result),
                Wake::Timer => {}
            }
        }

        // Every open slot disappears with the actor.
        TOTAL_CONNECTION_COUNT.fetch_sub(self.open_slots as u64, Ordering::Relaxed);
        debug!(tqueue_id = self.settings.tqueue_id, "webhook stopped");
    }

    fn close_with(&mut self, reason: WebhookClosedReason) {
        if !self.stop_flag {
            let _ = self.upcalls.send(WebhookUpcall::Closed { reason });
            self.stop_flag = true;
        }
    }

    /// A failure before verification is terminal: the pending setWebhook
    /// caller gets the error and the actor stops.
    fn on_error(&mut self, description: String) {
        debug!(error = %description, "webhook error");
        if !self.was_checked && !self.stop_flag {
            self.close_with(WebhookClosedReason::Failed(description));
        }
    }

    fn on_webhook_error(&mut self, description: &str) {
        if self.was_checked {
            self.last_error_time = clock::monotonic_now();
            self.last_error_message = description.to_string();
            let _ = self.upcalls.send(WebhookUpcall::Error {
                description: description.to_string(),
            });
        }
    }

    fn on_webhook_verified(&mut self) {
        let ip_address = self
            .ip_address
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let _ = self.upcalls.send(WebhookUpcall::Verified { ip_address });
    }

    fn relax_wakeup_at(&mut self, wakeup_at: f64, source: &str) {
        if self.wakeup_at == 0.0 || wakeup_at < self.wakeup_at {
            trace!(
                in_seconds = wakeup_at - clock::monotonic_now(),
                source,
                "wake up scheduled"
            );
            self.wakeup_at = wakeup_at;
        }
    }

    // ── IP resolution ───────────────────────────────────────────────────

    fn start_resolve_if_needed(&mut self) {
        if self.settings.fix_ip_address || self.settings.proxy.is_some() || self.resolving {
            return;
        }
        let now = clock::monotonic_now();
        if now < self.next_resolve_time {
            self.relax_wakeup_at(self.next_resolve_time, "resolve_ip_address");
            return;
        }

        self.resolving = true;
        let host = self.host.clone();
        let port = self.port;
        let tx = self.resolve_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    addrs
                        .iter()
                        .find(|a| a.is_ipv4())
                        .or_else(|| addrs.first())
                        .map(|a| a.ip())
                        .ok_or_else(|| "Failed to resolve host: no addresses".to_string())
                }
                Err(e) => Err(format!("Failed to resolve host: {e}")),
            };
            let _ = tx.send(result);
        });
    }

    fn on_resolved(&mut self, result: Result<IpAddr, String>) {
        self.resolving = false;
        let now = clock::monotonic_now();
        self.next_resolve_time = now
            + IP_ADDRESS_CACHE_TIME
            + rand::thread_rng().gen_range(0.0..IP_ADDRESS_CACHE_TIME / 10.0);
        self.relax_wakeup_at(self.next_resolve_time, "on_resolved_ip_address");

        let new_ip = match result {
            Ok(ip) => ip,
            Err(e) => {
                self.on_webhook_error(&e);
                self.on_error(e);
                return;
            }
        };
        if let Err(e) = check_ip_address(new_ip, self.settings.local_mode) {
            self.on_error(e);
            return;
        }
        if self.ip_address != Some(new_ip) {
            debug!(old = ?self.ip_address, new = %new_ip, "webhook IP address changed");
            self.ip_address = Some(new_ip);
            self.ip_generation += 1;
            // Drain the pool: keep-alive connections must not be reused
            // against the new address.
            self.client = None;
            TOTAL_CONNECTION_COUNT.fetch_sub(self.open_slots as u64, Ordering::Relaxed);
            self.open_slots = 0;
            if self.was_checked {
                self.on_webhook_verified();
            }
        }
    }

    // ── Connections ─────────────────────────────────────────────────────

    fn build_client(&self) -> Result<reqwest::Client, String> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(proxy) = &self.settings.proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy.as_str()).map_err(|e| e.to_string())?);
        } else if let Some(ip) = self.ip_address {
            builder = builder.resolve(&self.host, SocketAddr::new(ip, self.port));
        }
        if let Some(cert) = &self.custom_cert {
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert.clone());
        }
        builder.build().map_err(|e| e.to_string())
    }

    fn ensure_client(&mut self) -> Option<reqwest::Client> {
        if self.client.is_none() {
            match self.build_client() {
                Ok(client) => self.client = Some(client),
                Err(e) => {
                    let e = format!("Can't create an SSL context: {e}");
                    self.on_webhook_error(&e);
                    self.on_error(e);
                    return None;
                }
            }
        }
        self.client.clone()
    }

    fn open_slot(&mut self) {
        self.open_slots += 1;
        TOTAL_CONNECTION_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    fn discard_slot(&mut self) {
        if self.open_slots > 0 {
            self.open_slots -= 1;
            TOTAL_CONNECTION_COUNT.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn ready_slots(&self) -> usize {
        self.open_slots.saturating_sub(self.busy_slots)
    }

    fn create_new_connections(&mut self) {
        if self.ip_address.is_none() && self.settings.proxy.is_none() {
            trace!("no connections yet: IP address is not ready");
            return;
        }

        let mut need = self
            .queue_updates
            .len()
            .min(self.settings.max_connections.max(1) as usize);
        if !self.was_checked {
            need = 1;
        }

        let now = clock::monotonic_now();
        let pending_mode = self.last_success_time + 10.0 < now;
        if pending_mode {
            need = need.min(1);
        } else {
            need = need.max(1);
        }

        while self.open_slots + usize::from(self.probe_in_flight) < need {
            let flood = if pending_mode {
                &mut self.pending_flood
            } else {
                &mut self.active_flood
            };
            let wakeup = flood.wakeup_at();
            if wakeup > now {
                self.relax_wakeup_at(wakeup, "create_new_connections");
                trace!(after = wakeup - now, "connection creation flood-limited");
                break;
            }
            flood.add_event(now);

            if !self.was_checked && !self.probe_in_flight {
                self.start_probe();
            } else {
                self.open_slot();
            }
        }
    }

    /// First-connection check: a plain TCP connect to the resolved address.
    /// Success verifies the webhook before any request is sent.
    fn start_probe(&mut self) {
        let Some(ip) = self.ip_address else { return };
        self.probe_in_flight = true;
        let addr = SocketAddr::new(ip, self.port);
        let tx = self.probe_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                Duration::from_secs(10),
                tokio::net::TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(format!("Can't connect to the webhook: {e}")),
                Err(_) => Err("Can't connect to the webhook: connection timed out".to_string()),
            };
            let _ = tx.send(result);
        });
    }

    fn on_probe(&mut self, result: Result<(), String>) {
        self.probe_in_flight = false;
        match result {
            Ok(()) => {
                self.open_slot();
                if !self.was_checked {
                    self.was_checked = true;
                    self.on_webhook_verified();
                }
            }
            Err(e) => {
                self.on_webhook_error(&e);
                self.on_error(e);
                self.relax_wakeup_at(clock::monotonic_now() + 1.0, "probe failed");
            }
        }
    }

    // ── Loading from the queue ──────────────────────────────────────────

    fn load_updates(&mut self) {
        if self.tqueue_empty {
            return;
        }
        if self.update_map.len() >= self.max_loaded_updates {
            trace!("maximum allowed number of updates is already loaded");
            return;
        }
        if self.tqueue_offset.is_empty() {
            self.tqueue_offset = self.tqueue.head(self.settings.tqueue_id);
        }
        if self.tqueue_offset.is_empty() {
            self.tqueue_empty = true;
            return;
        }

        let limit = EVENT_BATCH_SIZE.min(self.max_loaded_updates - self.update_map.len());
        let mut events: Vec<Event> = Vec::new();
        let unix_now = clock::unix_time();
        let total = self.tqueue.get(
            self.settings.tqueue_id,
            self.tqueue_offset,
            false,
            unix_now,
            limit,
            &mut events,
        );
        if events.is_empty() {
            self.tqueue_empty = true;
        }

        let now = clock::monotonic_now();
        let loaded = events.len();
        for event in events {
            if self.update_map.contains_key(&event.id) {
                warn!(event_id = %event.id, "received duplicate event from queue");
                self.tqueue_offset = event.id.next().unwrap_or(EventId::empty());
                continue;
            }
            let queue_id = if event.extra != 0 {
                event.extra
            } else {
                self.unique_queue_id += 1;
                self.unique_queue_id
            };
            self.update_map.insert(
                event.id,
                PendingUpdate {
                    json: event.payload,
                    queue_id,
                    expires_at: event.expires_at,
                    wakeup_at: now,
                    delay: 1,
                    fail_count: 0,
                    last_send_time: 0.0,
                },
            );
            self.tqueue_offset = event.id.next().unwrap_or(EventId::empty());

            let fifo = self.queue_updates.entry(queue_id).or_default();
            if fifo.is_empty() {
                self.queues.insert(wakeup_key(now, queue_id));
            }
            fifo.push_back(event.id);
        }

        // Backlog warning with a doubling threshold, reset once drained.
        let mut need_warning = false;
        if total <= MIN_PENDING_UPDATES_WARNING / 2 {
            if self.last_pending_update_count > MIN_PENDING_UPDATES_WARNING {
                need_warning = true;
                self.last_pending_update_count = MIN_PENDING_UPDATES_WARNING;
            }
        } else if total >= self.last_pending_update_count {
            need_warning = true;
            while total >= self.last_pending_update_count {
                self.last_pending_update_count *= 2;
            }
        }
        if need_warning {
            let last_error_age = if self.last_error_time == 0.0 {
                -1.0
            } else {
                now - self.last_error_time
            };
            warn!(
                loaded,
                total,
                in_memory = self.update_map.len(),
                conversations = self.queue_updates.len(),
                last_error = %self.last_error_message,
                last_error_age,
                "webhook backlog"
            );
        }

        if loaded == total && self.last_update_was_successful {
            let _ = self.upcalls.send(WebhookUpcall::Success);
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn send_updates(&mut self) {
        while self.send_update() {}
    }

    fn send_update(&mut self) -> bool {
        if self.ready_slots() == 0 {
            return false;
        }
        let Some(&(wakeup_ns, queue_id)) = self.queues.iter().next() else {
            return false;
        };
        let now = clock::monotonic_now();
        if wakeup_ns as f64 / 1e9 > now {
            self.relax_wakeup_at(wakeup_ns as f64 / 1e9, "send_update");
            return false;
        }
        self.queues.remove(&(wakeup_ns, queue_id));

        let event_id = *self.queue_updates[&queue_id]
            .front()
            .expect("scheduled conversation with empty FIFO");
        let update = self
            .update_map
            .get_mut(&event_id)
            .expect("scheduled event missing from update map");
        update.last_send_time = now;

        let body = encode_update_json(event_id.value(), &update.json);
        if body.len() > self.settings.max_update_body_size {
            warn!(event_id = %event_id, size = body.len(), "dropping oversized update");
            self.drop_event(event_id);
            return true;
        }

        let Some(client) = self.ensure_client() else {
            // Leave the conversation scheduled; the client may become
            // buildable after the next resolve.
            self.queues.insert((wakeup_ns, queue_id));
            return false;
        };

        let mut request = client
            .post(self.request_url.clone())
            .header("Content-Type", "application/json")
            .header("Accept-Encoding", "gzip, deflate");
        if let Some(userinfo) = &self.userinfo {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
            request = request.header("Authorization", format!("Basic {encoded}"));
        }
        if !self.settings.secret_token.is_empty() {
            request = request.header(
                "X-Telegram-Bot-Api-Secret-Token",
                self.settings.secret_token.clone(),
            );
        }
        let request = request.body(body);

        let generation = self.ip_generation;
        trace!(event_id = %event_id, queue_id, "sending update");
        self.busy_slots += 1;
        self.in_flight.push(Box::pin(async move {
            let result = match request.send().await {
                Ok(response) => {
                    let code = response.status().as_u16();
                    if (200..300).contains(&code) {
                        let content_type = response
                            .headers()
                            .get("Content-Type")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = response.bytes().await.unwrap_or_default();
                        let answer_args = if body.len() <= MAX_ANSWER_BODY_SIZE {
                            parse_answer_body(&content_type, &body)
                        } else {
                            None
                        };
                        SendResult::Ok { answer_args }
                    } else {
                        let retry_after = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.trim().parse::<i64>().ok());
                        let reason = response
                            .status()
                            .canonical_reason()
                            .unwrap_or_default()
                            .to_string();
                        SendResult::Status {
                            code,
                            reason,
                            retry_after,
                        }
                    }
                }
                Err(e) => SendResult::Transport {
                    error: e.to_string(),
                },
            };
            SendOutcome {
                event_id,
                generation,
                result,
            }
        }));
        true
    }

    fn on_send_outcome(&mut self, outcome: SendOutcome) {
        self.busy_slots = self.busy_slots.saturating_sub(1);
        let stale_generation = outcome.generation != self.ip_generation;

        match outcome.result {
            SendResult::Ok { answer_args } => {
                self.first_error_410_time = 0.0;
                if stale_generation {
                    // The keep-alive connection belongs to the old address.
                    self.discard_slot();
                }
                if let Some(args) = answer_args {
                    let method = args
                        .iter()
                        .find(|(k, _)| k == "method")
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default();
                    debug!(%method, "executing method from webhook response");
                    let query = Query::new(
                        self.settings.token.clone(),
                        self.settings.is_test_dc,
                        &method,
                        args,
                        Vec::new(),
                        String::new(),
                        0,
                        ResponsePromise::inert(),
                    );
                    let _ = self.upcalls.send(WebhookUpcall::Send(Box::new(query)));
                }
                self.on_update_ok(outcome.event_id);
            }
            SendResult::Status {
                code,
                reason,
                retry_after,
            } => {
                if stale_generation {
                    self.discard_slot();
                }
                let error = format!("Wrong response from the webhook: {code} {reason}");
                let mut need_close = false;
                if code == 410 {
                    let now = clock::monotonic_now();
                    if self.first_error_410_time == 0.0 {
                        self.first_error_410_time = now;
                    } else if now > self.first_error_410_time + WEBHOOK_DROP_TIMEOUT {
                        warn!("closing webhook because of HTTP 410 errors");
                        need_close = true;
                    }
                } else {
                    self.first_error_410_time = 0.0;
                }
                self.on_webhook_error(&error);
                self.on_update_error(outcome.event_id, &error, retry_after);
                if need_close {
                    self.close_with(WebhookClosedReason::Gone);
                }
            }
            SendResult::Transport { error } => {
                // The underlying connection is dead either way.
                self.discard_slot();
                let error = format!("Webhook connection failed: {error}");
                self.on_webhook_error(&error);
                self.on_update_error(outcome.event_id, &error, None);
            }
        }
    }

    // ── Per-event completion ────────────────────────────────────────────

    fn drop_event(&mut self, event_id: EventId) {
        let update = self
            .update_map
            .remove(&event_id)
            .expect("dropping unknown event");
        let queue_id = update.queue_id;

        let fifo = self
            .queue_updates
            .get_mut(&queue_id)
            .expect("event without conversation FIFO");
        debug_assert_eq!(fifo.front(), Some(&event_id));
        fifo.pop_front();
        if fifo.is_empty() {
            self.queue_updates.remove(&queue_id);
        } else {
            let next_id = *fifo.front().unwrap();
            let wakeup_at = self.update_map[&next_id].wakeup_at;
            self.queues.insert(wakeup_key(wakeup_at, queue_id));
        }

        self.tqueue.forget(self.settings.tqueue_id, event_id);
    }

    fn on_update_ok(&mut self, event_id: EventId) {
        self.last_update_was_successful = true;
        self.last_success_time = clock::monotonic_now();
        if let Some(update) = self.update_map.get(&event_id) {
            trace!(
                event_id = %event_id,
                seconds = self.last_success_time - update.last_send_time,
                "update delivered"
            );
        }
        self.drop_event(event_id);
    }

    fn on_update_error(&mut self, event_id: EventId, error: &str, retry_after: Option<i64>) {
        self.last_update_was_successful = false;
        let now = clock::monotonic_now();
        let unix_now = clock::unix_time();

        let Some(update) = self.update_map.get_mut(&event_id) else {
            return;
        };
        let (effective_delay, new_delay) = compute_backoff(
            update.delay,
            update.fail_count,
            retry_after,
            random_resend_cap(),
        );
        if unix_now as i64 + effective_delay > update.expires_at as i64 {
            warn!(event_id = %event_id, error, "dropping expired update");
            self.drop_event(event_id);
            return;
        }
        update.delay = new_delay;
        update.wakeup_at = now + effective_delay as f64;
        update.fail_count += 1;
        let key = wakeup_key(update.wakeup_at, update.queue_id);
        let fail_count = update.fail_count;
        let delay_for = update.wakeup_at - now;
        self.queues.insert(key);
        debug!(
            event_id = %event_id,
            delay_for,
            fail_count,
            error,
            "update delivery delayed"
        );
    }
}

fn load_certificate(path: &std::path::Path) -> Result<reqwest::Certificate, String> {
    let pem = std::fs::read(path).map_err(|e| e.to_string())?;
    // Validate that the file really is a PEM certificate before handing it
    // to the TLS stack.
    let mut cursor = std::io::Cursor::new(&pem);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cursor)
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }
    reqwest::Certificate::from_pem(&pem).map_err(|e| e.to_string())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;

    // ── Backoff unit tests ──────────────────────────────────────────────

    #[test]
    fn backoff_baseline_sequence() {
        // No Retry-After: effective delays are 1, 2, 4, ... up to the cap.
        let cap = 90;
        let mut delay = 1;
        let mut expected = 1;
        for fail_count in 0..8 {
            let (effective, new_delay) = compute_backoff(delay, fail_count, None, cap);
            assert_eq!(effective, expected.min(cap));
            assert!(new_delay >= delay && new_delay <= (delay * 2).min(cap));
            delay = new_delay;
            expected *= 2;
        }
        assert_eq!(delay, cap);
    }

    #[test]
    fn backoff_monotonic_and_capped() {
        for cap in [60, 90, 120] {
            let mut delay = 1;
            for fail_count in 0..20 {
                let (effective, new_delay) = compute_backoff(delay, fail_count, None, cap);
                assert!(effective >= 1 || fail_count == 0);
                assert!(new_delay >= delay, "delay must not shrink");
                assert!(new_delay <= cap, "delay must stay capped");
                delay = new_delay;
            }
        }
    }

    #[test]
    fn backoff_respects_retry_after() {
        let (effective, new_delay) = compute_backoff(4, 3, Some(17), 90);
        assert_eq!(effective, 17);
        assert_eq!(new_delay, 4);

        // Excessive values are clamped to an hour.
        let (effective, _) = compute_backoff(1, 0, Some(1_000_000), 90);
        assert_eq!(effective, MAX_RETRY_AFTER);

        // Retry-After: 0 after earlier failures falls back to doubling.
        let (effective, new_delay) = compute_backoff(4, 2, Some(0), 90);
        assert_eq!(new_delay, 8);
        assert_eq!(effective, 8);

        // Retry-After: 0 on the first failure means retry now.
        let (effective, new_delay) = compute_backoff(1, 0, Some(0), 90);
        assert_eq!(effective, 0);
        assert_eq!(new_delay, 1);
    }

    // ── Address policy ──────────────────────────────────────────────────

    #[test]
    fn reserved_addresses_are_rejected() {
        for bad in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "169.254.0.1", "0.0.0.0", "224.0.0.1"]
        {
            let ip: IpAddr = bad.parse().unwrap();
            assert!(check_ip_address(ip, false).is_err(), "{bad} should be rejected");
            assert!(check_ip_address(ip, true).is_ok(), "{bad} is fine in local mode");
        }
        assert!(check_ip_address("93.184.216.34".parse().unwrap(), false).is_ok());
        assert!(check_ip_address("2001:db8::1".parse().unwrap(), false).is_err());
    }

    #[test]
    fn webhook_port_policy() {
        for port in [80u16, 88, 443, 8443] {
            assert!(is_allowed_webhook_port(port));
        }
        for port in [8080u16, 8443 + 1, 1, 65535] {
            assert!(!is_allowed_webhook_port(port));
        }
    }

    // ── Answer-via-webhook parsing ──────────────────────────────────────

    #[test]
    fn answer_body_json() {
        let args = parse_answer_body(
            "application/json",
            br#"{"method":"sendMessage","chat_id":5,"text":"hi"}"#,
        )
        .unwrap();
        assert!(args.contains(&("method".to_string(), "sendMessage".to_string())));
        assert!(args.contains(&("chat_id".to_string(), "5".to_string())));
        assert!(args.contains(&("text".to_string(), "hi".to_string())));
    }

    #[test]
    fn answer_body_form() {
        let args = parse_answer_body(
            "application/x-www-form-urlencoded",
            b"method=sendMessage&chat_id=5&text=hello+there",
        )
        .unwrap();
        assert!(args.contains(&("text".to_string(), "hello there".to_string())));
    }

    #[test]
    fn answer_body_rejects_forbidden_methods() {
        for method in ["setWebhook", "deleteWebhook", "close", "logOut", "getMe", "getUpdates"] {
            let body = format!(r#"{{"method":"{method}"}}"#);
            assert!(
                parse_answer_body("application/json", body.as_bytes()).is_none(),
                "{method} must not be executable via webhook response"
            );
        }
        assert!(parse_answer_body("text/plain", b"method=sendMessage").is_none());
        assert!(parse_answer_body("application/json", b"{}").is_none());
    }

    // ── Delivery integration ────────────────────────────────────────────

    struct Endpoint {
        bodies: Arc<Mutex<Vec<String>>>,
        statuses: Arc<Mutex<VecDeque<u16>>>,
        url: Url,
    }

    async fn start_endpoint() -> Endpoint {
        #[derive(Clone)]
        struct EndpointState {
            bodies: Arc<Mutex<Vec<String>>>,
            statuses: Arc<Mutex<VecDeque<u16>>>,
        }

        async fn hook(State(state): State<EndpointState>, body: String) -> (axum::http::StatusCode, &'static str) {
            state.bodies.lock().unwrap().push(body);
            let code = state
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(200);
            (axum::http::StatusCode::from_u16(code).unwrap(), "")
        }

        let state = EndpointState {
            bodies: Arc::new(Mutex::new(Vec::new())),
            statuses: Arc::new(Mutex::new(VecDeque::new())),
        };
        let bodies = state.bodies.clone();
        let statuses = state.statuses.clone();

        let app = Router::new().route("/hook", post(hook)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Endpoint {
            bodies,
            statuses,
            url: Url::parse(&format!("http://{addr}/hook")).unwrap(),
        }
    }

    fn test_settings(url: Url) -> WebhookSettings {
        WebhookSettings {
            token: "123:abc".to_string(),
            is_test_dc: false,
            tqueue_id: 123,
            url,
            max_connections: 4,
            secret_token: String::new(),
            cert_path: None,
            from_db: false,
            cached_ip_address: None,
            fix_ip_address: false,
            local_mode: true,
            max_update_body_size: 1 << 24,
            proxy: None,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    const NEVER: i32 = i32::MAX;

    #[tokio::test]
    async fn happy_path_delivers_and_acks() {
        let endpoint = start_endpoint().await;
        let tqueue = Arc::new(TQueue::new(None));
        tqueue
            .push(123, r#"{"message":{"x":1}}"#.to_string(), NEVER, 0)
            .unwrap();

        let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
        let handle = spawn(test_settings(endpoint.url.clone()), tqueue.clone(), upcall_tx);

        assert!(
            wait_until(|| endpoint.bodies.lock().unwrap().len() == 1, Duration::from_secs(5)).await
        );
        let body = endpoint.bodies.lock().unwrap()[0].clone();
        assert!(body.starts_with(r#"{"update_id":1,"#), "body: {body}");

        // Ack: the queue head moved past the delivered event.
        assert!(
            wait_until(|| tqueue.head(123).value() == 2, Duration::from_secs(2)).await
        );

        // Verification must have been reported along the way.
        let mut saw_verified = false;
        while let Ok(Some(upcall)) =
            tokio::time::timeout(Duration::from_millis(200), upcall_rx.recv()).await
        {
            if matches!(upcall, WebhookUpcall::Verified { .. }) {
                saw_verified = true;
                break;
            }
        }
        assert!(saw_verified, "expected a Verified upcall");
        handle.close();
    }

    #[tokio::test]
    async fn retry_until_success() {
        let endpoint = start_endpoint().await;
        endpoint.statuses.lock().unwrap().extend([500u16, 500]);

        let tqueue = Arc::new(TQueue::new(None));
        tqueue
            .push(123, r#"{"message":{"n":1}}"#.to_string(), NEVER, 0)
            .unwrap();

        let (upcall_tx, _upcall_rx) = mpsc::unbounded_channel();
        let handle = spawn(test_settings(endpoint.url.clone()), tqueue.clone(), upcall_tx);

        // 500, 500, then 200: three POSTs total, then the event is acked.
        assert!(
            wait_until(|| endpoint.bodies.lock().unwrap().len() == 3, Duration::from_secs(15)).await,
            "expected three delivery attempts, saw {}",
            endpoint.bodies.lock().unwrap().len()
        );
        assert!(wait_until(|| tqueue.head(123).value() == 2, Duration::from_secs(2)).await);

        // All three attempts carried the same update.
        let bodies = endpoint.bodies.lock().unwrap();
        assert!(bodies.iter().all(|b| b.starts_with(r#"{"update_id":1,"#)));
        handle.close();
    }

    #[tokio::test]
    async fn per_conversation_order_is_preserved() {
        let endpoint = start_endpoint().await;
        let tqueue = Arc::new(TQueue::new(None));
        for i in 1..=5 {
            tqueue
                .push(123, format!(r#"{{"message":{{"n":{i}}}}}"#), NEVER, 777)
                .unwrap();
        }

        let (upcall_tx, _upcall_rx) = mpsc::unbounded_channel();
        let handle = spawn(test_settings(endpoint.url.clone()), tqueue.clone(), upcall_tx);

        assert!(
            wait_until(|| endpoint.bodies.lock().unwrap().len() == 5, Duration::from_secs(10)).await
        );
        let bodies = endpoint.bodies.lock().unwrap();
        let ids: Vec<i64> = bodies
            .iter()
            .map(|b| {
                serde_json::from_str::<serde_json::Value>(b).unwrap()["update_id"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "same-conversation updates arrived out of order");
        handle.close();
    }

    #[tokio::test]
    async fn expired_update_is_dropped_not_retried() {
        let endpoint = start_endpoint().await;
        // Permanent failure.
        endpoint.statuses.lock().unwrap().extend([500u16; 20]);

        let tqueue = Arc::new(TQueue::new(None));
        // Expires in two seconds: an early retry decision must drop it
        // instead of backing off past the expiry.
        tqueue
            .push(
                123,
                r#"{"message":{"n":1}}"#.to_string(),
                clock::unix_time() + 2,
                0,
            )
            .unwrap();

        let (upcall_tx, _upcall_rx) = mpsc::unbounded_channel();
        let handle = spawn(test_settings(endpoint.url.clone()), tqueue.clone(), upcall_tx);

        assert!(
            wait_until(|| tqueue.head(123).value() == 2, Duration::from_secs(15)).await,
            "expired event should be forgotten"
        );
        // Only the first few attempts fit before expiry.
        let attempts = endpoint.bodies.lock().unwrap().len();
        assert!((1..=4).contains(&attempts), "saw {attempts} attempts");
        handle.close();
    }

    #[tokio::test]
    async fn answer_via_webhook_reenters_query() {
        async fn hook() -> ([(&'static str, &'static str); 1], &'static str) {
            (
                [("Content-Type", "application/json")],
                r#"{"method":"sendMessage","chat_id":9,"text":"pong"}"#,
            )
        }
        let app = Router::new().route("/hook", post(hook));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = Url::parse(&format!("http://{addr}/hook")).unwrap();

        let tqueue = Arc::new(TQueue::new(None));
        tqueue
            .push(123, r#"{"message":{"n":1}}"#.to_string(), NEVER, 0)
            .unwrap();

        let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
        let handle = spawn(test_settings(url), tqueue.clone(), upcall_tx);

        let mut saw_send = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(5), upcall_rx.recv()).await {
                Ok(Some(WebhookUpcall::Send(query))) => {
                    assert_eq!(query.method, "sendmessage");
                    assert_eq!(query.arg("chat_id"), Some("9"));
                    saw_send = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_send, "expected a Send upcall from the webhook response");
        handle.close();
    }

    #[tokio::test]
    async fn verification_failure_reports_closed() {
        // A URL whose host cannot resolve: verification must fail and the
        // actor must close with the error.
        let url = Url::parse("https://nonexistent.invalid/hook").unwrap();
        let mut settings = test_settings(url);
        settings.local_mode = true;

        let tqueue = Arc::new(TQueue::new(None));
        let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
        let _handle = spawn(settings, tqueue, upcall_tx);

        match tokio::time::timeout(Duration::from_secs(20), upcall_rx.recv()).await {
            Ok(Some(WebhookUpcall::Closed {
                reason: WebhookClosedReason::Failed(description),
            })) => {
                assert!(!description.is_empty());
            }
            other => panic!("expected Closed(Failed), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_https_public_webhook_is_rejected() {
        let url = Url::parse("http://example.com/hook").unwrap();
        let mut settings = test_settings(url);
        settings.local_mode = false;

        let tqueue = Arc::new(TQueue::new(None));
        let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
        let _handle = spawn(settings, tqueue, upcall_tx);

        match tokio::time::timeout(Duration::from_secs(5), upcall_rx.recv()).await {
            Ok(Some(WebhookUpcall::Closed {
                reason: WebhookClosedReason::Failed(description),
            })) => {
                assert!(description.contains("HTTPS"));
            }
            other => panic!("expected Closed(Failed), got {other:?}"),
        }
    }
}

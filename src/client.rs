// src/client.rs
//
// Per-bot client actor.
//
// One task per bot token.  It owns everything bot-scoped: the upstream
// session and its event stream, the request queue that buffers commands
// until authorization completes, entity caches, the send pipeline, the
// long-poll waiter and the webhook lifecycle.  Updates coming from upstream
// are filtered by the allowed-updates mask, serialized once and appended to
// the bot's queue, then the configured delivery path (webhook actor or a
// parked long poll) is nudged.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock;
use crate::error::ApiError;
use crate::params::SharedParams;
use crate::query::Query;
use crate::stats::{BotStats, SharedBotInfo, StatEvent};
use crate::tqueue::{EventId, MAX_EVENT_ID};
use crate::updates::{
    encode_update_json, mask_update_id, parse_allowed_updates, UpdateType,
    DEFAULT_ALLOWED_UPDATE_TYPES,
};
use crate::upstream::{BotUser, UpstreamEvent, UpstreamSession};
use crate::webhook::{
    self, WebhookClosedReason, WebhookHandle, WebhookSettings, WebhookUpcall,
};
use crate::webhook_db::{registry_key, WebhookDescriptor};

// ─── Constants ──────────────────────────────────────────────────────────────

pub const MAX_CONCURRENTLY_SENT_CHAT_MESSAGES: i32 = 310;

const LONG_POLL_MAX_TIMEOUT: i64 = 50;
const LONG_POLL_MAX_LIMIT: i64 = 100;
/// Coalescing window: wait a moment after the first event so a burst
/// becomes a single long-poll response.
const LONG_POLL_WAIT_AFTER: Duration = Duration::from_millis(1);
const LONG_POLL_MAX_DELAY: Duration = Duration::from_millis(2);

const DEFAULT_UPDATE_TIMEOUT: i32 = 86400;

// ─── Public surface ─────────────────────────────────────────────────────────

pub enum ClientCmd {
    Query(Box<Query>),
    Close,
}

#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientCmd>,
}

impl ClientHandle {
    /// Forward a query; a closed actor answers it with 429 via promise drop.
    pub fn send(&self, query: Box<Query>) {
        let _ = self.tx.send(ClientCmd::Query(query));
    }

    pub fn close(&self) {
        let _ = self.tx.send(ClientCmd::Close);
    }
}

/// `hangup_tx` receives the bot's routing key once the actor is gone.
pub fn spawn_client(
    params: Arc<SharedParams>,
    token: String,
    is_test_dc: bool,
    tqueue_id: i64,
    stats: Arc<BotStats>,
    bot_info: SharedBotInfo,
    hangup_tx: mpsc::UnboundedSender<String>,
) -> ClientHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (session, upstream_rx) = params.connector.connect(&token, is_test_dc);
        let actor = ClientActor::new(
            params,
            token,
            is_test_dc,
            tqueue_id,
            stats,
            bot_info,
            session,
            upstream_rx,
            hangup_tx,
        );
        actor.run(rx).await;
    });
    ClientHandle { tx }
}

// ─── Entity caches ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessRights {
    Read,
    ReadMembers,
    Edit,
    Write,
}

struct ChatInfo {
    value: Value,
    access: AccessRights,
}

// ─── Send pipeline ──────────────────────────────────────────────────────────

struct PendingSend {
    query: Box<Query>,
    awaited: usize,
    messages: Vec<Value>,
    error: Option<ApiError>,
    is_group: bool,
}

// ─── Bot username resolution ────────────────────────────────────────────────

struct ParkedResolveQuery {
    query: Box<Query>,
    remaining: usize,
    failed: bool,
}

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum AuthState {
    WaitingAuth,
    Ready,
    Closing,
}

struct ActiveWebhook {
    handle: WebhookHandle,
    url: String,
    max_connections: i32,
    ip_address: String,
    has_certificate: bool,
}

enum Wake {
    Cmd(Option<ClientCmd>),
    Upstream(Option<UpstreamEvent>),
    Upcall(WebhookUpcall),
    UpcallChannelClosed,
    LongPollTimer,
}

struct ClientActor {
    params: Arc<SharedParams>,
    token: String,
    token_with_dc: String,
    is_test_dc: bool,
    tqueue_id: i64,
    stats: Arc<BotStats>,
    bot_info: SharedBotInfo,
    session: Arc<dyn UpstreamSession>,
    upstream_rx: mpsc::UnboundedReceiver<UpstreamEvent>,
    hangup_tx: mpsc::UnboundedSender<String>,

    state: AuthState,
    done: bool,
    bot_user: Option<BotUser>,
    cmd_queue: VecDeque<Box<Query>>,

    users: HashMap<i64, Value>,
    chats: HashMap<i64, ChatInfo>,

    allowed_update_types: u32,

    // Long poll.
    long_poll_query: Option<Box<Query>>,
    long_poll_offset: i32,
    long_poll_limit: usize,
    long_poll_hard_deadline: Option<Instant>,
    long_poll_wake_deadline: Option<Instant>,
    long_poll_first_event_time: Option<Instant>,

    // Webhook.
    webhook: Option<ActiveWebhook>,
    webhook_upcall_rx: Option<mpsc::UnboundedReceiver<WebhookUpcall>>,
    pending_set_webhook: Option<Box<Query>>,
    pending_descriptor: Option<WebhookDescriptor>,
    last_webhook_error: Option<(i32, String)>,
    next_set_webhook_time: f64,

    // Send pipeline.
    next_send_query_id: u64,
    pending_sends: HashMap<u64, PendingSend>,
    pending_message_to_query: HashMap<i64, u64>,
    yet_unsent_per_chat: HashMap<i64, i32>,
    parked_sends: HashMap<i64, VecDeque<Box<Query>>>,

    // Bot username resolution.  Unresolved usernames get a temporary user
    // id; the parked queries waiting on it are keyed by that id.
    next_temp_bot_id: i64,
    temp_bot_ids: HashMap<String, i64>,
    pending_resolves: HashMap<i64, Vec<u64>>,
    parked_resolve_queries: HashMap<u64, ParkedResolveQuery>,
    resolved_bots: HashMap<String, Option<i64>>,
}

impl ClientActor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        params: Arc<SharedParams>,
        token: String,
        is_test_dc: bool,
        tqueue_id: i64,
        stats: Arc<BotStats>,
        bot_info: SharedBotInfo,
        session: Arc<dyn UpstreamSession>,
        upstream_rx: mpsc::UnboundedReceiver<UpstreamEvent>,
        hangup_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let token_with_dc = if is_test_dc {
            format!("{token}/test")
        } else {
            token.clone()
        };
        Self {
            params,
            token,
            token_with_dc,
            is_test_dc,
            tqueue_id,
            stats,
            bot_info,
            session,
            upstream_rx,
            hangup_tx,
            state: AuthState::WaitingAuth,
            done: false,
            bot_user: None,
            cmd_queue: VecDeque::new(),
            users: HashMap::new(),
            chats: HashMap::new(),
            allowed_update_types: DEFAULT_ALLOWED_UPDATE_TYPES,
            long_poll_query: None,
            long_poll_offset: 0,
            long_poll_limit: LONG_POLL_MAX_LIMIT as usize,
            long_poll_hard_deadline: None,
            long_poll_wake_deadline: None,
            long_poll_first_event_time: None,
            webhook: None,
            webhook_upcall_rx: None,
            pending_set_webhook: None,
            pending_descriptor: None,
            last_webhook_error: None,
            next_set_webhook_time: 0.0,
            next_send_query_id: 1,
            pending_sends: HashMap::new(),
            pending_message_to_query: HashMap::new(),
            yet_unsent_per_chat: HashMap::new(),
            parked_sends: HashMap::new(),
            next_temp_bot_id: 1,
            temp_bot_ids: HashMap::new(),
            pending_resolves: HashMap::new(),
            parked_resolve_queries: HashMap::new(),
            resolved_bots: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ClientCmd>) {
        info!(token_id = self.tqueue_id, "bot client started");
        {
            let mut bot_info = self.bot_info.lock().unwrap();
            bot_info.token = self.token.clone();
            bot_info.start_time = clock::monotonic_now();
        }

        while !self.done {
            let long_poll_deadline = match (self.long_poll_wake_deadline, self.long_poll_hard_deadline)
            {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep_until = long_poll_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let upstream_rx = &mut self.upstream_rx;
            let upcall_rx = &mut self.webhook_upcall_rx;
            let wake = tokio::select! {
                cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                event = upstream_rx.recv() => Wake::Upstream(event),
                upcall = async {
                    match upcall_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => futures::future::pending().await,
                    }
                } => match upcall {
                    Some(upcall) => Wake::Upcall(upcall),
                    None => Wake::UpcallChannelClosed,
                },
                _ = tokio::time::sleep_until(sleep_until), if long_poll_deadline.is_some() => {
                    Wake::LongPollTimer
                }
            };

            match wake {
                Wake::Cmd(Some(ClientCmd::Query(query))) => self.on_query(query).await,
                Wake::Cmd(Some(ClientCmd::Close)) => self.start_close(false).await,
                Wake::Cmd(None) => break,
                Wake::Upstream(Some(event)) => self.on_upstream_event(event).await,
                Wake::Upstream(None) => break,
                Wake::Upcall(upcall) => self.on_webhook_upcall(upcall).await,
                Wake::UpcallChannelClosed => self.webhook_upcall_rx = None,
                Wake::LongPollTimer => self.on_long_poll_timer(),
            }
        }

        if let Some(webhook) = self.webhook.take() {
            webhook.handle.close();
        }
        self.abort_long_poll(false);
        info!(token_id = self.tqueue_id, "bot client stopped");
        let _ = self.hangup_tx.send(self.token_with_dc.clone());
    }

    // ── Query intake ────────────────────────────────────────────────────

    async fn on_query(&mut self, mut query: Box<Query>) {
        if !query.is_internal {
            self.stats.add_event(
                StatEvent::Request {
                    size: query.body_size,
                    file_count: query.files.len() as u64,
                    files_size: query.files_total_size(),
                },
                clock::monotonic_now(),
            );
        }

        match self.state {
            AuthState::Closing => {
                self.respond(&mut query, Err(ApiError::retry_after(1)));
            }
            AuthState::WaitingAuth => {
                self.cmd_queue.push_back(query);
            }
            AuthState::Ready => {
                self.dispatch_query(query).await;
            }
        }
    }

    fn respond(&self, query: &mut Query, result: Result<Value, ApiError>) {
        let (ok, response_size) = match &result {
            Ok(value) => (true, value.to_string().len() as u64),
            Err(err) => (false, err.description.len() as u64),
        };
        match result {
            Ok(value) => query.answer_ok(value),
            Err(err) => query.answer_error(err),
        }
        if !query.is_internal {
            self.stats.add_event(
                StatEvent::Response {
                    ok,
                    size: response_size,
                    file_count: query.files.len() as u64,
                    files_size: query.files_total_size(),
                },
                clock::monotonic_now(),
            );
        }
    }

    async fn dispatch_query(&mut self, mut query: Box<Query>) {
        debug!(method = %query.method, "dispatching query");
        match query.method.as_str() {
            "getme" => {
                let result = self
                    .bot_user
                    .as_ref()
                    .map(|user| user.to_json())
                    .ok_or_else(|| ApiError::unauthorized("bot is not initialized yet"));
                self.respond(&mut query, result);
            }
            "getupdates" => self.handle_get_updates(query),
            "getchat" => self.handle_get_chat(query),
            "setwebhook" => self.handle_set_webhook(query).await,
            "deletewebhook" => self.handle_delete_webhook(query).await,
            "getwebhookinfo" => self.handle_get_webhook_info(query),
            "sendmessage" => self.handle_send_message(query).await,
            "sendmediagroup" => self.handle_send_media_group(query).await,
            "close" => {
                self.respond(&mut query, Ok(json!(true)));
                self.start_close(false).await;
            }
            "logout" => {
                self.respond(&mut query, Ok(json!(true)));
                self.start_close(true).await;
            }
            _ => self.forward_to_upstream(query),
        }
    }

    /// Served from the entity caches when possible; cache misses go
    /// upstream and the answer is written through on the way back (via
    /// `ChatUpdated`/`UserUpdated` events).
    fn handle_get_chat(&mut self, mut query: Box<Query>) {
        match query.int_arg("chat_id") {
            Ok(Some(chat_id)) => {
                if let Some(info) = self.chats.get(&chat_id) {
                    let value = info.value.clone();
                    self.respond(&mut query, Ok(value));
                } else if let Some(user) = self.users.get(&chat_id) {
                    let value = user.clone();
                    self.respond(&mut query, Ok(value));
                } else {
                    self.forward_to_upstream(query);
                }
            }
            Ok(None) => self.respond(&mut query, Err(ApiError::bad_request("chat_id is empty"))),
            Err(e) => self.respond(&mut query, Err(e)),
        }
    }

    /// Generic method marshalling: upstream answers, errors pass through.
    /// The response is emitted out of band, so only within-category ordering
    /// is preserved for these.
    fn forward_to_upstream(&self, query: Box<Query>) {
        let session = self.session.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut query = query;
            let result = session.call(&query.method, &query.args).await;
            let (ok, size) = match &result {
                Ok(value) => (true, value.to_string().len() as u64),
                Err(_) => (false, 0),
            };
            match result {
                Ok(value) => query.answer_ok(value),
                Err(error) => query.answer_error(error.to_api_error()),
            }
            if !query.is_internal {
                stats.add_event(
                    StatEvent::Response {
                        ok,
                        size,
                        file_count: query.files.len() as u64,
                        files_size: query.files_total_size(),
                    },
                    clock::monotonic_now(),
                );
            }
        });
    }

    // ── Upstream events ─────────────────────────────────────────────────

    async fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Authorized(user) => {
                info!(bot_id = user.id, username = %user.username, "bot authorized");
                {
                    let mut bot_info = self.bot_info.lock().unwrap();
                    bot_info.id = user.id;
                    bot_info.username = user.username.clone();
                }
                self.bot_user = Some(user);
                self.state = AuthState::Ready;
                while let Some(query) = self.cmd_queue.pop_front() {
                    self.dispatch_query(query).await;
                }
            }
            UpstreamEvent::AuthorizationFailed(description) => {
                warn!(token_id = self.tqueue_id, "authorization failed: {description}");
                while let Some(mut query) = self.cmd_queue.pop_front() {
                    self.respond(&mut query, Err(ApiError::unauthorized(&description)));
                }
                self.done = true;
            }
            UpstreamEvent::Closed => {
                self.done = true;
            }
            UpstreamEvent::Update {
                kind,
                queue_id,
                timeout,
                payload,
            } => self.add_update(kind, queue_id, timeout, payload),
            UpstreamEvent::MessageSent {
                pending_id,
                chat_id,
                message,
            } => self.on_message_sent(pending_id, chat_id, Ok(message)).await,
            UpstreamEvent::MessageSendFailed {
                pending_id,
                chat_id,
                error,
            } => {
                self.on_message_sent(pending_id, chat_id, Err(error.to_api_error()))
                    .await
            }
            UpstreamEvent::BotResolved { username, user } => {
                self.on_bot_resolved(username, user).await
            }
            UpstreamEvent::UserUpdated { user } => {
                if let Some(id) = user.get("id").and_then(Value::as_i64) {
                    self.users.insert(id, user);
                }
            }
            UpstreamEvent::ChatUpdated { chat } => {
                if let Some(id) = chat.get("id").and_then(Value::as_i64) {
                    let access = access_rights_from_chat(&chat);
                    self.chats.insert(id, ChatInfo { value: chat, access });
                }
            }
        }
    }

    // ── Update emission ─────────────────────────────────────────────────

    fn add_update(&mut self, kind: UpdateType, queue_id: i64, timeout: i32, payload: Value) {
        if self.allowed_update_types & kind.bit() == 0 {
            return;
        }
        let json = format!("{{\"{}\":{}}}", kind.as_str(), payload);
        let timeout = if timeout > 0 {
            timeout
        } else {
            DEFAULT_UPDATE_TIMEOUT
        };
        let expires_at = clock::unix_time().saturating_add(timeout);
        match self
            .params
            .tqueue
            .push(self.tqueue_id, json, expires_at, queue_id)
        {
            Ok(event_id) => {
                self.stats
                    .add_event(StatEvent::Update, clock::monotonic_now());
                self.update_bot_info_queue();
                debug!(event_id = %event_id, kind = kind.as_str(), "update queued");
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "dropping update");
                return;
            }
        }

        if let Some(webhook) = &self.webhook {
            webhook.handle.notify_new_updates();
        } else if self.long_poll_query.is_some() {
            let now = Instant::now();
            match self.long_poll_first_event_time {
                None => {
                    self.long_poll_first_event_time = Some(now);
                    self.long_poll_wake_deadline = Some(now + LONG_POLL_WAIT_AFTER);
                }
                Some(first) => {
                    let wake = (now + LONG_POLL_WAIT_AFTER).min(first + LONG_POLL_MAX_DELAY);
                    self.long_poll_wake_deadline = Some(wake);
                }
            }
        }
    }

    fn update_bot_info_queue(&self) {
        let head = self.params.tqueue.head(self.tqueue_id);
        let tail = self.params.tqueue.tail(self.tqueue_id);
        let mut bot_info = self.bot_info.lock().unwrap();
        bot_info.head_update_id = mask_update_id(head.value() as i64);
        bot_info.tail_update_id = mask_update_id(tail.value() as i64);
        bot_info.pending_update_count = self.pending_update_count();
    }

    fn pending_update_count(&self) -> usize {
        let head = self.params.tqueue.head(self.tqueue_id);
        if head.is_empty() {
            return 0;
        }
        let mut out = Vec::new();
        self.params
            .tqueue
            .get(self.tqueue_id, head, false, clock::unix_time(), 0, &mut out)
    }

    // ── Long poll ───────────────────────────────────────────────────────

    fn handle_get_updates(&mut self, mut query: Box<Query>) {
        if self.webhook.is_some() || self.pending_set_webhook.is_some() {
            self.respond(
                &mut query,
                Err(ApiError::conflict(
                    "can't use getUpdates method while webhook is active; use deleteWebhook to delete the webhook first",
                )),
            );
            return;
        }

        let offset = match query.int_arg("offset") {
            Ok(offset) => offset,
            Err(e) => return self.respond(&mut query, Err(e)),
        };
        let limit = match query.int_arg("limit") {
            Ok(limit) => limit.unwrap_or(LONG_POLL_MAX_LIMIT).clamp(1, LONG_POLL_MAX_LIMIT),
            Err(e) => return self.respond(&mut query, Err(e)),
        };
        let timeout = match query.int_arg("timeout") {
            Ok(timeout) => timeout.unwrap_or(0).clamp(0, LONG_POLL_MAX_TIMEOUT),
            Err(e) => return self.respond(&mut query, Err(e)),
        };
        if let Some(allowed) = query.arg("allowed_updates") {
            self.allowed_update_types = parse_allowed_updates(allowed, query.is_internal);
        }

        // Resolve the effective offset before conflict handling so the
        // acknowledgement comparison below sees the new position.
        let new_offset = match offset {
            Some(offset) if offset >= 0 => Some(mask_update_id(offset)),
            Some(offset) => {
                // Negative: seek that many updates back from the tail.
                let tail = self.params.tqueue.tail(self.tqueue_id).value() as i64;
                let head = self.params.tqueue.head(self.tqueue_id).value() as i64;
                Some(mask_update_id((tail + offset).max(head)))
            }
            None => None,
        };

        if let Some(mut old) = self.long_poll_query.take() {
            // A second concurrent getUpdates terminates the parked one.  If
            // the newcomer acknowledges events the old poll was positioned
            // on, the old caller must learn it lost them.
            let acknowledged = new_offset.map(|o| o > self.long_poll_offset).unwrap_or(false);
            if acknowledged {
                self.respond(
                    &mut old,
                    Err(ApiError::conflict(
                        "terminated by other getUpdates request",
                    )),
                );
            } else {
                self.respond(&mut old, Ok(json!([])));
            }
            self.clear_long_poll_timers();
        }
        if let Some(new_offset) = new_offset {
            self.long_poll_offset = new_offset;
        }
        self.long_poll_limit = limit as usize;

        let updates = self.collect_updates(true);
        if !updates.is_empty() || timeout == 0 {
            self.respond(&mut query, Ok(Value::Array(updates)));
            self.update_bot_info_queue();
            return;
        }

        self.long_poll_query = Some(query);
        self.long_poll_hard_deadline =
            Some(Instant::now() + Duration::from_secs(timeout as u64));
    }

    /// Fetch up to the parked limit from the queue position; with
    /// `acknowledge`, events before the offset are confirmed and forgotten.
    fn collect_updates(&mut self, acknowledge: bool) -> Vec<Value> {
        let from = EventId::new(self.long_poll_offset.clamp(1, MAX_EVENT_ID - 1))
            .expect("clamped offset is always a valid event id");
        let mut events = Vec::new();
        self.params.tqueue.get(
            self.tqueue_id,
            from,
            acknowledge,
            clock::unix_time(),
            self.long_poll_limit,
            &mut events,
        );
        events
            .iter()
            .filter_map(|event| {
                serde_json::from_str(&encode_update_json(event.id.value(), &event.payload)).ok()
            })
            .collect()
    }

    fn on_long_poll_timer(&mut self) {
        let now = Instant::now();
        let wake_due = self
            .long_poll_wake_deadline
            .map(|d| d <= now)
            .unwrap_or(false);
        let hard_due = self
            .long_poll_hard_deadline
            .map(|d| d <= now)
            .unwrap_or(false);
        if !wake_due && !hard_due {
            return;
        }

        let updates = self.collect_updates(false);
        if updates.is_empty() && !hard_due {
            // Spurious wake: the freshly pushed events were filtered or
            // expired.  Keep waiting.
            self.long_poll_wake_deadline = None;
            self.long_poll_first_event_time = None;
            return;
        }
        if let Some(mut query) = self.long_poll_query.take() {
            self.respond(&mut query, Ok(Value::Array(updates)));
        }
        self.clear_long_poll_timers();
    }

    fn clear_long_poll_timers(&mut self) {
        self.long_poll_hard_deadline = None;
        self.long_poll_wake_deadline = None;
        self.long_poll_first_event_time = None;
    }

    /// Terminate a parked poll, e.g. when a webhook takes over.
    fn abort_long_poll(&mut self, _from_set_webhook: bool) {
        if let Some(mut query) = self.long_poll_query.take() {
            self.respond(&mut query, Ok(json!([])));
        }
        self.clear_long_poll_timers();
    }

    // ── Webhook lifecycle ───────────────────────────────────────────────

    async fn handle_set_webhook(&mut self, mut query: Box<Query>) {
        let now = clock::monotonic_now();
        if !query.is_internal && now < self.next_set_webhook_time {
            let retry_after = (self.next_set_webhook_time - now).ceil().max(1.0) as u64;
            self.respond(&mut query, Err(ApiError::retry_after(retry_after)));
            return;
        }

        let url = query.arg_or("url", "").to_string();
        if query.bool_arg("drop_pending_updates") {
            let dropped = self.params.tqueue.clear(self.tqueue_id);
            debug!(dropped, "dropped pending updates");
        }
        if url.is_empty() {
            // setWebhook with an empty URL is deleteWebhook.
            self.abort_long_poll(true);
            self.remove_webhook();
            self.next_set_webhook_time = clock::monotonic_now() + 1.0;
            self.respond(&mut query, Ok(json!(true)));
            return;
        }

        let parsed = match Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.respond(&mut query, Err(ApiError::bad_request("invalid webhook URL specified")));
                return;
            }
        };
        match parsed.scheme() {
            "https" => {}
            "http" if self.params.local_mode => {}
            _ => {
                self.respond(
                    &mut query,
                    Err(ApiError::bad_request("an HTTPS URL must be provided for webhook")),
                );
                return;
            }
        }
        let port = parsed.port_or_known_default().unwrap_or(443);
        if !self.params.local_mode && !webhook::is_allowed_webhook_port(port) {
            self.respond(
                &mut query,
                Err(ApiError::bad_request(
                    "bad webhook: Webhook can be set up only on ports 80, 88, 443 or 8443",
                )),
            );
            return;
        }

        let max_connections = match query.int_arg("max_connections") {
            Ok(max_connections) => (max_connections
                .unwrap_or(self.params.default_max_webhook_connections as i64)
                as i32)
                .clamp(1, self.params.max_webhook_connections_limit),
            Err(e) => return self.respond(&mut query, Err(e)),
        };

        let secret_token = query.arg_or("secret_token", "").to_string();
        if !secret_token.is_empty() {
            let valid_len = (1..=256).contains(&secret_token.len());
            let valid_chars = secret_token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
            if !valid_len || !valid_chars {
                self.respond(
                    &mut query,
                    Err(ApiError::bad_request("invalid secret token specified")),
                );
                return;
            }
        }

        let cached_ip_address = query
            .arg("ip_address")
            .and_then(|raw| raw.parse::<std::net::IpAddr>().ok());
        let fix_ip_address = query.bool_arg("fix_ip_address");

        let cert_path = self.webhook_certificate_path();
        let cert_path = if let Some(file) = query.file("certificate") {
            if let Err(e) = std::fs::copy(&file.path, &cert_path) {
                warn!(error = %e, "failed to store webhook certificate");
                self.respond(&mut query, Err(ApiError::bad_request("invalid certificate specified")));
                return;
            }
            Some(cert_path)
        } else if query.is_internal
            && query.arg("certificate") == Some("previous")
            && cert_path.exists()
        {
            // Startup replay of a persisted descriptor reuses the stored
            // certificate; external callers must upload one.
            Some(cert_path)
        } else {
            None
        };

        if let Some(allowed) = query.arg("allowed_updates") {
            self.allowed_update_types = parse_allowed_updates(allowed, query.is_internal);
        }

        // A webhook replaces any parked long poll and any previous webhook.
        self.abort_long_poll(true);
        self.remove_webhook_actor();
        if let Some(mut old) = self.pending_set_webhook.take() {
            self.respond(&mut old, Err(ApiError::retry_after(1)));
        }

        let settings = WebhookSettings {
            token: self.token.clone(),
            is_test_dc: self.is_test_dc,
            tqueue_id: self.tqueue_id,
            url: parsed,
            max_connections,
            secret_token: secret_token.clone(),
            cert_path: cert_path.clone(),
            from_db: query.is_internal,
            cached_ip_address,
            fix_ip_address,
            local_mode: self.params.local_mode,
            max_update_body_size: self.params.max_update_body_size,
            proxy: self.params.webhook_proxy.clone(),
        };
        let (upcall_tx, upcall_rx) = mpsc::unbounded_channel();
        let handle = webhook::spawn(settings, self.params.tqueue.clone(), upcall_tx);

        self.webhook = Some(ActiveWebhook {
            handle,
            url: url.clone(),
            max_connections,
            ip_address: cached_ip_address.map(|ip| ip.to_string()).unwrap_or_default(),
            has_certificate: cert_path.is_some(),
        });
        self.webhook_upcall_rx = Some(upcall_rx);
        self.pending_descriptor = Some(WebhookDescriptor {
            url,
            has_certificate: self.webhook.as_ref().unwrap().has_certificate,
            max_connections: Some(max_connections),
            ip_address: None,
            fix_ip_address,
            secret_token: (!secret_token.is_empty()).then_some(secret_token),
            allowed_updates: Some(self.allowed_update_types),
        });
        self.pending_set_webhook = Some(query);
        self.next_set_webhook_time = clock::monotonic_now() + 1.0;
    }

    fn webhook_certificate_path(&self) -> PathBuf {
        self.params
            .working_directory
            .join(format!("cert_{}.pem", self.tqueue_id))
    }

    async fn handle_delete_webhook(&mut self, mut query: Box<Query>) {
        let now = clock::monotonic_now();
        if !query.is_internal && now < self.next_set_webhook_time {
            let retry_after = (self.next_set_webhook_time - now).ceil().max(1.0) as u64;
            self.respond(&mut query, Err(ApiError::retry_after(retry_after)));
            return;
        }
        if query.bool_arg("drop_pending_updates") {
            self.params.tqueue.clear(self.tqueue_id);
        }
        self.abort_long_poll(false);
        self.remove_webhook();
        self.next_set_webhook_time = clock::monotonic_now() + 1.0;
        self.respond(&mut query, Ok(json!(true)));
    }

    fn remove_webhook_actor(&mut self) {
        if let Some(webhook) = self.webhook.take() {
            webhook.handle.close();
        }
        self.webhook_upcall_rx = None;
        self.pending_descriptor = None;
    }

    fn remove_webhook(&mut self) {
        self.remove_webhook_actor();
        self.params
            .webhook_db
            .erase(&registry_key(&self.token, self.is_test_dc));
        self.last_webhook_error = None;
        let mut bot_info = self.bot_info.lock().unwrap();
        bot_info.webhook_url.clear();
        bot_info.has_webhook_certificate = false;
    }

    fn handle_get_webhook_info(&mut self, mut query: Box<Query>) {
        let mut info = json!({
            "url": "",
            "has_custom_certificate": false,
            "pending_update_count": self.pending_update_count(),
        });
        if let Some(webhook) = &self.webhook {
            info["url"] = json!(webhook.url);
            info["has_custom_certificate"] = json!(webhook.has_certificate);
            info["max_connections"] = json!(webhook.max_connections);
            if !webhook.ip_address.is_empty() {
                info["ip_address"] = json!(webhook.ip_address);
            }
        }
        if let Some((date, message)) = &self.last_webhook_error {
            info["last_error_date"] = json!(date);
            info["last_error_message"] = json!(message);
        }
        if self.allowed_update_types != DEFAULT_ALLOWED_UPDATE_TYPES {
            info["allowed_updates"] =
                json!(crate::updates::allowed_update_names(self.allowed_update_types));
        }
        self.respond(&mut query, Ok(info));
    }

    async fn on_webhook_upcall(&mut self, upcall: WebhookUpcall) {
        match upcall {
            WebhookUpcall::Verified { ip_address } => {
                if let Some(webhook) = &mut self.webhook {
                    if !ip_address.is_empty() {
                        webhook.ip_address = ip_address.clone();
                    }
                    let mut bot_info = self.bot_info.lock().unwrap();
                    bot_info.webhook_url = webhook.url.clone();
                    bot_info.has_webhook_certificate = webhook.has_certificate;
                    bot_info.webhook_max_connections = webhook.max_connections;
                }
                if let Some(mut descriptor) = self.pending_descriptor.take() {
                    if !ip_address.is_empty() {
                        descriptor.ip_address = Some(ip_address);
                    }
                    self.params.webhook_db.set(
                        &registry_key(&self.token, self.is_test_dc),
                        &descriptor.encode(),
                    );
                }
                if let Some(mut query) = self.pending_set_webhook.take() {
                    self.respond(&mut query, Ok(json!(true)));
                }
            }
            WebhookUpcall::Success => {
                self.last_webhook_error = None;
            }
            WebhookUpcall::Error { description } => {
                self.last_webhook_error = Some((clock::unix_time(), description));
            }
            WebhookUpcall::Closed { reason } => match reason {
                WebhookClosedReason::Graceful => {}
                WebhookClosedReason::Gone => {
                    warn!(token_id = self.tqueue_id, "webhook removed after persistent HTTP 410");
                    self.remove_webhook();
                }
                WebhookClosedReason::Failed(description) => {
                    self.webhook = None;
                    self.webhook_upcall_rx = None;
                    self.pending_descriptor = None;
                    if let Some(mut query) = self.pending_set_webhook.take() {
                        self.respond(
                            &mut query,
                            Err(ApiError::bad_request(format!("bad webhook: {description}"))),
                        );
                    }
                }
            },
            WebhookUpcall::Send(query) => {
                self.on_query(query).await;
            }
        }
    }

    // ── Send pipeline ───────────────────────────────────────────────────

    async fn handle_send_message(&mut self, mut query: Box<Query>) {
        let chat_id = match query.int_arg("chat_id") {
            Ok(Some(chat_id)) => chat_id,
            Ok(None) => return self.respond(&mut query, Err(ApiError::bad_request("chat_id is empty"))),
            Err(e) => return self.respond(&mut query, Err(e)),
        };
        if query.arg("text").map(str::trim).unwrap_or_default().is_empty() {
            return self.respond(&mut query, Err(ApiError::bad_request("message text is empty")));
        }
        if let Err(e) = self.check_access(chat_id, AccessRights::Write) {
            return self.respond(&mut query, Err(e));
        }
        if !self.ensure_bots_resolved(&mut query) {
            return;
        }
        if self.is_chat_send_saturated(chat_id, 1) {
            self.parked_sends.entry(chat_id).or_default().push_back(query);
            return;
        }

        let args = args_to_json(&query);
        match self.session.send_message(chat_id, args).await {
            Ok(pending_id) => {
                let query_id = self.next_send_query_id;
                self.next_send_query_id += 1;
                self.pending_message_to_query.insert(pending_id, query_id);
                *self.yet_unsent_per_chat.entry(chat_id).or_insert(0) += 1;
                self.pending_sends.insert(
                    query_id,
                    PendingSend {
                        query,
                        awaited: 1,
                        messages: Vec::new(),
                        error: None,
                        is_group: false,
                    },
                );
            }
            Err(error) => self.respond(&mut query, Err(error.to_api_error())),
        }
    }

    async fn handle_send_media_group(&mut self, mut query: Box<Query>) {
        let chat_id = match query.int_arg("chat_id") {
            Ok(Some(chat_id)) => chat_id,
            Ok(None) => return self.respond(&mut query, Err(ApiError::bad_request("chat_id is empty"))),
            Err(e) => return self.respond(&mut query, Err(e)),
        };
        let media_count = query
            .arg("media")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| value.as_array().map(Vec::len))
            .unwrap_or(0);
        if !(2..=10).contains(&media_count) {
            return self.respond(
                &mut query,
                Err(ApiError::bad_request("media group must include 2-10 items")),
            );
        }
        if let Err(e) = self.check_access(chat_id, AccessRights::Write) {
            return self.respond(&mut query, Err(e));
        }
        if self.is_chat_send_saturated(chat_id, media_count as i32) {
            self.parked_sends.entry(chat_id).or_default().push_back(query);
            return;
        }

        let args = args_to_json(&query);
        match self
            .session
            .send_media_group(chat_id, media_count, args)
            .await
        {
            Ok(pending_ids) => {
                let query_id = self.next_send_query_id;
                self.next_send_query_id += 1;
                let awaited = pending_ids.len();
                for pending_id in pending_ids {
                    self.pending_message_to_query.insert(pending_id, query_id);
                }
                *self.yet_unsent_per_chat.entry(chat_id).or_insert(0) += awaited as i32;
                self.pending_sends.insert(
                    query_id,
                    PendingSend {
                        query,
                        awaited,
                        messages: Vec::new(),
                        error: None,
                        is_group: true,
                    },
                );
            }
            Err(error) => self.respond(&mut query, Err(error.to_api_error())),
        }
    }

    fn is_chat_send_saturated(&self, chat_id: i64, additional: i32) -> bool {
        let outstanding = self.yet_unsent_per_chat.get(&chat_id).copied().unwrap_or(0);
        outstanding + additional > MAX_CONCURRENTLY_SENT_CHAT_MESSAGES
    }

    async fn on_message_sent(
        &mut self,
        pending_id: i64,
        chat_id: i64,
        result: Result<Value, ApiError>,
    ) {
        // The counter decrements regardless of outcome; parked sends are
        // admitted once capacity frees up.
        if let Some(count) = self.yet_unsent_per_chat.get_mut(&chat_id) {
            *count -= 1;
            if *count <= 0 {
                self.yet_unsent_per_chat.remove(&chat_id);
            }
        }

        let Some(query_id) = self.pending_message_to_query.remove(&pending_id) else {
            return;
        };
        let finished = if let Some(send) = self.pending_sends.get_mut(&query_id) {
            match result {
                Ok(message) => {
                    // Successful sends also teach us the chat exists.
                    if let Some(chat) = message.get("chat").cloned() {
                        self.chats.insert(
                            chat_id,
                            ChatInfo {
                                value: chat,
                                access: AccessRights::Write,
                            },
                        );
                    }
                    send.messages.push(message);
                }
                Err(error) => {
                    // The first failure wins; other messages of the same
                    // multi-send are discarded from the response.
                    if send.error.is_none() {
                        send.error = Some(error);
                    }
                }
            }
            send.awaited -= 1;
            send.awaited == 0
        } else {
            false
        };
        if finished {
            let mut send = self.pending_sends.remove(&query_id).unwrap();
            let result = match send.error.take() {
                Some(error) => Err(error),
                None if send.is_group => Ok(Value::Array(send.messages.drain(..).collect())),
                None => Ok(send.messages.pop().unwrap_or(Value::Null)),
            };
            self.respond(&mut send.query, result);
        }

        // Admit one parked send for this chat, if any.
        let next = self
            .parked_sends
            .get_mut(&chat_id)
            .and_then(|parked| parked.pop_front());
        if matches!(self.parked_sends.get(&chat_id), Some(parked) if parked.is_empty()) {
            self.parked_sends.remove(&chat_id);
        }
        if let Some(next) = next {
            self.dispatch_query(next).await;
        }
    }

    fn check_access(&self, chat_id: i64, required: AccessRights) -> Result<(), ApiError> {
        match self.chats.get(&chat_id) {
            Some(info) if info.access < required => {
                Err(ApiError::forbidden("bot is not a member of the chat"))
            }
            // Unknown chats are the upstream's call.
            _ => Ok(()),
        }
    }

    // ── Bot username resolution ─────────────────────────────────────────

    /// Returns false when the query was parked awaiting username
    /// resolution (or failed outright).
    fn ensure_bots_resolved(&mut self, query: &mut Box<Query>) -> bool {
        let Some(reply_markup) = query.arg("reply_markup") else {
            return true;
        };
        let usernames = collect_login_url_bot_usernames(reply_markup);
        if usernames.is_empty() {
            return true;
        }

        let mut unresolved = Vec::new();
        for username in &usernames {
            match self.resolved_bots.get(username) {
                Some(Some(_id)) => {}
                Some(None) => {
                    self.respond(query, Err(ApiError::bad_request("bot not found")));
                    return false;
                }
                None => unresolved.push(username.clone()),
            }
        }
        if unresolved.is_empty() {
            return true;
        }

        // Park the query; issue one resolve per username, shared between
        // queries waiting on the same name.  Each unresolved name gets a
        // temporary user id standing in until the answer arrives.
        let resolve_query_id = self.next_send_query_id;
        self.next_send_query_id += 1;
        let remaining = unresolved.len();
        for username in unresolved {
            let temp_id = match self.temp_bot_ids.get(&username) {
                Some(&temp_id) => temp_id,
                None => {
                    let temp_id = self.next_temp_bot_id;
                    self.next_temp_bot_id += 1;
                    self.temp_bot_ids.insert(username.clone(), temp_id);
                    temp_id
                }
            };
            let waiting = self.pending_resolves.entry(temp_id).or_default();
            let is_first = waiting.is_empty();
            waiting.push(resolve_query_id);
            if is_first {
                self.session.resolve_bot_username(&username);
            }
        }
        let query = std::mem::replace(
            query,
            Box::new(Query::internal(String::new(), false, "", Vec::new())),
        );
        self.parked_resolve_queries.insert(
            resolve_query_id,
            ParkedResolveQuery {
                query,
                remaining,
                failed: false,
            },
        );
        false
    }

    async fn on_bot_resolved(&mut self, username: String, user: Option<BotUser>) {
        let username = username.to_ascii_lowercase();
        let resolved_id = user.as_ref().map(|u| u.id);
        self.resolved_bots.insert(username.clone(), resolved_id);
        if let Some(user) = user {
            self.users.insert(user.id, user.to_json());
        }

        let Some(temp_id) = self.temp_bot_ids.get(&username).copied() else {
            return;
        };
        let Some(waiting_queries) = self.pending_resolves.remove(&temp_id) else {
            return;
        };
        let mut ready = Vec::new();
        for query_id in waiting_queries {
            if let Some(parked) = self.parked_resolve_queries.get_mut(&query_id) {
                parked.remaining -= 1;
                if resolved_id.is_none() {
                    parked.failed = true;
                }
                if parked.remaining == 0 {
                    ready.push(query_id);
                }
            }
        }
        for query_id in ready {
            let mut parked = self.parked_resolve_queries.remove(&query_id).unwrap();
            if parked.failed {
                self.respond(&mut parked.query, Err(ApiError::bad_request("bot not found")));
            } else {
                // Temporaries now resolve from the cache; run the query
                // again from the top.
                self.dispatch_query(parked.query).await;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    async fn start_close(&mut self, logout: bool) {
        if self.state == AuthState::Closing {
            return;
        }
        info!(token_id = self.tqueue_id, logout, "closing bot client");
        self.state = AuthState::Closing;
        self.abort_long_poll(false);
        if let Some(webhook) = self.webhook.take() {
            webhook.handle.close();
        }
        self.webhook_upcall_rx = None;
        while let Some(mut query) = self.cmd_queue.pop_front() {
            self.respond(&mut query, Err(ApiError::retry_after(1)));
        }
        if logout {
            self.session.log_out().await;
        } else {
            self.session.close().await;
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Derive the bot's access level from a cached chat object.  A muted member
/// can still edit its own messages; a non-member may still see the member
/// list in some chats.
fn access_rights_from_chat(chat: &Value) -> AccessRights {
    if chat.get("bot_is_member") == Some(&Value::Bool(false)) {
        if chat.get("members_are_visible") == Some(&Value::Bool(true)) {
            AccessRights::ReadMembers
        } else {
            AccessRights::Read
        }
    } else if chat.pointer("/permissions/can_send_messages") == Some(&Value::Bool(false)) {
        AccessRights::Edit
    } else {
        AccessRights::Write
    }
}

fn args_to_json(query: &Query) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in &query.args {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

/// Bot usernames referenced by `login_url` inline-keyboard buttons; these
/// must resolve to user ids before the send is issued upstream.
fn collect_login_url_bot_usernames(reply_markup: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(reply_markup) else {
        return Vec::new();
    };
    let mut usernames: Vec<String> = Vec::new();
    if let Some(rows) = value.get("inline_keyboard").and_then(Value::as_array) {
        for row in rows {
            let Some(buttons) = row.as_array() else { continue };
            for button in buttons {
                if let Some(username) = button
                    .get("login_url")
                    .and_then(|login_url| login_url.get("bot_username"))
                    .and_then(Value::as_str)
                {
                    let username = username.trim_start_matches('@').to_ascii_lowercase();
                    if !username.is_empty() && !usernames.contains(&username) {
                        usernames.push(username);
                    }
                }
            }
        }
    }
    usernames
}

// ─── Tests ──────────────────────────────────────────────────────────────────

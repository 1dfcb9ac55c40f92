// src/upstream.rs
//
// Boundary to the upstream Telegram client library.
//
// The front-end never speaks MTProto itself; everything it needs from the
// transport is expressed by `UpstreamConnector`/`UpstreamSession` plus the
// `UpstreamEvent` stream a session produces.  A real transport implements
// these traits; the `LoopbackUpstream` shipped here is a self-contained
// implementation used by tests and local development runs: it authorizes any
// structurally valid token, echoes sends, and lets callers script responses
// and inject events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::updates::UpdateType;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Too Many Requests: retry after {0}")]
    TooManyRequests(u64),
    #[error("Bad Gateway: {0}")]
    Temporary(String),
}

impl UpstreamError {
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::Unauthorized(msg) => ApiError::unauthorized(msg),
            Self::BadRequest(msg) => ApiError::bad_request(msg),
            Self::Forbidden(msg) => ApiError::forbidden(msg),
            Self::NotFound(msg) => ApiError::not_found(msg),
            Self::TooManyRequests(seconds) => ApiError::retry_after(*seconds),
            Self::Temporary(msg) => ApiError::new(502, format!("Bad Gateway: {msg}")),
        }
    }
}

// ─── Session data ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BotUser {
    pub id: i64,
    pub first_name: String,
    pub username: String,
    pub can_join_groups: bool,
    pub can_read_all_group_messages: bool,
    pub supports_inline_queries: bool,
}

impl BotUser {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "is_bot": true,
            "first_name": self.first_name,
            "username": self.username,
            "can_join_groups": self.can_join_groups,
            "can_read_all_group_messages": self.can_read_all_group_messages,
            "supports_inline_queries": self.supports_inline_queries,
        })
    }
}

/// Everything a session pushes back at the owning client actor.
#[derive(Debug)]
pub enum UpstreamEvent {
    Authorized(BotUser),
    /// Terminal: the token was rejected.
    AuthorizationFailed(String),
    /// The session is gone (logOut/close completed or transport lost).
    Closed,
    /// An inbound update to enqueue for delivery.
    Update {
        kind: UpdateType,
        /// Conversation grouping key (0 = no conversation affinity).
        queue_id: i64,
        /// Seconds until the update expires in the queue.
        timeout: i32,
        /// The body of the update, without the kind wrapper.
        payload: Value,
    },
    /// A previously accepted send completed.
    MessageSent {
        pending_id: i64,
        chat_id: i64,
        message: Value,
    },
    MessageSendFailed {
        pending_id: i64,
        chat_id: i64,
        error: UpstreamError,
    },
    /// Answer to `resolve_bot_username`.
    BotResolved {
        username: String,
        user: Option<BotUser>,
    },
    /// Entity-cache feed.
    UserUpdated { user: Value },
    ChatUpdated { chat: Value },
}

// ─── Traits ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Generic method marshalling for everything without a dedicated path.
    async fn call(&self, method: &str, args: &[(String, String)]) -> Result<Value, UpstreamError>;

    /// Start sending a message; completion arrives as `MessageSent` /
    /// `MessageSendFailed` carrying the returned pending id.
    async fn send_message(&self, chat_id: i64, args: Value) -> Result<i64, UpstreamError>;

    /// Start sending an album; one pending id per item.
    async fn send_media_group(
        &self,
        chat_id: i64,
        media_count: usize,
        args: Value,
    ) -> Result<Vec<i64>, UpstreamError>;

    /// Resolve a bot username; the answer arrives as `BotResolved`.
    fn resolve_bot_username(&self, username: &str);

    async fn log_out(&self);

    async fn close(&self);
}

pub trait UpstreamConnector: Send + Sync + 'static {
    fn connect(
        &self,
        token: &str,
        is_test_dc: bool,
    ) -> (Arc<dyn UpstreamSession>, mpsc::UnboundedReceiver<UpstreamEvent>);
}

// ─── Loopback implementation ────────────────────────────────────────────────

struct LoopbackInner {
    sessions: HashMap<String, mpsc::UnboundedSender<UpstreamEvent>>,
    scripted: HashMap<String, Result<Value, UpstreamError>>,
    known_bots: HashMap<String, i64>,
    send_failure: Option<UpstreamError>,
    next_message_id: i64,
}

/// In-process upstream: every structurally valid token authorizes, sends
/// echo back as delivered messages.  Tests drive it through `inject_event`,
/// `script_response`, `add_known_bot` and `fail_sends_with`.
pub struct LoopbackUpstream {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(LoopbackInner {
                sessions: HashMap::new(),
                scripted: HashMap::new(),
                known_bots: HashMap::new(),
                send_failure: None,
                next_message_id: 1,
            })),
        })
    }

    fn session_key(token: &str, is_test_dc: bool) -> String {
        if is_test_dc {
            format!("{token}/test")
        } else {
            token.to_string()
        }
    }

    /// Push an event into a connected session, as the transport would.
    pub fn inject_event(&self, token: &str, is_test_dc: bool, event: UpstreamEvent) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.sessions.get(&Self::session_key(token, is_test_dc)) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Fix the answer of `call` for one method (lowercase name).
    pub fn script_response(&self, method: &str, response: Result<Value, UpstreamError>) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .insert(method.to_ascii_lowercase(), response);
    }

    pub fn add_known_bot(&self, username: &str, id: i64) {
        self.inner
            .lock()
            .unwrap()
            .known_bots
            .insert(username.to_ascii_lowercase(), id);
    }

    /// Make subsequent sends fail with the given error.
    pub fn fail_sends_with(&self, error: Option<UpstreamError>) {
        self.inner.lock().unwrap().send_failure = error;
    }
}

impl UpstreamConnector for LoopbackUpstream {
    fn connect(
        &self,
        token: &str,
        is_test_dc: bool,
    ) -> (Arc<dyn UpstreamSession>, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let user = token
            .split(':')
            .next()
            .and_then(|prefix| prefix.parse::<i64>().ok())
            .map(|id| BotUser {
                id,
                first_name: format!("Bot {id}"),
                username: format!("bot{id}"),
                can_join_groups: true,
                can_read_all_group_messages: false,
                supports_inline_queries: false,
            });
        match user {
            Some(user) => {
                let _ = tx.send(UpstreamEvent::Authorized(user));
            }
            None => {
                let _ = tx.send(UpstreamEvent::AuthorizationFailed(
                    "invalid token specified".to_string(),
                ));
            }
        }

        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(Self::session_key(token, is_test_dc), tx.clone());

        let session = Arc::new(LoopbackSession {
            key: Self::session_key(token, is_test_dc),
            inner: self.inner.clone(),
            tx,
        });
        (session, rx)
    }
}

struct LoopbackSession {
    key: String,
    inner: Arc<Mutex<LoopbackInner>>,
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl LoopbackSession {
    fn make_message(&self, chat_id: i64, args: &Value) -> (i64, Value) {
        let mut inner = self.inner.lock().unwrap();
        let message_id = inner.next_message_id;
        inner.next_message_id += 1;
        let mut message = json!({
            "message_id": message_id,
            "date": crate::clock::unix_time(),
            "chat": { "id": chat_id, "type": "private" },
        });
        if let Some(text) = args.get("text") {
            message["text"] = text.clone();
        }
        (message_id, message)
    }
}

#[async_trait]
impl UpstreamSession for LoopbackSession {
    async fn call(&self, method: &str, _args: &[(String, String)]) -> Result<Value, UpstreamError> {
        let scripted = self
            .inner
            .lock()
            .unwrap()
            .scripted
            .get(&method.to_ascii_lowercase())
            .cloned();
        match scripted {
            Some(response) => response,
            None => Err(UpstreamError::NotFound("method not found".to_string())),
        }
    }

    async fn send_message(&self, chat_id: i64, args: Value) -> Result<i64, UpstreamError> {
        let failure = self.inner.lock().unwrap().send_failure.clone();
        let (pending_id, message) = self.make_message(chat_id, &args);
        let event = match failure {
            Some(error) => UpstreamEvent::MessageSendFailed {
                pending_id,
                chat_id,
                error,
            },
            None => UpstreamEvent::MessageSent {
                pending_id,
                chat_id,
                message,
            },
        };
        let _ = self.tx.send(event);
        Ok(pending_id)
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        media_count: usize,
        args: Value,
    ) -> Result<Vec<i64>, UpstreamError> {
        let mut pending_ids = Vec::with_capacity(media_count);
        for _ in 0..media_count {
            pending_ids.push(self.send_message(chat_id, args.clone()).await?);
        }
        Ok(pending_ids)
    }

    fn resolve_bot_username(&self, username: &str) {
        let id = self
            .inner
            .lock()
            .unwrap()
            .known_bots
            .get(&username.to_ascii_lowercase())
            .copied();
        let user = id.map(|id| BotUser {
            id,
            first_name: username.to_string(),
            username: username.to_string(),
            can_join_groups: true,
            can_read_all_group_messages: false,
            supports_inline_queries: true,
        });
        let _ = self.tx.send(UpstreamEvent::BotResolved {
            username: username.to_string(),
            user,
        });
    }

    async fn log_out(&self) {
        self.inner.lock().unwrap().sessions.remove(&self.key);
        let _ = self.tx.send(UpstreamEvent::Closed);
    }

    async fn close(&self) {
        self.inner.lock().unwrap().sessions.remove(&self.key);
        let _ = self.tx.send(UpstreamEvent::Closed);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_token_authorizes() {
        let upstream = LoopbackUpstream::new();
        let (_session, mut rx) = upstream.connect("123:abc", false);
        match rx.recv().await.unwrap() {
            UpstreamEvent::Authorized(user) => {
                assert_eq!(user.id, 123);
                assert_eq!(user.username, "bot123");
            }
            other => panic!("expected Authorized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_message_echoes() {
        let upstream = LoopbackUpstream::new();
        let (session, mut rx) = upstream.connect("123:abc", false);
        let _ = rx.recv().await;

        let pending_id = session
            .send_message(55, json!({"text": "hello"}))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            UpstreamEvent::MessageSent {
                pending_id: got,
                chat_id,
                message,
            } => {
                assert_eq!(got, pending_id);
                assert_eq!(chat_id, 55);
                assert_eq!(message["text"], "hello");
            }
            other => panic!("expected MessageSent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_call_and_default() {
        let upstream = LoopbackUpstream::new();
        let (session, _rx) = upstream.connect("123:abc", false);

        assert!(matches!(
            session.call("getChat", &[]).await,
            Err(UpstreamError::NotFound(_))
        ));

        upstream.script_response("getChat", Ok(json!({"id": 55})));
        assert_eq!(session.call("getChat", &[]).await.unwrap()["id"], 55);
    }

    #[tokio::test]
    async fn bot_resolution() {
        let upstream = LoopbackUpstream::new();
        upstream.add_known_bot("samplebot", 777);
        let (session, mut rx) = upstream.connect("123:abc", false);
        let _ = rx.recv().await;

        session.resolve_bot_username("samplebot");
        session.resolve_bot_username("missing");

        match rx.recv().await.unwrap() {
            UpstreamEvent::BotResolved { user: Some(user), .. } => assert_eq!(user.id, 777),
            other => panic!("expected resolved bot, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            UpstreamEvent::BotResolved { user: None, username } => assert_eq!(username, "missing"),
            other => panic!("expected unresolved bot, got {other:?}"),
        }
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            UpstreamError::TooManyRequests(9).to_api_error().retry_after,
            Some(9)
        );
        assert_eq!(
            UpstreamError::Temporary("upstream unavailable".to_string())
                .to_api_error()
                .code,
            502
        );
        assert_eq!(
            UpstreamError::BadRequest("chat not found".to_string())
                .to_api_error()
                .description,
            "Bad Request: chat not found"
        );
    }
}

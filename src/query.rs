// src/query.rs
//
// The parsed form of one incoming bot-API request, together with the
// single-use promise that carries its response back to the HTTP layer.
//
// Every query is answered exactly once.  If a query is dropped unanswered
// anywhere in the pipeline (an actor shut down, a channel closed), the
// promise's destructor answers it with 429 so the HTTP connection is never
// leaked.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::clock;
use crate::error::ApiError;

// ─── Response ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct QueryResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
    pub retry_after: Option<u64>,
}

impl QueryResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            status_code: 200,
            body: serde_json::json!({ "ok": true, "result": result }),
            retry_after: None,
        }
    }

    pub fn error(err: &ApiError) -> Self {
        Self {
            status_code: err.code,
            body: err.to_body(),
            retry_after: err.retry_after,
        }
    }
}

// ─── Promise ────────────────────────────────────────────────────────────────

/// Single-use response channel.  Dropping an unfulfilled promise answers the
/// request with the shutdown-in-progress error (429, retry after 1).
pub struct ResponsePromise {
    sender: Option<oneshot::Sender<QueryResponse>>,
    query_counter: Option<Arc<AtomicI64>>,
}

impl ResponsePromise {
    pub fn new() -> (Self, oneshot::Receiver<QueryResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Some(tx),
                query_counter: None,
            },
            rx,
        )
    }

    /// A promise nobody is waiting on, for internally generated queries
    /// (webhook restore, answer-via-webhook).
    pub fn inert() -> Self {
        let (promise, _rx) = Self::new();
        promise
    }

    /// Attach the process-wide in-flight query gauge; it is decremented when
    /// the promise is fulfilled or dropped.
    pub fn with_counter(mut self, counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        self.query_counter = Some(counter);
        self
    }

    fn fulfill(&mut self, response: QueryResponse) {
        if let Some(sender) = self.sender.take() {
            // The receiver may have gone away (client disconnect); the
            // response is simply discarded then.
            let _ = sender.send(response);
        }
        if let Some(counter) = self.query_counter.take() {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.fulfill(QueryResponse::error(&ApiError::retry_after(1)));
        } else if let Some(counter) = self.query_counter.take() {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

// ─── Query ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueryFile {
    pub field_name: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

pub struct Query {
    pub token: String,
    pub is_test_dc: bool,
    /// Lowercased method name.
    pub method: String,
    pub args: Vec<(String, String)>,
    pub files: Vec<QueryFile>,
    pub peer_ip: String,
    /// Set for queries the process generated itself (webhook restore,
    /// answer-via-webhook).  Internal queries bypass external validation.
    pub is_internal: bool,
    pub arrival_time: f64,
    pub body_size: u64,
    promise: ResponsePromise,
}

impl Query {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: String,
        is_test_dc: bool,
        method: &str,
        args: Vec<(String, String)>,
        files: Vec<QueryFile>,
        peer_ip: String,
        body_size: u64,
        promise: ResponsePromise,
    ) -> Self {
        Self {
            token,
            is_test_dc,
            method: method.to_ascii_lowercase(),
            args,
            files,
            peer_ip,
            is_internal: false,
            arrival_time: clock::monotonic_now(),
            body_size,
            promise,
        }
    }

    /// An internally generated query with an inert promise.
    pub fn internal(
        token: String,
        is_test_dc: bool,
        method: &str,
        args: Vec<(String, String)>,
    ) -> Self {
        let mut query = Self::new(
            token,
            is_test_dc,
            method,
            args,
            Vec::new(),
            String::new(),
            0,
            ResponsePromise::inert(),
        );
        query.is_internal = true;
        query
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn arg_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.arg(name).unwrap_or(default)
    }

    /// Parse an integer argument; a present-but-malformed value is a 400.
    pub fn int_arg(&self, name: &str) -> Result<Option<i64>, ApiError> {
        match self.arg(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ApiError::bad_request(format!("invalid {name} specified"))),
        }
    }

    pub fn bool_arg(&self, name: &str) -> bool {
        matches!(
            self.arg(name).map(str::trim),
            Some("1") | Some("true") | Some("True") | Some("yes")
        )
    }

    pub fn file(&self, field_name: &str) -> Option<&QueryFile> {
        self.files.iter().find(|f| f.field_name == field_name)
    }

    pub fn files_total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn answer_ok(&mut self, result: serde_json::Value) {
        self.promise.fulfill(QueryResponse::ok(result));
    }

    pub fn answer_error(&mut self, err: ApiError) {
        self.promise.fulfill(QueryResponse::error(&err));
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("method", &self.method)
            .field("is_test_dc", &self.is_test_dc)
            .field("is_internal", &self.is_internal)
            .field("args", &self.args.len())
            .field("files", &self.files.len())
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_query(args: Vec<(String, String)>) -> (Query, oneshot::Receiver<QueryResponse>) {
        let (promise, rx) = ResponsePromise::new();
        let query = Query::new(
            "123:token".to_string(),
            false,
            "getMe",
            args,
            Vec::new(),
            "127.0.0.1".to_string(),
            0,
            promise,
        );
        (query, rx)
    }

    #[tokio::test]
    async fn answer_ok_builds_envelope() {
        let (mut query, rx) = test_query(vec![]);
        assert_eq!(query.method, "getme");
        query.answer_ok(serde_json::json!({"id": 123}));
        let response = rx.await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["ok"], true);
        assert_eq!(response.body["result"]["id"], 123);
    }

    #[tokio::test]
    async fn dropped_query_answers_429() {
        let (query, rx) = test_query(vec![]);
        drop(query);
        let response = rx.await.unwrap();
        assert_eq!(response.status_code, 429);
        assert_eq!(response.body["parameters"]["retry_after"], 1);
    }

    #[tokio::test]
    async fn counter_decrements_on_fulfill_and_drop() {
        let counter = Arc::new(AtomicI64::new(0));

        let (promise, rx) = ResponsePromise::new();
        let mut promise = promise.with_counter(counter.clone());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        promise.fulfill(QueryResponse::ok(serde_json::json!(true)));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        drop(promise);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        drop(rx);

        let (promise, _rx) = ResponsePromise::new();
        let promise = promise.with_counter(counter.clone());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(promise);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn int_arg_parsing() {
        let (query, _rx) = test_query(vec![
            ("offset".to_string(), "42".to_string()),
            ("limit".to_string(), "abc".to_string()),
        ]);
        assert_eq!(query.int_arg("offset").unwrap(), Some(42));
        assert_eq!(query.int_arg("missing").unwrap(), None);
        let err = query.int_arg("limit").unwrap_err();
        assert_eq!(err.code, 400);
    }

    #[test]
    fn bool_arg_parsing() {
        let (query, _rx) = test_query(vec![
            ("a".to_string(), "true".to_string()),
            ("b".to_string(), "0".to_string()),
        ]);
        assert!(query.bool_arg("a"));
        assert!(!query.bool_arg("b"));
        assert!(!query.bool_arg("missing"));
    }
}

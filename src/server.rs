// src/server.rs
//
// HTTP front: parses `/bot<token>[/test]/<method>` requests into queries,
// forwards them to the client manager and renders the JSON envelope the
// manager's promise resolves to.  A second, optional listener serves the
// TSV stats page.
//
// The main listener runs a hand-rolled accept loop so accepting itself can
// be flood-controlled: when the per-listener budget is exhausted the loop
// pauses instead of dropping connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::clock;
use crate::error::ApiError;
use crate::flood::FloodControl;
use crate::manager::ManagerHandle;
use crate::params::SharedParams;
use crate::query::{Query, QueryFile, ResponsePromise};

/// Upload ceiling for public instances; local mode accepts much more.
const MAX_REQUEST_BODY_SIZE: usize = 64 << 20;
const MAX_REQUEST_BODY_SIZE_LOCAL: usize = 2 << 30;

#[derive(Clone)]
pub struct ServerState {
    pub params: Arc<SharedParams>,
    pub manager: ManagerHandle,
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .fallback(bot_api_handler)
        // Size policing happens in the handler, per content type.
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub fn build_stats_router(state: ServerState) -> Router {
    Router::new().fallback(stats_handler).with_state(state)
}

// ─── Accept loop ────────────────────────────────────────────────────────────

/// Serve the bot API on `listener`, throttling accepts with the listener
/// flood control (1/s sustained, 10/min).
pub async fn serve_bot_api(listener: tokio::net::TcpListener, state: ServerState) {
    let app = build_router(state);
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let mut flood = FloodControl::with_limits(&[(1.0, 1), (60.0, 10)]);

    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "bot API listening");
    loop {
        let now = clock::monotonic_now();
        let wakeup_at = flood.wakeup_at();
        if wakeup_at > now {
            tokio::time::sleep(Duration::from_secs_f64(wakeup_at - now)).await;
        }

        let (socket, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        flood.add_event(clock::monotonic_now());
        debug!(peer = %remote_addr, "accepted connection");

        let tower_service = match make_service.call(remote_addr).await {
            Ok(service) => service,
            Err(infallible) => match infallible {},
        };
        tokio::spawn(async move {
            let socket = hyper_util::rt::TokioIo::new(socket);
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    tower_service
                        .clone()
                        .oneshot(request.map(axum::body::Body::new))
                });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(socket, hyper_service)
                .await
            {
                debug!(error = %e, "connection closed with error");
            }
        });
    }
}

/// The stats listener has no flood control of its own; it is expected to be
/// bound to an internal interface.
pub async fn serve_stats(listener: tokio::net::TcpListener, state: ServerState) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "stats listening");
    let app = build_stats_router(state);
    if let Err(e) = axum::serve(listener, app).await {
        warn!(error = %e, "stats server stopped");
    }
}

// ─── Request parsing ────────────────────────────────────────────────────────

struct ParsedPath<'a> {
    token: &'a str,
    is_test_dc: bool,
    method: &'a str,
}

fn parse_bot_path(path: &str) -> Option<ParsedPath<'_>> {
    let rest = path.strip_prefix("/bot")?;
    let (token, tail) = rest.split_once('/')?;
    if token.is_empty() {
        return None;
    }
    let (is_test_dc, method) = match tail.strip_prefix("test/") {
        Some(method) => (true, method),
        None => (false, tail),
    };
    if method.is_empty() || method.contains('/') {
        return None;
    }
    Some(ParsedPath {
        token,
        is_test_dc,
        method,
    })
}

fn query_string_args(query: Option<&str>) -> Vec<(String, String)> {
    match query {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => Vec::new(),
    }
}

/// Decode a JSON request body: every top-level field becomes an argument,
/// non-string values keep their JSON rendering.
fn json_body_args(body: &[u8]) -> Result<Vec<(String, String)>, ApiError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::bad_request("can't parse JSON request body"))?;
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::bad_request("request body must be a JSON object"))?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect())
}

async fn save_uploaded_file(
    params: &SharedParams,
    field_name: &str,
    file_name: &str,
    data: Bytes,
) -> Result<QueryFile, ApiError> {
    let path = params
        .temp_directory
        .join(format!("upload_{}", uuid::Uuid::new_v4()));
    let size = data.len() as u64;
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| ApiError::internal(format!("can't save uploaded file: {e}")))?;
    Ok(QueryFile {
        field_name: field_name.to_string(),
        file_name: file_name.to_string(),
        path,
        size,
    })
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn bot_api_handler(
    State(state): State<ServerState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let path = request.uri().path().to_string();
    let Some(parsed) = parse_bot_path(&path) else {
        return ApiError::new(404, "Not Found").into_response();
    };
    let token = parsed.token.to_string();
    let is_test_dc = parsed.is_test_dc;
    let method = parsed.method.to_string();

    let mut args = query_string_args(request.uri().query());
    let mut files = Vec::new();

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body_limit = if state.params.local_mode {
        MAX_REQUEST_BODY_SIZE_LOCAL
    } else {
        MAX_REQUEST_BODY_SIZE
    };

    let mut body_size = 0u64;
    if content_type.starts_with("multipart/form-data") {
        let mut multipart = match Multipart::from_request(request, &()).await {
            Ok(multipart) => multipart,
            Err(_) => {
                return ApiError::bad_request("can't parse multipart request body")
                    .into_response()
            }
        };
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) => {
                    let field_name = field.name().unwrap_or_default().to_string();
                    let file_name = field.file_name().map(str::to_string);
                    let data = match field.bytes().await {
                        Ok(data) => data,
                        Err(_) => {
                            return ApiError::bad_request("can't read multipart field")
                                .into_response()
                        }
                    };
                    body_size += data.len() as u64;
                    if body_size > body_limit as u64 {
                        return ApiError::new(413, "Request Entity Too Large").into_response();
                    }
                    match file_name {
                        Some(file_name) if !file_name.is_empty() => {
                            match save_uploaded_file(&state.params, &field_name, &file_name, data)
                                .await
                            {
                                Ok(file) => files.push(file),
                                Err(e) => return e.into_response(),
                            }
                        }
                        _ => {
                            let value = String::from_utf8_lossy(&data).into_owned();
                            args.push((field_name, value));
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    return ApiError::bad_request("can't parse multipart request body")
                        .into_response()
                }
            }
        }
    } else {
        let body = match axum::body::to_bytes(request.into_body(), body_limit).await {
            Ok(body) => body,
            Err(_) => return ApiError::new(413, "Request Entity Too Large").into_response(),
        };
        body_size = body.len() as u64;
        if content_type.starts_with("application/json") {
            match json_body_args(&body) {
                Ok(mut body_args) => args.append(&mut body_args),
                Err(e) => return e.into_response(),
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            args.extend(
                url::form_urlencoded::parse(&body).map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }
        // Other content types carry no arguments.
    }

    let (promise, rx) = ResponsePromise::new();
    let promise = promise.with_counter(state.params.query_count.clone());
    let query = Query::new(
        token,
        is_test_dc,
        &method,
        args,
        files,
        remote_addr.ip().to_string(),
        body_size,
        promise,
    );
    state.manager.send(Box::new(query));

    match rx.await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut http_response =
                (status, axum::Json(response.body)).into_response();
            if let Some(seconds) = response.retry_after {
                if let Ok(value) = seconds.to_string().parse() {
                    http_response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            http_response
        }
        // The promise guarantees an answer; a closed channel means the
        // process is going down.
        Err(_) => ApiError::retry_after(1).into_response(),
    }
}

async fn stats_handler(State(state): State<ServerState>, request: Request) -> Response {
    let args = query_string_args(request.uri().query());
    let stats = state.manager.get_stats(args).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        stats,
    )
        .into_response()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

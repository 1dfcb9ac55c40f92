use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── Bot API error envelope ─────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    ok: bool,
    error_code: u16,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResponseParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured bot-API error.  The HTTP status always equals `error_code`:
///
/// ```json
/// {
///   "ok": false,
///   "error_code": 429,
///   "description": "Too Many Requests: retry after 30",
///   "parameters": { "retry_after": 30 }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: u16,
    pub description: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            retry_after: None,
        }
    }

    /// 400 with a "Bad Request: ..." description.
    pub fn bad_request(msg: impl AsRef<str>) -> Self {
        Self::new(400, format!("Bad Request: {}", msg.as_ref()))
    }

    /// 401 with an "Unauthorized: ..." description.
    pub fn unauthorized(msg: impl AsRef<str>) -> Self {
        Self::new(401, format!("Unauthorized: {}", msg.as_ref()))
    }

    /// 403 with a "Forbidden: ..." description.
    pub fn forbidden(msg: impl AsRef<str>) -> Self {
        Self::new(403, format!("Forbidden: {}", msg.as_ref()))
    }

    /// 404 with a "Not Found: ..." description.
    pub fn not_found(msg: impl AsRef<str>) -> Self {
        Self::new(404, format!("Not Found: {}", msg.as_ref()))
    }

    /// 409 with a "Conflict: ..." description.
    pub fn conflict(msg: impl AsRef<str>) -> Self {
        Self::new(409, format!("Conflict: {}", msg.as_ref()))
    }

    /// 421 for tokens outside this instance's admission range.
    pub fn misdirected(msg: impl AsRef<str>) -> Self {
        Self::new(421, format!("Misdirected Request: {}", msg.as_ref()))
    }

    /// 429 with `parameters.retry_after` and the matching `Retry-After`
    /// header.
    pub fn retry_after(seconds: u64) -> Self {
        let mut err = Self::new(429, format!("Too Many Requests: retry after {seconds}"));
        err.retry_after = Some(seconds);
        err
    }

    /// 500 with an "Internal Server Error: ..." description.
    pub fn internal(msg: impl AsRef<str>) -> Self {
        Self::new(500, format!("Internal Server Error: {}", msg.as_ref()))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn to_body(&self) -> serde_json::Value {
        let parameters = self
            .retry_after
            .map(|retry_after| ResponseParameters {
                retry_after: Some(retry_after),
            });
        serde_json::to_value(ErrorEnvelope {
            ok: false,
            error_code: self.code,
            description: &self.description,
            parameters,
        })
        .expect("error envelope serialization cannot fail")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.description)
    }
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.description);
        } else {
            tracing::debug!(code = self.code, "{}", self.description);
        }

        let mut response = (status, Json(self.to_body())).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn envelope_shape() {
        let value = body_json(ApiError::bad_request("chat not found")).await;
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_code"], 400);
        assert_eq!(value["description"], "Bad Request: chat not found");
        assert!(value.get("parameters").is_none());
    }

    #[tokio::test]
    async fn retry_after_parameters_and_header() {
        let err = ApiError::retry_after(30);
        assert_eq!(err.code, 429);

        let response = err.clone().into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "30");

        let value = body_json(err).await;
        assert_eq!(value["parameters"]["retry_after"], 30);
        assert_eq!(value["description"], "Too Many Requests: retry after 30");
    }

    #[tokio::test]
    async fn status_equals_error_code() {
        for (err, expected) in [
            (ApiError::unauthorized("invalid token specified"), 401),
            (ApiError::forbidden("bot was blocked by the user"), 403),
            (ApiError::not_found("method not found"), 404),
            (
                ApiError::conflict("terminated by other getUpdates request"),
                409,
            ),
            (ApiError::misdirected("unallowed token specified"), 421),
        ] {
            assert_eq!(err.code, expected);
            let response = err.into_response();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}

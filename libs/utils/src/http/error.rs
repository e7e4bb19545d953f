use hyper::{header, Body, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;
use tracing::{error, info, warn};

/// The failure modes an orchestrator HTTP handler can surface. Every
/// variant maps to one HTTP status and one stable error code, so
/// clients can branch on `error.code` rather than parsing messages.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0:#}")]
    BadRequest(anyhow::Error),

    #[error("Schema is not ready: {0}")]
    SchemaNotReady(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("NotFound: {0}")]
    NotFound(#[source] anyhow::Error),

    #[error("Session expired: {0}")]
    Gone(String),

    #[error("Already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Too many sessions: {0}")]
    TooManySessions(String),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Authority unavailable: {0}")]
    AuthorityUnavailable(Cow<'static, str>),

    #[error("Shutting down")]
    ShuttingDown,

    #[error(transparent)]
    InternalServerError(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::SchemaNotReady(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyClaimed(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::TooManySessions(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CapacityExhausted(_)
            | ApiError::AuthorityUnavailable(_)
            | ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::SchemaNotReady(_) => "SCHEMA_NOT_READY",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Gone(_) => "SESSION_EXPIRED",
            ApiError::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            ApiError::TooManySessions(_) => "TOO_MANY_SESSIONS",
            ApiError::CapacityExhausted(_) => "CAPACITY_EXHAUSTED",
            ApiError::AuthorityUnavailable(_) => "AUTHORITY_UNAVAILABLE",
            ApiError::ShuttingDown => "SHUTTING_DOWN",
            ApiError::InternalServerError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn into_response(self) -> Response<Body> {
        // Feature-gate refusals and real missing routes must be
        // indistinguishable, so NotFound bodies never echo details.
        let message = match &self {
            ApiError::NotFound(_) => "Not Found".to_owned(),
            ApiError::InternalServerError(_) => "Internal server error".to_owned(),
            other => other.to_string(),
        };
        HttpErrorBody::response_from_parts(self.code(), message, self.status())
    }
}

/// Error envelope shared by every surface:
/// `{"success": false, "error": {"code": .., "message": ..}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HttpErrorBody {
    pub success: bool,
    pub error: HttpErrorPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HttpErrorPayload {
    pub code: String,
    pub message: String,
}

impl HttpErrorBody {
    pub fn from_parts(code: &str, message: String) -> Self {
        HttpErrorBody {
            success: false,
            error: HttpErrorPayload {
                code: code.to_owned(),
                message,
            },
        }
    }

    pub fn response_from_parts(
        code: &str,
        message: String,
        status: StatusCode,
    ) -> Response<Body> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            // we do not have nested maps with non string keys so serialization shouldn't fail
            .body(Body::from(
                serde_json::to_string(&Self::from_parts(code, message)).unwrap(),
            ))
            .unwrap()
    }
}

pub async fn route_error_handler(err: routerify::RouteError) -> Response<Body> {
    match err.downcast::<ApiError>() {
        Ok(api_error) => api_error_handler(*api_error),
        Err(other_error) => {
            // We expect all the request handlers to return an ApiError, so this should
            // not be reached. But just in case.
            error!("Error processing HTTP request: {other_error:?}");
            HttpErrorBody::response_from_parts(
                "INTERNAL_ERROR",
                "Internal server error".to_owned(),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

pub fn api_error_handler(api_error: ApiError) -> Response<Body> {
    // Print a stack trace for Internal Server errors
    match &api_error {
        ApiError::InternalServerError(err) => error!("Error processing HTTP request: {err:?}"),
        ApiError::AuthorityUnavailable(_) | ApiError::CapacityExhausted(_) => {
            warn!("Error processing HTTP request: {api_error:#}")
        }
        _ => info!("Error processing HTTP request: {api_error:#}"),
    }

    api_error.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (
                ApiError::BadRequest(anyhow::anyhow!("x")),
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
            ),
            (
                ApiError::SchemaNotReady("still provisioning".to_owned()),
                StatusCode::BAD_REQUEST,
                "SCHEMA_NOT_READY",
            ),
            (
                ApiError::Gone("expired".to_owned()),
                StatusCode::GONE,
                "SESSION_EXPIRED",
            ),
            (
                ApiError::AlreadyClaimed("claimed".to_owned()),
                StatusCode::CONFLICT,
                "ALREADY_CLAIMED",
            ),
            (
                ApiError::TooManySessions("5".to_owned()),
                StatusCode::TOO_MANY_REQUESTS,
                "TOO_MANY_SESSIONS",
            ),
            (
                ApiError::AuthorityUnavailable("circuit open".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "AUTHORITY_UNAVAILABLE",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn not_found_body_stays_opaque() {
        let err = ApiError::NotFound(anyhow::anyhow!("feature 'booking' disabled for session"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // The reason must not leak which feature was missing.
        let body = body_util::block_on_body(response.into_body());
        assert!(!body.contains("booking"));
        assert!(body.contains("NOT_FOUND"));
    }

    // Minimal body collector to keep the test sync-friendly.
    mod body_util {
        use hyper::body::HttpBody;

        pub fn block_on_body(mut body: hyper::Body) -> String {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let mut out = Vec::new();
                while let Some(chunk) = body.data().await {
                    out.extend_from_slice(&chunk.unwrap());
                }
                String::from_utf8(out).unwrap()
            })
        }
    }
}

//! Authority HTTP surfaces: the public configurator API and the
//! HMAC-guarded internal API the gateway calls for session resolution
//! and lifecycle marks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use preview_api::models::{
    ActiveSchemasResponse, CreateSessionRequest, CreateSessionResponse, HeartbeatResponse,
    OkResponse, ResolvedSession, SchemaStatus, SessionView, WithData,
};
use preview_api::schema_name::SchemaName;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use utils::http::endpoint::{self, request_span};
use utils::http::error::ApiError;
use utils::http::json::{json_request_from_slice, json_response};
use utils::http::request::get_request_param;
use utils::http::{RequestExt, RouterBuilder};
use utils::signed_auth::{verify_signed_request, SIGNATURE_HEADER};
use utils::token::SessionToken;

use crate::metrics::{CLAIMS, HEARTBEATS, SESSIONS_CREATED, SESSION_REJECTIONS, SIGNATURE_REJECTIONS};
use crate::persistence::{ClaimOutcome, CreateSessionError, SessionRecord};
use crate::{provision, AuthorityState};

/// Feature identifiers are dotted lowercase words: `module` or
/// `module.capability`.
static FEATURE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("static regex must compile")
});

const MAX_SELECTED_FEATURES: usize = 64;

fn get_state(request: &Request<Body>) -> Arc<AuthorityState> {
    Arc::clone(
        request
            .data::<Arc<AuthorityState>>()
            .expect("unknown state type"),
    )
}

fn request_token(request: &Request<Body>) -> Result<SessionToken, ApiError> {
    Ok(SessionToken::from(
        get_request_param(request, "token")?.to_owned(),
    ))
}

/// Client address for capacity accounting: leftmost X-Forwarded-For
/// entry when present, else the socket peer.
fn origin_ip(request: &Request<Body>) -> Result<String, ApiError> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Ok(first.to_owned());
            }
        }
    }
    let addr: SocketAddr = request.remote_addr();
    Ok(addr.ip().to_string())
}

fn validate_features(selected_features: &[String]) -> Result<(), ApiError> {
    if selected_features.len() > MAX_SELECTED_FEATURES {
        return Err(ApiError::BadRequest(anyhow!(
            "too many selected features ({})",
            selected_features.len()
        )));
    }
    for feature in selected_features {
        if !FEATURE_ID_RE.is_match(feature) {
            return Err(ApiError::BadRequest(anyhow!(
                "invalid feature identifier {feature:?}"
            )));
        }
    }
    Ok(())
}

/// Buffer the body and check the signed headers against it.
async fn verify_internal(
    request: &mut Request<Body>,
    state: &AuthorityState,
) -> Result<Bytes, ApiError> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let body = hyper::body::to_bytes(request.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(anyhow!("failed to read request body: {e}")))?;

    verify_signed_request(&state.auth, &method, &path, request.headers(), &body).map_err(
        |e| {
            SIGNATURE_REJECTIONS.inc();
            ApiError::Unauthorized(e.to_string())
        },
    )?;
    Ok(body)
}

#[derive(Serialize)]
struct AuthorityStatus {
    status: &'static str,
    service: &'static str,
}

async fn status_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(
        StatusCode::OK,
        AuthorityStatus {
            status: "ok",
            service: "preview-authority",
        },
    )
}

async fn metrics_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    use prometheus::Encoder;
    let metrics = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics, &mut buffer)
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

/// `POST /api/preview/sessions`: create a session and kick off its
/// provisioning in the background.
async fn create_session_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let origin_ip = origin_ip(&request)?;
    let body = hyper::body::to_bytes(request.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(anyhow!("failed to read request body: {e}")))?;
    let create_req: CreateSessionRequest = json_request_from_slice(&body)?;

    validate_features(&create_req.selected_features)?;
    if create_req.tier.is_empty() || create_req.tier.len() > 64 {
        return Err(ApiError::BadRequest(anyhow!("invalid tier")));
    }

    let token = SessionToken::generate();
    let record = state
        .store
        .create_session(
            &token,
            &create_req.selected_features,
            &create_req.tier,
            &origin_ip,
            state.conf.preview_ttl,
            state.conf.max_sessions_per_ip,
            state.conf.max_concurrent_schemas,
        )
        .await
        .map_err(|e| match e {
            CreateSessionError::TooManyForIp(ip) => {
                SESSION_REJECTIONS.with_label_values(&["ip_cap"]).inc();
                ApiError::TooManySessions(format!("too many concurrent sessions for {ip}"))
            }
            CreateSessionError::CapacityExhausted => {
                SESSION_REJECTIONS.with_label_values(&["capacity"]).inc();
                ApiError::CapacityExhausted("no schema capacity left".to_owned())
            }
            CreateSessionError::Other(e) => ApiError::InternalServerError(e),
        })?;

    SESSIONS_CREATED.inc();
    info!("created session for {origin_ip}, expires {}", record.expires_at);

    provision::spawn_provision(
        Arc::clone(&state),
        token.clone(),
        record.selected_features.clone(),
        record.tier.clone(),
    );

    json_response(
        StatusCode::CREATED,
        CreateSessionResponse {
            token,
            expires_at: record.expires_at,
            schema_status: record.schema_status,
        },
    )
}

fn session_view(record: &SessionRecord) -> SessionView {
    SessionView {
        selected_features: record.selected_features.clone(),
        tier: record.tier.clone(),
        schema_name: record
            .schema_name
            .as_deref()
            .and_then(|name| SchemaName::new(name.to_owned()).ok()),
        schema_status: record.schema_status,
        created_at: record.created_at,
        expires_at: record.expires_at,
    }
}

/// Shared 404/410 semantics for token lookups: terminal and expired
/// sessions are gone, unknown tokens do not exist.
async fn lookup_live_session(
    state: &AuthorityState,
    token: &SessionToken,
) -> Result<SessionRecord, ApiError> {
    let record = state
        .store
        .get(token)
        .await
        .map_err(ApiError::InternalServerError)?
        .ok_or_else(|| ApiError::NotFound(anyhow!("session not found")))?;

    if record.schema_status == SchemaStatus::Dropped {
        return Err(ApiError::Gone("session was dropped".to_owned()));
    }
    if record.is_expired(Utc::now()) {
        return Err(ApiError::Gone("session expired".to_owned()));
    }
    Ok(record)
}

/// `GET /api/preview/sessions/{token}`.
///
/// One path, two callers: the configurator polls it unauthenticated for
/// a status view; the gateway calls it signed and gets the resolve
/// payload. The signature header decides which contract applies.
async fn get_session_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = request_token(&request)?;

    let signed = request.headers().contains_key(SIGNATURE_HEADER);
    if signed {
        verify_internal(&mut request, &state).await?;
    }

    let record = lookup_live_session(&state, &token).await?;

    if signed {
        let resolved = ResolvedSession {
            schema_name: record
                .schema_name
                .as_deref()
                .and_then(|name| SchemaName::new(name.to_owned()).ok()),
            selected_features: record.selected_features.clone(),
            tier: record.tier.clone(),
            schema_status: record.schema_status,
            expires_at: record.expires_at,
        };
        json_response(StatusCode::OK, WithData { data: resolved })
    } else {
        json_response(StatusCode::OK, session_view(&record))
    }
}

/// `GET /api/preview/sessions`: the caller's own sessions, keyed by
/// origin IP. Tokens are included; they already belong to this caller.
async fn list_sessions_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let origin_ip = origin_ip(&request)?;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ListedSession {
        token: SessionToken,
        tier: String,
        schema_status: SchemaStatus,
        created_at: chrono::DateTime<Utc>,
        expires_at: chrono::DateTime<Utc>,
    }

    let sessions = state
        .store
        .list_for_ip(&origin_ip)
        .await
        .map_err(ApiError::InternalServerError)?
        .into_iter()
        .map(|record| ListedSession {
            token: record.token,
            tier: record.tier,
            schema_status: record.schema_status,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
        .collect::<Vec<_>>();

    json_response(StatusCode::OK, WithData { data: sessions })
}

/// `POST /api/preview/sessions/{token}/heartbeat`.
async fn heartbeat_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = request_token(&request)?;

    match state
        .store
        .heartbeat(&token, state.conf.preview_ttl)
        .await
        .map_err(ApiError::InternalServerError)?
    {
        Some(expires_at) => {
            HEARTBEATS.inc();
            json_response(StatusCode::OK, HeartbeatResponse { expires_at })
        }
        // Nothing matched: distinguish a dead session from a missing one.
        None => match lookup_live_session(&state, &token).await {
            Ok(_) => Err(ApiError::InternalServerError(anyhow!(
                "heartbeat matched nothing for a live session"
            ))),
            Err(e) => Err(e),
        },
    }
}

/// `POST /api/preview/sessions/{token}/claim` (signed): the CAS that
/// makes one provisioner win.
async fn claim_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = request_token(&request)?;
    verify_internal(&mut request, &state).await?;

    match state
        .store
        .claim_provisioning(&token)
        .await
        .map_err(ApiError::InternalServerError)?
    {
        ClaimOutcome::Claimed => {
            CLAIMS.with_label_values(&["claimed"]).inc();
            json_response(StatusCode::OK, OkResponse { ok: true })
        }
        ClaimOutcome::AlreadyInStatus(status) => {
            CLAIMS.with_label_values(&["conflict"]).inc();
            Err(ApiError::AlreadyClaimed(format!(
                "session is {status}, not PENDING"
            )))
        }
        ClaimOutcome::NotFound => {
            CLAIMS.with_label_values(&["not_found"]).inc();
            Err(ApiError::NotFound(anyhow!("session not found")))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadyBody {
    schema_name: SchemaName,
}

/// `POST /api/preview/sessions/{token}/ready` (signed).
async fn ready_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = request_token(&request)?;
    let body = verify_internal(&mut request, &state).await?;
    let ready: ReadyBody = json_request_from_slice(&body)?;

    let updated = state
        .store
        .mark_ready(&token, ready.schema_name.as_str())
        .await
        .map_err(ApiError::InternalServerError)?;
    if !updated {
        return Err(ApiError::NotFound(anyhow!(
            "no PROVISIONING session to mark ready"
        )));
    }
    json_response(StatusCode::OK, OkResponse { ok: true })
}

/// `POST /api/preview/sessions/{token}/failed` (signed).
async fn failed_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = request_token(&request)?;
    verify_internal(&mut request, &state).await?;

    let updated = state
        .store
        .mark_failed(&token)
        .await
        .map_err(ApiError::InternalServerError)?;
    if !updated {
        return Err(ApiError::NotFound(anyhow!(
            "no PROVISIONING session to mark failed"
        )));
    }
    json_response(StatusCode::OK, OkResponse { ok: true })
}

/// `GET /api/preview/schemas/active` (signed): the live schema set for
/// the gateway's orphan sweep.
async fn active_schemas_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    verify_internal(&mut request, &state).await?;

    let schema_names = state
        .store
        .active_schema_names()
        .await
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, ActiveSchemasResponse { schema_names })
}

/// Authority http router.
pub fn make_router(state: Arc<AuthorityState>) -> RouterBuilder<hyper::Body, ApiError> {
    endpoint::make_router()
        .data(state)
        .get("/health", |r| request_span(r, status_handler))
        .get("/metrics", |r| request_span(r, metrics_handler))
        .post("/api/preview/sessions", |r| {
            request_span(r, create_session_handler)
        })
        .get("/api/preview/sessions", |r| {
            request_span(r, list_sessions_handler)
        })
        .get("/api/preview/sessions/:token", |r| {
            request_span(r, get_session_handler)
        })
        .post("/api/preview/sessions/:token/heartbeat", |r| {
            request_span(r, heartbeat_handler)
        })
        .post("/api/preview/sessions/:token/claim", |r| {
            request_span(r, claim_handler)
        })
        .post("/api/preview/sessions/:token/ready", |r| {
            request_span(r, ready_handler)
        })
        .post("/api/preview/sessions/:token/failed", |r| {
            request_span(r, failed_handler)
        })
        .get("/api/preview/schemas/active", |r| {
            request_span(r, active_schemas_handler)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_identifiers_validate() {
        validate_features(&["ecommerce.products".to_owned(), "booking".to_owned()]).unwrap();
        assert!(validate_features(&["Ecommerce.Products".to_owned()]).is_err());
        assert!(validate_features(&["ecommerce..products".to_owned()]).is_err());
        assert!(validate_features(&["ecommerce.products; DROP TABLE".to_owned()]).is_err());
        assert!(validate_features(&[".products".to_owned()]).is_err());

        let too_many: Vec<String> = (0..65).map(|i| format!("module{i}")).collect();
        assert!(validate_features(&too_many).is_err());
    }
}

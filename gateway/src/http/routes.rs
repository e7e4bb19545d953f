//! Gateway HTTP surfaces: `/health` and `/metrics`, the HMAC-guarded
//! `/internal/*` routes called by the authority, and the tenant
//! catch-all pipeline.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use preview_api::models::{
    InvalidateRequest, OkResponse, ProvisionData, ProvisionRequest, ResolvedSession,
    SchemaStatus, WithData,
};
use preview_api::schema_name::SchemaName;
use preview_api::PREVIEW_SESSION_HEADER;
use serde::Serialize;
use tracing::{error, info};
use utils::http::endpoint::{self, request_span};
use utils::http::error::ApiError;
use utils::http::json::{json_request_from_slice, json_response};
use utils::http::request::get_request_param;
use utils::http::{RequestExt, RouterBuilder};
use utils::signed_auth::verify_signed_request;
use utils::token::SessionToken;

use crate::authority_client::AuthorityError;
use crate::handlers::{self, TenantContext};
use crate::metrics::{SIGNATURE_REJECTIONS, TENANT_REQUESTS};
use crate::schema_mgr::ProvisionError;
use crate::{features, GatewayState};

fn get_state(request: &Request<Body>) -> Arc<GatewayState> {
    Arc::clone(
        request
            .data::<Arc<GatewayState>>()
            .expect("unknown state type"),
    )
}

/// Buffer the body and check the signed headers against it. Internal
/// handlers must call this before touching anything else.
async fn verify_internal(
    request: &mut Request<Body>,
    state: &GatewayState,
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
struct GatewayStatus {
    status: &'static str,
    service: &'static str,
}

/// Healthcheck handler; bypasses the tenant pipeline entirely.
async fn status_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(
        StatusCode::OK,
        GatewayStatus {
            status: "ok",
            service: "preview-gateway",
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

/// `POST /internal/schemas/provision`: the claim -> provision -> mark
/// orchestration. The authority row CAS is the only thing preventing a
/// double provision; this handler just acts on its verdict.
async fn provision_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let body = verify_internal(&mut request, &state).await?;
    let provision_req: ProvisionRequest = json_request_from_slice(&body)?;
    let token = provision_req.session_token;

    match state.authority.claim_session(&token).await {
        Ok(()) => {}
        Err(AuthorityError::AlreadyClaimed) => {
            // Someone else holds or held the claim; a fresh read decides
            // whether to reuse, report in-flight, or abort.
            let resolved = state.authority.resolve_session(&token).await.map_err(|e| {
                ApiError::AuthorityUnavailable(format!("cannot re-read claimed session: {e}").into())
            })?;
            return match resolved.schema_status {
                SchemaStatus::Ready => {
                    let schema_name = resolved.schema_name.ok_or_else(|| {
                        ApiError::InternalServerError(anyhow!("READY session without schema name"))
                    })?;
                    json_response(
                        StatusCode::OK,
                        WithData {
                            data: ProvisionData { schema_name },
                        },
                    )
                }
                SchemaStatus::Provisioning => Err(ApiError::AlreadyClaimed(
                    "provisioning already in flight".to_owned(),
                )),
                SchemaStatus::Failed => Err(ApiError::BadRequest(anyhow!(
                    "session provisioning previously failed"
                ))),
                SchemaStatus::Dropped => Err(ApiError::Gone("session was dropped".to_owned())),
                SchemaStatus::Pending => Err(ApiError::AlreadyClaimed(
                    "claim conflicted, retry".to_owned(),
                )),
            };
        }
        Err(AuthorityError::NotFound) => {
            return Err(ApiError::NotFound(anyhow!("session not found")))
        }
        Err(AuthorityError::Expired) => {
            return Err(ApiError::Gone("session expired".to_owned()))
        }
        Err(e) => {
            return Err(ApiError::AuthorityUnavailable(
                format!("claim failed: {e}").into(),
            ))
        }
    }

    // The claim is ours; from here every exit either marks READY or
    // FAILED so the session never sticks in PROVISIONING.
    match state
        .schema_mgr
        .provision(&token, &provision_req.features, &provision_req.tier)
        .await
    {
        Ok(schema_name) => {
            if let Err(e) = state.authority.mark_ready(&token, &schema_name).await {
                error!("provisioned {schema_name} but could not record it: {e:#}");
                if let Err(drop_err) = state.schema_mgr.drop_schema(&schema_name).await {
                    error!("rollback of unrecorded {schema_name} failed: {drop_err:#}");
                }
                let _ = state.authority.mark_failed(&token).await;
                return Err(ApiError::InternalServerError(anyhow!(
                    "failed to record provisioned schema: {e}"
                )));
            }
            json_response(
                StatusCode::OK,
                WithData {
                    data: ProvisionData { schema_name },
                },
            )
        }
        Err(e) => {
            if let Err(mark_err) = state.authority.mark_failed(&token).await {
                error!("could not mark session failed: {mark_err:#}");
            }
            Err(match e {
                ProvisionError::CapacityExhausted(msg) => ApiError::CapacityExhausted(msg),
                ProvisionError::InvalidName(e) => ApiError::BadRequest(e.into()),
                ProvisionError::Other(e) => ApiError::InternalServerError(e),
            })
        }
    }
}

/// `DELETE /internal/schemas/{schema_name}`.
async fn drop_schema_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let schema_name = get_request_param(&request, "schema_name")?.to_owned();
    verify_internal(&mut request, &state).await?;

    let schema = SchemaName::new(schema_name).map_err(|e| ApiError::BadRequest(e.into()))?;
    state
        .schema_mgr
        .drop_schema(&schema)
        .await
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, OkResponse { ok: true })
}

/// `POST /internal/sessions/invalidate`: evict cached session state.
async fn invalidate_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let body = verify_internal(&mut request, &state).await?;
    let invalidate_req: InvalidateRequest = json_request_from_slice(&body)?;

    let evicted = state.session_cache.invalidate(&invalidate_req.session_token);
    info!("session invalidation, entry evicted: {evicted}");
    json_response(StatusCode::OK, OkResponse { ok: true })
}

/// `GET /internal/emails/{session_token}`: privileged mailbox
/// inspection for the configurator's "view sent emails" panel.
async fn emails_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let token = SessionToken::from(get_request_param(&request, "session_token")?.to_owned());
    verify_internal(&mut request, &state).await?;

    let emails = state.sandbox.email.recorded_for(&token);
    json_response(StatusCode::OK, WithData { data: emails })
}

/// Resolve a token through the session cache, falling back to the
/// authority. Definitive negatives map to 401/410; transport problems
/// and an open circuit map to 503.
async fn resolve_session(
    state: &GatewayState,
    token: &SessionToken,
) -> Result<ResolvedSession, ApiError> {
    if let Some(resolved) = state.session_cache.get(token) {
        return Ok(resolved);
    }

    match state.authority.resolve_session(token).await {
        Ok(resolved) => {
            state.session_cache.insert(token.clone(), resolved.clone());
            Ok(resolved)
        }
        Err(AuthorityError::NotFound) => {
            Err(ApiError::Unauthorized("unknown preview session".to_owned()))
        }
        Err(AuthorityError::Expired) => {
            Err(ApiError::Gone("preview session expired".to_owned()))
        }
        Err(AuthorityError::CircuitOpen) => Err(ApiError::AuthorityUnavailable(
            "authority lookups are failing, try again shortly".into(),
        )),
        Err(e) => Err(ApiError::AuthorityUnavailable(
            format!("session resolution failed: {e}").into(),
        )),
    }
}

/// The tenant pipeline: session resolution, readiness gate, client
/// binding, sandbox binding, feature gate, dispatch.
async fn tenant_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let path = request.uri().path().to_owned();

    // Anything that should have matched an explicit route lands here
    // only when the route does not exist.
    if path == "/health" || path == "/metrics" || path.starts_with("/internal/") {
        return Err(ApiError::NotFound(anyhow!("no such route")));
    }

    let token = match request
        .headers()
        .get(PREVIEW_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(token) => SessionToken::from(token.to_owned()),
        None => {
            TENANT_REQUESTS.with_label_values(&["unauthorized"]).inc();
            return Err(ApiError::Unauthorized(format!(
                "missing {PREVIEW_SESSION_HEADER} header"
            )));
        }
    };

    let session = resolve_session(&state, &token).await?;

    if session.expires_at < Utc::now() {
        state.session_cache.invalidate(&token);
        TENANT_REQUESTS.with_label_values(&["expired"]).inc();
        return Err(ApiError::Gone("preview session expired".to_owned()));
    }

    if session.schema_status != SchemaStatus::Ready {
        TENANT_REQUESTS.with_label_values(&["not_ready"]).inc();
        return Err(ApiError::SchemaNotReady(format!(
            "schema status is {}",
            session.schema_status
        )));
    }
    let schema_name = session.schema_name.clone().ok_or_else(|| {
        ApiError::InternalServerError(anyhow!("READY session without schema name"))
    })?;

    let client = state
        .schema_mgr
        .client_for_schema(&schema_name)
        .await
        .map_err(ApiError::InternalServerError)?;

    // Feature-gate refusals are plain 404s: the response must not
    // betray whether the route exists for better-equipped sessions.
    if let Err(required) = features::check_access(&session, &path) {
        info!("feature gate refused {path} (requires {required})");
        TENANT_REQUESTS.with_label_values(&["feature_denied"]).inc();
        return Err(ApiError::NotFound(anyhow!("no handler for {path}")));
    }

    let ctx = TenantContext {
        token,
        session,
        client,
        sandbox: Arc::clone(&state.sandbox),
    };

    TENANT_REQUESTS.with_label_values(&["admitted"]).inc();
    handlers::dispatch(ctx, request).await
}

/// Gateway http router.
pub fn make_router(state: Arc<GatewayState>) -> RouterBuilder<hyper::Body, ApiError> {
    endpoint::make_router()
        .data(state)
        .get("/health", |r| request_span(r, status_handler))
        .get("/metrics", |r| request_span(r, metrics_handler))
        .post("/internal/schemas/provision", |r| {
            request_span(r, provision_handler)
        })
        .delete("/internal/schemas/:schema_name", |r| {
            request_span(r, drop_schema_handler)
        })
        .post("/internal/sessions/invalidate", |r| {
            request_span(r, invalidate_handler)
        })
        .get("/internal/emails/:session_token", |r| {
            request_span(r, emails_handler)
        })
        .any(|r| request_span(r, tenant_handler))
}

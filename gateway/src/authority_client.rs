//! Signed HTTP client for the authority's internal surface, plus the
//! circuit breaker that protects the tenant hot path from an
//! unreachable authority.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::StatusCode;
use parking_lot::Mutex;
use preview_api::models::{ActiveSchemasResponse, OkResponse, ResolvedSession, WithData};
use preview_api::schema_name::SchemaName;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use utils::http::error::HttpErrorBody;
use utils::signed_auth::{now_millis, InternalAuth, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use utils::token::SessionToken;

use crate::metrics::{CIRCUIT_REJECTIONS, CIRCUIT_STATE};

#[derive(thiserror::Error, Debug)]
pub enum AuthorityError {
    #[error("session not found")]
    NotFound,

    #[error("session expired")]
    Expired,

    #[error("session already claimed")]
    AlreadyClaimed,

    #[error("authority circuit is open")]
    CircuitOpen,

    #[error("receive body: {0}")]
    ReceiveBody(#[from] reqwest::Error),

    #[error("receive error body: {0}")]
    ReceiveErrorBody(String),

    #[error("authority API: {1}")]
    ApiError(StatusCode, String),
}

pub type Result<T> = std::result::Result<T, AuthorityError>;

/// Consecutive-failure breaker for authority lookups. While open,
/// session-cache misses fail fast instead of queueing on a dead peer.
pub struct CircuitBreaker {
    threshold: u32,
    reset_interval: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_interval: Duration) -> CircuitBreaker {
        assert!(threshold > 0);
        CircuitBreaker {
            threshold,
            reset_interval,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a call may proceed at `now`. After the reset interval
    /// the breaker lets a probe through; its outcome decides whether
    /// the circuit closes or re-opens.
    pub fn allow(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened_at) => now.duration_since(opened_at) >= self.reset_interval,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
        CIRCUIT_STATE.set(0);
    }

    pub fn record_failure(&self, now: Instant) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(now);
            CIRCUIT_STATE.set(1);
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        !self.allow(now)
    }
}

pub struct AuthorityClient {
    endpoint: String,
    auth: Arc<InternalAuth>,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl AuthorityClient {
    pub fn new(
        endpoint: String,
        auth: Arc<InternalAuth>,
        circuit_threshold: u32,
        circuit_reset_interval: Duration,
    ) -> AuthorityClient {
        AuthorityClient {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            auth,
            client: reqwest::Client::new(),
            breaker: CircuitBreaker::new(circuit_threshold, circuit_reset_interval),
        }
    }

    /// Resolve a token, breaker-guarded. A definitive negative (404 or
    /// 410) still counts as the authority being healthy.
    pub async fn resolve_session(&self, token: &SessionToken) -> Result<ResolvedSession> {
        if !self.breaker.allow(Instant::now()) {
            CIRCUIT_REJECTIONS.inc();
            return Err(AuthorityError::CircuitOpen);
        }

        let path = format!("/api/preview/sessions/{token}");
        let result: Result<WithData<ResolvedSession>> =
            self.request(Method::GET, &path, None::<&()>).await;

        match &result {
            Ok(_) | Err(AuthorityError::NotFound) | Err(AuthorityError::Expired) => {
                self.breaker.record_success()
            }
            Err(_) => self.breaker.record_failure(Instant::now()),
        }

        result.map(|w| w.data)
    }

    /// Atomically claim a PENDING session for provisioning.
    pub async fn claim_session(&self, token: &SessionToken) -> Result<()> {
        let path = format!("/api/preview/sessions/{token}/claim");
        self.request::<(), OkResponse>(Method::POST, &path, None)
            .await
            .map(|_| ())
    }

    pub async fn mark_ready(&self, token: &SessionToken, schema_name: &SchemaName) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadyBody<'a> {
            schema_name: &'a SchemaName,
        }
        let path = format!("/api/preview/sessions/{token}/ready");
        self.request::<_, OkResponse>(Method::POST, &path, Some(&ReadyBody { schema_name }))
            .await
            .map(|_| ())
    }

    pub async fn mark_failed(&self, token: &SessionToken) -> Result<()> {
        let path = format!("/api/preview/sessions/{token}/failed");
        self.request::<(), OkResponse>(Method::POST, &path, None)
            .await
            .map(|_| ())
    }

    /// Schema names the authority still considers live; consumed by the
    /// orphan sweep.
    pub async fn active_schemas(&self) -> Result<Vec<String>> {
        let resp: ActiveSchemasResponse = self
            .request::<(), _>(Method::GET, "/api/preview/schemas/active", None)
            .await?;
        Ok(resp.schema_names)
    }

    pub fn circuit_is_open(&self) -> bool {
        self.breaker.is_open(Instant::now())
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let body_bytes = match body {
            Some(body) => serde_json::to_vec(body).expect("request bodies are plain structs"),
            None => Vec::new(),
        };
        let timestamp = now_millis();
        let signature = self
            .auth
            .sign(method.as_str(), path, &body_bytes, timestamp);

        let mut req = self
            .client
            .request(method, format!("{}{path}", self.endpoint))
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature);
        if body.is_some() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_bytes);
        }

        let response = req.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            if status == StatusCode::NOT_FOUND {
                return Err(AuthorityError::NotFound);
            }
            if status == StatusCode::GONE {
                return Err(AuthorityError::Expired);
            }
            if status == StatusCode::CONFLICT {
                return Err(AuthorityError::AlreadyClaimed);
            }
            return Err(match response.json::<HttpErrorBody>().await {
                Ok(body) => AuthorityError::ApiError(status, body.error.message),
                Err(_) => AuthorityError::ReceiveErrorBody(format!(
                    "Http error ({}) at {path}.",
                    status.as_u16()
                )),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(AuthorityError::ReceiveBody)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Instant::now();
        assert!(breaker.allow(now));
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(breaker.allow(now), "below threshold stays closed");
        breaker.record_failure(now);
        assert!(!breaker.allow(now), "threshold reached, circuit open");
    }

    #[test]
    fn breaker_allows_probe_after_reset_interval() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let now = Instant::now();
        breaker.record_failure(now);
        assert!(!breaker.allow(now + Duration::from_secs(29)));
        assert!(breaker.allow(now + Duration::from_secs(30)));
    }

    #[test]
    fn success_fully_resets_the_breaker() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        // One failure after a success must not re-open a threshold-2
        // breaker.
        assert!(breaker.allow(now));
    }

    #[test]
    fn failed_probe_reopens_the_window() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let start = Instant::now();
        breaker.record_failure(start);
        let probe_time = start + Duration::from_secs(31);
        assert!(breaker.allow(probe_time));
        breaker.record_failure(probe_time);
        assert!(!breaker.allow(probe_time + Duration::from_secs(1)));
        assert!(breaker.allow(probe_time + Duration::from_secs(30)));
    }
}

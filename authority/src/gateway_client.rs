//! Signed HTTP client for the gateway's internal surface.

use std::sync::Arc;

use hyper::StatusCode;
use preview_api::models::{InvalidateRequest, OkResponse, ProvisionData, WithData};
use preview_api::schema_name::SchemaName;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use utils::http::error::HttpErrorBody;
use utils::signed_auth::{now_millis, InternalAuth, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use utils::token::SessionToken;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("another provision already holds the claim")]
    AlreadyClaimed,

    #[error("gateway refused: capacity exhausted")]
    CapacityExhausted,

    #[error("receive body: {0}")]
    ReceiveBody(#[from] reqwest::Error),

    #[error("receive error body: {0}")]
    ReceiveErrorBody(String),

    #[error("gateway API: {1}")]
    ApiError(StatusCode, String),
}

impl GatewayError {
    /// Errors where retrying cannot change the answer.
    pub fn is_permanent(&self) -> bool {
        match self {
            GatewayError::AlreadyClaimed => true,
            GatewayError::ApiError(status, _) => status.is_client_error(),
            GatewayError::CapacityExhausted
            | GatewayError::ReceiveBody(_)
            | GatewayError::ReceiveErrorBody(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

pub struct GatewayClient {
    endpoint: String,
    auth: Arc<InternalAuth>,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(endpoint: String, auth: Arc<InternalAuth>) -> GatewayClient {
        GatewayClient {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            auth,
            client: reqwest::Client::new(),
        }
    }

    /// Ask the gateway to provision the schema for a session. The
    /// gateway claims the session itself; a conflict surfaces as
    /// [`GatewayError::AlreadyClaimed`].
    pub async fn provision(
        &self,
        token: &SessionToken,
        features: &[String],
        tier: &str,
    ) -> Result<SchemaName> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ProvisionBody<'a> {
            session_token: &'a SessionToken,
            features: &'a [String],
            tier: &'a str,
        }

        let response: WithData<ProvisionData> = self
            .request(
                Method::POST,
                "/internal/schemas/provision",
                Some(&ProvisionBody {
                    session_token: token,
                    features,
                    tier,
                }),
            )
            .await?;
        Ok(response.data.schema_name)
    }

    /// `DROP SCHEMA IF EXISTS`: a missing schema is success, not error.
    pub async fn drop_schema(&self, schema_name: &str) -> Result<()> {
        let path = format!("/internal/schemas/{schema_name}");
        self.request::<(), OkResponse>(Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    /// Evict any cached session state the gateway holds for a token.
    pub async fn invalidate_session(&self, token: &SessionToken) -> Result<()> {
        self.request::<_, OkResponse>(
            Method::POST,
            "/internal/sessions/invalidate",
            Some(&InvalidateRequest {
                session_token: token.clone(),
            }),
        )
        .await
        .map(|_| ())
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
            if status == StatusCode::CONFLICT {
                return Err(GatewayError::AlreadyClaimed);
            }
            return Err(match response.json::<HttpErrorBody>().await {
                Ok(body) if body.error.code == "CAPACITY_EXHAUSTED" => {
                    GatewayError::CapacityExhausted
                }
                Ok(body) => GatewayError::ApiError(status, body.error.message),
                Err(_) => GatewayError::ReceiveErrorBody(format!(
                    "Http error ({}) at {path}.",
                    status.as_u16()
                )),
            });
        }

        response.json::<T>().await.map_err(GatewayError::ReceiveBody)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_classification() {
        assert!(GatewayError::AlreadyClaimed.is_permanent());
        assert!(
            GatewayError::ApiError(StatusCode::BAD_REQUEST, "bad".to_owned()).is_permanent()
        );
        assert!(
            !GatewayError::ApiError(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_owned())
                .is_permanent()
        );
        assert!(!GatewayError::CapacityExhausted.is_permanent());
    }
}

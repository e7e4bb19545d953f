//! Request/response types for the authority's public and internal
//! surfaces and the gateway's tenant surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utils::token::SessionToken;

use crate::schema_name::SchemaName;

/// Lifecycle state of a session's backing schema.
///
/// Transitions are monotonic: `Pending -> Provisioning -> {Ready | Failed}`,
/// and any state may reach the terminal `Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaStatus {
    Pending,
    Provisioning,
    Ready,
    Failed,
    Dropped,
}

impl SchemaStatus {
    /// Whether moving to `next` follows one of the declared lifecycle paths.
    pub fn can_transition_to(self, next: SchemaStatus) -> bool {
        use SchemaStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Pending, Dropped)
                | (Provisioning, Dropped)
                | (Ready, Dropped)
                | (Failed, Dropped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SchemaStatus::Dropped)
    }

    /// Text form stored in the catalogue's `schema_status` column.
    pub fn as_db_str(self) -> &'static str {
        match self {
            SchemaStatus::Pending => "PENDING",
            SchemaStatus::Provisioning => "PROVISIONING",
            SchemaStatus::Ready => "READY",
            SchemaStatus::Failed => "FAILED",
            SchemaStatus::Dropped => "DROPPED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<SchemaStatus> {
        match s {
            "PENDING" => Some(SchemaStatus::Pending),
            "PROVISIONING" => Some(SchemaStatus::Provisioning),
            "READY" => Some(SchemaStatus::Ready),
            "FAILED" => Some(SchemaStatus::Failed),
            "DROPPED" => Some(SchemaStatus::Dropped),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// `POST /api/preview/sessions` request body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub selected_features: Vec<String>,
    pub tier: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub token: SessionToken,
    pub expires_at: DateTime<Utc>,
    pub schema_status: SchemaStatus,
}

/// Session projection exposed to the configurator. Carries no secrets
/// beyond the token the caller already holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub selected_features: Vec<String>,
    pub tier: String,
    pub schema_name: Option<SchemaName>,
    pub schema_status: SchemaStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub expires_at: DateTime<Utc>,
}

/// `GET /api/preview/sessions/{token}` internal response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSession {
    pub schema_name: Option<SchemaName>,
    pub selected_features: Vec<String>,
    pub tier: String,
    pub schema_status: SchemaStatus,
    pub expires_at: DateTime<Utc>,
}

/// `POST /internal/schemas/provision` request body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub session_token: SessionToken,
    pub features: Vec<String>,
    pub tier: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionData {
    pub schema_name: SchemaName,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub session_token: SessionToken,
}

/// Envelope for internal responses that carry a payload, e.g.
/// `{"data": {"schemaName": "preview_ab12"}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WithData<T> {
    pub data: T,
}

/// `{"ok": true}` acknowledgement used by fire-and-forget internal calls.
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Schema names of all sessions the authority considers live, for the
/// gateway's orphan sweep.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSchemasResponse {
    pub schema_names: Vec<String>,
}

/// One mock email captured for a session, exposed on the privileged
/// inspection route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEmail {
    pub id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Snapshot returned by the gateway's capacity probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    pub active_schemas: usize,
    pub cached_clients: usize,
    pub heap_mb: u64,
    pub uptime_secs: u64,
}

/// Tenant-surface response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_paths_are_monotonic() {
        use SchemaStatus::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Dropped));
        assert!(Failed.can_transition_to(Dropped));

        // No path ever moves backwards.
        assert!(!Provisioning.can_transition_to(Pending));
        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Dropped.can_transition_to(Ready));
        assert!(!Dropped.can_transition_to(Pending));
    }

    #[test]
    fn status_db_round_trip() {
        for status in [
            SchemaStatus::Pending,
            SchemaStatus::Provisioning,
            SchemaStatus::Ready,
            SchemaStatus::Failed,
            SchemaStatus::Dropped,
        ] {
            assert_eq!(SchemaStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(SchemaStatus::from_db_str("ACTIVE"), None);
    }

    #[test]
    fn resolved_session_wire_format() {
        let resolved = ResolvedSession {
            schema_name: None,
            selected_features: vec!["ecommerce.products".to_owned()],
            tier: "pro".to_owned(),
            schema_status: SchemaStatus::Provisioning,
            expires_at: DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["schemaStatus"], "PROVISIONING");
        assert_eq!(json["selectedFeatures"][0], "ecommerce.products");
        assert!(json["schemaName"].is_null());
    }
}

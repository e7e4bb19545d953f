//! Session Authority: the authoritative catalogue of preview sessions,
//! their feature selections and schema lifecycle state. Exposes the
//! configurator surface publicly and lifecycle/resolve operations to
//! the gateway over the signed internal surface.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use utils::signed_auth::InternalAuth;

pub mod gateway_client;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod provision;
pub mod sweeper;

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "127.0.0.1:7800";

    pub const DEFAULT_MAX_SESSIONS_PER_IP: usize = 5;
    pub const DEFAULT_MAX_CONCURRENT_SCHEMAS: usize = 50;
    pub const DEFAULT_PREVIEW_TTL: Duration = Duration::from_secs(4 * 3600);
    pub const DEFAULT_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);
}

#[derive(Debug, Clone)]
pub struct AuthorityConf {
    pub listen_http_addr: String,
    pub database_url: String,
    pub gateway_endpoint: String,
    pub internal_api_secret: String,
    pub max_sessions_per_ip: usize,
    pub max_concurrent_schemas: usize,
    pub preview_ttl: Duration,
    pub expiry_sweep_interval: Duration,
    pub max_clock_skew: Duration,
}

/// Long-lived values owned by the composition root and shared with the
/// HTTP layer and background tasks.
pub struct AuthorityState {
    pub conf: Arc<AuthorityConf>,
    pub auth: Arc<InternalAuth>,
    pub store: Arc<persistence::SessionStore>,
    pub gateway: Arc<gateway_client::GatewayClient>,
    pub cancel: CancellationToken,
}

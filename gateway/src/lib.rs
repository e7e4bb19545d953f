//! Tenant Gateway: terminates preview-session traffic, owns the Schema
//! Manager (per-session schema provisioning, bounded client cache,
//! orphan sweeping) and substitutes sandbox providers for all real side
//! effects.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

use std::sync::Arc;
use std::time::Duration;

use utils::signed_auth::InternalAuth;

pub mod authority_client;
pub mod client_cache;
pub mod db;
pub mod ddl;
pub mod features;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod sandbox;
pub mod schema_mgr;
pub mod session_cache;

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "127.0.0.1:7810";

    pub const DEFAULT_MAX_CONCURRENT_SCHEMAS: usize = 50;
    pub const DEFAULT_MAX_CACHED_CLIENTS: usize = 20;
    pub const DEFAULT_CONNECTION_LIMIT_PER_CLIENT: usize = 2;
    pub const DEFAULT_SCHEMA_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_SESSION_CACHE_TTL: Duration = Duration::from_secs(60);
    pub const DEFAULT_CIRCUIT_THRESHOLD: u32 = 5;
    pub const DEFAULT_CIRCUIT_RESET_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);
    pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);
    pub const DEFAULT_HEAP_SOFT_CEILING_MB: u64 = 4096;

    /// The idle sweeper wakes on this fixed cadence regardless of the
    /// configured idle timeout.
    pub const CLIENT_IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
}

#[derive(Debug, Clone)]
pub struct GatewayConf {
    pub listen_http_addr: String,
    pub database_url: String,
    pub authority_endpoint: String,
    pub internal_api_secret: String,
    pub max_concurrent_schemas: usize,
    pub max_cached_clients: usize,
    pub connection_limit_per_client: usize,
    pub schema_idle_timeout: Duration,
    pub session_cache_ttl: Duration,
    pub circuit_threshold: u32,
    pub circuit_reset_interval: Duration,
    pub orphan_sweep_interval: Duration,
    pub max_clock_skew: Duration,
    pub heap_soft_ceiling_mb: u64,
    pub ddl_bundle_path: Option<std::path::PathBuf>,
}

impl GatewayConf {
    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        GatewayConf {
            listen_http_addr: defaults::DEFAULT_HTTP_LISTEN_ADDR.to_string(),
            database_url: "postgresql://localhost:5432/preview".to_string(),
            authority_endpoint: "http://127.0.0.1:7800".to_string(),
            internal_api_secret: "dummy-internal-secret".to_string(),
            max_concurrent_schemas: defaults::DEFAULT_MAX_CONCURRENT_SCHEMAS,
            max_cached_clients: 3,
            connection_limit_per_client: defaults::DEFAULT_CONNECTION_LIMIT_PER_CLIENT,
            schema_idle_timeout: defaults::DEFAULT_SCHEMA_IDLE_TIMEOUT,
            session_cache_ttl: defaults::DEFAULT_SESSION_CACHE_TTL,
            circuit_threshold: defaults::DEFAULT_CIRCUIT_THRESHOLD,
            circuit_reset_interval: defaults::DEFAULT_CIRCUIT_RESET_INTERVAL,
            orphan_sweep_interval: defaults::DEFAULT_ORPHAN_SWEEP_INTERVAL,
            max_clock_skew: defaults::DEFAULT_MAX_CLOCK_SKEW,
            heap_soft_ceiling_mb: defaults::DEFAULT_HEAP_SOFT_CEILING_MB,
            ddl_bundle_path: None,
        }
    }
}

/// Everything with process lifetime, built once by the composition root
/// in `bin/gateway.rs` and shared with the HTTP layer through router
/// data.
pub struct GatewayState {
    pub conf: Arc<GatewayConf>,
    pub auth: Arc<InternalAuth>,
    pub schema_mgr: Arc<schema_mgr::SchemaManager>,
    pub session_cache: Arc<session_cache::SessionCache>,
    pub authority: Arc<authority_client::AuthorityClient>,
    pub sandbox: Arc<sandbox::SandboxProviders>,
}

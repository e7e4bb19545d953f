//! Global gateway metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

pub static PROVISION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gateway_schema_provision_seconds",
        "Seconds spent creating, migrating and seeding one preview schema",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register gateway_schema_provision_seconds histogram")
});

pub static SCHEMAS_PROVISIONED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_schemas_provisioned_total",
        "Number of schema provision attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_schemas_provisioned_total counter")
});

pub static SCHEMAS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_schemas_dropped_total",
        "Number of preview schemas dropped"
    )
    .expect("Failed to register gateway_schemas_dropped_total counter")
});

pub static CLIENT_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gateway_client_cache_entries",
        "Schema clients currently held in the cache"
    )
    .expect("Failed to register gateway_client_cache_entries gauge")
});

pub static CLIENT_CACHE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_client_cache_evictions_total",
        "Client cache evictions by reason",
        &["reason"]
    )
    .expect("Failed to register gateway_client_cache_evictions_total counter")
});

pub static SESSION_CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_session_cache_lookups_total",
        "Session cache lookups by outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_session_cache_lookups_total counter")
});

pub static CIRCUIT_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gateway_authority_circuit_open",
        "1 while the authority circuit breaker is open, else 0"
    )
    .expect("Failed to register gateway_authority_circuit_open gauge")
});

pub static CIRCUIT_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_authority_circuit_rejections_total",
        "Resolve calls failed fast because the circuit was open"
    )
    .expect("Failed to register gateway_authority_circuit_rejections_total counter")
});

pub static ORPHAN_SWEEPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_orphan_sweeps_total",
        "Orphan sweep runs by outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_orphan_sweeps_total counter")
});

pub static ORPHAN_SCHEMAS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_orphan_schemas_dropped_total",
        "Preview schemas reclaimed by the orphan sweeper"
    )
    .expect("Failed to register gateway_orphan_schemas_dropped_total counter")
});

pub static SIGNATURE_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_internal_signature_rejections_total",
        "Internal requests rejected by signature or timestamp checks"
    )
    .expect("Failed to register gateway_internal_signature_rejections_total counter")
});

pub static TENANT_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_tenant_requests_total",
        "Tenant-surface requests by pipeline outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_tenant_requests_total counter")
});

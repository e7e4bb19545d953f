//! Global authority metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

pub static SESSIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "authority_sessions_created_total",
        "Preview sessions created"
    )
    .expect("Failed to register authority_sessions_created_total counter")
});

pub static SESSION_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "authority_session_rejections_total",
        "createSession rejections by reason",
        &["reason"]
    )
    .expect("Failed to register authority_session_rejections_total counter")
});

pub static SESSIONS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "authority_sessions_dropped_total",
        "Sessions marked DROPPED by the expiry sweeper"
    )
    .expect("Failed to register authority_sessions_dropped_total counter")
});

pub static HEARTBEATS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "authority_heartbeats_total",
        "Successful heartbeat extensions"
    )
    .expect("Failed to register authority_heartbeats_total counter")
});

pub static CLAIMS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "authority_claims_total",
        "markProvisioning outcomes",
        &["outcome"]
    )
    .expect("Failed to register authority_claims_total counter")
});

pub static PROVISION_KICKOFFS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "authority_provision_kickoffs_total",
        "Background provisioning calls to the gateway by outcome",
        &["outcome"]
    )
    .expect("Failed to register authority_provision_kickoffs_total counter")
});

pub static EXPIRY_SWEEP_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "authority_expiry_sweep_errors_total",
        "Expiry sweep iterations that failed"
    )
    .expect("Failed to register authority_expiry_sweep_errors_total counter")
});

pub static SIGNATURE_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "authority_internal_signature_rejections_total",
        "Internal requests rejected by signature or timestamp checks"
    )
    .expect("Failed to register authority_internal_signature_rejections_total counter")
});

//! Shared plumbing for the preview orchestrator services.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

/// Exponential backoff helpers for retry loops and background tasks.
pub mod backoff;

/// HTTP endpoint framework: router construction, error type, JSON and
/// request-param helpers.
pub mod http;

/// Tracing subscriber initialization.
pub mod logging;

/// HMAC request signing for the authority<->gateway internal surfaces.
pub mod signed_auth;

/// Session token newtype and generation.
pub mod token;

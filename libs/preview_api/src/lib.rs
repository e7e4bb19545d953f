#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

/// Wire types shared between the authority and the gateway.
pub mod models;
/// Deterministic session-token to schema-name derivation.
pub mod schema_name;

/// Header carrying the preview session token on the tenant surface.
pub const PREVIEW_SESSION_HEADER: &str = "X-Preview-Session";

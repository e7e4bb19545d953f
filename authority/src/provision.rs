//! Background provisioning kick-off: a freshly created session should
//! reach READY without the configurator having to call anything else.
//! The gateway owns the claim CAS and the READY/FAILED marks; this task
//! only places the call and retries transport-level failures.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};
use utils::backoff;
use utils::token::SessionToken;

use crate::gateway_client::GatewayError;
use crate::metrics::PROVISION_KICKOFFS;
use crate::AuthorityState;

/// Transport retries before giving up and leaving the session PENDING
/// for a later manual or gateway-side retry.
const MAX_PROVISION_RETRIES: u32 = 3;

pub fn spawn_provision(
    state: Arc<AuthorityState>,
    token: SessionToken,
    features: Vec<String>,
    tier: String,
) {
    let span = info_span!("provision_kickoff", token = ?token);
    tokio::spawn(
        async move {
            let result = backoff::retry(
                || state.gateway.provision(&token, &features, &tier),
                GatewayError::is_permanent,
                1,
                MAX_PROVISION_RETRIES,
                "provisioning preview schema",
                &state.cancel,
            )
            .await;

            match result {
                Some(Ok(schema_name)) => {
                    PROVISION_KICKOFFS.with_label_values(&["ok"]).inc();
                    info!("session provisioned into {schema_name}");
                }
                Some(Err(GatewayError::AlreadyClaimed)) => {
                    // Someone else is (or was) provisioning this session;
                    // nothing left for this task to do.
                    PROVISION_KICKOFFS.with_label_values(&["claimed"]).inc();
                    info!("provisioning already in flight elsewhere");
                }
                Some(Err(e)) => {
                    PROVISION_KICKOFFS.with_label_values(&["error"]).inc();
                    warn!("provisioning kick-off failed: {e:#}");
                }
                None => {
                    PROVISION_KICKOFFS.with_label_values(&["cancelled"]).inc();
                    info!("provisioning kick-off cancelled by shutdown");
                }
            }
        }
        .instrument(span),
    );
}

//! Expiry sweeper: periodically walks expired sessions, tears their
//! schemas down through the gateway and marks them DROPPED.
//!
//! The loop is idempotent and safe next to live traffic: it only acts
//! on rows whose expiry has passed, the gateway drop is IF EXISTS, and
//! the terminal mark is a conditional update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use utils::backoff;

use crate::metrics::{EXPIRY_SWEEP_ERRORS, SESSIONS_DROPPED};
use crate::AuthorityState;

const MAX_BACKOFF_SECS: f64 = 300.0;

#[derive(Debug, Default)]
pub struct SweepStats {
    pub seen: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub async fn expiry_sweep_loop(
    state: Arc<AuthorityState>,
    period: Duration,
    cancel: CancellationToken,
) {
    // How many errors we have seen consequtively
    let mut error_run_count: u32 = 0;

    loop {
        let sleep_duration = if error_run_count == 0 {
            period
        } else {
            Duration::from_secs_f64(backoff::exponential_backoff_duration_seconds(
                error_run_count,
                1.0,
                MAX_BACKOFF_SECS,
            ))
        };
        if tokio::time::timeout(sleep_duration, cancel.cancelled())
            .await
            .is_ok()
        {
            break;
        }

        let started_at = Instant::now();
        match sweep_iteration(&state)
            .instrument(info_span!("expiry_sweep"))
            .await
        {
            Ok(stats) => {
                error_run_count = 0;
                if stats.dropped > 0 || stats.failed > 0 {
                    info!(
                        "expiry sweep dropped {} of {} expired sessions ({} failed) in {:?}",
                        stats.dropped,
                        stats.seen,
                        stats.failed,
                        started_at.elapsed()
                    );
                }
            }
            Err(e) => {
                error_run_count += 1;
                EXPIRY_SWEEP_ERRORS.inc();
                error!("expiry sweep failed {error_run_count} times: {e:#}");
            }
        }
    }
}

async fn sweep_iteration(state: &AuthorityState) -> anyhow::Result<SweepStats> {
    let expired = state.store.expired_sessions().await?;
    let mut stats = SweepStats {
        seen: expired.len(),
        ..Default::default()
    };

    for session in expired {
        let schema_name = session.effective_schema_name();

        // Order matters: the schema must be gone before the catalogue
        // forgets it, otherwise a crash in between would leave a schema
        // no session references and only the orphan sweep could find.
        if let Err(e) = state.gateway.drop_schema(&schema_name).await {
            warn!("could not drop {schema_name} for expired session, will retry next sweep: {e:#}");
            stats.failed += 1;
            continue;
        }

        if let Err(e) = state.gateway.invalidate_session(&session.token).await {
            // The gateway's session cache TTL bounds how long the stale
            // entry can outlive us here.
            warn!("could not invalidate gateway session cache: {e:#}");
        }

        if state.store.mark_dropped(&session.token).await? {
            SESSIONS_DROPPED.inc();
            stats.dropped += 1;
        }
    }

    Ok(stats)
}

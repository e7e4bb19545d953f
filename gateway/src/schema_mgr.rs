//! The Schema Manager: turns claimed provisioning requests into live,
//! seeded per-session schemas, destroys them again, owns the bounded
//! client cache and reclaims orphans left behind by crashes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use preview_api::models::CapacitySnapshot;
use preview_api::schema_name::{is_valid_schema_name, schema_name_for_token, SchemaName};
use sysinfo::{ProcessExt, SystemExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use utils::token::SessionToken;

use crate::authority_client::AuthorityClient;
use crate::client_cache::{ClientCache, Connector};
use crate::db::{AdminClient, AdminGuard, SchemaClient};
use crate::ddl::{seed_statements_for, DdlBundle};
use crate::metrics::{
    ORPHAN_SCHEMAS_DROPPED, ORPHAN_SWEEPS, PROVISION_SECONDS, SCHEMAS_DROPPED,
    SCHEMAS_PROVISIONED,
};
use crate::GatewayConf;

/// Statement timeout applied to the admin session for the duration of
/// an orphan sweep, so one hung DDL cannot wedge the sweeper.
const SWEEP_STATEMENT_TIMEOUT: &str = "60s";

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error(transparent)]
    InvalidName(#[from] preview_api::schema_name::InvalidSchemaName),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Production connector for the client cache.
#[derive(Clone)]
pub struct PgConnector {
    database_url: Arc<String>,
    connection_limit: usize,
}

#[async_trait]
impl Connector for PgConnector {
    type Client = SchemaClient;

    async fn connect(&self, schema: &SchemaName) -> anyhow::Result<SchemaClient> {
        SchemaClient::connect(&self.database_url, schema, self.connection_limit).await
    }

    async fn disconnect(&self, client: SchemaClient) {
        client.disconnect().await;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub scanned: usize,
    pub dropped: usize,
}

pub struct SchemaManager {
    conf: Arc<GatewayConf>,
    admin: AdminClient,
    clients: ClientCache<PgConnector>,
    ddl: DdlBundle,
    sweep_running: AtomicBool,
    started_at: Instant,
}

impl SchemaManager {
    pub fn new(conf: Arc<GatewayConf>) -> anyhow::Result<SchemaManager> {
        let admin = AdminClient::new(&conf.database_url)?;
        let ddl = DdlBundle::load(conf.ddl_bundle_path.as_deref())?;
        let connector = PgConnector {
            database_url: Arc::new(conf.database_url.clone()),
            connection_limit: conf.connection_limit_per_client,
        };
        let clients = ClientCache::new(
            connector,
            conf.max_cached_clients,
            conf.schema_idle_timeout,
        );
        Ok(SchemaManager {
            conf,
            admin,
            clients,
            ddl,
            sweep_running: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn clients(&self) -> &ClientCache<PgConnector> {
        &self.clients
    }

    /// Pooled client pinned to `schema`. Misses self-heal by dialing a
    /// new client; callers never see cache bookkeeping errors.
    pub async fn client_for_schema(
        &self,
        schema: &SchemaName,
    ) -> anyhow::Result<Arc<SchemaClient>> {
        self.clients.get_or_connect(schema).await
    }

    /// Create, migrate and seed the schema for `token`.
    ///
    /// All-or-nothing: any failure after CREATE SCHEMA triggers a
    /// compensating DROP ... CASCADE and client eviction, then the
    /// original error propagates.
    pub async fn provision(
        &self,
        token: &SessionToken,
        features: &[String],
        tier: &str,
    ) -> Result<SchemaName, ProvisionError> {
        let schema = schema_name_for_token(token);

        let snapshot = self.capacity().await;
        if snapshot.active_schemas >= self.conf.max_concurrent_schemas {
            return Err(ProvisionError::CapacityExhausted(format!(
                "{} of {} schemas live",
                snapshot.active_schemas, self.conf.max_concurrent_schemas
            )));
        }
        if snapshot.heap_mb > self.conf.heap_soft_ceiling_mb {
            return Err(ProvisionError::CapacityExhausted(format!(
                "process heap {} MB above soft ceiling {} MB",
                snapshot.heap_mb, self.conf.heap_soft_ceiling_mb
            )));
        }

        info!("provisioning schema {schema} (tier {tier}, {} features)", features.len());
        let timer = PROVISION_SECONDS.start_timer();

        // The whole logical unit runs on the exclusively-held admin
        // session: nothing else may interleave while the search path
        // points into the session schema.
        let mut admin = self.admin.lock().await;

        ensure_ddl_safe(&schema)?;
        admin
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
            .await
            .map_err(ProvisionError::Other)?;

        match Self::migrate_and_seed(&mut admin, &self.ddl, &schema, features).await {
            Ok(()) => {
                drop(admin);
                timer.observe_duration();
                SCHEMAS_PROVISIONED.with_label_values(&["ok"]).inc();
                info!("schema {schema} provisioned");
                Ok(schema)
            }
            Err(e) => {
                // Compensate: no partial schema may survive a failed
                // provision. The original error wins over cleanup noise.
                if let Err(drop_err) = Self::drop_with_guard(&mut admin, &schema).await {
                    error!("rollback of {schema} failed, orphan sweep will reclaim it: {drop_err:#}");
                }
                drop(admin);
                self.clients.remove(&schema);
                timer.stop_and_discard();
                SCHEMAS_PROVISIONED.with_label_values(&["error"]).inc();
                Err(ProvisionError::Other(e))
            }
        }
    }

    async fn migrate_and_seed(
        admin: &mut AdminGuard<'_>,
        ddl: &DdlBundle,
        schema: &SchemaName,
        features: &[String],
    ) -> anyhow::Result<()> {
        ensure_ddl_safe(schema)?;
        admin
            .batch_execute(&format!("SET search_path TO \"{schema}\""))
            .await?;

        let replay = async {
            admin.batch_execute(ddl.sql()).await?;
            for statement in seed_statements_for(features) {
                admin.batch_execute(statement).await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        // Point the session back at the public namespace whatever
        // happened above; a replay error still wins the propagation.
        let restore = admin.batch_execute("SET search_path TO public").await;
        replay.and(restore)
    }

    /// `DROP SCHEMA IF EXISTS .. CASCADE` plus client eviction.
    pub async fn drop_schema(&self, schema: &SchemaName) -> anyhow::Result<()> {
        let mut admin = self.admin.lock().await;
        Self::drop_with_guard(&mut admin, schema).await?;
        drop(admin);
        self.clients.remove(schema);
        SCHEMAS_DROPPED.inc();
        info!("dropped schema {schema}");
        Ok(())
    }

    async fn drop_with_guard(
        admin: &mut AdminGuard<'_>,
        schema: &SchemaName,
    ) -> anyhow::Result<()> {
        ensure_ddl_safe(schema)?;
        admin
            .batch_execute(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
            .await
    }

    /// Every `preview_*` namespace currently in the backing store.
    pub async fn list_preview_schemas(&self) -> anyhow::Result<Vec<SchemaName>> {
        let rows = self
            .admin
            .query(
                "SELECT nspname FROM pg_namespace WHERE nspname LIKE 'preview\\_%'",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name: String = row.get(0);
                match SchemaName::new(name) {
                    Ok(schema) => Some(schema),
                    Err(e) => {
                        warn!("ignoring malformed preview namespace: {e}");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn capacity(&self) -> CapacitySnapshot {
        // The namespace listing is authoritative; the cache size is only
        // a fallback when the probe itself fails.
        let active_schemas = match self.list_preview_schemas().await {
            Ok(schemas) => schemas.len(),
            Err(e) => {
                warn!("capacity probe failed to list schemas, using cache size: {e:#}");
                self.clients.len()
            }
        };
        CapacitySnapshot {
            active_schemas,
            cached_clients: self.clients.len(),
            heap_mb: current_heap_mb(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Reclaim schemas that no live session accounts for: empty ones
    /// (crash between CREATE and the DDL replay) and ones absent from
    /// the authority's active set.
    ///
    /// Returns `None` when a sweep is already in flight; concurrent
    /// triggers are dropped, not queued.
    pub async fn orphan_sweep(
        &self,
        active: Option<&HashSet<String>>,
    ) -> anyhow::Result<Option<SweepOutcome>> {
        if self
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            ORPHAN_SWEEPS.with_label_values(&["skipped"]).inc();
            return Ok(None);
        }
        let _running = scopeguard::guard((), |_| {
            self.sweep_running.store(false, Ordering::SeqCst);
        });

        let mut admin = self.admin.lock().await;
        admin
            .batch_execute(&format!(
                "SET statement_timeout = '{SWEEP_STATEMENT_TIMEOUT}'"
            ))
            .await?;

        let outcome = self.sweep_inner(&mut admin, active).await;

        if let Err(e) = admin.batch_execute("RESET statement_timeout").await {
            warn!("failed to reset sweep statement timeout: {e:#}");
        }

        match outcome {
            Ok(outcome) => {
                ORPHAN_SWEEPS.with_label_values(&["ok"]).inc();
                Ok(Some(outcome))
            }
            Err(e) => {
                ORPHAN_SWEEPS.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }

    async fn sweep_inner(
        &self,
        admin: &mut AdminGuard<'_>,
        active: Option<&HashSet<String>>,
    ) -> anyhow::Result<SweepOutcome> {
        let rows = admin
            .query(
                "SELECT nspname FROM pg_namespace WHERE nspname LIKE 'preview\\_%'",
                &[],
            )
            .await?;

        let mut outcome = SweepOutcome::default();
        for row in rows {
            let name: String = row.get(0);
            let schema = match SchemaName::new(name) {
                Ok(schema) => schema,
                Err(e) => {
                    warn!("orphan sweep skipping malformed namespace: {e}");
                    continue;
                }
            };
            outcome.scanned += 1;

            let table_count: i64 = admin
                .query(
                    "SELECT count(*) FROM pg_class c \
                     JOIN pg_namespace n ON c.relnamespace = n.oid \
                     WHERE n.nspname = $1 AND c.relkind = 'r'",
                    &[&schema.as_str()],
                )
                .await?
                .first()
                .map(|row| row.get(0))
                .unwrap_or(0);

            let unreferenced =
                active.is_some_and(|active| !active.contains(schema.as_str()));
            if table_count == 0 || unreferenced {
                info!(
                    "orphan sweep dropping {schema} (tables: {table_count}, referenced: {})",
                    !unreferenced
                );
                Self::drop_with_guard(admin, &schema).await?;
                self.clients.remove(&schema);
                ORPHAN_SCHEMAS_DROPPED.inc();
                outcome.dropped += 1;
            }
        }
        Ok(outcome)
    }

    /// Full drain for process stop: every cached client goes first, the
    /// admin client last.
    pub async fn shutdown(&self) {
        self.clients.drain().await;
        self.admin.disconnect().await;
        info!("schema manager drained");
    }
}

/// The schema-name shape check, applied once at derivation and again
/// immediately before raw DDL composition.
fn ensure_ddl_safe(schema: &SchemaName) -> anyhow::Result<()> {
    if !is_valid_schema_name(schema.as_str()) {
        anyhow::bail!("schema name failed DDL safety check: {schema}");
    }
    Ok(())
}

/// Resident memory of this process in MB, for the capacity probe.
fn current_heap_mb() -> u64 {
    let mut system = sysinfo::System::new();
    if let Ok(pid) = sysinfo::get_current_pid() {
        if system.refresh_process(pid) {
            if let Some(process) = system.process(pid) {
                return process.memory() / (1024 * 1024);
            }
        }
    }
    0
}

/// Periodic idle eviction over the client cache, in the vein of a
/// per-resource eviction task: wake on a fixed cadence, do one sweep,
/// sleep until cancelled.
pub async fn idle_sweep_loop(
    schema_mgr: Arc<SchemaManager>,
    period: Duration,
    cancel: CancellationToken,
) {
    loop {
        if tokio::time::timeout(period, cancel.cancelled()).await.is_ok() {
            break;
        }
        let evicted = schema_mgr.clients.sweep_idle();
        if evicted > 0 {
            info!("idle sweep evicted {evicted} schema clients");
        }
    }
}

/// Periodic orphan reclamation. Fetches the authority's active set each
/// round; if the authority is unreachable the sweep still runs in
/// empty-schema-only mode rather than not at all.
pub async fn orphan_sweep_loop(
    schema_mgr: Arc<SchemaManager>,
    authority: Arc<AuthorityClient>,
    period: Duration,
    cancel: CancellationToken,
) {
    loop {
        if tokio::time::timeout(period, cancel.cancelled()).await.is_ok() {
            break;
        }

        let active = match authority.active_schemas().await {
            Ok(names) => Some(names.into_iter().collect::<HashSet<_>>()),
            Err(e) => {
                warn!("could not fetch active schemas, sweeping empty schemas only: {e:#}");
                None
            }
        };

        match schema_mgr
            .orphan_sweep(active.as_ref())
            .instrument(info_span!("orphan_sweep"))
            .await
        {
            Ok(Some(outcome)) => {
                info!(
                    "orphan sweep scanned {} schemas, dropped {}",
                    outcome.scanned, outcome.dropped
                );
            }
            Ok(None) => info!("orphan sweep already running, skipped"),
            Err(e) => error!("orphan sweep failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_safety_check_accepts_derived_names() {
        let token = SessionToken::generate();
        let schema = schema_name_for_token(&token);
        ensure_ddl_safe(&schema).unwrap();
    }

    #[test]
    fn sweep_flag_serialises_entry() {
        let conf = Arc::new(crate::GatewayConf::dummy());
        let mgr = SchemaManager::new(conf).unwrap();
        assert!(mgr
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok());
        // Second entry must bounce while the first holds the flag.
        assert!(mgr
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err());
        mgr.sweep_running.store(false, Ordering::SeqCst);
        assert!(mgr
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok());
    }

    #[test]
    fn heap_probe_reports_something() {
        // Smoke check: the probe must not panic and should see a live
        // process.
        let _ = current_heap_mb();
    }
}

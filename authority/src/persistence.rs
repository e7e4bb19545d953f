//! The session catalogue, one `sessions` table in the globally shared
//! schema.
//!
//! Every lifecycle transition is a single conditional UPDATE: the
//! database row CAS is the only coordination primitive between the two
//! processes, so there is deliberately no application-level locking
//! here beyond the per-IP advisory lock inside session creation.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use preview_api::models::SchemaStatus;
use preview_api::schema_name::schema_name_for_token;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::debug;
use utils::token::SessionToken;

const MIGRATION: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    token              TEXT PRIMARY KEY,
    selected_features  TEXT[] NOT NULL,
    tier               TEXT NOT NULL,
    origin_ip          TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at         TIMESTAMPTZ NOT NULL,
    schema_name        TEXT,
    schema_status      TEXT NOT NULL DEFAULT 'PENDING',
    last_heartbeat_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS sessions_origin_ip_idx
    ON sessions (origin_ip) WHERE schema_status <> 'DROPPED';
CREATE INDEX IF NOT EXISTS sessions_expires_at_idx
    ON sessions (expires_at) WHERE schema_status <> 'DROPPED';
";

/// How many expired sessions one sweep iteration processes.
const EXPIRED_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token: SessionToken,
    pub selected_features: Vec<String>,
    pub tier: String,
    pub origin_ip: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub schema_name: Option<String>,
    pub schema_status: SchemaStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn from_row(row: &Row) -> anyhow::Result<SessionRecord> {
        let status: String = row.get("schema_status");
        Ok(SessionRecord {
            token: SessionToken::from(row.get::<_, String>("token")),
            selected_features: row.get("selected_features"),
            tier: row.get("tier"),
            origin_ip: row.get("origin_ip"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            schema_name: row.get("schema_name"),
            schema_status: SchemaStatus::from_db_str(&status)
                .with_context(|| format!("unknown schema_status {status:?} in catalogue"))?,
            last_heartbeat_at: row.get("last_heartbeat_at"),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// The schema this session accounts for: the recorded name once
    /// READY, otherwise the derived name (a PROVISIONING session may
    /// have created its schema without having recorded it yet).
    pub fn effective_schema_name(&self) -> String {
        self.schema_name
            .clone()
            .unwrap_or_else(|| schema_name_for_token(&self.token).as_str().to_owned())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CreateSessionError {
    #[error("too many concurrent sessions for ip {0}")]
    TooManyForIp(String),

    #[error("schema capacity exhausted")]
    CapacityExhausted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The CAS matched; the caller owns provisioning now.
    Claimed,
    /// Another caller got there first; this is its current status.
    AlreadyInStatus(SchemaStatus),
    NotFound,
}

struct Conn {
    client: tokio_postgres::Client,
    conn_task: tokio::task::JoinHandle<()>,
}

impl Conn {
    async fn open(config: &tokio_postgres::Config) -> anyhow::Result<Conn> {
        let (client, connection) = config
            .connect(NoTls)
            .await
            .context("connecting to postgres")?;
        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection closed: {e}");
            }
        });
        Ok(Conn { client, conn_task })
    }
}

/// Catalogue access. One lazily-connected session, re-dialed after
/// connection-level failures.
pub struct SessionStore {
    config: tokio_postgres::Config,
    conn: tokio::sync::Mutex<Option<Conn>>,
}

impl SessionStore {
    pub fn new(database_url: &str) -> anyhow::Result<SessionStore> {
        let mut config =
            tokio_postgres::Config::from_str(database_url).context("parsing DATABASE_URL")?;
        config.application_name("preview-authority");
        Ok(SessionStore {
            config,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// Create the catalogue table; runs on every startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Conn::open(&self.config).await?);
        }
        let result = guard
            .as_ref()
            .expect("just ensured")
            .client
            .batch_execute(MIGRATION)
            .await;
        Self::settle(&mut guard, result).context("running catalogue migration")
    }

    /// Drop the connection if the statement failure was connection-level
    /// so the next call re-dials.
    fn settle<T>(
        guard: &mut tokio::sync::MutexGuard<'_, Option<Conn>>,
        result: Result<T, tokio_postgres::Error>,
    ) -> anyhow::Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_closed() {
                    **guard = None;
                }
                Err(e.into())
            }
        }
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Conn::open(&self.config).await?);
        }
        let result = guard
            .as_ref()
            .expect("just ensured")
            .client
            .query(sql, params)
            .await;
        Self::settle(&mut guard, result)
    }

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Conn::open(&self.config).await?);
        }
        let result = guard
            .as_ref()
            .expect("just ensured")
            .client
            .query_opt(sql, params)
            .await;
        Self::settle(&mut guard, result)
    }

    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> anyhow::Result<u64> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Conn::open(&self.config).await?);
        }
        let result = guard
            .as_ref()
            .expect("just ensured")
            .client
            .execute(sql, params)
            .await;
        Self::settle(&mut guard, result)
    }

    /// Insert a new PENDING session, enforcing the per-IP and global
    /// caps inside one transaction. The advisory xact lock keyed by the
    /// IP serialises racing creations from the same address, which a
    /// plain conditional insert cannot do under READ COMMITTED.
    pub async fn create_session(
        &self,
        token: &SessionToken,
        selected_features: &[String],
        tier: &str,
        origin_ip: &str,
        ttl: Duration,
        max_sessions_per_ip: usize,
        max_concurrent_schemas: usize,
    ) -> Result<SessionRecord, CreateSessionError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(
                Conn::open(&self.config)
                    .await
                    .map_err(CreateSessionError::Other)?,
            );
        }
        let mut conn = guard.take().expect("just ensured");

        let (result, keep_conn) = Self::create_session_in(
            &mut conn,
            token,
            selected_features,
            tier,
            origin_ip,
            ttl,
            max_sessions_per_ip,
            max_concurrent_schemas,
        )
        .await;

        if keep_conn {
            *guard = Some(conn);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_session_in(
        conn: &mut Conn,
        token: &SessionToken,
        selected_features: &[String],
        tier: &str,
        origin_ip: &str,
        ttl: Duration,
        max_sessions_per_ip: usize,
        max_concurrent_schemas: usize,
    ) -> (Result<SessionRecord, CreateSessionError>, bool) {
        let tx = match conn.client.transaction().await {
            Ok(tx) => tx,
            Err(e) => {
                let is_closed = e.is_closed();
                let err = CreateSessionError::Other(
                    anyhow::Error::from(e).context("opening transaction"),
                );
                return (Err(err), !is_closed);
            }
        };

        if let Err(e) = tx
            .execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&origin_ip])
            .await
            .context("taking per-ip advisory lock")
        {
            return (Err(CreateSessionError::Other(e)), true);
        }

        let per_ip: i64 = match tx
            .query_one(
                "SELECT count(*) FROM sessions \
                 WHERE origin_ip = $1 AND schema_status <> 'DROPPED' AND expires_at > now()",
                &[&origin_ip],
            )
            .await
            .context("counting per-ip sessions")
        {
            Ok(row) => row.get(0),
            Err(e) => return (Err(CreateSessionError::Other(e)), true),
        };
        if per_ip >= max_sessions_per_ip as i64 {
            return (
                Err(CreateSessionError::TooManyForIp(origin_ip.to_owned())),
                true,
            );
        }

        let global: i64 = match tx
            .query_one(
                "SELECT count(*) FROM sessions \
                 WHERE schema_status <> 'DROPPED' AND expires_at > now()",
                &[],
            )
            .await
            .context("counting live sessions")
        {
            Ok(row) => row.get(0),
            Err(e) => return (Err(CreateSessionError::Other(e)), true),
        };
        if global >= max_concurrent_schemas as i64 {
            return (Err(CreateSessionError::CapacityExhausted), true);
        }

        let ttl_secs = ttl.as_secs() as f64;
        let features: Vec<String> = selected_features.to_vec();
        let row = match tx
            .query_one(
                "INSERT INTO sessions \
                 (token, selected_features, tier, origin_ip, expires_at, schema_status) \
                 VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5), 'PENDING') \
                 RETURNING *",
                &[&token.as_str(), &features, &tier, &origin_ip, &ttl_secs],
            )
            .await
            .context("inserting session")
        {
            Ok(row) => row,
            Err(e) => return (Err(CreateSessionError::Other(e)), true),
        };
        let record = match SessionRecord::from_row(&row) {
            Ok(record) => record,
            Err(e) => return (Err(CreateSessionError::Other(e)), true),
        };

        if let Err(e) = tx.commit().await.context("committing session insert") {
            return (Err(CreateSessionError::Other(e)), true);
        }
        (Ok(record), true)
    }

    pub async fn get(&self, token: &SessionToken) -> anyhow::Result<Option<SessionRecord>> {
        let row = self
            .query_opt("SELECT * FROM sessions WHERE token = $1", &[&token.as_str()])
            .await?;
        row.as_ref().map(SessionRecord::from_row).transpose()
    }

    pub async fn list_for_ip(&self, origin_ip: &str) -> anyhow::Result<Vec<SessionRecord>> {
        let rows = self
            .query(
                "SELECT * FROM sessions \
                 WHERE origin_ip = $1 AND schema_status <> 'DROPPED' \
                 ORDER BY created_at DESC",
                &[&origin_ip],
            )
            .await?;
        rows.iter().map(SessionRecord::from_row).collect()
    }

    /// Extend the expiry by the TTL from now. `GREATEST` keeps the
    /// expiry monotonic: a heartbeat never moves it backwards.
    pub async fn heartbeat(
        &self,
        token: &SessionToken,
        ttl: Duration,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let ttl_secs = ttl.as_secs() as f64;
        let row = self
            .query_opt(
                "UPDATE sessions \
                 SET expires_at = GREATEST(expires_at, now() + make_interval(secs => $2)), \
                     last_heartbeat_at = now() \
                 WHERE token = $1 AND schema_status <> 'DROPPED' AND expires_at > now() \
                 RETURNING expires_at",
                &[&token.as_str(), &ttl_secs],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    /// The provisioning claim: one conditional UPDATE that only matches
    /// a PENDING row. Exactly one of any number of concurrent callers
    /// sees `Claimed`.
    pub async fn claim_provisioning(&self, token: &SessionToken) -> anyhow::Result<ClaimOutcome> {
        let claimed = self
            .execute(
                "UPDATE sessions SET schema_status = 'PROVISIONING' \
                 WHERE token = $1 AND schema_status = 'PENDING'",
                &[&token.as_str()],
            )
            .await?;
        if claimed == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        // The CAS matched nothing; report the status the row holds now
        // so the caller can decide to wait, reuse or abort.
        match self.get(token).await? {
            Some(record) => Ok(ClaimOutcome::AlreadyInStatus(record.schema_status)),
            None => Ok(ClaimOutcome::NotFound),
        }
    }

    pub async fn mark_ready(
        &self,
        token: &SessionToken,
        schema_name: &str,
    ) -> anyhow::Result<bool> {
        let updated = self
            .execute(
                "UPDATE sessions SET schema_status = 'READY', schema_name = $2 \
                 WHERE token = $1 AND schema_status = 'PROVISIONING'",
                &[&token.as_str(), &schema_name],
            )
            .await?;
        Ok(updated == 1)
    }

    pub async fn mark_failed(&self, token: &SessionToken) -> anyhow::Result<bool> {
        let updated = self
            .execute(
                "UPDATE sessions SET schema_status = 'FAILED', schema_name = NULL \
                 WHERE token = $1 AND schema_status = 'PROVISIONING'",
                &[&token.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    pub async fn mark_dropped(&self, token: &SessionToken) -> anyhow::Result<bool> {
        let updated = self
            .execute(
                "UPDATE sessions SET schema_status = 'DROPPED' \
                 WHERE token = $1 AND schema_status <> 'DROPPED'",
                &[&token.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    /// Expired, not-yet-dropped sessions for the sweeper, oldest first.
    pub async fn expired_sessions(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let rows = self
            .query(
                "SELECT * FROM sessions \
                 WHERE expires_at < now() AND schema_status <> 'DROPPED' \
                 ORDER BY expires_at LIMIT $1",
                &[&EXPIRED_BATCH_SIZE],
            )
            .await?;
        rows.iter().map(SessionRecord::from_row).collect()
    }

    /// Schema names of sessions the orphan sweep must not reclaim.
    /// PROVISIONING sessions have no recorded name yet, so theirs is
    /// re-derived from the token.
    pub async fn active_schema_names(&self) -> anyhow::Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT * FROM sessions \
                 WHERE schema_status IN ('PENDING', 'PROVISIONING', 'READY') \
                 AND expires_at > now()",
                &[],
            )
            .await?;
        let records: Vec<SessionRecord> = rows
            .iter()
            .map(SessionRecord::from_row)
            .collect::<anyhow::Result<_>>()?;
        Ok(records
            .iter()
            .map(SessionRecord::effective_schema_name)
            .collect())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            drop(conn.client);
            if let Err(e) = conn.conn_task.await {
                debug!("catalogue connection task ended: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_schema_name_prefers_recorded_name() {
        let token = SessionToken::generate();
        let mut record = SessionRecord {
            token: token.clone(),
            selected_features: vec![],
            tier: "free".to_owned(),
            origin_ip: "127.0.0.1".to_owned(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            schema_name: Some("preview_cafebabe".to_owned()),
            schema_status: SchemaStatus::Ready,
            last_heartbeat_at: None,
        };
        assert_eq!(record.effective_schema_name(), "preview_cafebabe");

        record.schema_name = None;
        record.schema_status = SchemaStatus::Provisioning;
        assert_eq!(
            record.effective_schema_name(),
            schema_name_for_token(&token).as_str()
        );
    }

    #[test]
    fn expiry_check_uses_the_given_instant() {
        let record = SessionRecord {
            token: SessionToken::generate(),
            selected_features: vec![],
            tier: "free".to_owned(),
            origin_ip: "127.0.0.1".to_owned(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            schema_name: None,
            schema_status: SchemaStatus::Pending,
            last_heartbeat_at: None,
        };
        assert!(!record.is_expired(Utc::now()));
        assert!(record.is_expired(Utc::now() + chrono::Duration::hours(2)));
    }
}

//! Database client plumbing: the singleton admin client used for DDL
//! and cross-schema queries, and the schema-pinned clients handed out
//! to tenant requests.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use preview_api::schema_name::SchemaName;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

/// One established connection plus the task driving its socket.
struct Conn {
    client: Client,
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

/// The singleton client for DDL and catalogue queries. It is never
/// pinned to a schema; statements qualify their namespaces explicitly
/// or set the search path for the duration of a held [`AdminGuard`].
///
/// Connects lazily and reconnects after a connection-level error, so a
/// bounced database does not wedge the process.
pub struct AdminClient {
    config: tokio_postgres::Config,
    conn: tokio::sync::Mutex<Option<Conn>>,
}

impl AdminClient {
    pub fn new(database_url: &str) -> anyhow::Result<AdminClient> {
        let mut config =
            tokio_postgres::Config::from_str(database_url).context("parsing DATABASE_URL")?;
        config.application_name("preview-gateway-admin");
        Ok(AdminClient {
            config,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// Take the admin session for a sequence of statements that must not
    /// interleave with anyone else's (search-path changes, statement
    /// timeouts). Provisioning and sweeping both serialise on this.
    pub async fn lock(&self) -> AdminGuard<'_> {
        AdminGuard {
            conn: self.conn.lock().await,
            config: &self.config,
        }
    }

    pub async fn batch_execute(&self, sql: &str) -> anyhow::Result<()> {
        self.lock().await.batch_execute(sql).await
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> anyhow::Result<Vec<tokio_postgres::Row>> {
        self.lock().await.query(sql, params).await
    }

    /// Disconnect for process shutdown. The admin client goes down after
    /// every schema client has been drained.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            drop(conn.client);
            if let Err(e) = conn.conn_task.await {
                debug!("admin connection task ended: {e}");
            }
        }
    }
}

/// Exclusive use of the admin session. Statements reconnect lazily and
/// drop the session on connection-level failures so the next statement
/// starts from a clean slate.
pub struct AdminGuard<'a> {
    conn: tokio::sync::MutexGuard<'a, Option<Conn>>,
    config: &'a tokio_postgres::Config,
}

impl AdminGuard<'_> {
    async fn ensure(&mut self) -> anyhow::Result<&Conn> {
        if self.conn.is_none() {
            *self.conn = Some(Conn::open(self.config).await?);
        }
        Ok(self.conn.as_ref().expect("just ensured"))
    }

    pub async fn batch_execute(&mut self, sql: &str) -> anyhow::Result<()> {
        let conn = self.ensure().await?;
        match conn.client.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_closed() {
                    *self.conn = None;
                }
                Err(e).context("executing statement")
            }
        }
    }

    pub async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> anyhow::Result<Vec<tokio_postgres::Row>> {
        let conn = self.ensure().await?;
        match conn.client.query(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if e.is_closed() {
                    *self.conn = None;
                }
                Err(e).context("running query")
            }
        }
    }
}

/// A pool of up to `connection_limit` connections pinned to one preview
/// schema through `search_path`. Requests check clients out round-robin;
/// tokio-postgres pipelines concurrent statements on each connection.
pub struct SchemaClient {
    schema: SchemaName,
    conns: Vec<Conn>,
    next: AtomicUsize,
}

impl SchemaClient {
    pub async fn connect(
        database_url: &str,
        schema: &SchemaName,
        connection_limit: usize,
    ) -> anyhow::Result<SchemaClient> {
        let mut config =
            tokio_postgres::Config::from_str(database_url).context("parsing DATABASE_URL")?;
        config.application_name(&format!("preview-gateway-{schema}"));
        // Pin the schema as the default namespace for every statement
        // this client ever runs.
        config.options(&format!("-c search_path={schema}"));

        let mut conns = Vec::with_capacity(connection_limit.max(1));
        for _ in 0..connection_limit.max(1) {
            conns.push(Conn::open(&config).await?);
        }

        Ok(SchemaClient {
            schema: schema.clone(),
            conns,
            next: AtomicUsize::new(0),
        })
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub fn client(&self) -> &Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[i].client
    }

    /// Close every connection. Errors are logged, never propagated: by
    /// the time a client is disconnected its caller has already moved on.
    pub async fn disconnect(self) {
        let schema = self.schema;
        for conn in self.conns {
            drop(conn.client);
            if let Err(e) = conn.conn_task.await {
                warn!("closing connection for {schema} failed: {e}");
            }
        }
        debug!("disconnected schema client for {schema}");
    }
}

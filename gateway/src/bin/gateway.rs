//! Main entry point for the Tenant Gateway executable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;
use tracing::*;

use gateway::authority_client::AuthorityClient;
use gateway::sandbox::SandboxProviders;
use gateway::schema_mgr::{self, SchemaManager};
use gateway::session_cache::SessionCache;
use gateway::{defaults, http, GatewayConf, GatewayState};
use utils::logging::{self, LogFormat};
use utils::signed_auth::InternalAuth;

fn main() -> anyhow::Result<()> {
    let arg_matches = cli().get_matches();

    let log_format = LogFormat::from_config(
        arg_matches
            .get_one::<String>("log-format")
            .map(|s| s.as_str())
            .unwrap_or("plain"),
    )?;
    logging::init(log_format)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    let conf = build_conf(&arg_matches)?;
    info!("starting preview gateway on {}", conf.listen_http_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("gateway worker")
        .enable_all()
        .build()
        .context("Failed to create gateway runtime")?;

    runtime.block_on(run(conf))
}

async fn run(conf: GatewayConf) -> anyhow::Result<()> {
    let conf = Arc::new(conf);
    let auth = Arc::new(InternalAuth::new(
        &conf.internal_api_secret,
        conf.max_clock_skew,
    )?);

    let schema_mgr = Arc::new(SchemaManager::new(Arc::clone(&conf))?);
    let session_cache = Arc::new(SessionCache::new(conf.session_cache_ttl));
    let authority = Arc::new(AuthorityClient::new(
        conf.authority_endpoint.clone(),
        Arc::clone(&auth),
        conf.circuit_threshold,
        conf.circuit_reset_interval,
    ));
    let sandbox = Arc::new(SandboxProviders::mock());

    let state = Arc::new(GatewayState {
        conf: Arc::clone(&conf),
        auth,
        schema_mgr: Arc::clone(&schema_mgr),
        session_cache,
        authority: Arc::clone(&authority),
        sandbox,
    });

    let cancel = CancellationToken::new();

    let idle_sweeper = tokio::spawn(schema_mgr::idle_sweep_loop(
        Arc::clone(&schema_mgr),
        defaults::CLIENT_IDLE_SWEEP_PERIOD,
        cancel.clone(),
    ));
    let orphan_sweeper = tokio::spawn(schema_mgr::orphan_sweep_loop(
        Arc::clone(&schema_mgr),
        authority,
        conf.orphan_sweep_interval,
        cancel.clone(),
    ));

    let listener = std::net::TcpListener::bind(&conf.listen_http_addr)
        .with_context(|| format!("binding {}", conf.listen_http_addr))?;
    let router = http::make_router(state);
    let server = tokio::spawn(utils::http::endpoint::serve(
        router,
        listener,
        cancel.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    cancel.cancel();

    if let Err(e) = server.await.expect("server task panicked") {
        error!("http server error during shutdown: {e:#}");
    }
    let _ = idle_sweeper.await;
    let _ = orphan_sweeper.await;

    // Cached schema clients first, the admin client last.
    schema_mgr.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

fn cli() -> Command {
    Command::new("Preview gateway")
        .about("Terminates preview tenant traffic and manages per-session schemas")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("listen address for the http surface, e.g. 127.0.0.1:7810"),
        )
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .help("connection string to the shared backing store"),
        )
        .arg(
            Arg::new("authority-endpoint")
                .long("authority-endpoint")
                .help("base URL of the session authority"),
        )
        .arg(
            Arg::new("ddl-bundle")
                .long("ddl-bundle")
                .help("path to a DDL bundle overriding the built-in one"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .help("plain or json"),
        )
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("cannot parse {name}: {e}")),
        None => Ok(default),
    }
}

fn build_conf(arg_matches: &clap::ArgMatches) -> anyhow::Result<GatewayConf> {
    let listen_http_addr = arg_matches
        .get_one::<String>("listen")
        .cloned()
        .or_else(|| env_var("GATEWAY_LISTEN_ADDR"))
        .unwrap_or_else(|| defaults::DEFAULT_HTTP_LISTEN_ADDR.to_string());

    let database_url = arg_matches
        .get_one::<String>("database-url")
        .cloned()
        .or_else(|| env_var("DATABASE_URL"))
        .context("DATABASE_URL is required")?;

    let authority_endpoint = arg_matches
        .get_one::<String>("authority-endpoint")
        .cloned()
        .or_else(|| env_var("AUTHORITY_URL"))
        .unwrap_or_else(|| "http://127.0.0.1:7800".to_string());

    let internal_api_secret =
        env_var("INTERNAL_API_SECRET").context("INTERNAL_API_SECRET is required")?;

    let max_concurrent_schemas = env_parse(
        "MAX_CONCURRENT_SCHEMAS",
        defaults::DEFAULT_MAX_CONCURRENT_SCHEMAS,
    )?;
    let max_cached_clients = env_parse(
        "MAX_CACHED_CLIENTS",
        defaults::DEFAULT_MAX_CACHED_CLIENTS.min(max_concurrent_schemas),
    )?;
    if max_cached_clients > max_concurrent_schemas {
        anyhow::bail!("MAX_CACHED_CLIENTS must not exceed MAX_CONCURRENT_SCHEMAS");
    }

    Ok(GatewayConf {
        listen_http_addr,
        database_url,
        authority_endpoint,
        internal_api_secret,
        max_concurrent_schemas,
        max_cached_clients,
        connection_limit_per_client: env_parse(
            "CONNECTION_LIMIT_PER_CLIENT",
            defaults::DEFAULT_CONNECTION_LIMIT_PER_CLIENT,
        )?,
        schema_idle_timeout: Duration::from_secs(
            env_parse(
                "SCHEMA_IDLE_TIMEOUT_MIN",
                defaults::DEFAULT_SCHEMA_IDLE_TIMEOUT.as_secs() / 60,
            )? * 60,
        ),
        session_cache_ttl: Duration::from_secs(env_parse(
            "SESSION_CACHE_TTL_SECS",
            defaults::DEFAULT_SESSION_CACHE_TTL.as_secs(),
        )?),
        circuit_threshold: env_parse("CIRCUIT_THRESHOLD", defaults::DEFAULT_CIRCUIT_THRESHOLD)?,
        circuit_reset_interval: Duration::from_secs(env_parse(
            "CIRCUIT_RESET_INTERVAL_SECS",
            defaults::DEFAULT_CIRCUIT_RESET_INTERVAL.as_secs(),
        )?),
        orphan_sweep_interval: Duration::from_secs(
            env_parse(
                "ORPHAN_SWEEP_INTERVAL_HOURS",
                defaults::DEFAULT_ORPHAN_SWEEP_INTERVAL.as_secs() / 3600,
            )? * 3600,
        ),
        max_clock_skew: Duration::from_secs(env_parse(
            "MAX_CLOCK_SKEW_SECS",
            defaults::DEFAULT_MAX_CLOCK_SKEW.as_secs(),
        )?),
        heap_soft_ceiling_mb: env_parse(
            "HEAP_SOFT_CEILING_MB",
            defaults::DEFAULT_HEAP_SOFT_CEILING_MB,
        )?,
        ddl_bundle_path: arg_matches
            .get_one::<String>("ddl-bundle")
            .cloned()
            .or_else(|| env_var("DDL_BUNDLE_PATH"))
            .map(std::path::PathBuf::from),
    })
}

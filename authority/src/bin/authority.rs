//! Main entry point for the Session Authority executable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use authority::gateway_client::GatewayClient;
use authority::persistence::SessionStore;
use authority::{defaults, http, sweeper, AuthorityConf, AuthorityState};
use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;
use tracing::*;
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
    info!("starting preview authority on {}", conf.listen_http_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("authority worker")
        .enable_all()
        .build()
        .context("Failed to create authority runtime")?;

    runtime.block_on(run(conf))
}

async fn run(conf: AuthorityConf) -> anyhow::Result<()> {
    let conf = Arc::new(conf);
    let auth = Arc::new(InternalAuth::new(
        &conf.internal_api_secret,
        conf.max_clock_skew,
    )?);

    let store = Arc::new(SessionStore::new(&conf.database_url)?);
    store.migrate().await.context("catalogue migration failed")?;

    let gateway = Arc::new(GatewayClient::new(
        conf.gateway_endpoint.clone(),
        Arc::clone(&auth),
    ));

    let cancel = CancellationToken::new();
    let state = Arc::new(AuthorityState {
        conf: Arc::clone(&conf),
        auth,
        store: Arc::clone(&store),
        gateway,
        cancel: cancel.clone(),
    });

    let expiry_sweeper = tokio::spawn(sweeper::expiry_sweep_loop(
        Arc::clone(&state),
        conf.expiry_sweep_interval,
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
    let _ = expiry_sweeper.await;

    store.disconnect().await;
    info!("authority stopped");
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
    Command::new("Preview authority")
        .about("Authoritative catalogue of preview sessions and schema lifecycle state")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("listen address for the http surface, e.g. 127.0.0.1:7800"),
        )
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .help("connection string to the shared backing store"),
        )
        .arg(
            Arg::new("gateway-endpoint")
                .long("gateway-endpoint")
                .help("base URL of the tenant gateway"),
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

fn build_conf(arg_matches: &clap::ArgMatches) -> anyhow::Result<AuthorityConf> {
    let listen_http_addr = arg_matches
        .get_one::<String>("listen")
        .cloned()
        .or_else(|| env_var("AUTHORITY_LISTEN_ADDR"))
        .unwrap_or_else(|| defaults::DEFAULT_HTTP_LISTEN_ADDR.to_string());

    let database_url = arg_matches
        .get_one::<String>("database-url")
        .cloned()
        .or_else(|| env_var("DATABASE_URL"))
        .context("DATABASE_URL is required")?;

    let gateway_endpoint = arg_matches
        .get_one::<String>("gateway-endpoint")
        .cloned()
        .or_else(|| env_var("GATEWAY_URL"))
        .unwrap_or_else(|| "http://127.0.0.1:7810".to_string());

    let internal_api_secret =
        env_var("INTERNAL_API_SECRET").context("INTERNAL_API_SECRET is required")?;

    Ok(AuthorityConf {
        listen_http_addr,
        database_url,
        gateway_endpoint,
        internal_api_secret,
        max_sessions_per_ip: env_parse(
            "MAX_SESSIONS_PER_IP",
            defaults::DEFAULT_MAX_SESSIONS_PER_IP,
        )?,
        max_concurrent_schemas: env_parse(
            "MAX_CONCURRENT_SCHEMAS",
            defaults::DEFAULT_MAX_CONCURRENT_SCHEMAS,
        )?,
        preview_ttl: Duration::from_secs(
            env_parse(
                "PREVIEW_TTL_HOURS",
                defaults::DEFAULT_PREVIEW_TTL.as_secs() / 3600,
            )? * 3600,
        ),
        expiry_sweep_interval: Duration::from_secs(env_parse(
            "EXPIRY_SWEEP_INTERVAL_SECS",
            defaults::DEFAULT_EXPIRY_SWEEP_INTERVAL.as_secs(),
        )?),
        max_clock_skew: Duration::from_secs(env_parse(
            "MAX_CLOCK_SKEW_SECS",
            defaults::DEFAULT_MAX_CLOCK_SKEW.as_secs(),
        )?),
    })
}

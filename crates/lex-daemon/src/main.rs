//! lexgate daemon: loads config, builds the shared pipeline, and serves MCP
//! over HTTP until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use lex_core::config::{Config, CredentialProvider};
use lex_daemon::server::{admin_router, router, AppState};
use lex_upstream::CourtListenerClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "lexgate", version, about = "Resilient legal-data tool server (MCP over HTTP)")]
struct Args {
    /// Config file; defaults to ~/.lexgate/config.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Serve the admin routes on this port. Off unless set.
    #[arg(long)]
    admin_port: Option<u16>,

    #[arg(long)]
    log_level: Option<String>,

    /// One JSON object per log line.
    #[arg(long)]
    json_logs: bool,

    /// Print the effective config as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml().context("failed to render config")?);
        return Ok(());
    }

    lex_telemetry::logging::init(
        &config.general.service_name,
        &config.general.log_level,
        config.general.json_logs,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "lexgate starting");

    let token = CredentialProvider::upstream_token(&config.upstream);
    if token.is_none() {
        warn!(env = %config.upstream.token_env, "no upstream API token set, using anonymous access");
    }
    let client = CourtListenerClient::new(&config.upstream, token).context("failed to build upstream client")?;
    info!(base_url = client.base_url(), authenticated = client.has_token(), "upstream client ready");

    let state = AppState::new(&config, Arc::new(client));

    let sweeper = config.rate_limit.idle_client_sweep_secs.map(|secs| {
        let state = state.clone();
        let idle_for = Duration::from_secs(secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(idle_for);
            tick.tick().await;
            loop {
                tick.tick().await;
                let pruned = state.pipeline.limiter().prune_idle_clients(idle_for);
                let expired = state.pipeline.cache().purge_expired();
                if pruned > 0 || expired > 0 {
                    info!(pruned, expired, "idle sweep");
                }
            }
        })
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let admin = match config.server.admin_bind_address() {
        Some(admin_addr) => {
            let listener = TcpListener::bind(&admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener {admin_addr}"))?;
            warn!("admin endpoint is unauthenticated: http://{admin_addr}/admin");
            let app = admin_router(state.clone());
            let rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(rx)).await
            }))
        }
        None => None,
    };

    let addr = config.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("MCP endpoint: http://{addr}/mcp");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
    .await
    .context("server error")?;

    if let Some(handle) = admin {
        handle.await.context("admin task panicked")?.context("admin server error")?;
    }
    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("lexgate stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    config.apply_env_overrides();

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.admin_port {
        config.server.admin_port = Some(port);
    }
    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }
    if args.json_logs {
        config.general.json_logs = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received, shutting down");
}

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use treasury_service::{build_router, BootstrapFile, ServiceConfig, ServiceState, StorageConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "treasuryd", version, about = "Treasury rebalancing REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095", env = "TREASURY_LISTEN")]
    listen: SocketAddr,
    /// Seconds between automatic rebalance cycles. 0 disables the loop.
    #[arg(long, default_value_t = 3600, env = "TREASURY_CYCLE_INTERVAL_SECS")]
    cycle_interval_secs: u64,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "TREASURY_STORAGE")]
    storage: StorageMode,
    #[arg(long, env = "TREASURY_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, default_value_t = 5, env = "TREASURY_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// JSON bootstrap file: engine config, signer roster, genesis pools, prices.
    #[arg(long, env = "TREASURY_CONFIG")]
    config: Option<PathBuf>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };
    Ok(storage)
}

fn load_bootstrap(path: Option<&PathBuf>) -> anyhow::Result<BootstrapFile> {
    let Some(path) = path else {
        return Ok(BootstrapFile::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bootstrap file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing bootstrap file {}", path.display()))
}

async fn cycle_loop(state: ServiceState, every: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match state.engine.run_cycle(Utc::now()).await {
            Ok(report) => info!(
                plan = report.plan.as_ref().map(|p| p.id.as_str()),
                triggers = report.triggers.len(),
                swept = report.swept_proposals.len(),
                "rebalance cycle finished"
            ),
            Err(err) => warn!(error = %err, "rebalance cycle failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "treasury_service=info,treasury_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let bootstrap = load_bootstrap(cli.config.as_ref())?;
    let state = ServiceState::bootstrap(ServiceConfig { storage, bootstrap }).await?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        storage = state.storage_backend,
        "treasury-service REST listening on {}",
        listener.local_addr()?
    );

    let rest_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .map_err(anyhow::Error::from)
    });

    if cli.cycle_interval_secs == 0 {
        info!("automatic rebalance cycles disabled");
        tokio::select! {
            rest = rest_task => rest??,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
    } else {
        let cycle_task = tokio::spawn(cycle_loop(
            state.clone(),
            Duration::from_secs(cli.cycle_interval_secs),
        ));
        tokio::select! {
            rest = rest_task => rest??,
            cycle = cycle_task => cycle??,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
    }

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dwsched_core::{CivilZone, DwschedConfig, SystemClock};
use dwsched_scheduler::{EngineSettings, SchedulerEngine, SchedulerStore};
use tracing::{info, warn};

mod app;
mod http;
mod pipeline;

#[derive(Debug, Parser)]
#[command(name = "dwsched-gateway", version, about = "Pipeline scheduler HTTP gateway")]
struct Cli {
    /// Config file (defaults to ~/.dwsched/dwsched.toml).
    #[arg(long, env = "DWSCHED_CONFIG")]
    config: Option<String>,

    /// Start the scheduler loop right away.
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dwsched_gateway=info,dwsched_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = DwschedConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        DwschedConfig::default()
    });

    let zone = CivilZone::from_name(&config.scheduler.timezone)?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SchedulerStore::open(db_path, zone)?);

    let executor = Arc::new(pipeline::CommandExecutor::from_config(&config.pipeline));
    let engine = Arc::new(SchedulerEngine::new(
        store,
        executor,
        Arc::new(SystemClock),
        EngineSettings::from_config(&config),
    ));

    let recovered = engine.recover()?;
    if recovered > 0 {
        warn!(count = recovered, "marked runs left over from a previous process as failed");
    }

    if cli.autostart || config.scheduler.autostart {
        engine.start_loop(None, None)?;
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, Arc::clone(&engine)));
    let router = app::build_router(state);

    info!(timezone = zone.name(), "dwsched gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if engine.shutdown().await {
        info!("scheduler stopped");
    } else {
        warn!("exiting with a pipeline still running; it will be killed and recovered at next boot");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

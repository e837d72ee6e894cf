use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portside::config::Config;
use portside::engine::ports::PortAllocator;
use portside::engine::sessions::SessionManager;
use portside::engine::supervisor::ContainerSupervisor;
use portside::git::GitWorkspace;
use portside::proxy::ProxyOrchestrator;
use portside::runtime::detect_runtime;
use portside::AppState;

#[derive(Parser, Debug)]
#[command(name = "portside")]
#[command(author, version, about = "A self-hostable multi-tenant web deployment control plane", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "portside.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let log_level = cli.log_level.as_ref().unwrap_or(&config.logging.level).clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting portside v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.server.data_dir)?;

    let db = portside::db::init(&config.server.data_dir).await?;

    let startup_report = portside::startup::run_startup_checks(&config, &db).await;
    if !startup_report.all_critical_passed {
        anyhow::bail!("startup checks failed: {}", startup_report.summary);
    }

    if let Some(initial_password) = &config.auth.initial_admin_password {
        let settings = portside::db::repo::get_settings(&db).await?;
        if settings.admin_password_hash.is_none() {
            let hash = portside::api::auth::hash_password(initial_password)
                .map_err(|e| anyhow::anyhow!("failed to hash initial admin password: {e}"))?;
            portside::db::repo::set_admin_password_hash(&db, &hash).await?;
            tracing::info!("admin password hash initialized from configuration");
        }
    }

    let runtime = detect_runtime(&config.runtime).await?;
    let ports = PortAllocator::new(config.ports.clone());
    let supervisor = Arc::new(ContainerSupervisor::new(runtime, ports));

    match supervisor.discover().await {
        Ok(n) => tracing::info!("rediscovered {} running containers", n),
        Err(e) => tracing::warn!(error = %e, "container discovery failed"),
    }

    let git = GitWorkspace::new();
    let proxy = ProxyOrchestrator::new(config.proxy.clone(), config.server.api_port);

    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        git.clone(),
        supervisor.clone(),
        proxy.clone(),
        config.proxy.clone(),
        config.sessions.clone(),
    ));
    sessions.clone().spawn_sweeper();

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        git,
        supervisor,
        proxy,
        sessions,
    });

    let app = portside::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;

    tracing::info!("API server listening on http://{}", api_addr);
    tracing::info!("Admin token: {}", config.auth.admin_token);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

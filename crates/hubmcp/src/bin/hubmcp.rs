use anyhow::Context;
use clap::Parser;
use hubmcp::consumer::{TelegramClient, UpdateConsumer};
use hubmcp::{
    CommandDispatcher, EnvConfig, HealthMonitor, HubConfig, PlatformProcessManagerFactory,
    ProcessSupervisor, ServiceRegistry, ShutdownCoordinator, telemetry,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hubmcp", version, about = "Supervise the integration services and run the chat bot")]
struct Cli {
    /// JSON file with `supervisor` and `consumer` settings
    #[arg(long, env = "HUBMCP_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file listing the services to supervise (defaults to gmail, sheets and gdrive)
    #[arg(long, env = "HUBMCP_SERVICES")]
    services: Option<PathBuf>,

    /// Executable that hosts one service; defaults to `hubmcp-service` next to this binary
    #[arg(long, env = "HUBMCP_SERVICE_BIN")]
    service_bin: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    telemetry::init();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let env = EnvConfig::from_env()?;

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            HubConfig::from_json_str(&raw)?
        }
        None => HubConfig::default(),
    };

    let service_bin = cli.service_bin.unwrap_or_else(default_service_bin);
    check_prerequisites(&env, &service_bin);

    let registry = match &cli.services {
        Some(path) => ServiceRegistry::from_json_file(path, &service_bin)?,
        None => ServiceRegistry::default_fleet(&service_bin)?,
    };

    let telegram = Arc::new(TelegramClient::new(&env, &config.consumer)?);
    let bot = telegram
        .get_me()
        .await
        .context("bot connectivity check failed")?;
    info!(
        bot = bot.username.as_deref().unwrap_or(&bot.first_name),
        "Connected to the Bot API"
    );

    let supervisor = Arc::new(ProcessSupervisor::new(registry, config.supervisor.clone())?);
    let grace = config.supervisor.grace_period();
    info!(
        platform = PlatformProcessManagerFactory::platform_name(),
        services = supervisor.registry().len(),
        "Starting services"
    );

    let report = supervisor.start_all().await;
    if !report.is_complete() {
        for failure in report.failures() {
            error!(service = failure.service(), error = %failure, "Service failed to start");
        }
        error!(
            started = report.success_count(),
            total = report.total(),
            "Not every service started, shutting down"
        );
        supervisor.terminate_all(grace).await;
        return Ok(ExitCode::from(1));
    }
    info!("Service status\n{}", supervisor.status_report().await);

    let health = HealthMonitor::new(supervisor.reader(), &config.supervisor)?;
    let dispatcher = Arc::new(CommandDispatcher::with_defaults(telegram.clone())?);
    let mut consumer = UpdateConsumer::new(
        telegram.clone(),
        dispatcher,
        telegram,
        config.consumer.clone(),
    )?;

    let mut coordinator = ShutdownCoordinator::new();

    let monitor = supervisor.clone();
    let token = coordinator.token();
    coordinator.spawn("crash-monitor", async move { monitor.run_monitor(token).await });

    let token = coordinator.token();
    coordinator.spawn("health-monitor", async move { health.run(token).await });

    let token = coordinator.token();
    coordinator.spawn("update-consumer", async move { consumer.run(token).await });

    info!("Hub running, press Ctrl-C to stop");
    let outcome = coordinator.run(&supervisor, grace).await;
    info!(
        reason = ?outcome.reason,
        graceful = outcome.termination.graceful.len(),
        killed = outcome.termination.killed.len(),
        failed = outcome.termination.failed.len(),
        "Shutdown complete"
    );

    Ok(ExitCode::SUCCESS)
}

fn default_service_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("hubmcp-service")))
        .unwrap_or_else(|| PathBuf::from("hubmcp-service"))
}

/// Log what is missing; only the bot token is mandatory and it was checked already
fn check_prerequisites(env: &EnvConfig, service_bin: &Path) {
    if service_bin.is_file() {
        info!(path = %service_bin.display(), "Service executable found");
    } else {
        warn!(path = %service_bin.display(), "Service executable not found, services will fail to start");
    }

    match &env.service_account_path {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), "Service account file found")
        }
        Some(path) => {
            warn!(path = %path.display(), "Service account file missing, services run unauthenticated")
        }
        None => warn!("No service account configured, services run unauthenticated"),
    }
}

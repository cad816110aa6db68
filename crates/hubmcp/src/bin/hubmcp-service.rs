use anyhow::Context;
use clap::Parser;
use hubmcp::service::{OperationRegistry, ServiceHost, serve};
use hubmcp::shutdown::wait_for_shutdown_signal;
use hubmcp::{SERVICE_ACCOUNT_VAR, ServiceRegistry, telemetry};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hubmcp-service", version, about = "Host one integration service over HTTP")]
struct Cli {
    /// Service name, e.g. gmail
    #[arg(long)]
    service: String,

    #[arg(long)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Shown on `GET /`; known services have a default
    #[arg(long)]
    description: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init();
    let cli = Cli::parse();

    let description = cli.description.clone().unwrap_or_else(|| {
        ServiceRegistry::default_fleet("hubmcp-service")
            .ok()
            .and_then(|fleet| fleet.get(&cli.service).map(|d| d.description.clone()))
            .unwrap_or_else(|| format!("{} service", cli.service))
    });

    let credentials = std::env::var_os(SERVICE_ACCOUNT_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);

    let host = Arc::new(
        ServiceHost::new(&cli.service, description, OperationRegistry::with_builtins())
            .with_credentials_from(credentials.as_deref()),
    );
    info!(service = %cli.service, auth_status = host.auth_status().as_str(), "Starting service host");

    let listener = TcpListener::bind((cli.host, cli.port))
        .await
        .with_context(|| format!("cannot bind {}:{}", cli.host, cli.port))?;

    serve(host, listener, async {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Cannot install signal handlers");
        }
    })
    .await?;

    info!(service = %cli.service, "Service host stopped");
    Ok(())
}

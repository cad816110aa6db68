//! HubMCP - supervises a fleet of local integration services and bridges a
//! chat bot to them.
//!
//! The supervisor binary starts every service from the [`ServiceRegistry`],
//! restarts crashed ones, probes their `/health` endpoints and consumes chat
//! updates until a shutdown signal arrives. Each service process runs a
//! [`service::ServiceHost`] that pushes operation events to its subscribers.
//!
//! # Example
//!
//! ```rust,no_run
//! use hubmcp::{ProcessSupervisor, ServiceRegistry, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let registry = ServiceRegistry::default_fleet("target/debug/hubmcp-service")?;
//! let supervisor = ProcessSupervisor::new(registry, SupervisorConfig::default())?;
//!
//! let report = supervisor.start_all().await;
//! println!("{}/{} services started", report.success_count(), report.total());
//! println!("{}", supervisor.status_report().await);
//!
//! supervisor.terminate_all(supervisor.config().grace_period()).await;
//! # Ok(())
//! # }
//! ```

pub mod broadcaster;
pub mod catch;
pub mod consumer;
pub mod dispatch;
pub mod factory;
pub mod health;
pub mod service;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;

pub use hubmcp_core::*;

pub use broadcaster::{EventBroadcaster, PublishReport, SubscriberId};
pub use consumer::{TelegramClient, UpdateConsumer};
pub use dispatch::CommandDispatcher;
pub use factory::PlatformProcessManagerFactory;
pub use health::{HealthMonitor, HealthOutcome, HealthReport};
pub use service::ServiceHost;
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use supervisor::{ProcessSupervisor, StartReport, StatusReport, TerminationSummary};

//! Coordinated shutdown of the supervisor's loops and children.
//!
//! Loops share one [`CancellationToken`] and check it at iteration
//! boundaries. Whatever ends first (an OS signal, an explicit trigger or a
//! loop that stopped on its own) cancels the token for everybody. Children
//! are terminated only after every loop has returned.

use crate::HubError;
use crate::supervisor::{ProcessSupervisor, TerminationSummary};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Completes on SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere)
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Resolves when `signal` does. If the handlers could not be installed it never
/// resolves, leaving shutdown to a trigger or an exiting loop.
pub async fn signal_or_pending<S>(signal: S)
where
    S: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Cannot install signal handlers, OS signals will be ignored");
        std::future::pending::<()>().await;
    }
}

/// Why the coordinator started shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    Triggered,
    /// A loop returned before cancellation; carries its name and error, if any
    LoopExited {
        name: String,
        error: Option<String>,
    },
}

#[derive(Debug)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    pub termination: TerminationSummary,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    loops: JoinSet<(String, Result<(), HubError>)>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            loops: JoinSet::new(),
        }
    }

    /// Token to hand to a loop
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown without an OS signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<(), HubError>> + Send + 'static,
    {
        let name = name.to_string();
        self.loops.spawn(async move { (name, task.await) });
    }

    /// Run until a shutdown signal arrives, then stop loops and children
    pub async fn run(
        self,
        supervisor: &ProcessSupervisor,
        grace: Duration,
    ) -> ShutdownOutcome {
        self.run_until(signal_or_pending(wait_for_shutdown_signal()), supervisor, grace)
            .await
    }

    pub async fn run_until<S>(
        mut self,
        signal: S,
        supervisor: &ProcessSupervisor,
        grace: Duration,
    ) -> ShutdownOutcome
    where
        S: Future<Output = ()>,
    {
        let reason = tokio::select! {
            _ = signal => {
                info!("Shutdown signal received");
                ShutdownReason::Signal
            }
            _ = self.token.cancelled() => ShutdownReason::Triggered,
            Some(joined) = self.loops.join_next() => {
                let (name, error) = match joined {
                    Ok((name, Ok(()))) => (name, None),
                    Ok((name, Err(e))) => (name, Some(e.to_string())),
                    Err(e) => ("unknown".to_string(), Some(e.to_string())),
                };
                warn!(task = %name, error = ?error, "Loop exited before shutdown, stopping the rest");
                ShutdownReason::LoopExited { name, error }
            }
        };

        self.token.cancel();
        while let Some(joined) = self.loops.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(task = %name, "Loop stopped"),
                Ok((name, Err(e))) => warn!(task = %name, error = %e, "Loop stopped with error"),
                Err(e) => error!(error = %e, "Loop panicked"),
            }
        }

        let termination = supervisor.terminate_all(grace).await;
        ShutdownOutcome {
            reason,
            termination,
        }
    }
}

//! Supervision of the fixed service fleet.
//!
//! The supervisor is the only writer of the process table. Everyone else sees
//! it through a [`ProcessTableReader`].
//!
//! Per service: `Starting -> Running -> Crashed -> Restarting -> Running`, or
//! `PermanentlyFailed` when the restart does not survive its settle interval.
//! A permanently failed service is removed from the table and never restarted
//! or probed again by the monitor.

mod table;

pub use table::{FailedService, ProbeTarget, ProcessSnapshot, ProcessTableReader, ServiceStatus};

use crate::{HubError, ServiceDescriptor, ServiceRegistry, StartError, SupervisorConfig};
use chrono::Utc;
use futures_util::future::join_all;
use hubmcp_core::{ProcessManager, SpawnRequest, TerminationResult};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use table::{ProcessTable, SharedTable, TrackedProcess};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of [`ProcessSupervisor::start_all`], in registry order
#[derive(Debug)]
pub struct StartReport {
    results: Vec<(String, Result<ProcessSnapshot, StartError>)>,
}

impl StartReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn is_complete(&self) -> bool {
        self.success_count() == self.total()
    }

    pub fn get(&self, name: &str) -> Option<&Result<ProcessSnapshot, StartError>> {
        self.results.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StartError> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<ProcessSnapshot, StartError>)> {
        self.results.iter().map(|(n, r)| (n.as_str(), r))
    }
}

/// What happened to each process during [`ProcessSupervisor::terminate_all`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TerminationSummary {
    /// Exited within the grace period
    pub graceful: Vec<String>,
    /// Still alive after the grace period and killed
    pub killed: Vec<String>,
    /// Could not be signalled at all
    pub failed: Vec<String>,
}

impl TerminationSummary {
    pub fn total(&self) -> usize {
        self.graceful.len() + self.killed.len() + self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub enum EntryState {
    Active(ProcessSnapshot),
    PermanentlyFailed(FailedService),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub name: String,
    pub port: u16,
    pub state: EntryState,
}

/// Per-service status lines, in registry order
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
}

impl StatusReport {
    pub fn running_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(&e.state, EntryState::Active(s) if s.status == ServiceStatus::Running))
            .count()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match &entry.state {
                EntryState::Active(snapshot) => writeln!(
                    f,
                    "{} (port {}): {} pid={} since {}",
                    entry.name,
                    entry.port,
                    snapshot.status,
                    snapshot
                        .pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    snapshot.started_at.to_rfc3339(),
                )?,
                EntryState::PermanentlyFailed(failed) => writeln!(
                    f,
                    "{} (port {}): {} at {}: {}",
                    entry.name,
                    entry.port,
                    ServiceStatus::PermanentlyFailed,
                    failed.failed_at.to_rfc3339(),
                    failed.error,
                )?,
                EntryState::Stopped => writeln!(f, "{} (port {}): stopped", entry.name, entry.port)?,
            }
        }
        Ok(())
    }
}

/// Launches, watches and restarts the services of a [`ServiceRegistry`]
pub struct ProcessSupervisor {
    registry: ServiceRegistry,
    config: SupervisorConfig,
    manager: Arc<dyn ProcessManager>,
    table: SharedTable,
}

impl ProcessSupervisor {
    /// Supervisor backed by the platform process manager
    #[cfg(unix)]
    pub fn new(registry: ServiceRegistry, config: SupervisorConfig) -> Result<Self, HubError> {
        Self::with_manager(
            registry,
            config,
            crate::factory::PlatformProcessManagerFactory::create_process_manager(),
        )
    }

    pub fn with_manager(
        registry: ServiceRegistry,
        config: SupervisorConfig,
        manager: Arc<dyn ProcessManager>,
    ) -> Result<Self, HubError> {
        config.validate()?;
        info!(
            platform = manager.platform_name(),
            services = registry.len(),
            "Created process supervisor"
        );

        Ok(Self {
            registry,
            config,
            manager,
            table: Arc::new(RwLock::new(ProcessTable::default())),
        })
    }

    pub fn reader(&self) -> ProcessTableReader {
        ProcessTableReader::new(self.table.clone())
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch every registered service. Spawns happen in registry order and
    /// the settle intervals overlap, so one slow service does not delay the rest.
    pub async fn start_all(&self) -> StartReport {
        let launches = self.registry.iter().map(|descriptor| async move {
            let result = self.start(descriptor).await;
            match &result {
                Ok(snapshot) => info!(
                    service = %descriptor.name,
                    pid = ?snapshot.pid,
                    port = descriptor.port,
                    "Service started"
                ),
                Err(e) => error!(service = %descriptor.name, error = %e, "Service failed to start"),
            }
            (descriptor.name.clone(), result)
        });

        let report = StartReport {
            results: join_all(launches).await,
        };
        info!(
            started = report.success_count(),
            total = report.total(),
            "Fleet start finished"
        );
        report
    }

    /// Start one service that has no live process
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ProcessSnapshot, StartError> {
        if self.table.read().await.entries.contains_key(&descriptor.name) {
            return Err(StartError::AlreadyRunning(descriptor.name.clone()));
        }
        self.launch(descriptor, ServiceStatus::Starting).await
    }

    /// Relaunch a crashed service. A failure here is final: the service moves
    /// to `PermanentlyFailed` and leaves the active rotation.
    pub async fn restart(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<ProcessSnapshot, StartError> {
        {
            let mut table = self.table.write().await;
            match table.entries.get_mut(&descriptor.name) {
                Some(entry) if entry.status == ServiceStatus::Crashed => {
                    entry.status = ServiceStatus::Restarting;
                }
                Some(_) => return Err(StartError::AlreadyRunning(descriptor.name.clone())),
                None => {}
            }
        }

        let result = self.launch(descriptor, ServiceStatus::Restarting).await;
        match &result {
            Ok(_) => {
                self.table.write().await.failed.remove(&descriptor.name);
            }
            Err(StartError::Aborted(_)) => {}
            Err(e) => {
                self.table.write().await.mark_failed(descriptor, e);
                error!(
                    service = %descriptor.name,
                    error = %e,
                    "Restart failed, service is permanently failed"
                );
            }
        }
        result
    }

    async fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        initial: ServiceStatus,
    ) -> Result<ProcessSnapshot, StartError> {
        let name = descriptor.name.as_str();
        let request = SpawnRequest {
            command: descriptor.command.clone(),
            args: descriptor.launch_args(),
            working_dir: descriptor
                .working_directory
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            env: descriptor.env.clone(),
        };

        let mut handle = self.manager.spawn_process(&request).await.map_err(|e| {
            StartError::SpawnFailed {
                service: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        let pid = handle.get_pid();

        {
            let mut table = self.table.write().await;
            let rejection = if table.closed {
                Some(StartError::Aborted(name.to_string()))
            } else if initial == ServiceStatus::Starting && table.entries.contains_key(name) {
                Some(StartError::AlreadyRunning(name.to_string()))
            } else {
                None
            };

            if let Some(rejection) = rejection {
                drop(table);
                self.manager.force_kill(handle.as_mut()).await;
                return Err(rejection);
            }

            table.entries.insert(
                name.to_string(),
                TrackedProcess {
                    descriptor: descriptor.clone(),
                    pid,
                    started_at: Utc::now(),
                    status: initial,
                    handle,
                },
            );
        }

        debug!(service = %name, pid = ?pid, settle = ?self.config.settle_interval(), "Waiting for process to settle");
        tokio::time::sleep(self.config.settle_interval()).await;

        let mut table = self.table.write().await;
        let Some(entry) = table.entries.get_mut(name) else {
            // terminate_all emptied the table while we slept
            return Err(StartError::Aborted(name.to_string()));
        };

        let state = entry.handle.try_wait().await;
        match state {
            Ok(None) => {
                entry.status = ServiceStatus::Running;
                Ok(entry.snapshot())
            }
            Ok(Some(status)) => {
                let captured = entry.handle.diagnostics().contents();
                table.entries.remove(name);
                Err(StartError::ExitedEarly {
                    service: name.to_string(),
                    code: status.exit_code(),
                    diagnostics: if captured.is_empty() {
                        "no output captured".to_string()
                    } else {
                        captured
                    },
                })
            }
            Err(e) => {
                if let Some(mut stale) = table.entries.remove(name) {
                    drop(table);
                    self.manager.force_kill(stale.handle.as_mut()).await;
                }
                Err(StartError::SpawnFailed {
                    service: name.to_string(),
                    reason: format!("cannot query process state: {e}"),
                })
            }
        }
    }

    /// Mark every `Running` service whose process has exited as `Crashed`
    pub async fn detect_crash(&self) -> BTreeSet<String> {
        let mut crashed = BTreeSet::new();
        let mut table = self.table.write().await;

        for (name, entry) in table.entries.iter_mut() {
            if entry.status != ServiceStatus::Running {
                continue;
            }
            let state = entry.handle.try_wait().await;
            match state {
                Ok(None) => {}
                Ok(Some(status)) => {
                    entry.status = ServiceStatus::Crashed;
                    warn!(
                        service = %name,
                        exit_code = ?status.exit_code(),
                        output = %entry.handle.diagnostics().contents(),
                        "Service process exited"
                    );
                    crashed.insert(name.clone());
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Cannot query process state");
                }
            }
        }

        crashed
    }

    /// Crash detection loop: check every monitor interval, restart what died
    pub async fn run_monitor(&self, token: CancellationToken) -> Result<(), HubError> {
        info!(interval = ?self.config.monitor_interval(), "Crash monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitor_interval()) => {}
            }

            for name in self.detect_crash().await {
                if token.is_cancelled() {
                    break;
                }
                let Some(descriptor) = self.registry.get(&name) else {
                    continue;
                };

                warn!(service = %name, "Restarting crashed service");
                if let Ok(snapshot) = self.restart(descriptor).await {
                    info!(service = %name, pid = ?snapshot.pid, "Service restarted");
                }
            }
        }

        info!("Crash monitor stopped");
        Ok(())
    }

    /// Ask every tracked process to stop, kill whatever outlives `grace`.
    /// The table is empty afterwards no matter how individual processes behaved.
    pub async fn terminate_all(&self, grace: Duration) -> TerminationSummary {
        let mut entries: Vec<TrackedProcess> = {
            let mut table = self.table.write().await;
            table.closed = true;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        entries.sort_by_key(|entry| entry.descriptor.port);

        let mut summary = TerminationSummary::default();
        if entries.is_empty() {
            return summary;
        }

        info!(count = entries.len(), grace = ?grace, "Terminating services");
        for entry in entries.iter_mut() {
            match self.manager.terminate_gracefully(entry.handle.as_mut()).await {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => warn!(
                    service = %entry.descriptor.name,
                    result = ?result,
                    "Graceful termination request failed"
                ),
            }
        }

        // One shared deadline: the whole fleet gets `grace`, not each process
        let deadline = tokio::time::Instant::now() + grace;
        for entry in entries.iter_mut() {
            let name = entry.descriptor.name.clone();
            match tokio::time::timeout_at(deadline, entry.handle.wait()).await {
                Ok(Ok(status)) => {
                    debug!(service = %name, exit_code = ?status.exit_code(), "Service stopped");
                    summary.graceful.push(name);
                    continue;
                }
                Ok(Err(e)) => warn!(service = %name, error = %e, "Cannot wait for service"),
                Err(_) => warn!(service = %name, "Service ignored termination request"),
            }

            // Listed before the kill: descendants that left the group are
            // reparented once the service dies and could not be found after
            let descendants = match entry.pid {
                Some(pid) => self
                    .manager
                    .find_child_processes(pid)
                    .await
                    .unwrap_or_else(|e| {
                        debug!(service = %name, error = %e, "Cannot enumerate descendants");
                        Vec::new()
                    }),
                None => Vec::new(),
            };

            let result = self.manager.force_kill(entry.handle.as_mut()).await;

            // Most are gone with the group already; the rest escaped it
            for pid in descendants {
                if self.manager.kill_process(pid).await == TerminationResult::Success {
                    debug!(service = %name, pid = %pid, "Killed descendant outside the process group");
                }
            }

            match result {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {
                    summary.killed.push(name)
                }
                result => {
                    error!(service = %name, result = ?result, "Failed to kill service");
                    summary.failed.push(name);
                }
            }
        }

        info!(
            graceful = summary.graceful.len(),
            killed = summary.killed.len(),
            failed = summary.failed.len(),
            "All services terminated"
        );
        summary
    }

    pub async fn status_report(&self) -> StatusReport {
        let table = self.table.read().await;
        let entries = self
            .registry
            .iter()
            .map(|descriptor| {
                let state = if let Some(entry) = table.entries.get(&descriptor.name) {
                    EntryState::Active(entry.snapshot())
                } else if let Some(failed) = table.failed.get(&descriptor.name) {
                    EntryState::PermanentlyFailed(failed.clone())
                } else {
                    EntryState::Stopped
                };
                StatusEntry {
                    name: descriptor.name.clone(),
                    port: descriptor.port,
                    state,
                }
            })
            .collect();
        StatusReport { entries }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            settle_interval_ms: 200,
            monitor_interval_ms: 100,
            grace_period_ms: 500,
            ..Default::default()
        }
    }

    fn shell_service(name: &str, port: u16, script: &str) -> ServiceDescriptor {
        ServiceDescriptor::builder()
            .name(name)
            .command("sh")
            .args(["-c", script])
            .port(port)
            .build()
            .unwrap()
    }

    fn supervisor(services: Vec<ServiceDescriptor>) -> ProcessSupervisor {
        ProcessSupervisor::new(ServiceRegistry::new(services).unwrap(), fast_config()).unwrap()
    }

    #[tokio::test]
    async fn test_start_all_reports_early_exit() {
        let supervisor = supervisor(vec![
            shell_service("a", 18091, "sleep 30"),
            shell_service("b", 18092, "sleep 30"),
            shell_service("c", 18093, "echo 'address in use' >&2; exit 3"),
        ]);

        let report = supervisor.start_all().await;
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.total(), 3);
        assert!(!report.is_complete());

        match report.get("c") {
            Some(Err(StartError::ExitedEarly {
                code, diagnostics, ..
            })) => {
                assert_eq!(*code, Some(3));
                assert!(diagnostics.contains("address in use"));
            }
            other => panic!("unexpected result for c: {other:?}"),
        }

        let snapshot = supervisor.reader().snapshot().await;
        let names: Vec<_> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(snapshot.iter().all(|s| s.status == ServiceStatus::Running));

        supervisor.terminate_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let supervisor = supervisor(vec![shell_service("a", 18101, "sleep 30")]);
        let descriptor = supervisor.registry().get("a").unwrap().clone();

        supervisor.start(&descriptor).await.unwrap();
        let second = supervisor.start(&descriptor).await;
        assert_eq!(second, Err(StartError::AlreadyRunning("a".to_string())));
        assert_eq!(supervisor.reader().len().await, 1);

        supervisor.terminate_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_start_error() {
        let supervisor = ProcessSupervisor::new(
            ServiceRegistry::new(vec![
                ServiceDescriptor::builder()
                    .name("ghost")
                    .command("/nonexistent/service-binary")
                    .port(18111u16)
                    .build()
                    .unwrap(),
            ])
            .unwrap(),
            fast_config(),
        )
        .unwrap();

        let report = supervisor.start_all().await;
        assert!(matches!(
            report.get("ghost"),
            Some(Err(StartError::SpawnFailed { .. }))
        ));
        assert!(supervisor.reader().is_empty().await);
    }

    #[tokio::test]
    async fn test_crash_then_failed_restart_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("started").to_string_lossy().to_string();
        // First run survives the settle interval and then dies; every later run dies at once
        let script = r#"if [ -f "$MARK" ]; then exit 1; fi; touch "$MARK"; sleep 0.5; exit 1"#;
        let descriptor = ServiceDescriptor::builder()
            .name("flaky")
            .command("sh")
            .args(["-c", script])
            .env("MARK".to_string(), mark)
            .port(18121u16)
            .build()
            .unwrap();
        let supervisor = supervisor(vec![descriptor.clone()]);

        assert!(supervisor.start_all().await.is_complete());
        tokio::time::sleep(Duration::from_millis(700)).await;

        let crashed = supervisor.detect_crash().await;
        assert!(crashed.contains("flaky"));
        assert_eq!(
            supervisor.reader().get("flaky").await.unwrap().status,
            ServiceStatus::Crashed
        );

        let restart = supervisor.restart(&descriptor).await;
        assert!(matches!(restart, Err(StartError::ExitedEarly { .. })));

        let reader = supervisor.reader();
        assert!(reader.get("flaky").await.is_none());
        assert!(reader.probe_targets().await.is_empty());
        assert_eq!(reader.permanently_failed().await.len(), 1);
        assert!(supervisor.detect_crash().await.is_empty());

        let status = supervisor.status_report().await;
        assert!(matches!(
            status.entries[0].state,
            EntryState::PermanentlyFailed(_)
        ));
        assert!(status.to_string().contains("permanently failed"));
    }

    #[tokio::test]
    async fn test_monitor_restarts_crashed_service() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("started").to_string_lossy().to_string();
        // Dies once shortly after start, then stays up
        let script = r#"if [ -f "$MARK" ]; then exec sleep 30; fi; touch "$MARK"; sleep 0.3; exit 1"#;
        let descriptor = ServiceDescriptor::builder()
            .name("recovering")
            .command("sh")
            .args(["-c", script])
            .env("MARK".to_string(), mark)
            .port(18131u16)
            .build()
            .unwrap();
        let supervisor = Arc::new(supervisor(vec![descriptor]));
        assert!(supervisor.start_all().await.is_complete());
        let first_pid = supervisor.reader().get("recovering").await.unwrap().pid;

        let token = CancellationToken::new();
        let monitor = tokio::spawn({
            let supervisor = supervisor.clone();
            let token = token.clone();
            async move { supervisor.run_monitor(token).await }
        });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        token.cancel();
        monitor.await.unwrap().unwrap();

        let snapshot = supervisor.reader().get("recovering").await.unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Running);
        assert_ne!(snapshot.pid, first_pid);
        assert_eq!(supervisor.status_report().await.running_count(), 1);

        supervisor.terminate_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_terminate_all_escalates_and_clears() {
        let supervisor = supervisor(vec![
            shell_service("polite", 18141, "sleep 30"),
            shell_service("stubborn", 18142, "trap '' TERM; sleep 30"),
        ]);
        assert!(supervisor.start_all().await.is_complete());

        let summary = supervisor.terminate_all(Duration::from_millis(300)).await;
        assert_eq!(summary.graceful, ["polite"]);
        assert_eq!(summary.killed, ["stubborn"]);
        assert!(supervisor.reader().is_empty().await);

        // Nothing can be started into a closed table
        let descriptor = supervisor.registry().get("polite").unwrap().clone();
        assert_eq!(
            supervisor.start(&descriptor).await,
            Err(StartError::Aborted("polite".to_string()))
        );
    }

    /// Running and not a zombie
    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            let state = stat.rsplit(')').next().unwrap_or("").trim_start();
            !state.starts_with('Z') && !state.starts_with('X')
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_force_kill_reaches_descendants_outside_the_group() {
        let has_setsid = std::process::Command::new("sh")
            .args(["-c", "command -v setsid"])
            .status()
            .is_ok_and(|status| status.success());
        if !has_setsid {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("escaped.pid");
        let descriptor = ServiceDescriptor::builder()
            .name("leaky")
            .command("sh")
            .args([
                "-c",
                r#"trap '' TERM; setsid sleep 30 & echo $! > "$PIDFILE"; wait"#,
            ])
            .env("PIDFILE".to_string(), pidfile.to_string_lossy().to_string())
            .port(18151u16)
            .build()
            .unwrap();
        let supervisor = supervisor(vec![descriptor]);
        assert!(supervisor.start_all().await.is_complete());

        let mut escaped = None;
        for _ in 0..40 {
            escaped = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            if escaped.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let escaped = escaped.unwrap();
        assert!(is_alive(escaped));

        let summary = supervisor.terminate_all(Duration::from_millis(300)).await;
        assert_eq!(summary.killed, ["leaky"]);

        let mut alive = true;
        for _ in 0..40 {
            alive = is_alive(escaped);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!alive, "descendant {escaped} survived");
    }
}

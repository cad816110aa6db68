#[cfg(unix)]
mod unix_impl {
    use anyhow::Result;
    use async_trait::async_trait;
    use hubmcp_core::{
        DiagnosticLog, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
        ProcessStatus, ProcessTermination, SpawnRequest, TerminationResult, capture,
    };
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::{ExitStatus, Stdio};
    use std::sync::{Arc, Mutex, PoisonError};
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        diagnostics: DiagnosticLog,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, diagnostics: DiagnosticLog) -> Self {
            Self { child, diagnostics }
        }
    }

    fn to_status(status: ExitStatus) -> ProcessStatus {
        // `code()` is None when the child was terminated by a signal
        ProcessStatus::Exited(status.code())
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn diagnostics(&self) -> DiagnosticLog {
            self.diagnostics.clone()
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
            Ok(self.child.try_wait()?.map(to_status))
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = self.child.wait().await?;
            Ok(to_status(status))
        }

        async fn kill(&mut self) -> Result<()> {
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }
    }

    /// Unix process manager: one process group per service, signal escalation
    pub struct UnixProcessManager {
        system: Arc<Mutex<System>>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessManager {
        pub fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: Arc::new(Mutex::new(System::new())),
            }
        }

        fn signal_group(pid: ProcessId, signal: Signal) -> TerminationResult {
            // Children are spawned as group leaders, so the pgid equals the pid
            let pgid = NixPid::from_raw(pid.0 as i32);

            match signal::killpg(pgid, signal) {
                Ok(()) => {
                    info!("Sent {:?} to process group {}", signal, pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("Process group {} not found (already terminated)", pid);
                    Self::signal_single(pid, signal)
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to signal process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send {:?} to process group {}: {}", signal, pid, e);
                    TerminationResult::Failed(format!("{signal:?} to process group failed: {e}"))
                }
            }
        }

        fn signal_single(pid: ProcessId, signal: Signal) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            match signal::kill(nix_pid, signal) {
                Ok(()) => {
                    info!("Sent {:?} to process {}", signal, pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to signal process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send {:?} to process {}: {}", signal, pid, e);
                    TerminationResult::Failed(format!("{signal:?} failed: {e}"))
                }
            }
        }

        /// Recursively find all child processes
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    // Grandchildren first, so the list is ordered bottom-up
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(
            &self,
            request: &SpawnRequest,
        ) -> Result<Box<dyn ProcessHandle>, ProcessError> {
            let mut cmd = Command::new(&request.command);
            cmd.args(&request.args)
                .envs(&request.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                // Own process group, so termination reaches grandchildren too
                .process_group(0);

            if let Some(dir) = &request.working_dir {
                cmd.current_dir(dir);
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", request.command)))?;

            let diagnostics = DiagnosticLog::default();
            if let Some(stdout) = child.stdout.take() {
                let log = diagnostics.clone();
                tokio::spawn(async move {
                    if let Err(e) = capture(stdout, log).await {
                        debug!("stdout capture ended: {e}");
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let log = diagnostics.clone();
                tokio::spawn(async move {
                    if let Err(e) = capture(stderr, log).await {
                        debug!("stderr capture ended: {e}");
                    }
                });
            }

            if let Some(pid) = child.id() {
                info!(
                    "Spawned Unix process: {} (PID: {}) with args: {:?}",
                    request.command, pid, request.args
                );
            }

            Ok(Box::new(UnixProcessHandle::new(child, diagnostics)))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            match handle.get_pid() {
                Some(pid) => Self::signal_group(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            let result = Self::signal_group(pid, Signal::SIGKILL);
            // Reap the child so it does not linger as a zombie
            if let Err(e) = handle.kill().await {
                warn!("Handle kill cleanup failed for {}: {}", pid, e);
            }
            result
        }

        async fn kill_process(&self, pid: ProcessId) -> TerminationResult {
            Self::signal_single(pid, Signal::SIGKILL)
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let system = self.system.clone();
            // A full process table refresh is blocking work
            let children = tokio::task::spawn_blocking(move || {
                let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
                system.refresh_processes_specifics(
                    sysinfo::ProcessesToUpdate::All,
                    true,
                    sysinfo::ProcessRefreshKind::default(),
                );

                let mut children = Vec::new();
                Self::find_children_recursive(&system, parent_pid.0, &mut children);
                children
            })
            .await?;

            Ok(children.into_iter().map(ProcessId::from).collect())
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn platform_name(&self) -> &'static str {
            "Unix"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        fn request(script: &str) -> SpawnRequest {
            SpawnRequest {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_spawn_captures_output() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process(&request("echo ready; echo 'bind failed' >&2; exit 3"))
                .await
                .unwrap();

            assert!(handle.get_pid().is_some());
            let status = manager
                .wait_for_exit(handle.as_mut(), Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(status, ProcessStatus::Exited(Some(3)));

            // Give the capture tasks a moment to drain the pipes
            tokio::time::sleep(Duration::from_millis(100)).await;
            let diagnostics = handle.diagnostics().contents();
            assert!(diagnostics.contains("ready"));
            assert!(diagnostics.contains("bind failed"));
        }

        #[tokio::test]
        async fn test_spawn_failure_is_reported() {
            let manager = UnixProcessManager::new();
            let result = manager
                .spawn_process(&SpawnRequest {
                    command: "/definitely/not/a/binary".to_string(),
                    ..Default::default()
                })
                .await;
            assert!(matches!(result, Err(ProcessError::SpawnFailed(_))));
        }

        #[tokio::test]
        async fn test_graceful_termination() {
            let manager = UnixProcessManager::new();
            let mut handle = manager.spawn_process(&request("sleep 30")).await.unwrap();
            assert!(handle.is_running().await);

            let result = manager.terminate_gracefully(handle.as_mut()).await;
            assert_eq!(result, TerminationResult::Success);

            let status = manager
                .wait_for_exit(handle.as_mut(), Some(Duration::from_secs(5)))
                .await
                .unwrap();
            // killed by SIGTERM, so no exit code
            assert_eq!(status, ProcessStatus::Exited(None));
        }

        #[tokio::test]
        async fn test_force_kill_ignores_sigterm_trap() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process(&request("trap '' TERM; sleep 30"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            manager.terminate_gracefully(handle.as_mut()).await;
            let waited = manager
                .wait_for_exit(handle.as_mut(), Some(Duration::from_millis(300)))
                .await;
            assert!(matches!(waited, Err(ProcessError::Timeout)));

            assert_eq!(
                manager.force_kill(handle.as_mut()).await,
                TerminationResult::Success
            );
            assert!(!handle.is_running().await);
        }

        #[tokio::test]
        async fn test_find_child_processes() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process(&request("sleep 30 & sleep 30 & wait"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;

            let pid = handle.get_pid().unwrap();
            let children = manager.find_child_processes(pid).await.unwrap();
            assert_eq!(children.len(), 2);

            manager.force_kill(handle.as_mut()).await;
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

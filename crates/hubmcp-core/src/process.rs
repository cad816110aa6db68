use crate::stdio::DiagnosticLog;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// OS process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OS-level state of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited; `None` when it was killed by a signal
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(code) => *code,
            ProcessStatus::Running => None,
        }
    }

    /// Supervised services are expected to run forever, so any exit is abnormal
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessStatus::Exited(_))
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Error types for low-level process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("Operation timed out")]
    Timeout,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything needed to launch one child
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Tail of the child's stdout/stderr
    fn diagnostics(&self) -> DiagnosticLog;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&mut self) -> bool {
        matches!(self.try_wait().await, Ok(None))
    }

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a new process with its output captured into a diagnostic log
    async fn spawn_process(
        &self,
        request: &SpawnRequest,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError>;

    /// Wait for a process to exit with optional timeout
    async fn wait_for_exit(
        &self,
        handle: &mut dyn ProcessHandle,
        timeout: Option<Duration>,
    ) -> Result<ProcessStatus, ProcessError> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| ProcessError::Timeout)?
                .map_err(|e| ProcessError::SpawnFailed(e.to_string())),
            None => handle
                .wait()
                .await
                .map_err(|e| ProcessError::SpawnFailed(e.to_string())),
        }
    }
}

/// Trait for process termination including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process (and its group) to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process by pid, outside any handle
    async fn kill_process(&self, pid: ProcessId) -> TerminationResult;

    /// Find all descendants of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;
}

/// Process manager combining lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    fn platform_name(&self) -> &'static str;
}

#[async_trait]
impl ProcessHandle for Box<dyn ProcessHandle> {
    fn get_pid(&self) -> Option<ProcessId> {
        (**self).get_pid()
    }

    fn diagnostics(&self) -> DiagnosticLog {
        (**self).diagnostics()
    }

    async fn is_running(&mut self) -> bool {
        (**self).is_running().await
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        (**self).try_wait().await
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        (**self).wait().await
    }

    async fn kill(&mut self) -> Result<()> {
        (**self).kill().await
    }
}

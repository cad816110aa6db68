use chrono::{DateTime, Utc};
use hubmcp_core::{ProcessHandle, ProcessId, ServiceDescriptor, StartError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle position of one supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Starting,
    Running,
    Crashed,
    Restarting,
    PermanentlyFailed,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::PermanentlyFailed => "permanently failed",
        };
        f.write_str(label)
    }
}

pub(crate) struct TrackedProcess {
    pub(crate) descriptor: ServiceDescriptor,
    pub(crate) pid: Option<ProcessId>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) status: ServiceStatus,
    pub(crate) handle: Box<dyn ProcessHandle>,
}

impl TrackedProcess {
    pub(crate) fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            name: self.descriptor.name.clone(),
            pid: self.pid.map(|pid| pid.0),
            port: self.descriptor.port,
            started_at: self.started_at,
            status: self.status,
            launch_command: self.descriptor.launch_command(),
        }
    }
}

/// A service that will not be restarted again without outside intervention
#[derive(Debug, Clone, Serialize)]
pub struct FailedService {
    pub name: String,
    pub port: u16,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Point-in-time copy of one table entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub status: ServiceStatus,
    pub launch_command: String,
}

/// Health probe target: a service whose process is `Running`
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub name: String,
    pub port: u16,
    pub health_url: String,
}

/// Live processes plus the services that gave up. Only the supervisor mutates it.
#[derive(Default)]
pub(crate) struct ProcessTable {
    pub(crate) entries: HashMap<String, TrackedProcess>,
    pub(crate) failed: BTreeMap<String, FailedService>,
    /// Set once shutdown has begun; nothing may be inserted afterwards
    pub(crate) closed: bool,
}

impl ProcessTable {
    pub(crate) fn mark_failed(&mut self, descriptor: &ServiceDescriptor, error: &StartError) {
        self.entries.remove(&descriptor.name);
        self.failed.insert(
            descriptor.name.clone(),
            FailedService {
                name: descriptor.name.clone(),
                port: descriptor.port,
                failed_at: Utc::now(),
                error: error.to_string(),
            },
        );
    }
}

pub(crate) type SharedTable = Arc<RwLock<ProcessTable>>;

/// Read-only view of the supervisor's process table
#[derive(Clone)]
pub struct ProcessTableReader {
    table: SharedTable,
}

impl ProcessTableReader {
    pub(crate) fn new(table: SharedTable) -> Self {
        Self { table }
    }

    /// Services currently in `Running`; crashed, restarting and failed ones are never probed
    pub async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let table = self.table.read().await;
        let mut targets: Vec<_> = table
            .entries
            .values()
            .filter(|entry| entry.status == ServiceStatus::Running)
            .map(|entry| ProbeTarget {
                name: entry.descriptor.name.clone(),
                port: entry.descriptor.port,
                health_url: entry.descriptor.health_url(),
            })
            .collect();
        targets.sort_by_key(|t| t.port);
        targets
    }

    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let table = self.table.read().await;
        let mut snapshot: Vec<_> = table.entries.values().map(TrackedProcess::snapshot).collect();
        snapshot.sort_by_key(|s| s.port);
        snapshot
    }

    pub async fn get(&self, name: &str) -> Option<ProcessSnapshot> {
        let table = self.table.read().await;
        table.entries.get(name).map(TrackedProcess::snapshot)
    }

    pub async fn permanently_failed(&self) -> Vec<FailedService> {
        let table = self.table.read().await;
        table.failed.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.entries.is_empty()
    }
}

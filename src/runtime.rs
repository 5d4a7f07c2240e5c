//! Container runtime adapter seam
//!
//! The orchestrator only talks to containers through [`ContainerRuntime`].
//! `DockerRuntime` implements it against the Docker engine, and the stubs in
//! `testing` implement it in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::service::{ContainerRef, PortMapping};

/// Failures reported by a runtime adapter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// The engine itself cannot be reached
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The referenced container or project does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine rejected or failed the operation
    #[error("{0}")]
    Failed(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// What to start
#[derive(Debug, Clone, PartialEq)]
pub enum StartTarget {
    Image {
        image: String,
        environment: BTreeMap<String, String>,
        volumes: Vec<String>,
    },
    Compose {
        file: PathBuf,
        project: String,
    },
}

/// Everything the runtime needs to start one service
#[derive(Debug, Clone, PartialEq)]
pub struct StartSpec {
    pub service_name: String,
    /// Deterministic container name (`<prefix><service_name>`)
    pub container_name: String,
    pub target: StartTarget,
    pub ports: Vec<PortMapping>,
    pub network: Option<String>,
}

/// Result of inspecting a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    pub running: bool,
    /// Engine status string ("running", "exited", ...)
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Raw cumulative counters as reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
}

impl RawStats {
    /// CPU percent between two cumulative samples.
    ///
    /// Zero when either delta is non-positive.
    pub fn cpu_percent_since(&self, previous: &RawStats) -> f64 {
        let cpu_delta = self.cpu_total_usage as f64 - previous.cpu_total_usage as f64;
        let system_delta = self.system_cpu_usage as f64 - previous.system_cpu_usage as f64;
        if cpu_delta <= 0.0 || system_delta <= 0.0 {
            return 0.0;
        }
        let cpus = self.online_cpus.max(1) as f64;
        (cpu_delta / system_delta) * cpus * 100.0
    }

    /// Sum counters of several containers (compose projects)
    pub fn accumulate(&mut self, other: &RawStats) {
        self.cpu_total_usage += other.cpu_total_usage;
        self.system_cpu_usage = self.system_cpu_usage.max(other.system_cpu_usage);
        self.online_cpus = self.online_cpus.max(other.online_cpus);
        self.memory_usage += other.memory_usage;
        self.memory_limit += other.memory_limit;
        self.network_rx += other.network_rx;
        self.network_tx += other.network_tx;
    }
}

/// Abstract container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start (creating if needed) and return a handle
    async fn start(&self, spec: &StartSpec) -> RuntimeResult<ContainerRef>;

    /// Stop gracefully, waiting at most `grace` before killing.
    /// Stopping something that does not exist is not an error.
    async fn stop(&self, container: &ContainerRef, grace: Duration) -> RuntimeResult<()>;

    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerInspect>;

    /// One snapshot of the cumulative counters
    async fn stats(&self, container: &ContainerRef) -> RuntimeResult<RawStats>;

    /// Last `tail` log lines
    async fn logs(&self, container: &ContainerRef, tail: usize) -> RuntimeResult<String>;

    /// Cheap liveness check of the engine itself
    async fn ping(&self) -> RuntimeResult<()>;
}

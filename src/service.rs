//! Service descriptors and the lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Maximum length of a DNS label
const MAX_LABEL_LEN: usize = 63;

/// Lifecycle state of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// No container is running
    Stopped,
    /// Container start requested, waiting for the runtime to report healthy
    Starting,
    /// Container is healthy and routable
    Running,
    /// Container stop requested
    Stopping,
    /// Last start/stop failed or the container crashed
    Error,
}

impl ServiceStatus {
    /// Whether moving from `self` to `next` is an edge of the state machine.
    ///
    /// `Error -> Stopped` is the forced reset that precedes deletion.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }

    /// States in which a container handle exists
    pub fn holds_container(self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Running | ServiceStatus::Stopping
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Error => write!(f, "error"),
        }
    }
}

/// What the runtime should start for a service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeRef {
    /// A single container from an image
    Image {
        image: String,
        environment: BTreeMap<String, String>,
        /// Bind mounts in `host:container[:mode]` form
        volumes: Vec<String>,
    },
    /// A compose project managed as one unit
    Compose { file: PathBuf, project: String },
}

impl RuntimeRef {
    pub fn image(image: &str) -> Self {
        RuntimeRef::Image {
            image: image.to_string(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
        }
    }
}

/// Opaque handle to whatever the runtime started
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContainerRef {
    /// Container name or id
    Container { id: String },
    /// Compose project
    Compose { project: String, file: PathBuf },
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRef::Container { id } => write!(f, "{}", id),
            ContainerRef::Compose { project, .. } => write!(f, "compose:{}", project),
        }
    }
}

/// A `container_port` published on `host_port`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

impl PortMapping {
    pub fn new(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
        }
    }

    /// Parse `"host:container"` or a bare `"port"` (same on both sides)
    pub fn parse(value: &str) -> Result<Self> {
        let parse_port = |s: &str| {
            s.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| Error::InvalidSpec(format!("invalid port mapping: '{}'", value)))
        };
        match value.split_once(':') {
            Some((host, container)) => Ok(Self::new(parse_port(container)?, parse_port(host)?)),
            None => {
                let port = parse_port(value)?;
                Ok(Self::new(port, port))
            }
        }
    }
}

/// When the monitor may put a running service to sleep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoShutdownPolicy {
    #[serde(serialize_with = "as_secs")]
    pub inactive_timeout: Duration,
    /// CPU percent below which a sample counts as idle
    pub cpu_threshold: f64,
    pub memory_threshold_bytes: u64,
    #[serde(serialize_with = "as_secs")]
    pub evaluation_window: Duration,
    /// No auto-sleep this soon after the service became running
    #[serde(serialize_with = "as_secs")]
    pub grace_period: Duration,
}

impl Default for AutoShutdownPolicy {
    fn default() -> Self {
        Self {
            inactive_timeout: Duration::from_secs(30 * 60),
            cpu_threshold: 5.0,
            memory_threshold_bytes: 100 * 1024 * 1024,
            evaluation_window: Duration::from_secs(300),
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Data for the page shown while a service boots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadingPageConfig {
    /// May contain `{service_name}`
    pub title_template: String,
    pub message: String,
    pub estimated_seconds: u64,
}

impl LoadingPageConfig {
    pub fn title(&self, service_name: &str) -> String {
        self.title_template.replace("{service_name}", service_name)
    }
}

impl Default for LoadingPageConfig {
    fn default() -> Self {
        Self {
            title_template: "Starting {service_name}...".to_string(),
            message: "Please wait while we wake up your service".to_string(),
            estimated_seconds: 30,
        }
    }
}

/// One resource usage observation. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub service_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx: u64,
    pub network_tx: u64,
}

impl MetricSample {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            return 0.0;
        }
        self.memory_bytes as f64 / self.memory_limit_bytes as f64 * 100.0
    }
}

/// Most recent stats observation kept on the descriptor
pub type ResourceSnapshot = MetricSample;

/// The unit of management
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub subdomain: String,
    /// Public domain used for the edge route (none: not routed)
    pub domain: Option<String>,
    pub runtime: RuntimeRef,
    /// First entry is the default upstream port
    pub ports: Vec<PortMapping>,
    /// HTTP path probed before the service is considered healthy
    pub health_path: Option<String>,
    pub status: ServiceStatus,
    pub container_ref: Option<ContainerRef>,
    pub auto_shutdown: AutoShutdownPolicy,
    pub loading_page: LoadingPageConfig,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub resource_snapshot: Option<ResourceSnapshot>,
    /// Reason for the most recent transition into `Error`
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    /// Port the upstream is reachable on from the proxy
    pub fn upstream_port(&self) -> Option<u16> {
        self.ports.first().map(|p| p.host_port)
    }

    /// Handle the runtime will use before it reports a concrete one
    pub fn planned_container_ref(&self, prefix: &str) -> ContainerRef {
        match &self.runtime {
            RuntimeRef::Image { .. } => ContainerRef::Container {
                id: format!("{}{}", prefix, self.name),
            },
            RuntimeRef::Compose { file, project } => ContainerRef::Compose {
                project: project.clone(),
                file: file.clone(),
            },
        }
    }
}

/// Input for `ServiceRegistry::create`
#[derive(Debug, Clone, PartialEq)]
pub struct NewService {
    pub name: String,
    pub subdomain: String,
    pub domain: Option<String>,
    pub runtime: RuntimeRef,
    pub ports: Vec<PortMapping>,
    pub health_path: Option<String>,
    pub auto_shutdown: AutoShutdownPolicy,
    pub loading_page: LoadingPageConfig,
}

impl NewService {
    /// A service with default policies (builder pattern entry point)
    pub fn new(name: &str, subdomain: &str, runtime: RuntimeRef, ports: Vec<PortMapping>) -> Self {
        Self {
            name: name.to_string(),
            subdomain: subdomain.to_string(),
            domain: None,
            runtime,
            ports,
            health_path: None,
            auto_shutdown: AutoShutdownPolicy::default(),
            loading_page: LoadingPageConfig::default(),
        }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn with_auto_shutdown(mut self, policy: AutoShutdownPolicy) -> Self {
        self.auto_shutdown = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_label("name", &self.name)?;
        validate_label("subdomain", &self.subdomain)?;
        validate_runtime(&self.runtime)?;
        validate_ports(&self.ports)
    }

    pub(crate) fn into_descriptor(self, now: DateTime<Utc>) -> ServiceDescriptor {
        ServiceDescriptor {
            id: self.name.clone(),
            name: self.name,
            subdomain: self.subdomain,
            domain: self.domain,
            runtime: self.runtime,
            ports: self.ports,
            health_path: self.health_path,
            status: ServiceStatus::Stopped,
            container_ref: None,
            auto_shutdown: self.auto_shutdown,
            loading_page: self.loading_page,
            last_accessed_at: None,
            started_at: None,
            resource_snapshot: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for `ServiceRegistry::update`; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceUpdate {
    pub subdomain: Option<String>,
    pub domain: Option<Option<String>>,
    pub runtime: Option<RuntimeRef>,
    pub ports: Option<Vec<PortMapping>>,
    pub health_path: Option<Option<String>>,
    pub auto_shutdown: Option<AutoShutdownPolicy>,
    pub loading_page: Option<LoadingPageConfig>,
}

impl ServiceUpdate {
    /// Update that replaces every configurable field with those of `spec`
    pub fn replace_with(spec: NewService) -> Self {
        Self {
            subdomain: Some(spec.subdomain),
            domain: Some(spec.domain),
            runtime: Some(spec.runtime),
            ports: Some(spec.ports),
            health_path: Some(spec.health_path),
            auto_shutdown: Some(spec.auto_shutdown),
            loading_page: Some(spec.loading_page),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref subdomain) = self.subdomain {
            validate_label("subdomain", subdomain)?;
        }
        if let Some(ref runtime) = self.runtime {
            validate_runtime(runtime)?;
        }
        if let Some(ref ports) = self.ports {
            validate_ports(ports)?;
        }
        Ok(())
    }

    pub(crate) fn apply(self, descriptor: &mut ServiceDescriptor) {
        if let Some(subdomain) = self.subdomain {
            descriptor.subdomain = subdomain;
        }
        if let Some(domain) = self.domain {
            descriptor.domain = domain;
        }
        if let Some(runtime) = self.runtime {
            descriptor.runtime = runtime;
        }
        if let Some(ports) = self.ports {
            descriptor.ports = ports;
        }
        if let Some(health_path) = self.health_path {
            descriptor.health_path = health_path;
        }
        if let Some(policy) = self.auto_shutdown {
            descriptor.auto_shutdown = policy;
        }
        if let Some(page) = self.loading_page {
            descriptor.loading_page = page;
        }
    }
}

/// Check that `value` is a lowercase DNS label
pub fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_LABEL_LEN
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn validate_label(field: &str, value: &str) -> Result<()> {
    if is_dns_label(value) {
        Ok(())
    } else {
        Err(Error::InvalidSpec(format!(
            "{} '{}' is not a DNS label (lowercase letters, digits and '-', max {} chars)",
            field, value, MAX_LABEL_LEN
        )))
    }
}

fn validate_runtime(runtime: &RuntimeRef) -> Result<()> {
    match runtime {
        RuntimeRef::Image { image, .. } if image.trim().is_empty() => {
            Err(Error::InvalidSpec("image must not be empty".into()))
        }
        RuntimeRef::Compose { project, .. } if !is_dns_label(project) => Err(Error::InvalidSpec(
            format!("compose project '{}' is not a valid project name", project),
        )),
        _ => Ok(()),
    }
}

fn validate_ports(ports: &[PortMapping]) -> Result<()> {
    if ports.is_empty() {
        return Err(Error::InvalidSpec(
            "at least one port mapping is required to reach the upstream".into(),
        ));
    }
    Ok(())
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

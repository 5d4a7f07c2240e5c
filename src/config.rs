use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::caddy::CaddyConfig;
use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::pool::PoolConfig;
use crate::proxy::ProxySettings;
use crate::service::{AutoShutdownPolicy, LoadingPageConfig, NewService, PortMapping, RuntimeRef};

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub caddy: CaddySection,

    #[serde(default)]
    pub monitor: MonitorSection,

    /// Policies applied to services that do not set their own
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Managed services keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Interceptor port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Admin API port (default: 9999, 0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    pub pid_file: Option<String>,

    /// Services without an explicit domain are routed at `{subdomain}.{base_domain}`
    pub base_domain: Option<String>,

    #[serde(default = "default_control_hosts")]
    pub control_hosts: Vec<String>,

    #[serde(default = "default_bypass_path_prefixes")]
    pub bypass_path_prefixes: Vec<String>,

    /// `host:port` of the control plane behind the interceptor
    pub passthrough_upstream: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_wake_fast_fail")]
    pub wake_fast_fail_ms: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Sleep every running service when the process exits
    #[serde(default)]
    pub stop_services_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
            base_domain: None,
            control_hosts: default_control_hosts(),
            bypass_path_prefixes: default_bypass_path_prefixes(),
            passthrough_upstream: None,
            request_timeout_secs: default_request_timeout(),
            wake_fast_fail_ms: default_wake_fast_fail(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            stop_services_on_shutdown: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker endpoint (unix://, tcp://, http://). Falls back to DOCKER_HOST
    pub docker_host: Option<String>,

    /// Docker network containers join
    pub network: Option<String>,

    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Program (plus leading arguments) used for compose projects
    #[serde(default = "default_compose_command")]
    pub compose_command: String,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Timeout for inspect, stats and logs calls
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    #[serde(default = "default_stats_sample_gap")]
    pub stats_sample_gap_ms: u64,

    /// Address published ports are reachable on
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            network: None,
            container_prefix: default_container_prefix(),
            compose_command: default_compose_command(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            call_timeout_secs: default_call_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            stats_sample_gap_ms: default_stats_sample_gap(),
            upstream_host: default_upstream_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaddySection {
    /// Disable to run without an edge proxy (routes are not synced)
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_caddy_admin_url")]
    pub admin_url: String,

    #[serde(default = "default_caddy_server_name")]
    pub server_name: String,

    #[serde(default = "default_container_prefix")]
    pub route_id_prefix: String,

    #[serde(default = "default_caddy_timeout")]
    pub timeout_secs: u64,
}

impl Default for CaddySection {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_url: default_caddy_admin_url(),
            server_name: default_caddy_server_name(),
            route_id_prefix: default_container_prefix(),
            timeout_secs: default_caddy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,

    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_low_utilization_ratio")]
    pub low_utilization_ratio: f64,

    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval_secs: default_collect_interval(),
            retention_secs: default_retention(),
            history_capacity: default_history_capacity(),
            min_samples: default_min_samples(),
            low_utilization_ratio: default_low_utilization_ratio(),
            error_backoff_secs: default_error_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceDefaults {
    #[serde(default)]
    pub auto_shutdown: AutoShutdownSettings,

    #[serde(default)]
    pub loading_page: LoadingPageSettings,
}

/// Auto-shutdown knobs; unset fields fall back to `[defaults]`, then to built-ins
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AutoShutdownSettings {
    pub inactive_minutes: Option<u64>,

    /// CPU percent
    pub cpu_threshold: Option<f64>,

    /// Megabytes as an integer, or a size string like "100m" / "1g"
    pub memory_threshold: Option<ByteSize>,

    pub evaluation_window_secs: Option<u64>,

    pub grace_period_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ByteSize {
    Megabytes(u64),
    Text(String),
}

impl ByteSize {
    pub fn bytes(&self) -> Result<u64, String> {
        match self {
            ByteSize::Megabytes(mb) => mb
                .checked_mul(1024 * 1024)
                .ok_or_else(|| format!("memory size too large: {} MB", mb)),
            ByteSize::Text(text) => parse_byte_size(text),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoadingPageSettings {
    /// May contain `{service_name}`
    pub title: Option<String>,
    pub message: Option<String>,
    pub estimated_seconds: Option<u64>,
}

/// A port binding: `"8080:80"`, `8080`, or `{ host = 8080, container = 80 }`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Text(String),
    Table { host: u16, container: u16 },
}

impl PortEntry {
    fn to_mapping(&self) -> Result<PortMapping, String> {
        match self {
            PortEntry::Number(port) => PortMapping::parse(&port.to_string()),
            PortEntry::Text(text) => PortMapping::parse(text),
            PortEntry::Table { host, container } => {
                PortMapping::parse(&format!("{}:{}", host, container))
            }
        }
        .map_err(|e| e.to_string())
    }
}

/// One `[services.<name>]` table
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Container image (mutually exclusive with `compose_file`)
    pub image: Option<String>,

    /// Compose file describing a multi-container service
    pub compose_file: Option<PathBuf>,

    /// Compose project name (default: the service name)
    pub project: Option<String>,

    #[serde(default)]
    pub ports: Vec<PortEntry>,

    #[serde(default, alias = "env")]
    pub environment: BTreeMap<String, String>,

    /// Bind mounts in `host:container[:mode]` form
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Default: the service name
    pub subdomain: Option<String>,

    /// Full hostname routed at the edge proxy
    pub domain: Option<String>,

    /// HTTP path that must answer before the service counts as running
    #[serde(alias = "health_check")]
    pub health_path: Option<String>,

    #[serde(default)]
    pub auto_shutdown: AutoShutdownSettings,

    #[serde(default)]
    pub loading_page: LoadingPageSettings,
}

impl ServiceConfig {
    pub fn image(image: &str, ports: &[&str]) -> Self {
        Self {
            image: Some(image.to_string()),
            ports: ports.iter().map(|p| PortEntry::Text(p.to_string())).collect(),
            ..Default::default()
        }
    }

    pub fn runtime_ref(&self, name: &str) -> Result<RuntimeRef, String> {
        match (&self.image, &self.compose_file) {
            (Some(image), None) => Ok(RuntimeRef::Image {
                image: image.clone(),
                environment: self.environment.clone(),
                volumes: self.volumes.clone(),
            }),
            (None, Some(file)) => Ok(RuntimeRef::Compose {
                file: file.clone(),
                project: self.project.clone().unwrap_or_else(|| name.to_string()),
            }),
            (Some(_), Some(_)) => Err(format!(
                "Service '{}': 'image' and 'compose_file' are mutually exclusive",
                name
            )),
            (None, None) => Err(format!(
                "Service '{}': either 'image' or 'compose_file' is required",
                name
            )),
        }
    }

    pub fn auto_shutdown(&self, defaults: &ServiceDefaults) -> Result<AutoShutdownPolicy, String> {
        let builtin = AutoShutdownPolicy::default();
        let own = &self.auto_shutdown;
        let fallback = &defaults.auto_shutdown;

        let memory_threshold_bytes = match own
            .memory_threshold
            .as_ref()
            .or(fallback.memory_threshold.as_ref())
        {
            Some(size) => size.bytes()?,
            None => builtin.memory_threshold_bytes,
        };

        let inactive_timeout = match own.inactive_minutes.or(fallback.inactive_minutes) {
            Some(minutes) => minutes
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("inactive_minutes too large: {}", minutes))?,
            None => builtin.inactive_timeout,
        };

        Ok(AutoShutdownPolicy {
            inactive_timeout,
            cpu_threshold: own
                .cpu_threshold
                .or(fallback.cpu_threshold)
                .unwrap_or(builtin.cpu_threshold),
            memory_threshold_bytes,
            evaluation_window: own
                .evaluation_window_secs
                .or(fallback.evaluation_window_secs)
                .map(Duration::from_secs)
                .unwrap_or(builtin.evaluation_window),
            grace_period: own
                .grace_period_secs
                .or(fallback.grace_period_secs)
                .map(Duration::from_secs)
                .unwrap_or(builtin.grace_period),
        })
    }

    pub fn loading_page(&self, defaults: &ServiceDefaults) -> LoadingPageConfig {
        let builtin = LoadingPageConfig::default();
        let own = &self.loading_page;
        let fallback = &defaults.loading_page;
        LoadingPageConfig {
            title_template: own
                .title
                .clone()
                .or_else(|| fallback.title.clone())
                .unwrap_or(builtin.title_template),
            message: own
                .message
                .clone()
                .or_else(|| fallback.message.clone())
                .unwrap_or(builtin.message),
            estimated_seconds: own
                .estimated_seconds
                .or(fallback.estimated_seconds)
                .unwrap_or(builtin.estimated_seconds),
        }
    }

    /// Resolve this table into a registry entry
    pub fn to_new_service(
        &self,
        name: &str,
        defaults: &ServiceDefaults,
        base_domain: Option<&str>,
    ) -> Result<NewService, String> {
        let runtime = self.runtime_ref(name)?;
        let ports = self
            .ports
            .iter()
            .map(PortEntry::to_mapping)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Service '{}': {}", name, e))?;
        let subdomain = self.subdomain.clone().unwrap_or_else(|| name.to_string());
        let domain = self
            .domain
            .clone()
            .or_else(|| base_domain.map(|base| format!("{}.{}", subdomain, base)));

        let mut service = NewService::new(name, &subdomain, runtime, ports);
        service.domain = domain;
        service.health_path = self.health_path.clone();
        service.auto_shutdown = self
            .auto_shutdown(defaults)
            .map_err(|e| format!("Service '{}': {}", name, e))?;
        service.loading_page = self.loading_page(defaults);

        service
            .validate()
            .map_err(|e| format!("Service '{}': {}", name, e))?;
        Ok(service)
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_control_hosts() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_bypass_path_prefixes() -> Vec<String> {
    vec!["/api/".to_string()]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_wake_fast_fail() -> u64 {
    200
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_container_prefix() -> String {
    "wakegate-".to_string()
}

fn default_compose_command() -> String {
    "docker compose".to_string()
}

fn default_start_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_call_timeout() -> u64 {
    10
}

fn default_ready_poll_interval() -> u64 {
    250
}

fn default_stats_sample_gap() -> u64 {
    1000
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_caddy_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_caddy_server_name() -> String {
    "srv0".to_string()
}

fn default_caddy_timeout() -> u64 {
    10
}

fn default_collect_interval() -> u64 {
    30
}

fn default_retention() -> u64 {
    3600
}

fn default_history_capacity() -> usize {
    120
}

fn default_min_samples() -> usize {
    3
}

fn default_low_utilization_ratio() -> f64 {
    0.8
}

fn default_error_backoff() -> u64 {
    30
}

/// Parse "512", "100k", "100m", "1g" (optionally with a trailing "b") into bytes
pub fn parse_byte_size(value: &str) -> Result<u64, String> {
    let lower = value.trim().to_lowercase();
    let unit_stripped = lower.strip_suffix('b').unwrap_or(&lower);
    let (num, multiplier) = if let Some(num) = unit_stripped.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = unit_stripped.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = unit_stripped.strip_suffix('k') {
        (num, 1024)
    } else {
        (unit_stripped, 1)
    };

    let num: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size: '{}'", value))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("invalid memory size: '{}'", value));
    }
    let bytes = num * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("memory size too large: '{}'", value));
    }
    Ok(bytes as u64)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to read {}: {}", path.as_ref().display(), e)
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.service_errors();

        let monitor = &self.monitor;
        if monitor.collect_interval_secs == 0 {
            errors.push("monitor.collect_interval_secs must be greater than 0".to_string());
        }
        if monitor.min_samples == 0 {
            errors.push("monitor.min_samples must be at least 1".to_string());
        }
        if !(monitor.low_utilization_ratio > 0.0 && monitor.low_utilization_ratio <= 1.0) {
            errors.push("monitor.low_utilization_ratio must be in (0, 1]".to_string());
        }
        if self.runtime.compose_command.split_whitespace().next().is_none() {
            errors.push("runtime.compose_command must not be empty".to_string());
        }
        if self.runtime.ready_poll_interval_ms == 0 {
            errors.push("runtime.ready_poll_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    fn service_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut subdomains = HashSet::new();

        for (name, service) in &self.services {
            match service.to_new_service(name, &self.defaults, self.server.base_domain.as_deref()) {
                Ok(service) => {
                    if !subdomains.insert(service.subdomain.clone()) {
                        errors.push(format!(
                            "Service '{}': subdomain '{}' is already used",
                            name, service.subdomain
                        ));
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Every configured service as a registry entry, in name order
    pub fn new_services(&self) -> anyhow::Result<Vec<NewService>> {
        self.services
            .iter()
            .map(|(name, service)| {
                service
                    .to_new_service(name, &self.defaults, self.server.base_domain.as_deref())
                    .map_err(|e| anyhow::anyhow!(e))
            })
            .collect()
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let runtime = &self.runtime;
        OrchestratorConfig {
            container_prefix: runtime.container_prefix.clone(),
            network: runtime.network.clone(),
            upstream_host: runtime.upstream_host.clone(),
            start_timeout: Duration::from_secs(runtime.start_timeout_secs),
            stop_timeout: Duration::from_secs(runtime.stop_timeout_secs),
            call_timeout: Duration::from_secs(runtime.call_timeout_secs),
            proxy_timeout: Duration::from_secs(self.caddy.timeout_secs),
            ready_poll_interval: Duration::from_millis(runtime.ready_poll_interval_ms),
            stats_sample_gap: Duration::from_millis(runtime.stats_sample_gap_ms),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            control_hosts: self.server.control_hosts.clone(),
            bypass_path_prefixes: self.server.bypass_path_prefixes.clone(),
            passthrough_upstream: self.server.passthrough_upstream.clone(),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            wake_fast_fail: Duration::from_millis(self.server.wake_fast_fail_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.server.pool_idle_timeout_secs),
            ..PoolConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let monitor = &self.monitor;
        MonitorConfig {
            collect_interval: Duration::from_secs(monitor.collect_interval_secs),
            retention: Duration::from_secs(monitor.retention_secs),
            history_capacity: monitor.history_capacity,
            min_samples: monitor.min_samples,
            low_utilization_ratio: monitor.low_utilization_ratio,
            error_backoff: Duration::from_secs(monitor.error_backoff_secs),
        }
    }

    pub fn caddy_config(&self) -> CaddyConfig {
        CaddyConfig {
            admin_url: self.caddy.admin_url.clone(),
            server_name: self.caddy.server_name.clone(),
            route_id_prefix: self.caddy.route_id_prefix.clone(),
            timeout: Duration::from_secs(self.caddy.timeout_secs),
        }
    }
}

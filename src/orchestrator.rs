//! Service lifecycle orchestration
//!
//! The orchestrator drives every status transition: it starts and stops
//! containers through the [`ContainerRuntime`] and keeps the edge proxy's
//! routes in line with which services are running. All transitions of one
//! service run under that service's registry lock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::caddy::{ProxyController, ProxyError, RouteSpec};
use crate::error::{Error, Result};
use crate::registry::{ServiceGuard, ServiceRegistry};
use crate::runtime::{ContainerRuntime, RawStats, RuntimeError, StartSpec, StartTarget};
use crate::service::{
    ContainerRef, MetricSample, NewService, RuntimeRef, ServiceDescriptor, ServiceStatus,
    ServiceUpdate,
};

/// HTTP readiness check against a service's upstream
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when `GET http://{upstream}{path}` answers with a non-5xx status
    async fn probe(&self, upstream: &str, path: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub container_prefix: String,
    pub network: Option<String>,
    /// Host the proxy and the edge reach published ports on
    pub upstream_host: String,
    /// Budget for the start call plus the readiness wait
    pub start_timeout: Duration,
    /// Grace period handed to the runtime before it kills a container
    pub stop_timeout: Duration,
    /// Budget for inspect, stats and logs
    pub call_timeout: Duration,
    pub proxy_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// Gap between the two samples when there is no cached previous sample
    pub stats_sample_gap: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            container_prefix: "wakegate-".to_string(),
            network: None,
            upstream_host: "127.0.0.1".to_string(),
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            proxy_timeout: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(250),
            stats_sample_gap: Duration::from_millis(1000),
        }
    }
}

/// Outcome of reconciling the registry with a new configuration
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    /// Changed services that were up; the change applies on their next wake
    pub deferred: Vec<String>,
    pub errors: Vec<String>,
}

impl ReloadResult {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.updated.is_empty()
    }
}

pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ProxyController>,
    probe: Option<Arc<dyn HealthProbe>>,
    config: OrchestratorConfig,
    /// Previous raw stats sample per service
    last_raw: DashMap<String, RawStats>,
    /// Services whose last route sync failed, with the reason
    degraded: DashMap<String, String>,
    /// Reloaded configuration waiting for the service's next wake
    pending: DashMap<String, ServiceUpdate>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn ProxyController>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            proxy,
            probe: None,
            config,
            last_raw: DashMap::new(),
            degraded: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Probe used for services that declare a `health_path`
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a service. Returns immediately if it is running or starting.
    ///
    /// The transition runs in its own task, so a caller that goes away
    /// mid-wake never leaves the service stuck in STARTING.
    pub async fn wake(self: &Arc<Self>, id: &str) -> Result<()> {
        if is_up(self.registry.get(id)?.status) {
            return Ok(());
        }

        let this = Arc::clone(self);
        let owned = id.to_string();
        let task = tokio::spawn(async move {
            let guard = this.registry.lock(&owned).await?;
            if is_up(guard.status()) {
                return Ok(());
            }
            this.start_locked(&guard).await
        });
        task.await.unwrap_or_else(|e| {
            Err(Error::ServiceStartError {
                name: id.to_string(),
                reason: format!("lifecycle task failed: {}", e),
            })
        })
    }

    /// Stop a running service. Any other status is a no-op.
    pub async fn sleep(self: &Arc<Self>, id: &str) -> Result<()> {
        if self.registry.get(id)?.status != ServiceStatus::Running {
            return Ok(());
        }

        let this = Arc::clone(self);
        let owned = id.to_string();
        let task = tokio::spawn(async move {
            let guard = this.registry.lock(&owned).await?;
            if guard.status() != ServiceStatus::Running {
                return Ok(());
            }
            this.stop_locked(&guard).await
        });
        task.await.unwrap_or_else(|e| {
            Err(Error::ServiceStopError {
                name: id.to_string(),
                reason: format!("lifecycle task failed: {}", e),
            })
        })
    }

    /// Sleep then wake without releasing the service lock in between
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<()> {
        let this = Arc::clone(self);
        let owned = id.to_string();
        let task = tokio::spawn(async move {
            let guard = this.registry.lock(&owned).await?;
            match guard.status() {
                ServiceStatus::Running => this.stop_locked(&guard).await?,
                ServiceStatus::Stopped | ServiceStatus::Error => {}
                other => {
                    return Err(Error::InvalidState(format!(
                        "cannot restart service '{}' while {}",
                        owned, other
                    )))
                }
            }
            this.start_locked(&guard).await
        });
        task.await.unwrap_or_else(|e| {
            Err(Error::ServiceStartError {
                name: id.to_string(),
                reason: format!("lifecycle task failed: {}", e),
            })
        })
    }

    /// `host:port` of the upstream, only while running
    pub fn get_service_url(&self, id: &str) -> Option<String> {
        let desc = self.registry.get(id).ok()?;
        if desc.status != ServiceStatus::Running {
            return None;
        }
        desc.upstream_port()
            .map(|port| format!("{}:{}", self.config.upstream_host, port))
    }

    /// Resource usage of a running service, from two raw samples
    pub async fn get_stats(&self, id: &str) -> Result<MetricSample> {
        let desc = self.registry.get(id)?;
        let container = match (&desc.status, &desc.container_ref) {
            (ServiceStatus::Running, Some(container)) => container.clone(),
            _ => {
                return Err(Error::InvalidState(format!(
                    "service '{}' is {}, stats are only available while running",
                    id, desc.status
                )))
            }
        };

        let current = self.call("stats", self.runtime.stats(&container)).await?;
        let cached = self.last_raw.get(id).map(|prev| *prev);
        let (previous, current) = match cached {
            Some(previous) => (previous, current),
            None => {
                sleep(self.config.stats_sample_gap).await;
                let next = self.call("stats", self.runtime.stats(&container)).await?;
                (current, next)
            }
        };
        self.last_raw.insert(id.to_string(), current);

        let sample = MetricSample {
            service_id: id.to_string(),
            timestamp: Utc::now(),
            cpu_percent: current.cpu_percent_since(&previous),
            memory_bytes: current.memory_usage,
            memory_limit_bytes: current.memory_limit,
            network_rx: current.network_rx,
            network_tx: current.network_tx,
        };
        self.registry.record_snapshot(id, sample.clone())?;
        Ok(sample)
    }

    /// Whether the container engine answers at all
    pub async fn ping_runtime(&self) -> Result<()> {
        self.call("ping", self.runtime.ping()).await
    }

    /// Record a successfully proxied request
    pub fn touch(&self, id: &str) -> Result<()> {
        self.registry.touch(id, Utc::now())
    }

    /// Ask the runtime whether a running service's container is still up.
    ///
    /// A container that is gone or exited moves the service to ERROR and
    /// `Ok(false)` is returned. An unreachable runtime is an error and
    /// leaves the status alone.
    pub async fn check_health(&self, id: &str) -> Result<bool> {
        let desc = self.registry.get(id)?;
        let Some(container) = desc.container_ref.filter(|_| desc.status == ServiceStatus::Running)
        else {
            return Ok(desc.status != ServiceStatus::Error);
        };

        match self.call("inspect", self.runtime.inspect(&container)).await {
            Ok(inspect) if inspect.running => Ok(true),
            Ok(inspect) => {
                self.fail_running(id, &format!("container is {}", inspect.status))
                    .await?;
                Ok(false)
            }
            Err(Error::ContainerGone(msg)) => {
                self.fail_running(id, &format!("container gone: {}", msg))
                    .await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// RUNNING -> ERROR after a detected crash
    pub async fn fail_running(&self, id: &str, reason: &str) -> Result<()> {
        let guard = self.registry.lock(id).await?;
        if guard.status() != ServiceStatus::Running {
            return Ok(());
        }
        error!(service = %id, reason, "Running service failed");
        guard.mark_error(reason)?;
        self.last_raw.remove(id);
        self.unroute(&guard.descriptor()).await;
        Ok(())
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let desc = self.registry.get(id)?;
        let container = desc
            .container_ref
            .clone()
            .unwrap_or_else(|| desc.planned_container_ref(&self.config.container_prefix));
        self.call("logs", self.runtime.logs(&container, tail)).await
    }

    /// Delete a service. A service in ERROR is reset to STOPPED first;
    /// anything else that is not stopped is refused.
    pub async fn delete(&self, id: &str) -> Result<ServiceDescriptor> {
        {
            let guard = self.registry.lock(id).await?;
            if guard.status() == ServiceStatus::Error {
                self.reset_locked(&guard).await?;
            }
        }
        let removed = self.registry.delete(id).await?;
        self.degraded.remove(id);
        self.pending.remove(id);
        self.last_raw.remove(id);
        Ok(removed)
    }

    /// Sleep every running service, returning each failure
    pub async fn sleep_all(self: &Arc<Self>) -> Vec<(String, Error)> {
        let running: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|d| d.status == ServiceStatus::Running)
            .map(|d| d.id)
            .collect();

        let results = futures::future::join_all(running.iter().map(|id| self.sleep(id))).await;
        running
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Adopt containers that are already running, e.g. after a restart of
    /// this process
    pub async fn adopt_running(&self) -> Vec<String> {
        let mut adopted = Vec::new();
        for desc in self.registry.list() {
            if desc.status != ServiceStatus::Stopped {
                continue;
            }
            let planned = desc.planned_container_ref(&self.config.container_prefix);
            match self.call("inspect", self.runtime.inspect(&planned)).await {
                Ok(inspect) if inspect.running => {}
                Ok(_) | Err(Error::ContainerGone(_)) => continue,
                Err(e) => {
                    warn!(service = %desc.id, error = %e, "Cannot inspect existing container");
                    continue;
                }
            }

            let Ok(guard) = self.registry.lock(&desc.id).await else {
                continue;
            };
            if guard.status() != ServiceStatus::Stopped {
                continue;
            }
            if guard.begin_start(planned).is_ok() && guard.mark_running(Utc::now()).is_ok() {
                info!(service = %desc.id, "Adopted running container");
                self.route(&guard.descriptor()).await;
                adopted.push(desc.id.clone());
            }
        }
        adopted
    }

    /// Reconcile the registry with `services` from a reloaded configuration.
    /// Changes to a service that is up take effect on its next wake.
    pub async fn apply_config(self: &Arc<Self>, services: Vec<NewService>) -> ReloadResult {
        let mut result = ReloadResult::default();
        let wanted: Vec<String> = services.iter().map(|s| s.name.clone()).collect();

        for existing in self.registry.ids() {
            if wanted.contains(&existing) {
                continue;
            }
            let outcome = match self.sleep(&existing).await {
                Ok(()) => self.delete(&existing).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => result.removed.push(existing),
                Err(e) => result.errors.push(format!("{}: {}", existing, e)),
            }
        }

        for spec in services {
            let name = spec.name.clone();
            match self.registry.get(&name) {
                Ok(current) => {
                    if is_unchanged(&current, &spec) {
                        // Reverting a deferred change cancels it
                        self.pending.remove(&name);
                        continue;
                    }
                    match self.update_or_defer(&name, spec).await {
                        Ok(true) => result.updated.push(name),
                        Ok(false) => result.deferred.push(name),
                        Err(e) => result.errors.push(format!("{}: {}", name, e)),
                    }
                }
                Err(_) => match self.registry.create(spec) {
                    Ok(_) => result.added.push(name),
                    Err(e) => result.errors.push(format!("{}: {}", name, e)),
                },
            }
        }

        if result.has_changes() {
            if let Err(e) = self.proxy_call(self.proxy.reload()).await {
                warn!(error = %e, "Proxy reload after configuration change failed");
            }
        }
        result
    }

    /// Update a stopped service now. A service that is up keeps its current
    /// configuration until its next wake. Returns whether it was applied.
    async fn update_or_defer(&self, id: &str, spec: NewService) -> Result<bool> {
        let update = ServiceUpdate::replace_with(spec);
        update.validate()?;

        let guard = self.registry.lock(id).await?;
        match guard.status() {
            ServiceStatus::Stopped | ServiceStatus::Error => {
                self.pending.remove(id);
                self.registry.update_locked(&guard, update)?;
                Ok(true)
            }
            status => {
                info!(service = %id, %status, "Configuration change deferred until the next wake");
                self.pending.insert(id.to_string(), update);
                Ok(false)
            }
        }
    }

    fn apply_pending(&self, guard: &ServiceGuard) {
        let id = guard.descriptor().id;
        let Some((_, update)) = self.pending.remove(&id) else {
            return;
        };
        match self.registry.update_locked(guard, update) {
            Ok(_) => info!(service = %id, "Applied deferred configuration change"),
            Err(e) => {
                warn!(service = %id, error = %e, "Deferred configuration change rejected, keeping the current one")
            }
        }
    }

    /// Services whose last route sync failed
    pub fn degraded(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .degraded
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort();
        all
    }

    pub fn is_degraded(&self, id: &str) -> bool {
        self.degraded.contains_key(id)
    }

    async fn start_locked(&self, guard: &ServiceGuard) -> Result<()> {
        self.apply_pending(guard);
        let desc = guard.descriptor();
        let planned = desc.planned_container_ref(&self.config.container_prefix);
        guard.begin_start(planned.clone())?;
        info!(service = %desc.id, "Waking service");

        let spec = self.start_spec(&desc);
        let mut started: Option<ContainerRef> = None;
        let outcome = timeout(self.config.start_timeout, async {
            let container = self.runtime.start(&spec).await?;
            guard.set_container_ref(container.clone());
            started = Some(container.clone());
            self.wait_ready(&desc, &container).await
        })
        .await;

        let err = match outcome {
            Ok(Ok(())) => {
                guard.mark_running(Utc::now())?;
                self.last_raw.remove(&desc.id);
                self.route(&guard.descriptor()).await;
                return Ok(());
            }
            Ok(Err(RuntimeError::Unavailable(msg))) => Error::RuntimeUnavailable(msg),
            Ok(Err(e)) => Error::ServiceStartError {
                name: desc.name.clone(),
                reason: e.to_string(),
            },
            Err(_) => Error::ServiceStartError {
                name: desc.name.clone(),
                reason: format!(
                    "timed out after {}s waiting for the service to become healthy",
                    self.config.start_timeout.as_secs()
                ),
            },
        };

        error!(service = %desc.id, error = %err, "Wake failed");
        // Do not leave a half-started container behind
        let leftover = started.unwrap_or(planned);
        if let Err(e) = self.stop_container(&leftover).await {
            debug!(service = %desc.id, error = %e, "Cleanup after failed start did not complete");
        }
        guard.mark_error(&err.to_string())?;
        Err(err)
    }

    async fn stop_locked(&self, guard: &ServiceGuard) -> Result<()> {
        let desc = guard.descriptor();
        guard.begin_stop()?;
        info!(service = %desc.id, "Putting service to sleep");

        self.unroute(&desc).await;
        self.last_raw.remove(&desc.id);

        let Some(container) = desc.container_ref.clone() else {
            guard.mark_stopped()?;
            return Ok(());
        };

        match self.stop_container(&container).await {
            Ok(()) => {
                guard.mark_stopped()?;
                Ok(())
            }
            Err(e) => {
                let err = Error::ServiceStopError {
                    name: desc.name.clone(),
                    reason: e.to_string(),
                };
                error!(service = %desc.id, error = %err, "Sleep failed");
                guard.mark_error(&err.to_string())?;
                Err(err)
            }
        }
    }

    async fn reset_locked(&self, guard: &ServiceGuard) -> Result<()> {
        let desc = guard.descriptor();
        let planned = desc.planned_container_ref(&self.config.container_prefix);
        if let Err(e) = self.stop_container(&planned).await {
            warn!(service = %desc.id, error = %e, "Could not stop container while resetting");
        }
        self.unroute(&desc).await;
        guard.mark_stopped()
    }

    async fn stop_container(&self, container: &ContainerRef) -> Result<()> {
        let budget = self.config.stop_timeout + self.config.call_timeout;
        match timeout(budget, self.runtime.stop(container, self.config.stop_timeout)).await {
            Ok(Ok(())) | Ok(Err(RuntimeError::NotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Timeout(format!("stopping {}", container))),
        }
    }

    async fn wait_ready(
        &self,
        desc: &ServiceDescriptor,
        container: &ContainerRef,
    ) -> std::result::Result<(), RuntimeError> {
        let upstream = desc
            .upstream_port()
            .map(|port| format!("{}:{}", self.config.upstream_host, port));

        loop {
            let inspect = self.runtime.inspect(container).await?;
            if inspect.running {
                match (&self.probe, &desc.health_path, &upstream) {
                    (Some(probe), Some(path), Some(upstream)) => {
                        if probe.probe(upstream, path).await {
                            return Ok(());
                        }
                        debug!(service = %desc.id, path = %path, "Health check not passing yet");
                    }
                    _ => return Ok(()),
                }
            } else if inspect.status != "created" && inspect.status != "restarting" {
                return Err(RuntimeError::Failed(format!(
                    "container {} during startup",
                    inspect.status
                )));
            }
            sleep(self.config.ready_poll_interval).await;
        }
    }

    fn start_spec(&self, desc: &ServiceDescriptor) -> StartSpec {
        let target = match &desc.runtime {
            RuntimeRef::Image {
                image,
                environment,
                volumes,
            } => StartTarget::Image {
                image: image.clone(),
                environment: environment.clone(),
                volumes: volumes.clone(),
            },
            RuntimeRef::Compose { file, project } => StartTarget::Compose {
                file: file.clone(),
                project: project.clone(),
            },
        };
        StartSpec {
            service_name: desc.name.clone(),
            container_name: format!("{}{}", self.config.container_prefix, desc.name),
            target,
            ports: desc.ports.clone(),
            network: self.config.network.clone(),
        }
    }

    fn route_spec(&self, desc: &ServiceDescriptor) -> Option<RouteSpec> {
        Some(RouteSpec {
            name: desc.name.clone(),
            domain: desc.domain.clone()?,
            upstream_host: self.config.upstream_host.clone(),
            upstream_port: desc.upstream_port()?,
        })
    }

    /// Apply the edge route; failures only mark the service degraded
    async fn route(&self, desc: &ServiceDescriptor) {
        let Some(route) = self.route_spec(desc) else {
            debug!(service = %desc.id, "No domain configured, skipping route sync");
            return;
        };
        match self.proxy_call(self.proxy.apply_route(&route)).await {
            Ok(()) => {
                self.degraded.remove(&desc.id);
            }
            Err(e) => {
                warn!(service = %desc.id, error = %e, "Route sync failed, service running but unrouted");
                self.degraded.insert(desc.id.clone(), e.to_string());
            }
        }
    }

    async fn unroute(&self, desc: &ServiceDescriptor) {
        if desc.domain.is_none() {
            return;
        }
        match self.proxy_call(self.proxy.remove_route(&desc.name)).await {
            Ok(()) => {
                self.degraded.remove(&desc.id);
            }
            Err(e) => {
                warn!(service = %desc.id, error = %e, "Route removal failed");
                self.degraded.insert(desc.id.clone(), e.to_string());
            }
        }
    }

    async fn call<T>(
        &self,
        op: &str,
        fut: impl Future<Output = std::result::Result<T, RuntimeError>>,
    ) -> Result<T> {
        match timeout(self.config.call_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(format!("runtime {} call", op))),
        }
    }

    async fn proxy_call(
        &self,
        fut: impl Future<Output = std::result::Result<(), ProxyError>>,
    ) -> Result<()> {
        match timeout(self.config.proxy_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ProxySyncError("proxy control API timed out".into())),
        }
    }
}

fn is_up(status: ServiceStatus) -> bool {
    matches!(status, ServiceStatus::Running | ServiceStatus::Starting)
}

fn is_unchanged(current: &ServiceDescriptor, spec: &NewService) -> bool {
    current.subdomain == spec.subdomain
        && current.domain == spec.domain
        && current.runtime == spec.runtime
        && current.ports == spec.ports
        && current.health_path == spec.health_path
        && current.auto_shutdown == spec.auto_shutdown
        && current.loading_page == spec.loading_page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::PortMapping;
    use crate::testing::{StubProxy, StubRuntime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Setup {
        orchestrator: Arc<Orchestrator>,
        runtime: Arc<StubRuntime>,
        proxy: Arc<StubProxy>,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            start_timeout: Duration::from_secs(2),
            ready_poll_interval: Duration::from_millis(10),
            stats_sample_gap: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn setup_with(config: OrchestratorConfig) -> Setup {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .create(
                NewService::new(
                    "web",
                    "web",
                    RuntimeRef::image("nginx:alpine"),
                    vec![PortMapping::new(80, 8080)],
                )
                .with_domain("web.example.com"),
            )
            .unwrap();

        let runtime = Arc::new(StubRuntime::new());
        let proxy = Arc::new(StubProxy::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            runtime.clone(),
            proxy.clone(),
            config,
        ));
        Setup {
            orchestrator,
            runtime,
            proxy,
        }
    }

    fn setup() -> Setup {
        setup_with(config())
    }

    fn status(s: &Setup) -> ServiceStatus {
        s.orchestrator.registry().get("web").unwrap().status
    }

    #[tokio::test]
    async fn test_wake_starts_and_routes() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();

        let desc = s.orchestrator.registry().get("web").unwrap();
        assert_eq!(desc.status, ServiceStatus::Running);
        assert_eq!(
            desc.container_ref,
            Some(ContainerRef::Container { id: "wakegate-web".into() })
        );
        assert!(desc.started_at.is_some());
        assert!(desc.last_accessed_at.is_some());

        let route = s.proxy.route("web").unwrap();
        assert_eq!(route.domain, "web.example.com");
        assert_eq!(route.upstream(), "127.0.0.1:8080");

        let spec = &s.runtime.started_specs()[0];
        assert_eq!(spec.container_name, "wakegate-web");
        assert_eq!(spec.ports, vec![PortMapping::new(80, 8080)]);
    }

    #[tokio::test]
    async fn test_concurrent_wake_starts_once() {
        let s = setup();
        s.runtime.set_start_delay(Duration::from_millis(100));

        let a = s.orchestrator.clone();
        let b = s.orchestrator.clone();
        let (ra, rb) = tokio::join!(a.wake("web"), b.wake("web"));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(s.runtime.start_count(), 1);
        assert_eq!(s.runtime.max_concurrent_starts(), 1);
        assert_eq!(status(&s), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_wake_while_starting_returns_immediately() {
        let s = setup();
        s.runtime.set_start_delay(Duration::from_millis(200));

        let waker = s.orchestrator.clone();
        let handle = tokio::spawn(async move { waker.wake("web").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status(&s), ServiceStatus::Starting);

        let quick = tokio::time::timeout(Duration::from_millis(20), s.orchestrator.wake("web")).await;
        assert!(matches!(quick, Ok(Ok(()))));

        handle.await.unwrap().unwrap();
        assert_eq!(s.runtime.start_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_sets_error_and_allows_retry() {
        let s = setup();
        s.runtime
            .fail_starts(Some(RuntimeError::Failed("image not found".into())));

        let err = s.orchestrator.wake("web").await.unwrap_err();
        assert!(matches!(err, Error::ServiceStartError { ref name, .. } if name == "web"));
        let desc = s.orchestrator.registry().get("web").unwrap();
        assert_eq!(desc.status, ServiceStatus::Error);
        assert!(desc.container_ref.is_none());
        assert!(desc.last_error.unwrap().contains("image not found"));
        assert!(s.proxy.route("web").is_none());

        s.runtime.fail_starts(None);
        s.orchestrator.wake("web").await.unwrap();
        assert_eq!(status(&s), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_runtime_unavailable_during_wake() {
        let s = setup();
        s.runtime.set_unavailable(true);

        let err = s.orchestrator.wake("web").await.unwrap_err();
        assert!(err.is_runtime_unavailable());
        assert_eq!(status(&s), ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_wake_timeout_sets_error() {
        let s = setup_with(OrchestratorConfig {
            start_timeout: Duration::from_millis(50),
            ..config()
        });
        s.runtime.set_start_delay(Duration::from_millis(500));

        let err = s.orchestrator.wake("web").await.unwrap_err();
        match err {
            Error::ServiceStartError { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(status(&s), ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_container_exiting_during_startup_fails_wake() {
        let s = setup();
        s.runtime.crash_on_start("wakegate-web");

        let err = s.orchestrator.wake("web").await.unwrap_err();
        assert!(matches!(err, Error::ServiceStartError { .. }));
        assert_eq!(status(&s), ServiceStatus::Error);
    }

    struct CountingProbe {
        calls: AtomicUsize,
        pass_after: usize,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self, upstream: &str, path: &str) -> bool {
            assert_eq!(upstream, "127.0.0.1:8080");
            assert_eq!(path, "/health");
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.pass_after
        }
    }

    #[tokio::test]
    async fn test_wake_waits_for_health_path() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut spec = NewService::new(
            "web",
            "web",
            RuntimeRef::image("nginx"),
            vec![PortMapping::new(80, 8080)],
        );
        spec.health_path = Some("/health".into());
        registry.create(spec).unwrap();

        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            pass_after: 3,
        });
        let orchestrator = Arc::new(
            Orchestrator::new(
                registry.clone(),
                Arc::new(StubRuntime::new()),
                Arc::new(StubProxy::new()),
                config(),
            )
            .with_health_probe(probe.clone()),
        );

        orchestrator.wake("web").await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get("web").unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_route_failure_is_degraded_not_fatal() {
        let s = setup();
        s.proxy.set_failing(true);

        s.orchestrator.wake("web").await.unwrap();
        assert_eq!(status(&s), ServiceStatus::Running);
        assert!(s.orchestrator.is_degraded("web"));
        assert_eq!(s.orchestrator.degraded().len(), 1);

        // A later successful sync clears the signal
        s.proxy.set_failing(false);
        s.orchestrator.sleep("web").await.unwrap();
        assert!(!s.orchestrator.is_degraded("web"));
    }

    #[tokio::test]
    async fn test_sleep_stops_and_unroutes() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        s.orchestrator.sleep("web").await.unwrap();

        let desc = s.orchestrator.registry().get("web").unwrap();
        assert_eq!(desc.status, ServiceStatus::Stopped);
        assert!(desc.container_ref.is_none());
        assert!(s.proxy.route("web").is_none());
        assert!(!s.runtime.is_running("wakegate-web"));
    }

    #[tokio::test]
    async fn test_sleep_when_not_running_is_noop() {
        let s = setup();
        s.orchestrator.sleep("web").await.unwrap();
        assert_eq!(s.runtime.stop_count(), 0);
        assert_eq!(s.proxy.remove_count(), 0);
        assert_eq!(status(&s), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_failure_sets_error() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        s.runtime
            .fail_stops(Some(RuntimeError::Failed("device busy".into())));

        let err = s.orchestrator.sleep("web").await.unwrap_err();
        assert!(matches!(err, Error::ServiceStopError { .. }));
        assert_eq!(status(&s), ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_restart_is_atomic() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        let mut rx = s.orchestrator.registry().subscribe();

        s.orchestrator.restart("web").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push(change.to);
        }
        assert_eq!(
            seen,
            vec![
                ServiceStatus::Stopping,
                ServiceStatus::Stopped,
                ServiceStatus::Starting,
                ServiceStatus::Running
            ]
        );
        assert_eq!(s.runtime.start_count(), 2);
    }

    #[tokio::test]
    async fn test_service_url_only_when_running() {
        let s = setup();
        assert_eq!(s.orchestrator.get_service_url("web"), None);
        s.orchestrator.wake("web").await.unwrap();
        assert_eq!(
            s.orchestrator.get_service_url("web").as_deref(),
            Some("127.0.0.1:8080")
        );
        assert_eq!(s.orchestrator.get_service_url("missing"), None);
    }

    #[tokio::test]
    async fn test_get_stats_uses_two_samples() {
        let s = setup();
        s.runtime.set_load("wakegate-web", 12.5, 64 * 1024 * 1024);
        s.orchestrator.wake("web").await.unwrap();

        let first = s.orchestrator.get_stats("web").await.unwrap();
        assert!((first.cpu_percent - 12.5).abs() < 0.01);
        assert_eq!(first.memory_bytes, 64 * 1024 * 1024);
        assert!((first.memory_percent() - 6.25).abs() < 0.01);

        // Second call reuses the cached sample instead of sampling twice
        let second = s.orchestrator.get_stats("web").await.unwrap();
        assert!((second.cpu_percent - 12.5).abs() < 0.01);

        let snapshot = s.orchestrator.registry().get("web").unwrap().resource_snapshot;
        assert_eq!(snapshot, Some(second));
    }

    #[tokio::test]
    async fn test_get_stats_requires_running() {
        let s = setup();
        assert!(matches!(
            s.orchestrator.get_stats("web").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_check_health_detects_crash() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        assert!(s.orchestrator.check_health("web").await.unwrap());

        s.runtime.crash("wakegate-web");
        assert!(!s.orchestrator.check_health("web").await.unwrap());
        assert_eq!(status(&s), ServiceStatus::Error);
        assert!(s.proxy.route("web").is_none());
    }

    #[tokio::test]
    async fn test_check_health_runtime_unavailable_keeps_status() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        s.runtime.set_unavailable(true);

        let err = s.orchestrator.check_health("web").await.unwrap_err();
        assert!(err.is_runtime_unavailable());
        assert_eq!(status(&s), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_delete_resets_error_first() {
        let s = setup();
        s.runtime
            .fail_starts(Some(RuntimeError::Failed("bad image".into())));
        let _ = s.orchestrator.wake("web").await;
        assert_eq!(status(&s), ServiceStatus::Error);

        s.orchestrator.delete("web").await.unwrap();
        assert!(s.orchestrator.registry().get("web").is_err());
    }

    #[tokio::test]
    async fn test_delete_running_is_refused() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        assert!(matches!(
            s.orchestrator.delete("web").await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(status(&s), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_logs_delegate_to_runtime() {
        let s = setup();
        let logs = s.orchestrator.logs("web", 2).await.unwrap();
        assert_eq!(logs, "wakegate-web line 0\nwakegate-web line 1\n");
    }

    #[tokio::test]
    async fn test_sleep_all() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        assert!(s.orchestrator.sleep_all().await.is_empty());
        assert_eq!(status(&s), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_adopt_running_container() {
        let s = setup();
        s.runtime.insert_running("wakegate-web");

        let adopted = s.orchestrator.adopt_running().await;
        assert_eq!(adopted, vec!["web".to_string()]);
        assert_eq!(status(&s), ServiceStatus::Running);
        assert_eq!(s.runtime.start_count(), 0);
        assert!(s.proxy.route("web").is_some());
    }

    #[tokio::test]
    async fn test_apply_config_reconciles() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();

        let api = NewService::new(
            "api",
            "api",
            RuntimeRef::image("api:latest"),
            vec![PortMapping::new(3000, 3000)],
        );
        let result = s.orchestrator.apply_config(vec![api.clone()]).await;
        assert_eq!(result.added, vec!["api".to_string()]);
        assert_eq!(result.removed, vec!["web".to_string()]);
        assert!(result.errors.is_empty());
        assert!(s.orchestrator.registry().get("web").is_err());
        assert_eq!(s.proxy.reload_count(), 1);

        let mut changed = api.clone();
        changed.subdomain = "backend".into();
        let result = s.orchestrator.apply_config(vec![changed]).await;
        assert_eq!(result.updated, vec!["api".to_string()]);
        assert_eq!(
            s.orchestrator.registry().get("api").unwrap().subdomain,
            "backend"
        );

        let mut same = api;
        same.subdomain = "backend".into();
        let result = s.orchestrator.apply_config(vec![same]).await;
        assert!(!result.has_changes());
    }

    async fn wait_for(s: &Setup, want: ServiceStatus) {
        for _ in 0..200 {
            if status(s) == want {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("service never reached {}, still {}", want, status(s));
    }

    #[tokio::test]
    async fn test_abandoned_wake_still_completes() {
        let s = setup();
        s.runtime.set_start_delay(Duration::from_millis(300));

        let caller = tokio::spawn({
            let orchestrator = Arc::clone(&s.orchestrator);
            async move { orchestrator.wake("web").await }
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(status(&s), ServiceStatus::Starting);
        caller.abort();
        let _ = caller.await;

        wait_for(&s, ServiceStatus::Running).await;
        assert_eq!(s.runtime.start_count(), 1);
        assert!(s.proxy.route("web").is_some());

        // The lock was released, so lifecycle operations work again
        s.orchestrator.restart("web").await.unwrap();
        assert_eq!(s.runtime.start_count(), 2);
        assert_eq!(status(&s), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_abandoned_sleep_still_completes() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        s.runtime.set_stop_delay(Duration::from_millis(300));

        let caller = tokio::spawn({
            let orchestrator = Arc::clone(&s.orchestrator);
            async move { orchestrator.sleep("web").await }
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(status(&s), ServiceStatus::Stopping);
        caller.abort();
        let _ = caller.await;

        wait_for(&s, ServiceStatus::Stopped).await;
        assert!(s.orchestrator.delete("web").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_route_failure_still_stops() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();
        assert!(!s.orchestrator.is_degraded("web"));

        s.proxy.set_failing(true);
        s.orchestrator.sleep("web").await.unwrap();

        assert_eq!(status(&s), ServiceStatus::Stopped);
        assert_eq!(s.runtime.stop_count(), 1);
        assert!(!s.runtime.is_running("wakegate-web"));
        assert!(s.orchestrator.is_degraded("web"));
        assert_eq!(s.orchestrator.degraded()[0].0, "web");

        // The next successful sync clears the mark
        s.proxy.set_failing(false);
        s.orchestrator.wake("web").await.unwrap();
        assert!(!s.orchestrator.is_degraded("web"));
    }

    fn web_on(host_port: u16) -> NewService {
        NewService::new(
            "web",
            "web",
            RuntimeRef::image("nginx:alpine"),
            vec![PortMapping::new(80, host_port)],
        )
        .with_domain("web.example.com")
    }

    #[tokio::test]
    async fn test_reload_defers_changes_to_running_service() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();

        let result = s.orchestrator.apply_config(vec![web_on(9090)]).await;
        assert_eq!(result.deferred, vec!["web".to_string()]);
        assert!(result.updated.is_empty());
        assert!(result.errors.is_empty());
        assert_eq!(s.proxy.reload_count(), 0);

        // Still served from the port the container was published on
        assert_eq!(
            s.orchestrator.get_service_url("web").as_deref(),
            Some("127.0.0.1:8080")
        );
        assert_eq!(s.proxy.route("web").unwrap().upstream_port, 8080);

        s.orchestrator.sleep("web").await.unwrap();
        assert_eq!(
            s.orchestrator.registry().get("web").unwrap().ports,
            vec![PortMapping::new(80, 8080)]
        );

        s.orchestrator.wake("web").await.unwrap();
        assert_eq!(
            s.orchestrator.get_service_url("web").as_deref(),
            Some("127.0.0.1:9090")
        );
        let spec = s.runtime.started_specs().pop().unwrap();
        assert_eq!(spec.ports, vec![PortMapping::new(80, 9090)]);
        assert_eq!(s.proxy.route("web").unwrap().upstream_port, 9090);
    }

    #[tokio::test]
    async fn test_reverted_reload_cancels_deferred_change() {
        let s = setup();
        s.orchestrator.wake("web").await.unwrap();

        let result = s.orchestrator.apply_config(vec![web_on(9090)]).await;
        assert_eq!(result.deferred, vec!["web".to_string()]);
        let result = s.orchestrator.apply_config(vec![web_on(8080)]).await;
        assert!(!result.has_changes());
        assert!(result.deferred.is_empty());

        s.orchestrator.restart("web").await.unwrap();
        assert_eq!(
            s.orchestrator.get_service_url("web").as_deref(),
            Some("127.0.0.1:8080")
        );
    }
}

//! In-memory collaborators for tests
//!
//! `StubRuntime` pretends to be a container engine and `StubProxy` records
//! route calls. Both can be told to fail or to be slow.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::caddy::{ProxyController, ProxyError, ProxyResult, RouteSpec};
use crate::runtime::{
    ContainerInspect, ContainerRuntime, RawStats, RuntimeError, RuntimeResult, StartSpec,
};
use crate::service::ContainerRef;

/// Counter units the stub advances the system CPU clock by per stats call
const SYSTEM_TICK: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
struct StubContainer {
    running: bool,
    cpu_total: u64,
    system_total: u64,
    cpu_percent: f64,
    memory_bytes: u64,
    memory_limit: u64,
}

impl Default for StubContainer {
    fn default() -> Self {
        Self {
            running: true,
            cpu_total: 0,
            system_total: 0,
            cpu_percent: 50.0,
            memory_bytes: 512 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
        }
    }
}

/// Container engine double keyed by container name
#[derive(Default)]
pub struct StubRuntime {
    containers: Mutex<HashMap<String, StubContainer>>,
    /// Load applied to containers when they start
    loads: Mutex<HashMap<String, (f64, u64)>>,
    starts: Mutex<Vec<StartSpec>>,
    stop_calls: AtomicUsize,
    in_flight_starts: AtomicUsize,
    max_in_flight_starts: AtomicUsize,
    start_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    start_error: Mutex<Option<RuntimeError>>,
    stop_error: Mutex<Option<RuntimeError>>,
    stats_errors: Mutex<HashMap<String, VecDeque<RuntimeError>>>,
    /// Containers that exit right after starting
    crash_on_start: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().len()
    }

    pub fn started_specs(&self) -> Vec<StartSpec> {
        self.starts.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `start` calls that were ever running concurrently
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_in_flight_starts.load(Ordering::SeqCst)
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    /// Every start fails with `err` until cleared with `None`
    pub fn fail_starts(&self, err: Option<RuntimeError>) {
        *self.start_error.lock() = err;
    }

    pub fn fail_stops(&self, err: Option<RuntimeError>) {
        *self.stop_error.lock() = err;
    }

    /// The next stats call for `container` fails once with `err`
    pub fn fail_next_stats(&self, container: &str, err: RuntimeError) {
        self.stats_errors
            .lock()
            .entry(container.to_string())
            .or_default()
            .push_back(err);
    }

    /// Make every call report the engine as unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// CPU percent and memory the container reports from now on
    pub fn set_load(&self, container: &str, cpu_percent: f64, memory_bytes: u64) {
        self.loads
            .lock()
            .insert(container.to_string(), (cpu_percent, memory_bytes));
        if let Some(c) = self.containers.lock().get_mut(container) {
            c.cpu_percent = cpu_percent;
            c.memory_bytes = memory_bytes;
        }
    }

    /// Simulate the container process exiting
    pub fn crash(&self, container: &str) {
        if let Some(c) = self.containers.lock().get_mut(container) {
            c.running = false;
        }
    }

    pub fn crash_on_start(&self, container: &str) {
        self.crash_on_start.lock().push(container.to_string());
    }

    /// Register a container as already running (state left behind by a
    /// previous process)
    pub fn insert_running(&self, container: &str) {
        self.containers
            .lock()
            .insert(container.to_string(), StubContainer::default());
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.containers
            .lock()
            .get(container)
            .map_or(false, |c| c.running)
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("stub engine offline".into()));
        }
        Ok(())
    }

    fn key(container: &ContainerRef) -> String {
        match container {
            ContainerRef::Container { id } => id.clone(),
            ContainerRef::Compose { project, .. } => project.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn start(&self, spec: &StartSpec) -> RuntimeResult<ContainerRef> {
        let now = self.in_flight_starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_starts.fetch_max(now, Ordering::SeqCst);
        self.starts.lock().push(spec.clone());

        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight_starts.fetch_sub(1, Ordering::SeqCst);

        self.check_available()?;
        if let Some(err) = self.start_error.lock().clone() {
            return Err(err);
        }

        let mut container = StubContainer::default();
        if let Some((cpu, memory)) = self.loads.lock().get(&spec.container_name) {
            container.cpu_percent = *cpu;
            container.memory_bytes = *memory;
        }
        if self.crash_on_start.lock().contains(&spec.container_name) {
            container.running = false;
        }
        self.containers
            .lock()
            .insert(spec.container_name.clone(), container);

        Ok(ContainerRef::Container {
            id: spec.container_name.clone(),
        })
    }

    async fn stop(&self, container: &ContainerRef, _grace: Duration) -> RuntimeResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        if let Some(err) = self.stop_error.lock().clone() {
            return Err(err);
        }
        if let Some(c) = self.containers.lock().get_mut(&Self::key(container)) {
            c.running = false;
        }
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerInspect> {
        self.check_available()?;
        let key = Self::key(container);
        let containers = self.containers.lock();
        let c = containers
            .get(&key)
            .ok_or_else(|| RuntimeError::NotFound(key.clone()))?;
        Ok(ContainerInspect {
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
            started_at: None,
        })
    }

    async fn stats(&self, container: &ContainerRef) -> RuntimeResult<RawStats> {
        self.check_available()?;
        let key = Self::key(container);
        if let Some(err) = self
            .stats_errors
            .lock()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let mut containers = self.containers.lock();
        let c = containers
            .get_mut(&key)
            .filter(|c| c.running)
            .ok_or_else(|| RuntimeError::NotFound(key.clone()))?;

        c.system_total += SYSTEM_TICK;
        c.cpu_total += (c.cpu_percent / 100.0 * SYSTEM_TICK as f64) as u64;
        Ok(RawStats {
            cpu_total_usage: c.cpu_total,
            system_cpu_usage: c.system_total,
            online_cpus: 1,
            memory_usage: c.memory_bytes,
            memory_limit: c.memory_limit,
            network_rx: 0,
            network_tx: 0,
        })
    }

    async fn logs(&self, container: &ContainerRef, tail: usize) -> RuntimeResult<String> {
        self.check_available()?;
        let key = Self::key(container);
        Ok((0..tail).map(|i| format!("{} line {}\n", key, i)).collect())
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.check_available()
    }
}

/// Edge proxy double recording the current routing table
#[derive(Default)]
pub struct StubProxy {
    routes: Mutex<HashMap<String, RouteSpec>>,
    apply_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    reload_calls: AtomicUsize,
    failing: AtomicBool,
}

impl StubProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn route(&self, name: &str) -> Option<RouteSpec> {
        self.routes.lock().get(name).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn apply_count(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn reload_count(&self) -> usize {
        self.reload_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> ProxyResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProxyError::Unreachable("stub proxy offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyController for StubProxy {
    async fn apply_route(&self, route: &RouteSpec) -> ProxyResult<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.routes.lock().insert(route.name.clone(), route.clone());
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> ProxyResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.routes.lock().remove(name);
        Ok(())
    }

    async fn reload(&self) -> ProxyResult<()> {
        self.reload_calls.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

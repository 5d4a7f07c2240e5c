//! Auto-sleep monitor
//!
//! Every `collect_interval` the monitor samples each running service, keeps
//! a bounded per-service history of samples and puts services to sleep when
//! they are inactive or have been using almost nothing for the whole
//! evaluation window. Either rule alone is enough.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::service::{MetricSample, ServiceDescriptor, ServiceStatus};

/// Configuration for the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub collect_interval: Duration,
    /// Samples older than this are evicted
    pub retention: Duration,
    /// Maximum samples kept per service
    pub history_capacity: usize,
    /// Fewer samples than this in the window never count as low utilization
    pub min_samples: usize,
    /// Fraction of samples that must be under both thresholds
    pub low_utilization_ratio: f64,
    /// Pause after a failed iteration
    pub error_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            history_capacity: 120,
            min_samples: 3,
            low_utilization_ratio: 0.8,
            error_backoff: Duration::from_secs(30),
        }
    }
}

/// Bounded FIFO of samples for one service
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    samples: VecDeque<MetricSample>,
    capacity: usize,
    retention: chrono::Duration,
}

impl MetricsHistory {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Append and evict past capacity or retention, measured from the new
    /// sample's timestamp
    pub fn push(&mut self, sample: MetricSample) {
        let now = sample.timestamp;
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        self.evict_before(now - self.retention);
    }

    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().map_or(false, |s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
    }

    /// Samples taken at or after `since`
    pub fn since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter().filter(move |s| s.timestamp >= since)
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Why a service should (or should not) be put to sleep
#[derive(Debug, Clone, PartialEq)]
pub enum SleepDecision {
    Keep,
    /// Became running less than `grace_period` ago
    InGracePeriod,
    Inactive { idle: Duration },
    LowUtilization {
        samples: usize,
        cpu_ratio: f64,
        memory_ratio: f64,
    },
}

impl SleepDecision {
    pub fn should_sleep(&self) -> bool {
        matches!(
            self,
            SleepDecision::Inactive { .. } | SleepDecision::LowUtilization { .. }
        )
    }
}

/// Apply the auto-shutdown policy of `service` to its history at `now`
pub fn evaluate(
    service: &ServiceDescriptor,
    history: &MetricsHistory,
    now: DateTime<Utc>,
    config: &MonitorConfig,
) -> SleepDecision {
    let policy = &service.auto_shutdown;

    if let Some(started) = service.started_at {
        if elapsed(started, now) < policy.grace_period {
            return SleepDecision::InGracePeriod;
        }
    }

    if let Some(last) = service.last_accessed_at.or(service.started_at) {
        let idle = elapsed(last, now);
        if idle > policy.inactive_timeout {
            return SleepDecision::Inactive { idle };
        }
    }

    let window_start = now
        - chrono::Duration::from_std(policy.evaluation_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
    let window: Vec<&MetricSample> = history.since(window_start).collect();
    if window.is_empty() || window.len() < config.min_samples {
        return SleepDecision::Keep;
    }

    let total = window.len() as f64;
    let cpu_low = window
        .iter()
        .filter(|s| s.cpu_percent < policy.cpu_threshold)
        .count() as f64;
    let memory_low = window
        .iter()
        .filter(|s| s.memory_bytes < policy.memory_threshold_bytes)
        .count() as f64;
    let cpu_ratio = cpu_low / total;
    let memory_ratio = memory_low / total;

    if cpu_ratio >= config.low_utilization_ratio && memory_ratio >= config.low_utilization_ratio {
        return SleepDecision::LowUtilization {
            samples: window.len(),
            cpu_ratio,
            memory_ratio,
        };
    }
    SleepDecision::Keep
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub sampled: Vec<String>,
    pub slept: Vec<(String, SleepDecision)>,
    /// Services found crashed and moved to ERROR
    pub crashed: Vec<String>,
    /// Per-service failures; the rest of the tick carried on
    pub failed: Vec<(String, String)>,
}

enum Probe {
    Sampled(MetricSample),
    Crashed,
    Failed(Error),
}

pub struct Monitor {
    orchestrator: Arc<Orchestrator>,
    config: MonitorConfig,
    histories: HashMap<String, MetricsHistory>,
}

impl Monitor {
    pub fn new(orchestrator: Arc<Orchestrator>, config: MonitorConfig) -> Self {
        Self {
            orchestrator,
            config,
            histories: HashMap::new(),
        }
    }

    pub fn history(&self, id: &str) -> Option<&MetricsHistory> {
        self.histories.get(id)
    }

    /// Record a sample taken outside of a tick
    pub fn record(&mut self, sample: MetricSample) {
        let (capacity, retention) = (self.config.history_capacity, self.config.retention);
        self.histories
            .entry(sample.service_id.clone())
            .or_insert_with(|| MetricsHistory::new(capacity, retention))
            .push(sample);
    }

    /// One pass over every running service
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        self.orchestrator.ping_runtime().await?;

        let running: Vec<ServiceDescriptor> = self
            .orchestrator
            .registry()
            .list()
            .into_iter()
            .filter(|d| d.status == ServiceStatus::Running)
            .collect();
        self.histories
            .retain(|id, _| running.iter().any(|d| &d.id == id));

        let probes = futures::future::join_all(running.iter().map(|d| self.probe(&d.id))).await;

        let mut report = TickReport::default();
        for (desc, probe) in running.iter().zip(probes) {
            let id = desc.id.clone();
            match probe {
                Probe::Sampled(sample) => {
                    self.record(sample);
                    report.sampled.push(id.clone());
                }
                Probe::Crashed => {
                    self.histories.remove(&id);
                    report.crashed.push(id);
                    continue;
                }
                Probe::Failed(e) => {
                    warn!(service = %id, error = %e, "Failed to collect stats, skipping this tick");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            }

            // Requests may have touched the service while we were sampling
            let Ok(current) = self.orchestrator.registry().get(&id) else {
                continue;
            };
            let Some(history) = self.histories.get(&id) else {
                continue;
            };
            let decision = evaluate(&current, history, now, &self.config);
            if !decision.should_sleep() {
                continue;
            }

            info!(service = %id, decision = ?decision, "Auto-sleeping service");
            match self.orchestrator.sleep(&id).await {
                Ok(()) => {
                    self.histories.remove(&id);
                    report.slept.push((id, decision));
                }
                Err(e) => {
                    error!(service = %id, error = %e, "Auto-sleep failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn probe(&self, id: &str) -> Probe {
        match self.orchestrator.check_health(id).await {
            Ok(true) => {}
            Ok(false) => return Probe::Crashed,
            Err(e) => return Probe::Failed(e),
        }
        match self.orchestrator.get_stats(id).await {
            Ok(sample) => Probe::Sampled(sample),
            Err(Error::ContainerGone(msg)) => {
                let reason = format!("container gone: {}", msg);
                match self.orchestrator.fail_running(id, &reason).await {
                    Ok(()) => Probe::Crashed,
                    Err(e) => Probe::Failed(e),
                }
            }
            Err(e) => Probe::Failed(e),
        }
    }

    /// Run until `shutdown` flips. Failed or panicking iterations are
    /// logged and retried after `error_backoff`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.collect_interval.as_secs(),
            "Starting monitor loop"
        );

        let mut ticker = interval(self.config.collect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Shutting down monitor loop");
                    break;
                }
            }

            let failure = match AssertUnwindSafe(self.tick(Utc::now())).catch_unwind().await {
                Ok(Ok(report)) => {
                    debug!(
                        sampled = report.sampled.len(),
                        slept = report.slept.len(),
                        crashed = report.crashed.len(),
                        failed = report.failed.len(),
                        "Monitor tick complete"
                    );
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("monitor tick panicked".to_string()),
            };

            if let Some(reason) = failure {
                error!(
                    error = %reason,
                    backoff_secs = self.config.error_backoff.as_secs(),
                    "Monitor iteration failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

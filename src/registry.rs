//! In-memory service registry
//!
//! The registry is the single source of truth for service status. Each
//! service has a lifecycle lock; lifecycle transitions and structural
//! mutations (update, delete) hold it, so a request-triggered wake can never
//! interleave with a monitor-triggered sleep on the same service.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::service::{
    ContainerRef, MetricSample, NewService, ServiceDescriptor, ServiceStatus, ServiceUpdate,
};

const STATUS_CHANNEL_CAPACITY: usize = 1024;

/// A status transition as observed by subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub id: String,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
    pub at: DateTime<Utc>,
}

struct ServiceSlot {
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    descriptor: RwLock<ServiceDescriptor>,
}

/// Registry of managed services
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceSlot>>,
    /// Serializes the uniqueness checks of create/update/delete
    catalog: Mutex<()>,
    status_tx: broadcast::Sender<StatusChange>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            services: DashMap::new(),
            catalog: Mutex::new(()),
            status_tx,
        }
    }

    pub fn get(&self, id: &str) -> Result<ServiceDescriptor> {
        self.services
            .get(id)
            .map(|slot| slot.descriptor.read().clone())
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Result<ServiceDescriptor> {
        self.services
            .iter()
            .find_map(|entry| {
                let desc = entry.value().descriptor.read();
                (desc.subdomain == subdomain).then(|| desc.clone())
            })
            .ok_or_else(|| Error::ServiceNotFound(format!("subdomain '{}'", subdomain)))
    }

    /// All services, ordered by name
    pub fn list(&self) -> Vec<ServiceDescriptor> {
        let mut all: Vec<_> = self
            .services
            .iter()
            .map(|entry| entry.value().descriptor.read().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn create(&self, spec: NewService) -> Result<ServiceDescriptor> {
        spec.validate()?;
        let _catalog = self.catalog.lock();

        if self.services.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("service '{}'", spec.name)));
        }
        self.ensure_subdomain_free(&spec.subdomain, None)?;

        let descriptor = spec.into_descriptor(Utc::now());
        let slot = Arc::new(ServiceSlot {
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            descriptor: RwLock::new(descriptor.clone()),
        });
        self.services.insert(descriptor.id.clone(), slot);

        info!(service = %descriptor.id, subdomain = %descriptor.subdomain, "Service registered");
        Ok(descriptor)
    }

    /// Apply a partial update. Waits for any in-flight lifecycle operation.
    pub async fn update(&self, id: &str, update: ServiceUpdate) -> Result<ServiceDescriptor> {
        update.validate()?;
        let guard = self.lock(id).await?;
        self.update_locked(&guard, update)
    }

    /// Apply a partial update to the service whose lock is already held
    pub fn update_locked(
        &self,
        guard: &ServiceGuard,
        update: ServiceUpdate,
    ) -> Result<ServiceDescriptor> {
        update.validate()?;
        let _catalog = self.catalog.lock();

        let id = guard.slot.descriptor.read().id.clone();
        if let Some(ref subdomain) = update.subdomain {
            self.ensure_subdomain_free(subdomain, Some(&id))?;
        }

        let mut desc = guard.slot.descriptor.write();
        update.apply(&mut desc);
        desc.updated_at = Utc::now();
        debug!(service = %id, "Service updated");
        Ok(desc.clone())
    }

    /// Remove a stopped service
    pub async fn delete(&self, id: &str) -> Result<ServiceDescriptor> {
        let guard = self.lock(id).await?;
        let _catalog = self.catalog.lock();

        let status = guard.status();
        if status != ServiceStatus::Stopped {
            return Err(Error::InvalidState(format!(
                "service '{}' is {}, it must be stopped before deletion",
                id, status
            )));
        }

        let descriptor = guard.descriptor();
        self.services.remove(id);
        info!(service = %id, "Service deleted");
        Ok(descriptor)
    }

    /// Acquire the lifecycle lock of a service
    pub async fn lock(&self, id: &str) -> Result<ServiceGuard> {
        let slot = self.slot(id)?;
        let lock = slot.lifecycle.clone().lock_owned().await;

        // The service may have been deleted while we waited
        match self.services.get(id) {
            Some(current) if Arc::ptr_eq(current.value(), &slot) => {}
            _ => return Err(Error::ServiceNotFound(id.to_string())),
        }

        Ok(ServiceGuard {
            slot,
            status_tx: self.status_tx.clone(),
            _lock: lock,
        })
    }

    /// Record activity. Never moves `last_accessed_at` backwards.
    pub fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let slot = self.slot(id)?;
        let mut desc = slot.descriptor.write();
        if desc.last_accessed_at.map_or(true, |prev| at > prev) {
            desc.last_accessed_at = Some(at);
        }
        Ok(())
    }

    pub fn record_snapshot(&self, id: &str, sample: MetricSample) -> Result<()> {
        let slot = self.slot(id)?;
        slot.descriptor.write().resource_snapshot = Some(sample);
        Ok(())
    }

    /// Subscribe to every status transition
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    fn slot(&self, id: &str) -> Result<Arc<ServiceSlot>> {
        self.services
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    fn ensure_subdomain_free(&self, subdomain: &str, except: Option<&str>) -> Result<()> {
        let taken = self.services.iter().any(|entry| {
            Some(entry.key().as_str()) != except
                && entry.value().descriptor.read().subdomain == subdomain
        });
        if taken {
            return Err(Error::AlreadyExists(format!("subdomain '{}'", subdomain)));
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive lifecycle access to one service
///
/// Status writes go through here and keep `container_ref` consistent with
/// the status: set in starting/running/stopping, cleared otherwise.
pub struct ServiceGuard {
    slot: Arc<ServiceSlot>,
    status_tx: broadcast::Sender<StatusChange>,
    _lock: OwnedMutexGuard<()>,
}

impl ServiceGuard {
    pub fn descriptor(&self) -> ServiceDescriptor {
        self.slot.descriptor.read().clone()
    }

    pub fn status(&self) -> ServiceStatus {
        self.slot.descriptor.read().status
    }

    /// STOPPED/ERROR -> STARTING
    pub fn begin_start(&self, planned: ContainerRef) -> Result<()> {
        self.transition(ServiceStatus::Starting, |desc| {
            desc.container_ref = Some(planned);
            desc.last_error = None;
        })
    }

    /// Record the concrete handle returned by the runtime while STARTING
    pub fn set_container_ref(&self, container: ContainerRef) {
        let mut desc = self.slot.descriptor.write();
        if desc.status.holds_container() {
            desc.container_ref = Some(container);
        }
    }

    /// STARTING -> RUNNING
    pub fn mark_running(&self, at: DateTime<Utc>) -> Result<()> {
        self.transition(ServiceStatus::Running, |desc| {
            desc.started_at = Some(at);
            desc.last_accessed_at = Some(at);
        })
    }

    /// RUNNING -> STOPPING
    pub fn begin_stop(&self) -> Result<()> {
        self.transition(ServiceStatus::Stopping, |_| {})
    }

    /// STOPPING/ERROR -> STOPPED
    pub fn mark_stopped(&self) -> Result<()> {
        self.transition(ServiceStatus::Stopped, |desc| {
            desc.container_ref = None;
            desc.started_at = None;
        })
    }

    /// Any in-flight or running state -> ERROR
    pub fn mark_error(&self, reason: &str) -> Result<()> {
        self.transition(ServiceStatus::Error, |desc| {
            desc.container_ref = None;
            desc.started_at = None;
            desc.last_error = Some(reason.to_string());
        })
    }

    fn transition(
        &self,
        to: ServiceStatus,
        apply: impl FnOnce(&mut ServiceDescriptor),
    ) -> Result<()> {
        let change = {
            let mut desc = self.slot.descriptor.write();
            let from = desc.status;
            if !from.can_transition_to(to) {
                return Err(Error::InvalidState(format!(
                    "service '{}' cannot go from {} to {}",
                    desc.id, from, to
                )));
            }
            desc.status = to;
            apply(&mut desc);
            desc.updated_at = Utc::now();
            StatusChange {
                id: desc.id.clone(),
                from,
                to,
                at: desc.updated_at,
            }
        };

        info!(service = %change.id, from = %change.from, to = %change.to, "Status changed");
        let _ = self.status_tx.send(change);
        Ok(())
    }
}

use super::directory::DirectoryClient;
use super::instance::{HealthStatus, ServiceInstance};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Period of the directory resync loop.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Instances whose heartbeat is older than this are marked offline.
const STALE_HEARTBEAT_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("instance '{id}' is already registered")]
    DuplicateInstance { id: String },

    #[error("unknown instance '{id}'")]
    UnknownInstance { id: String },
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(ServiceInstance),
    Deregistered { id: String },
    HealthChanged { id: String, status: HealthStatus },
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

struct RegistryInner {
    instances: RwLock<HashMap<String, ServiceInstance>>,
    probes: Mutex<HashMap<String, JoinHandle<()>>>,
    directory: Option<Arc<dyn DirectoryClient>>,
    http: reqwest::Client,
    events: broadcast::Sender<RegistryEvent>,
}

/// Tracks instances per logical service name, probes their health and picks
/// load-balanced targets. Optionally mirrors into an external directory;
/// when the directory is unreachable every operation degrades to the local
/// view instead of failing.
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    /// Local-only registry.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Registry mirrored into an external directory. Performs an initial
    /// full pull, then resyncs periodically.
    pub fn with_directory(directory: Arc<dyn DirectoryClient>) -> Self {
        Self::build(Some(directory))
    }

    fn build(directory: Option<Arc<dyn DirectoryClient>>) -> Self {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(RegistryInner {
            instances: RwLock::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            directory,
            http: reqwest::Client::new(),
            events,
        });

        let sync_task = if inner.directory.is_some() {
            let sync_inner = Arc::clone(&inner);
            Some(tokio::spawn(run_directory_sync(sync_inner)))
        } else {
            None
        };

        Self {
            inner,
            sync_task: Mutex::new(sync_task),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Register an instance and start probing it on its configured interval.
    pub async fn register(&self, instance: ServiceInstance) -> Result<(), RegistryError> {
        {
            let mut instances = self.inner.instances.write().unwrap();
            if instances.contains_key(&instance.id) {
                return Err(RegistryError::DuplicateInstance {
                    id: instance.id.clone(),
                });
            }
            instances.insert(instance.id.clone(), instance.clone());
        }

        info!(
            instance = %instance.id,
            service = %instance.name,
            address = %instance.base_url(),
            "instance registered"
        );
        let _ = self.inner.events.send(RegistryEvent::Registered(instance.clone()));

        let probe_inner = Arc::clone(&self.inner);
        let probe_id = instance.id.clone();
        let handle = tokio::spawn(run_probe(probe_inner, probe_id));
        self.inner
            .probes
            .lock()
            .unwrap()
            .insert(instance.id.clone(), handle);

        if let Some(directory) = &self.inner.directory {
            if let Err(e) = directory.register(&instance).await {
                warn!(instance = %instance.id, error = %e, "directory register failed, continuing local-only");
            }
        }

        Ok(())
    }

    /// Remove an instance, stop its probe, and drop it from the directory.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self
            .inner
            .instances
            .write()
            .unwrap()
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownInstance { id: id.to_string() })?;

        if let Some(handle) = self.inner.probes.lock().unwrap().remove(id) {
            handle.abort();
        }

        info!(instance = %id, service = %removed.name, "instance deregistered");
        let _ = self
            .inner
            .events
            .send(RegistryEvent::Deregistered { id: id.to_string() });

        if let Some(directory) = &self.inner.directory {
            if let Err(e) = directory.deregister(id).await {
                warn!(instance = %id, error = %e, "directory deregister failed");
            }
        }

        Ok(())
    }

    /// All non-offline instances of a service. Directory results are
    /// preferred when the directory answers; otherwise the local view.
    pub async fn discover(&self, name: &str) -> Vec<ServiceInstance> {
        if let Some(directory) = &self.inner.directory {
            match directory.list_healthy(name).await {
                Ok(instances) if !instances.is_empty() => {
                    return instances
                        .into_iter()
                        .filter(|i| i.status != HealthStatus::Offline)
                        .collect();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(service = name, error = %e, "directory discover failed, using local view");
                }
            }
        }

        self.inner
            .instances
            .read()
            .unwrap()
            .values()
            .filter(|i| i.name == name && i.status != HealthStatus::Offline)
            .cloned()
            .collect()
    }

    /// Uniformly-random healthy instance; degraded instances only serve
    /// when no healthy one exists, offline instances never.
    pub fn healthy_instance(&self, name: &str) -> Option<ServiceInstance> {
        let instances = self.inner.instances.read().unwrap();
        let healthy: Vec<&ServiceInstance> = instances
            .values()
            .filter(|i| i.name == name && i.status == HealthStatus::Healthy)
            .collect();

        let pool = if healthy.is_empty() {
            instances
                .values()
                .filter(|i| i.name == name && i.status == HealthStatus::Degraded)
                .collect()
        } else {
            healthy
        };

        if pool.is_empty() {
            None
        } else {
            Some(pool[fastrand::usize(..pool.len())].clone())
        }
    }

    /// Local lookup with directory fallback.
    pub async fn get_service(&self, id: &str) -> Option<ServiceInstance> {
        if let Some(instance) = self.inner.instances.read().unwrap().get(id) {
            return Some(instance.clone());
        }

        if let Some(directory) = &self.inner.directory {
            match directory.list_services().await {
                Ok(instances) => return instances.into_iter().find(|i| i.id == id),
                Err(e) => warn!(instance = %id, error = %e, "directory lookup failed"),
            }
        }

        None
    }

    /// Union of local and directory-known instances; local wins on id
    /// conflicts.
    pub async fn all_services(&self) -> Vec<ServiceInstance> {
        let mut merged: HashMap<String, ServiceInstance> = HashMap::new();

        if let Some(directory) = &self.inner.directory {
            match directory.list_services().await {
                Ok(instances) => {
                    for instance in instances {
                        merged.insert(instance.id.clone(), instance);
                    }
                }
                Err(e) => warn!(error = %e, "directory listing failed"),
            }
        }

        for instance in self.inner.instances.read().unwrap().values() {
            merged.insert(instance.id.clone(), instance.clone());
        }

        merged.into_values().collect()
    }

    /// Set an instance's status and refresh its heartbeat, mirroring the
    /// change into the directory's vocabulary.
    pub async fn update_health(&self, id: &str, status: HealthStatus) -> Result<(), RegistryError> {
        apply_health(&self.inner, id, status).await
    }

    /// Probe an instance's health endpoint and record the result.
    pub async fn check_service_health(&self, instance: &ServiceInstance) -> HealthReport {
        probe_instance(&self.inner, instance).await
    }

    /// Stop all probing and syncing, deregister locally-owned instances.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sync_task.lock().unwrap().take() {
            handle.abort();
        }

        let probes: Vec<(String, JoinHandle<()>)> =
            self.inner.probes.lock().unwrap().drain().collect();
        for (_, handle) in probes {
            handle.abort();
        }

        let ids: Vec<String> = self
            .inner
            .instances
            .write()
            .unwrap()
            .drain()
            .map(|(id, _)| id)
            .collect();

        if let Some(directory) = &self.inner.directory {
            for id in &ids {
                if let Err(e) = directory.deregister(id).await {
                    warn!(instance = %id, error = %e, "directory deregister failed during shutdown");
                }
            }
        }

        info!(instances = ids.len(), "service registry shut down");
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn apply_health(
    inner: &Arc<RegistryInner>,
    id: &str,
    status: HealthStatus,
) -> Result<(), RegistryError> {
    {
        let mut instances = inner.instances.write().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance { id: id.to_string() })?;
        instance.status = status;
        instance.last_heartbeat = Utc::now();
    }

    debug!(instance = %id, %status, "health updated");
    let _ = inner.events.send(RegistryEvent::HealthChanged {
        id: id.to_string(),
        status,
    });

    if let Some(directory) = &inner.directory {
        if let Err(e) = directory.update_health(id, status.into()).await {
            warn!(instance = %id, error = %e, "directory health update failed");
        }
    }

    Ok(())
}

async fn probe_instance(inner: &Arc<RegistryInner>, instance: &ServiceInstance) -> HealthReport {
    let url = instance.health_check_url();
    let started = Instant::now();

    let (status, response_time_ms, error) = match inner
        .http
        .get(&url)
        .timeout(instance.health_check.timeout())
        .send()
        .await
    {
        Ok(response) => {
            let elapsed = started.elapsed().as_millis() as u64;
            if response.status() == reqwest::StatusCode::OK {
                (HealthStatus::Healthy, Some(elapsed), None)
            } else {
                // Reachable but complaining; treated uniformly as degraded
                (
                    HealthStatus::Degraded,
                    Some(elapsed),
                    Some(format!("HTTP {}", response.status().as_u16())),
                )
            }
        }
        Err(e) => (HealthStatus::Unhealthy, None, Some(e.to_string())),
    };

    if let Err(RegistryError::UnknownInstance { .. }) =
        apply_health(inner, &instance.id, status).await
    {
        debug!(instance = %instance.id, "probed instance no longer registered");
    }

    HealthReport {
        service: instance.id.clone(),
        status,
        response_time_ms,
        error,
        timestamp: Utc::now(),
    }
}

async fn run_probe(inner: Arc<RegistryInner>, id: String) {
    let period = {
        let instances = inner.instances.read().unwrap();
        match instances.get(&id) {
            Some(instance) => instance.health_check.interval(),
            None => return,
        }
    };
    // interval() panics on zero
    let period = period.max(Duration::from_millis(10));

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        ticker.tick().await;
        let snapshot = {
            let instances = inner.instances.read().unwrap();
            match instances.get(&id) {
                Some(instance) => instance.clone(),
                None => break,
            }
        };
        probe_instance(&inner, &snapshot).await;
    }
}

async fn run_directory_sync(inner: Arc<RegistryInner>) {
    // Initial full pull
    sync_once(&inner).await;

    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sync_once(&inner).await;
    }
}

async fn sync_once(inner: &Arc<RegistryInner>) {
    if let Some(directory) = &inner.directory {
        match directory.list_services().await {
            Ok(instances) => {
                let mut local = inner.instances.write().unwrap();
                for instance in instances {
                    if !local.contains_key(&instance.id) {
                        debug!(instance = %instance.id, service = %instance.name, "adopting instance from directory");
                        local.insert(instance.id.clone(), instance);
                    }
                }
            }
            Err(e) => warn!(error = %e, "directory sync failed, keeping local view"),
        }
    }

    // Reap instances that stopped heartbeating
    let now = Utc::now();
    let mut stale = Vec::new();
    {
        let mut local = inner.instances.write().unwrap();
        for instance in local.values_mut() {
            if instance.status != HealthStatus::Offline
                && now.signed_duration_since(instance.last_heartbeat).num_seconds()
                    > STALE_HEARTBEAT_SECS
            {
                instance.status = HealthStatus::Offline;
                stale.push(instance.id.clone());
            }
        }
    }
    for id in stale {
        warn!(instance = %id, "heartbeat stale, marking offline");
        let _ = inner.events.send(RegistryEvent::HealthChanged {
            id,
            status: HealthStatus::Offline,
        });
    }
}

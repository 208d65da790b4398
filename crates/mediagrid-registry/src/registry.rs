//! The backend registry: owns every instance, assigns ids, persists the
//! configured list, and hands backends their runtime context.
//!
//! Real backends (id >= 0) come from the save file or operator edits and
//! persist. Non-real backends (id < 0) are spawned at runtime by control
//! instances (remote proxies, auto-scalers) and never touch disk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use mediagrid_backend::types::{BackendTypeRegistry, SECRET_PLACEHOLDER};
use mediagrid_backend::{
    BackendContext, GenerationBackend, InstanceHost, NonrealSpec, ScaleHook,
};
use mediagrid_core::{BackendId, BackendStatus, BackendsConfig, ticks_ms};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight jobs before giving up on them.
const SHUTDOWN_DRAIN_LIMIT: std::time::Duration = std::time::Duration::from_secs(5);

use crate::error::{RegistryError, RegistryResult};
use crate::init_queue::InitQueue;
use crate::instance::BackendInstance;

pub struct BackendRegistry {
    pub config: BackendsConfig,
    pub types: BackendTypeRegistry,
    instances: RwLock<HashMap<BackendId, Arc<BackendInstance>>>,
    next_real_id: AtomicI64,
    next_nonreal_id: AtomicI64,
    pub init_queue: InitQueue,
    scale_hooks: Mutex<HashMap<BackendId, ScaleHook>>,
    /// Save-file entries we could not understand (unknown type, bad
    /// settings). Carried through saves so they are never silently lost.
    orphans: Mutex<toml::Table>,
    save_lock: tokio::sync::Mutex<()>,
    edited: AtomicBool,
    shutting_down: AtomicBool,
    pub cancel: CancellationToken,
    self_ref: Mutex<Weak<BackendRegistry>>,
}

impl BackendRegistry {
    pub fn new(config: BackendsConfig, types: BackendTypeRegistry) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            types,
            instances: RwLock::new(HashMap::new()),
            next_real_id: AtomicI64::new(0),
            next_nonreal_id: AtomicI64::new(-1),
            init_queue: InitQueue::new(),
            scale_hooks: Mutex::new(HashMap::new()),
            orphans: Mutex::new(toml::Table::new()),
            save_lock: tokio::sync::Mutex::new(()),
            edited: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            self_ref: Mutex::new(Weak::new()),
        });
        *this.self_ref.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Host handle backends use to reach back into the registry.
    pub fn host(&self) -> Arc<dyn InstanceHost> {
        Arc::new(RegistryHandle(self.self_ref.lock().unwrap().clone()))
    }

    pub fn get(&self, id: BackendId) -> Option<Arc<BackendInstance>> {
        self.instances.read().unwrap().get(&id).cloned()
    }

    /// Snapshot of all instances, ordered by id for deterministic scans.
    pub fn all(&self) -> Vec<Arc<BackendInstance>> {
        let mut all: Vec<_> = self.instances.read().unwrap().values().cloned().collect();
        all.sort_by_key(|i| i.id);
        all
    }

    pub fn count(&self) -> usize {
        self.instances.read().unwrap().len()
    }

    /// Instances that can actually serve jobs. Control instances carry
    /// `max_usages == 0` and are excluded.
    pub fn generation_backends(&self) -> Vec<Arc<BackendInstance>> {
        self.all()
            .into_iter()
            .filter(|i| i.max_usages.load(Ordering::SeqCst) > 0)
            .collect()
    }

    /// Running instances of one type, excluding any being torn down.
    pub fn running_of_type(&self, type_id: &str) -> Vec<Arc<BackendInstance>> {
        self.all()
            .into_iter()
            .filter(|i| {
                i.type_info.id == type_id
                    && i.status() == BackendStatus::Running
                    && !i.shutdown_reserve.load(Ordering::SeqCst)
            })
            .collect()
    }

    /// Union of feature tags over every enabled, non-idle backend.
    pub fn supported_features(&self) -> HashSet<String> {
        let mut features = HashSet::new();
        for instance in self.all() {
            if instance.enabled.load(Ordering::SeqCst)
                && instance.status() != BackendStatus::Idle
            {
                features.extend(instance.backend.supported_features());
            }
        }
        features
    }

    /// Runtime context handed to a backend's init.
    pub fn context_for(&self, instance: &Arc<BackendInstance>) -> BackendContext {
        let weak = Arc::downgrade(instance);
        BackendContext {
            id: instance.id,
            title: instance.title(),
            status: Arc::clone(&instance.status),
            current_model: Arc::clone(&instance.current_model),
            max_usages: Arc::clone(&instance.max_usages),
            can_load_models: Arc::clone(&instance.can_load_models),
            host: self.host(),
            cancel: instance.cancel.clone(),
            report: Arc::new(move |message| {
                if let Some(instance) = weak.upgrade() {
                    debug!(id = instance.id, "{message}");
                    instance.add_load_status(message);
                }
            }),
        }
    }

    /// Put an instance back through init from scratch (forced restart).
    pub fn requeue_init(&self, instance: &Arc<BackendInstance>) {
        instance.init_attempts.store(0, Ordering::SeqCst);
        instance.stuck_checks.store(0, Ordering::SeqCst);
        self.enqueue_init(instance);
    }

    fn enqueue_init(&self, instance: &Arc<BackendInstance>) {
        instance.status.set(BackendStatus::Waiting);
        instance.begin_load_status();
        instance.add_load_status("waiting to load");
        let fast = instance.type_info.can_load_fast || self.config.all_backends_load_fast;
        if fast {
            self.init_queue.push_fast(Arc::clone(instance));
        } else {
            self.init_queue.push_slow(Arc::clone(instance));
        }
    }

    fn construct(
        &self,
        type_id: &str,
        settings: &toml::Table,
    ) -> RegistryResult<(Arc<mediagrid_backend::types::BackendTypeInfo>, Arc<dyn GenerationBackend>)>
    {
        let info = self
            .types
            .get(type_id)
            .ok_or_else(|| RegistryError::UnknownType(type_id.to_string()))?;
        let backend = (info.constructor)(settings).map_err(RegistryError::Construction)?;
        Ok((info, backend))
    }

    /// Create, register, and queue a new user-configured backend.
    pub async fn add_new_of_type(
        &self,
        type_id: &str,
        title: &str,
        settings: toml::Table,
    ) -> RegistryResult<Arc<BackendInstance>> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }
        let (info, backend) = self.construct(type_id, &settings)?;
        let id = self.next_real_id.fetch_add(1, Ordering::SeqCst);
        let title = if title.is_empty() {
            format!("{} #{id}", info.name)
        } else {
            title.to_string()
        };
        let instance =
            BackendInstance::new(id, info, backend, title, settings, &self.cancel);
        self.instances
            .write()
            .unwrap()
            .insert(id, Arc::clone(&instance));
        info!(id, backend_type = %type_id, "added backend");
        self.enqueue_init(&instance);
        self.edited.store(true, Ordering::SeqCst);
        self.save().await?;
        Ok(instance)
    }

    /// Register an already-built backend object. Used by tests and by
    /// internal spawners that construct outside the type table.
    pub fn add_preconstructed(
        &self,
        type_id: &str,
        backend: Arc<dyn GenerationBackend>,
        title: &str,
        settings: toml::Table,
    ) -> RegistryResult<Arc<BackendInstance>> {
        let info = self
            .types
            .get(type_id)
            .ok_or_else(|| RegistryError::UnknownType(type_id.to_string()))?;
        let id = self.next_real_id.fetch_add(1, Ordering::SeqCst);
        let instance =
            BackendInstance::new(id, info, backend, title.to_string(), settings, &self.cancel);
        self.instances
            .write()
            .unwrap()
            .insert(id, Arc::clone(&instance));
        self.enqueue_init(&instance);
        Ok(instance)
    }

    /// Remove a backend: cancel it, drain running jobs, shut it down.
    /// Ephemeral children of the backend are removed the same way first.
    pub async fn delete_by_id(self: &Arc<Self>, id: BackendId) -> RegistryResult<bool> {
        let Some(instance) = self.instances.write().unwrap().remove(&id) else {
            return Ok(false);
        };
        info!(id, title = %instance.title(), "removing backend");
        self.scale_hooks.lock().unwrap().remove(&id);

        let child_ids: Vec<BackendId> = self
            .instances
            .read()
            .unwrap()
            .values()
            .filter(|candidate| {
                candidate
                    .parent
                    .lock()
                    .unwrap()
                    .as_ref()
                    .and_then(|weak| weak.upgrade())
                    .is_some_and(|parent| parent.id == id)
            })
            .map(|child| child.id)
            .collect();
        for child_id in child_ids {
            Box::pin(self.delete_by_id(child_id)).await?;
        }

        instance.shutdown_reserve.store(true, Ordering::SeqCst);
        instance.cancel.cancel();
        self.drain_for_teardown(&instance).await;
        instance.backend.shutdown().await;
        instance.status.set(BackendStatus::Disabled);
        *instance.current_model.lock().unwrap() = None;

        if instance.is_real() && !self.is_shutting_down() {
            self.edited.store(true, Ordering::SeqCst);
            self.save().await?;
        }
        Ok(true)
    }

    /// Wait for an instance's in-flight jobs, but never outlive the
    /// pool: a global cancel abandons the wait so one leaked claim
    /// cannot wedge teardown.
    async fn drain_for_teardown(&self, instance: &Arc<BackendInstance>) {
        if instance.max_usages.load(Ordering::SeqCst) == 0 {
            return;
        }
        tokio::select! {
            _ = instance.wait_drained() => {}
            _ = self.cancel.cancelled() => {
                warn!(id = instance.id, "pool is stopping, abandoning drain wait");
            }
        }
    }

    /// Replace a backend's settings/title/enabled flag, optionally moving
    /// it to a new unused id. The old backend object is drained and shut
    /// down, and a fresh one is built and queued for init.
    ///
    /// Secret settings submitted as the placeholder keep their stored
    /// value, so clients can echo masked settings back unchanged.
    pub async fn edit_by_id(
        &self,
        id: BackendId,
        title: Option<String>,
        enabled: Option<bool>,
        new_settings: Option<toml::Table>,
        new_id: Option<BackendId>,
    ) -> RegistryResult<Arc<BackendInstance>> {
        let old = self.get(id).ok_or(RegistryError::UnknownBackend(id))?;
        let target_id = new_id.unwrap_or(id);
        if target_id != id && self.instances.read().unwrap().contains_key(&target_id) {
            return Err(RegistryError::IdInUse(target_id));
        }

        let mut settings = old.settings.lock().unwrap().clone();
        if let Some(new_settings) = new_settings {
            let secrets: Vec<&str> = old.type_info.secret_fields().collect();
            for (key, value) in new_settings {
                let keep_stored = secrets.contains(&key.as_str())
                    && value.as_str() == Some(SECRET_PLACEHOLDER);
                if !keep_stored {
                    settings.insert(key, value);
                }
            }
        }

        // Build the replacement first; a bad edit must not kill the
        // running backend.
        let (info, backend) = self.construct(&old.type_info.id, &settings)?;

        old.mod_count.fetch_add(1, Ordering::SeqCst);
        old.shutdown_reserve.store(true, Ordering::SeqCst);
        self.drain_for_teardown(&old).await;
        old.cancel.cancel();
        old.backend.shutdown().await;

        let instance = BackendInstance::new(
            target_id,
            info,
            backend,
            title.unwrap_or_else(|| old.title()),
            settings,
            &self.cancel,
        );
        instance
            .enabled
            .store(enabled.unwrap_or(old.enabled.load(Ordering::SeqCst)), Ordering::SeqCst);
        instance
            .mod_count
            .store(old.mod_count.load(Ordering::SeqCst), Ordering::SeqCst);
        *instance.parent.lock().unwrap() = old.parent.lock().unwrap().clone();
        {
            let mut instances = self.instances.write().unwrap();
            if target_id != id {
                instances.remove(&id);
            }
            instances.insert(target_id, Arc::clone(&instance));
        }
        if target_id >= 0 {
            self.next_real_id.fetch_max(target_id + 1, Ordering::SeqCst);
        }
        info!(id, target_id, "edited backend, reloading it");
        if instance.enabled.load(Ordering::SeqCst) {
            self.enqueue_init(&instance);
        } else {
            instance.status.set(BackendStatus::Disabled);
        }
        if instance.is_real() || old.is_real() {
            self.edited.store(true, Ordering::SeqCst);
            self.save().await?;
        }
        Ok(instance)
    }

    /// Stop one backend's current object and run it through init again.
    /// Unlike [`edit_by_id`](Self::edit_by_id) the backend object is
    /// reused; this is for picking up external changes (model folders,
    /// remote peers coming back) rather than settings changes.
    pub async fn reload_backend(&self, id: BackendId) -> RegistryResult<()> {
        let instance = self.get(id).ok_or(RegistryError::UnknownBackend(id))?;
        self.reload_instance(&instance).await;
        Ok(())
    }

    pub async fn reload_all(&self) {
        info!("reloading all backends");
        for instance in self.all() {
            self.reload_instance(&instance).await;
        }
    }

    async fn reload_instance(&self, instance: &Arc<BackendInstance>) {
        instance.shutdown_reserve.store(true, Ordering::SeqCst);
        self.drain_for_teardown(instance).await;
        instance.backend.shutdown().await;
        *instance.current_model.lock().unwrap() = None;
        instance.shutdown_reserve.store(false, Ordering::SeqCst);
        if instance.enabled.load(Ordering::SeqCst) {
            self.requeue_init(instance);
        } else {
            instance.status.set(BackendStatus::Disabled);
        }
    }

    /// Client-facing view of one instance, secrets masked.
    pub fn net_description(&self, instance: &Arc<BackendInstance>) -> serde_json::Value {
        let mut settings = instance.settings.lock().unwrap().clone();
        for field in instance.type_info.secret_fields() {
            if settings.contains_key(field) {
                settings.insert(field.to_string(), toml::Value::String(SECRET_PLACEHOLDER.into()));
            }
        }
        serde_json::json!({
            "id": instance.id,
            "type": instance.type_info.id,
            "title": instance.title(),
            "status": instance.status(),
            "enabled": instance.enabled.load(Ordering::SeqCst),
            "current_model": instance.current_model(),
            "max_usages": instance.max_usages.load(Ordering::SeqCst),
            "settings": settings.iter().map(|(k, v)| {
                (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null))
            }).collect::<serde_json::Map<_, _>>(),
        })
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Load the saved backends list and queue every entry for init.
    /// Unknown or unreadable entries are logged, kept aside, and written
    /// back out verbatim on the next save.
    pub async fn load_from_disk(&self) -> RegistryResult<usize> {
        let path = self.config.save_path.clone();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved backends list");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let table: toml::Table = text.parse()?;
        let mut loaded = 0;
        self.init_queue.set_bulk_loading(true);
        for (key, value) in table {
            let Ok(id) = key.parse::<BackendId>() else {
                warn!(%key, "save file entry has a non-numeric id, keeping it aside");
                self.orphans.lock().unwrap().insert(key, value);
                continue;
            };
            let Some(entry) = value.as_table() else {
                warn!(id, "save file entry is not a table, keeping it aside");
                self.orphans.lock().unwrap().insert(key, value);
                continue;
            };
            let type_id = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let title = entry
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let enabled = entry.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
            let settings = entry
                .get("settings")
                .and_then(|v| v.as_table())
                .cloned()
                .unwrap_or_default();
            let (info, backend) = match self.construct(type_id, &settings) {
                Ok(pair) => pair,
                Err(err) => {
                    error!(id, backend_type = %type_id, %err, "cannot restore saved backend, keeping its entry aside");
                    self.orphans.lock().unwrap().insert(key, value);
                    continue;
                }
            };
            let instance =
                BackendInstance::new(id, info, backend, title, settings, &self.cancel);
            instance.enabled.store(enabled, Ordering::SeqCst);
            self.next_real_id.fetch_max(id + 1, Ordering::SeqCst);
            self.instances
                .write()
                .unwrap()
                .insert(id, Arc::clone(&instance));
            if enabled {
                self.enqueue_init(&instance);
            } else {
                instance.status.set(BackendStatus::Disabled);
            }
            loaded += 1;
        }
        info!(loaded, path = %path.display(), "restored saved backends");
        Ok(loaded)
    }

    /// Write the current real backends (plus any orphaned entries) out.
    pub async fn save(&self) -> RegistryResult<()> {
        let _guard = self.save_lock.lock().await;
        let mut table = self.orphans.lock().unwrap().clone();
        let mut real: Vec<Arc<BackendInstance>> =
            self.all().into_iter().filter(|i| i.is_real()).collect();
        real.sort_by_key(|i| i.id);
        for instance in real {
            let mut entry = toml::Table::new();
            entry.insert(
                "type".into(),
                toml::Value::String(instance.type_info.id.clone()),
            );
            entry.insert("title".into(), toml::Value::String(instance.title()));
            entry.insert(
                "enabled".into(),
                toml::Value::Boolean(instance.enabled.load(Ordering::SeqCst)),
            );
            entry.insert(
                "settings".into(),
                toml::Value::Table(instance.settings.lock().unwrap().clone()),
            );
            table.insert(instance.id.to_string(), toml::Value::Table(entry));
        }
        let text = toml::to_string_pretty(&table)?;
        let path = &self.config.save_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        self.edited.store(false, Ordering::SeqCst);
        debug!(path = %path.display(), "saved backends list");
        Ok(())
    }

    // ── Scale hooks ──────────────────────────────────────────────────

    pub fn register_scale_hook(&self, key: BackendId, hook: ScaleHook) {
        self.scale_hooks.lock().unwrap().insert(key, hook);
    }

    pub fn unregister_scale_hook(&self, key: BackendId) {
        self.scale_hooks.lock().unwrap().remove(&key);
    }

    pub fn scale_hooks(&self) -> Vec<ScaleHook> {
        self.scale_hooks.lock().unwrap().values().cloned().collect()
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Cleanly stop the whole pool: reserve everything against new jobs,
    /// let running jobs finish, then shut each backend down.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down backend pool");
        self.cancel.cancel();
        let all = self.all();
        for instance in &all {
            instance.shutdown_reserve.store(true, Ordering::SeqCst);
        }
        for instance in &all {
            // Control instances carry max_usages 0 and never hold jobs.
            if instance.max_usages.load(Ordering::SeqCst) > 0
                && tokio::time::timeout(SHUTDOWN_DRAIN_LIMIT, instance.wait_drained())
                    .await
                    .is_err()
            {
                warn!(id = instance.id,
                      usages = instance.usages.load(Ordering::SeqCst),
                      "backend still busy after the drain window, shutting it down anyway");
            }
            instance.backend.shutdown().await;
            instance.status.set(BackendStatus::Disabled);
        }
        self.instances.write().unwrap().clear();
        if self.edited.load(Ordering::SeqCst) {
            if let Err(err) = self.save().await {
                error!(%err, "final save failed during shutdown");
            }
        }
        info!("backend pool is down");
    }
}

/// Weak host handle handed to backends. Holding it weak keeps removed
/// backends from pinning the registry alive.
struct RegistryHandle(Weak<BackendRegistry>);

#[async_trait]
impl InstanceHost for RegistryHandle {
    async fn spawn_nonreal(&self, spec: NonrealSpec) -> anyhow::Result<BackendId> {
        let registry = self
            .0
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("registry is gone"))?;
        if registry.is_shutting_down() {
            anyhow::bail!("registry is shutting down");
        }
        let (info, backend) = registry.construct(&spec.type_id, &spec.settings)?;
        let id = registry.next_nonreal_id.fetch_sub(1, Ordering::SeqCst);
        let instance = BackendInstance::new(
            id,
            info,
            backend,
            spec.title.clone(),
            spec.settings.clone(),
            &registry.cancel,
        );
        instance.max_usages.store(spec.max_usages, Ordering::SeqCst);
        instance
            .can_load_models
            .store(spec.can_load_models, Ordering::SeqCst);
        *instance.parent.lock().unwrap() =
            registry.get(spec.parent).map(|parent| Arc::downgrade(&parent));
        registry
            .instances
            .write()
            .unwrap()
            .insert(id, Arc::clone(&instance));
        info!(id, parent = spec.parent, backend_type = %spec.type_id, "spawned ephemeral backend");
        registry.enqueue_init(&instance);
        Ok(id)
    }

    async fn remove_backend(&self, id: BackendId) -> bool {
        let Some(registry) = self.0.upgrade() else {
            return false;
        };
        registry.delete_by_id(id).await.unwrap_or(false)
    }

    fn update_instance(&self, id: BackendId, max_usages: u32, current_model: Option<String>) {
        let Some(instance) = self.0.upgrade().and_then(|r| r.get(id)) else {
            return;
        };
        instance.max_usages.store(max_usages, Ordering::SeqCst);
        *instance.current_model.lock().unwrap() = current_model;
    }

    fn set_instance_status(&self, id: BackendId, status: BackendStatus) {
        if let Some(instance) = self.0.upgrade().and_then(|r| r.get(id)) {
            instance.status.set(status);
        }
    }

    fn time_since_last_use_ms(&self, id: BackendId) -> Option<u64> {
        let instance = self.0.upgrade().and_then(|r| r.get(id))?;
        if instance.is_in_use() {
            return Some(0);
        }
        // A backend that never served a job counts idle from its init.
        let marker = instance
            .time_last_release_ms
            .load(Ordering::SeqCst)
            .max(instance.init_started_ms.load(Ordering::SeqCst));
        Some(ticks_ms().saturating_sub(marker))
    }

    fn register_scale_hook(&self, key: BackendId, hook: ScaleHook) {
        if let Some(registry) = self.0.upgrade() {
            registry.register_scale_hook(key, hook);
        }
    }

    fn unregister_scale_hook(&self, key: BackendId) {
        if let Some(registry) = self.0.upgrade() {
            registry.unregister_scale_hook(key);
        }
    }
}

//! Auto-scaling backend.
//!
//! A control instance that launches worker backends on demand: the
//! dispatcher calls its scale hook when a job has been waiting with no
//! eligible backend, and cooldown gates keep a burst of queued jobs from
//! stampeding the launcher. The actual worker provisioning (script,
//! cloud API) is behind the [`Launcher`] trait.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mediagrid_core::{BackendId, GenerationInput, GenerationOutput, ticks_ms};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{BackendContext, GenerationBackend, InitOutcome};
use crate::error::{BackendError, BackendResult};
use crate::host::{NonrealSpec, ScaleResult};
use crate::types::{BackendTypeInfo, FieldKind, SettingsField};

pub const AUTOSCALE_TYPE_ID: &str = "auto_scale";

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleSettings {
    /// Ceiling on concurrently launched workers. Zero disables.
    pub max_workers: u32,
    /// Workers launched up-front at init and kept alive thereafter.
    pub min_workers: u32,
    /// Cooldown after a successful launch before the next may start.
    pub min_wait_between_starts_secs: u64,
    /// Longer cooldown after a failed or declined launch.
    pub min_wait_after_failure_secs: u64,
    /// Cooldown between scale-down stops.
    pub min_wait_between_stops_secs: u64,
    /// How long a worker must sit unused before scale-down may take it.
    pub min_idle_time_secs: u64,
    /// Queued jobs required before an active fleet grows. A fleet of
    /// zero always expands for the first job.
    pub min_queued_before_expand: u32,
    /// Script or command the default launcher runs per worker.
    pub launch_script: String,
}

impl Default for AutoScaleSettings {
    fn default() -> Self {
        Self {
            max_workers: 5,
            min_workers: 0,
            min_wait_between_starts_secs: 60,
            min_wait_after_failure_secs: 120,
            min_wait_between_stops_secs: 60,
            min_idle_time_secs: 600,
            min_queued_before_expand: 2,
            launch_script: String::new(),
        }
    }
}

/// A successfully provisioned worker, ready to register as an ephemeral
/// child backend.
#[derive(Debug, Clone)]
pub struct LaunchedWorker {
    pub type_id: String,
    pub title: String,
    pub settings: toml::Table,
    pub can_load_models: bool,
    pub max_usages: u32,
}

/// Provisions and tears down workers. `ordinal` is a per-pool launch
/// counter implementations can use for naming and port assignment.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start one worker. `Ok(None)` means the launcher declined without
    /// it being a fault (e.g. upstream capacity exhausted).
    async fn launch(&self, ordinal: u64) -> anyhow::Result<Option<LaunchedWorker>>;

    async fn stop(&self, ordinal: u64) -> anyhow::Result<()>;

    /// Liveness nudge for a worker the maintenance pass is keeping.
    /// Launchers whose workers expire without traffic override this.
    async fn ping(&self, _ordinal: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Gate {
    not_before_ms: u64,
}

pub struct AutoScalingBackend {
    settings: AutoScaleSettings,
    launcher: Arc<dyn Launcher>,
    /// Local child id -> launch ordinal.
    children: Mutex<HashMap<BackendId, u64>>,
    /// Serializes launches and carries the cooldown deadline.
    gate: tokio::sync::Mutex<Gate>,
    launch_counter: AtomicU64,
    /// Scale-down cooldown deadline.
    next_stop_not_before_ms: AtomicU64,
    maintenance_interval: Duration,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    ctx: Mutex<Option<BackendContext>>,
    self_ref: Mutex<Weak<AutoScalingBackend>>,
}

impl AutoScalingBackend {
    pub fn new(settings: AutoScaleSettings, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        Self::with_maintenance_interval(settings, launcher, MAINTENANCE_INTERVAL)
    }

    fn with_maintenance_interval(
        settings: AutoScaleSettings,
        launcher: Arc<dyn Launcher>,
        maintenance_interval: Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            settings,
            launcher,
            children: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(Gate { not_before_ms: 0 }),
            launch_counter: AtomicU64::new(0),
            next_stop_not_before_ms: AtomicU64::new(0),
            maintenance_interval,
            maintenance: Mutex::new(None),
            ctx: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *this.self_ref.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    pub fn worker_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Scale-hook entry: launch one worker unless a gate says no.
    /// `queued` is the dispatcher's current backlog; an active fleet only
    /// grows once the backlog is deep enough to be worth a new worker.
    pub async fn try_launch_one(&self, queued: u32) -> anyhow::Result<ScaleResult> {
        if self.worker_count() > 0 && queued < self.settings.min_queued_before_expand {
            return Ok(ScaleResult::NoLaunch);
        }
        self.launch_one(false).await
    }

    async fn launch_one(&self, ignore_cooldown: bool) -> anyhow::Result<ScaleResult> {
        let ctx = self
            .ctx
            .lock()
            .unwrap()
            .clone()
            .context("auto-scaler is not initialized")?;
        let mut gate = self.gate.lock().await;
        if self.worker_count() as u32 >= self.settings.max_workers {
            return Ok(ScaleResult::NoLaunch);
        }
        let now = ticks_ms();
        if !ignore_cooldown && now < gate.not_before_ms {
            return Ok(ScaleResult::NoLaunch);
        }
        gate.not_before_ms = now + self.settings.min_wait_between_starts_secs * 1000;
        let ordinal = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        info!(id = %ctx.id, ordinal, "launching scaled worker");
        match self.launcher.launch(ordinal).await {
            Ok(Some(worker)) => {
                let spec = NonrealSpec {
                    type_id: worker.type_id,
                    parent: ctx.id,
                    title: worker.title,
                    settings: worker.settings,
                    can_load_models: worker.can_load_models,
                    max_usages: worker.max_usages,
                };
                let local = ctx
                    .host
                    .spawn_nonreal(spec)
                    .await
                    .context("registering scaled worker")?;
                let was_empty = {
                    let mut children = self.children.lock().unwrap();
                    let was_empty = children.is_empty();
                    children.insert(local, ordinal);
                    was_empty
                };
                info!(id = %ctx.id, ordinal, local, "scaled worker is registered");
                Ok(if was_empty {
                    ScaleResult::FreshLaunch
                } else {
                    ScaleResult::AddedLaunch
                })
            }
            Ok(None) => {
                warn!(id = %ctx.id, ordinal, "launcher declined to start a worker");
                gate.not_before_ms = now + self.settings.min_wait_after_failure_secs * 1000;
                Ok(ScaleResult::NoLaunch)
            }
            Err(err) => {
                warn!(id = %ctx.id, ordinal, %err, "worker launch failed");
                gate.not_before_ms = now + self.settings.min_wait_after_failure_secs * 1000;
                Err(err)
            }
        }
    }

    /// Tear down one worker. Returns whether the id was one of ours.
    pub async fn stop_one(&self, id: BackendId) -> anyhow::Result<bool> {
        let Some(ordinal) = self.children.lock().unwrap().remove(&id) else {
            return Ok(false);
        };
        let ctx = self
            .ctx
            .lock()
            .unwrap()
            .clone()
            .context("auto-scaler is not initialized")?;
        ctx.host.remove_backend(id).await;
        self.launcher.stop(ordinal).await?;
        Ok(true)
    }

    /// One maintenance pass: stop at most one worker that has sat idle
    /// past the threshold (respecting `min_workers` and the stop
    /// cooldown), and ping every worker that stays.
    async fn maintain_workers(&self, ctx: &BackendContext) {
        let workers: Vec<(BackendId, u64)> = self
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|(id, ordinal)| (*id, *ordinal))
            .collect();
        let idle_floor_ms = self.settings.min_idle_time_secs * 1000;
        let mut stopped = false;
        for (id, ordinal) in workers {
            let idle_ms = ctx.host.time_since_last_use_ms(id);
            let can_shrink = !stopped
                && self.worker_count() as u32 > self.settings.min_workers
                && idle_ms.is_some_and(|ms| ms >= idle_floor_ms);
            if can_shrink {
                let now = ticks_ms();
                if now >= self.next_stop_not_before_ms.load(Ordering::SeqCst) {
                    self.next_stop_not_before_ms
                        .store(now + self.settings.min_wait_between_stops_secs * 1000, Ordering::SeqCst);
                    info!(id = %ctx.id, worker = id, ordinal, "scaling down an idle worker");
                    if let Err(err) = self.stop_one(id).await {
                        warn!(id = %ctx.id, worker = id, ordinal, %err, "idle worker stop failed");
                    }
                    stopped = true;
                    continue;
                }
            }
            if let Err(err) = self.launcher.ping(ordinal).await {
                warn!(id = %ctx.id, worker = id, ordinal, %err, "worker ping failed");
            }
        }
    }

    fn start_maintenance(&self, ctx: &BackendContext) {
        let weak = self.self_ref.lock().unwrap().clone();
        let ctx = ctx.clone();
        let interval = self.maintenance_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(this) = weak.upgrade() else { break };
                this.maintain_workers(&ctx).await;
            }
        });
        *self.maintenance.lock().unwrap() = Some(task);
    }
}

#[async_trait]
impl GenerationBackend for AutoScalingBackend {
    async fn init(&self, ctx: BackendContext) -> BackendResult<InitOutcome> {
        *self.ctx.lock().unwrap() = Some(ctx.clone());
        // Control instance: never serves jobs directly.
        ctx.max_usages.store(0, Ordering::SeqCst);
        ctx.can_load_models.store(false, Ordering::SeqCst);

        let s = &self.settings;
        if s.max_workers == 0 || s.launch_script.trim().is_empty() {
            return Ok(InitOutcome::Disabled);
        }
        if s.min_workers > s.max_workers {
            return Err(BackendError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                s.min_workers, s.max_workers
            )));
        }
        if !Path::new(&s.launch_script).exists() {
            return Err(BackendError::Config(format!(
                "launch script not found: {}",
                s.launch_script
            )));
        }

        let weak = self.self_ref.lock().unwrap().clone();
        ctx.host.register_scale_hook(
            ctx.id,
            Arc::new(move |queued| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(this) => this.try_launch_one(queued).await,
                        None => Ok(ScaleResult::NoLaunch),
                    }
                })
            }),
        );

        for _ in 0..s.min_workers {
            if let Err(err) = self.launch_one(true).await {
                warn!(id = %ctx.id, %err, "pre-launch of minimum worker failed");
                break;
            }
        }
        self.start_maintenance(&ctx);
        Ok(InitOutcome::Running)
    }

    async fn shutdown(&self) {
        if let Some(task) = self.maintenance.lock().unwrap().take() {
            task.abort();
        }
        let ctx = self.ctx.lock().unwrap().clone();
        let Some(ctx) = ctx else { return };
        ctx.host.unregister_scale_hook(ctx.id);
        let children: Vec<(BackendId, u64)> =
            self.children.lock().unwrap().drain().collect();
        for (local, ordinal) in children {
            ctx.host.remove_backend(local).await;
            if let Err(err) = self.launcher.stop(ordinal).await {
                warn!(id = %ctx.id, ordinal, %err, "worker stop failed during shutdown");
            }
        }
    }

    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>> {
        input.add_refusal_reason("auto-scaler control instance does not serve jobs");
        Err(BackendError::Unsupported(
            "auto-scaler control instance does not serve jobs".into(),
        ))
    }

    async fn load_model(
        &self,
        _model: &str,
        _hint: Option<&GenerationInput>,
    ) -> BackendResult<bool> {
        Ok(false)
    }

    fn is_valid_for(&self, input: &GenerationInput) -> bool {
        input.add_refusal_reason("auto-scaler control instance does not serve jobs");
        false
    }
}

pub type LauncherFactory =
    Arc<dyn Fn(&AutoScaleSettings) -> anyhow::Result<Arc<dyn Launcher>> + Send + Sync>;

pub fn autoscale_backend_type(factory: LauncherFactory) -> BackendTypeInfo {
    BackendTypeInfo {
        id: AUTOSCALE_TYPE_ID.to_string(),
        name: "Auto Scaler".to_string(),
        description: "Launches worker backends on demand when jobs queue up \
                      with no backend able to take them."
            .to_string(),
        can_load_fast: true,
        is_standard: true,
        settings_schema: vec![
            SettingsField::new("max_workers", FieldKind::Integer, "Worker ceiling."),
            SettingsField::new(
                "min_workers",
                FieldKind::Integer,
                "Workers launched up-front at init and kept alive thereafter.",
            ),
            SettingsField::new(
                "min_queued_before_expand",
                FieldKind::Integer,
                "Queued jobs required before an active fleet grows.",
            ),
            SettingsField::new(
                "min_idle_time_secs",
                FieldKind::Integer,
                "Seconds a worker must sit unused before scale-down may take it.",
            ),
            SettingsField::new(
                "launch_script",
                FieldKind::Text,
                "Script the launcher runs to provision one worker.",
            ),
        ],
        constructor: Arc::new(move |settings| {
            let parsed: AutoScaleSettings = settings.clone().try_into()?;
            let launcher = factory(&parsed)?;
            Ok(AutoScalingBackend::new(parsed, launcher))
        }),
    }
}

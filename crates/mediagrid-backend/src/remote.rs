//! Remote grid proxy backend.
//!
//! One "control" instance connects to a peer MediaGrid server, lists the
//! backends running there, and mirrors each as an ephemeral child
//! instance in the local pool. Children forward jobs to their linked
//! remote backend; the control instance itself never serves jobs.
//!
//! The wire transport is behind the [`RemotePeer`] trait so the pool
//! logic stays testable without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mediagrid_core::{BackendId, BackendStatus, GenerationInput, GenerationOutput};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BackendContext, GenerationBackend, InitOutcome};
use crate::error::{BackendError, BackendResult};
use crate::host::NonrealSpec;
use crate::idle::{IdleMonitor, StatusChangedFn};
use crate::types::{BackendTypeInfo, FieldKind, SettingsField};

pub const REMOTE_TYPE_ID: &str = "remote_grid";

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProxySettings {
    /// Base address of the peer server. Blank disables the backend.
    pub address: String,
    /// Park as idle instead of erroring when the peer is unreachable.
    pub allow_idle: bool,
    /// Mirror the peer's own remote children too. Off avoids proxy
    /// chains fanning out through multiple hops.
    pub allow_forwarding: bool,
    /// Bearer token for the peer, if it requires one. Secret.
    pub authorization: String,
    pub connection_timeout_secs: u64,
    /// Remote backend this child forwards to. Only set on ephemeral
    /// children; the control instance leaves it empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_backend_id: Option<i64>,
}

impl Default for RemoteProxySettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            allow_idle: false,
            allow_forwarding: true,
            authorization: String::new(),
            connection_timeout_secs: 30,
            linked_backend_id: None,
        }
    }
}

/// One backend as reported by the peer server.
#[derive(Debug, Clone)]
pub struct RemoteBackendInfo {
    pub id: i64,
    pub status: BackendStatus,
    pub backend_type: String,
    pub title: String,
    pub features: Vec<String>,
    pub can_load_models: bool,
    pub max_usages: u32,
    pub current_model: Option<String>,
}

/// Transport to one peer server. A session token authenticates calls;
/// implementations return [`BackendError::SessionExpired`] when the peer
/// rejects a stale token, and the proxy re-opens and retries once.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    async fn open_session(&self) -> BackendResult<String>;

    async fn list_backends(&self, session: &str) -> BackendResult<Vec<RemoteBackendInfo>>;

    async fn generate(
        &self,
        session: &str,
        backend: Option<i64>,
        input: &GenerationInput,
    ) -> BackendResult<Vec<GenerationOutput>>;

    /// Ask the peer to load a model on one of its backends.
    async fn select_model(&self, session: &str, backend: i64, model: &str) -> BackendResult<bool>;

    async fn free_memory(&self, session: &str, system_ram: bool) -> BackendResult<bool>;
}

pub type PeerFactory =
    Arc<dyn Fn(&RemoteProxySettings) -> anyhow::Result<Arc<dyn RemotePeer>> + Send + Sync>;

pub struct RemoteProxyBackend {
    settings: RemoteProxySettings,
    peer: Arc<dyn RemotePeer>,
    session: tokio::sync::Mutex<Option<String>>,
    features: Mutex<HashSet<String>>,
    /// Remote backend id -> local child id. Control instance only.
    children: Mutex<HashMap<i64, BackendId>>,
    any_remote_loading: AtomicBool,
    ctx: Mutex<Option<BackendContext>>,
    idler: IdleMonitor,
    idle_interval: Duration,
    self_ref: Mutex<Weak<RemoteProxyBackend>>,
}

impl RemoteProxyBackend {
    pub fn new(settings: RemoteProxySettings, peer: Arc<dyn RemotePeer>) -> Arc<Self> {
        Self::with_idle_interval(settings, peer, IDLE_CHECK_INTERVAL)
    }

    fn with_idle_interval(
        settings: RemoteProxySettings,
        peer: Arc<dyn RemotePeer>,
        idle_interval: Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            settings,
            peer,
            session: tokio::sync::Mutex::new(None),
            features: Mutex::new(HashSet::new()),
            children: Mutex::new(HashMap::new()),
            any_remote_loading: AtomicBool::new(false),
            ctx: Mutex::new(None),
            idler: IdleMonitor::new(),
            idle_interval,
            self_ref: Mutex::new(Weak::new()),
        });
        *this.self_ref.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    /// Control instances manage children; linked children serve jobs.
    fn is_control(&self) -> bool {
        self.settings.linked_backend_id.is_none()
    }

    async fn session(&self) -> BackendResult<String> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref() {
            return Ok(s.clone());
        }
        let timeout = Duration::from_secs(self.settings.connection_timeout_secs.max(1));
        let session = tokio::time::timeout(timeout, self.peer.open_session())
            .await
            .map_err(|_| {
                BackendError::Transient(format!(
                    "no answer from {} within {}s",
                    self.settings.address,
                    timeout.as_secs()
                ))
            })??;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    async fn list_with_retry(&self) -> BackendResult<Vec<RemoteBackendInfo>> {
        let mut retried = false;
        loop {
            let session = self.session().await?;
            match self.peer.list_backends(&session).await {
                Err(BackendError::SessionExpired) if !retried => {
                    retried = true;
                    self.invalidate_session().await;
                }
                other => return other,
            }
        }
    }

    fn child_settings(&self, remote_id: i64) -> BackendResult<toml::Table> {
        let mut child = self.settings.clone();
        child.linked_backend_id = Some(remote_id);
        let value = toml::Value::try_from(&child)
            .map_err(|e| BackendError::Transient(format!("settings encode failed: {e}")))?;
        match value {
            toml::Value::Table(table) => Ok(table),
            _ => Err(BackendError::Transient("settings did not encode as a table".into())),
        }
    }

    /// Re-list the peer's backends and reconcile local children: spawn
    /// for new running remotes, update facts on known ones, remove the
    /// vanished. Also refreshes the merged feature set.
    pub async fn revise_remote_list(&self, ctx: &BackendContext) -> BackendResult<()> {
        let list = self.list_with_retry().await?;
        let control = self.is_control();

        let mut any_loading = false;
        let mut all_features: HashSet<String> = HashSet::new();
        let known: HashMap<i64, BackendId> = self.children.lock().unwrap().clone();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut to_spawn: Vec<RemoteBackendInfo> = Vec::new();

        for info in &list {
            if info.status == BackendStatus::Loading {
                any_loading = true;
            }
            if info.status != BackendStatus::Running {
                continue;
            }
            all_features.extend(info.features.iter().cloned());
            if !control {
                continue;
            }
            if let Some(local) = known.get(&info.id) {
                seen.insert(info.id);
                ctx.host
                    .update_instance(*local, info.max_usages, info.current_model.clone());
            } else if self.settings.allow_forwarding || info.backend_type != REMOTE_TYPE_ID {
                to_spawn.push(info.clone());
            }
        }

        for info in to_spawn {
            let spec = NonrealSpec {
                type_id: REMOTE_TYPE_ID.to_string(),
                parent: ctx.id,
                title: format!("{} (via {})", info.title, ctx.title),
                settings: self.child_settings(info.id)?,
                can_load_models: info.can_load_models,
                max_usages: info.max_usages,
            };
            match ctx.host.spawn_nonreal(spec).await {
                Ok(local) => {
                    info!(id = %ctx.id, remote = info.id, local, "mirrored remote backend");
                    self.children.lock().unwrap().insert(info.id, local);
                }
                Err(err) => {
                    warn!(id = %ctx.id, remote = info.id, %err, "failed to mirror remote backend");
                }
            }
        }

        if control {
            let gone: Vec<(i64, BackendId)> = known
                .iter()
                .filter(|(remote_id, _)| !seen.contains(remote_id))
                .map(|(r, l)| (*r, *l))
                .collect();
            for (remote_id, local) in gone {
                info!(id = %ctx.id, remote = remote_id, local, "remote backend vanished, removing mirror");
                ctx.host.remove_backend(local).await;
                self.children.lock().unwrap().remove(&remote_id);
            }
        }

        self.any_remote_loading
            .store(any_loading, Ordering::SeqCst);
        *self.features.lock().unwrap() = all_features;
        Ok(())
    }

    /// Force an immediate re-list, e.g. after the operator changed the
    /// peer's backends.
    pub async fn trigger_refresh(&self) -> BackendResult<()> {
        let ctx = self.ctx.lock().unwrap().clone();
        match ctx {
            Some(ctx) => self.revise_remote_list(&ctx).await,
            None => Ok(()),
        }
    }

    /// Pull this child's own entry from the peer list and adopt its
    /// facts: feature set, usage capacity, and loaded model.
    async fn refresh_linked_facts(&self, ctx: &BackendContext) -> BackendResult<()> {
        let Some(linked) = self.settings.linked_backend_id else {
            return Ok(());
        };
        let list = self.list_with_retry().await?;
        let Some(info) = list.iter().find(|info| info.id == linked) else {
            return Err(BackendError::Transient(format!(
                "remote backend {linked} is gone from the peer list"
            )));
        };
        *self.features.lock().unwrap() = info.features.iter().cloned().collect();
        ctx.max_usages.store(info.max_usages, Ordering::SeqCst);
        *ctx.current_model.lock().unwrap() = info.current_model.clone();
        Ok(())
    }

    fn start_idler(&self, ctx: &BackendContext) {
        let weak = self.self_ref.lock().unwrap().clone();
        let validate_ctx = ctx.clone();
        // When the control instance flips status, its mirrored children
        // must flip too, or dispatch keeps targeting an unreachable peer.
        let on_change: Option<StatusChangedFn> = if self.is_control() {
            let weak = weak.clone();
            let host_ctx = ctx.clone();
            Some(Arc::new(move |status| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let children: Vec<BackendId> =
                    this.children.lock().unwrap().values().copied().collect();
                for child in children {
                    host_ctx.host.set_instance_status(child, status);
                }
            }))
        } else {
            None
        };
        self.idler.start_with(
            ctx.clone(),
            Arc::new(move || {
                let weak = weak.clone();
                let ctx = validate_ctx.clone();
                Box::pin(async move {
                    let Some(this) = weak.upgrade() else {
                        return Ok(());
                    };
                    this.invalidate_session().await;
                    if this.is_control() {
                        this.revise_remote_list(&ctx).await
                    } else {
                        this.refresh_linked_facts(&ctx).await
                    }
                })
            }),
            on_change,
            self.idle_interval,
        );
    }
}

#[async_trait]
impl GenerationBackend for RemoteProxyBackend {
    async fn init(&self, ctx: BackendContext) -> BackendResult<InitOutcome> {
        *self.ctx.lock().unwrap() = Some(ctx.clone());
        let control = self.is_control();
        if control {
            // The control instance only manages children.
            ctx.max_usages.store(0, Ordering::SeqCst);
            ctx.can_load_models.store(false, Ordering::SeqCst);
        }
        if self.settings.address.trim().is_empty() {
            return Ok(InitOutcome::Disabled);
        }
        (ctx.report)("connecting to remote grid...");
        if let Err(err) = self.session().await {
            if self.settings.allow_idle {
                self.start_idler(&ctx);
                return Ok(InitOutcome::Idle);
            }
            return Err(err);
        }
        if control {
            (ctx.report)("listing remote backends...");
            self.revise_remote_list(&ctx).await?;
            // Let remote-side loads settle so the mirror list is stable.
            while self.any_remote_loading.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                self.revise_remote_list(&ctx).await?;
            }
        } else {
            (ctx.report)("syncing linked remote backend...");
            self.refresh_linked_facts(&ctx).await?;
        }
        if self.settings.allow_idle {
            self.start_idler(&ctx);
        }
        Ok(InitOutcome::Running)
    }

    async fn shutdown(&self) {
        self.idler.stop();
        let ctx = self.ctx.lock().unwrap().clone();
        if let Some(ctx) = ctx {
            let children: Vec<BackendId> =
                self.children.lock().unwrap().drain().map(|(_, l)| l).collect();
            for local in children {
                ctx.host.remove_backend(local).await;
            }
        }
        self.invalidate_session().await;
    }

    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>> {
        let Some(linked) = self.settings.linked_backend_id else {
            input.add_refusal_reason("remote control instance does not serve jobs");
            return Err(BackendError::Unsupported(
                "control instance does not serve jobs".into(),
            ));
        };
        let mut retried = false;
        loop {
            let session = self.session().await?;
            match self.peer.generate(&session, Some(linked), input).await {
                Err(BackendError::SessionExpired) if !retried => {
                    retried = true;
                    self.invalidate_session().await;
                }
                other => return other,
            }
        }
    }

    async fn load_model(
        &self,
        model: &str,
        _hint: Option<&GenerationInput>,
    ) -> BackendResult<bool> {
        let Some(linked) = self.settings.linked_backend_id else {
            return Ok(false);
        };
        let mut retried = false;
        loop {
            let session = self.session().await?;
            match self.peer.select_model(&session, linked, model).await {
                Err(BackendError::SessionExpired) if !retried => {
                    retried = true;
                    self.invalidate_session().await;
                }
                other => return other,
            }
        }
    }

    async fn free_memory(&self, system_ram: bool) -> bool {
        let Ok(session) = self.session().await else {
            return false;
        };
        self.peer
            .free_memory(&session, system_ram)
            .await
            .unwrap_or(false)
    }

    fn supported_features(&self) -> HashSet<String> {
        self.features.lock().unwrap().clone()
    }

    fn is_valid_for(&self, input: &GenerationInput) -> bool {
        if self.is_control() {
            input.add_refusal_reason("remote control instance does not serve jobs");
            return false;
        }
        true
    }
}

pub fn remote_backend_type(factory: PeerFactory) -> BackendTypeInfo {
    BackendTypeInfo {
        id: REMOTE_TYPE_ID.to_string(),
        name: "Remote Grid".to_string(),
        description: "Connects to another MediaGrid server and mirrors its \
                      backends into the local pool."
            .to_string(),
        can_load_fast: true,
        is_standard: true,
        settings_schema: vec![
            SettingsField::new("address", FieldKind::Text, "Base address of the peer server.")
                .placeholder("http://example.local:7801"),
            SettingsField::new(
                "authorization",
                FieldKind::Text,
                "Bearer token for the peer, if required.",
            )
            .secret(),
            SettingsField::new(
                "allow_idle",
                FieldKind::Bool,
                "Park as idle instead of erroring when the peer is unreachable.",
            ),
            SettingsField::new(
                "allow_forwarding",
                FieldKind::Bool,
                "Also mirror the peer's own remote children.",
            ),
        ],
        constructor: Arc::new(move |settings| {
            let parsed: RemoteProxySettings = settings.clone().try_into()?;
            let peer = factory(&parsed)?;
            Ok(RemoteProxyBackend::new(parsed, peer))
        }),
    }
}

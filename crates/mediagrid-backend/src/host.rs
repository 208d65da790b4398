//! Host seam between backends and the registry that owns them.
//!
//! Proxy and auto-scaling backends create ephemeral ("non-real") child
//! instances at runtime. They cannot depend on the registry crate
//! directly, so the registry hands them this trait object instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use mediagrid_core::{BackendId, BackendStatus};

/// Blueprint for an ephemeral child instance.
#[derive(Debug, Clone)]
pub struct NonrealSpec {
    /// Registered backend type to construct.
    pub type_id: String,
    /// Owning real backend; the child is removed when the parent goes.
    pub parent: BackendId,
    pub title: String,
    pub settings: toml::Table,
    pub can_load_models: bool,
    pub max_usages: u32,
}

/// What a scale attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleResult {
    /// A new worker was launched into an empty fleet.
    FreshLaunch,
    /// A new worker was added alongside existing ones.
    AddedLaunch,
    /// Nothing launched (cooldown, at capacity, or disabled).
    NoLaunch,
}

pub type ScaleFuture = Pin<Box<dyn Future<Output = anyhow::Result<ScaleResult>> + Send>>;

/// Called by the dispatcher when demand outstrips the current fleet.
/// The argument is the number of requests currently queued, so scalers
/// can refuse to expand for shallow backlogs.
pub type ScaleHook = Arc<dyn Fn(u32) -> ScaleFuture + Send + Sync>;

/// Registry operations available to running backends.
#[async_trait]
pub trait InstanceHost: Send + Sync {
    /// Create, register, and start init for an ephemeral child. Returns
    /// the new (negative) backend id.
    async fn spawn_nonreal(&self, spec: NonrealSpec) -> anyhow::Result<BackendId>;

    /// Cleanly shut down and remove a backend. Returns whether the id
    /// existed.
    async fn remove_backend(&self, id: BackendId) -> bool;

    /// Push freshly observed facts about a child onto its instance.
    fn update_instance(&self, id: BackendId, max_usages: u32, current_model: Option<String>);

    fn set_instance_status(&self, id: BackendId, status: BackendStatus);

    /// Milliseconds since the backend last finished a job (or since it
    /// started, if it never served one). `Some(0)` while a job is
    /// running, `None` for unknown ids.
    fn time_since_last_use_ms(&self, id: BackendId) -> Option<u64>;

    /// Register a hook the dispatcher may call when no backend can take
    /// a queued job. Keyed by the owning backend's id.
    fn register_scale_hook(&self, key: BackendId, hook: ScaleHook);

    fn unregister_scale_hook(&self, key: BackendId);
}

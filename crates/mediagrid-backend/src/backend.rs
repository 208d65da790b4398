//! The generation backend contract.
//!
//! Every way of producing media (a local worker process, a remote peer,
//! an auto-scaled fleet) implements [`GenerationBackend`]. The registry
//! owns the lifecycle; backends only report what happened.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mediagrid_core::{BackendId, GenerationInput, GenerationOutput, LiveUpdate, StatusCell};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BackendResult;
use crate::host::InstanceHost;

/// How an init call ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Backend is up and may take jobs.
    Running,
    /// Backend declined to start (e.g. blank address). Not an error.
    Disabled,
    /// Backend is configured but currently unreachable and expected to
    /// self-heal; an idle monitor will promote it when it answers.
    Idle,
}

/// Shared cells a backend uses to publish facts about itself.
///
/// The registry instance and the backend hold the same `Arc`s, so a
/// status or capability change made by either side is visible to both
/// without a round-trip.
#[derive(Clone)]
pub struct BackendContext {
    pub id: BackendId,
    /// Display title at init time. Snapshot only; renames do not flow in.
    pub title: String,
    pub status: Arc<StatusCell>,
    /// Model the backend currently has loaded, if any.
    pub current_model: Arc<Mutex<Option<String>>>,
    /// Concurrent jobs this backend accepts. Zero excludes it from
    /// dispatch entirely (control instances set this).
    pub max_usages: Arc<AtomicU32>,
    /// Whether the dispatcher may ask this backend to swap models.
    pub can_load_models: Arc<AtomicBool>,
    /// Handle back into the registry for spawning ephemeral children and
    /// registering scale hooks.
    pub host: Arc<dyn InstanceHost>,
    /// Cancelled when the pool shuts down or this backend is removed.
    pub cancel: CancellationToken,
    /// Appends a line to the instance's human-readable load log.
    pub report: Arc<dyn Fn(&str) + Send + Sync>,
}

impl std::fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendContext")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

/// A single way of generating media.
///
/// Implementations must be internally synchronized: `generate` runs
/// concurrently up to the instance's usage cap, while `load_model` only
/// ever runs with the instance fully drained.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Bring the backend up. Infallible returns classify themselves via
    /// [`InitOutcome`]; errors are classified by [`crate::BackendError`]
    /// so the init scheduler knows whether to retry.
    async fn init(&self, ctx: BackendContext) -> BackendResult<InitOutcome>;

    /// Tear the backend down. Must be safe to call in any state and must
    /// not fail; best-effort cleanup only.
    async fn shutdown(&self);

    /// Run one generation job to completion.
    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>>;

    /// Run one job, streaming progress as it happens. The default wraps
    /// [`generate`](Self::generate) and emits each output once finished.
    async fn generate_live(
        &self,
        input: &GenerationInput,
        _batch_id: &str,
        updates: mpsc::Sender<LiveUpdate>,
    ) -> BackendResult<()> {
        for output in self.generate(input).await? {
            if updates.send(LiveUpdate::Output(output)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Swap the loaded model. `Ok(true)` means the model is now loaded,
    /// `Ok(false)` means the backend declined (wrong format, not found);
    /// only errors count against the backend's health.
    async fn load_model(
        &self,
        model: &str,
        hint: Option<&GenerationInput>,
    ) -> BackendResult<bool>;

    /// Ask the backend to drop cached memory. `system_ram` extends the
    /// request beyond VRAM. Returns whether anything was freed.
    async fn free_memory(&self, _system_ram: bool) -> bool {
        false
    }

    /// Feature tags this backend can serve (e.g. "controlnet", "video").
    fn supported_features(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Cheap pre-check before dispatch considers this backend for a job.
    /// Refusals should record a reason on the input.
    fn is_valid_for(&self, _input: &GenerationInput) -> bool {
        true
    }
}

//! RAII access to a claimed backend slot.

use std::sync::Arc;

use mediagrid_backend::GenerationBackend;
use mediagrid_core::BackendId;
use mediagrid_registry::BackendInstance;
use tokio::sync::Notify;

use crate::session::SessionClaim;

/// Exclusive hold on one usage slot of a backend. The slot was claimed
/// by the dispatcher; dropping this releases it, updates the backend's
/// last-release timestamp, and wakes the dispatch loop.
pub struct BackendAccess {
    instance: Arc<BackendInstance>,
    _session_claim: Option<SessionClaim>,
    loop_signal: Arc<Notify>,
}

impl BackendAccess {
    pub(crate) fn new(
        instance: Arc<BackendInstance>,
        session_claim: Option<SessionClaim>,
        loop_signal: Arc<Notify>,
    ) -> Self {
        Self {
            instance,
            _session_claim: session_claim,
            loop_signal,
        }
    }

    pub fn id(&self) -> BackendId {
        self.instance.id
    }

    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.instance.backend
    }

    pub fn current_model(&self) -> Option<String> {
        self.instance.current_model()
    }
}

impl Drop for BackendAccess {
    fn drop(&mut self) {
        self.instance.release();
        self.loop_signal.notify_one();
    }
}

impl std::fmt::Debug for BackendAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAccess")
            .field("id", &self.instance.id)
            .finish_non_exhaustive()
    }
}

//! Shared helpers for backend unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mediagrid_core::{BackendId, BackendStatus, StatusCell};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendContext;
use crate::host::{InstanceHost, NonrealSpec, ScaleHook};

/// Host that refuses everything. For backends that never touch the host.
pub(crate) struct NullHost;

#[async_trait]
impl InstanceHost for NullHost {
    async fn spawn_nonreal(&self, _spec: NonrealSpec) -> anyhow::Result<BackendId> {
        anyhow::bail!("null host cannot spawn")
    }

    async fn remove_backend(&self, _id: BackendId) -> bool {
        false
    }

    fn update_instance(&self, _id: BackendId, _max_usages: u32, _current_model: Option<String>) {}

    fn set_instance_status(&self, _id: BackendId, _status: BackendStatus) {}

    fn time_since_last_use_ms(&self, _id: BackendId) -> Option<u64> {
        None
    }

    fn register_scale_hook(&self, _key: BackendId, _hook: ScaleHook) {}

    fn unregister_scale_hook(&self, _key: BackendId) {}
}

/// Host that records spawns and removals so tests can assert on them.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub spawned: Mutex<Vec<NonrealSpec>>,
    pub removed: Mutex<Vec<BackendId>>,
    pub updates: Mutex<Vec<(BackendId, u32, Option<String>)>>,
    pub status_updates: Mutex<Vec<(BackendId, BackendStatus)>>,
    pub idle_ms: Mutex<std::collections::HashMap<BackendId, u64>>,
    pub hooks: Mutex<Vec<BackendId>>,
    next_id: Mutex<BackendId>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(-1),
            ..Default::default()
        })
    }
}

#[async_trait]
impl InstanceHost for RecordingHost {
    async fn spawn_nonreal(&self, spec: NonrealSpec) -> anyhow::Result<BackendId> {
        self.spawned.lock().unwrap().push(spec);
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next -= 1;
        Ok(id)
    }

    async fn remove_backend(&self, id: BackendId) -> bool {
        self.removed.lock().unwrap().push(id);
        true
    }

    fn update_instance(&self, id: BackendId, max_usages: u32, current_model: Option<String>) {
        self.updates
            .lock()
            .unwrap()
            .push((id, max_usages, current_model));
    }

    fn set_instance_status(&self, id: BackendId, status: BackendStatus) {
        self.status_updates.lock().unwrap().push((id, status));
    }

    fn time_since_last_use_ms(&self, id: BackendId) -> Option<u64> {
        self.idle_ms.lock().unwrap().get(&id).copied()
    }

    fn register_scale_hook(&self, key: BackendId, _hook: ScaleHook) {
        self.hooks.lock().unwrap().push(key);
    }

    fn unregister_scale_hook(&self, key: BackendId) {
        self.hooks.lock().unwrap().retain(|k| *k != key);
    }
}

pub(crate) fn test_ctx(id: BackendId) -> BackendContext {
    test_ctx_with_host(id, Arc::new(NullHost))
}

pub(crate) fn test_ctx_with_host(id: BackendId, host: Arc<dyn InstanceHost>) -> BackendContext {
    BackendContext {
        id,
        title: format!("test backend {id}"),
        status: Arc::new(StatusCell::default()),
        current_model: Arc::new(Mutex::new(None)),
        max_usages: Arc::new(AtomicU32::new(1)),
        can_load_models: Arc::new(AtomicBool::new(true)),
        host,
        cancel: CancellationToken::new(),
        report: Arc::new(|_| {}),
    }
}

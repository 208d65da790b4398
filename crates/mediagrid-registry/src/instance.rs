//! One live backend in the pool.
//!
//! `BackendInstance` is the registry's bookkeeping wrapper around a
//! [`GenerationBackend`]: status, usage counters, reservations, and the
//! shared cells the backend itself publishes through. Everything here is
//! lock-free or behind short-lived std locks so the dispatch loop can
//! scan the pool cheaply.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mediagrid_backend::GenerationBackend;
use mediagrid_backend::types::BackendTypeInfo;
use mediagrid_core::{BackendId, BackendStatus, StatusCell, ticks_ms};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One line of the human-readable load log shown while a backend loads.
#[derive(Debug, Clone)]
pub struct LoadStatusEntry {
    pub at_ms: u64,
    pub message: String,
}

pub struct BackendInstance {
    pub id: BackendId,
    pub type_info: Arc<BackendTypeInfo>,
    pub backend: Arc<dyn GenerationBackend>,
    pub title: Mutex<String>,
    pub settings: Mutex<toml::Table>,
    pub enabled: AtomicBool,

    // Cells shared with the backend via its context.
    pub status: Arc<StatusCell>,
    pub current_model: Arc<Mutex<Option<String>>>,
    pub max_usages: Arc<AtomicU32>,
    pub can_load_models: Arc<AtomicBool>,

    /// Jobs currently running on this backend.
    pub usages: AtomicU32,
    /// Callers holding this backend out of dispatch (e.g. an exclusive
    /// maintenance pass). Any nonzero value blocks new claims and loads.
    pub reservations: AtomicU32,
    /// A dispatcher intends to load a model; no new jobs may claim.
    pub reserve_model_load: AtomicBool,
    /// The registry intends to shut this backend down; no new jobs.
    pub shutdown_reserve: AtomicBool,
    pub init_attempts: AtomicU32,
    /// When the current init attempt started, for stuck-load tracking.
    pub init_started_ms: AtomicU64,
    /// How many stuck-load escalations have fired for the current init.
    pub stuck_checks: AtomicU32,
    /// Bumped on every edit; an in-flight init aborts if it changed.
    pub mod_count: AtomicU64,
    pub time_last_release_ms: AtomicU64,
    /// Fires whenever a usage is released, waking drain waiters.
    pub released: Notify,
    /// Owning instance for ephemeral children.
    pub parent: Mutex<Option<Weak<BackendInstance>>>,
    /// Load log; `Some` while the backend is starting, `None` once done.
    pub load_status: Mutex<Option<Vec<LoadStatusEntry>>>,
    /// Cancelled when this instance is removed or the pool shuts down.
    pub cancel: CancellationToken,
}

impl BackendInstance {
    pub fn new(
        id: BackendId,
        type_info: Arc<BackendTypeInfo>,
        backend: Arc<dyn GenerationBackend>,
        title: String,
        settings: toml::Table,
        pool_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            type_info,
            backend,
            title: Mutex::new(title),
            settings: Mutex::new(settings),
            enabled: AtomicBool::new(true),
            status: Arc::new(StatusCell::new(BackendStatus::Waiting)),
            current_model: Arc::new(Mutex::new(None)),
            max_usages: Arc::new(AtomicU32::new(1)),
            can_load_models: Arc::new(AtomicBool::new(true)),
            usages: AtomicU32::new(0),
            reservations: AtomicU32::new(0),
            reserve_model_load: AtomicBool::new(false),
            shutdown_reserve: AtomicBool::new(false),
            init_attempts: AtomicU32::new(0),
            init_started_ms: AtomicU64::new(0),
            stuck_checks: AtomicU32::new(0),
            mod_count: AtomicU64::new(0),
            time_last_release_ms: AtomicU64::new(0),
            released: Notify::new(),
            parent: Mutex::new(None),
            load_status: Mutex::new(None),
            cancel: pool_cancel.child_token(),
        })
    }

    /// Real backends come from configuration and persist; non-real ones
    /// are spawned at runtime by proxies and scalers.
    pub fn is_real(&self) -> bool {
        self.id >= 0
    }

    pub fn status(&self) -> BackendStatus {
        self.status.get()
    }

    pub fn title(&self) -> String {
        self.title.lock().unwrap().clone()
    }

    pub fn current_model(&self) -> Option<String> {
        self.current_model.lock().unwrap().clone()
    }

    pub fn is_in_use(&self) -> bool {
        self.usages.load(Ordering::SeqCst) > 0
    }

    /// Whether dispatch may hand this backend a new job right now.
    pub fn can_accept_job(&self) -> bool {
        self.status() == BackendStatus::Running
            && self.enabled.load(Ordering::SeqCst)
            && !self.shutdown_reserve.load(Ordering::SeqCst)
            && !self.reserve_model_load.load(Ordering::SeqCst)
            && self.reservations.load(Ordering::SeqCst) == 0
            && self.max_usages.load(Ordering::SeqCst) > 0
            && self.usages.load(Ordering::SeqCst) < self.max_usages.load(Ordering::SeqCst)
    }

    /// Whether dispatch may target this backend for a model load.
    pub fn can_load_model_now(&self) -> bool {
        self.status() == BackendStatus::Running
            && self.enabled.load(Ordering::SeqCst)
            && !self.shutdown_reserve.load(Ordering::SeqCst)
            && !self.reserve_model_load.load(Ordering::SeqCst)
            && self.reservations.load(Ordering::SeqCst) == 0
            && self.max_usages.load(Ordering::SeqCst) > 0
            && self.can_load_models.load(Ordering::SeqCst)
    }

    /// Atomically claim one usage slot. The caller must pair this with
    /// [`release`](Self::release).
    pub fn try_claim(&self) -> bool {
        if !self.can_accept_job() {
            return false;
        }
        let max = self.max_usages.load(Ordering::SeqCst);
        self.usages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let now = ticks_ms();
        self.usages.fetch_sub(1, Ordering::SeqCst);
        self.time_last_release_ms.store(now, Ordering::SeqCst);
        self.released.notify_waiters();
        let parent = self.parent.lock().unwrap().clone();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.time_last_release_ms.store(now, Ordering::SeqCst);
            parent.released.notify_waiters();
        }
    }

    /// Wait until no job is running here. Polls as a backstop in case a
    /// release fired between the check and the wait registration.
    pub async fn wait_drained(&self) {
        while self.is_in_use() {
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    }

    pub fn begin_load_status(&self) {
        *self.load_status.lock().unwrap() = Some(Vec::new());
    }

    pub fn add_load_status(&self, message: &str) {
        if let Some(entries) = self.load_status.lock().unwrap().as_mut() {
            entries.push(LoadStatusEntry {
                at_ms: ticks_ms(),
                message: message.to_string(),
            });
        }
    }

    pub fn end_load_status(&self) {
        *self.load_status.lock().unwrap() = None;
    }

    pub fn load_status(&self) -> Option<Vec<LoadStatusEntry>> {
        self.load_status.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInstance")
            .field("id", &self.id)
            .field("type", &self.type_info.id)
            .field("status", &self.status())
            .field("usages", &self.usages.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

//! Work queues feeding the init scheduler.
//!
//! Fast-loading backends init concurrently; slow ones (heavy local
//! workers) go through the serialized queue one at a time so they don't
//! fight each other for the machine.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::instance::BackendInstance;
use std::sync::Arc;

#[derive(Default)]
pub struct InitQueue {
    fast: Mutex<VecDeque<Arc<BackendInstance>>>,
    slow: Mutex<VecDeque<Arc<BackendInstance>>>,
    /// Wakes the init scheduler when something is queued.
    pub signal: Notify,
    /// Set while the startup bulk load is in flight; spaces out fast
    /// inits so a big pool doesn't spike the machine all at once.
    pub bulk_loading: AtomicBool,
}

impl InitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fast(&self, instance: Arc<BackendInstance>) {
        self.fast.lock().unwrap().push_back(instance);
        self.signal.notify_one();
    }

    pub fn push_slow(&self, instance: Arc<BackendInstance>) {
        self.slow.lock().unwrap().push_back(instance);
        self.signal.notify_one();
    }

    pub fn drain_fast(&self) -> Vec<Arc<BackendInstance>> {
        self.fast.lock().unwrap().drain(..).collect()
    }

    pub fn pop_slow(&self) -> Option<Arc<BackendInstance>> {
        self.slow.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.fast.lock().unwrap().is_empty() && self.slow.lock().unwrap().is_empty()
    }

    pub fn set_bulk_loading(&self, on: bool) {
        self.bulk_loading.store(on, Ordering::SeqCst);
    }

    pub fn is_bulk_loading(&self) -> bool {
        self.bulk_loading.load(Ordering::SeqCst)
    }
}

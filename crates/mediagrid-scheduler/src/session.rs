//! Lightweight session handles for job-slot pinning.
//!
//! A session represents one caller (a user connection, an API client).
//! During a model load the scheduler pins a claim per waiting session so
//! concurrent queue growth elsewhere cannot starve it out of the slot it
//! is waiting for.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    jobs: Arc<AtomicU32>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            jobs: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Jobs (or pins) currently held against this session.
    pub fn active_jobs(&self) -> u32 {
        self.jobs.load(Ordering::SeqCst)
    }

    pub fn claim(&self) -> SessionClaim {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        SessionClaim {
            jobs: Arc::clone(&self.jobs),
        }
    }
}

/// RAII claim on a session job slot.
#[derive(Debug)]
pub struct SessionClaim {
    jobs: Arc<AtomicU32>,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.jobs.fetch_sub(1, Ordering::SeqCst);
    }
}

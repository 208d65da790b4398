//! Domain types shared by the backend pool, registry, and scheduler.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a backend instance.
///
/// Non-negative IDs are "real" (user-configured, persisted) backends.
/// Negative IDs are ephemeral backends spawned internally by a proxy or
/// auto-scaler; they never persist and never show in the save file.
pub type BackendId = i64;

/// Lifecycle state of a single backend instance.
///
/// Only `Running` backends are eligible for dispatch. `Idle` is a
/// recoverable unavailability (e.g. remote peer unreachable) that is
/// expected to self-heal; it is not a hard failure like `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackendStatus {
    Disabled = 0,
    Errored = 1,
    Waiting = 2,
    Loading = 3,
    Idle = 4,
    Running = 5,
}

impl BackendStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BackendStatus::Disabled,
            1 => BackendStatus::Errored,
            2 => BackendStatus::Waiting,
            3 => BackendStatus::Loading,
            4 => BackendStatus::Idle,
            _ => BackendStatus::Running,
        }
    }
}

/// Lock-free holder for a [`BackendStatus`], readable from any thread.
///
/// Status transitions happen from init tasks, idle monitors, and the
/// dispatch loop concurrently; a plain atomic keeps reads off any lock.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: BackendStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> BackendStatus {
        BackendStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: BackendStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(BackendStatus::Waiting)
    }
}

/// One generation job's input payload.
///
/// The scheduler treats the payload as opaque; it only reads the model
/// hint and feature requirements, and appends to the refusal-reason list
/// when backends decline the job. Encoding/decoding of the actual media
/// parameters is out of scope for this layer.
#[derive(Debug, Default)]
pub struct GenerationInput {
    /// Model the job wants, if any.
    pub model: Option<String>,
    /// Feature tags the serving backend must support.
    pub required_features: Vec<String>,
    /// Free-form job parameters, passed through to the backend.
    pub params: serde_json::Value,
    /// Human-readable reasons backends gave for refusing this job.
    refusal_reasons: Mutex<Vec<String>>,
}

impl GenerationInput {
    pub fn new(model: Option<String>) -> Self {
        Self {
            model,
            ..Default::default()
        }
    }

    /// Record a reason a backend refused this job.
    pub fn add_refusal_reason(&self, reason: impl Into<String>) {
        self.refusal_reasons
            .lock()
            .unwrap()
            .push(reason.into());
    }

    /// Snapshot of all recorded refusal reasons.
    pub fn refusal_reasons(&self) -> Vec<String> {
        self.refusal_reasons.lock().unwrap().clone()
    }
}

/// One finished generation result. The byte payload and its metadata are
/// opaque to the scheduling layer.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub data: Vec<u8>,
    pub metadata: serde_json::Value,
}

/// Streaming update emitted during a live generation.
#[derive(Debug, Clone)]
pub enum LiveUpdate {
    /// Intermediate progress (previews, step counters) as raw JSON.
    Progress(serde_json::Value),
    /// A completed output.
    Output(GenerationOutput),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_round_trips_all_states() {
        let cell = StatusCell::default();
        for status in [
            BackendStatus::Disabled,
            BackendStatus::Errored,
            BackendStatus::Waiting,
            BackendStatus::Loading,
            BackendStatus::Idle,
            BackendStatus::Running,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BackendStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let back: BackendStatus = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(back, BackendStatus::Idle);
    }

    #[test]
    fn refusal_reasons_accumulate() {
        let input = GenerationInput::new(Some("sd-xl".to_string()));
        input.add_refusal_reason("missing feature: controlnet");
        input.add_refusal_reason("control instances cannot generate");
        assert_eq!(input.refusal_reasons().len(), 2);
    }
}

//! Model request pressure.
//!
//! When jobs want a model nobody has loaded, they pool up under one
//! `ModelPressure` per model name. The dispatcher arbitrates globally
//! across all pressures (not first-come-first-served) so one backend
//! swap serves as many waiting jobs as possible.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mediagrid_core::{BackendId, ticks_ms};

use crate::session::SessionHandle;

pub struct ModelPressure {
    pub model: String,
    /// When the first still-waiting request for this model arrived.
    pub time_first_request_ms: u64,
    /// Live requests attached to this pressure.
    pub count: AtomicU32,
    /// A load for this model is committed and in flight.
    pub is_loading: AtomicBool,
    /// Set when arbitration gave up on every capable backend; attached
    /// requests pick this up as a refusal reason on release.
    pub load_failed: AtomicBool,
    pub state: Mutex<PressureState>,
}

#[derive(Default)]
pub struct PressureState {
    /// Sessions waiting on this model, for job-slot pinning during load.
    pub sessions: HashMap<String, SessionHandle>,
    /// Dispatch request ids attached to this pressure.
    pub request_ids: Vec<u64>,
    /// Backends that already failed to load this model.
    pub bad_backends: HashSet<BackendId>,
    pub fail_reasons: Vec<String>,
}

impl ModelPressure {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            time_first_request_ms: ticks_ms(),
            count: AtomicU32::new(0),
            is_loading: AtomicBool::new(false),
            load_failed: AtomicBool::new(false),
            state: Mutex::new(PressureState::default()),
        }
    }

    /// Urgency score: each waiting request is worth ten seconds of age.
    pub fn heuristic(&self, now_ms: u64) -> u64 {
        let age_secs = now_ms.saturating_sub(self.time_first_request_ms) / 1000;
        self.count.load(Ordering::SeqCst) as u64 * 10 + age_secs
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    pub fn record_failure(&self, backend: BackendId, reason: String) {
        let mut state = self.state.lock().unwrap();
        state.bad_backends.insert(backend);
        if !state.fail_reasons.contains(&reason) {
            state.fail_reasons.push(reason);
        }
    }
}

impl std::fmt::Debug for ModelPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPressure")
            .field("model", &self.model)
            .field("count", &self.count.load(Ordering::SeqCst))
            .field("is_loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

/// All live pressures, one per model name.
#[derive(Default)]
pub struct PressureTracker {
    map: Mutex<HashMap<String, Arc<ModelPressure>>>,
}

impl PressureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a request to the model's pressure, creating it on first
    /// demand. Increments the live count.
    pub fn join(
        &self,
        model: &str,
        request_id: u64,
        session: Option<&SessionHandle>,
    ) -> Arc<ModelPressure> {
        let pressure = {
            let mut map = self.map.lock().unwrap();
            let pressure = Arc::clone(
                map.entry(model.to_string())
                    .or_insert_with(|| Arc::new(ModelPressure::new(model))),
            );
            // Counted while still holding the map lock, so a racing final
            // release cannot evict the entry between lookup and attach.
            pressure.count.fetch_add(1, Ordering::SeqCst);
            pressure
        };
        let mut state = pressure.state.lock().unwrap();
        state.request_ids.push(request_id);
        if let Some(session) = session {
            state
                .sessions
                .entry(session.id.clone())
                .or_insert_with(|| session.clone());
        }
        drop(state);
        pressure
    }

    /// Detach a request. The entry disappears when the last attached
    /// request lets go.
    pub fn release(&self, pressure: &Arc<ModelPressure>, request_id: u64) {
        {
            let mut state = pressure.state.lock().unwrap();
            state.request_ids.retain(|id| *id != request_id);
        }
        let mut map = self.map.lock().unwrap();
        let remaining = pressure.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0
            && map
                .get(&pressure.model)
                .is_some_and(|held| Arc::ptr_eq(held, pressure))
        {
            map.remove(&pressure.model);
        }
    }

    pub fn get(&self, model: &str) -> Option<Arc<ModelPressure>> {
        self.map.lock().unwrap().get(model).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ModelPressure>> {
        self.map.lock().unwrap().values().cloned().collect()
    }

    pub fn any_loading(&self) -> bool {
        self.map.lock().unwrap().values().any(|p| p.is_loading())
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_entry_per_model() {
        let tracker = PressureTracker::new();
        let a = tracker.join("sd-xl", 1, None);
        let b = tracker.join("sd-xl", 2, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.count.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn entry_removed_when_last_request_releases() {
        let tracker = PressureTracker::new();
        let pressure = tracker.join("sd-xl", 1, None);
        tracker.join("sd-xl", 2, None);
        tracker.release(&pressure, 1);
        assert!(tracker.get("sd-xl").is_some());
        tracker.release(&pressure, 2);
        assert!(tracker.get("sd-xl").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn heuristic_weighs_count_over_age() {
        let tracker = PressureTracker::new();
        let crowded = tracker.join("crowded", 1, None);
        tracker.join("crowded", 2, None);
        tracker.join("crowded", 3, None);
        let lonely = tracker.join("lonely", 4, None);
        let now = ticks_ms() + 5_000;
        assert!(crowded.heuristic(now) > lonely.heuristic(now));
    }

    #[test]
    fn sessions_are_tracked_once() {
        let tracker = PressureTracker::new();
        let session = SessionHandle::new("user-1");
        let pressure = tracker.join("m", 1, Some(&session));
        tracker.join("m", 2, Some(&session));
        assert_eq!(pressure.state.lock().unwrap().sessions.len(), 1);
    }

    #[test]
    fn rejoined_pressure_is_the_live_map_entry() {
        let tracker = PressureTracker::new();
        let first = tracker.join("m", 1, None);
        tracker.release(&first, 1);
        let second = tracker.join("m", 2, None);
        let held = tracker.get("m").unwrap();
        assert!(Arc::ptr_eq(&second, &held));
        assert_eq!(held.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_join_release_never_strands_demand() {
        let tracker = Arc::new(PressureTracker::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    let request_id = worker * 1_000_000 + i;
                    let pressure = tracker.join("m", request_id, None);
                    tracker.release(&pressure, request_id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Every attach saw a live map entry, and the last detach evicted it.
        assert!(tracker.is_empty());
    }

    #[test]
    fn failures_accumulate_deduped() {
        let tracker = PressureTracker::new();
        let pressure = tracker.join("m", 1, None);
        pressure.record_failure(0, "out of memory".into());
        pressure.record_failure(1, "out of memory".into());
        let state = pressure.state.lock().unwrap();
        assert_eq!(state.bad_backends.len(), 2);
        assert_eq!(state.fail_reasons.len(), 1);
    }
}

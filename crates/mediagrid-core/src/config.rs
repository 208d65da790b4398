//! Backend pool configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tie-break policy when several backends could load a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLoadOrder {
    /// Pick the backend with the oldest last-release time (most idle).
    #[default]
    LastUsed,
    /// Pick the first eligible backend in iteration order.
    FirstFree,
}

/// Tunables for the backend registry and schedulers.
///
/// Loaded from the server configuration; all fields have workable
/// defaults so tests can use `BackendsConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// How many times a backend's init may fail before it is marked
    /// errored permanently.
    pub max_init_attempts: u32,
    /// How long the dispatch loop tolerates zero forward progress with
    /// requests pending before declaring a systemic failure.
    pub max_timeout_minutes: u64,
    /// On systemic timeout: true = force-restart every backend,
    /// false = fail all pending requests with a timeout error.
    pub force_restart_on_timeout: bool,
    /// Tie-break policy for model-load target selection.
    pub model_load_order: ModelLoadOrder,
    /// Treat every backend type as fast-loading (skips the serialized
    /// init queue).
    pub all_backends_load_fast: bool,
    /// How long to batch very-recent requests for the same model before
    /// committing a load, in milliseconds. Purely a thrash-avoidance
    /// window; not a correctness constant.
    pub pressure_batch_window_ms: u64,
    /// Where the backends list persists.
    pub save_path: PathBuf,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: 3,
            max_timeout_minutes: 60,
            force_restart_on_timeout: false,
            model_load_order: ModelLoadOrder::LastUsed,
            all_backends_load_fast: false,
            pressure_batch_window_ms: 1500,
            save_path: PathBuf::from("data/backends.toml"),
        }
    }
}

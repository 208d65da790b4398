//! Aggregate pool status, cached for cheap polling.
//!
//! Operators poll this constantly; the summary is derived from the raw
//! instance statuses and cached for a second so a busy UI never turns
//! status checks into pool-wide lock traffic.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mediagrid_core::BackendStatus;
use mediagrid_registry::BackendRegistry;
use serde::Serialize;

const CACHE_TTL: Duration = Duration::from_secs(1);

/// One-word pool condition, worst-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Empty,
    AllDisabled,
    Errored,
    /// Some backends serve while others are still coming up.
    SomeLoading,
    Running,
    Loading,
    Disabled,
    Idle,
    Unknown,
}

/// Severity tag the UI maps to styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryClass {
    Error,
    Warn,
    Soft,
    Ok,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub status: PoolStatus,
    pub class: SummaryClass,
    pub message: String,
    pub any_loading: bool,
}

pub struct StatusReporter {
    registry: Arc<BackendRegistry>,
    cache: Mutex<Option<(Instant, StatusSummary)>>,
}

impl StatusReporter {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(None),
        }
    }

    pub fn summary(&self) -> StatusSummary {
        let mut cache = self.cache.lock().unwrap();
        if let Some((at, summary)) = cache.as_ref() {
            if at.elapsed() < CACHE_TTL {
                return summary.clone();
            }
        }
        let summary = self.compute();
        *cache = Some((Instant::now(), summary.clone()));
        summary
    }

    /// Recompute immediately, bypassing the cache.
    pub fn refresh(&self) -> StatusSummary {
        let summary = self.compute();
        *self.cache.lock().unwrap() = Some((Instant::now(), summary.clone()));
        summary
    }

    fn compute(&self) -> StatusSummary {
        let statuses: Vec<BackendStatus> =
            self.registry.all().iter().map(|i| i.status()).collect();
        let any = |s: BackendStatus| statuses.iter().any(|v| *v == s);
        let any_loading =
            any(BackendStatus::Loading) || any(BackendStatus::Waiting);

        let (status, class, message) = if statuses.is_empty() {
            (
                PoolStatus::Empty,
                SummaryClass::Empty,
                "No backends are configured.",
            )
        } else if statuses.iter().all(|s| *s == BackendStatus::Disabled) {
            (
                PoolStatus::AllDisabled,
                SummaryClass::Warn,
                "All backends are disabled.",
            )
        } else if any(BackendStatus::Errored) {
            (
                PoolStatus::Errored,
                SummaryClass::Error,
                "At least one backend has errored.",
            )
        } else if any(BackendStatus::Running) && any_loading {
            (
                PoolStatus::SomeLoading,
                SummaryClass::Soft,
                "Some backends are still loading; jobs are being served.",
            )
        } else if any(BackendStatus::Running) {
            (PoolStatus::Running, SummaryClass::Ok, "All systems go.")
        } else if any_loading {
            (
                PoolStatus::Loading,
                SummaryClass::Soft,
                "Backends are loading.",
            )
        } else if any(BackendStatus::Disabled) {
            (
                PoolStatus::Disabled,
                SummaryClass::Warn,
                "Some backends are disabled and none are running.",
            )
        } else if any(BackendStatus::Idle) {
            (
                PoolStatus::Idle,
                SummaryClass::Soft,
                "Backends are idle, waiting on their remote peers.",
            )
        } else {
            (
                PoolStatus::Unknown,
                SummaryClass::Warn,
                "Backend states are unrecognized.",
            )
        };
        StatusSummary {
            status,
            class,
            message: message.to_string(),
            any_loading,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediagrid_backend::BackendTypeRegistry;
    use mediagrid_backend::echo::{EchoBackend, EchoSettings, echo_backend_type};
    use mediagrid_core::BackendsConfig;

    async fn pool_with(statuses: &[BackendStatus]) -> (tempfile::TempDir, Arc<BackendRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut types = BackendTypeRegistry::new();
        types.register(echo_backend_type());
        let config = BackendsConfig {
            save_path: dir.path().join("backends.toml"),
            ..Default::default()
        };
        let registry = BackendRegistry::new(config, types);
        for status in statuses {
            let instance = registry
                .add_preconstructed(
                    "echo",
                    Arc::new(EchoBackend::new(EchoSettings::default())),
                    "t",
                    toml::Table::new(),
                )
                .unwrap();
            instance.status.set(*status);
        }
        (dir, registry)
    }

    #[tokio::test]
    async fn empty_pool_reports_empty() {
        let (_dir, registry) = pool_with(&[]).await;
        let summary = StatusReporter::new(registry).summary();
        assert_eq!(summary.status, PoolStatus::Empty);
        assert_eq!(summary.class, SummaryClass::Empty);
    }

    #[tokio::test]
    async fn errored_beats_running() {
        let (_dir, registry) =
            pool_with(&[BackendStatus::Running, BackendStatus::Errored]).await;
        let summary = StatusReporter::new(registry).summary();
        assert_eq!(summary.status, PoolStatus::Errored);
        assert_eq!(summary.class, SummaryClass::Error);
    }

    #[tokio::test]
    async fn running_with_loading_is_some_loading() {
        let (_dir, registry) =
            pool_with(&[BackendStatus::Running, BackendStatus::Loading]).await;
        let summary = StatusReporter::new(registry).summary();
        assert_eq!(summary.status, PoolStatus::SomeLoading);
        assert!(summary.any_loading);
    }

    #[tokio::test]
    async fn all_disabled_beats_everything_but_empty() {
        let (_dir, registry) =
            pool_with(&[BackendStatus::Disabled, BackendStatus::Disabled]).await;
        let summary = StatusReporter::new(registry).summary();
        assert_eq!(summary.status, PoolStatus::AllDisabled);
    }

    #[tokio::test]
    async fn waiting_counts_as_loading() {
        let (_dir, registry) = pool_with(&[BackendStatus::Waiting]).await;
        let summary = StatusReporter::new(registry).summary();
        assert_eq!(summary.status, PoolStatus::Loading);
        assert!(summary.any_loading);
    }

    #[tokio::test]
    async fn summary_is_cached_for_a_second() {
        let (_dir, registry) = pool_with(&[BackendStatus::Running]).await;
        let reporter = StatusReporter::new(Arc::clone(&registry));
        assert_eq!(reporter.summary().status, PoolStatus::Running);

        registry.get(0).unwrap().status.set(BackendStatus::Errored);
        // Within the TTL the stale answer is served.
        assert_eq!(reporter.summary().status, PoolStatus::Running);
        // An explicit refresh sees the change immediately.
        assert_eq!(reporter.refresh().status, PoolStatus::Errored);
    }

    #[tokio::test]
    async fn summary_serializes_snake_case() {
        let (_dir, registry) = pool_with(&[BackendStatus::Running]).await;
        let summary = StatusReporter::new(registry).summary();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["class"], "ok");
    }
}

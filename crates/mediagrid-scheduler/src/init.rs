//! Backend init scheduling.
//!
//! One background loop drives all backend startup: fast-loading types
//! init concurrently (staggered during the startup bulk load), slow
//! types go one at a time so heavy local workers don't fight for the
//! machine. Failed inits retry with a flat one-second backoff up to the
//! configured attempt cap; configuration errors never retry. The same
//! loop watches for loads that stopped making progress and escalates
//! log noise the longer they sit.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mediagrid_backend::InitOutcome;
use mediagrid_core::{BackendStatus, ticks_ms};
use mediagrid_registry::{BackendInstance, BackendRegistry};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct InitScheduler {
    registry: Arc<BackendRegistry>,
}

impl InitScheduler {
    /// Start the init loop. It runs until the registry's cancel token
    /// fires.
    pub fn spawn(registry: Arc<BackendRegistry>) -> JoinHandle<()> {
        tokio::spawn(Self { registry }.run())
    }

    async fn run(self) {
        let registry = self.registry;
        let cancel = registry.cancel.clone();
        // Running count of fast inits launched during the startup bulk
        // load; the stagger widens as it grows.
        let mut bulk_launches: u64 = 0;
        loop {
            let batch = registry.init_queue.drain_fast();
            if !batch.is_empty() {
                let bulk = registry.init_queue.is_bulk_loading();
                for instance in batch {
                    // During the startup bulk load, space fast inits out
                    // so a big pool doesn't spike all at once.
                    let stagger = if bulk {
                        let delay = bulk_stagger(bulk_launches);
                        bulk_launches += 1;
                        Some(delay)
                    } else {
                        None
                    };
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Some(delay) = stagger {
                            tokio::select! {
                                _ = instance.cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        init_one(registry, instance).await;
                    });
                }
            }

            while let Some(instance) = registry.init_queue.pop_slow() {
                init_one(Arc::clone(&registry), instance).await;
                if cancel.is_cancelled() {
                    return;
                }
            }

            if registry.init_queue.is_empty() {
                registry.init_queue.set_bulk_loading(false);
            }
            scan_stuck_loads(&registry);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = registry.init_queue.signal.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
    }
}

/// Delay before the nth fast init launched during a bulk load: one
/// second, plus one more per ten launches already made, capped at six.
fn bulk_stagger(launch_index: u64) -> Duration {
    Duration::from_secs(1 + (launch_index / 10).min(5))
}

/// Run one init attempt to completion and route the result.
async fn init_one(registry: Arc<BackendRegistry>, instance: Arc<BackendInstance>) {
    if registry.is_shutting_down() || instance.cancel.is_cancelled() {
        return;
    }
    if !instance.enabled.load(Ordering::SeqCst) {
        instance.status.set(BackendStatus::Disabled);
        instance.end_load_status();
        return;
    }
    let mod_count = instance.mod_count.load(Ordering::SeqCst);
    let attempt = instance.init_attempts.fetch_add(1, Ordering::SeqCst) + 1;
    instance.status.set(BackendStatus::Loading);
    instance.init_started_ms.store(ticks_ms(), Ordering::SeqCst);
    instance.add_load_status("init started");
    debug!(id = instance.id, attempt, "initializing backend");

    let ctx = registry.context_for(&instance);
    let result = tokio::select! {
        _ = instance.cancel.cancelled() => None,
        result = instance.backend.init(ctx) => Some(result),
    };

    if instance.mod_count.load(Ordering::SeqCst) != mod_count {
        debug!(id = instance.id, "backend was edited mid-init, discarding this attempt");
        return;
    }

    match result {
        None => {}
        Some(Ok(outcome)) => {
            let status = match outcome {
                InitOutcome::Running => BackendStatus::Running,
                InitOutcome::Disabled => BackendStatus::Disabled,
                InitOutcome::Idle => BackendStatus::Idle,
            };
            instance.status.set(status);
            instance.end_load_status();
            instance.init_attempts.store(0, Ordering::SeqCst);
            instance.stuck_checks.store(0, Ordering::SeqCst);
            info!(id = instance.id, title = %instance.title(), ?outcome, "backend init finished");
        }
        Some(Err(err)) if !err.is_retryable() => {
            error!(id = instance.id, title = %instance.title(), %err,
                   "backend configuration is broken; fix it and reload");
            instance.status.set(BackendStatus::Errored);
            instance.end_load_status();
        }
        Some(Err(err)) if attempt <= registry.config.max_init_attempts => {
            warn!(id = instance.id, attempt, %err, "backend init failed, retrying");
            instance.status.set(BackendStatus::Waiting);
            instance.add_load_status(&format!("init failed (attempt {attempt}): {err}"));
            tokio::time::sleep(Duration::from_secs(1)).await;
            registry.init_queue.push_slow(instance);
        }
        Some(Err(err)) => {
            let mut text = err.to_string();
            if text.contains("refused") {
                text.push_str(" (is the worker process actually up and listening?)");
            }
            error!(id = instance.id, attempt, "backend init failed permanently: {text}");
            instance.status.set(BackendStatus::Errored);
            instance.end_load_status();
        }
    }
}

/// Escalating log noise for loads that stopped advancing. Each instance
/// re-checks on a widening schedule (1, 3, 5... minutes after its load
/// log opened) so a genuinely slow backend doesn't spam.
fn scan_stuck_loads(registry: &Arc<BackendRegistry>) {
    let now = ticks_ms();
    for instance in registry.all() {
        let Some(entries) = instance.load_status() else {
            continue;
        };
        if entries.len() < 2 {
            continue;
        }
        if !matches!(
            instance.status(),
            BackendStatus::Loading | BackendStatus::Waiting
        ) {
            instance.end_load_status();
            instance.stuck_checks.store(0, Ordering::SeqCst);
            continue;
        }
        let first = entries.first().map(|e| e.at_ms).unwrap_or(now);
        let latest = entries.last().map(|e| e.at_ms).unwrap_or(now);
        let index = instance.stuck_checks.load(Ordering::SeqCst) as u64;
        if now < first + (1 + index * 2) * 60_000 {
            continue;
        }
        instance.stuck_checks.fetch_add(1, Ordering::SeqCst);
        let idle_minutes = now.saturating_sub(latest) / 60_000;
        let total_minutes = now.saturating_sub(first) / 60_000;
        if idle_minutes >= 10 {
            error!(id = instance.id, title = %instance.title(), idle_minutes,
                   "backend load has made no progress; it looks stuck");
        } else if idle_minutes >= 5 {
            warn!(id = instance.id, title = %instance.title(), idle_minutes,
                  "backend load has been quiet for a while");
        } else if idle_minutes >= 1 {
            info!(id = instance.id, title = %instance.title(), idle_minutes,
                  "backend load is progressing slowly");
        } else if total_minutes >= 15 {
            info!(id = instance.id, title = %instance.title(), total_minutes,
                  "backend is still loading, but advancing");
        }
    }
}

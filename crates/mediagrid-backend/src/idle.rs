//! Idle monitor for remote-style backends.
//!
//! A backend that cannot reach its peer is parked as `Idle` rather than
//! errored: the monitor revalidates on an interval and flips the status
//! back to `Running` the moment the peer answers again.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediagrid_core::BackendStatus;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::BackendContext;
use crate::error::{BackendError, BackendResult};

/// Probe the peer. `Ok` means reachable and healthy.
pub type ValidateFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send>> + Send + Sync>;

/// Fired with the new status whenever the monitor actually changes it.
/// Proxy controls use this to mirror their status onto child instances.
pub type StatusChangedFn = Arc<dyn Fn(BackendStatus) + Send + Sync>;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct IdleMonitor {
    task: Mutex<Option<JoinHandle<()>>>,
}

fn publish(ctx: &BackendContext, on_change: &Option<StatusChangedFn>, status: BackendStatus) {
    if ctx.status.get() == status {
        return;
    }
    ctx.status.set(status);
    if let Some(hook) = on_change {
        hook(status);
    }
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, ctx: BackendContext, validate: ValidateFn) {
        self.start_with(ctx, validate, None, CHECK_INTERVAL);
    }

    pub fn start_with_interval(
        &self,
        ctx: BackendContext,
        validate: ValidateFn,
        interval: Duration,
    ) {
        self.start_with(ctx, validate, None, interval);
    }

    pub fn start_with(
        &self,
        ctx: BackendContext,
        validate: ValidateFn,
        on_change: Option<StatusChangedFn>,
        interval: Duration,
    ) {
        self.stop();
        // A monitor starting mid-load means the load already failed soft.
        if ctx.status.get() == BackendStatus::Loading {
            publish(&ctx, &on_change, BackendStatus::Idle);
        }
        let task = tokio::spawn(async move {
            let mut seen_errors: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let status = ctx.status.get();
                if status != BackendStatus::Running && status != BackendStatus::Idle {
                    continue;
                }
                match validate().await {
                    Ok(()) => {
                        if ctx.status.get() == BackendStatus::Idle {
                            info!(id = %ctx.id, title = %ctx.title, "idle backend is answering again, resuming");
                            publish(&ctx, &on_change, BackendStatus::Running);
                        }
                    }
                    Err(BackendError::Config(reason)) => {
                        error!(id = %ctx.id, title = %ctx.title, %reason, "idle check hit a configuration error, marking errored");
                        publish(&ctx, &on_change, BackendStatus::Errored);
                        break;
                    }
                    Err(err) => {
                        let msg = err.to_string();
                        if seen_errors.insert(msg.clone()) {
                            debug!(id = %ctx.id, title = %ctx.title, reason = %msg, "backend unreachable, parking as idle");
                        }
                        publish(&ctx, &on_change, BackendStatus::Idle);
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn validate_from_flag(healthy: Arc<AtomicBool>) -> ValidateFn {
        Arc::new(move || {
            let healthy = Arc::clone(&healthy);
            Box::pin(async move {
                if healthy.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(BackendError::Transient("peer down".into()))
                }
            })
        })
    }

    #[tokio::test]
    async fn promotes_idle_backend_when_peer_recovers() {
        let ctx = test_ctx(1);
        ctx.status.set(BackendStatus::Idle);
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = IdleMonitor::new();
        monitor.start_with_interval(
            ctx.clone(),
            validate_from_flag(Arc::clone(&healthy)),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.status.get(), BackendStatus::Idle);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.status.get(), BackendStatus::Running);
        monitor.stop();
    }

    #[tokio::test]
    async fn demotes_running_backend_when_peer_drops() {
        let ctx = test_ctx(2);
        ctx.status.set(BackendStatus::Running);
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = IdleMonitor::new();
        monitor.start_with_interval(
            ctx.clone(),
            validate_from_flag(healthy),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.status.get(), BackendStatus::Idle);
        monitor.stop();
    }

    #[tokio::test]
    async fn config_error_marks_errored_and_stops() {
        let ctx = test_ctx(3);
        ctx.status.set(BackendStatus::Running);
        let monitor = IdleMonitor::new();
        monitor.start_with_interval(
            ctx.clone(),
            Arc::new(|| Box::pin(async { Err(BackendError::Config("bad auth".into())) })),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.status.get(), BackendStatus::Errored);
        monitor.stop();
    }

    #[tokio::test]
    async fn loading_status_is_parked_idle_on_start() {
        let ctx = test_ctx(4);
        ctx.status.set(BackendStatus::Loading);
        let monitor = IdleMonitor::new();
        monitor.start_with_interval(
            ctx.clone(),
            Arc::new(|| Box::pin(async { Ok(()) })),
            Duration::from_secs(60),
        );
        assert_eq!(ctx.status.get(), BackendStatus::Idle);
        monitor.stop();
    }
}

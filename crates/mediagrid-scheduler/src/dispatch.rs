//! The dispatch scheduler.
//!
//! One coordinating loop matches queued generation requests to backend
//! usage slots. Matching prefers least-loaded backends and backends that
//! already hold the requested model; when nobody holds it, requests pool
//! up as model pressure and a global arbitration pass decides which
//! model gets loaded where next. No FIFO guarantee across requests: a
//! later request that matches an already-loaded model is served first on
//! purpose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediagrid_backend::ScaleResult;
use mediagrid_core::{BackendStatus, GenerationInput, ModelLoadOrder, ticks_ms};
use mediagrid_registry::{BackendInstance, BackendRegistry};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::BackendAccess;
use crate::error::{DispatchError, DispatchResult};
use crate::pressure::{ModelPressure, PressureTracker};
use crate::session::{SessionClaim, SessionHandle};

pub type RequestFilter = Arc<dyn Fn(&Arc<BackendInstance>) -> bool + Send + Sync>;

/// Fired once, with the model name, when the scheduler commits to
/// loading a model for this request (so callers can show "loading...").
pub type WillLoadNotifier = Box<dyn FnOnce(&str) + Send>;

pub struct GetBackendArgs {
    pub max_wait: Duration,
    pub input: Arc<GenerationInput>,
    pub session: Option<SessionHandle>,
    pub filter: Option<RequestFilter>,
    pub notify_will_load: Option<WillLoadNotifier>,
    pub cancel: CancellationToken,
}

impl GetBackendArgs {
    pub fn new(max_wait: Duration, model: Option<&str>) -> Self {
        Self {
            max_wait,
            input: Arc::new(GenerationInput::new(model.map(String::from))),
            session: None,
            filter: None,
            notify_will_load: None,
            cancel: CancellationToken::new(),
        }
    }
}

enum RequestOutcome {
    Claimed(BackendAccess),
    Cancelled,
    Failed(DispatchError),
}

struct DispatchRequest {
    id: u64,
    input: Arc<GenerationInput>,
    session: Option<SessionHandle>,
    filter: Option<RequestFilter>,
    notify_will_load: Mutex<Option<WillLoadNotifier>>,
    cancel: CancellationToken,
    pressure: Mutex<Option<Arc<ModelPressure>>>,
    outcome: Mutex<Option<RequestOutcome>>,
    /// The caller stopped listening; late settles must drop their claim.
    abandoned: AtomicBool,
    done: Notify,
    /// This request already asked for a scale-up once.
    scale_tried: AtomicBool,
}

impl DispatchRequest {
    /// Deliver an outcome exactly once. Returns false if the request
    /// already has one or the caller is gone; the outcome (and any claim
    /// inside it) is dropped in that case.
    fn settle(&self, outcome: RequestOutcome) -> bool {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_some() || self.abandoned.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.done.notify_one();
        true
    }
}

pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    pressure: PressureTracker,
    requests: Mutex<HashMap<u64, Arc<DispatchRequest>>>,
    next_request_id: AtomicU64,
    signal: Arc<Notify>,
    /// At most one scale attempt runs at a time, pool-wide.
    scale_attempt: Mutex<Option<JoinHandle<()>>>,
    last_progress_ms: AtomicU64,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(registry: Arc<BackendRegistry>) -> Arc<Self> {
        let cancel = registry.cancel.child_token();
        Arc::new(Self {
            registry,
            pressure: PressureTracker::new(),
            requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            signal: Arc::new(Notify::new()),
            scale_attempt: Mutex::new(None),
            last_progress_ms: AtomicU64::new(ticks_ms()),
            cancel,
        })
    }

    pub fn pressure_tracker(&self) -> &PressureTracker {
        &self.pressure
    }

    /// Start the dispatch loop. Runs until the pool shuts down.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(this.run())
    }

    /// Wait up to `max_wait` for a backend able to take this job.
    /// `Ok(None)` means the request's cancel token fired.
    pub async fn get_next_backend(
        &self,
        args: GetBackendArgs,
    ) -> DispatchResult<Option<BackendAccess>> {
        if self.registry.is_shutting_down() || self.cancel.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        if args.max_wait.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "max_wait must be positive".into(),
            ));
        }
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let request = Arc::new(DispatchRequest {
            id,
            input: args.input,
            session: args.session,
            filter: args.filter,
            notify_will_load: Mutex::new(args.notify_will_load),
            cancel: args.cancel,
            pressure: Mutex::new(None),
            outcome: Mutex::new(None),
            abandoned: AtomicBool::new(false),
            done: Notify::new(),
            scale_tried: AtomicBool::new(false),
        });
        self.requests
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&request));
        self.signal.notify_one();
        debug!(request = id, model = ?request.input.model, "queued dispatch request");

        let deadline = tokio::time::sleep(args.max_wait);
        tokio::pin!(deadline);
        loop {
            if request.outcome.lock().unwrap().is_some() {
                break;
            }
            tokio::select! {
                _ = request.done.notified() => {}
                _ = &mut deadline => break,
            }
        }

        match self.conclude(&request) {
            Some(RequestOutcome::Claimed(access)) => Ok(Some(access)),
            Some(RequestOutcome::Cancelled) => Ok(None),
            Some(RequestOutcome::Failed(err)) => Err(err),
            None => {
                let waited_secs = args.max_wait.as_secs();
                if let Some(model) = request.input.model.as_deref() {
                    let holders = self
                        .registry
                        .all()
                        .iter()
                        .filter(|i| i.current_model().as_deref() == Some(model))
                        .count();
                    warn!(request = id, model, holders, waited_secs,
                          "request timed out waiting for a backend");
                } else {
                    warn!(request = id, waited_secs, "request timed out waiting for a backend");
                }
                Err(DispatchError::Timeout { waited_secs })
            }
        }
    }

    /// Caller-side teardown: detach from the table and release held
    /// pressure. A settle racing past this point drops its claim.
    fn conclude(&self, request: &Arc<DispatchRequest>) -> Option<RequestOutcome> {
        let outcome = {
            let mut slot = request.outcome.lock().unwrap();
            request.abandoned.store(true, Ordering::SeqCst);
            slot.take()
        };
        self.requests.lock().unwrap().remove(&request.id);
        let failed = matches!(outcome, Some(RequestOutcome::Failed(_)) | None);
        let pressure = request.pressure.lock().unwrap().take();
        if let Some(pressure) = pressure {
            if failed && pressure.load_failed.load(Ordering::SeqCst) {
                request
                    .input
                    .add_refusal_reason(format!(
                        "all backends failed to load model \"{}\"",
                        pressure.model
                    ));
            }
            self.pressure.release(&pressure, request.id);
        }
        self.signal.notify_one();
        outcome
    }

    fn mark_progress(&self) {
        self.last_progress_ms.store(ticks_ms(), Ordering::SeqCst);
    }

    // ── The loop ─────────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        info!("dispatch loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_pass().await {
                Ok(()) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.signal.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                Err(err) => {
                    error!(%err, "dispatch pass failed; continuing");
                    let delay = if self.registry.is_shutting_down() { 500 } else { 2000 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        let pending: Vec<_> = self.requests.lock().unwrap().values().cloned().collect();
        for request in pending {
            request.settle(RequestOutcome::Cancelled);
        }
        info!("dispatch loop stopped");
    }

    async fn run_pass(&self) -> anyhow::Result<()> {
        let snapshot: Vec<Arc<DispatchRequest>> =
            self.requests.lock().unwrap().values().cloned().collect();
        if snapshot.is_empty() {
            self.mark_progress();
            return Ok(());
        }
        for request in snapshot {
            if request.outcome.lock().unwrap().is_some() {
                continue;
            }
            if request.cancel.is_cancelled() {
                if request.settle(RequestOutcome::Cancelled) {
                    self.mark_progress();
                }
                continue;
            }
            // A bad request must not take the loop down with it.
            if let Err(err) = self.try_find(&request).await {
                debug!(request = request.id, %err, "request cannot be served");
                if request.settle(RequestOutcome::Failed(err)) {
                    self.mark_progress();
                }
            }
        }
        self.check_watchdog().await;
        Ok(())
    }

    /// One matching attempt for one request. `Ok(())` with no settle
    /// means "keep waiting".
    async fn try_find(&self, request: &Arc<DispatchRequest>) -> DispatchResult<()> {
        // A scale attempt in flight means the pool is about to change;
        // hold all matching until it lands.
        if self.scale_attempt_outstanding() {
            return Ok(());
        }
        let all = self.registry.all();
        let eligible: Vec<_> = all.iter().filter(|i| is_eligible(i)).cloned().collect();

        if eligible.is_empty() {
            let something_coming = all.iter().any(|i| {
                matches!(i.status(), BackendStatus::Loading | BackendStatus::Waiting)
            });
            if !something_coming {
                if !request.scale_tried.swap(true, Ordering::SeqCst) {
                    self.start_scale_attempt(false);
                } else {
                    return Err(DispatchError::NoBackends);
                }
            }
            return Ok(());
        }

        let matching: Vec<_> = eligible
            .iter()
            .filter(|i| matches_request(i, request))
            .cloned()
            .collect();
        if matching.is_empty() {
            if !request.scale_tried.swap(true, Ordering::SeqCst) {
                // Only a genuinely fresh launch can help a job nothing
                // existing matches.
                self.start_scale_attempt(true);
                return Ok(());
            }
            return Err(DispatchError::NoMatch {
                reasons: dedup(request.input.refusal_reasons()),
            });
        }

        let mut available: Vec<_> = matching
            .iter()
            .filter(|i| i.usages.load(Ordering::SeqCst) < i.max_usages.load(Ordering::SeqCst))
            .cloned()
            .collect();
        // Least-loaded first.
        available.sort_by_key(|i| i.usages.load(Ordering::SeqCst));

        let Some(model) = request.input.model.clone() else {
            for instance in &available {
                if self.try_settle_claim(request, instance) {
                    return Ok(());
                }
            }
            return Ok(());
        };

        // Model-affinity fast path: someone already holds it.
        for instance in &available {
            if instance.current_model().as_deref() == Some(model.as_str())
                && self.try_settle_claim(request, instance)
            {
                return Ok(());
            }
        }

        let pressure = {
            let mut slot = request.pressure.lock().unwrap();
            match slot.as_ref() {
                Some(pressure) => Arc::clone(pressure),
                None => {
                    let pressure =
                        self.pressure.join(&model, request.id, request.session.as_ref());
                    *slot = Some(Arc::clone(&pressure));
                    pressure
                }
            }
        };
        self.load_highest_pressure().await;
        if pressure.is_loading() {
            if let Some(notify) = request.notify_will_load.lock().unwrap().take() {
                notify(&model);
            }
        }
        Ok(())
    }

    /// Claim a slot and hand it to the request. Returns true when the
    /// request needs no further matching this pass.
    fn try_settle_claim(
        &self,
        request: &Arc<DispatchRequest>,
        instance: &Arc<BackendInstance>,
    ) -> bool {
        if !instance.try_claim() {
            return false;
        }
        let access = BackendAccess::new(
            Arc::clone(instance),
            request.session.as_ref().map(|s| s.claim()),
            Arc::clone(&self.signal),
        );
        if request.settle(RequestOutcome::Claimed(access)) {
            debug!(request = request.id, backend = instance.id, "matched request to backend");
            self.mark_progress();
        }
        // On a lost settle race the dropped access released the claim.
        true
    }

    // ── Model-load arbitration ───────────────────────────────────────

    /// Decide globally which pending model (if any) gets loaded where.
    async fn load_highest_pressure(&self) {
        let all = self.registry.all();
        let loaders: Vec<_> = all
            .iter()
            .filter(|i| i.can_load_model_now())
            .cloned()
            .collect();
        let pending: Vec<_> = self
            .pressure
            .snapshot()
            .into_iter()
            .filter(|p| !p.is_loading())
            .collect();
        if pending.is_empty() {
            return;
        }
        if loaders.is_empty() {
            // Something mid-load will free a loader; otherwise only a
            // scale-up can help.
            if !self.pressure.any_loading() {
                self.start_scale_attempt(false);
            }
            return;
        }

        let requests = self.requests.lock().unwrap().clone();
        let satisfiable = |r: &Arc<DispatchRequest>| {
            loaders
                .iter()
                .any(|l| r.filter.as_ref().map_or(true, |f| f(l)))
        };
        let mut perfect = Vec::new();
        let mut partial = Vec::new();
        for pressure in pending {
            let ids = pressure.state.lock().unwrap().request_ids.clone();
            let attached: Vec<_> = ids
                .iter()
                .filter_map(|id| requests.get(id))
                .cloned()
                .collect();
            if attached.is_empty() {
                continue;
            }
            let satisfied = attached.iter().filter(|r| satisfiable(r)).count();
            if satisfied == attached.len() {
                perfect.push((pressure, attached));
            } else if satisfied > 0 {
                partial.push((pressure, attached));
            }
        }
        // Pressures every waiter of which can be served beat pressures
        // only some waiters of which can.
        let mut ranked = if perfect.is_empty() { partial } else { perfect };
        if ranked.is_empty() {
            return;
        }
        let now = ticks_ms();
        ranked.sort_by_key(|(p, _)| std::cmp::Reverse(p.heuristic(now)));
        let (pressure, attached) = ranked.remove(0);

        // Commit section: the pressure's state lock keeps two passes
        // from both starting a load.
        let (target, pins) = {
            let mut state = pressure.state.lock().unwrap();
            if pressure.is_loading() {
                return;
            }
            let mut candidates: Vec<_> = loaders
                .iter()
                .filter(|l| {
                    attached
                        .iter()
                        .any(|r| r.filter.as_ref().map_or(true, |f| f(l)))
                })
                .cloned()
                .collect();
            // With several loaders free, sit out the batching window so
            // near-simultaneous requests for different models don't
            // cause a flip-flop of loads.
            let age_ms = now.saturating_sub(pressure.time_first_request_ms);
            if candidates.len() > 1
                && age_ms < self.registry.config.pressure_batch_window_ms
            {
                return;
            }
            candidates.retain(|c| !state.bad_backends.contains(&c.id));
            if candidates.is_empty() {
                pressure.load_failed.store(true, Ordering::SeqCst);
                let mut reasons = dedup(state.fail_reasons.clone());
                if reasons.iter().any(|r| r.contains("unrecognized model format")) {
                    reasons.push(
                        "the model file may be in the wrong models folder for its type"
                            .to_string(),
                    );
                }
                drop(state);
                error!(model = %pressure.model,
                       "no backend can load the model anymore: {}", reasons.join("; "));
                for request in &attached {
                    request.settle(RequestOutcome::Failed(DispatchError::AllLoadersFailed {
                        model: pressure.model.clone(),
                        reasons: reasons.clone(),
                    }));
                }
                self.mark_progress();
                return;
            }
            candidates.retain(|c| c.current_model().as_deref() != Some(pressure.model.as_str()));
            if candidates.is_empty() {
                // Every capable backend already holds it; the affinity
                // path will pick one up as slots free.
                return;
            }
            let unused: Vec<_> = candidates.iter().filter(|c| !c.is_in_use()).cloned().collect();
            let pool = if unused.is_empty() { candidates } else { unused };
            let target = match self.registry.config.model_load_order {
                ModelLoadOrder::LastUsed => pool
                    .iter()
                    .min_by_key(|c| c.time_last_release_ms.load(Ordering::SeqCst))
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&pool[0])),
                ModelLoadOrder::FirstFree => Arc::clone(&pool[0]),
            };
            pressure.is_loading.store(true, Ordering::SeqCst);
            // Pin a job slot per waiting session for the load's duration
            // so queue growth elsewhere can't starve them.
            let pins: Vec<SessionClaim> =
                state.sessions.values().map(|s| s.claim()).collect();
            (target, pins)
        };

        let input_hint = attached.first().map(|r| Arc::clone(&r.input));
        self.spawn_load_task(target, Arc::clone(&pressure), input_hint, pins);
    }

    fn spawn_load_task(
        &self,
        target: Arc<BackendInstance>,
        pressure: Arc<ModelPressure>,
        input_hint: Option<Arc<GenerationInput>>,
        pins: Vec<SessionClaim>,
    ) {
        let signal = Arc::clone(&self.signal);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            info!(backend = target.id, model = %pressure.model, "loading model");
            target.reserve_model_load.store(true, Ordering::SeqCst);
            let mut ticks = 0u32;
            let mut aborted = false;
            while target.is_in_use() {
                if cancel.is_cancelled() {
                    aborted = true;
                    break;
                }
                ticks += 1;
                if ticks % 5 == 0 {
                    info!(backend = target.id,
                          usages = target.usages.load(Ordering::SeqCst),
                          "waiting for backend to drain before model load");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if !aborted {
                // Give the backend a chance to make room first.
                target.backend.free_memory(false).await;
                match target
                    .backend
                    .load_model(&pressure.model, input_hint.as_deref())
                    .await
                {
                    Ok(true) => {
                        *target.current_model.lock().unwrap() = Some(pressure.model.clone());
                        info!(backend = target.id, model = %pressure.model, "model loaded");
                    }
                    Ok(false) => {
                        pressure.record_failure(
                            target.id,
                            format!(
                                "backend {} declined to load \"{}\"",
                                target.id, pressure.model
                            ),
                        );
                    }
                    Err(err) => {
                        pressure.record_failure(
                            target.id,
                            format!("backend {} failed to load: {err}", target.id),
                        );
                    }
                }
            }
            target.reserve_model_load.store(false, Ordering::SeqCst);
            if target.current_model().as_deref() != Some(pressure.model.as_str()) {
                warn!(backend = target.id, model = %pressure.model,
                      "backend does not hold the model it was asked to load");
                pressure
                    .state
                    .lock()
                    .unwrap()
                    .bad_backends
                    .insert(target.id);
            }
            pressure.is_loading.store(false, Ordering::SeqCst);
            drop(pins);
            signal.notify_one();
        });
    }

    // ── Scaling ──────────────────────────────────────────────────────

    fn scale_attempt_outstanding(&self) -> bool {
        self.scale_attempt
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn start_scale_attempt(&self, require_fresh: bool) {
        let mut slot = self.scale_attempt.lock().unwrap();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let hooks = self.registry.scale_hooks();
        if hooks.is_empty() {
            return;
        }
        let queued = self.requests.lock().unwrap().len() as u32;
        info!(require_fresh, queued, "asking scale hooks for a new backend");
        let signal = Arc::clone(&self.signal);
        *slot = Some(tokio::spawn(async move {
            for hook in hooks {
                match hook(queued).await {
                    Ok(ScaleResult::FreshLaunch) => {
                        info!("scale hook launched a fresh backend");
                        break;
                    }
                    Ok(ScaleResult::AddedLaunch) if !require_fresh => {
                        info!("scale hook added a backend");
                        break;
                    }
                    Ok(ScaleResult::AddedLaunch) | Ok(ScaleResult::NoLaunch) => {}
                    Err(err) => warn!(%err, "scale hook failed"),
                }
            }
            signal.notify_one();
        }));
    }

    // ── Stall watchdog ───────────────────────────────────────────────

    /// Last-resort recovery when requests sit with zero completions for
    /// the configured stall limit.
    async fn check_watchdog(&self) {
        if self.requests.lock().unwrap().is_empty() {
            return;
        }
        let stall_ms = self.registry.config.max_timeout_minutes * 60_000;
        let now = ticks_ms();
        if now.saturating_sub(self.last_progress_ms.load(Ordering::SeqCst)) < stall_ms {
            return;
        }
        self.mark_progress();
        let minutes = self.registry.config.max_timeout_minutes;
        if self.registry.config.force_restart_on_timeout {
            warn!(minutes, "no dispatch progress; force-restarting every backend");
            for instance in self.registry.all() {
                instance.backend.shutdown().await;
                *instance.current_model.lock().unwrap() = None;
                self.registry.requeue_init(&instance);
            }
        } else {
            error!(minutes, "no dispatch progress; failing all pending requests");
            let pending: Vec<_> = self.requests.lock().unwrap().values().cloned().collect();
            for request in pending {
                request.settle(RequestOutcome::Failed(DispatchError::Timeout {
                    waited_secs: minutes * 60,
                }));
            }
        }
    }
}

fn is_eligible(instance: &Arc<BackendInstance>) -> bool {
    instance.status() == BackendStatus::Running
        && instance.enabled.load(Ordering::SeqCst)
        && !instance.shutdown_reserve.load(Ordering::SeqCst)
        && !instance.reserve_model_load.load(Ordering::SeqCst)
        && instance.reservations.load(Ordering::SeqCst) == 0
        && instance.max_usages.load(Ordering::SeqCst) > 0
}

fn matches_request(instance: &Arc<BackendInstance>, request: &DispatchRequest) -> bool {
    if let Some(filter) = &request.filter {
        if !filter(instance) {
            return false;
        }
    }
    let input = &request.input;
    if !input.required_features.is_empty() {
        let supported = instance.backend.supported_features();
        if let Some(missing) = input
            .required_features
            .iter()
            .find(|f| !supported.contains(*f))
        {
            input.add_refusal_reason(format!(
                "backend {} lacks required feature \"{missing}\"",
                instance.id
            ));
            return false;
        }
    }
    instance.backend.is_valid_for(input)
}

fn dedup(reasons: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    reasons
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitScheduler;
    use mediagrid_backend::GenerationBackend;
    use mediagrid_backend::echo::{EchoBackend, EchoSettings, LoadBehavior, echo_backend_type};
    use mediagrid_backend::types::BackendTypeRegistry;
    use mediagrid_core::BackendsConfig;

    struct TestPool {
        _dir: tempfile::TempDir,
        registry: Arc<BackendRegistry>,
        dispatcher: Arc<Dispatcher>,
    }

    fn test_types() -> BackendTypeRegistry {
        let mut types = BackendTypeRegistry::new();
        types.register(echo_backend_type());
        types
    }

    fn trace() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env(),
            )
            .with_test_writer()
            .try_init();
    }

    /// Full stack: registry, init scheduler, dispatch loop.
    fn pool_with(mutate: impl FnOnce(&mut BackendsConfig)) -> TestPool {
        trace();
        let dir = tempfile::tempdir().unwrap();
        let mut config = BackendsConfig {
            save_path: dir.path().join("backends.toml"),
            ..Default::default()
        };
        mutate(&mut config);
        let registry = BackendRegistry::new(config, test_types());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        InitScheduler::spawn(Arc::clone(&registry));
        dispatcher.spawn();
        TestPool {
            _dir: dir,
            registry,
            dispatcher,
        }
    }

    fn pool() -> TestPool {
        pool_with(|_| {})
    }

    async fn add_running(
        pool: &TestPool,
        settings: EchoSettings,
    ) -> (Arc<BackendInstance>, Arc<EchoBackend>) {
        let backend = Arc::new(EchoBackend::new(settings));
        let instance = pool
            .registry
            .add_preconstructed(
                "echo",
                Arc::clone(&backend) as Arc<dyn GenerationBackend>,
                "worker",
                toml::Table::new(),
            )
            .unwrap();
        wait_for_status(&instance, BackendStatus::Running, Duration::from_secs(3)).await;
        (instance, backend)
    }

    async fn wait_for_status(
        instance: &Arc<BackendInstance>,
        wanted: BackendStatus,
        within: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if instance.status() == wanted {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "backend {} stuck at {:?}, wanted {:?}",
                instance.id,
                instance.status(),
                wanted
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn released_slot_goes_to_the_next_waiter() {
        let pool = pool();
        add_running(&pool, EchoSettings::default()).await;

        let first = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(5), None))
            .await
            .unwrap()
            .unwrap();
        let second = {
            let dispatcher = Arc::clone(&pool.dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .get_next_backend(GetBackendArgs::new(Duration::from_secs(5), None))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!second.is_finished(), "slot was double-claimed");

        drop(first);
        let access = tokio::time::timeout(Duration::from_secs(3), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(access.id(), 0);
    }

    #[tokio::test]
    async fn missing_model_is_loaded_exactly_once() {
        let pool = pool_with(|c| c.pressure_batch_window_ms = 50);
        let (_a, backend_a) = add_running(&pool, EchoSettings::default()).await;
        let (_b, backend_b) = add_running(&pool, EchoSettings::default()).await;

        let access = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(10), Some("sd-xl")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.current_model().as_deref(), Some("sd-xl"));
        let loads = backend_a.probe().0.load(Ordering::SeqCst)
            + backend_b.probe().0.load(Ordering::SeqCst);
        assert_eq!(loads, 1);

        // The pressure entry is gone once the request concluded.
        assert!(pool.dispatcher.pressure_tracker().is_empty());
    }

    #[tokio::test]
    async fn backend_already_holding_the_model_wins() {
        let pool = pool();
        let (a, backend_a) = add_running(&pool, EchoSettings::default()).await;
        let (_b, backend_b) = add_running(&pool, EchoSettings::default()).await;
        *a.current_model.lock().unwrap() = Some("sd-xl".to_string());

        let access = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(5), Some("sd-xl")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.id(), a.id);
        assert_eq!(backend_a.probe().0.load(Ordering::SeqCst), 0);
        assert_eq!(backend_b.probe().0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_loader_surfaces_the_reasons() {
        let pool = pool();
        add_running(
            &pool,
            EchoSettings {
                load_behavior: LoadBehavior::Fail,
                ..Default::default()
            },
        )
        .await;

        let args = GetBackendArgs::new(Duration::from_secs(10), Some("sd-xl"));
        let input = Arc::clone(&args.input);
        let err = pool.dispatcher.get_next_backend(args).await.unwrap_err();
        match err {
            DispatchError::AllLoadersFailed { model, reasons } => {
                assert_eq!(model, "sd-xl");
                assert!(reasons.iter().any(|r| r.contains("scripted load failure")));
            }
            other => panic!("expected AllLoadersFailed, got {other:?}"),
        }
        assert!(
            input
                .refusal_reasons()
                .iter()
                .any(|r| r.contains("failed to load model"))
        );
    }

    #[tokio::test]
    async fn second_loader_takes_over_after_a_failure() {
        let pool = pool_with(|c| c.pressure_batch_window_ms = 0);
        let (a, backend_a) = add_running(
            &pool,
            EchoSettings {
                load_behavior: LoadBehavior::Fail,
                ..Default::default()
            },
        )
        .await;
        let (b, backend_b) = add_running(&pool, EchoSettings::default()).await;

        let access = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(10), Some("sd-xl")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.id(), b.id);
        assert_eq!(access.current_model().as_deref(), Some("sd-xl"));
        assert_eq!(backend_a.probe().0.load(Ordering::SeqCst), 1);
        assert_eq!(backend_b.probe().0.load(Ordering::SeqCst), 1);
        assert!(a.current_model().is_none());
    }

    #[tokio::test]
    async fn empty_pool_fails_fast() {
        let pool = pool();
        let err = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(10), None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoBackends));
    }

    #[tokio::test]
    async fn reserved_backend_is_not_dispatched() {
        let pool = pool();
        let (instance, _backend) = add_running(&pool, EchoSettings::default()).await;
        instance.reservations.fetch_add(1, Ordering::SeqCst);

        let err = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(10), None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoBackends));

        instance.reservations.fetch_sub(1, Ordering::SeqCst);
        let access = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(5), None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.id(), instance.id);
    }

    #[tokio::test]
    async fn zero_wait_is_rejected() {
        let pool = pool();
        add_running(&pool, EchoSettings::default()).await;
        let err = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::ZERO, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unmatchable_filter_is_rejected() {
        let pool = pool();
        add_running(&pool, EchoSettings::default()).await;
        let mut args = GetBackendArgs::new(Duration::from_secs(10), None);
        args.filter = Some(Arc::new(|_| false));
        let err = pool.dispatcher.get_next_backend(args).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn missing_feature_is_reported() {
        let pool = pool();
        add_running(&pool, EchoSettings::default()).await;
        let mut args = GetBackendArgs::new(Duration::from_secs(10), None);
        let mut input = GenerationInput::default();
        input.required_features = vec!["video".to_string()];
        args.input = Arc::new(input);
        let err = pool.dispatcher.get_next_backend(args).await.unwrap_err();
        match err {
            DispatchError::NoMatch { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("lacks required feature")));
            }
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_resolves_to_none() {
        let pool = pool();
        add_running(&pool, EchoSettings::default()).await;
        let held = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(5), None))
            .await
            .unwrap()
            .unwrap();

        let args = GetBackendArgs::new(Duration::from_secs(10), None);
        let cancel = args.cancel.clone();
        let waiter = {
            let dispatcher = Arc::clone(&pool.dispatcher);
            tokio::spawn(async move { dispatcher.get_next_backend(args).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
        drop(held);
    }

    #[tokio::test]
    async fn waiter_times_out_while_a_backend_still_loads() {
        let pool = pool();
        let backend = Arc::new(EchoBackend::new(EchoSettings {
            init_delay_ms: 60_000,
            ..Default::default()
        }));
        pool.registry
            .add_preconstructed("echo", backend, "glacial", toml::Table::new())
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(1), None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn scale_hook_supplies_a_backend() {
        let pool = pool();
        let registry = Arc::clone(&pool.registry);
        pool.registry.register_scale_hook(
            999,
            Arc::new(move |_queued| {
                let registry = Arc::clone(&registry);
                Box::pin(async move {
                    registry.add_preconstructed(
                        "echo",
                        Arc::new(EchoBackend::new(EchoSettings::default())),
                        "scaled",
                        toml::Table::new(),
                    )?;
                    Ok(ScaleResult::FreshLaunch)
                })
            }),
        );
        let access = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(10), None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.instance().title(), "scaled");
    }

    #[tokio::test]
    async fn stalled_pool_fails_pending_requests() {
        let pool = pool_with(|c| c.max_timeout_minutes = 0);
        let backend = Arc::new(EchoBackend::new(EchoSettings {
            init_delay_ms: 600_000,
            ..Default::default()
        }));
        pool.registry
            .add_preconstructed("echo", backend, "glacial", toml::Table::new())
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = pool
            .dispatcher
            .get_next_backend(GetBackendArgs::new(Duration::from_secs(30), None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stalled_pool_can_force_restart_backends() {
        let pool = pool_with(|c| {
            c.max_timeout_minutes = 0;
            c.force_restart_on_timeout = true;
        });
        let (instance, _backend) = add_running(
            &pool,
            EchoSettings {
                init_delay_ms: 200,
                can_load_models: false,
                ..Default::default()
            },
        )
        .await;

        // Nothing can load the model, so the request pends until the
        // watchdog kicks in.
        let waiter = {
            let dispatcher = Arc::clone(&pool.dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .get_next_backend(GetBackendArgs::new(Duration::from_secs(4), Some("sd-xl")))
                    .await
            })
        };
        let mut saw_restart = false;
        for _ in 0..300 {
            if instance.status() != BackendStatus::Running {
                saw_restart = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_restart, "backend was never put back through init");

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        wait_for_status(&instance, BackendStatus::Running, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn will_load_notifier_fires_with_the_model() {
        let pool = pool_with(|c| c.pressure_batch_window_ms = 0);
        add_running(
            &pool,
            EchoSettings {
                load_delay_ms: 300,
                ..Default::default()
            },
        )
        .await;

        let notified = Arc::new(Mutex::new(None::<String>));
        let mut args = GetBackendArgs::new(Duration::from_secs(10), Some("sd-xl"));
        args.notify_will_load = Some(Box::new({
            let notified = Arc::clone(&notified);
            move |model: &str| {
                *notified.lock().unwrap() = Some(model.to_string());
            }
        }));
        let access = pool
            .dispatcher
            .get_next_backend(args)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.current_model().as_deref(), Some("sd-xl"));
        assert_eq!(notified.lock().unwrap().as_deref(), Some("sd-xl"));
    }

    #[tokio::test]
    async fn sessions_pin_slots_during_loads() {
        let pool = pool_with(|c| c.pressure_batch_window_ms = 0);
        add_running(
            &pool,
            EchoSettings {
                load_delay_ms: 400,
                ..Default::default()
            },
        )
        .await;

        let session = SessionHandle::new("user-1");
        let mut args = GetBackendArgs::new(Duration::from_secs(10), Some("sd-xl"));
        args.session = Some(session.clone());
        let waiter = {
            let dispatcher = Arc::clone(&pool.dispatcher);
            tokio::spawn(async move { dispatcher.get_next_backend(args).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session.active_jobs() >= 1, "session not pinned during load");

        let access = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(session.active_jobs(), 1);
        drop(access);
        assert_eq!(session.active_jobs(), 0);
    }
}

//! Self-start backend: spawns and supervises a local worker process.
//!
//! The backend owns the worker's lifecycle (spawn, readiness wait, kill)
//! while the actual process handling and worker API live behind the
//! [`ProcessRunner`] / [`RunningProcess`] traits.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediagrid_core::{GenerationInput, GenerationOutput};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BackendContext, GenerationBackend, InitOutcome};
use crate::error::{BackendError, BackendResult};
use crate::types::{BackendTypeInfo, FieldKind, SettingsField};

pub const SELFSTART_TYPE_ID: &str = "self_start";

const ALLOWED_SCRIPT_EXTENSIONS: &[&str] = &["sh", "bat", "py"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfStartSettings {
    /// Script that starts the worker process.
    pub start_script: String,
    /// How long to wait for the worker to answer before giving up.
    pub ready_timeout_secs: u64,
    /// Interval between readiness polls.
    pub ready_poll_ms: u64,
    pub features: Vec<String>,
    pub max_usages: u32,
}

impl Default for SelfStartSettings {
    fn default() -> Self {
        Self {
            start_script: String::new(),
            ready_timeout_secs: 60,
            ready_poll_ms: 1000,
            features: Vec::new(),
            max_usages: 1,
        }
    }
}

/// A live worker process plus its job API.
#[async_trait]
pub trait RunningProcess: Send + Sync {
    /// Whether the worker answers on its endpoint yet.
    async fn is_ready(&self) -> bool;

    async fn kill(&self);

    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>>;

    async fn load_model(&self, model: &str) -> BackendResult<bool>;

    async fn free_memory(&self, system_ram: bool) -> bool;
}

/// Spawns worker processes from a start script.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, script: &Path) -> anyhow::Result<Arc<dyn RunningProcess>>;
}

/// Sanity-check a start script path before handing it to a shell.
fn validate_script_path(script: &str) -> Result<(), String> {
    let trimmed = script.trim();
    if trimmed.is_empty() {
        return Err("start script is not set".into());
    }
    if trimmed.contains('"') || trimmed.contains('\n') {
        return Err("start script path contains forbidden characters".into());
    }
    let path = Path::new(trimmed);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !ALLOWED_SCRIPT_EXTENSIONS.contains(&ext.as_str()) {
        return Err(format!(
            "start script must be one of {ALLOWED_SCRIPT_EXTENSIONS:?}, got \".{ext}\""
        ));
    }
    if !path.exists() {
        return Err(format!("start script not found: {trimmed}"));
    }
    Ok(())
}

pub struct SelfStartBackend {
    settings: SelfStartSettings,
    runner: Arc<dyn ProcessRunner>,
    process: Mutex<Option<Arc<dyn RunningProcess>>>,
}

impl SelfStartBackend {
    pub fn new(settings: SelfStartSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            settings,
            runner,
            process: Mutex::new(None),
        }
    }

    fn process(&self) -> BackendResult<Arc<dyn RunningProcess>> {
        self.process
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Transient("worker process is not running".into()))
    }
}

#[async_trait]
impl GenerationBackend for SelfStartBackend {
    async fn init(&self, ctx: BackendContext) -> BackendResult<InitOutcome> {
        validate_script_path(&self.settings.start_script).map_err(BackendError::Config)?;
        ctx.max_usages
            .store(self.settings.max_usages, std::sync::atomic::Ordering::SeqCst);

        (ctx.report)("starting worker process...");
        let process = self
            .runner
            .spawn(Path::new(self.settings.start_script.trim()))
            .await
            .map_err(|e| BackendError::Infra(format!("failed to start worker: {e:#}")))?;

        let poll = Duration::from_millis(self.settings.ready_poll_ms.max(10));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.settings.ready_timeout_secs);
        let mut polls: u32 = 0;
        loop {
            if process.is_ready().await {
                break;
            }
            polls += 1;
            if polls % 5 == 0 {
                (ctx.report)("waiting for worker to answer...");
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(id = %ctx.id, title = %ctx.title, "worker never became ready, killing it");
                process.kill().await;
                return Err(BackendError::Transient(format!(
                    "worker did not answer within {}s",
                    self.settings.ready_timeout_secs
                )));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    process.kill().await;
                    return Err(BackendError::Transient("init cancelled".into()));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!(id = %ctx.id, title = %ctx.title, "worker process is up");
        *self.process.lock().unwrap() = Some(process);
        Ok(InitOutcome::Running)
    }

    async fn shutdown(&self) {
        let process = self.process.lock().unwrap().take();
        if let Some(process) = process {
            process.kill().await;
        }
    }

    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>> {
        self.process()?.generate(input).await
    }

    async fn load_model(
        &self,
        model: &str,
        _hint: Option<&GenerationInput>,
    ) -> BackendResult<bool> {
        self.process()?.load_model(model).await
    }

    async fn free_memory(&self, system_ram: bool) -> bool {
        match self.process() {
            Ok(process) => process.free_memory(system_ram).await,
            Err(_) => false,
        }
    }

    fn supported_features(&self) -> HashSet<String> {
        self.settings.features.iter().cloned().collect()
    }
}

pub type RunnerFactory =
    Arc<dyn Fn(&SelfStartSettings) -> anyhow::Result<Arc<dyn ProcessRunner>> + Send + Sync>;

pub fn selfstart_backend_type(factory: RunnerFactory) -> BackendTypeInfo {
    BackendTypeInfo {
        id: SELFSTART_TYPE_ID.to_string(),
        name: "Self-Start Worker".to_string(),
        description: "Spawns a local worker process from a script and proxies \
                      jobs to it."
            .to_string(),
        can_load_fast: false,
        is_standard: true,
        settings_schema: vec![
            SettingsField::new(
                "start_script",
                FieldKind::Text,
                "Script that starts the worker (.sh, .bat, or .py).",
            ),
            SettingsField::new(
                "ready_timeout_secs",
                FieldKind::Integer,
                "Seconds to wait for the worker to answer.",
            ),
            SettingsField::new(
                "features",
                FieldKind::List,
                "Feature tags the worker supports.",
            ),
        ],
        constructor: Arc::new(move |settings| {
            let parsed: SelfStartSettings = settings.clone().try_into()?;
            let runner = factory(&parsed)?;
            Ok(Arc::new(SelfStartBackend::new(parsed, runner)))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeProcess {
        ready_after_polls: u32,
        polls: AtomicU32,
        killed: AtomicBool,
    }

    #[async_trait]
    impl RunningProcess for FakeProcess {
        async fn is_ready(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.ready_after_polls
        }

        async fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        async fn generate(
            &self,
            _input: &GenerationInput,
        ) -> BackendResult<Vec<GenerationOutput>> {
            Ok(vec![GenerationOutput {
                data: b"worker output".to_vec(),
                metadata: serde_json::Value::Null,
            }])
        }

        async fn load_model(&self, _model: &str) -> BackendResult<bool> {
            Ok(true)
        }

        async fn free_memory(&self, _system_ram: bool) -> bool {
            true
        }
    }

    struct FakeRunner {
        process: Arc<FakeProcess>,
    }

    #[async_trait]
    impl ProcessRunner for FakeRunner {
        async fn spawn(&self, _script: &Path) -> anyhow::Result<Arc<dyn RunningProcess>> {
            Ok(Arc::clone(&self.process) as _)
        }
    }

    fn script_on_disk() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sh");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    fn backend_with(
        script: &str,
        process: Arc<FakeProcess>,
        timeout_secs: u64,
    ) -> SelfStartBackend {
        SelfStartBackend::new(
            SelfStartSettings {
                start_script: script.to_string(),
                ready_timeout_secs: timeout_secs,
                ready_poll_ms: 10,
                ..Default::default()
            },
            Arc::new(FakeRunner { process }),
        )
    }

    #[test]
    fn script_validation_rejects_bad_paths() {
        assert!(validate_script_path("").is_err());
        assert!(validate_script_path("worker.exe").is_err());
        assert!(validate_script_path("has\"quote.sh").is_err());
        assert!(validate_script_path("/missing/worker.sh").is_err());
    }

    #[tokio::test]
    async fn init_waits_for_readiness_then_runs() {
        let (_dir, script) = script_on_disk();
        let process = Arc::new(FakeProcess {
            ready_after_polls: 3,
            ..Default::default()
        });
        let backend = backend_with(&script, Arc::clone(&process), 10);
        assert_eq!(
            backend.init(test_ctx(1)).await.unwrap(),
            InitOutcome::Running
        );
        let outputs = backend.generate(&GenerationInput::new(None)).await.unwrap();
        assert_eq!(outputs[0].data, b"worker output");
    }

    #[tokio::test]
    async fn never_ready_worker_is_killed() {
        let (_dir, script) = script_on_disk();
        let process = Arc::new(FakeProcess {
            ready_after_polls: u32::MAX,
            ..Default::default()
        });
        let backend = backend_with(&script, Arc::clone(&process), 0);
        let result = backend.init(test_ctx(1)).await;
        assert!(matches!(result, Err(BackendError::Transient(_))));
        assert!(process.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bad_extension_is_a_config_error() {
        let process = Arc::new(FakeProcess::default());
        let backend = backend_with("worker.exe", process, 10);
        assert!(matches!(
            backend.init(test_ctx(1)).await,
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn generate_without_process_fails_transient() {
        let (_dir, script) = script_on_disk();
        let backend = backend_with(&script, Arc::new(FakeProcess::default()), 10);
        let result = backend.generate(&GenerationInput::new(None)).await;
        assert!(matches!(result, Err(BackendError::Transient(_))));
    }

    #[tokio::test]
    async fn shutdown_kills_the_worker() {
        let (_dir, script) = script_on_disk();
        let process = Arc::new(FakeProcess::default());
        let backend = backend_with(&script, Arc::clone(&process), 10);
        backend.init(test_ctx(1)).await.unwrap();
        backend.shutdown().await;
        assert!(process.killed.load(Ordering::SeqCst));
    }
}

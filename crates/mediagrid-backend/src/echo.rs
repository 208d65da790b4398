//! Echo backend: an in-process backend with scriptable behavior.
//!
//! Serves as the local/test backend type. Every failure mode the
//! schedulers care about (slow init, flaky init, refused loads, failed
//! loads) can be staged through its settings.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediagrid_core::{GenerationInput, GenerationOutput};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendContext, GenerationBackend, InitOutcome};
use crate::error::{BackendError, BackendResult};
use crate::types::{BackendTypeInfo, FieldKind, SettingsField};

/// How scripted `load_model` calls behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBehavior {
    #[default]
    Succeed,
    /// Decline the model without erroring (`Ok(false)`).
    Refuse,
    /// Fail with a transient error.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    pub init_delay_ms: u64,
    /// Fail this many init attempts before succeeding.
    pub init_failures: u32,
    pub load_behavior: LoadBehavior,
    pub load_delay_ms: u64,
    pub generate_delay_ms: u64,
    pub features: Vec<String>,
    pub max_usages: u32,
    pub can_load_models: bool,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            init_delay_ms: 0,
            init_failures: 0,
            load_behavior: LoadBehavior::Succeed,
            load_delay_ms: 0,
            generate_delay_ms: 0,
            features: Vec::new(),
            max_usages: 1,
            can_load_models: true,
        }
    }
}

pub struct EchoBackend {
    settings: EchoSettings,
    remaining_init_failures: AtomicU32,
    load_calls: Arc<AtomicU32>,
    generate_calls: Arc<AtomicU32>,
    loaded_model: Mutex<Option<String>>,
    ctx: Mutex<Option<BackendContext>>,
}

impl EchoBackend {
    pub fn new(settings: EchoSettings) -> Self {
        Self {
            remaining_init_failures: AtomicU32::new(settings.init_failures),
            settings,
            load_calls: Arc::new(AtomicU32::new(0)),
            generate_calls: Arc::new(AtomicU32::new(0)),
            loaded_model: Mutex::new(None),
            ctx: Mutex::new(None),
        }
    }

    /// Shared call counters, for asserting on scheduler behavior.
    pub fn probe(&self) -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        (
            Arc::clone(&self.load_calls),
            Arc::clone(&self.generate_calls),
        )
    }

    pub fn loaded_model(&self) -> Option<String> {
        self.loaded_model.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for EchoBackend {
    async fn init(&self, ctx: BackendContext) -> BackendResult<InitOutcome> {
        if self.settings.init_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.init_delay_ms)).await;
        }
        if self.remaining_init_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_init_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::Transient("scripted init failure".into()));
        }
        ctx.max_usages
            .store(self.settings.max_usages, Ordering::SeqCst);
        ctx.can_load_models
            .store(self.settings.can_load_models, Ordering::SeqCst);
        *self.ctx.lock().unwrap() = Some(ctx);
        Ok(InitOutcome::Running)
    }

    async fn shutdown(&self) {
        *self.loaded_model.lock().unwrap() = None;
        debug!("echo backend shut down");
    }

    async fn generate(&self, input: &GenerationInput) -> BackendResult<Vec<GenerationOutput>> {
        if self.settings.generate_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.generate_delay_ms)).await;
        }
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let metadata = serde_json::json!({
            "model": self.loaded_model(),
            "params": input.params,
        });
        let data = serde_json::to_vec(&metadata)
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        Ok(vec![GenerationOutput { data, metadata }])
    }

    async fn load_model(
        &self,
        model: &str,
        _hint: Option<&GenerationInput>,
    ) -> BackendResult<bool> {
        if self.settings.load_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.load_delay_ms)).await;
        }
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        match self.settings.load_behavior {
            LoadBehavior::Succeed => {
                *self.loaded_model.lock().unwrap() = Some(model.to_string());
                Ok(true)
            }
            LoadBehavior::Refuse => Ok(false),
            LoadBehavior::Fail => Err(BackendError::Transient("scripted load failure".into())),
        }
    }

    async fn free_memory(&self, _system_ram: bool) -> bool {
        false
    }

    fn supported_features(&self) -> HashSet<String> {
        self.settings.features.iter().cloned().collect()
    }
}

pub const ECHO_TYPE_ID: &str = "echo";

pub fn echo_backend_type() -> BackendTypeInfo {
    BackendTypeInfo {
        id: ECHO_TYPE_ID.to_string(),
        name: "Echo".to_string(),
        description: "In-process backend that echoes job parameters back. \
                      Intended for local testing and pool diagnostics."
            .to_string(),
        can_load_fast: true,
        is_standard: true,
        settings_schema: vec![
            SettingsField::new(
                "max_usages",
                FieldKind::Integer,
                "Concurrent jobs this backend accepts.",
            ),
            SettingsField::new(
                "features",
                FieldKind::List,
                "Feature tags this backend claims to support.",
            ),
        ],
        constructor: Arc::new(|settings| {
            let parsed: EchoSettings = settings.clone().try_into()?;
            Ok(Arc::new(EchoBackend::new(parsed)))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;

    #[tokio::test]
    async fn init_applies_settings_to_context() {
        let backend = EchoBackend::new(EchoSettings {
            max_usages: 4,
            can_load_models: false,
            ..Default::default()
        });
        let ctx = test_ctx(0);
        let max_usages = Arc::clone(&ctx.max_usages);
        let can_load = Arc::clone(&ctx.can_load_models);
        assert_eq!(backend.init(ctx).await.unwrap(), InitOutcome::Running);
        assert_eq!(max_usages.load(Ordering::SeqCst), 4);
        assert!(!can_load.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn scripted_init_failures_then_success() {
        let backend = EchoBackend::new(EchoSettings {
            init_failures: 2,
            ..Default::default()
        });
        assert!(backend.init(test_ctx(0)).await.is_err());
        assert!(backend.init(test_ctx(0)).await.is_err());
        assert!(backend.init(test_ctx(0)).await.is_ok());
    }

    #[tokio::test]
    async fn load_refusal_does_not_set_model() {
        let backend = EchoBackend::new(EchoSettings {
            load_behavior: LoadBehavior::Refuse,
            ..Default::default()
        });
        assert!(!backend.load_model("sd-xl", None).await.unwrap());
        assert_eq!(backend.loaded_model(), None);
    }

    #[tokio::test]
    async fn generate_echoes_params() {
        let backend = EchoBackend::new(EchoSettings::default());
        backend.load_model("sd-xl", None).await.unwrap();
        let mut input = GenerationInput::new(Some("sd-xl".into()));
        input.params = serde_json::json!({"steps": 20});
        let outputs = backend.generate(&input).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].metadata["model"], "sd-xl");
        assert_eq!(outputs[0].metadata["params"]["steps"], 20);
    }

    #[tokio::test]
    async fn generate_live_streams_the_finished_outputs() {
        use mediagrid_core::LiveUpdate;

        let backend = EchoBackend::new(EchoSettings::default());
        backend.load_model("sd-xl", None).await.unwrap();
        let mut input = GenerationInput::new(Some("sd-xl".into()));
        input.params = serde_json::json!({"steps": 20});
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        backend
            .generate_live(&input, "batch-1", tx)
            .await
            .unwrap();

        let update = rx.recv().await.expect("one update");
        match update {
            LiveUpdate::Output(output) => {
                assert_eq!(output.metadata["model"], "sd-xl");
                assert_eq!(output.metadata["params"]["steps"], 20);
            }
            other => panic!("expected an output update, got {other:?}"),
        }
        // Sender side is done; the stream ends after the lone output.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn constructor_parses_settings_table() {
        let info = echo_backend_type();
        let table: toml::Table = toml::from_str("max_usages = 3\nfeatures = [\"video\"]").unwrap();
        let backend = (info.constructor)(&table).unwrap();
        assert!(backend.supported_features().contains("video"));
    }
}

//! mediagrid-backend — the generation backend contract and adapters.
//!
//! Defines what a backend is ([`GenerationBackend`]), how backend types
//! are described and constructed ([`types`]), and the built-in adapters:
//! an in-process echo backend, a self-started worker process, a remote
//! grid proxy, and an auto-scaler. The registry crate owns instances of
//! these; this crate never tracks pool state.

pub mod autoscale;
pub mod backend;
pub mod echo;
pub mod error;
pub mod host;
pub mod idle;
pub mod remote;
pub mod selfstart;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use backend::{BackendContext, GenerationBackend, InitOutcome};
pub use error::{BackendError, BackendResult};
pub use host::{InstanceHost, NonrealSpec, ScaleFuture, ScaleHook, ScaleResult};
pub use types::{
    BackendTypeInfo, BackendTypeRegistry, FieldKind, SECRET_PLACEHOLDER, SettingsField,
};

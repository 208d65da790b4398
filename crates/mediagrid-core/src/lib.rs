//! mediagrid-core — shared domain types for the MediaGrid backend pool.
//!
//! This crate is the leaf of the workspace: status enums, job payloads,
//! scheduler configuration, and the monotonic clock used for
//! least-recently-used ordering. No async machinery lives here.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::ticks_ms;
pub use config::{BackendsConfig, ModelLoadOrder};
pub use types::{
    BackendId, BackendStatus, GenerationInput, GenerationOutput, LiveUpdate, StatusCell,
};

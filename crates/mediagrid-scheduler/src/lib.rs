//! mediagrid-scheduler — init scheduling, model-pressure dispatch, and
//! pool status reporting.
//!
//! Two loops run against the registry: the init scheduler brings queued
//! backends up (concurrently for fast types, serialized for slow ones),
//! and the dispatcher matches generation requests to backend usage
//! slots, arbitrating model loads by pooled request pressure.

pub mod access;
pub mod dispatch;
pub mod error;
pub mod init;
pub mod pressure;
pub mod session;
pub mod status;

pub use access::BackendAccess;
pub use dispatch::{Dispatcher, GetBackendArgs, RequestFilter, WillLoadNotifier};
pub use error::{DispatchError, DispatchResult};
pub use init::InitScheduler;
pub use pressure::{ModelPressure, PressureTracker};
pub use session::{SessionClaim, SessionHandle};
pub use status::{PoolStatus, StatusReporter, StatusSummary, SummaryClass};

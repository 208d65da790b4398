//! mediagrid-registry — ownership and persistence of the backend pool.
//!
//! The registry tracks every live [`BackendInstance`], assigns ids (real
//! backends count up from 0, ephemeral ones count down from -1), merges
//! edits with secret preservation, and persists the configured list as
//! TOML. The scheduler crate drives init and dispatch on top of it.

pub mod error;
pub mod init_queue;
pub mod instance;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use init_queue::InitQueue;
pub use instance::{BackendInstance, LoadStatusEntry};
pub use registry::BackendRegistry;

//! Registry error taxonomy.

use mediagrid_core::BackendId;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown backend type \"{0}\"")]
    UnknownType(String),

    #[error("no backend with id {0}")]
    UnknownBackend(BackendId),

    #[error("backend id {0} is already in use")]
    IdInUse(BackendId),

    #[error("failed to construct backend: {0:#}")]
    Construction(#[source] anyhow::Error),

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error("save file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("save file is not valid: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not encode save file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

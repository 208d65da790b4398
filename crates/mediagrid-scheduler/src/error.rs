//! Dispatch error taxonomy, surfaced to generation callers.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nothing in the pool can ever take a job, and scaling produced
    /// nothing either.
    #[error("no backends are available")]
    NoBackends,

    /// Backends exist but none match this job's requirements.
    #[error("no backend matches this job{}", format_reasons(.reasons))]
    NoMatch { reasons: Vec<String> },

    /// Every backend able to load the requested model has failed it.
    #[error("all backends failed to load model \"{model}\"{}", format_reasons(.reasons))]
    AllLoadersFailed { model: String, reasons: Vec<String> },

    /// The caller's wait budget ran out, or the pool made no forward
    /// progress for the configured stall limit.
    #[error("no backend became available within {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("the backend pool is shutting down")]
    ShuttingDown,

    #[error("dispatch configuration error: {0}")]
    InvalidConfig(String),
}

fn format_reasons(reasons: &[String]) -> String {
    if reasons.is_empty() {
        String::new()
    } else {
        format!(": {}", reasons.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_into_the_message() {
        let err = DispatchError::AllLoadersFailed {
            model: "sd-xl".into(),
            reasons: vec!["gpu exploded".into(), "disk full".into()],
        };
        let text = err.to_string();
        assert!(text.contains("sd-xl"));
        assert!(text.contains("gpu exploded; disk full"));
    }

    #[test]
    fn empty_reasons_render_clean() {
        let err = DispatchError::NoMatch { reasons: vec![] };
        assert_eq!(err.to_string(), "no backend matches this job");
    }
}

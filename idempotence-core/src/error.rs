use std::time::Duration;

/// Failures that callers may want to tell apart.
///
/// Most functions in this crate return [`anyhow::Result`]; these variants are
/// carried inside and can be recovered with `downcast_ref::<Error>()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is not a supported state_type (expected `attribute` or `file`)")]
    UnsupportedStateType(String),

    #[error("could not evaluate or_if guard `{guard}`")]
    GuardEvaluation {
        guard: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("or_if guard `{guard}` did not finish within {}s", timeout.as_secs_f64())]
    GuardTimeout { guard: String, timeout: Duration },

    #[error("could not persist state {root_key}")]
    BackendWrite {
        root_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to persist {} state(s): {}", failures.len(), failed_keys(failures))]
    FlushFailed { failures: Vec<Error> },

    #[error("malformed state key: {0}")]
    MalformedStateKey(String),

    #[error("invalid root state key `{0}`: must be a single path segment")]
    InvalidRootKey(String),
}

fn failed_keys(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| match e {
            Error::BackendWrite { root_key, .. } => root_key.as_str(),
            _ => "?",
        })
        .collect::<Vec<_>>()
        .join(", ")
}

use std::time::Duration;

/// Errors raised while building or parsing composite keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{field} id must not be empty")]
    EmptyId { field: &'static str },

    #[error("{field} id '{id}' contains the key delimiter '__'")]
    ContainsDelimiter { field: &'static str, id: String },

    #[error("{field} id '{id}' must not start or end with '_'")]
    EdgeUnderscore { field: &'static str, id: String },

    #[error("Malformed key '{0}'")]
    Malformed(String),
}

/// Error enum for everything that can end a run or reject a run request.
///
/// Categories:
/// - Rejected: the request never reached the queue (UnknownId, InvalidKey)
/// - Settled: the run was admitted and ended without a result (Transport,
///   Backend, JobFailed, Timeout, Decode, Interrupted)
/// - Dispatcher: the actor is gone
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    // Rejected
    #[error("Unknown {kind} '{id}'")]
    UnknownId { kind: &'static str, id: String },

    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    // Settled
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Run timed out after {0:?} without completing")]
    Timeout(Duration),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),

    #[error("Run was interrupted before it settled")]
    Interrupted,

    // Dispatcher
    #[error("Dispatcher shut down")]
    DispatcherClosed,
}

impl RunError {
    /// Returns true if polling gave up because the deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout(_))
    }

    /// Returns true if the request was refused before anything was queued.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RunError::UnknownId { .. } | RunError::InvalidKey(_))
    }
}

impl From<reqwest::Error> for RunError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RunError::Decode(err.to_string())
        } else {
            RunError::Transport(err.to_string())
        }
    }
}

/// Lets CLI code that works in `Result<T, String>` use `?` on run errors.
impl From<RunError> for String {
    fn from(err: RunError) -> String {
        err.to_string()
    }
}

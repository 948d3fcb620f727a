use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Engine-wide error taxonomy.
///
/// `InvalidArgument` and `NotFound` are rejected before or without remote
/// side effects and are not worth retrying. `OperationFailed` is a remote
/// read/write failure the caller may retry. `PartialFailure` reports an
/// operation that completed some, but not all, of its remote steps; the
/// `completed` field tells the caller what already happened so a retry does
/// not duplicate work.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{context}")]
    OperationFailed {
        context: String,
        #[source]
        source: BoxedError,
    },
    #[error("{context} (already completed: {completed})")]
    PartialFailure {
        completed: String,
        context: String,
        #[source]
        source: BoxedError,
    },
}

impl SyncError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn operation_failed(context: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Self::OperationFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn partial_failure(
        completed: impl Into<String>,
        context: impl Into<String>,
        source: impl Into<BoxedError>,
    ) -> Self {
        Self::PartialFailure {
            completed: completed.into(),
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed { .. } | Self::PartialFailure { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

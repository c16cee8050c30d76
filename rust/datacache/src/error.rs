use quarry_error::{ErrorCodes, QuarryError};

/// Error surface of the data cache.  Every variant maps onto a stable
/// [`ErrorCodes`] value; the facade propagates backend errors unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cache entry not found")]
    NotFound,
    #[error("cache entry already exists")]
    AlreadyExists,
    #[error("admission refused: {0}")]
    ResourceExhausted(String),
    #[error("corrupt cache entry: {0}")]
    Corruption(String),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("block cache is not initialized")]
    Uninitialized,
    #[error("block cache is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl QuarryError for CacheError {
    fn code(&self) -> ErrorCodes {
        match self {
            CacheError::InvalidArgument(_) => ErrorCodes::InvalidArgument,
            CacheError::NotFound => ErrorCodes::NotFound,
            CacheError::AlreadyExists => ErrorCodes::AlreadyExists,
            CacheError::ResourceExhausted(_) => ErrorCodes::ResourceExhausted,
            CacheError::Corruption(_) => ErrorCodes::DataLoss,
            CacheError::NotSupported(_) => ErrorCodes::Unimplemented,
            CacheError::Uninitialized => ErrorCodes::FailedPrecondition,
            CacheError::AlreadyInitialized => ErrorCodes::FailedPrecondition,
            CacheError::Io(_) => ErrorCodes::Internal,
            CacheError::Internal(_) => ErrorCodes::Internal,
        }
    }

    fn should_trace_error(&self) -> bool {
        // Misses and existence checks are part of normal operation.
        !matches!(self, CacheError::NotFound | CacheError::AlreadyExists)
    }
}

//! Shared error vocabulary for the quarry backend.
//!
//! Errors that cross crate boundaries implement [`QuarryError`] so callers
//! can branch on a stable [`ErrorCodes`] value instead of downcasting.  The
//! codes follow the gRPC status code set so they translate cleanly at the
//! service edge.

use std::error::Error;

/// Status codes shared across the backend.  The numbering mirrors the gRPC
/// spec (https://grpc.github.io/grpc/core/md_doc_statuscodes.html) so the
/// values survive a trip through the wire unchanged.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    /// Success.  Named to avoid clashing with `Result::Ok`.
    Success = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// An error that cannot be classified more precisely.
    Unknown = 2,
    /// The caller specified an invalid argument.
    InvalidArgument = 3,
    /// A requested entity was not found.
    NotFound = 5,
    /// An entity the caller attempted to create already exists.
    AlreadyExists = 6,
    /// A resource (quota, admission budget, disk space) has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation is not implemented or not supported by this backend.
    Unimplemented = 12,
    /// Internal error: an invariant expected by the system was broken.
    Internal = 13,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::Success => "Success",
            ErrorCodes::Cancelled => "Cancelled",
            ErrorCodes::Unknown => "Unknown",
            ErrorCodes::InvalidArgument => "InvalidArgument",
            ErrorCodes::NotFound => "NotFound",
            ErrorCodes::AlreadyExists => "AlreadyExists",
            ErrorCodes::ResourceExhausted => "ResourceExhausted",
            ErrorCodes::FailedPrecondition => "FailedPrecondition",
            ErrorCodes::Unimplemented => "Unimplemented",
            ErrorCodes::Internal => "Internal",
            ErrorCodes::DataLoss => "DataLoss",
        }
    }
}

impl std::fmt::Display for ErrorCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait QuarryError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn QuarryError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    /// Whether this error should be surfaced in traces.  Expected errors on
    /// hot paths (cache misses, for instance) override this to false.
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn QuarryError> {}

impl QuarryError for Box<dyn QuarryError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl QuarryError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        match self.kind() {
            std::io::ErrorKind::NotFound => ErrorCodes::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorCodes::AlreadyExists,
            _ => ErrorCodes::Internal,
        }
    }
}

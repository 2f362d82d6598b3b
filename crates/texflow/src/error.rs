use thiserror::Error;

use crate::backend::DataId;
use crate::dtype::DType;

/// Failure modes of the texture backend contract.
///
/// Every variant is raised synchronously at the call site and reports caller
/// error; nothing here is transient or retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("data handle {handle} is already registered")]
    DuplicateRegistration { handle: DataId },
    #[error("no data registered for handle {handle}; it was never registered or has been disposed")]
    UnregisteredHandle { handle: DataId },
    #[error("backend was disposed; {handle:?} is no longer valid")]
    BackendDisposed { handle: Option<DataId> },
    #[error("write to {handle} was given no values")]
    NullInput { handle: DataId },
    #[error("handle {handle} is registered but holds no data")]
    Uninitialized { handle: DataId },
    #[error("unsupported dtype '{dtype}'")]
    UnsupportedDType { dtype: String },
    #[error("dtype mismatch for {handle}: registered as {expected:?}, got {found:?}")]
    DTypeMismatch {
        handle: DataId,
        expected: DType,
        found: DType,
    },
    #[error("{context}: expected {expected} elements, got {found}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid argument for {op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },
    #[error("kernel parameter binding mismatch: {0}")]
    ParamMismatch(String),
    #[error("{op} is not implemented on the texture backend")]
    NotImplemented { op: &'static str },
    #[error("device failure: {message}")]
    Device { message: String },
}

impl BackendError {
    pub fn device(message: impl Into<String>) -> Self {
        BackendError::Device {
            message: message.into(),
        }
    }

    pub fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    pub fn not_implemented(op: &'static str) -> Self {
        BackendError::NotImplemented { op }
    }

    pub fn unsupported_dtype(dtype: impl Into<String>) -> Self {
        BackendError::UnsupportedDType {
            dtype: dtype.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

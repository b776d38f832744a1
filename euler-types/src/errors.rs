use thiserror::Error;
use tonic::Code;

/// Stable wire-level error kinds. The numeric values match the gRPC status
/// codes where one exists; `ProtoError` and `RpcError` are Euler extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    ProtoError,
    RpcError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ProtoError => "Proto error",
            ErrorKind::RpcError => "Rpc error",
        }
    }

    pub fn to_code(self) -> Code {
        match self {
            ErrorKind::Cancelled => Code::Cancelled,
            ErrorKind::Unknown => Code::Unknown,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::DeadlineExceeded => Code::DeadlineExceeded,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::PermissionDenied => Code::PermissionDenied,
            ErrorKind::ResourceExhausted => Code::ResourceExhausted,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            ErrorKind::Aborted => Code::Aborted,
            ErrorKind::OutOfRange => Code::OutOfRange,
            ErrorKind::Unimplemented => Code::Unimplemented,
            ErrorKind::Internal => Code::Internal,
            ErrorKind::Unavailable => Code::Unavailable,
            ErrorKind::DataLoss => Code::DataLoss,
            ErrorKind::Unauthenticated => Code::Unauthenticated,
            // Euler extensions have no gRPC twin.
            ErrorKind::ProtoError => Code::InvalidArgument,
            ErrorKind::RpcError => Code::Unavailable,
        }
    }

    pub fn from_code(code: Code) -> Self {
        match code {
            Code::Cancelled => ErrorKind::Cancelled,
            Code::Unknown => ErrorKind::Unknown,
            Code::InvalidArgument => ErrorKind::InvalidArgument,
            Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Code::NotFound => ErrorKind::NotFound,
            Code::AlreadyExists => ErrorKind::AlreadyExists,
            Code::PermissionDenied => ErrorKind::PermissionDenied,
            Code::ResourceExhausted => ErrorKind::ResourceExhausted,
            Code::FailedPrecondition => ErrorKind::FailedPrecondition,
            Code::Aborted => ErrorKind::Aborted,
            Code::OutOfRange => ErrorKind::OutOfRange,
            Code::Unimplemented => ErrorKind::Unimplemented,
            Code::Internal => ErrorKind::Internal,
            Code::Unavailable => ErrorKind::Unavailable,
            Code::DataLoss => ErrorKind::DataLoss,
            Code::Unauthenticated => ErrorKind::Unauthenticated,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kinded error, the common currency at the RPC boundary.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Status {
    pub kind: ErrorKind,
    pub message: String,
}

impl Status {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }
}

impl From<Status> for tonic::Status {
    fn from(status: Status) -> Self {
        tonic::Status::new(status.kind.to_code(), status.message)
    }
}

impl From<tonic::Status> for Status {
    fn from(status: tonic::Status) -> Self {
        Status::new(ErrorKind::from_code(status.code()), status.message().to_string())
    }
}

#[derive(Error, Debug)]
pub enum TypeError {
    #[error("Tensor '{0}' already exists")]
    TensorExists(String),
    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),
    #[error("Expected dtype {expected:?}, got {actual:?}")]
    DTypeMismatch {
        expected: crate::dtype::DType,
        actual: crate::dtype::DType,
    },
    #[error("Tensor content of {actual} bytes does not match shape ({expected} bytes)")]
    ContentSizeMismatch { expected: usize, actual: usize },
    #[error("Unknown dtype tag {0}")]
    UnknownDType(i32),
    #[error("Tensor is not a scalar, shape {0}")]
    NotScalar(String),
    #[error("Invalid tensor proto: {0}")]
    InvalidProto(String),
    #[error("Invalid config value for '{key}': {value}")]
    InvalidConfigValue { key: String, value: String },
}

impl From<TypeError> for Status {
    fn from(err: TypeError) -> Self {
        let kind = match &err {
            TypeError::TensorExists(_) => ErrorKind::AlreadyExists,
            TypeError::TensorNotFound(_) => ErrorKind::NotFound,
            TypeError::InvalidProto(_) | TypeError::UnknownDType(_) => ErrorKind::ProtoError,
            TypeError::InvalidConfigValue { .. } => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        };
        Status::new(kind, err.to_string())
    }
}

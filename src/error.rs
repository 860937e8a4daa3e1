use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level result taxonomy. Every response carries exactly one of these;
/// `Ok` is included so a response code can be encoded without an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    Ok,
    InvalidArg,
    NoMemory,
    NotFound,
    Internal,
    InitFailed,
    Io,
    Disconnect,
    MalformedMsg,
    Unsupported,
    UnknownModel,
    BadElement,
    ValidationFailed,
    OperationFailed,
    DataExists,
    DataMissing,
    Unauthorized,
    Locked,
    TimedOut,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::InvalidArg => "invalid_arg",
            ErrorCode::NoMemory => "no_memory",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
            ErrorCode::InitFailed => "init_failed",
            ErrorCode::Io => "io",
            ErrorCode::Disconnect => "disconnect",
            ErrorCode::MalformedMsg => "malformed_msg",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::UnknownModel => "unknown_model",
            ErrorCode::BadElement => "bad_element",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::OperationFailed => "operation_failed",
            ErrorCode::DataExists => "data_exists",
            ErrorCode::DataMissing => "data_missing",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Locked => "locked",
            ErrorCode::TimedOut => "timed_out",
        }
    }
}

/// Engine-internal error. Variants carry human-readable context and map onto
/// the wire taxonomy via [`EngineError::code`]. `io::Error` is stringified at
/// the conversion boundary so errors stay `Clone` for session records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("bad element: {0}")]
    BadElement(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("data already exists: {0}")]
    DataExists(String),
    #[error("data missing: {0}")]
    DataMissing(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("malformed message: {0}")]
    MalformedMsg(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("disconnected: {0}")]
    Disconnect(String),
    #[error("initialization failed: {0}")]
    InitFailed(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidArg(_) => ErrorCode::InvalidArg,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::UnknownModel(_) => ErrorCode::UnknownModel,
            EngineError::BadElement(_) => ErrorCode::BadElement,
            EngineError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            EngineError::OperationFailed(_) => ErrorCode::OperationFailed,
            EngineError::DataExists(_) => ErrorCode::DataExists,
            EngineError::DataMissing(_) => ErrorCode::DataMissing,
            EngineError::Unauthorized(_) => ErrorCode::Unauthorized,
            EngineError::Locked(_) => ErrorCode::Locked,
            EngineError::TimedOut(_) => ErrorCode::TimedOut,
            EngineError::MalformedMsg(_) => ErrorCode::MalformedMsg,
            EngineError::Unsupported(_) => ErrorCode::Unsupported,
            EngineError::Disconnect(_) => ErrorCode::Disconnect,
            EngineError::InitFailed(_) => ErrorCode::InitFailed,
            EngineError::Io(_) => ErrorCode::Io,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => EngineError::Unauthorized(err.to_string()),
            _ => EngineError::Io(err.to_string()),
        }
    }
}

/// One recorded failure, scoped to a session: the message plus the data path
/// it refers to, when one is known. Validate and commit surface several of
/// these at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub message: String,
    pub xpath: Option<String>,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            xpath: None,
        }
    }

    pub fn at(message: impl Into<String>, xpath: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            xpath: Some(xpath.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_permission_denied_maps_to_unauthorized() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let engine_err = EngineError::from(err);
        assert_eq!(engine_err.code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn every_variant_has_a_distinct_code() {
        let variants = [
            EngineError::InvalidArg("x".into()),
            EngineError::NotFound("x".into()),
            EngineError::UnknownModel("x".into()),
            EngineError::BadElement("x".into()),
            EngineError::ValidationFailed("x".into()),
            EngineError::OperationFailed("x".into()),
            EngineError::DataExists("x".into()),
            EngineError::DataMissing("x".into()),
            EngineError::Unauthorized("x".into()),
            EngineError::Locked("x".into()),
            EngineError::TimedOut("x".into()),
            EngineError::MalformedMsg("x".into()),
            EngineError::Unsupported("x".into()),
            EngineError::Disconnect("x".into()),
            EngineError::InitFailed("x".into()),
            EngineError::Io("x".into()),
            EngineError::Internal("x".into()),
        ];
        let mut codes: Vec<ErrorCode> = variants.iter().map(|v| v.code()).collect();
        codes.sort_by_key(|c| c.as_str());
        codes.dedup();
        assert_eq!(codes.len(), variants.len());
    }
}

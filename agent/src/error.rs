//! # Error Taxonomy
//!
//! One result type for every fallible call in the daemon, independent of
//! the transport error kind that produced it. Request handlers are
//! `(request) -> Result<ReplyPayload, AgentError>` functions; a transport
//! failure is just another variant of the same type rather than a second,
//! separate error channel.

use thiserror::Error;

/// The result codes reported to servers in a reply frame's RCC field,
/// plus the handful that never leave the process (schema-version
/// mismatch, bind failure) and are only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    MalformedCommand,
    UnknownCommand,
    UnknownMetric,
    UnknownInstance,
    Unsupported,
    AccessDenied,
    AuthenticationFailed,
    RequestTimeout,
    InternalError,
    IoFailure,
    FileOpenError,
    EncryptionError,
    MemAllocFailed,
    OutOfResources,
    ExecFailed,
    SocketError,
    ConnectionBroken,
    BadArguments,
    NotImplemented,
    AlarmAlreadyInIncident,
}

impl ResultCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("unknown command")]
    UnknownCommand,
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("unknown instance")]
    UnknownInstance,
    #[error("unsupported operation")]
    Unsupported,
    #[error("access denied")]
    AccessDenied,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("request timed out")]
    RequestTimeout,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("failed to open file: {0}")]
    FileOpenError(String),
    #[error("encryption error: {0}")]
    EncryptionError(String),
    #[error("out of memory")]
    MemAllocFailed,
    #[error("out of resources")]
    OutOfResources,
    #[error("action execution failed: {0}")]
    ExecFailed(String),
    #[error("socket error: {0}")]
    SocketError(String),
    #[error("connection broken")]
    ConnectionBroken,
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("not implemented")]
    NotImplemented,
    #[error("alarm already tied to an incident")]
    AlarmAlreadyInIncident,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl AgentError {
    /// Maps this error onto the wire result code reported in a reply frame.
    pub fn rcc(&self) -> ResultCode {
        match self {
            Self::MalformedCommand(_) => ResultCode::MalformedCommand,
            Self::UnknownCommand => ResultCode::UnknownCommand,
            Self::UnknownMetric(_) => ResultCode::UnknownMetric,
            Self::UnknownInstance => ResultCode::UnknownInstance,
            Self::Unsupported => ResultCode::Unsupported,
            Self::AccessDenied => ResultCode::AccessDenied,
            Self::AuthenticationFailed => ResultCode::AuthenticationFailed,
            Self::RequestTimeout => ResultCode::RequestTimeout,
            Self::InternalError(_) => ResultCode::InternalError,
            Self::IoFailure(_) => ResultCode::IoFailure,
            Self::FileOpenError(_) => ResultCode::FileOpenError,
            Self::EncryptionError(_) => ResultCode::EncryptionError,
            Self::MemAllocFailed => ResultCode::MemAllocFailed,
            Self::OutOfResources => ResultCode::OutOfResources,
            Self::ExecFailed(_) => ResultCode::ExecFailed,
            Self::SocketError(_) => ResultCode::SocketError,
            Self::ConnectionBroken => ResultCode::ConnectionBroken,
            Self::BadArguments(_) => ResultCode::BadArguments,
            Self::NotImplemented => ResultCode::NotImplemented,
            Self::AlarmAlreadyInIncident => ResultCode::AlarmAlreadyInIncident,
            Self::Database(_) => ResultCode::InternalError,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_metric_maps_to_its_own_code() {
        let err = AgentError::UnknownMetric("Agent.Bogus".into());
        assert_eq!(err.rcc(), ResultCode::UnknownMetric);
    }
}

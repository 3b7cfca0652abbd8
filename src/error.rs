use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Copyable classification of an [`EngineError`].
///
/// This is what the session remembers as its last error and what callers
/// match on when deciding whether to retry, abort or prompt the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    Busy,
    Timeout,
    FatalBus,
    Decode,
    InvalidParameter,
    NoData,
    Acquisition,
    Transport,
    Export,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Instrument busy: {running} is still in flight")]
    Busy { running: String },
    #[error("Bus timeout on {command}")]
    Timeout { command: String },
    #[error("Fatal bus error: {0}")]
    FatalBus(String),
    #[error("Decode error for {command}: {reason}")]
    Decode { command: String, reason: String },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("No data: {0}")]
    NoData(String),
    #[error("Acquisition error: {0}")]
    Acquisition(String),
    #[error("Transport error on {command}: {reason}")]
    Transport { command: String, reason: String },
    #[error("Export error: {context}: {reason}")]
    Export { context: String, reason: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Connection(_) => ErrorKind::Connection,
            EngineError::Busy { .. } => ErrorKind::Busy,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::FatalBus(_) => ErrorKind::FatalBus,
            EngineError::Decode { .. } => ErrorKind::Decode,
            EngineError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            EngineError::NoData(_) => ErrorKind::NoData,
            EngineError::Acquisition(_) => ErrorKind::Acquisition,
            EngineError::Transport { .. } => ErrorKind::Transport,
            EngineError::Export { .. } => ErrorKind::Export,
        }
    }

    /// Whether the error left the bus unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::FatalBus(_))
    }

    pub(crate) fn export(context: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Export {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = EngineError::Timeout {
            command: "A?".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_fatal());

        let err = EngineError::FatalBus("link closed".to_string());
        assert_eq!(err.kind(), ErrorKind::FatalBus);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::Decode {
            command: "X?".to_string(),
            reason: "token 3 is not a number: 'abc'".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("X?"));
        assert!(text.contains("abc"));
    }
}

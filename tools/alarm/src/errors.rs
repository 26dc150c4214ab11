use crate::types::TaskState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("audio resource error: {0}")]
    AudioResource(String),
    #[error("sequence mismatch at position {position}: expected '{expected}', received '{received}'")]
    SequenceMismatch {
        position: usize,
        expected: char,
        received: char,
    },
    #[error("recovery error: {0}")]
    Recovery(String),
    #[error("raw data write failure: {0}")]
    WriteFailure(String),
    #[error("illegal transition: {from:?} -> {to:?}")]
    IllegalTransition { from: TaskState, to: TaskState },
    #[error("not cleared to begin: {0}")]
    NotCleared(String),
    #[error("cli error: {0}")]
    Cli(String),
}

impl AlarmError {
    /// Fatal errors stop the state machine; everything else is registered and surfaced
    /// through the error log only.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::WriteFailure(_)
                | Self::IllegalTransition { .. }
                | Self::NotCleared(_)
        )
    }
}

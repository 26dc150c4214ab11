use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Uninitialized,
    Setup,
    Idle,
    Prompting,
    AwaitingResponse,
    Resolving,
    Aborted,
    TornDown,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Setup => "setup",
            Self::Idle => "idle",
            Self::Prompting => "prompting",
            Self::AwaitingResponse => "awaiting_response",
            Self::Resolving => "resolving",
            Self::Aborted => "aborted",
            Self::TornDown => "torn_down",
        }
    }

    /// States in which a subject is looking at the prompt.
    pub fn is_collecting(self) -> bool {
        matches!(self, Self::Prompting | Self::AwaitingResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Recovered,
    Aborted,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Recovered => "recovered",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    SingleAction,
    Sequence,
}

/// Everything that can move the controller once a prompt is up. All sources post onto one
/// channel so the controller sees them in a single serialized order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// Discrete "continue" style action, such as a button press.
    Action,
    Symbol(char),
    AudioFinished,
    TimedOut,
    Cancelled(String),
}

impl TaskEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Symbol(_) => "symbol",
            Self::AudioFinished => "audio_finished",
            Self::TimedOut => "timed_out",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TaskEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TaskEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

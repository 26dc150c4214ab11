use crate::errors::AlarmError;
use crate::types::{Outcome, TaskState};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSession {
    pub state: TaskState,
    pub started_at: Option<SystemTime>,
    pub resolved_at: Option<SystemTime>,
    pub outcome: Option<Outcome>,
    pub abort_reason: Option<String>,
    pub mismatches: u32,
    pub resumed: bool,
}

impl Default for TaskSession {
    fn default() -> Self {
        Self {
            state: TaskState::Uninitialized,
            started_at: None,
            resolved_at: None,
            outcome: None,
            abort_reason: None,
            mismatches: 0,
            resumed: false,
        }
    }
}

impl TaskSession {
    pub fn transition(&mut self, next: TaskState) -> Result<(), AlarmError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    pub fn resolve(&mut self, outcome: Outcome, at: SystemTime) -> Result<(), AlarmError> {
        self.transition(TaskState::Resolving)?;
        self.outcome = Some(outcome);
        self.resolved_at = Some(at);
        Ok(())
    }

    /// Escalates to `Aborted`. The first reason sticks.
    pub fn abort(&mut self, reason: &str, at: SystemTime) -> Result<(), AlarmError> {
        self.transition(TaskState::Aborted)?;
        self.outcome = Some(Outcome::Aborted);
        self.abort_reason.get_or_insert_with(|| reason.to_string());
        self.resolved_at.get_or_insert(at);
        Ok(())
    }

    pub fn elapsed(&self, now: SystemTime) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        self.resolved_at
            .unwrap_or(now)
            .duration_since(started)
            .unwrap_or(Duration::ZERO)
    }
}

pub fn validate_transition(from: TaskState, to: TaskState) -> Result<(), AlarmError> {
    use TaskState as S;

    let allowed = match from {
        S::Uninitialized => matches!(to, S::Setup | S::TornDown),
        S::Setup => matches!(to, S::Idle | S::Aborted),
        S::Idle => matches!(to, S::Prompting | S::Resolving | S::Aborted | S::TornDown),
        S::Prompting => matches!(to, S::AwaitingResponse | S::Resolving | S::Aborted),
        S::AwaitingResponse => matches!(to, S::Resolving | S::Aborted),
        S::Resolving => matches!(to, S::Aborted | S::TornDown),
        S::Aborted => matches!(to, S::TornDown),
        S::TornDown => false,
    };

    if !allowed {
        return Err(AlarmError::IllegalTransition { from, to });
    }
    Ok(())
}

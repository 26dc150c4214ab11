use crate::raw_data::{RawDataRecord, RecordKind};
use crate::types::Outcome;

/// What an interrupted session left behind, reduced to what the controller needs to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// No resolution was recorded: show the prompt again and require a fresh response.
    Resume {
        started_at_ms: Option<u64>,
        discarded_input: Option<String>,
    },
    /// The subject had already responded (or the session timed out) before the crash; only the
    /// terminal marker is missing.
    Finalize {
        outcome: Outcome,
        started_at_ms: Option<u64>,
        resolved_at_ms: u64,
    },
}

/// Records written after the last terminal marker.
pub fn current_session(records: &[RawDataRecord]) -> &[RawDataRecord] {
    let start = records
        .iter()
        .rposition(|record| record.event.is_terminal())
        .map_or(0, |index| index + 1);
    &records[start..]
}

pub fn plan_recovery(records: &[RawDataRecord]) -> RecoveryPlan {
    let session = current_session(records);
    let started_at_ms = session
        .iter()
        .find(|record| record.event == RecordKind::PromptShown)
        .map(|record| record.timestamp_ms);

    let mut partial: Option<String> = None;
    let mut resolution: Option<(Outcome, u64)> = None;
    for record in session {
        match record.event {
            RecordKind::PromptShown => {
                partial = None;
                resolution = None;
            }
            // A recovery that finalized carries the outcome it settled on.
            RecordKind::Recovered => {
                partial = None;
                let resolved_at = resolution.map_or(record.timestamp_ms, |(_, ts)| ts);
                resolution = record.outcome.map(|outcome| (outcome, resolved_at));
            }
            RecordKind::Symbol => {
                partial = record.input.clone().filter(|input| !input.is_empty());
            }
            RecordKind::Response => {
                partial = None;
                resolution = Some((Outcome::Recovered, record.timestamp_ms));
            }
            RecordKind::Timeout => {
                partial = None;
                resolution = Some((Outcome::Aborted, record.timestamp_ms));
            }
            RecordKind::AudioFinished
            | RecordKind::Error
            | RecordKind::Completed
            | RecordKind::Aborted => {}
        }
    }

    match resolution {
        Some((outcome, resolved_at_ms)) => RecoveryPlan::Finalize {
            outcome,
            started_at_ms,
            resolved_at_ms,
        },
        None => RecoveryPlan::Resume {
            started_at_ms,
            discarded_input: partial,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event: RecordKind, ts: u64) -> RawDataRecord {
        RawDataRecord {
            timestamp_ms: ts,
            ..RawDataRecord::new(event)
        }
    }

    fn symbol(input: &str, ts: u64) -> RawDataRecord {
        record(RecordKind::Symbol, ts).with_input(input)
    }

    #[test]
    fn prompt_without_response_resumes() {
        let records = vec![record(RecordKind::PromptShown, 100)];
        assert_eq!(
            plan_recovery(&records),
            RecoveryPlan::Resume {
                started_at_ms: Some(100),
                discarded_input: None
            }
        );
    }

    #[test]
    fn partial_sequence_is_discarded() {
        let records = vec![
            record(RecordKind::PromptShown, 100),
            symbol("1", 110),
            symbol("12", 120),
            record(RecordKind::AudioFinished, 130),
        ];
        assert_eq!(
            plan_recovery(&records),
            RecoveryPlan::Resume {
                started_at_ms: Some(100),
                discarded_input: Some("12".to_string())
            }
        );
    }

    #[test]
    fn only_records_after_the_last_terminal_marker_count() {
        let records = vec![
            record(RecordKind::PromptShown, 1),
            record(RecordKind::Response, 2),
            record(RecordKind::Completed, 3),
            record(RecordKind::PromptShown, 50),
            record(RecordKind::Error, 51),
        ];
        assert_eq!(current_session(&records).len(), 2);
        assert_eq!(
            plan_recovery(&records),
            RecoveryPlan::Resume {
                started_at_ms: Some(50),
                discarded_input: None
            }
        );
    }

    #[test]
    fn recorded_resolution_is_finalized() {
        let responded = vec![
            record(RecordKind::PromptShown, 10),
            symbol("1", 11),
            record(RecordKind::Response, 12),
        ];
        assert_eq!(
            plan_recovery(&responded),
            RecoveryPlan::Finalize {
                outcome: Outcome::Recovered,
                started_at_ms: Some(10),
                resolved_at_ms: 12
            }
        );

        let timed_out = vec![
            record(RecordKind::PromptShown, 10),
            record(RecordKind::Timeout, 40),
            record(RecordKind::Error, 41),
        ];
        assert!(matches!(
            plan_recovery(&timed_out),
            RecoveryPlan::Finalize {
                outcome: Outcome::Aborted,
                ..
            }
        ));
    }

    #[test]
    fn finalizing_marker_survives_a_second_crash() {
        let records = vec![
            record(RecordKind::PromptShown, 10),
            record(RecordKind::Response, 12),
            record(RecordKind::Recovered, 30).with_outcome(Outcome::Recovered),
        ];
        assert_eq!(
            plan_recovery(&records),
            RecoveryPlan::Finalize {
                outcome: Outcome::Recovered,
                started_at_ms: Some(10),
                resolved_at_ms: 12
            }
        );
    }

    #[test]
    fn recovered_marker_resets_partial_state() {
        let records = vec![
            record(RecordKind::PromptShown, 10),
            symbol("12", 11),
            record(RecordKind::Recovered, 20),
        ];
        assert_eq!(
            plan_recovery(&records),
            RecoveryPlan::Resume {
                started_at_ms: Some(10),
                discarded_input: None
            }
        );
    }
}

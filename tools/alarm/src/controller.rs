use crate::audio::AudioCue;
use crate::config::{validate_config, AlarmConfig};
use crate::error_log::ErrorLog;
use crate::errors::AlarmError;
use crate::fsm::TaskSession;
use crate::host::{Presenter, PromptView, SessionReport, SummaryProducer, TaskObserver};
use crate::logging::append_run_log;
use crate::raw_data::{
    read_current_session, trailing_status, RawDataRecord, RawDataWriter, RecordKind,
};
use crate::recovery::{plan_recovery, RecoveryPlan};
use crate::response::{ResponseCollector, Verdict};
use crate::runtime::{AudioBackend, Clock, Timer, TimerHandle};
use crate::types::{EventReceiver, EventSender, Outcome, TaskEvent, TaskState};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const TIMEOUT_REASON: &str = "timeout";
pub const TORN_DOWN_REASON: &str = "torn down before response";

/// Collaborators the controller reaches through traits so a host (or a test) decides what is
/// real.
pub struct TaskEnvironment {
    pub clock: Arc<dyn Clock>,
    pub timer: Arc<dyn Timer>,
    pub audio: Arc<dyn AudioBackend>,
    pub presenter: Arc<dyn Presenter>,
    pub observer: Arc<dyn TaskObserver>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The prompt is back up and a fresh response is required.
    Resumed { discarded_input: Option<String> },
    /// The interrupted session had already resolved; only tear-down remains.
    Finalized { outcome: Outcome },
    /// The raw data could not be trusted and a fresh session was started instead.
    FreshStart { reason: String },
}

pub struct TaskController {
    config: AlarmConfig,
    env: TaskEnvironment,
    events: EventSender,
    session: TaskSession,
    collector: ResponseCollector,
    errors: ErrorLog,
    writer: Option<RawDataWriter>,
    audio: Option<AudioCue>,
    timer: Option<TimerHandle>,
    validated: bool,
    fatal: Option<String>,
    summary: Option<Box<dyn SummaryProducer>>,
}

impl TaskController {
    pub fn new(config: AlarmConfig, env: TaskEnvironment, events: EventSender) -> Self {
        let collector = ResponseCollector::new(config.response_mode(), config.required_sequence());
        Self {
            config,
            env,
            events,
            session: TaskSession::default(),
            collector,
            errors: ErrorLog::new(),
            writer: None,
            audio: None,
            timer: None,
            validated: false,
            fatal: None,
            summary: None,
        }
    }

    pub fn with_summary(mut self, producer: Box<dyn SummaryProducer>) -> Self {
        self.summary = Some(producer);
        self
    }

    pub fn setup(&mut self) -> Result<(), AlarmError> {
        if self.session.state != TaskState::Uninitialized {
            let err = AlarmError::IllegalTransition {
                from: self.session.state,
                to: TaskState::Setup,
            };
            self.fatal = Some("setup called more than once".to_string());
            self.register_error(err.to_string());
            return Err(err);
        }
        self.session.transition(TaskState::Setup)?;

        if let Err(err) = validate_config(&self.config) {
            return Err(self.fail_setup(err));
        }
        let path = self.config.raw_data_path();
        let writer = match RawDataWriter::open(&path, &self.config.task.name) {
            Ok(writer) => writer,
            Err(err) => {
                let err = AlarmError::Configuration(format!(
                    "data directory {} is not writable: {err}",
                    self.config.task.data_directory.display()
                ));
                return Err(self.fail_setup(err));
            }
        };
        self.writer = Some(writer);
        self.audio = self
            .config
            .audio
            .resource
            .as_ref()
            .map(|resource| AudioCue::new(Arc::clone(&self.env.audio), resource.clone()));
        self.collector = ResponseCollector::new(
            self.config.response_mode(),
            self.config.required_sequence(),
        );

        self.session.transition(TaskState::Idle)?;
        self.validated = true;
        append_run_log(
            "info",
            "alarm.setup.complete",
            json!({
                "task": self.config.task.name,
                "raw_data": path.display().to_string(),
                "mode": self.config.response_mode(),
                "audio": self.audio.is_some(),
            }),
        );
        Ok(())
    }

    fn fail_setup(&mut self, err: AlarmError) -> AlarmError {
        self.fatal = Some(err.to_string());
        self.register_error(err.to_string());
        let now = self.env.clock.now();
        let _ = self.session.abort("configuration", now);
        append_run_log(
            "error",
            "alarm.setup.failed",
            json!({
                "task": self.config.task.name,
                "error": err.to_string(),
            }),
        );
        err
    }

    pub fn is_cleared_to_begin(&self) -> bool {
        self.validated && self.fatal.is_none()
    }

    pub fn should_recover(&self) -> bool {
        if !self.validated {
            return false;
        }
        let status = trailing_status(&self.config.raw_data_path());
        let needed = status.needs_recovery();
        if needed {
            append_run_log(
                "info",
                "alarm.recovery.needed",
                json!({
                    "task": self.config.task.name,
                    "status": format!("{status:?}"),
                }),
            );
            self.env.observer.recovery_needed();
        }
        needed
    }

    pub fn begin(&mut self) -> Result<(), AlarmError> {
        self.ensure_cleared()?;
        self.session.transition(TaskState::Prompting)?;
        self.session.started_at = Some(self.env.clock.now());
        self.collector.reset();
        let record =
            RawDataRecord::new(RecordKind::PromptShown).with_detail(self.config.task.prompt.clone());
        self.start_prompt(record)?;
        append_run_log(
            "info",
            "alarm.prompt.shown",
            json!({
                "task": self.config.task.name,
                "mode": self.config.response_mode(),
            }),
        );
        Ok(())
    }

    /// Rebuilds the interrupted session from the raw data file. Unreadable or corrupt data is
    /// registered as an error and the controller starts a fresh session instead.
    pub fn recover(&mut self) -> Result<RecoveryOutcome, AlarmError> {
        self.ensure_cleared()?;
        if self.session.state != TaskState::Idle {
            return Err(AlarmError::IllegalTransition {
                from: self.session.state,
                to: TaskState::Prompting,
            });
        }
        let path = self.config.raw_data_path();
        if !trailing_status(&path).needs_recovery() {
            return Err(AlarmError::NotCleared(
                "no interrupted session to recover".to_string(),
            ));
        }

        let records = match read_current_session(&path) {
            Ok(records) => records,
            Err(err) => {
                let reason = err.to_string();
                self.register_error(format!("{reason}; starting a fresh session"));
                append_run_log(
                    "warn",
                    "alarm.recovery.fallback",
                    json!({
                        "task": self.config.task.name,
                        "error": reason,
                    }),
                );
                // Close the damaged session so later recoveries start after it.
                self.append(
                    RawDataRecord::new(RecordKind::Aborted)
                        .with_outcome(Outcome::Aborted)
                        .with_detail("unrecoverable raw data"),
                )?;
                self.begin()?;
                return Ok(RecoveryOutcome::FreshStart { reason });
            }
        };

        let plan = plan_recovery(&records);
        append_run_log(
            "info",
            "alarm.recovery.planned",
            json!({
                "task": self.config.task.name,
                "records": records.len(),
                "plan": format!("{plan:?}"),
            }),
        );
        self.session.resumed = true;
        self.collector.reset();
        match plan {
            RecoveryPlan::Resume {
                started_at_ms,
                discarded_input,
            } => {
                self.session.transition(TaskState::Prompting)?;
                self.session.started_at = Some(
                    started_at_ms
                        .map(ms_to_system_time)
                        .unwrap_or_else(|| self.env.clock.now()),
                );
                let detail = match &discarded_input {
                    Some(input) => format!("resumed; discarded partial input {input}"),
                    None => "resumed".to_string(),
                };
                self.start_prompt(RawDataRecord::new(RecordKind::Recovered).with_detail(detail))?;
                Ok(RecoveryOutcome::Resumed { discarded_input })
            }
            RecoveryPlan::Finalize {
                outcome,
                started_at_ms,
                resolved_at_ms,
            } => {
                self.append(
                    RawDataRecord::new(RecordKind::Recovered)
                        .with_outcome(outcome)
                        .with_detail("finalized"),
                )?;
                self.session.started_at = started_at_ms.map(ms_to_system_time);
                self.session
                    .resolve(outcome, ms_to_system_time(resolved_at_ms))?;
                if outcome == Outcome::Aborted {
                    self.session.abort_reason = Some(TIMEOUT_REASON.to_string());
                }
                self.env.observer.session_completed(outcome);
                Ok(RecoveryOutcome::Finalized { outcome })
            }
        }
    }

    /// Single entry point for everything posted on the event channel.
    pub fn handle_event(&mut self, event: TaskEvent) -> Result<(), AlarmError> {
        match event {
            TaskEvent::AudioFinished => {
                if let Some(audio) = self.audio.as_mut() {
                    audio.mark_finished();
                }
                if self.session.state.is_collecting() {
                    self.append(RawDataRecord::new(RecordKind::AudioFinished))?;
                }
                Ok(())
            }
            TaskEvent::Cancelled(reason) => self.abort(&reason),
            event if !self.session.state.is_collecting() => {
                // Lost a race against an earlier resolution, or arrived before the prompt.
                self.register_error(format!(
                    "{} ignored in state {}",
                    event.label(),
                    self.session.state.as_str()
                ));
                Ok(())
            }
            TaskEvent::TimedOut => self.on_timeout(),
            TaskEvent::Action => {
                let verdict = self.collector.on_action();
                self.apply_verdict(verdict, "action".to_string())
            }
            TaskEvent::Symbol(symbol) => {
                let verdict = self.collector.on_symbol(symbol);
                self.apply_verdict(verdict, symbol.to_string())
            }
        }
    }

    /// Drains events until the session leaves the collecting states.
    pub fn run_until_resolved(
        &mut self,
        events: &mut EventReceiver,
    ) -> Result<Option<Outcome>, AlarmError> {
        while self.session.state.is_collecting() {
            match events.blocking_recv() {
                Some(event) => self.handle_event(event)?,
                None => self.abort("event channel closed")?,
            }
        }
        Ok(self.session.outcome)
    }

    fn apply_verdict(&mut self, verdict: Verdict, input: String) -> Result<(), AlarmError> {
        match verdict {
            Verdict::Ignored => Ok(()),
            Verdict::Rejected(message) => {
                self.register_error(message);
                Ok(())
            }
            Verdict::Responded => self.resolve_completed(input),
            Verdict::Matched => {
                let input = self.collector.buffer_string();
                self.resolve_completed(input)
            }
            Verdict::Progress { .. } => {
                self.append(
                    RawDataRecord::new(RecordKind::Symbol).with_input(self.collector.buffer_string()),
                )?;
                self.mark_awaiting()?;
                self.render();
                Ok(())
            }
            Verdict::Mismatch { error, restarted } => {
                self.session.mismatches = self.session.mismatches.saturating_add(1);
                self.append(
                    RawDataRecord::new(RecordKind::Symbol)
                        .with_input(self.collector.buffer_string())
                        .with_detail(if restarted { "mismatch; restarted" } else { "mismatch" }),
                )?;
                self.register_error(error.to_string());
                self.mark_awaiting()?;
                self.render();
                Ok(())
            }
        }
    }

    fn mark_awaiting(&mut self) -> Result<(), AlarmError> {
        if self.session.state == TaskState::Prompting {
            self.session.transition(TaskState::AwaitingResponse)?;
        }
        Ok(())
    }

    fn resolve_completed(&mut self, input: String) -> Result<(), AlarmError> {
        let now = self.env.clock.now();
        let elapsed = self.session.elapsed(now);
        self.append(
            RawDataRecord::new(RecordKind::Response)
                .with_input(input)
                .with_elapsed_ms(elapsed.as_millis() as u64),
        )?;
        self.session.resolve(Outcome::Completed, now)?;
        self.finish_collecting(Outcome::Completed);
        Ok(())
    }

    fn on_timeout(&mut self) -> Result<(), AlarmError> {
        let now = self.env.clock.now();
        let elapsed = self.session.elapsed(now);
        self.append(
            RawDataRecord::new(RecordKind::Timeout)
                .with_input(self.collector.buffer_string())
                .with_elapsed_ms(elapsed.as_millis() as u64),
        )?;
        self.session.resolve(Outcome::Aborted, now)?;
        self.session.abort_reason = Some(TIMEOUT_REASON.to_string());
        self.finish_collecting(Outcome::Aborted);
        Ok(())
    }

    fn finish_collecting(&mut self, outcome: Outcome) {
        self.stop_stimuli();
        if let Err(err) = self.env.presenter.clear() {
            self.register_error(format!("presenter clear failed: {err}"));
        }
        append_run_log(
            "info",
            "alarm.session.resolved",
            json!({
                "task": self.config.task.name,
                "outcome": outcome,
                "elapsed_ms": self.elapsed().as_millis() as u64,
                "mismatches": self.session.mismatches,
            }),
        );
        self.env.observer.session_completed(outcome);
    }

    /// Escalates to `Aborted` from any active state. A no-op once the session has resolved,
    /// aborted or been torn down: the first resolution wins.
    pub fn abort(&mut self, reason: &str) -> Result<(), AlarmError> {
        if matches!(
            self.session.state,
            TaskState::Uninitialized
                | TaskState::Resolving
                | TaskState::Aborted
                | TaskState::TornDown
        ) {
            return Ok(());
        }
        let was_collecting = self.session.state.is_collecting();
        let now = self.env.clock.now();
        self.session.abort(reason, now)?;
        self.stop_stimuli();
        if was_collecting {
            let _ = self.env.presenter.clear();
        }
        append_run_log(
            "warn",
            "alarm.session.aborted",
            json!({
                "task": self.config.task.name,
                "reason": reason,
            }),
        );
        self.env.observer.session_completed(Outcome::Aborted);
        Ok(())
    }

    pub fn tear_down(&mut self) -> Result<(), AlarmError> {
        if self.session.state == TaskState::TornDown {
            return Ok(());
        }
        if self.session.state.is_collecting() {
            self.abort(TORN_DOWN_REASON)?;
        }

        let mut result = Ok(());
        if matches!(
            self.session.state,
            TaskState::Resolving | TaskState::Aborted
        ) && (self.session.started_at.is_some() || self.session.resumed)
        {
            let outcome = self.session.outcome.unwrap_or(Outcome::Aborted);
            let kind = match outcome {
                Outcome::Completed | Outcome::Recovered => RecordKind::Completed,
                Outcome::Aborted => RecordKind::Aborted,
            };
            let mut record = RawDataRecord::new(kind)
                .with_outcome(outcome)
                .with_elapsed_ms(self.elapsed().as_millis() as u64);
            if let Some(reason) = &self.session.abort_reason {
                record = record.with_detail(reason.clone());
            }
            if let Err(err) = self.write_record(record) {
                result = Err(err);
            }
        }

        self.stop_stimuli();
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.close() {
                result = result.and(Err(err));
            }
        }
        self.session.state = TaskState::TornDown;
        append_run_log(
            "info",
            "alarm.teardown.complete",
            json!({
                "task": self.config.task.name,
                "outcome": self.session.outcome,
                "records_written": self.writer.as_ref().map_or(0, RawDataWriter::appended),
            }),
        );
        result
    }

    /// Appends to the error log with the current timestamp. Never fails and never moves the
    /// state machine.
    pub fn register_error(&mut self, message: impl Into<String>) {
        let entry = self.errors.push(self.env.clock.now_ms(), message);
        append_run_log(
            "warn",
            "alarm.error.registered",
            json!({
                "task": self.config.task.name,
                "state": self.session.state.as_str(),
                "message": entry.message,
            }),
        );
        if let Some(writer) = self.writer.as_mut().filter(|writer| writer.is_open()) {
            let record = RawDataRecord::new(RecordKind::Error).with_detail(entry.message.clone());
            if let Err(err) = writer.append(record, entry.timestamp_ms) {
                append_run_log(
                    "error",
                    "alarm.error.unrecorded",
                    json!({
                        "task": self.config.task.name,
                        "error": err.to_string(),
                    }),
                );
            }
        }
        self.env.observer.error_registered(&entry);
    }

    pub fn error_log(&self) -> String {
        self.errors.formatted()
    }

    /// A handle a reporting thread can read while the controller keeps appending.
    pub fn error_log_handle(&self) -> ErrorLog {
        self.errors.clone()
    }

    pub fn data_directory(&self) -> &Path {
        &self.config.task.data_directory
    }

    pub fn raw_data_file(&self) -> String {
        self.config.raw_data_file_name()
    }

    pub fn raw_data_path(&self) -> PathBuf {
        self.config.raw_data_path()
    }

    pub fn task_name(&self) -> &str {
        &self.config.task.name
    }

    pub fn state(&self) -> TaskState {
        self.session.state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.session.outcome
    }

    pub fn session(&self) -> &TaskSession {
        &self.session
    }

    pub fn input_buffer(&self) -> &[char] {
        self.collector.buffer()
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.session.elapsed(self.env.clock.now())
    }

    pub fn main_view(&self) -> PromptView {
        PromptView {
            task_name: self.config.task.name.clone(),
            prompt: self.config.task.prompt.clone(),
            mode: self.collector.mode(),
            entered: self.collector.buffer().len(),
            expected: self.config.required_sequence().len(),
            active: self.session.state.is_collecting(),
        }
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            task_name: self.config.task.name.clone(),
            state: self.session.state,
            outcome: self.session.outcome,
            elapsed: self.elapsed(),
            mismatches: self.session.mismatches,
            errors: self.errors.len(),
            resumed: self.session.resumed,
        }
    }

    pub fn summary(&self) -> Option<String> {
        self.summary
            .as_ref()
            .map(|producer| producer.summary(&self.report()))
    }

    fn ensure_cleared(&self) -> Result<(), AlarmError> {
        if self.is_cleared_to_begin() {
            return Ok(());
        }
        let reason = self
            .fatal
            .clone()
            .unwrap_or_else(|| "setup has not completed".to_string());
        Err(AlarmError::NotCleared(reason))
    }

    /// Writes the opening record, then shows the prompt, starts the audio cue and arms the
    /// response timer.
    fn start_prompt(&mut self, record: RawDataRecord) -> Result<(), AlarmError> {
        self.append(record)?;
        self.render();
        self.start_audio();
        self.start_timer();
        Ok(())
    }

    fn render(&mut self) {
        let view = self.main_view();
        if let Err(err) = self.env.presenter.render(&view) {
            self.register_error(format!("presenter render failed: {err}"));
        }
    }

    fn start_audio(&mut self) {
        let Some(audio) = self.audio.as_mut() else {
            return;
        };
        if let Err(err) = audio.play(self.events.clone()) {
            let message = match err {
                AlarmError::AudioResource(_) => err.to_string(),
                other => format!("audio resource error: {other}"),
            };
            self.register_error(message);
        }
    }

    fn start_timer(&mut self) {
        let resource_duration = self.audio.as_ref().and_then(AudioCue::duration);
        let Some(after) = self.config.audio_duration().or(resource_duration) else {
            return;
        };
        if let Some(previous) = self.timer.take() {
            previous.cancel();
        }
        self.timer = Some(
            self.env
                .timer
                .schedule(after, TaskEvent::TimedOut, self.events.clone()),
        );
    }

    fn stop_stimuli(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.stop();
        }
    }

    fn write_record(&mut self, record: RawDataRecord) -> Result<RawDataRecord, AlarmError> {
        let timestamp_ms = self.env.clock.now_ms();
        match self.writer.as_mut() {
            Some(writer) => writer.append(record, timestamp_ms),
            None => Err(AlarmError::WriteFailure(
                "raw data file is not open".to_string(),
            )),
        }
    }

    /// Appends a record; a failed write aborts the session because recovery could no longer
    /// trust the file.
    fn append(&mut self, record: RawDataRecord) -> Result<RawDataRecord, AlarmError> {
        match self.write_record(record) {
            Ok(record) => Ok(record),
            Err(err) => {
                if err.is_fatal() {
                    self.fatal = Some(err.to_string());
                }
                self.register_error(err.to_string());
                let _ = self.abort("raw data write failure");
                Err(err)
            }
        }
    }
}

fn ms_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

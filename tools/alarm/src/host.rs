//! The seams between the controller and whatever hosts it: render commands out, lifecycle
//! notifications out, and an optional summary producer fixed at construction.

use crate::error_log::ErrorEntry;
use crate::errors::AlarmError;
use crate::runtime::Terminal;
use crate::types::{Outcome, ResponseMode, TaskState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The presentable surface: what the subject should currently see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptView {
    pub task_name: String,
    pub prompt: String,
    pub mode: ResponseMode,
    pub entered: usize,
    pub expected: usize,
    pub active: bool,
}

pub trait Presenter: Send + Sync {
    fn render(&self, view: &PromptView) -> Result<(), AlarmError>;
    fn clear(&self) -> Result<(), AlarmError>;
}

pub trait TaskObserver: Send + Sync {
    fn session_completed(&self, _outcome: Outcome) {}
    fn error_registered(&self, _entry: &ErrorEntry) {}
    fn recovery_needed(&self) {}
}

pub struct NullObserver;

impl TaskObserver for NullObserver {}

pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn render(&self, _view: &PromptView) -> Result<(), AlarmError> {
        Ok(())
    }

    fn clear(&self) -> Result<(), AlarmError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub task_name: String,
    pub state: TaskState,
    pub outcome: Option<Outcome>,
    pub elapsed: Duration,
    pub mismatches: u32,
    pub errors: usize,
    pub resumed: bool,
}

pub trait SummaryProducer: Send + Sync {
    fn summary(&self, report: &SessionReport) -> String;
}

/// Tab-separated one-line summary suitable for appending to a session data file.
pub struct TabularSummary;

impl SummaryProducer for TabularSummary {
    fn summary(&self, report: &SessionReport) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            report.task_name,
            report.outcome.map_or("none", Outcome::as_str),
            report.elapsed.as_millis(),
            report.mismatches,
            report.errors,
            if report.resumed { "resumed" } else { "fresh" },
        )
    }
}

/// Renders the prompt as plain terminal lines.
pub struct TerminalPresenter {
    terminal: Arc<dyn Terminal>,
    last: Mutex<Option<PromptView>>,
}

impl TerminalPresenter {
    pub fn new(terminal: Arc<dyn Terminal>) -> Self {
        Self {
            terminal,
            last: Mutex::new(None),
        }
    }
}

impl Presenter for TerminalPresenter {
    fn render(&self, view: &PromptView) -> Result<(), AlarmError> {
        let mut last = self.last.lock().expect("presenter lock");
        let prompt_changed = last
            .as_ref()
            .map_or(true, |previous| previous.prompt != view.prompt || !previous.active);
        if prompt_changed && view.active {
            self.terminal.write_line(&format!("[{}] {}", view.task_name, view.prompt))?;
            let hint = match view.mode {
                ResponseMode::SingleAction => "press Enter to respond".to_string(),
                ResponseMode::Sequence => format!("type the {}-key sequence", view.expected),
            };
            self.terminal.write_line(&hint)?;
        } else if view.mode == ResponseMode::Sequence && view.active {
            self.terminal
                .write_line(&format!("{}/{}", view.entered, view.expected))?;
        }
        *last = Some(view.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AlarmError> {
        let mut last = self.last.lock().expect("presenter lock");
        if last.take().is_some() {
            self.terminal.write_line("")?;
        }
        Ok(())
    }
}

use crate::errors::AlarmError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_ms: u64,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), AlarmError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AlarmError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            ts_ms: event.ts_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| AlarmError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AlarmError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| AlarmError::Io(e.to_string()))
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

pub fn init_run_logger(path: impl AsRef<Path>) {
    *logger_slot().lock().expect("run logger lock") = Some(JsonlLogger::new(path));
}

pub fn clear_run_logger() {
    *logger_slot().lock().expect("run logger lock") = None;
}

/// Appends one structured entry to the run log. A no-op until `init_run_logger` is called;
/// failures to write the run log never reach the caller.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = logger_slot().lock().expect("run logger lock").clone();
    let Some(logger) = logger else {
        return;
    };
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let _ = logger.append(&LogEvent {
        ts_ms,
        level,
        event_type,
        payload,
    });
}

pub fn structured_fallback_line(task: &str, state: &str, message: &str) -> String {
    format!(
        "task={task} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{structured_fallback_line, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                ts_ms: 7,
                level: "info",
                event_type: "alarm.prompt.shown",
                payload: json!({"prompt": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"alarm.prompt.shown\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("alarm", "prompting", "hello\nworld");
        assert_eq!(line, "task=alarm state=prompting message=hello\\nworld ");
    }
}

//! Append-only raw data file: one JSON record per line, flushed and synced before `append`
//! returns so the file always reflects the last state a crash could have left behind.

use crate::errors::AlarmError;
use crate::types::Outcome;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const DIGEST_HEX_CHARS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    PromptShown,
    Symbol,
    Response,
    Timeout,
    AudioFinished,
    Error,
    Recovered,
    Completed,
    Aborted,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptShown => "prompt-shown",
            Self::Symbol => "symbol",
            Self::Response => "response",
            Self::Timeout => "timeout",
            Self::AudioFinished => "audio-finished",
            Self::Error => "error",
            Self::Recovered => "recovered",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Terminal markers close a session in the raw data file.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataRecord {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub task: String,
    pub event: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub digest: String,
}

impl RawDataRecord {
    pub fn new(event: RecordKind) -> Self {
        Self {
            seq: 0,
            timestamp_ms: 0,
            task: String::new(),
            event,
            input: None,
            outcome: None,
            elapsed_ms: None,
            detail: None,
            digest: String::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn compute_digest(&self) -> Result<String, AlarmError> {
        let unsigned = Self {
            digest: String::new(),
            ..self.clone()
        };
        let canonical =
            serde_json::to_string(&unsigned).map_err(|e| AlarmError::Io(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let bytes = hasher.finalize();
        let mut out = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        out.truncate(DIGEST_HEX_CHARS);
        Ok(out)
    }

    pub fn verify(&self) -> bool {
        self.compute_digest()
            .map(|digest| digest == self.digest)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct RawDataWriter {
    path: PathBuf,
    task: String,
    file: Option<File>,
    next_seq: u64,
    appended: usize,
}

impl RawDataWriter {
    /// Opens (creating when needed) the raw data file in append mode. Sequence numbers continue
    /// after the highest one already present.
    pub fn open(path: impl AsRef<Path>, task: &str) -> Result<Self, AlarmError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AlarmError::WriteFailure(format!("create {}: {e}", parent.display()))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AlarmError::WriteFailure(format!("open {}: {e}", path.display())))?;
        // A torn final line must not swallow the next record.
        if ends_without_newline(&path) {
            file.write_all(b"\n")
                .map_err(|e| AlarmError::WriteFailure(format!("{}: {e}", path.display())))?;
        }
        let next_seq = last_seq(&path).map_or(1, |seq| seq + 1);
        Ok(Self {
            path,
            task: task.to_string(),
            file: Some(file),
            next_seq,
            appended: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Records written through this writer since it was opened.
    pub fn appended(&self) -> usize {
        self.appended
    }

    pub fn append(
        &mut self,
        record: RawDataRecord,
        timestamp_ms: u64,
    ) -> Result<RawDataRecord, AlarmError> {
        let Some(file) = self.file.as_mut() else {
            return Err(AlarmError::WriteFailure(format!(
                "{} is closed",
                self.path.display()
            )));
        };
        let mut record = RawDataRecord {
            seq: self.next_seq,
            timestamp_ms,
            task: self.task.clone(),
            ..record
        };
        record.digest = record.compute_digest()?;
        let line =
            serde_json::to_string(&record).map_err(|e| AlarmError::WriteFailure(e.to_string()))?;

        let write = |file: &mut File| -> std::io::Result<()> {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            file.sync_data()
        };
        write(file).map_err(|e| AlarmError::WriteFailure(format!("{}: {e}", self.path.display())))?;

        self.next_seq += 1;
        self.appended += 1;
        Ok(record)
    }

    pub fn close(&mut self) -> Result<(), AlarmError> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| AlarmError::WriteFailure(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingStatus {
    Missing,
    Empty,
    /// The last record is a terminal marker: the previous session shut down cleanly.
    Clean,
    /// The last record parses but is not terminal.
    Interrupted,
    /// The last line does not parse or verify, typically a write torn by a crash.
    Torn,
    Unreadable,
}

impl TrailingStatus {
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Interrupted | Self::Torn | Self::Unreadable)
    }
}

pub fn trailing_status(path: &Path) -> TrailingStatus {
    if !path.exists() {
        return TrailingStatus::Missing;
    }
    let Ok(text) = fs::read_to_string(path) else {
        return TrailingStatus::Unreadable;
    };
    let Some(last) = text.lines().rev().find(|line| !line.trim().is_empty()) else {
        return TrailingStatus::Empty;
    };
    match serde_json::from_str::<RawDataRecord>(last) {
        Ok(record) if !record.verify() => TrailingStatus::Torn,
        Ok(record) if record.event.is_terminal() => TrailingStatus::Clean,
        Ok(_) => TrailingStatus::Interrupted,
        Err(_) => TrailingStatus::Torn,
    }
}

/// Reads every record, failing on the first line that does not parse or verify.
pub fn read_records(path: &Path) -> Result<Vec<RawDataRecord>, AlarmError> {
    let text = read_raw_text(path)?;
    numbered_lines(&text)
        .map(|(number, line)| parse_line(number, line))
        .collect()
}

/// Reads only the records after the last verified terminal marker. Lines belonging to sessions
/// that already closed are not parsed, so a torn write there cannot block a later recovery.
pub fn read_current_session(path: &Path) -> Result<Vec<RawDataRecord>, AlarmError> {
    let text = read_raw_text(path)?;
    let lines: Vec<(usize, &str)> = numbered_lines(&text).collect();
    let start = lines
        .iter()
        .rposition(|(number, line)| {
            parse_line(*number, line).is_ok_and(|record| record.event.is_terminal())
        })
        .map_or(0, |index| index + 1);
    lines[start..]
        .iter()
        .map(|(number, line)| parse_line(*number, line))
        .collect()
}

fn read_raw_text(path: &Path) -> Result<String, AlarmError> {
    fs::read_to_string(path)
        .map_err(|e| AlarmError::Recovery(format!("cannot read {}: {e}", path.display())))
}

/// Non-blank lines with their 1-based line numbers.
fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| (index + 1, line))
}

fn parse_line(number: usize, line: &str) -> Result<RawDataRecord, AlarmError> {
    let record: RawDataRecord = serde_json::from_str(line)
        .map_err(|e| AlarmError::Recovery(format!("corrupt record at line {number}: {e}")))?;
    if !record.verify() {
        return Err(AlarmError::Recovery(format!(
            "digest mismatch at line {number}"
        )));
    }
    Ok(record)
}

fn ends_without_newline(path: &Path) -> bool {
    fs::read(path)
        .ok()
        .and_then(|bytes| bytes.last().copied())
        .is_some_and(|last| last != b'\n')
}

fn last_seq(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .filter_map(|line| serde_json::from_str::<RawDataRecord>(line).ok())
        .map(|record| record.seq)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_session(path: &Path, kinds: &[RecordKind]) {
        let mut writer = RawDataWriter::open(path, "alarm").expect("open");
        for (i, kind) in kinds.iter().enumerate() {
            writer
                .append(RawDataRecord::new(*kind), 1_000 + i as u64)
                .expect("append");
        }
        writer.close().expect("close");
    }

    #[test]
    fn appended_records_are_durable_and_sequenced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("alarm_raw.jsonl");
        let mut writer = RawDataWriter::open(&path, "alarm").expect("open");
        let first = writer
            .append(
                RawDataRecord::new(RecordKind::Symbol).with_input("12"),
                5,
            )
            .expect("append");
        // Visible to a reader before the writer is closed.
        let records = read_records(&path).expect("read");
        assert_eq!(records, vec![first.clone()]);
        assert_eq!(first.seq, 1);
        assert_eq!(first.task, "alarm");
        assert_eq!(first.digest.len(), 16);
        assert_eq!(writer.appended(), 1);
    }

    #[test]
    fn reopened_writer_continues_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        write_session(&path, &[RecordKind::PromptShown, RecordKind::Completed]);
        let mut writer = RawDataWriter::open(&path, "alarm").expect("reopen");
        let next = writer
            .append(RawDataRecord::new(RecordKind::PromptShown), 9)
            .expect("append");
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn reopening_after_a_torn_line_starts_a_fresh_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        write_session(&path, &[RecordKind::PromptShown]);
        let mut text = fs::read_to_string(&path).expect("read");
        text.push_str("{\"seq\":2,\"ev");
        fs::write(&path, text).expect("torn");

        let mut writer = RawDataWriter::open(&path, "alarm").expect("reopen");
        writer
            .append(RawDataRecord::new(RecordKind::Aborted), 5)
            .expect("append");
        assert_eq!(trailing_status(&path), TrailingStatus::Clean);
        let lines = fs::read_to_string(&path).expect("read");
        assert_eq!(lines.lines().count(), 3);
    }

    #[test]
    fn closed_writer_refuses_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = RawDataWriter::open(dir.path().join("a.jsonl"), "alarm").expect("open");
        writer.close().expect("close");
        writer.close().expect("close twice");
        let err = writer
            .append(RawDataRecord::new(RecordKind::Error), 1)
            .expect_err("closed");
        assert!(matches!(err, AlarmError::WriteFailure(_)));
    }

    #[test]
    fn trailing_status_tracks_terminal_markers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        assert_eq!(trailing_status(&path), TrailingStatus::Missing);

        fs::write(&path, "").expect("empty");
        assert_eq!(trailing_status(&path), TrailingStatus::Empty);

        write_session(&path, &[RecordKind::PromptShown]);
        assert_eq!(trailing_status(&path), TrailingStatus::Interrupted);
        assert!(trailing_status(&path).needs_recovery());

        write_session(&path, &[RecordKind::Aborted]);
        assert_eq!(trailing_status(&path), TrailingStatus::Clean);

        let mut text = fs::read_to_string(&path).expect("read");
        text.push_str("{\"seq\":9,\"timesta");
        fs::write(&path, text).expect("torn");
        assert_eq!(trailing_status(&path), TrailingStatus::Torn);
    }

    #[test]
    fn damage_in_a_closed_session_does_not_hide_the_current_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        write_session(&path, &[RecordKind::PromptShown]);
        let mut text = fs::read_to_string(&path).expect("read");
        text.push_str("{\"seq\":2,\"ev\n");
        fs::write(&path, text).expect("torn");
        write_session(
            &path,
            &[
                RecordKind::Aborted,
                RecordKind::PromptShown,
                RecordKind::Response,
            ],
        );

        assert!(read_records(&path).is_err());
        let current = read_current_session(&path).expect("current session");
        let kinds: Vec<RecordKind> = current.iter().map(|record| record.event).collect();
        assert_eq!(kinds, vec![RecordKind::PromptShown, RecordKind::Response]);
    }

    #[test]
    fn damage_in_the_current_session_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        write_session(&path, &[RecordKind::Completed, RecordKind::PromptShown]);
        let mut text = fs::read_to_string(&path).expect("read");
        text.push_str("{\"seq\":3,\"ev");
        fs::write(&path, text).expect("torn");

        let err = read_current_session(&path).expect_err("torn current session");
        assert!(matches!(err, AlarmError::Recovery(message) if message.contains("line 3")));
    }

    #[test]
    fn tampered_record_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm_raw.jsonl");
        write_session(&path, &[RecordKind::PromptShown, RecordKind::Symbol]);
        let text = fs::read_to_string(&path)
            .expect("read")
            .replace("\"symbol\"", "\"response\"");
        fs::write(&path, text).expect("tamper");

        let err = read_records(&path).expect_err("corrupt");
        assert!(matches!(err, AlarmError::Recovery(message) if message.contains("line 2")));
        assert_eq!(trailing_status(&path), TrailingStatus::Torn);
    }
}

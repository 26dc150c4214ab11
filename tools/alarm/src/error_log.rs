use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub timestamp_ms: u64,
    pub message: String,
}

impl ErrorEntry {
    pub fn render(&self) -> String {
        format!("{}: {}", self.timestamp_ms, self.message)
    }
}

/// Append-only error log shared between the event thread and any reporting thread.
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<ErrorEntry>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicked reader must not stop later errors from being recorded.
    fn lock_entries(&self) -> MutexGuard<'_, Vec<ErrorEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, timestamp_ms: u64, message: impl Into<String>) -> ErrorEntry {
        let entry = ErrorEntry {
            timestamp_ms,
            message: message.into(),
        };
        self.lock_entries()
            .push(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.lock_entries().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first, one `timestamp: message` per line.
    pub fn formatted(&self) -> String {
        self.lock_entries()
            .iter()
            .map(ErrorEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorLog;

    #[test]
    fn formats_oldest_first() {
        let log = ErrorLog::new();
        assert_eq!(log.formatted(), "");
        log.push(10, "audio missing");
        log.push(20, "sequence mismatch");
        assert_eq!(log.formatted(), "10: audio missing\n20: sequence mismatch");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn clones_share_entries_across_threads() {
        let log = ErrorLog::new();
        let reporter = log.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..50 {
                log.push(i, format!("error {i}"));
            }
        });
        writer.join().expect("join");
        assert_eq!(reporter.len(), 50);
        assert!(reporter.formatted().starts_with("0: error 0\n1: error 1"));
    }

    #[test]
    fn poisoned_lock_still_accepts_entries() {
        let log = ErrorLog::new();
        log.push(1, "before");
        let poisoner = log.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock();
            panic!("reporter crashed while holding the log");
        })
        .join();
        assert!(log.entries.is_poisoned());

        let entry = log.push(2, "after");
        assert_eq!(entry.message, "after");
        assert_eq!(log.len(), 2);
        assert_eq!(log.formatted(), "1: before\n2: after");
    }
}

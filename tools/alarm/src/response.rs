use crate::errors::AlarmError;
use crate::types::ResponseMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Input after the collector already resolved.
    Ignored,
    /// Input that this mode does not accept.
    Rejected(String),
    /// Single-action mode received its qualifying input.
    Responded,
    Progress { matched: usize },
    /// The buffer was cleared. `restarted` is true when the offending symbol began a new attempt.
    Mismatch { error: AlarmError, restarted: bool },
    Matched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceMatcher {
    target: Vec<char>,
    buffer: Vec<char>,
    complete: bool,
}

impl SequenceMatcher {
    pub fn new(target: Vec<char>) -> Self {
        Self {
            target,
            buffer: Vec::new(),
            complete: false,
        }
    }

    fn push(&mut self, symbol: char) -> Verdict {
        if self.complete {
            return Verdict::Ignored;
        }
        let position = self.buffer.len();
        let Some(&expected) = self.target.get(position) else {
            return Verdict::Ignored;
        };

        if expected == symbol {
            self.buffer.push(symbol);
            if self.buffer.len() == self.target.len() {
                self.complete = true;
                return Verdict::Matched;
            }
            return Verdict::Progress {
                matched: self.buffer.len(),
            };
        }

        self.buffer.clear();
        let restarted = position > 0 && self.target.first() == Some(&symbol);
        if restarted {
            self.buffer.push(symbol);
        }
        Verdict::Mismatch {
            error: AlarmError::SequenceMismatch {
                position,
                expected,
                received: symbol,
            },
            restarted,
        }
    }
}

/// Captures the subject's response in the mode the configuration selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCollector {
    SingleAction { responded: bool },
    Sequence(SequenceMatcher),
}

impl ResponseCollector {
    pub fn new(mode: ResponseMode, target: Vec<char>) -> Self {
        match mode {
            ResponseMode::SingleAction => Self::SingleAction { responded: false },
            ResponseMode::Sequence => Self::Sequence(SequenceMatcher::new(target)),
        }
    }

    pub fn mode(&self) -> ResponseMode {
        match self {
            Self::SingleAction { .. } => ResponseMode::SingleAction,
            Self::Sequence(_) => ResponseMode::Sequence,
        }
    }

    pub fn on_action(&mut self) -> Verdict {
        match self {
            Self::SingleAction { responded } => respond_once(responded),
            Self::Sequence(matcher) if matcher.complete => Verdict::Ignored,
            Self::Sequence(_) => {
                Verdict::Rejected("button press ignored: a key sequence is required".to_string())
            }
        }
    }

    /// In single-action mode any key counts as the response.
    pub fn on_symbol(&mut self, symbol: char) -> Verdict {
        match self {
            Self::SingleAction { responded } => respond_once(responded),
            Self::Sequence(matcher) => matcher.push(symbol),
        }
    }

    /// Clears partial input and re-arms the collector without ending the session.
    pub fn reset(&mut self) {
        match self {
            Self::SingleAction { responded } => *responded = false,
            Self::Sequence(matcher) => {
                matcher.buffer.clear();
                matcher.complete = false;
            }
        }
    }

    pub fn buffer(&self) -> &[char] {
        match self {
            Self::SingleAction { .. } => &[],
            Self::Sequence(matcher) => &matcher.buffer,
        }
    }

    pub fn buffer_string(&self) -> String {
        self.buffer().iter().collect()
    }
}

fn respond_once(responded: &mut bool) -> Verdict {
    if *responded {
        return Verdict::Ignored;
    }
    *responded = true;
    Verdict::Responded
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static SIGNAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"<chorus>([A-Z_]+)(?::([^<]*))?</chorus>").expect("signal regex is valid")
});

/// Kind of signal an agent can emit on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// The agent believes the task is finished.
    Complete,
    /// The agent cannot continue; payload carries the reason.
    Blocked,
    /// The agent has a question for the operator.
    NeedsHelp,
    /// Progress report, payload is 0-100.
    Progress,
    /// A conflict-resolution agent resolved the merge conflict.
    Resolved,
    /// A conflict-resolution agent gave up and wants a human.
    NeedsHuman,
}

impl SignalType {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "COMPLETE" => Some(Self::Complete),
            "BLOCKED" => Some(Self::Blocked),
            "NEEDS_HELP" => Some(Self::NeedsHelp),
            "PROGRESS" => Some(Self::Progress),
            "RESOLVED" => Some(Self::Resolved),
            "NEEDS_HUMAN" => Some(Self::NeedsHuman),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Complete => write!(f, "COMPLETE"),
            SignalType::Blocked => write!(f, "BLOCKED"),
            SignalType::NeedsHelp => write!(f, "NEEDS_HELP"),
            SignalType::Progress => write!(f, "PROGRESS"),
            SignalType::Resolved => write!(f, "RESOLVED"),
            SignalType::NeedsHuman => write!(f, "NEEDS_HUMAN"),
        }
    }
}

/// A signal extracted from agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal kind.
    #[serde(rename = "type")]
    pub kind: SignalType,
    /// Text after the colon, if any.
    pub payload: Option<String>,
}

impl Signal {
    /// Progress percentage for a `PROGRESS` signal, if the payload is a valid 0-100 integer.
    pub fn progress(&self) -> Option<u8> {
        if self.kind != SignalType::Progress {
            return None;
        }
        self.payload
            .as_deref()
            .and_then(|p| p.trim().parse::<u8>().ok())
            .filter(|p| *p <= 100)
    }
}

/// Scans agent stdout for `<chorus>TYPE[:payload]</chorus>` tags.
///
/// Unknown tag types are ignored rather than reported, so agents can be
/// upgraded independently of the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalParser;

impl SignalParser {
    /// Create a parser.
    pub fn new() -> Self {
        Self
    }

    /// First recognised signal in `output`.
    pub fn parse(&self, output: &str) -> Option<Signal> {
        self.iter(output).next()
    }

    /// Every recognised signal in `output`, in order of appearance.
    pub fn parse_all(&self, output: &str) -> Vec<Signal> {
        self.iter(output).collect()
    }

    /// Whether `output` contains a `COMPLETE` signal.
    pub fn is_complete(&self, output: &str) -> bool {
        self.iter(output).any(|s| s.kind == SignalType::Complete)
    }

    /// Whether `output` contains a `BLOCKED` signal.
    pub fn is_blocked(&self, output: &str) -> bool {
        self.iter(output).any(|s| s.kind == SignalType::Blocked)
    }

    /// Reason of the first `BLOCKED` signal in `output`.
    pub fn blocked_reason(&self, output: &str) -> Option<String> {
        self.iter(output)
            .find(|s| s.kind == SignalType::Blocked)
            .map(|s| s.payload.unwrap_or_default())
    }

    fn iter<'a>(&self, output: &'a str) -> impl Iterator<Item = Signal> + 'a {
        SIGNAL_RE.captures_iter(output).filter_map(|caps| {
            let kind = SignalType::from_tag(caps.get(1)?.as_str())?;
            let payload = caps.get(2).map(|m| m.as_str().trim().to_string());
            Some(Signal { kind, payload })
        })
    }
}

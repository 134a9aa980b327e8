use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Files that are always safe to resolve by taking one side wholesale.
pub const SIMPLE_FILES: &[&str] = &[
    ".beads/issues.jsonl",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    ".agent/learnings.md",
];

static SIMPLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\.generated\.", r"\.min\.(js|css)$", r"\.lock$"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Severity of a merge conflict. Ordered: `Simple < Medium < Complex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Lockfiles, generated files and other allow-listed paths.
    Simple,
    /// Edits in different regions of the same file.
    Medium,
    /// Overlapping edits, or flagged as a semantic conflict.
    Complex,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictType::Simple => write!(f, "SIMPLE"),
            ConflictType::Medium => write!(f, "MEDIUM"),
            ConflictType::Complex => write!(f, "COMPLEX"),
        }
    }
}

/// How the pipeline should try to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Deterministic resolution, then retry.
    Auto,
    /// Rebase the branch onto the target, then retry.
    Rebase,
    /// Hand the conflict to a resolver agent.
    Agent,
    /// Escalate to the operator.
    Human,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Auto => write!(f, "auto"),
            Strategy::Rebase => write!(f, "rebase"),
            Strategy::Agent => write!(f, "agent"),
            Strategy::Human => write!(f, "human"),
        }
    }
}

/// Inclusive line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    /// First line.
    pub start: u32,
    /// Last line.
    pub end: u32,
}

impl LineRange {
    /// Create a range covering `start..=end`.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether the two ranges share at least one line.
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Extra information about one conflicting file, supplied by a
/// [`crate::ConflictInspector`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Path relative to the repository root.
    pub file: String,
    /// Lines changed on the target side.
    pub our_changes: Option<LineRange>,
    /// Lines changed on the incoming branch.
    pub their_changes: Option<LineRange>,
    /// Set by external analysis; never computed here.
    #[serde(default)]
    pub semantic_conflict: bool,
}

/// Per-file classification and the worst case across files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    /// Class of each conflicting file.
    pub files: Vec<(String, ConflictType)>,
    /// Worst class across files.
    pub overall: ConflictType,
}

/// Deterministic conflict classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictClassifier;

impl ConflictClassifier {
    /// Create a classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classify one file.
    pub fn classify_file(&self, file: &str, info: Option<&ConflictInfo>) -> ConflictType {
        if self.is_simple_path(file) {
            return ConflictType::Simple;
        }
        let Some(info) = info else {
            return ConflictType::Medium;
        };
        if info.semantic_conflict {
            return ConflictType::Complex;
        }
        if let (Some(ours), Some(theirs)) = (&info.our_changes, &info.their_changes) {
            if ours.overlaps(theirs) {
                return ConflictType::Complex;
            }
        }
        ConflictType::Medium
    }

    /// Classify every file; `infos` are matched by file name.
    pub fn analyze(&self, files: &[String], infos: &[ConflictInfo]) -> ConflictAnalysis {
        let files: Vec<(String, ConflictType)> = files
            .iter()
            .map(|file| {
                let info = infos.iter().find(|i| &i.file == file);
                (file.clone(), self.classify_file(file, info))
            })
            .collect();
        let overall = files
            .iter()
            .map(|(_, t)| *t)
            .max()
            .unwrap_or(ConflictType::Simple);
        ConflictAnalysis { files, overall }
    }

    /// Strategy for a classification. A failed agent attempt turns `Complex` into `Human`.
    pub fn suggested_strategy(&self, kind: ConflictType, agent_failed: bool) -> Strategy {
        match kind {
            ConflictType::Simple => Strategy::Auto,
            ConflictType::Medium => Strategy::Rebase,
            ConflictType::Complex if agent_failed => Strategy::Human,
            ConflictType::Complex => Strategy::Agent,
        }
    }

    /// Whether `file` is on the allow-list or matches a generated/lockfile pattern.
    pub fn is_simple_path(&self, file: &str) -> bool {
        SIMPLE_FILES.contains(&file) || SIMPLE_PATTERNS.iter().any(|re| re.is_match(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlapping(file: &str) -> ConflictInfo {
        ConflictInfo {
            file: file.into(),
            our_changes: Some(LineRange::new(10, 20)),
            their_changes: Some(LineRange::new(15, 30)),
            semantic_conflict: false,
        }
    }

    #[test]
    fn test_simple_files() {
        let c = ConflictClassifier::new();
        assert_eq!(c.classify_file(".beads/issues.jsonl", None), ConflictType::Simple);
        assert_eq!(c.classify_file("Cargo.lock", None), ConflictType::Simple);
        assert_eq!(c.classify_file("dist/app.min.js", None), ConflictType::Simple);
        assert_eq!(c.classify_file("src/api.generated.ts", None), ConflictType::Simple);
        // Allow-listed paths stay simple even with overlapping ranges.
        assert_eq!(
            c.classify_file("yarn.lock", Some(&overlapping("yarn.lock"))),
            ConflictType::Simple
        );
    }

    #[test]
    fn test_overlap_is_complex() {
        let c = ConflictClassifier::new();
        assert_eq!(
            c.classify_file("src/main.rs", Some(&overlapping("src/main.rs"))),
            ConflictType::Complex
        );
        let apart = ConflictInfo {
            file: "src/main.rs".into(),
            our_changes: Some(LineRange::new(1, 5)),
            their_changes: Some(LineRange::new(6, 9)),
            semantic_conflict: false,
        };
        assert_eq!(c.classify_file("src/main.rs", Some(&apart)), ConflictType::Medium);
        assert_eq!(c.classify_file("src/main.rs", None), ConflictType::Medium);
    }

    #[test]
    fn test_semantic_flag_is_complex() {
        let c = ConflictClassifier::new();
        let info = ConflictInfo {
            file: "src/lib.rs".into(),
            semantic_conflict: true,
            ..ConflictInfo::default()
        };
        assert_eq!(c.classify_file("src/lib.rs", Some(&info)), ConflictType::Complex);
    }

    #[test]
    fn test_analyze_takes_worst() {
        let c = ConflictClassifier::new();
        let files = vec!["package-lock.json".to_string(), "src/a.rs".to_string()];
        let analysis = c.analyze(&files, &[]);
        assert_eq!(analysis.overall, ConflictType::Medium);
        let analysis = c.analyze(&files, &[overlapping("src/a.rs")]);
        assert_eq!(analysis.overall, ConflictType::Complex);
        assert_eq!(analysis.files[0].1, ConflictType::Simple);
        let analysis = c.analyze(&files[..1], &[]);
        assert_eq!(analysis.overall, ConflictType::Simple);
    }

    #[test]
    fn test_strategies() {
        let c = ConflictClassifier::new();
        assert_eq!(c.suggested_strategy(ConflictType::Simple, false), Strategy::Auto);
        assert_eq!(c.suggested_strategy(ConflictType::Medium, true), Strategy::Rebase);
        assert_eq!(c.suggested_strategy(ConflictType::Complex, false), Strategy::Agent);
        assert_eq!(c.suggested_strategy(ConflictType::Complex, true), Strategy::Human);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let c = ConflictClassifier::new();
        let info = overlapping("x.rs");
        let first = c.classify_file("x.rs", Some(&info));
        for _ in 0..10 {
            assert_eq!(c.classify_file("x.rs", Some(&info)), first);
        }
    }
}

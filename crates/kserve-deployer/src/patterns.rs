//! Checkpoint location extraction from training log lines.
//!
//! Patterns are tried in declared order and the first match wins. The trailing
//! patterns capture a checkpoint *file*; their match is turned into the file's
//! directory by [`CheckpointPatternMatcher::classify_and_extract_directory`].

use std::path::Path;

use regex::Regex;
use tracing::{debug, warn};

/// File extensions that identify a checkpoint file.
pub const CHECKPOINT_EXTENSIONS: &[&str] = &["ckpt", "pt", "pth", "bin", "safetensors"];

/// Directory-capturing patterns, highest priority first.
const DIRECTORY_PATTERNS: &[&str] = &[
    r#"(?i)sav(?:e|ing|ed)\s+(?:the\s+)?(?:model\s+)?checkpoints?\s+(?:to|at|in|into)\s*:?\s+['"]?([^\s'"]+)"#,
    r#"(?i)sav(?:e|ing|ed)\s+(?:the\s+)?(?:final\s+|best\s+)?model\s+(?:weights\s+)?(?:to|at|in|into)\s*:?\s+['"]?([^\s'"]+)"#,
    r#"(?i)checkpoints?\s+(?:was\s+|is\s+)?sav(?:ed|ing)\s+(?:to|at|in|into)\s*:?\s+['"]?([^\s'"]+)"#,
    r#"(?i)model\s+(?:was\s+|is\s+)?sav(?:ed|ing)\s+(?:to|at|in|into)\s*:?\s+['"]?([^\s'"]+)"#,
];

/// File-capturing patterns, tried after every directory pattern.
const FILE_PATTERNS: &[&str] = &[
    r#"(?i)sav(?:e|ing|ed)\b.*?\b(?:to|at|in|into)\s*:?\s+['"]?([^\s'"]+\.(?:ckpt|pt|pth|bin|safetensors))\b"#,
    r#"(?i)(?:sav(?:e|ing|ed)\s+(?:the\s+)?(?:model\s+)?(?:checkpoint|model|weights)|(?:checkpoint|model|weights)\b[^/]*?\bsav(?:e|ing|ed))\b.*?['"]?(/[^\s'"]+\.(?:ckpt|pt|pth|bin|safetensors))\b"#,
];

/// A raw path captured from a log line, tagged with the pattern that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub raw_path: String,
    pub pattern_index: usize,
}

/// Ordered set of checkpoint log patterns.
#[derive(Debug, Clone)]
pub struct CheckpointPatternMatcher {
    patterns: Vec<Regex>,
    /// Index of the first file-capturing pattern
    file_patterns_start: usize,
}

impl Default for CheckpointPatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointPatternMatcher {
    /// Build the matcher with the built-in pattern set.
    #[must_use]
    pub fn new() -> Self {
        let mut patterns: Vec<Regex> = DIRECTORY_PATTERNS.iter().filter_map(|p| compile(p)).collect();
        let file_patterns_start = patterns.len();
        patterns.extend(FILE_PATTERNS.iter().filter_map(|p| compile(p)));

        Self {
            patterns,
            file_patterns_start,
        }
    }

    /// Number of patterns, directory and file patterns combined.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `pattern_index` belongs to the file-capturing subset.
    pub fn is_file_pattern(&self, pattern_index: usize) -> bool {
        pattern_index >= self.file_patterns_start && pattern_index < self.patterns.len()
    }

    /// Apply the patterns to one line, returning the first match.
    ///
    /// A directory pattern whose capture ends in a checkpoint file extension is
    /// not a directory match; the file patterns get to claim that line instead.
    pub fn match_line(&self, line: &str) -> Option<PatternMatch> {
        for (pattern_index, pattern) in self.patterns.iter().enumerate() {
            let Some(captures) = pattern.captures(line) else {
                continue;
            };
            let Some(raw) = captures.get(1) else {
                continue;
            };
            let raw_path = trim_trailing_punctuation(raw.as_str());
            if raw_path.is_empty() {
                continue;
            }
            if !self.is_file_pattern(pattern_index) && has_checkpoint_extension(raw_path) {
                continue;
            }
            return Some(PatternMatch {
                raw_path: raw_path.to_string(),
                pattern_index,
            });
        }
        None
    }

    /// Turn a raw match into a checkpoint directory, or reject it.
    pub fn classify_and_extract_directory(
        &self,
        raw_path: &str,
        pattern_index: usize,
    ) -> Option<String> {
        if !raw_path.starts_with('/') {
            debug!(path = %raw_path, "Rejecting relative checkpoint path");
            return None;
        }

        if self.is_file_pattern(pattern_index) {
            let parent = Path::new(raw_path).parent()?.to_str()?;
            if parent.is_empty() || parent == "/" {
                return None;
            }
            return Some(parent.to_string());
        }

        let last_segment = raw_path.rsplit('/').next().unwrap_or_default();
        if has_short_extension(last_segment) {
            debug!(path = %raw_path, "Rejecting directory match that looks like a file");
            return None;
        }
        Some(raw_path.to_string())
    }

    /// Match and classify in one step.
    pub fn extract_directory(&self, line: &str) -> Option<String> {
        let found = self.match_line(line)?;
        self.classify_and_extract_directory(&found.raw_path, found.pattern_index)
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| warn!(pattern = %pattern, error = %e, "Skipping invalid checkpoint pattern"))
        .ok()
}

/// `name.ext` with a 2-4 letter extension, e.g. `config.json` or `run.log`.
fn has_short_extension(segment: &str) -> bool {
    segment.rsplit_once('.').is_some_and(|(_, ext)| {
        (2..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphabetic())
    })
}

fn trim_trailing_punctuation(raw: &str) -> &str {
    raw.trim_end_matches(['.', ',', ';', ':', ')', ']', '!'])
}

fn has_checkpoint_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            CHECKPOINT_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_pattern_index(matcher: &CheckpointPatternMatcher) -> usize {
        (0..matcher.len())
            .find(|i| matcher.is_file_pattern(*i))
            .unwrap()
    }

    #[test]
    fn all_patterns_compile() {
        let matcher = CheckpointPatternMatcher::new();
        assert_eq!(matcher.len(), DIRECTORY_PATTERNS.len() + FILE_PATTERNS.len());
    }

    #[test]
    fn matches_transformers_style_line() {
        let matcher = CheckpointPatternMatcher::new();
        let found = matcher
            .match_line("Saving model checkpoint to /opt/model-dir/checkpoint-200")
            .unwrap();
        assert_eq!(found.raw_path, "/opt/model-dir/checkpoint-200");
        assert!(!matcher.is_file_pattern(found.pattern_index));
        assert_eq!(
            matcher.extract_directory("Saving model checkpoint to /opt/model-dir/checkpoint-200"),
            Some("/opt/model-dir/checkpoint-200".to_string())
        );
    }

    #[test]
    fn matching_is_case_insensitive_and_ignores_timestamps() {
        let matcher = CheckpointPatternMatcher::new();
        let line = "2024-05-01T10:00:00.123Z [INFO] CHECKPOINT SAVED TO '/mnt/ckpt/step-10'.";
        assert_eq!(
            matcher.extract_directory(line),
            Some("/mnt/ckpt/step-10".to_string())
        );
    }

    #[test]
    fn file_match_yields_parent_directory() {
        let matcher = CheckpointPatternMatcher::new();
        let line = "Saved checkpoint to /opt/data/run-3/model.safetensors";
        let found = matcher.match_line(line).unwrap();
        assert!(matcher.is_file_pattern(found.pattern_index));
        assert_eq!(found.raw_path, "/opt/data/run-3/model.safetensors");
        assert_eq!(
            matcher.extract_directory(line),
            Some("/opt/data/run-3".to_string())
        );
    }

    #[test]
    fn classify_file_pattern_paths() {
        let matcher = CheckpointPatternMatcher::new();
        let index = file_pattern_index(&matcher);
        assert_eq!(
            matcher.classify_and_extract_directory("/a/b/model.ckpt", index),
            Some("/a/b".to_string())
        );
        assert_eq!(matcher.classify_and_extract_directory("model.ckpt", index), None);
        assert_eq!(matcher.classify_and_extract_directory("/model.ckpt", index), None);
    }

    #[test]
    fn classify_directory_rejects_file_like_suffix() {
        let matcher = CheckpointPatternMatcher::new();
        assert_eq!(
            matcher.classify_and_extract_directory("/out/results.json", 0),
            None
        );
        assert_eq!(
            matcher.classify_and_extract_directory("relative/ckpt-1", 0),
            None
        );
        assert_eq!(
            matcher.classify_and_extract_directory("/out/checkpoint-1500", 0),
            Some("/out/checkpoint-1500".to_string())
        );
    }

    #[test]
    fn unrelated_lines_do_not_match() {
        let matcher = CheckpointPatternMatcher::new();
        assert!(matcher.match_line("epoch 3 loss=0.123").is_none());
        assert!(matcher.match_line("").is_none());
        assert!(matcher.match_line("Loading checkpoint shards: 100%").is_none());
    }

    #[test]
    fn saved_file_without_preposition() {
        let matcher = CheckpointPatternMatcher::new();
        assert_eq!(
            matcher.extract_directory("Model weights saved: /out/run-1/model.pt"),
            Some("/out/run-1".to_string())
        );
        assert_eq!(
            matcher.extract_directory("Saving checkpoint /ckpt/run/last.ckpt"),
            Some("/ckpt/run".to_string())
        );
    }

    #[test]
    fn loaded_weights_are_not_checkpoints() {
        let matcher = CheckpointPatternMatcher::new();
        for line in [
            "loading weights file pytorch_model.bin from cache at /root/.cache/huggingface/hub/models--gpt2/snapshots/abc/pytorch_model.bin",
            "Loading checkpoint from /pretrained/base/model.pt",
            "Restoring model weights from /ckpt/run/last.ckpt",
        ] {
            assert_eq!(matcher.extract_directory(line), None, "{line}");
        }
    }

    #[test]
    fn first_pattern_wins_per_line() {
        let matcher = CheckpointPatternMatcher::new();
        let line = "Saving model checkpoint to /a/ckpt-1 and model saved to /b/ckpt-2";
        let found = matcher.match_line(line).unwrap();
        assert_eq!(found.pattern_index, 0);
        assert_eq!(found.raw_path, "/a/ckpt-1");
    }
}

//! Resource naming for InferenceServices derived from checkpoint paths.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const FALLBACK_NAME: &str = "model";
const HASH_LENGTH: usize = 8;

/// Turn an arbitrary checkpoint path into a legal resource name.
///
/// Only the final path segment is used. The result always matches
/// `^[a-z0-9][a-z0-9-]{0,62}$` and `sanitize(sanitize(x)) == sanitize(x)`.
///
/// Names longer than 63 characters are cut and suffixed with a short hash of
/// the untruncated name so distinct long names stay distinct.
pub fn sanitize(raw: &str) -> String {
    let segment = raw
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    let mut name = String::with_capacity(segment.len());
    for c in segment.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }

    // Trimming leaves an alphanumeric first character, so no prefix is needed.
    let name = name.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    ensure_k8s_name_length(name)
}

/// Whether `name` is already a legal resource name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_K8S_NAME_LENGTH
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn ensure_k8s_name_length(name: &str) -> String {
    if name.len() <= MAX_K8S_NAME_LENGTH {
        return name.to_string();
    }

    // ASCII only at this point, so byte slicing is char slicing.
    let keep = MAX_K8S_NAME_LENGTH - HASH_LENGTH - 1;
    let prefix = name[..keep].trim_end_matches('-');
    format!("{prefix}-{}", hash_string(name))
}

fn hash_string(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())[..HASH_LENGTH].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_final_segment_only() {
        assert_eq!(sanitize("/opt/model-dir/checkpoint-200"), "checkpoint-200");
        assert_eq!(sanitize("/opt/model-dir/checkpoint-200/"), "checkpoint-200");
    }

    #[test]
    fn replaces_and_collapses_illegal_runs() {
        assert_eq!(sanitize("My_Model  v1.5"), "my-model-v1-5");
        assert_eq!(sanitize("a__--__b"), "a-b");
        assert_eq!(sanitize("--ckpt--"), "ckpt");
    }

    #[test]
    fn leading_punctuation_is_stripped() {
        assert_eq!(sanitize("/ckpt/.hidden_ckpt"), "hidden-ckpt");
        assert_eq!(sanitize("_-_42-final"), "42-final");
        assert!(is_valid_name(&sanitize("/ckpt/...Step=10")));
    }

    #[test]
    fn empty_input_falls_back() {
        assert_eq!(sanitize(""), FALLBACK_NAME);
        assert_eq!(sanitize("/"), FALLBACK_NAME);
        assert_eq!(sanitize("/data/___/"), FALLBACK_NAME);
        assert_eq!(sanitize("检查点"), FALLBACK_NAME);
    }

    #[test]
    fn long_names_are_truncated_with_marker() {
        let long = format!("/ckpt/{}", "step".repeat(40));
        let name = sanitize(&long);
        assert_eq!(name.len(), MAX_K8S_NAME_LENGTH);
        assert!(name.starts_with("stepstep"));
        assert!(is_valid_name(&name));
        assert_eq!(sanitize(&name), name);

        let other = sanitize(&format!("/ckpt/{}x", "step".repeat(40)));
        assert_ne!(name, other);
    }

    #[test]
    fn truncation_never_leaves_double_dash() {
        let raw = format!("{}-{}", "a".repeat(53), "b".repeat(30));
        let name = sanitize(&raw);
        assert!(!name.contains("--"));
        assert!(name.len() <= MAX_K8S_NAME_LENGTH);
    }

    #[test]
    fn idempotent_on_examples() {
        for raw in ["/x/Checkpoint_100", "", "ÄÖÜ", "123", "-a-", "a.b.c/"] {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn valid_name_check() {
        assert!(is_valid_name("my-service"));
        assert!(is_valid_name("7b"));
        assert!(!is_valid_name("My-Service"));
        assert!(!is_valid_name("-svc"));
        assert!(!is_valid_name("svc-"));
        assert!(!is_valid_name(&"a".repeat(64)));
    }
}

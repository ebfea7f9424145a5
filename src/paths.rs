//! Repository path mapping and normalisation.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};

/// Longest repository name accepted by the supported target registries.
const MAX_REPO_NAME_LENGTH: usize = 256;

static REPO_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_/.-]").expect("static pattern"));

/// A replacement rule for repository paths. When `regex` is set `from` is
/// treated as a regular expression and replacement uses
/// `Regex::replace_all`, otherwise a simple prefix substitution is applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
    pub regex: bool,
}

enum CompiledRule {
    Prefix { from: String, to: String },
    Regex { pattern: Regex, to: String },
}

/// Applies ordered path mappings and then cleans the result for use in
/// target registries. The first matching rule wins.
pub struct RepoPathTransformer {
    rules: Vec<CompiledRule>,
}

impl RepoPathTransformer {
    pub fn new(mappings: &[PathMapping]) -> Self {
        let mut rules = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if mapping.regex {
                match Regex::new(&mapping.from) {
                    Ok(pattern) => rules.push(CompiledRule::Regex {
                        pattern,
                        to: mapping.to.clone(),
                    }),
                    // invalid regex rules are skipped
                    Err(_) => continue,
                }
            } else {
                rules.push(CompiledRule::Prefix {
                    from: mapping.from.clone(),
                    to: mapping.to.clone(),
                });
            }
        }
        Self { rules }
    }

    pub fn apply(&self, path: &str) -> String {
        let mut out = path.to_owned();
        for rule in &self.rules {
            match rule {
                CompiledRule::Regex { pattern, to } => {
                    if pattern.is_match(&out) {
                        out = pattern.replace_all(&out, to.as_str()).into_owned();
                        break;
                    }
                }
                CompiledRule::Prefix { from, to } => {
                    if let Some(stripped) = out.strip_prefix(from.as_str()) {
                        out = if to.is_empty() {
                            stripped.to_owned()
                        } else {
                            format!("{}/{}", to.trim_end_matches('/'), stripped)
                        };
                        break;
                    }
                }
            }
        }
        clean_repo_name(&out)
    }
}

/// Normalises a repository path into a registry-safe name: lowercased,
/// disallowed characters replaced with `-`, stripped of leading and trailing
/// `-/.`, never empty, never longer than 256 characters. Overlong names are
/// truncated with a 12-character hash suffix so distinct inputs stay distinct.
pub fn clean_repo_name(path: &str) -> String {
    let lowered = path.trim_start_matches('/').to_lowercase();
    let replaced = REPO_DISALLOWED.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches(|c| matches!(c, '-' | '/' | '.'));
    if trimmed.is_empty() {
        return "library/unknown".to_owned();
    }
    if trimmed.len() > MAX_REPO_NAME_LENGTH {
        let hash = short_digest(&path.to_lowercase());
        let keep = MAX_REPO_NAME_LENGTH - hash.len();
        return format!("{}{}", &trimmed[..keep], hash);
    }
    trimmed.to_owned()
}

/// First 12 hex characters of the SHA-1 of the value.
pub fn short_digest(value: &str) -> String {
    let digest = Sha1::digest(value.as_bytes());
    hex::encode(digest)[..12].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformer_applies_first_matching_rule() {
        let transform = RepoPathTransformer::new(&[
            PathMapping {
                from: "old/".into(),
                to: "new/".into(),
                regex: false,
            },
            PathMapping {
                from: "^legacy/(.*)".into(),
                to: "modern/$1".into(),
                regex: true,
            },
        ]);
        assert_eq!(transform.apply("old/repo"), "new/repo");
        assert_eq!(transform.apply("legacy/service"), "modern/service");
        assert_eq!(transform.apply("other/repo"), "other/repo");
    }

    #[test]
    fn transformer_skips_invalid_regex_rules() {
        let transform = RepoPathTransformer::new(&[
            PathMapping {
                from: "(".into(),
                to: "x".into(),
                regex: true,
            },
            PathMapping {
                from: "src/".into(),
                to: String::new(),
                regex: false,
            },
        ]);
        assert_eq!(transform.apply("src/app"), "app");
    }

    #[test]
    fn clean_strips_invalid_characters() {
        let cleaned = clean_repo_name(
            "Quay.io/Cilium/cilium-envoy:v1@sha256:318eff387835ca2717baab42a84f35a83a5f9e7d519253df87269f80b9ff0171",
        );
        assert!(!cleaned.contains('@'));
        assert!(!cleaned.contains(':'));
        assert!(!cleaned.is_empty());
    }

    #[test]
    fn clean_is_idempotent() {
        let cleaned = clean_repo_name("My Repo/With Spaces");
        assert_eq!(clean_repo_name(&cleaned), cleaned);
    }

    #[test]
    fn clean_substitutes_empty_result() {
        assert_eq!(clean_repo_name("---"), "library/unknown");
        assert_eq!(clean_repo_name(""), "library/unknown");
    }

    #[test]
    fn clean_truncates_long_repositories() {
        let long = "a".repeat(MAX_REPO_NAME_LENGTH + 42);
        let cleaned = clean_repo_name(&long);
        assert_eq!(cleaned.len(), MAX_REPO_NAME_LENGTH);
        let hash = short_digest(&long.to_lowercase());
        assert!(cleaned.ends_with(&hash));
    }

    #[test]
    fn short_digest_is_stable() {
        assert_eq!(short_digest("abc").len(), 12);
        assert_eq!(short_digest("abc"), short_digest("abc"));
        assert_ne!(short_digest("abc"), short_digest("abd"));
    }
}

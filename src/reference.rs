//! Image reference parsing and construction.
//!
//! A reference is either a tag reference (`registry/repo:tag`) or a digest
//! reference (`registry/repo@algo:hex`). A source that carries both forms
//! (`registry/repo:tag@algo:hex`) parses as a digest reference that remembers
//! the tag: the digest drives pulls, the tag names the destination.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Registry assumed for references that do not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid reference format")]
    InvalidFormat,
    #[error("invalid digest format")]
    InvalidDigest,
    #[error("invalid tag format")]
    InvalidTag,
    #[error("repository name must not be more than {NAME_TOTAL_LENGTH_MAX} characters")]
    NameTooLong,
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    Tag {
        registry: String,
        repository: String,
        tag: String,
    },
    Digest {
        registry: String,
        repository: String,
        digest: String,
        /// Tag the source carried alongside the digest, if any.
        tag: Option<String>,
    },
}

impl ImageReference {
    pub fn with_tag(registry: impl Into<String>, repository: impl Into<String>, tag: impl Into<String>) -> Self {
        ImageReference::Tag {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn with_digest(
        registry: impl Into<String>,
        repository: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        ImageReference::Digest {
            registry: registry.into(),
            repository: repository.into(),
            digest: digest.into(),
            tag: None,
        }
    }

    pub fn registry(&self) -> &str {
        match self {
            ImageReference::Tag { registry, .. } | ImageReference::Digest { registry, .. } => registry,
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            ImageReference::Tag { repository, .. } | ImageReference::Digest { repository, .. } => repository,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            ImageReference::Tag { tag, .. } => Some(tag),
            ImageReference::Digest { tag, .. } => tag.as_deref(),
        }
    }

    pub fn digest(&self) -> Option<&str> {
        match self {
            ImageReference::Tag { .. } => None,
            ImageReference::Digest { digest, .. } => Some(digest),
        }
    }

    /// The path component used in distribution API URLs: the digest for
    /// digest references, the tag otherwise.
    pub fn identifier(&self) -> &str {
        match self {
            ImageReference::Tag { tag, .. } => tag,
            ImageReference::Digest { digest, .. } => digest,
        }
    }

    /// Same repository, different digest.
    pub fn clone_with_digest(&self, digest: impl Into<String>) -> Self {
        ImageReference::Digest {
            registry: self.registry().to_owned(),
            repository: self.repository().to_owned(),
            digest: digest.into(),
            tag: None,
        }
    }

    /// The canonical string form, including both tag and digest when present.
    pub fn whole(&self) -> String {
        match self {
            ImageReference::Tag {
                registry,
                repository,
                tag,
            } => format!("{registry}/{repository}:{tag}"),
            ImageReference::Digest {
                registry,
                repository,
                digest,
                tag: Some(tag),
            } => format!("{registry}/{repository}:{tag}@{digest}"),
            ImageReference::Digest {
                registry,
                repository,
                digest,
                tag: None,
            } => format!("{registry}/{repository}@{digest}"),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Whether the first path segment of a reference names a registry host.
fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Whether a string has the `algo:hex` shape of a digest.
pub fn is_valid_digest(digest: &str) -> bool {
    let Some((algo, hex)) = digest.split_once(':') else {
        return false;
    };
    !algo.is_empty()
        && algo.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        && !hex.is_empty()
        && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn parse(s: &str) -> Result<ImageReference, ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseError::InvalidFormat);
    }

    let (rest, digest) = match s.split_once('@') {
        Some((name, digest)) => {
            if !is_valid_digest(digest) {
                return Err(ParseError::InvalidDigest);
            }
            (name, Some(digest.to_owned()))
        }
        None => (s, None),
    };

    // A colon after the last slash separates the tag; earlier colons belong
    // to a registry port.
    let name_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match rest[name_start..].find(':') {
        Some(i) => {
            let split = name_start + i;
            let tag = &rest[split + 1..];
            if !valid_tag(tag) {
                return Err(ParseError::InvalidTag);
            }
            (&rest[..split], Some(tag.to_owned()))
        }
        None => (rest, None),
    };

    if name.is_empty() {
        return Err(ParseError::InvalidFormat);
    }

    let (registry, mut repository) = match name.split_once('/') {
        Some((first, remainder)) if looks_like_registry(first) => {
            if remainder.is_empty() {
                return Err(ParseError::InvalidFormat);
            }
            (first.to_owned(), remainder.to_owned())
        }
        _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
    };

    // Hub single-component repositories live under library/.
    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        repository = format!("library/{repository}");
    }

    if repository.len() > NAME_TOTAL_LENGTH_MAX {
        return Err(ParseError::NameTooLong);
    }
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ParseError::InvalidFormat);
    }

    Ok(match digest {
        Some(digest) => ImageReference::Digest {
            registry,
            repository,
            digest,
            tag,
        },
        None => ImageReference::Tag {
            registry,
            repository,
            tag: tag.unwrap_or_else(|| "latest".to_owned()),
        },
    })
}

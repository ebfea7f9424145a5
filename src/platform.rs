//! Platform selection for multi-architecture mirroring.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Result};
use tracing::info;

use crate::distribution::manifest::{
    OciDescriptor, ATTESTATION_MANIFEST_TYPE, REFERENCE_TYPE_ANNOTATION,
};

/// A desired `os/architecture` pair. A bare architecture implies `linux`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSpec {
    pub os: String,
    pub architecture: String,
}

impl PlatformSpec {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            bail!("empty platform");
        }
        let (os, architecture) = match trimmed.split_once('/') {
            Some((os, arch)) => (os.trim(), arch.trim()),
            None => ("linux", trimmed),
        };
        if architecture.is_empty() {
            bail!("missing architecture in platform {value:?}");
        }
        let os = if os.is_empty() { "linux" } else { os };
        Ok(Self {
            os: os.to_owned(),
            architecture: architecture.to_owned(),
        })
    }

    /// Deduplication key, lowercased `os/arch`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.os.to_lowercase(), self.architecture.to_lowercase())
    }

    /// Whether an index entry's platform satisfies this spec.
    pub fn matches(&self, descriptor: &OciDescriptor) -> bool {
        let Some(platform) = &descriptor.platform else {
            return false;
        };
        let arch = platform.architecture.trim();
        let os = platform.os.trim();
        if arch.is_empty() || os.is_empty() {
            return false;
        }
        arch.eq_ignore_ascii_case(&self.architecture) && os.eq_ignore_ascii_case(&self.os)
    }
}

impl fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Parses and deduplicates configured mirror platforms. Invalid entries are
/// logged and dropped; an empty result means no platform curation.
pub fn parse_mirror_platforms(values: &[String]) -> (Vec<PlatformSpec>, HashSet<String>) {
    let mut parsed = Vec::with_capacity(values.len());
    let mut seen = HashSet::with_capacity(values.len());
    for raw in values {
        let spec = match PlatformSpec::parse(raw) {
            Ok(spec) => spec,
            Err(err) => {
                info!(value = raw.trim(), error = %err, "ignoring invalid mirror platform");
                continue;
            }
        };
        if seen.insert(spec.key()) {
            parsed.push(spec);
        }
    }
    (parsed, seen)
}

/// Whether an index entry points at a manifest a node could run: platform
/// fully specified, not `unknown`, and not an attestation manifest.
pub fn descriptor_is_runnable(descriptor: &OciDescriptor) -> bool {
    if let Some(annotations) = &descriptor.annotations {
        if let Some(kind) = annotations.get(REFERENCE_TYPE_ANNOTATION) {
            if kind.trim().eq_ignore_ascii_case(ATTESTATION_MANIFEST_TYPE) {
                return false;
            }
        }
    }
    let Some(platform) = &descriptor.platform else {
        return false;
    };
    let arch = platform.architecture.trim();
    let os = platform.os.trim();
    !arch.is_empty()
        && !arch.eq_ignore_ascii_case("unknown")
        && !os.is_empty()
        && !os.eq_ignore_ascii_case("unknown")
}

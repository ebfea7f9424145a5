//! # Metrics
//!
//! Prometheus counters for registry traffic, labelled by image.
//!
//! ## Metrics Exposed
//!
//! - `registry_pull_success_total` - Successful image pulls from source registries
//! - `registry_pull_error_total` - Failed image pulls from source registries
//! - `registry_push_success_total` - Successful image pushes to the target registry
//! - `registry_push_error_total` - Failed image pushes to the target registry

use std::sync::LazyLock;

use anyhow::Result;
use prometheus::{IntCounterVec, Opts, Registry};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static PULL_SUCCESS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_pull_success_total",
            "Total number of successful image pulls from source registries",
        ),
        &["image"],
    )
    .expect("Failed to create PULL_SUCCESS metric - this should never happen")
});

static PULL_ERROR: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_pull_error_total",
            "Total number of failed image pulls from source registries",
        ),
        &["image"],
    )
    .expect("Failed to create PULL_ERROR metric - this should never happen")
});

static PUSH_SUCCESS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_push_success_total",
            "Total number of successful image pushes to the target registry",
        ),
        &["image"],
    )
    .expect("Failed to create PUSH_SUCCESS metric - this should never happen")
});

static PUSH_ERROR: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_push_error_total",
            "Total number of failed image pushes to the target registry",
        ),
        &["image"],
    )
    .expect("Failed to create PUSH_ERROR metric - this should never happen")
});

/// Registers all metrics with the crate registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(PULL_SUCCESS.clone()))?;
    REGISTRY.register(Box::new(PULL_ERROR.clone()))?;
    REGISTRY.register(Box::new(PUSH_SUCCESS.clone()))?;
    REGISTRY.register(Box::new(PUSH_ERROR.clone()))?;
    Ok(())
}

pub fn record_pull_success(image: &str) {
    if !image.is_empty() {
        PULL_SUCCESS.with_label_values(&[image]).inc();
    }
}

pub fn record_pull_error(image: &str) {
    if !image.is_empty() {
        PULL_ERROR.with_label_values(&[image]).inc();
    }
}

pub fn record_push_success(image: &str) {
    if !image.is_empty() {
        PUSH_SUCCESS.with_label_values(&[image]).inc();
    }
}

pub fn record_push_error(image: &str) {
    if !image.is_empty() {
        PUSH_ERROR.with_label_values(&[image]).inc();
    }
}

#[cfg(test)]
pub(crate) fn push_success_count(image: &str) -> u64 {
    PUSH_SUCCESS.with_label_values(&[image]).get()
}

#[cfg(test)]
pub(crate) fn pull_error_count(image: &str) -> u64 {
    PULL_ERROR.with_label_values(&[image]).get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_image() {
        record_push_success("example.com/mirror/app:1");
        record_push_success("example.com/mirror/app:1");
        assert_eq!(push_success_count("example.com/mirror/app:1"), 2);
    }

    #[test]
    fn empty_image_label_is_ignored() {
        record_pull_error("");
        assert_eq!(pull_error_count(""), 0);
    }
}

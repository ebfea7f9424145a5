//! # OCI Distribution
//!
//! The wire layer for talking OCI Distribution v2 to source and target
//! registries. The [`Distribution`] trait is the seam the mirror engine is
//! written against; [`client::RegistryClient`] is the production
//! implementation, tests drive the engine with scripted fakes.

pub mod client;
pub mod manifest;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::keychain::RegistryAuth;
use crate::reference::ImageReference;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("registry returned status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        /// Error envelope diagnostics reported by the registry, if any.
        details: Vec<String>,
    },
    #[error("token exchange with {realm} failed: {reason}")]
    TokenExchange { realm: String, reason: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Protocol(String),
}

impl DistributionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DistributionError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the registry rejected our credentials.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
            || matches!(self, DistributionError::TokenExchange { .. })
    }

    pub fn details(&self) -> &[String] {
        match self {
            DistributionError::Status { details, .. } => details,
            _ => &[],
        }
    }
}

/// A fetched manifest: raw payload plus the wire metadata the engine needs.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub digest: String,
    pub media_type: Option<String>,
    pub payload: Vec<u8>,
}

/// Repository coordinates on one side of a blob transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoAddress {
    pub registry: String,
    pub repository: String,
}

impl RepoAddress {
    pub fn of(image: &ImageReference) -> Self {
        Self {
            registry: image.registry().to_owned(),
            repository: image.repository().to_owned(),
        }
    }
}

/// A transferred-bytes sample emitted while pushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub complete: u64,
    pub total: u64,
}

/// Accumulates bytes transferred across the blobs of one push and feeds a
/// bounded channel consumed by the progress logger.
pub struct BlobProgress {
    total: u64,
    complete: AtomicU64,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl BlobProgress {
    pub fn new(total: u64, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            total,
            complete: AtomicU64::new(0),
            tx,
        }
    }

    /// Records additional transferred bytes. Updates are best-effort: a full
    /// channel drops the sample rather than stalling the transfer.
    pub fn add(&self, bytes: u64) {
        let complete = self.complete.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let _ = self.tx.try_send(ProgressUpdate {
            complete,
            total: self.total,
        });
    }
}

/// Registry operations the mirror engine performs.
#[async_trait]
pub trait Distribution: Send + Sync {
    /// GET a manifest with the standard accept set.
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<FetchedManifest, DistributionError>;

    /// HEAD a manifest. `Ok(Some(digest))` when present, `Ok(None)` on an
    /// authoritative 404.
    async fn head_manifest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<Option<String>, DistributionError>;

    /// PUT a raw manifest payload under its exact media type.
    async fn put_manifest(
        &self,
        image: &ImageReference,
        media_type: &str,
        payload: &[u8],
        auth: &RegistryAuth,
    ) -> Result<(), DistributionError>;

    /// HEAD a blob.
    async fn blob_exists(
        &self,
        repo: &RepoAddress,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<bool, DistributionError>;

    /// GET a blob into memory. Meant for config-sized payloads.
    async fn fetch_blob(
        &self,
        repo: &RepoAddress,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>, DistributionError>;

    /// Streams one blob from a source repository into a target repository,
    /// reporting transferred bytes. Returns the number of bytes copied.
    async fn copy_blob(
        &self,
        src: &RepoAddress,
        src_auth: &RegistryAuth,
        dst: &RepoAddress,
        dst_auth: &RegistryAuth,
        digest: &str,
        progress: Option<&BlobProgress>,
    ) -> Result<u64, DistributionError>;
}

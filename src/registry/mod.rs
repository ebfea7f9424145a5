//! # Registry Targets
//!
//! Destination registries the mirror can push to. Each target knows its
//! host, repository prefix, how to provision repositories and how to mint
//! push credentials.

use anyhow::Result;
use async_trait::async_trait;

pub mod docker;
pub mod ecr;

pub use docker::DockerTarget;
pub use ecr::EcrTarget;

/// A destination registry (ECR or a generic Docker v2 registry).
#[async_trait]
pub trait Target: Send + Sync {
    /// Registry host images are pushed to.
    fn registry(&self) -> &str;

    /// Repository prefix, possibly containing `$namespace`, `$podname`,
    /// `$container_name` and `$arch` placeholders.
    fn repo_prefix(&self) -> &str;

    /// Ensures the repository exists. Idempotent.
    async fn ensure_repository(&self, name: &str) -> Result<()>;

    /// Basic credentials for pushing. Empty credentials mean anonymous.
    async fn basic_auth(&self) -> Result<(String, String)>;

    /// Whether TLS verification is skipped and the plain HTTP scheme used.
    fn insecure(&self) -> bool;
}

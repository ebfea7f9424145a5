//! Generic Docker v2 registry target with static credentials.

use anyhow::Result;
use async_trait::async_trait;

use super::Target;
use crate::config::DockerSettings;

pub struct DockerTarget {
    settings: DockerSettings,
}

impl DockerTarget {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Target for DockerTarget {
    fn registry(&self) -> &str {
        &self.settings.registry
    }

    fn repo_prefix(&self) -> &str {
        &self.settings.repo_prefix
    }

    fn insecure(&self) -> bool {
        self.settings.insecure
    }

    // Generic registries have no provisioning API; pushing creates the
    // repository implicitly.
    async fn ensure_repository(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn basic_auth(&self) -> Result<(String, String)> {
        Ok((self.settings.username.clone(), self.settings.password.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exposes_static_configuration() {
        let target = DockerTarget::new(DockerSettings {
            registry: "registry.example.com".into(),
            repo_prefix: "mirror".into(),
            username: "bot".into(),
            password: "pw".into(),
            insecure: true,
        });
        assert_eq!(target.registry(), "registry.example.com");
        assert!(target.insecure());
        let (user, pass) = target.basic_auth().await.unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("bot", "pw"));
        assert!(target.ensure_repository("mirror/app").await.is_ok());
    }
}

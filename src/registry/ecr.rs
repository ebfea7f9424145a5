//! AWS Elastic Container Registry target.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecr::error::SdkError;
use base64::Engine;
use tracing::{debug, error, info};

use super::Target;
use crate::config::EcrSettings;

pub struct EcrTarget {
    settings: EcrSettings,
    client: aws_sdk_ecr::Client,
    registry: String,
}

impl EcrTarget {
    /// Builds the target from the default AWS credential chain (IRSA on EKS)
    /// pinned to the configured region.
    pub async fn new(settings: EcrSettings) -> Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .load()
            .await;
        let client = aws_sdk_ecr::Client::new(&sdk_config);
        let registry = format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            settings.account_id, settings.region
        );
        Ok(Self {
            settings,
            client,
            registry,
        })
    }
}

#[async_trait]
impl Target for EcrTarget {
    fn registry(&self) -> &str {
        &self.registry
    }

    fn repo_prefix(&self) -> &str {
        &self.settings.repo_prefix
    }

    fn insecure(&self) -> bool {
        false
    }

    async fn ensure_repository(&self, name: &str) -> Result<()> {
        let mut describe = self
            .client
            .describe_repositories()
            .repository_names(name);
        if !self.settings.account_id.is_empty() {
            describe = describe.registry_id(&self.settings.account_id);
        }

        let not_found = match describe.send().await {
            Ok(_) => {
                debug!(repository = name, registry = self.registry, "repository already exists");
                return Ok(());
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if !service_err.is_repository_not_found_exception() {
                    error!(repository = name, error = %service_err, "failed to describe repository");
                    return Err(service_err).context("describe repository");
                }
                service_err
            }
        };

        if !self.settings.create_repo {
            error!(repository = name, "repository missing and creation disabled");
            return Err(not_found).context("describe repository");
        }

        info!(repository = name, registry = self.registry, "creating repository");
        let mut create = self.client.create_repository().repository_name(name);
        if !self.settings.account_id.is_empty() {
            create = create.registry_id(&self.settings.account_id);
        }
        create
            .send()
            .await
            .map_err(flatten_sdk_error)
            .context("create repository")?;
        info!(repository = name, "repository created");

        let policy = self.settings.lifecycle_policy.trim();
        if !policy.is_empty() {
            let mut put = self
                .client
                .put_lifecycle_policy()
                .repository_name(name)
                .lifecycle_policy_text(policy);
            if !self.settings.account_id.is_empty() {
                put = put.registry_id(&self.settings.account_id);
            }
            put.send()
                .await
                .map_err(flatten_sdk_error)
                .context("apply lifecycle policy")?;
            info!(repository = name, "applied lifecycle policy");
        }

        Ok(())
    }

    async fn basic_auth(&self) -> Result<(String, String)> {
        let output = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(flatten_sdk_error)
            .context("get authorization token")?;

        let data = output
            .authorization_data()
            .first()
            .context("no ECR auth data")?;
        let token = data.authorization_token().context("no ECR auth token")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .context("decode authorization token")?;
        let decoded = String::from_utf8(decoded).context("decode authorization token")?;
        match decoded.split_once(':') {
            Some((user, pass)) => Ok((user.to_owned(), pass.to_owned())),
            None => bail!("authorization token in unexpected format"),
        }
    }
}

/// Collapses the SDK error onto its service error so logs carry the AWS
/// error code instead of the dispatch wrapper.
fn flatten_sdk_error<E, R>(err: SdkError<E, R>) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(inner) => anyhow::Error::new(inner.into_err()),
        other => anyhow::anyhow!("{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_host_follows_account_and_region() {
        let target = EcrTarget::new(EcrSettings {
            account_id: "123456789012".into(),
            region: "us-east-1".into(),
            repo_prefix: "mirror".into(),
            create_repo: true,
            lifecycle_policy: String::new(),
        })
        .await
        .unwrap();
        assert_eq!(target.registry(), "123456789012.dkr.ecr.us-east-1.amazonaws.com");
        assert_eq!(target.repo_prefix(), "mirror");
        assert!(!target.insecure());
    }
}

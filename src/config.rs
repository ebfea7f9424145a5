//! Configuration loading.
//!
//! Settings come from an optional YAML file (mounted ConfigMap) overridden by
//! environment variables; a handful of flags participate for operator
//! ergonomics. A missing config file is not an error.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::paths::PathMapping;

/// Default config path inside the container.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 2;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcrFileConfig {
    #[serde(rename = "accountID")]
    pub account_id: String,
    pub region: String,
    pub repo_prefix: String,
    pub create_repo: Option<bool>,
    /// Optional policy JSON applied when repositories are created.
    pub lifecycle_policy: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerFileConfig {
    pub registry: String,
    pub repo_prefix: String,
    pub insecure: bool,
    // Username/password come from Secret envs, not the ConfigMap.
}

/// Credentials for pulling from a source registry. Values can be given
/// directly or through `*Env` indirections; the environment wins when both
/// are set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryCredential {
    pub registry: String,
    pub registry_aliases: Vec<String>,
    pub username: String,
    pub password: String,
    pub username_env: String,
    pub password_env: String,
    pub token: String,
    pub token_env: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkipNames {
    pub deployments: Vec<String>,
    pub stateful_sets: Vec<String>,
    pub daemon_sets: Vec<String>,
    pub jobs: Vec<String>,
    pub cron_jobs: Vec<String>,
    pub pods: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    /// `ecr` or `docker`.
    pub target_kind: String,
    pub log_level: String,
    pub ecr: EcrFileConfig,
    pub docker: DockerFileConfig,
    pub dry_run: bool,
    pub dry_pull: bool,
    pub request_timeout_seconds: Option<i64>,
    pub failure_cooldown_minutes: Option<i64>,
    pub digest_pull: bool,
    pub check_node_platform: bool,
    pub allow_different_digest_repush: Option<bool>,
    pub max_concurrent_reconciles: Option<i64>,
    pub force_reconcile_minutes: Option<i64>,
    pub watch_resources: Vec<String>,
    pub include_namespaces: Vec<String>,
    pub skip_namespaces: Vec<String>,
    pub skip_names: SkipNames,
    pub exclude_registries: Vec<String>,
    pub path_map: Vec<PathMapping>,
    pub registry_credentials: Vec<RegistryCredential>,
    pub mirror_platforms: Vec<String>,
}

/// Loads the config file. Returns the parsed config and whether a file was
/// found; an unreadable or absent file yields defaults.
pub fn load_file(path: &Path) -> Result<(FileConfig, bool)> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok((FileConfig::default(), false)),
    };
    let cfg = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok((cfg, true))
}

/// Resolved ECR target settings.
#[derive(Debug, Clone)]
pub struct EcrSettings {
    pub account_id: String,
    pub region: String,
    pub repo_prefix: String,
    pub create_repo: bool,
    pub lifecycle_policy: String,
}

/// Resolved generic registry target settings.
#[derive(Debug, Clone)]
pub struct DockerSettings {
    pub registry: String,
    pub repo_prefix: String,
    pub username: String,
    pub password: String,
    pub insecure: bool,
}

#[derive(Debug, Clone)]
pub enum TargetSettings {
    Ecr(EcrSettings),
    Docker(DockerSettings),
}

/// All runtime configuration derived from flags, env vars and the file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub allowed_namespaces: Vec<String>,
    pub skip_namespaces: Vec<String>,
    pub skip_names: SkipNames,
    pub excluded_registries: Vec<String>,
    pub target: TargetSettings,
    pub dry_run: bool,
    pub dry_pull: bool,
    pub path_map: Vec<PathMapping>,
    /// Zero disables per-operation timeouts.
    pub request_timeout: Duration,
    /// Zero disables the failure cooldown.
    pub failure_cooldown: Duration,
    pub digest_pull: bool,
    pub check_node_platform: bool,
    pub allow_different_digest_repush: bool,
    pub max_concurrent_reconciles: usize,
    pub watch_resources: Vec<String>,
    pub force_resync: Option<Duration>,
    pub registry_credentials: Vec<RegistryCredential>,
    pub mirror_platforms: Vec<String>,
    pub log_level: String,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// Truthy per the accepted lexicon: `1|true|yes|y|on` (case-insensitive).
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn sanitize_string_list(values: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        for part in value.split(',') {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_owned());
            }
        }
    }
    out
}

/// Env var (comma-separated) wins over the file list.
fn resolve_list(env_name: &str, file_values: &[String]) -> Vec<String> {
    match env(env_name) {
        Some(raw) => sanitize_string_list(&[raw]),
        None => sanitize_string_list(file_values),
    }
}

fn duration_from_minutes(minutes: i64) -> Duration {
    if minutes <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(minutes as u64 * 60)
    }
}

fn parse_env_i64(name: &str) -> Result<Option<i64>> {
    match env(name) {
        Some(raw) => {
            let parsed = raw
                .parse::<i64>()
                .with_context(|| format!("parse {name}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env(name).map(|raw| parse_bool(&raw))
}

fn resolve_target(file: &FileConfig, found: bool) -> Result<TargetSettings> {
    let mut kind = env("TARGET_KIND").unwrap_or_default().to_lowercase();
    if kind.is_empty() && found {
        kind = file.target_kind.trim().to_lowercase();
    }
    if kind.is_empty() {
        kind = "ecr".to_owned();
    }

    match kind.as_str() {
        "ecr" => {
            let account_id = env("ECR_ACCOUNT_ID").unwrap_or_else(|| file.ecr.account_id.clone());
            let region = env("AWS_REGION").unwrap_or_else(|| file.ecr.region.clone());
            let repo_prefix = env("ECR_REPO_PREFIX").unwrap_or_else(|| file.ecr.repo_prefix.clone());
            let mut create_repo = file.ecr.create_repo.unwrap_or(true);
            if env("ECR_CREATE_REPO").as_deref() == Some("false") {
                create_repo = false;
            }
            if account_id.is_empty() || region.is_empty() {
                bail!("for targetKind=ecr set ECR_ACCOUNT_ID and AWS_REGION (via ConfigMap or env)");
            }
            Ok(TargetSettings::Ecr(EcrSettings {
                account_id,
                region,
                repo_prefix,
                create_repo,
                lifecycle_policy: file.ecr.lifecycle_policy.clone(),
            }))
        }
        "docker" => {
            let registry = env("TARGET_REGISTRY").unwrap_or_else(|| file.docker.registry.clone());
            let repo_prefix =
                env("TARGET_REPO_PREFIX").unwrap_or_else(|| file.docker.repo_prefix.clone());
            let insecure = parse_env_bool("TARGET_INSECURE").unwrap_or(file.docker.insecure);
            if registry.is_empty() {
                bail!("for targetKind=docker set TARGET_REGISTRY (via ConfigMap or env)");
            }
            Ok(TargetSettings::Docker(DockerSettings {
                registry,
                repo_prefix,
                username: std::env::var("TARGET_USERNAME").unwrap_or_default(),
                password: std::env::var("TARGET_PASSWORD").unwrap_or_default(),
                insecure,
            }))
        }
        other => bail!("unknown targetKind {other:?}"),
    }
}

/// Resolves the full runtime configuration. `dry_run_flag`/`dry_pull_flag`
/// come from the CLI and apply when no env override is present.
pub fn resolve(dry_run_flag: bool, dry_pull_flag: bool, file: FileConfig, found: bool) -> Result<Settings> {
    let allowed_namespaces = {
        let ns = resolve_list("INCLUDE_NAMESPACES", &file.include_namespaces);
        if ns.is_empty() {
            vec!["*".to_owned()]
        } else {
            ns
        }
    };

    let skip_names = SkipNames {
        deployments: resolve_list("SKIP_DEPLOYMENTS", &file.skip_names.deployments),
        stateful_sets: resolve_list("SKIP_STATEFULSETS", &file.skip_names.stateful_sets),
        daemon_sets: resolve_list("SKIP_DAEMONSETS", &file.skip_names.daemon_sets),
        jobs: resolve_list("SKIP_JOBS", &file.skip_names.jobs),
        cron_jobs: resolve_list("SKIP_CRONJOBS", &file.skip_names.cron_jobs),
        pods: resolve_list("SKIP_PODS", &file.skip_names.pods),
    };

    let target = resolve_target(&file, found)?;

    let dry_run = match parse_env_bool("DRY_RUN") {
        Some(v) => v,
        None => dry_run_flag || file.dry_run,
    };
    let dry_pull = match parse_env_bool("DRY_PULL") {
        Some(v) => v,
        None => dry_pull_flag || file.dry_pull,
    };

    let request_timeout = match parse_env_i64("REGISTRY_REQUEST_TIMEOUT")?
        .or(file.request_timeout_seconds)
    {
        Some(secs) if secs <= 0 => Duration::ZERO,
        Some(secs) => Duration::from_secs(secs as u64),
        None => DEFAULT_REQUEST_TIMEOUT,
    };

    let failure_cooldown = match parse_env_i64("FAILURE_COOLDOWN_MINUTES")?
        .or(file.failure_cooldown_minutes)
    {
        Some(minutes) => duration_from_minutes(minutes),
        None => DEFAULT_FAILURE_COOLDOWN,
    };

    let digest_pull = parse_env_bool("DIGEST_PULL").unwrap_or(file.digest_pull);
    let check_node_platform =
        parse_env_bool("CHECK_NODE_PLATFORM").unwrap_or(file.check_node_platform);
    let allow_different_digest_repush = parse_env_bool("ALLOW_DIFFERENT_DIGEST_REPUSH")
        .or(file.allow_different_digest_repush)
        .unwrap_or(true);

    let max_concurrent_reconciles = match parse_env_i64("MAX_CONCURRENT_RECONCILES")?
        .or(file.max_concurrent_reconciles)
    {
        Some(n) if n <= 0 => bail!("maxConcurrentReconciles must be greater than zero"),
        Some(n) => n as usize,
        None => DEFAULT_MAX_CONCURRENT_RECONCILES,
    };

    let force_resync = match parse_env_i64("FORCE_RECONCILE_MINUTES")?
        .or(file.force_reconcile_minutes)
    {
        Some(minutes) if minutes > 0 => Some(duration_from_minutes(minutes)),
        _ => None,
    };

    Ok(Settings {
        allowed_namespaces,
        skip_namespaces: resolve_list("SKIP_NAMESPACES", &file.skip_namespaces),
        skip_names,
        excluded_registries: resolve_list("EXCLUDE_REGISTRIES", &file.exclude_registries),
        target,
        dry_run,
        dry_pull,
        path_map: file.path_map,
        request_timeout,
        failure_cooldown,
        digest_pull,
        check_node_platform,
        allow_different_digest_repush,
        max_concurrent_reconciles,
        watch_resources: resolve_list("WATCH_RESOURCES", &file.watch_resources),
        force_resync,
        registry_credentials: file.registry_credentials,
        mirror_platforms: file.mirror_platforms,
        log_level: file.log_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
targetKind: docker
logLevel: debug
docker:
  registry: registry.example.com
  repoPrefix: mirror
  insecure: true
dryRun: true
digestPull: true
requestTimeoutSeconds: 30
failureCooldownMinutes: 15
allowDifferentDigestRepush: false
maxConcurrentReconciles: 4
watchResources: [deployments, pods]
includeNamespaces: ["prod", "staging"]
skipNamespaces: ["kube-system"]
skipNames:
  deployments: ["ignored"]
  cronJobs: ["batch/skip-me"]
excludeRegistries: ["registry.internal"]
pathMap:
  - from: "old/"
    to: "new/"
  - from: "^legacy/(.*)"
    to: "modern/$1"
    regex: true
registryCredentials:
  - registry: quay.io
    registryAliases: ["quay.example.com"]
    username: bot
    password: hunter2
mirrorPlatforms: ["linux/amd64", "linux/arm64"]
"#;
        let cfg: FileConfig = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.target_kind, "docker");
        assert_eq!(cfg.docker.registry, "registry.example.com");
        assert!(cfg.docker.insecure);
        assert_eq!(cfg.request_timeout_seconds, Some(30));
        assert_eq!(cfg.failure_cooldown_minutes, Some(15));
        assert_eq!(cfg.allow_different_digest_repush, Some(false));
        assert_eq!(cfg.skip_names.cron_jobs, vec!["batch/skip-me"]);
        assert_eq!(cfg.path_map.len(), 2);
        assert!(cfg.path_map[1].regex);
        assert_eq!(cfg.registry_credentials[0].registry_aliases, vec!["quay.example.com"]);
        assert_eq!(cfg.mirror_platforms.len(), 2);
    }

    #[test]
    fn parses_ecr_account_id_key() {
        let yaml = r#"
targetKind: ecr
ecr:
  accountID: "123456789012"
  region: us-east-1
  repoPrefix: mirror
  createRepo: false
  lifecyclePolicy: '{"rules":[]}'
"#;
        let cfg: FileConfig = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.ecr.account_id, "123456789012");
        assert_eq!(cfg.ecr.create_repo, Some(false));
        assert_eq!(cfg.ecr.lifecycle_policy, r#"{"rules":[]}"#);
    }

    #[test]
    fn bool_lexicon() {
        for truthy in ["1", "true", "YES", "y", "On"] {
            assert!(parse_bool(truthy), "{truthy} should be true");
        }
        for falsy in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(falsy), "{falsy} should be false");
        }
    }

    #[test]
    fn sanitizes_comma_separated_lists() {
        let out = sanitize_string_list(&["a, b".into(), "".into(), " c ".into()]);
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let (cfg, found) = load_file(Path::new("/nonexistent/config.yaml")).unwrap();
        assert!(!found);
        assert!(cfg.target_kind.is_empty());
    }

    #[test]
    fn resolve_defaults_for_docker_target() {
        let file: FileConfig = serde_yaml::from_str(
            "targetKind: docker\ndocker:\n  registry: registry.example.com\n",
        )
        .unwrap();
        let settings = resolve(false, false, file, true).expect("resolve");
        assert_eq!(settings.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(settings.failure_cooldown, DEFAULT_FAILURE_COOLDOWN);
        assert_eq!(settings.max_concurrent_reconciles, DEFAULT_MAX_CONCURRENT_RECONCILES);
        assert!(settings.allow_different_digest_repush);
        assert_eq!(settings.allowed_namespaces, vec!["*"]);
        assert!(settings.force_resync.is_none());
    }

    #[test]
    fn resolve_rejects_unknown_target_kind() {
        let file: FileConfig = serde_yaml::from_str("targetKind: gcs\n").unwrap();
        assert!(resolve(false, false, file, true).is_err());
    }

    #[test]
    fn resolve_requires_ecr_identity() {
        let file: FileConfig = serde_yaml::from_str("targetKind: ecr\n").unwrap();
        assert!(resolve(false, false, file, true).is_err());
    }
}

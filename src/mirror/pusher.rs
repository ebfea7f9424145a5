//! The mirroring engine.
//!
//! One `mirror` call runs the whole pipeline for a single image: exclusion
//! check, reference parsing, target derivation, dedup and cooldown
//! admission, manifest fetch, platform selection, digest comparison against
//! the target, repository provisioning, push and verification. Failures
//! leave via [`Pusher::failure_result`], which records the cooldown stamp
//! and wraps the cause in a [`RetryError`] when the cooldown is enabled.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::distribution::manifest::{
    self, ImageConfig, Manifest, OciDescriptor, OciImageIndex,
};
use crate::distribution::{
    BlobProgress, Distribution, DistributionError, ProgressUpdate, RepoAddress,
};
use crate::images::normalize_image_id;
use crate::keychain::{Keychain, RegistryAuth};
use crate::metrics;
use crate::mirror::state::{Admission, CacheEntry, PushState};
use crate::paths::RepoPathTransformer;
use crate::platform::{descriptor_is_runnable, parse_mirror_platforms, PlatformSpec};
use crate::reference::{is_valid_digest, ImageReference};
use crate::registry::Target;

/// Sentinel cause carried by a [`RetryError`] when a target is suppressed by
/// its failure cooldown.
#[derive(Debug, Error)]
#[error("mirror: target is in failure cooldown")]
pub struct InCooldownError;

/// A failure with an active cooldown; the caller should requeue at or after
/// `retry_at`.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct RetryError {
    pub cause: anyhow::Error,
    pub retry_at: Instant,
}

/// A single registry operation outcome, distinguishing timeouts so the
/// verify step can report them separately.
#[derive(Debug, Error)]
enum OpError {
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

/// Contextual information about the image being mirrored.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub architecture: String,
    pub os: String,
    pub image_id: String,
}

/// Engine tunables; see the configuration surface for semantics.
#[derive(Debug, Clone)]
pub struct PusherOptions {
    pub dry_run: bool,
    pub dry_pull: bool,
    pub digest_pull: bool,
    pub allow_different_digest_repush: bool,
    /// Zero disables per-operation timeouts.
    pub request_timeout: Duration,
    /// Zero disables the failure cooldown.
    pub failure_cooldown: Duration,
    pub excluded_registries: Vec<String>,
    pub mirror_platforms: Vec<String>,
}

impl Default for PusherOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            dry_pull: false,
            digest_pull: false,
            allow_different_digest_repush: true,
            request_timeout: Duration::ZERO,
            failure_cooldown: Duration::ZERO,
            excluded_registries: Vec::new(),
            mirror_platforms: Vec::new(),
        }
    }
}

/// What one mirror session will write to the target.
enum Pushable {
    Image {
        manifest: manifest::OciImageManifest,
        raw: Vec<u8>,
        media_type: String,
        digest: String,
    },
    Index {
        index: OciImageIndex,
        raw: Vec<u8>,
        media_type: String,
        digest: String,
        filtered: bool,
    },
}

impl Pushable {
    fn digest(&self) -> &str {
        match self {
            Pushable::Image { digest, .. } | Pushable::Index { digest, .. } => digest,
        }
    }
}

pub struct Pusher {
    target: Arc<dyn Target>,
    distribution: Arc<dyn Distribution>,
    transform: RepoPathTransformer,
    keychain: Keychain,
    dry_run: bool,
    dry_pull: bool,
    pull_by_digest: bool,
    allow_different_digest_repush: bool,
    request_timeout: Duration,
    mirror_platforms: Vec<PlatformSpec>,
    mirror_platform_keys: HashSet<String>,
    excluded_registries: Vec<String>,
    state: PushState,
}

impl Pusher {
    pub fn new(
        target: Arc<dyn Target>,
        distribution: Arc<dyn Distribution>,
        transform: RepoPathTransformer,
        keychain: Keychain,
        options: PusherOptions,
    ) -> Self {
        let (mirror_platforms, mirror_platform_keys) =
            parse_mirror_platforms(&options.mirror_platforms);
        Self {
            target,
            distribution,
            transform,
            keychain,
            dry_run: options.dry_run,
            dry_pull: options.dry_pull,
            pull_by_digest: options.digest_pull,
            allow_different_digest_repush: options.allow_different_digest_repush,
            request_timeout: options.request_timeout,
            mirror_platforms,
            mirror_platform_keys,
            excluded_registries: normalize_excluded_registries(&options.excluded_registries),
            state: PushState::new(options.failure_cooldown),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn dry_pull(&self) -> bool {
        self.dry_pull
    }

    pub fn reset_cooldown(&self) -> (usize, bool) {
        self.state.reset_cooldown()
    }

    pub fn cache_entries(&self) -> Vec<CacheEntry> {
        self.state.entries()
    }

    pub fn evict(&self, target: &str) -> bool {
        self.state.evict(target)
    }

    pub fn evict_prefix(&self, prefix: &str) -> Vec<String> {
        self.state.evict_prefix(prefix)
    }

    pub fn reset_cache(&self) -> Vec<String> {
        self.state.reset_cache()
    }

    /// Mirrors one image into the target registry.
    pub async fn mirror(&self, src: &str, meta: Metadata) -> Result<()> {
        let mut meta = meta;

        if let Some(prefix) = self.match_excluded_registry(src) {
            debug!(
                source = src,
                excluded_prefix = prefix,
                result = "skipped",
                "source matches excluded registry prefix, skipping"
            );
            return Ok(());
        }

        let src_ref: ImageReference = src.parse().map_err(|err| anyhow!("parse source: {err}"))?;

        let src_repo = src_ref.repository().to_owned();
        let mut repo = self.resolve_repo_path(&src_repo, &meta);
        let (mut target_str, mut target_ref) = self.build_target(&src_ref, &repo);

        debug!(source = src, target = %target_str, "resolved target reference");

        let source_is_digest = src_ref.digest().is_some();
        let normalized_id = normalize_image_id(&meta.image_id);
        let (pull_ref, pod_digest) = if self.pull_by_digest && !normalized_id.is_empty() {
            match digest_reference_from_image_id(&normalized_id, &src_ref) {
                Ok((digest, reference)) => {
                    debug!(source = src, image_id = normalized_id, "using pod imageID digest for pull");
                    (reference, Some(digest))
                }
                Err(err) => {
                    debug!(
                        source = src,
                        image_id = normalized_id,
                        error = %err,
                        "failed to parse digest from pod imageID"
                    );
                    (src_ref.clone(), None)
                }
            }
        } else {
            (src_ref.clone(), None)
        };

        if self.pull_by_digest && pod_digest.is_none() && !source_is_digest {
            debug!(
                source = src,
                target = %target_str,
                result = "skipped",
                "digest pull enabled but pod imageID digest is not available yet, skipping until it is reported"
            );
            return Ok(());
        }

        match self.state.begin(&target_str, Instant::now()) {
            Admission::Cooldown { retry_at } => {
                warn!(target = %target_str, "skipping image due to previous failure");
                return Err(RetryError {
                    cause: InCooldownError.into(),
                    retry_at,
                }
                .into());
            }
            Admission::AlreadyProcessed => {
                debug!(
                    target = %target_str,
                    result = "skipped",
                    dry_run = self.dry_run,
                    "image already processed during current run"
                );
                return Ok(());
            }
            Admission::Begin => {}
        }

        let (username, password) = match self.target.basic_auth().await {
            Ok(creds) => creds,
            Err(err) => {
                metrics::record_push_error(&target_str);
                return Err(self.failure_result(&target_str, err.context("auth")));
            }
        };
        let target_auth = if username.is_empty() && password.is_empty() {
            debug!(target = %target_str, "no target registry credentials provided, using anonymous access");
            RegistryAuth::Anonymous
        } else {
            debug!(target = %target_str, "using provided target registry credentials");
            RegistryAuth::Basic { username, password }
        };

        // Digest short-circuit: one HEAD settles whether the pod's exact
        // bytes are already mirrored.
        if self.pull_by_digest {
            if let Some(pod_digest) = &pod_digest {
                let digest_ref = if target_ref
                    .digest()
                    .map(|d| d.eq_ignore_ascii_case(pod_digest))
                    .unwrap_or(false)
                {
                    target_ref.clone()
                } else {
                    target_ref.clone_with_digest(pod_digest.clone())
                };
                match self.op(self.distribution.head_manifest(&digest_ref, &target_auth)).await {
                    Ok(Some(_)) => {
                        debug!(
                            target = %target_str,
                            digest = %pod_digest,
                            result = "skipped",
                            "image digest already present at target"
                        );
                        self.state.complete(&target_str, Some(pod_digest.clone()));
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(
                            target = %target_str,
                            digest = %pod_digest,
                            error = %err,
                            "unable to confirm existing digest"
                        );
                    }
                }
            }
        }

        let source_auth = self.keychain.resolve(pull_ref.registry());

        let meta_platform = platform_from_metadata(&meta);
        if let Some(node_platform) = &meta_platform {
            if !self.mirror_platform_keys.is_empty()
                && !self.mirror_platform_keys.contains(&node_platform.key())
            {
                warn!(
                    architecture = %node_platform.architecture,
                    os = %node_platform.os,
                    "node platform not configured in mirrorPlatforms; continuing with node-specific manifest"
                );
            }
        }
        let desired = self.desired_platforms(meta_platform.as_ref());
        let primary = desired.first().cloned();

        let fetched = match self.op(self.distribution.fetch_manifest(&pull_ref, &source_auth)).await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                let err = anyhow::Error::new(err);
                log_registry_auth_error(&err, "pull descriptor");
                metrics::record_pull_error(src);
                return Err(self.failure_result(&target_str, err.context(format!("describe {src}"))));
            }
        };

        debug!(source = src, "starting pull from source");
        debug!(source = src, percentage = "0%", "pull progress update");

        if self.dry_pull {
            debug!(
                source_reference = %pull_ref,
                result = "skipped",
                dry_pull = true,
                "dry pull: skipping source registry fetch"
            );
            return Ok(());
        }

        let media_is_index = fetched
            .media_type
            .as_deref()
            .map(manifest::is_index)
            .unwrap_or(false);
        if !media_is_index && desired.len() > 1 {
            log_unavailable_platforms(src, &desired[1..]);
        }

        let parsed = match Manifest::parse(fetched.media_type.as_deref(), &fetched.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                metrics::record_pull_error(src);
                return Err(self.failure_result(&target_str, anyhow!("load manifest {src}: {err}")));
            }
        };

        let mut selected_from_index = false;
        let pushable = match parsed {
            Manifest::Index(index) => {
                if self.pull_by_digest && desired.len() > 1 {
                    match self.filter_index(src, &index, &desired, &fetched) {
                        Ok(pushable) => pushable,
                        Err(err) => {
                            metrics::record_pull_error(src);
                            return Err(self.failure_result(
                                &target_str,
                                err.context(format!("filter index {src}")),
                            ));
                        }
                    }
                } else if !self.pull_by_digest || primary.is_none() {
                    let reason = if primary.is_none() {
                        "platform metadata unavailable"
                    } else {
                        "digestPull disabled"
                    };
                    debug!(
                        media_type = fetched.media_type.as_deref().unwrap_or_default(),
                        reason, "mirroring entire multi-architecture index"
                    );
                    Pushable::Index {
                        media_type: index_media_type(&fetched, &index),
                        index,
                        raw: fetched.payload.clone(),
                        digest: fetched.digest.clone(),
                        filtered: false,
                    }
                } else {
                    let descriptor = match select_image_descriptor(&index, primary.as_ref()) {
                        Ok(descriptor) => descriptor.clone(),
                        Err(err) => {
                            metrics::record_pull_error(src);
                            return Err(self.failure_result(
                                &target_str,
                                err.context(format!("resolve platform image {src}")),
                            ));
                        }
                    };
                    let child_ref = pull_ref.clone_with_digest(descriptor.digest.clone());
                    let child = match self
                        .op(self.distribution.fetch_manifest(&child_ref, &source_auth))
                        .await
                    {
                        Ok(child) => child,
                        Err(err) => {
                            let err = anyhow::Error::new(err);
                            log_registry_auth_error(&err, "pull");
                            metrics::record_pull_error(src);
                            return Err(
                                self.failure_result(&target_str, err.context(format!("pull {src}")))
                            );
                        }
                    };
                    let image = match serde_json::from_slice::<manifest::OciImageManifest>(&child.payload)
                    {
                        Ok(image) => image,
                        Err(err) => {
                            metrics::record_pull_error(src);
                            return Err(self.failure_result(
                                &target_str,
                                anyhow!("resolve platform image {src}: {err}"),
                            ));
                        }
                    };
                    selected_from_index = true;
                    Pushable::Image {
                        media_type: child
                            .media_type
                            .clone()
                            .unwrap_or_else(|| descriptor.media_type.clone()),
                        manifest: image,
                        raw: child.payload,
                        digest: child.digest,
                    }
                }
            }
            Manifest::Image(image) => Pushable::Image {
                media_type: fetched
                    .media_type
                    .clone()
                    .unwrap_or_else(|| manifest::DOCKER_MANIFEST_MEDIA_TYPE.to_owned()),
                manifest: image,
                raw: fetched.payload.clone(),
                digest: fetched.digest.clone(),
            },
        };

        if selected_from_index {
            debug!(
                media_type = fetched.media_type.as_deref().unwrap_or_default(),
                "digest pull enabled; mirroring platform-specific manifest from index"
            );
        }

        metrics::record_pull_success(src);
        debug!(source = src, "finished pulling image from source");
        debug!(source = src, percentage = "100%", "pull progress update");

        // Architecture becomes known only after the manifest is inspected;
        // the target moves when $arch expansion changes the repo path.
        if self.target.repo_prefix().contains("$arch") {
            let arch = self.resolve_architecture(&pushable, &pull_ref, &source_auth).await;
            if !arch.is_empty() {
                meta.architecture = arch;
                let new_repo = self.resolve_repo_path(&src_repo, &meta);
                if new_repo != repo {
                    let (new_target_str, new_target_ref) = self.build_target(&src_ref, &new_repo);
                    match self.state.reassign(&target_str, &new_target_str, Instant::now()) {
                        Admission::Cooldown { retry_at } => {
                            warn!(target = %new_target_str, "skipping image due to previous failure");
                            return Err(RetryError {
                                cause: InCooldownError.into(),
                                retry_at,
                            }
                            .into());
                        }
                        Admission::AlreadyProcessed => {
                            debug!(
                                target = %new_target_str,
                                result = "skipped",
                                "image already processed during current run"
                            );
                            return Ok(());
                        }
                        Admission::Begin => {
                            debug!(previous = %target_str, target = %new_target_str, "updating resolved target");
                            repo = new_repo;
                            target_str = new_target_str;
                            target_ref = new_target_ref;
                        }
                    }
                }
            }
        }

        let src_digest = pushable.digest().to_owned();

        match self.op(self.distribution.head_manifest(&target_ref, &target_auth)).await {
            Ok(Some(existing)) => {
                if existing == src_digest {
                    debug!(
                        target = %target_str,
                        digest = %src_digest,
                        dry_run = self.dry_run,
                        "image already present at target"
                    );
                    self.state.complete(&target_str, Some(src_digest));
                    return Ok(());
                }
                match &target_ref {
                    ImageReference::Tag { tag, .. } => {
                        if tag.eq_ignore_ascii_case("latest") {
                            debug!(
                                current_digest = %existing,
                                source_digest = %src_digest,
                                "image already present with different digest for latest tag, updating"
                            );
                        } else if !self.allow_different_digest_repush {
                            let err = anyhow!(
                                "target image {target_str} exists with digest {existing}, refusing to overwrite with source digest {src_digest}"
                            );
                            error!(target = %target_str, error = %err, "digest mismatch detected");
                            metrics::record_push_error(&target_str);
                            return Err(self.failure_result(&target_str, err));
                        } else {
                            debug!(
                                current_digest = %existing,
                                source_digest = %src_digest,
                                "image already present with different digest, updating per configuration"
                            );
                        }
                    }
                    ImageReference::Digest { .. } => {
                        debug!(
                            current_digest = %existing,
                            source_digest = %src_digest,
                            "image already present with different digest, updating"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                let err = anyhow::Error::new(err);
                log_registry_auth_error(&err, "target existence check");
                metrics::record_push_error(&target_str);
                return Err(self.failure_result(&target_str, err.context(format!("check {target_str}"))));
            }
        }

        if let Err(err) = self.target.ensure_repository(&repo).await {
            metrics::record_push_error(&target_str);
            return Err(self.failure_result(&target_str, err.context(format!("ensure repo {repo}"))));
        }

        if self.dry_run {
            debug!(target = %target_str, result = "skipped", dry_run = true, "dry run: skipping push");
            self.state.complete(&target_str, Some(src_digest));
            return Ok(());
        }

        info!(target = %target_str, digest = %src_digest, "pushing image to target");
        debug!(target = %target_str, percentage = "0%", "push progress update");

        let (tx, rx) = mpsc::channel(16);
        let progress_task = tokio::spawn(log_progress_updates(target_str.clone(), rx));

        let push_result = self
            .push(&pushable, &pull_ref, &target_ref, &source_auth, &target_auth, tx)
            .await;
        // The sender is gone once push returns; join the consumer so the
        // final progress line precedes the outcome log.
        let _ = progress_task.await;

        if let Err(err) = push_result {
            log_registry_auth_error(&err, "push");
            metrics::record_push_error(&target_str);
            return Err(self.failure_result(&target_str, err.context(format!("push {target_str}"))));
        }

        let mut target_digest = src_digest.clone();
        match self.op(self.distribution.head_manifest(&target_ref, &target_auth)).await {
            Ok(Some(observed)) => {
                target_digest = observed;
                if target_digest == src_digest {
                    info!(target = %target_str, digest = %target_digest, "finished pushing image");
                } else {
                    info!(
                        target = %target_str,
                        source_digest = %src_digest,
                        target_digest = %target_digest,
                        "finished pushing image with different digest at target"
                    );
                }
            }
            Ok(None) => {
                debug!(target = %target_str, reason = "manifest not found", "unable to confirm target digest after push");
                info!(target = %target_str, digest = %target_digest, "finished pushing image");
            }
            Err(OpError::Timeout) => {
                debug!(target = %target_str, reason = "timed out", "unable to confirm target digest after push");
                info!(target = %target_str, digest = %target_digest, "finished pushing image");
            }
            Err(err) => {
                debug!(target = %target_str, error = %err, "unable to confirm target digest after push");
                info!(target = %target_str, digest = %target_digest, "finished pushing image");
            }
        }

        self.state.complete(&target_str, Some(target_digest));
        metrics::record_push_success(&target_str);
        Ok(())
    }

    /// Builds the curated index for the desired platforms. Falls back to the
    /// full index when nothing matches.
    fn filter_index(
        &self,
        src: &str,
        index: &OciImageIndex,
        desired: &[PlatformSpec],
        fetched: &crate::distribution::FetchedManifest,
    ) -> Result<Pushable> {
        let mut matched_entries: Vec<OciDescriptor> = Vec::with_capacity(desired.len());
        let mut matched: Vec<PlatformSpec> = Vec::new();
        let mut missing: Vec<PlatformSpec> = Vec::new();
        for spec in desired {
            match find_descriptor_for_spec(index, spec) {
                Some(descriptor) => {
                    matched_entries.push(descriptor.clone());
                    matched.push(spec.clone());
                }
                None => missing.push(spec.clone()),
            }
        }

        if matched.is_empty() {
            info!(
                source = src,
                requested_platforms = ?specs_to_strings(desired),
                "configured mirrorPlatforms not found in source index; mirroring full index"
            );
            return Ok(Pushable::Index {
                media_type: index_media_type(fetched, index),
                index: index.clone(),
                raw: fetched.payload.clone(),
                digest: fetched.digest.clone(),
                filtered: false,
            });
        }

        if !missing.is_empty() {
            log_unavailable_platforms(src, &missing);
            info!(
                source = src,
                missing_platforms = ?specs_to_strings(&missing),
                "some configured mirrorPlatforms missing from source index"
            );
        }
        debug!(
            source = src,
            platforms = ?specs_to_strings(&matched),
            "mirroring configured subset of multi-architecture index"
        );

        let filtered = OciImageIndex {
            schema_version: index.schema_version,
            media_type: index.media_type.clone(),
            manifests: matched_entries,
            annotations: index.annotations.clone(),
        };
        let raw = serde_json::to_vec(&filtered).context("serialize filtered index")?;
        let digest = manifest::digest_of(&raw);
        Ok(Pushable::Index {
            media_type: index_media_type(fetched, &filtered),
            index: filtered,
            raw,
            digest,
            filtered: true,
        })
    }

    /// Copies blobs and manifests for one pushable to the target.
    async fn push(
        &self,
        pushable: &Pushable,
        pull_ref: &ImageReference,
        target_ref: &ImageReference,
        source_auth: &RegistryAuth,
        target_auth: &RegistryAuth,
        tx: mpsc::Sender<ProgressUpdate>,
    ) -> Result<()> {
        let src_addr = RepoAddress::of(pull_ref);
        let dst_addr = RepoAddress::of(target_ref);

        match pushable {
            Pushable::Image {
                manifest: image,
                raw,
                media_type,
                ..
            } => {
                let blobs = dedup_blobs(image_blobs(image));
                let total = blob_total(&blobs);
                let progress = BlobProgress::new(total, tx);
                self.copy_missing_blobs(&src_addr, &dst_addr, &blobs, source_auth, target_auth, &progress)
                    .await?;
                self.op(self.distribution.put_manifest(target_ref, media_type, raw, target_auth))
                    .await
                    .map_err(anyhow::Error::new)?;
            }
            Pushable::Index {
                index,
                raw,
                media_type,
                filtered,
                ..
            } => {
                // Resolve the manifest tree first: children already present
                // at the target are skipped entirely.
                let mut stack: Vec<OciDescriptor> = index.manifests.clone();
                let mut child_manifests: Vec<(String, String, Vec<u8>)> = Vec::new();
                let mut blobs: Vec<OciDescriptor> = Vec::new();
                while let Some(entry) = stack.pop() {
                    let target_child = target_ref.clone_with_digest(entry.digest.clone());
                    match self.op(self.distribution.head_manifest(&target_child, target_auth)).await {
                        Ok(Some(_)) => {
                            debug!(
                                digest = %entry.digest,
                                "platform-specific manifest already present at target"
                            );
                            continue;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            if *filtered {
                                return Err(anyhow::Error::new(err)
                                    .context(format!("check platform manifest {}", entry.digest)));
                            }
                        }
                    }
                    let child_ref = pull_ref.clone_with_digest(entry.digest.clone());
                    let child = self
                        .op(self.distribution.fetch_manifest(&child_ref, source_auth))
                        .await
                        .map_err(anyhow::Error::new)?;
                    match Manifest::parse(child.media_type.as_deref(), &child.payload)? {
                        Manifest::Image(image) => blobs.extend(image_blobs(&image)),
                        Manifest::Index(nested) => stack.extend(nested.manifests.clone()),
                    }
                    child_manifests.push((
                        entry.digest.clone(),
                        child.media_type.clone().unwrap_or_else(|| entry.media_type.clone()),
                        child.payload,
                    ));
                }

                let blobs = dedup_blobs(blobs);
                let total = blob_total(&blobs);
                let progress = BlobProgress::new(total, tx);
                self.copy_missing_blobs(&src_addr, &dst_addr, &blobs, source_auth, target_auth, &progress)
                    .await?;

                // Children go first so the index never references a missing
                // manifest; reverse discovery order puts nested leaves ahead
                // of their parents.
                for (digest, child_media_type, payload) in child_manifests.iter().rev() {
                    let child_target = target_ref.clone_with_digest(digest.clone());
                    self.op(self.distribution.put_manifest(
                        &child_target,
                        child_media_type,
                        payload,
                        target_auth,
                    ))
                    .await
                    .map_err(anyhow::Error::new)?;
                }
                self.op(self.distribution.put_manifest(target_ref, media_type, raw, target_auth))
                    .await
                    .map_err(anyhow::Error::new)?;
            }
        }
        Ok(())
    }

    async fn copy_missing_blobs(
        &self,
        src: &RepoAddress,
        dst: &RepoAddress,
        blobs: &[OciDescriptor],
        source_auth: &RegistryAuth,
        target_auth: &RegistryAuth,
        progress: &BlobProgress,
    ) -> Result<()> {
        for blob in blobs {
            let exists = self
                .op(self.distribution.blob_exists(dst, &blob.digest, target_auth))
                .await
                .map_err(anyhow::Error::new)?;
            if exists {
                progress.add(blob.size.max(0) as u64);
                continue;
            }
            self.op(self.distribution.copy_blob(
                src,
                source_auth,
                dst,
                target_auth,
                &blob.digest,
                Some(progress),
            ))
            .await
            .map_err(anyhow::Error::new)?;
        }
        Ok(())
    }

    /// The architecture the mirrored content runs on: the config file value
    /// for a single image, the sorted unique architecture list for an index.
    async fn resolve_architecture(
        &self,
        pushable: &Pushable,
        pull_ref: &ImageReference,
        source_auth: &RegistryAuth,
    ) -> String {
        match pushable {
            Pushable::Index { index, .. } => {
                let mut seen = BTreeSet::new();
                for entry in &index.manifests {
                    if let Some(platform) = &entry.platform {
                        let arch = platform.architecture.trim();
                        if !arch.is_empty() && !arch.eq_ignore_ascii_case("unknown") {
                            seen.insert(arch.to_owned());
                        }
                    }
                }
                if seen.is_empty() {
                    "multiarch".to_owned()
                } else {
                    seen.into_iter().collect::<Vec<_>>().join("-")
                }
            }
            Pushable::Image { manifest: image, .. } => {
                let src_addr = RepoAddress::of(pull_ref);
                match self
                    .op(self.distribution.fetch_blob(&src_addr, &image.config.digest, source_auth))
                    .await
                {
                    Ok(payload) => serde_json::from_slice::<ImageConfig>(&payload)
                        .map(|config| config.architecture.trim().to_owned())
                        .unwrap_or_default(),
                    Err(err) => {
                        debug!(error = %err, "unable to resolve image architecture from config");
                        String::new()
                    }
                }
            }
        }
    }

    fn build_target(&self, src_ref: &ImageReference, repo: &str) -> (String, ImageReference) {
        let registry = self.target.registry();
        let reference = match src_ref {
            ImageReference::Tag { tag, .. } => ImageReference::with_tag(registry, repo, tag.clone()),
            // The original tag wins for the destination when the source
            // carried both tag and digest.
            ImageReference::Digest { tag: Some(tag), .. } => {
                ImageReference::with_tag(registry, repo, tag.clone())
            }
            ImageReference::Digest { digest, tag: None, .. } => {
                ImageReference::with_digest(registry, repo, digest.clone())
            }
        };
        (reference.whole(), reference)
    }

    fn resolve_repo_path(&self, src_repo: &str, meta: &Metadata) -> String {
        let cleaned = self.transform.apply(src_repo);
        let prefix = expand_repo_prefix(self.target.repo_prefix(), meta);
        if prefix.is_empty() {
            return cleaned;
        }
        if cleaned.is_empty() {
            return crate::paths::clean_repo_name(&prefix);
        }
        let combined = format!("{}/{}", prefix.trim_end_matches('/'), cleaned);
        crate::paths::clean_repo_name(&combined)
    }

    fn desired_platforms(&self, meta_platform: Option<&PlatformSpec>) -> Vec<PlatformSpec> {
        let mut desired = Vec::with_capacity(self.mirror_platforms.len() + 1);
        let mut seen = HashSet::with_capacity(self.mirror_platforms.len() + 1);
        if let Some(spec) = meta_platform {
            seen.insert(spec.key());
            desired.push(spec.clone());
        }
        for spec in &self.mirror_platforms {
            if seen.insert(spec.key()) {
                desired.push(spec.clone());
            }
        }
        desired
    }

    fn match_excluded_registry(&self, src: &str) -> Option<&str> {
        if self.excluded_registries.is_empty() {
            return None;
        }
        let normalized = normalize_image_reference(src);
        if normalized.is_empty() {
            return None;
        }
        self.excluded_registries
            .iter()
            .find(|prefix| has_boundary_prefix(&normalized, prefix))
            .map(String::as_str)
    }

    /// Records the failure and wraps the cause per cooldown policy.
    fn failure_result(&self, target: &str, cause: anyhow::Error) -> anyhow::Error {
        match self.state.fail(target, Instant::now()) {
            Some(retry_at) => RetryError { cause, retry_at }.into(),
            None => cause,
        }
    }

    /// Applies the per-operation timeout to a registry call.
    async fn op<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, DistributionError>>,
    ) -> Result<T, OpError> {
        if self.request_timeout.is_zero() {
            return fut.await.map_err(OpError::from);
        }
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(OpError::from),
            Err(_) => Err(OpError::Timeout),
        }
    }
}

fn image_blobs(image: &manifest::OciImageManifest) -> Vec<OciDescriptor> {
    let mut blobs = Vec::with_capacity(image.layers.len() + 1);
    blobs.push(image.config.clone());
    blobs.extend(image.layers.iter().cloned());
    blobs
}

fn dedup_blobs(blobs: Vec<OciDescriptor>) -> Vec<OciDescriptor> {
    let mut seen = HashSet::new();
    blobs
        .into_iter()
        .filter(|blob| seen.insert(blob.digest.clone()))
        .collect()
}

fn blob_total(blobs: &[OciDescriptor]) -> u64 {
    blobs.iter().map(|blob| blob.size.max(0) as u64).sum()
}

fn index_media_type(
    fetched: &crate::distribution::FetchedManifest,
    index: &OciImageIndex,
) -> String {
    fetched
        .media_type
        .clone()
        .or_else(|| index.media_type.clone())
        .unwrap_or_else(|| manifest::OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned())
}

/// Derives the pull digest from a runtime-reported image ID: either a full
/// `repo@digest` reference or a bare digest applied to the source context.
fn digest_reference_from_image_id(
    image_id: &str,
    src: &ImageReference,
) -> Result<(String, ImageReference)> {
    if image_id.is_empty() {
        bail!("empty imageID");
    }
    if image_id.contains('@') {
        let reference: ImageReference = image_id.parse().map_err(|err| anyhow!("{err}"))?;
        let digest = reference
            .digest()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("imageID carries no digest"))?;
        return Ok((digest, reference));
    }
    if !is_valid_digest(image_id) {
        bail!("imageID {image_id:?} is not a digest");
    }
    Ok((image_id.to_owned(), src.clone_with_digest(image_id)))
}

fn platform_from_metadata(meta: &Metadata) -> Option<PlatformSpec> {
    let arch = meta.architecture.trim();
    if arch.is_empty() {
        return None;
    }
    let os = meta.os.trim();
    Some(PlatformSpec {
        os: if os.is_empty() { "linux".to_owned() } else { os.to_owned() },
        architecture: arch.to_owned(),
    })
}

/// Picks one runnable manifest from an index, preferring the requested
/// platform and falling back to the first runnable entry.
fn select_image_descriptor<'a>(
    index: &'a OciImageIndex,
    platform: Option<&PlatformSpec>,
) -> Result<&'a OciDescriptor> {
    if index.manifests.is_empty() {
        bail!("image index has no manifests");
    }
    let runnable: Vec<&OciDescriptor> = index
        .manifests
        .iter()
        .filter(|d| descriptor_is_runnable(d))
        .collect();
    if runnable.is_empty() {
        bail!("image index has no runnable manifests");
    }
    if let Some(platform) = platform {
        for candidate in &runnable {
            if platform.matches(candidate) {
                return Ok(candidate);
            }
        }
    }
    Ok(runnable[0])
}

fn find_descriptor_for_spec<'a>(
    index: &'a OciImageIndex,
    spec: &PlatformSpec,
) -> Option<&'a OciDescriptor> {
    index
        .manifests
        .iter()
        .find(|d| descriptor_is_runnable(d) && spec.matches(d))
}

fn specs_to_strings(specs: &[PlatformSpec]) -> Vec<String> {
    specs.iter().map(PlatformSpec::to_string).collect()
}

/// One warning per platform the source cannot offer.
fn log_unavailable_platforms(src: &str, specs: &[PlatformSpec]) {
    let mut seen = HashSet::new();
    for spec in specs {
        let platform = spec.to_string();
        if platform.is_empty() || !seen.insert(platform.clone()) {
            continue;
        }
        warn!(source = src, platform = %platform, "image does not offer platform");
    }
}

/// Surfaces registry credential rejections with their diagnostics.
fn log_registry_auth_error(err: &anyhow::Error, phase: &str) {
    let distribution_err = err
        .downcast_ref::<OpError>()
        .and_then(|op| match op {
            OpError::Distribution(d) => Some(d),
            OpError::Timeout => None,
        })
        .or_else(|| err.downcast_ref::<DistributionError>());
    if let Some(d) = distribution_err {
        if d.is_auth_error() {
            error!(
                phase,
                status_code = d.status().unwrap_or_default(),
                details = ?d.details(),
                error = %d,
                "authentication to registry failed"
            );
        }
    }
}

fn expand_repo_prefix(prefix: &str, meta: &Metadata) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return String::new();
    }
    let expanded = prefix
        .replace("$namespace", &meta.namespace)
        .replace("$podname", &meta.pod_name)
        .replace("$container_name", &meta.container_name)
        .replace("$arch", &meta.architecture);
    let expanded = expanded.trim();
    expanded
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_excluded_registries(provided: &[String]) -> Vec<String> {
    let mut unique: BTreeSet<String> = BTreeSet::new();
    for value in provided {
        let normalized = normalize_registry_prefix(value);
        if !normalized.is_empty() {
            unique.insert(normalized);
        }
    }
    unique.into_iter().collect()
}

fn normalize_registry_prefix(value: &str) -> String {
    let trimmed = value.trim().to_lowercase();
    let trimmed = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed);
    trimmed.trim_end_matches('/').to_owned()
}

fn normalize_image_reference(value: &str) -> String {
    let trimmed = value.trim().to_lowercase();
    let trimmed = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed);
    trimmed.to_owned()
}

/// Prefix match at a token boundary: the next character is `/`, `:`, `@`, or
/// the string ends.
fn has_boundary_prefix(s: &str, prefix: &str) -> bool {
    if prefix.is_empty() || !s.starts_with(prefix) {
        return false;
    }
    match s.as_bytes().get(prefix.len()) {
        None => true,
        Some(b'/') | Some(b':') | Some(b'@') => true,
        Some(_) => false,
    }
}

async fn log_progress_updates(target: String, mut rx: mpsc::Receiver<ProgressUpdate>) {
    const STEP: f64 = 10.0;
    let mut next_threshold = STEP;
    let mut logged_final = false;

    while let Some(update) = rx.recv().await {
        if update.total == 0 {
            continue;
        }
        let percent = (update.complete as f64 / update.total as f64) * 100.0;
        while percent >= next_threshold && next_threshold < 100.0 {
            debug!(
                target = %target,
                percentage = format!("{next_threshold:.0}%"),
                complete_bytes = update.complete,
                total_bytes = update.total,
                "push progress update"
            );
            next_threshold += STEP;
        }
        if percent >= 100.0 && !logged_final {
            debug!(
                target = %target,
                percentage = "100%",
                complete_bytes = update.complete,
                total_bytes = update.total,
                "push progress update"
            );
            logged_final = true;
        }
    }

    if !logged_final {
        debug!(target = %target, percentage = "100%", "push progress update");
    }
}

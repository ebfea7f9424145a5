//! # Workload Reconcilers
//!
//! One controller per watched kind. Each handler applies the namespace and
//! name filters, extracts the pod spec and hands every image to the mirror
//! engine. Pod handlers additionally consult the owner chain, the pod phase
//! and the runtime-reported image IDs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::images::{image_id_for_container, images_from_pod_spec};
use crate::mirror::{Metadata, Pusher, RetryError};

/// Requeue interval for non-retryable mirror errors.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Requeue interval after a handler-level (Kubernetes API) error.
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// A Kubernetes resource kind the controller can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployments,
    StatefulSets,
    DaemonSets,
    Jobs,
    CronJobs,
    Pods,
}

impl ResourceKind {
    /// Every supported kind, in deterministic order.
    pub fn all() -> Vec<ResourceKind> {
        vec![
            ResourceKind::Deployments,
            ResourceKind::StatefulSets,
            ResourceKind::DaemonSets,
            ResourceKind::Jobs,
            ResourceKind::CronJobs,
            ResourceKind::Pods,
        ]
    }

    pub fn parse(value: &str) -> Option<ResourceKind> {
        match value.trim().to_lowercase().as_str() {
            "deployments" => Some(ResourceKind::Deployments),
            "statefulsets" => Some(ResourceKind::StatefulSets),
            "daemonsets" => Some(ResourceKind::DaemonSets),
            "jobs" => Some(ResourceKind::Jobs),
            "cronjobs" => Some(ResourceKind::CronJobs),
            "pods" => Some(ResourceKind::Pods),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployments => "deployments",
            ResourceKind::StatefulSets => "statefulsets",
            ResourceKind::DaemonSets => "daemonsets",
            ResourceKind::Jobs => "jobs",
            ResourceKind::CronJobs => "cronjobs",
            ResourceKind::Pods => "pods",
        }
    }
}

/// Converts raw resource strings to kinds, reporting unsupported entries.
pub fn parse_watch_resources(values: &[String]) -> (Vec<ResourceKind>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut parsed = Vec::new();
    let mut invalid = Vec::new();
    for raw in values {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        match ResourceKind::parse(trimmed) {
            Some(kind) => {
                if seen.insert(kind) {
                    parsed.push(kind);
                }
            }
            None => invalid.push(raw.clone()),
        }
    }
    (parsed, invalid)
}

/// Matches workload names: `*` matches everything, `ns/name` is
/// namespace-qualified, a bare name matches in any namespace.
#[derive(Debug, Default)]
pub struct NameMatcher {
    match_all: bool,
    any: HashSet<String>,
    namespaced: HashMap<String, HashSet<String>>,
}

impl NameMatcher {
    pub fn new(values: &[String]) -> Self {
        let mut matcher = NameMatcher::default();
        for raw in values {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            if name == "*" {
                matcher.match_all = true;
                continue;
            }
            if let Some((ns, value)) = name.split_once('/') {
                let ns = ns.trim();
                let value = value.trim();
                if ns.is_empty() || value.is_empty() {
                    continue;
                }
                matcher
                    .namespaced
                    .entry(ns.to_owned())
                    .or_default()
                    .insert(value.to_owned());
                continue;
            }
            matcher.any.insert(name.to_owned());
        }
        matcher
    }

    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        if self.match_all {
            return true;
        }
        if self.any.contains(name) {
            return true;
        }
        self.namespaced
            .get(namespace)
            .map(|names| names.contains(name))
            .unwrap_or(false)
    }
}

/// Shared rule set and collaborators for every workload handler.
pub struct ReconcileContext {
    pub client: Client,
    pub pusher: Arc<Pusher>,
    allowed_namespaces: Vec<String>,
    skipped_namespaces: HashSet<String>,
    pub skip_deployments: NameMatcher,
    pub skip_stateful_sets: NameMatcher,
    pub skip_daemon_sets: NameMatcher,
    pub skip_jobs: NameMatcher,
    pub skip_cron_jobs: NameMatcher,
    pub skip_pods: NameMatcher,
    check_node_platform: bool,
}

impl ReconcileContext {
    pub fn new(client: Client, pusher: Arc<Pusher>, settings: &Settings) -> Self {
        Self {
            client,
            pusher,
            allowed_namespaces: settings.allowed_namespaces.clone(),
            skipped_namespaces: settings
                .skip_namespaces
                .iter()
                .map(|ns| ns.trim().to_owned())
                .filter(|ns| !ns.is_empty())
                .collect(),
            skip_deployments: NameMatcher::new(&settings.skip_names.deployments),
            skip_stateful_sets: NameMatcher::new(&settings.skip_names.stateful_sets),
            skip_daemon_sets: NameMatcher::new(&settings.skip_names.daemon_sets),
            skip_jobs: NameMatcher::new(&settings.skip_names.jobs),
            skip_cron_jobs: NameMatcher::new(&settings.skip_names.cron_jobs),
            skip_pods: NameMatcher::new(&settings.skip_names.pods),
            check_node_platform: settings.check_node_platform,
        }
    }

    pub fn ns_allowed(&self, namespace: &str) -> bool {
        if self.skipped_namespaces.contains(namespace) {
            return false;
        }
        if self.allowed_namespaces.is_empty() {
            return true;
        }
        if self.allowed_namespaces.len() == 1 && self.allowed_namespaces[0].trim() == "*" {
            return true;
        }
        self.allowed_namespaces
            .iter()
            .any(|allowed| allowed.trim() == namespace)
    }

    /// Mirrors every image of a pod spec, continuing after failures and
    /// remembering the first error. Returns the mirrored-image count.
    pub async fn mirror_pod_spec(
        &self,
        namespace: &str,
        pod_name: &str,
        spec: &PodSpec,
        pod: Option<&Pod>,
        platform: Option<&(String, String)>,
    ) -> (usize, Option<anyhow::Error>) {
        if !self.ns_allowed(namespace) {
            return (0, None);
        }
        let images = images_from_pod_spec(spec);
        let mut mirrored = 0;
        let mut first_error: Option<anyhow::Error> = None;
        for pod_image in images {
            let mut meta = Metadata {
                namespace: namespace.to_owned(),
                pod_name: pod_name.to_owned(),
                container_name: pod_image.container_name.clone(),
                ..Default::default()
            };
            if let Some(pod) = pod {
                if let Some(image_id) = image_id_for_container(pod, &pod_image.container_name) {
                    meta.image_id = image_id;
                }
            }
            if let Some((architecture, os)) = platform {
                meta.architecture = architecture.clone();
                meta.os = os.clone();
            }
            match self.pusher.mirror(&pod_image.image, meta).await {
                Ok(()) => mirrored += 1,
                Err(err) => {
                    warn!(
                        namespace,
                        pod = pod_name,
                        image = %pod_image.image,
                        error = %err,
                        "mirror failed, continuing with remaining images"
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        (mirrored, first_error)
    }

    /// Shared tail of every handler: mirror, then derive the requeue
    /// decision from the first error seen.
    async fn process_pod_spec(
        &self,
        namespace: &str,
        pod_name: &str,
        spec: &PodSpec,
        pod: Option<&Pod>,
        platform: Option<&(String, String)>,
    ) -> Result<Action, ReconcileError> {
        let (_, error) = self
            .mirror_pod_spec(namespace, pod_name, spec, pod, platform)
            .await;
        match error {
            None => Ok(Action::await_change()),
            Some(err) => match err.downcast_ref::<RetryError>() {
                Some(retry) => {
                    let delay = retry.retry_at.saturating_duration_since(Instant::now());
                    let delay = if delay.is_zero() { DEFAULT_RETRY_DELAY } else { delay };
                    Ok(Action::requeue(delay))
                }
                None => Ok(Action::requeue(DEFAULT_RETRY_DELAY)),
            },
        }
    }

    /// Owner-chain skip for pods. Missing intermediate objects never skip.
    pub async fn should_skip_pod(&self, pod: &Pod) -> Result<bool, kube::Error> {
        let namespace = pod.namespace().unwrap_or_default();
        if self.skip_pods.matches(&namespace, &pod.name_any()) {
            return Ok(true);
        }
        for owner in pod.owner_references() {
            match owner.kind.as_str() {
                "ReplicaSet" => {
                    if self.replica_set_owner_skipped(&namespace, &owner.name).await? {
                        return Ok(true);
                    }
                }
                "Deployment" => {
                    if self.skip_deployments.matches(&namespace, &owner.name) {
                        return Ok(true);
                    }
                }
                "StatefulSet" => {
                    if self.skip_stateful_sets.matches(&namespace, &owner.name) {
                        return Ok(true);
                    }
                }
                "DaemonSet" => {
                    if self.skip_daemon_sets.matches(&namespace, &owner.name) {
                        return Ok(true);
                    }
                }
                "Job" => {
                    if self.job_owner_skipped(&namespace, &owner.name).await? {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    async fn replica_set_owner_skipped(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, kube::Error> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(replica_set) = api.get_opt(name).await? else {
            return Ok(false);
        };
        for owner in replica_set.owner_references() {
            if owner.kind == "Deployment" && self.skip_deployments.matches(namespace, &owner.name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn job_owner_skipped(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        if self.skip_jobs.matches(namespace, name) {
            return Ok(true);
        }
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let Some(job) = api.get_opt(name).await? else {
            return Ok(false);
        };
        for owner in job.owner_references() {
            if owner.kind == "CronJob" && self.skip_cron_jobs.matches(namespace, &owner.name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Architecture and OS of the node the pod runs on, when known.
    pub async fn node_platform(&self, pod: &Pod) -> Option<(String, String)> {
        let node_name = pod.spec.as_ref()?.node_name.clone()?;
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get_opt(&node_name).await {
            Ok(Some(node)) => node
                .status
                .and_then(|status| status.node_info)
                .map(|info| (info.architecture, info.operating_system)),
            Ok(None) => None,
            Err(err) => {
                debug!(node = %node_name, error = %err, "unable to read node platform");
                None
            }
        }
    }
}

pub async fn reconcile_deployment(
    obj: Arc<Deployment>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) || ctx.skip_deployments.matches(&namespace, &name) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw Deployment");
    let Some(spec) = obj.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, None, None).await
}

pub async fn reconcile_stateful_set(
    obj: Arc<StatefulSet>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) || ctx.skip_stateful_sets.matches(&namespace, &name) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw StatefulSet");
    let Some(spec) = obj.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, None, None).await
}

pub async fn reconcile_daemon_set(
    obj: Arc<DaemonSet>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) || ctx.skip_daemon_sets.matches(&namespace, &name) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw DaemonSet");
    let Some(spec) = obj.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, None, None).await
}

pub async fn reconcile_job(
    obj: Arc<Job>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) || ctx.skip_jobs.matches(&namespace, &name) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw Job");
    let Some(spec) = obj.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, None, None).await
}

pub async fn reconcile_cron_job(
    obj: Arc<CronJob>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) || ctx.skip_cron_jobs.matches(&namespace, &name) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw CronJob");
    let Some(spec) = obj
        .spec
        .as_ref()
        .and_then(|s| s.job_template.spec.as_ref())
        .and_then(|s| s.template.spec.as_ref())
    else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, None, None).await
}

pub async fn reconcile_pod(
    obj: Arc<Pod>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if !ctx.ns_allowed(&namespace) {
        return Ok(Action::await_change());
    }
    debug!(namespace = %namespace, name = %name, "saw Pod");
    if ctx.should_skip_pod(&obj).await? {
        return Ok(Action::await_change());
    }
    let phase = obj
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default();
    if phase != "Pending" && phase != "Running" {
        return Ok(Action::await_change());
    }
    let platform = if ctx.check_node_platform {
        ctx.node_platform(&obj).await
    } else {
        None
    };
    let Some(spec) = obj.spec.as_ref() else {
        return Ok(Action::await_change());
    };
    ctx.process_pod_spec(&namespace, &name, spec, Some(&obj), platform.as_ref())
        .await
}

fn error_policy<K>(_obj: Arc<K>, err: &ReconcileError, _ctx: Arc<ReconcileContext>) -> Action
where
    K: Resource,
{
    error!(error = %err, "reconciliation error");
    Action::requeue(ERROR_REQUEUE_DELAY)
}

fn controller_future<K, R, F>(
    ctx: Arc<ReconcileContext>,
    config: controller::Config,
    reconcile: R,
) -> BoxFuture<'static, ()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    R: Fn(Arc<K>, Arc<ReconcileContext>) -> F + Send + Sync + 'static,
    F: std::future::Future<Output = Result<Action, ReconcileError>> + Send + 'static,
{
    let api: Api<K> = Api::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default())
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                debug!(error = %err, "reconcile stream error");
            }
        })
        .boxed()
}

/// Starts one controller per watched kind and drives them until shutdown.
pub async fn run_controllers(
    ctx: Arc<ReconcileContext>,
    watch: Vec<ResourceKind>,
    max_concurrent: usize,
) {
    let watch = if watch.is_empty() { ResourceKind::all() } else { watch };
    let config = controller::Config::default().concurrency(max_concurrent.max(1) as u16);

    let mut controllers: Vec<BoxFuture<'static, ()>> = Vec::with_capacity(watch.len());
    for kind in watch {
        let fut = match kind {
            ResourceKind::Deployments => controller_future::<Deployment, _, _>(
                ctx.clone(),
                config.clone(),
                reconcile_deployment,
            ),
            ResourceKind::StatefulSets => controller_future::<StatefulSet, _, _>(
                ctx.clone(),
                config.clone(),
                reconcile_stateful_set,
            ),
            ResourceKind::DaemonSets => controller_future::<DaemonSet, _, _>(
                ctx.clone(),
                config.clone(),
                reconcile_daemon_set,
            ),
            ResourceKind::Jobs => {
                controller_future::<Job, _, _>(ctx.clone(), config.clone(), reconcile_job)
            }
            ResourceKind::CronJobs => {
                controller_future::<CronJob, _, _>(ctx.clone(), config.clone(), reconcile_cron_job)
            }
            ResourceKind::Pods => {
                controller_future::<Pod, _, _>(ctx.clone(), config.clone(), reconcile_pod)
            }
        };
        controllers.push(fut);
    }

    futures::future::join_all(controllers).await;
}

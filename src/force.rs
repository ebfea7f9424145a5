//! On-demand full reconciliation.
//!
//! Lists every watched kind in deterministic order and pushes each workload
//! through the same mirror path the event handlers use. Failures are
//! accumulated rather than short-circuiting so one sweep reports across the
//! whole cluster.

use std::sync::Arc;

use anyhow::anyhow;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::info;

use crate::reconciler::{ReconcileContext, ResourceKind};

pub struct ForceReconciler {
    ctx: Arc<ReconcileContext>,
    watch: Vec<ResourceKind>,
}

/// Outcome of a sweep: workloads visited, images mirrored, joined error.
pub type ForceOutcome = (usize, usize, Option<anyhow::Error>);

impl ForceReconciler {
    pub fn new(ctx: Arc<ReconcileContext>, watch: Vec<ResourceKind>) -> Self {
        let watch = if watch.is_empty() { ResourceKind::all() } else { watch };
        Self { ctx, watch }
    }

    pub async fn force_reconcile(&self) -> ForceOutcome {
        let mut workloads = 0usize;
        let mut images = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for kind in &self.watch {
            info!(resource = kind.as_str(), "force reconciling resource kind");
            match kind {
                ResourceKind::Deployments => {
                    let api: Api<Deployment> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace)
                            || self.ctx.skip_deployments.matches(&namespace, &name)
                        {
                            continue;
                        }
                        let Some(spec) =
                            item.spec.as_ref().and_then(|s| s.template.spec.as_ref())
                        else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, None, None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("deployment {namespace}/{name}: {err}"));
                        }
                    }
                }
                ResourceKind::StatefulSets => {
                    let api: Api<StatefulSet> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace)
                            || self.ctx.skip_stateful_sets.matches(&namespace, &name)
                        {
                            continue;
                        }
                        let Some(spec) =
                            item.spec.as_ref().and_then(|s| s.template.spec.as_ref())
                        else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, None, None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("statefulset {namespace}/{name}: {err}"));
                        }
                    }
                }
                ResourceKind::DaemonSets => {
                    let api: Api<DaemonSet> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace)
                            || self.ctx.skip_daemon_sets.matches(&namespace, &name)
                        {
                            continue;
                        }
                        let Some(spec) =
                            item.spec.as_ref().and_then(|s| s.template.spec.as_ref())
                        else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, None, None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("daemonset {namespace}/{name}: {err}"));
                        }
                    }
                }
                ResourceKind::Jobs => {
                    let api: Api<Job> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace)
                            || self.ctx.skip_jobs.matches(&namespace, &name)
                        {
                            continue;
                        }
                        let Some(spec) =
                            item.spec.as_ref().and_then(|s| s.template.spec.as_ref())
                        else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, None, None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("job {namespace}/{name}: {err}"));
                        }
                    }
                }
                ResourceKind::CronJobs => {
                    let api: Api<CronJob> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace)
                            || self.ctx.skip_cron_jobs.matches(&namespace, &name)
                        {
                            continue;
                        }
                        let Some(spec) = item
                            .spec
                            .as_ref()
                            .and_then(|s| s.job_template.spec.as_ref())
                            .and_then(|s| s.template.spec.as_ref())
                        else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, None, None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("cronjob {namespace}/{name}: {err}"));
                        }
                    }
                }
                ResourceKind::Pods => {
                    let api: Api<Pod> = Api::all(self.ctx.client.clone());
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) => return (workloads, images, Some(err.into())),
                    };
                    for item in list {
                        let namespace = item.namespace().unwrap_or_default();
                        let name = item.name_any();
                        if !self.ctx.ns_allowed(&namespace) {
                            continue;
                        }
                        let skip = match self.ctx.should_skip_pod(&item).await {
                            Ok(skip) => skip,
                            Err(err) => return (workloads, images, Some(err.into())),
                        };
                        if skip {
                            continue;
                        }
                        let phase = item
                            .status
                            .as_ref()
                            .and_then(|status| status.phase.as_deref())
                            .unwrap_or_default();
                        if phase != "Pending" && phase != "Running" {
                            continue;
                        }
                        let Some(spec) = item.spec.as_ref() else {
                            continue;
                        };
                        let (mirrored, err) = self
                            .ctx
                            .mirror_pod_spec(&namespace, &name, spec, Some(&item), None)
                            .await;
                        images += mirrored;
                        workloads += 1;
                        if let Some(err) = err {
                            errors.push(format!("pod {namespace}/{name}: {err}"));
                        }
                    }
                }
            }
        }

        let joined = if errors.is_empty() {
            None
        } else {
            Some(anyhow!(errors.join("; ")))
        };
        (workloads, images, joined)
    }
}

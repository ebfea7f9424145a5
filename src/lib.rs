//! # image-mirror-controller
//!
//! A cluster-resident controller that mirrors every container image
//! referenced by selected workloads into an operator-owned registry (AWS ECR
//! or a generic OCI/Docker v2 registry).
//!
//! ## Overview
//!
//! The controller:
//!
//! 1. **Watches workloads** - Deployments, StatefulSets, DaemonSets, Jobs,
//!    CronJobs and Pods, subject to namespace and name filters
//! 2. **Extracts images** - every container, init container and ephemeral
//!    container image, with the runtime-reported digest for pods
//! 3. **Mirrors** - manifest fetch, platform curation, digest comparison,
//!    repository provisioning, push and verification
//! 4. **Coordinates** - a per-target once-per-run cache and a failure
//!    cooldown suppress redundant and storming work
//! 5. **Serves operators** - Prometheus metrics, cooldown reset, forced
//!    reconciliation and push-cache administration over HTTP

pub mod cli;
pub mod config;
pub mod distribution;
pub mod force;
pub mod images;
pub mod keychain;
pub mod metrics;
pub mod mirror;
pub mod namespaces;
pub mod paths;
pub mod platform;
pub mod reconciler;
pub mod reference;
pub mod registry;
pub mod server;

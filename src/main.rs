use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use image_mirror_controller::config::{self, TargetSettings};
use image_mirror_controller::distribution::client::RegistryClient;
use image_mirror_controller::force::ForceReconciler;
use image_mirror_controller::keychain::Keychain;
use image_mirror_controller::mirror::{Pusher, PusherOptions};
use image_mirror_controller::paths::RepoPathTransformer;
use image_mirror_controller::reconciler::{self, ReconcileContext};
use image_mirror_controller::registry::{DockerTarget, EcrTarget, Target};
use image_mirror_controller::{cli, metrics, namespaces, server};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("startup failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = cli::Args::parse();

    let (file_config, config_found) = config::load_file(&args.config)?;
    init_logging(&file_config.log_level)?;

    let mut settings = config::resolve(args.dry_run, args.dry_pull, file_config, config_found)
        .context("resolve configuration")?;

    let (watch, invalid) = reconciler::parse_watch_resources(&settings.watch_resources);
    if !invalid.is_empty() {
        bail!("unsupported watch resource(s): {}", invalid.join(", "));
    }

    metrics::register_metrics()?;

    let state = Arc::new(server::ServerState::new());
    {
        let state = state.clone();
        let addr = args.metrics_bind_address.clone();
        tokio::spawn(async move {
            if let Err(err) = server::start_admin_server(&addr, state).await {
                error!(error = %err, "metrics/admin server error");
            }
        });
    }
    {
        let state = state.clone();
        let addr = args.health_probe_bind_address.clone();
        tokio::spawn(async move {
            if let Err(err) = server::start_probe_server(&addr, state).await {
                error!(error = %err, "health probe server error");
            }
        });
    }

    let client = Client::try_default().await.context("create kubernetes client")?;

    settings.allowed_namespaces =
        namespaces::validate_and_expand_namespaces(&client, &settings.allowed_namespaces)
            .await
            .context("validate configured namespaces")?;
    match settings.allowed_namespaces.as_slice() {
        [] => info!("no namespaces matched include configuration; controllers will not mirror any namespaces"),
        [all] if all.as_str() == "*" => info!("watching resources in all namespaces"),
        namespaces => info!(?namespaces, "watching resources in configured namespaces"),
    }

    let target: Arc<dyn Target> = match &settings.target {
        TargetSettings::Ecr(ecr) => Arc::new(
            EcrTarget::new(ecr.clone())
                .await
                .context("init ECR target")?,
        ),
        TargetSettings::Docker(docker) => Arc::new(DockerTarget::new(docker.clone())),
    };
    info!(registry = target.registry(), "configured target registry");

    let distribution = Arc::new(RegistryClient::new(target.insecure()).context("init registry client")?);
    let transformer = RepoPathTransformer::new(&settings.path_map);
    let keychain = Keychain::from_credentials(&settings.registry_credentials);

    let pusher = Arc::new(Pusher::new(
        target,
        distribution,
        transformer,
        keychain,
        PusherOptions {
            dry_run: settings.dry_run,
            dry_pull: settings.dry_pull,
            digest_pull: settings.digest_pull,
            allow_different_digest_repush: settings.allow_different_digest_repush,
            request_timeout: settings.request_timeout,
            failure_cooldown: settings.failure_cooldown,
            excluded_registries: settings.excluded_registries.clone(),
            mirror_platforms: settings.mirror_platforms.clone(),
        },
    ));

    let ctx = Arc::new(ReconcileContext::new(client, pusher.clone(), &settings));
    let force = Arc::new(ForceReconciler::new(ctx.clone(), watch.clone()));

    state.set_pusher(pusher);
    state.set_force_reconciler(force.clone());
    state.set_ready(true);

    if let Some(interval) = settings.force_resync {
        info!(interval_secs = interval.as_secs(), "configuring periodic full reconciliation");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would duplicate the initial watch
            // replay; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (workloads, images, err) = force.force_reconcile().await;
                match err {
                    Some(err) => error!(workloads, images, error = %err, "periodic reconciliation finished with errors"),
                    None => info!(workloads, images, "periodic reconciliation complete"),
                }
            }
        });
    }

    if !args.leader_elect {
        info!("leader election disabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_GIT_HASH"),
        dry_run = settings.dry_run,
        dry_pull = settings.dry_pull,
        "starting image mirror controller"
    );
    reconciler::run_controllers(ctx, watch, settings.max_concurrent_reconciles).await;
    info!("controller stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let level = level.trim().to_lowercase();
    let default_directive = if level.is_empty() { "info".to_owned() } else { level };
    if !matches!(default_directive.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        bail!("invalid logLevel {default_directive:?}");
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
    Ok(())
}

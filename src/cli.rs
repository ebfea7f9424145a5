//! Command-line flags.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "image-mirror-controller",
    version,
    about = "Mirrors container images referenced by cluster workloads into a trusted registry"
)]
pub struct Args {
    /// Address the metrics and admin endpoints bind to
    #[arg(long = "metrics-bind-address", env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    /// Address the health probes bind to
    #[arg(long = "health-probe-bind-address", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: String,

    /// Enable leader election (the election itself is provided by the
    /// deployment environment)
    #[arg(
        long = "leader-elect",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 1
    )]
    pub leader_elect: bool,

    /// Simulate image push without actually pushing
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Simulate image pull without contacting the source registry
    #[arg(long = "dry-pull")]
    pub dry_pull: bool,

    /// Path to the YAML config file
    #[arg(long = "config", env = "CONFIG_PATH", default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

//! `testbed reap`: remove stale containers from earlier runs.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use testbed_common::config::TestbedConfig;
use testbed_common::constants::CONTAINER_PREFIX;
use testbed_ports::resolver::PortConflictResolver;
use testbed_runtime::backend::docker::DockerCli;

use crate::output::{BOLD, GREEN, RESET, count_noun};

/// Arguments for the `reap` command.
#[derive(Args, Debug)]
pub struct ReapArgs {
    /// Only containers whose name starts with this prefix.
    #[arg(long, default_value = CONTAINER_PREFIX)]
    pub prefix: String,

    /// Minimum container age in seconds (defaults to TESTBED_STALE_AGE_SECS).
    #[arg(long)]
    pub older_than: Option<u64>,
}

/// Executes the `reap` command.
///
/// # Errors
///
/// Never fails once the configuration is loaded; individual removals are
/// logged.
pub fn execute(args: ReapArgs, config: &TestbedConfig) -> anyhow::Result<()> {
    let max_age = args
        .older_than
        .map_or(config.stale_container_age, Duration::from_secs);
    let runtime = Arc::new(DockerCli::from_config(config));
    let resolver = PortConflictResolver::new(runtime, max_age);

    tracing::info!(prefix = %args.prefix, ?max_age, "reaping stale containers");
    let removed = resolver.cleanup_stale_docker_containers(&args.prefix);
    eprintln!(
        "  {GREEN}Removed {}{RESET} matching {BOLD}{}*{RESET}.",
        count_noun(removed, "container"),
        args.prefix
    );
    Ok(())
}

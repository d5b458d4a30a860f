//! `testbed reset-state`: delete legacy allocation state files.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use testbed_common::config::TestbedConfig;
use testbed_ports::resolver::PortConflictResolver;
use testbed_runtime::backend::docker::DockerCli;

use crate::output::{DIM, GREEN, RESET, count_noun};

/// Arguments for the `reset-state` command.
#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Directory holding the state files.
    #[arg(default_value = ".")]
    pub dir: PathBuf,
}

/// Executes the `reset-state` command.
///
/// # Errors
///
/// Returns an error if an existing state file cannot be removed.
pub fn execute(args: &ResetStateArgs, config: &TestbedConfig) -> anyhow::Result<()> {
    let resolver = PortConflictResolver::new(Arc::new(DockerCli::from_config(config)), config.stale_container_age);
    let removed = resolver.reset_port_allocation_state(&args.dir)?;
    eprintln!(
        "  {GREEN}Removed {}{RESET} {DIM}in {}{RESET}",
        count_noun(removed, "state file"),
        args.dir.display()
    );
    Ok(())
}

//! `testbed kill-port`: forcefully reclaim a host port.

use std::sync::Arc;

use clap::Args;
use testbed_common::config::TestbedConfig;
use testbed_ports::resolver::PortConflictResolver;
use testbed_runtime::backend::docker::DockerCli;

use crate::output::{GREEN, RESET, YELLOW, count_noun};

/// Arguments for the `kill-port` command.
#[derive(Args, Debug)]
pub struct KillPortArgs {
    /// Port whose listeners are killed.
    pub port: u16,
}

/// Executes the `kill-port` command.
///
/// # Errors
///
/// Returns an error if the process lookup tool is missing or fails.
pub fn execute(args: &KillPortArgs, config: &TestbedConfig) -> anyhow::Result<()> {
    let resolver = PortConflictResolver::new(Arc::new(DockerCli::from_config(config)), config.stale_container_age);
    let killed = resolver.kill_processes_on_port(args.port)?;
    if killed == 0 {
        eprintln!("  {YELLOW}Nothing listening on port {}.{RESET}", args.port);
    } else {
        eprintln!("  {GREEN}Killed {}{RESET} on port {}.", count_noun(killed, "listener"), args.port);
    }
    Ok(())
}

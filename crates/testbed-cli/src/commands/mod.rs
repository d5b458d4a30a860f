//! CLI command definitions and dispatch.

pub mod kill_port;
pub mod reap;
pub mod reset_state;
pub mod up;

use clap::{Parser, Subcommand};
use testbed_common::config::TestbedConfig;
use testbed_common::types::PortEnvironment;

/// testbed: isolated multi-container test environments.
#[derive(Parser, Debug)]
#[command(name = "testbed", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Port range to allocate host ports from (test, dev, ci).
    #[arg(long, global = true, env = "TESTBED_PORT_ENV")]
    pub port_env: Option<PortEnvironment>,

    /// Docker CLI binary.
    #[arg(long, global = true, env = "TESTBED_DOCKER")]
    pub docker: Option<String>,
}

impl Cli {
    /// Loads `TESTBED_*` settings and applies the global flags on top.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an invalid value.
    pub fn config(&self) -> anyhow::Result<TestbedConfig> {
        let mut config = TestbedConfig::from_env()?;
        if let Some(env) = self.port_env {
            config.port_environment = env;
        }
        if let Some(docker) = &self.docker {
            config.docker_binary.clone_from(docker);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an environment and keep it up until Ctrl+C.
    Up(up::UpArgs),
    /// Remove stale test containers left by earlier runs.
    Reap(reap::ReapArgs),
    /// Kill every process listening on a port.
    KillPort(kill_port::KillPortArgs),
    /// Delete allocation state files written by older versions.
    ResetState(reset_state::ResetStateArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config()?;
    match cli.command {
        Command::Up(args) => up::execute(args, config),
        Command::Reap(args) => reap::execute(args, &config),
        Command::KillPort(args) => kill_port::execute(&args, &config),
        Command::ResetState(args) => reset_state::execute(&args, &config),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn up_splits_service_list() {
        let cli = Cli::try_parse_from(["testbed", "up", "--services", "postgres,auth", "--alpine"])
            .expect("parse");
        let Command::Up(args) = cli.command else {
            panic!("expected up");
        };
        assert_eq!(args.services, vec!["postgres", "auth"]);
        assert!(args.alpine);
        assert!(!args.detach);
    }

    #[test]
    fn port_env_flag_is_global() {
        let cli = Cli::try_parse_from(["testbed", "reap", "--port-env", "ci"]).expect("parse");
        assert_eq!(cli.port_env, Some(PortEnvironment::Ci));
    }

    #[test]
    fn kill_port_rejects_non_numeric_port() {
        assert!(Cli::try_parse_from(["testbed", "kill-port", "http"]).is_err());
    }
}

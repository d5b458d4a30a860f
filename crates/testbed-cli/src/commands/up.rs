//! `testbed up`: create an environment and keep it running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use testbed_common::config::TestbedConfig;
use testbed_common::types::{IsolationLevel, TestEnvironment};
use testbed_orchestrator::orchestrator::DockerOrchestrator;
use testbed_runtime::backend::docker::DockerCli;

use crate::output::{BOLD, CYAN, DIM, GREEN, RESET, YELLOW, count_noun, format_secs};

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Human-readable environment name.
    #[arg(short, long, default_value = "adhoc")]
    pub name: String,

    /// Services to start (postgres, redis, backend, auth, frontend).
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub services: Vec<String>,

    /// Use Alpine images and `Dockerfile.alpine`.
    #[arg(long)]
    pub alpine: bool,

    /// Isolation level (full, network).
    #[arg(long, default_value = "full")]
    pub isolation: IsolationLevel,

    /// Leave the environment running and exit.
    #[arg(short, long)]
    pub detach: bool,
}

/// Executes the `up` command.
///
/// # Errors
///
/// Returns an error if the runtime is unavailable or creation fails.
pub fn execute(args: UpArgs, mut config: TestbedConfig) -> anyhow::Result<()> {
    let start = Instant::now();
    if args.detach {
        config.cleanup_on_exit = false;
    }

    let runtime = DockerCli::from_config(&config);
    if !runtime.is_installed() {
        anyhow::bail!("'{}' not found on PATH", config.docker_binary);
    }
    let orchestrator = DockerOrchestrator::new(Arc::new(runtime), config)?;

    let services: Vec<&str> = args.services.iter().map(String::as_str).collect();
    eprintln!();
    eprintln!("  {BOLD}testbed{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!("  Creating {BOLD}{}{RESET} with {}...", args.name, services.join(", "));

    let env = orchestrator.create_test_environment(&args.name, &services, args.isolation, args.alpine)?;
    report(&env, start.elapsed());

    if args.detach {
        eprintln!();
        eprintln!(
            "  {YELLOW}Detached.{RESET} Remove with {BOLD}testbed reap{RESET} or docker rm -f on the {} prefix.",
            testbed_common::constants::CONTAINER_PREFIX
        );
        return Ok(());
    }

    wait_for_interrupt()?;
    eprintln!();
    eprintln!("  Cleaning up {}...", env.id);
    let _ = orchestrator.cleanup_environment(env.id.as_str());
    orchestrator.shutdown();
    eprintln!("  {GREEN}Environment removed.{RESET}");
    Ok(())
}

fn report(env: &TestEnvironment, elapsed: Duration) {
    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}Environment {}{RESET} running {} in {} {DIM}[{}]{RESET}",
        env.id,
        count_noun(env.services.len(), "service"),
        format_secs(elapsed),
        env.network
    );
    eprintln!();
    for (name, service) in &env.services {
        let url = env.service_url(name).unwrap_or_default();
        eprintln!("    {GREEN}●{RESET} {BOLD}{name}{RESET} {DIM}[{}]{RESET} {CYAN}->{RESET} {url}", service.container_name);
    }
}

fn wait_for_interrupt() -> anyhow::Result<()> {
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to tear the environment down...");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }
    Ok(())
}

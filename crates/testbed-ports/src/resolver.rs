//! Best-effort remediation of port contention.
//!
//! Nothing here is needed for correct allocation. Removing leftovers from
//! crashed runs just means fewer retries for everybody.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use testbed_common::constants::LEGACY_STATE_FILES;
use testbed_common::error::{Result, TestbedError};
use testbed_runtime::backend::ContainerRuntime;
use testbed_runtime::exec;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cleans up leftovers that make ports scarce.
pub struct PortConflictResolver {
    runtime: Arc<dyn ContainerRuntime>,
    max_age: Duration,
}

impl PortConflictResolver {
    /// Creates a resolver treating containers older than `max_age` as stale.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, max_age: Duration) -> Self {
        Self { runtime, max_age }
    }

    /// Stops and removes stale containers whose name starts with `prefix`.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// containers removed.
    pub fn cleanup_stale_docker_containers(&self, prefix: &str) -> usize {
        let containers = match self.runtime.list_containers(prefix) {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(prefix, error = %e, "could not list containers");
                return 0;
            }
        };

        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut removed = 0;
        for container in containers.iter().filter(|c| now - c.created_at > max_age) {
            if let Err(e) = self.runtime.stop_container(&container.name) {
                tracing::debug!(name = %container.name, error = %e, "stop failed, removing anyway");
            }
            match self.runtime.remove_container(&container.name) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(name = %container.name, created_at = %container.created_at, "removed stale container");
                }
                Err(e) => {
                    let err = TestbedError::cleanup(container.name.clone(), &e);
                    tracing::warn!(error = %err, "could not remove stale container");
                }
            }
        }
        removed
    }

    /// Kills every process listening on `port`. Last resort only.
    ///
    /// Returns the number of processes killed.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform's lookup tool is missing or fails.
    pub fn kill_processes_on_port(&self, port: u16) -> Result<usize> {
        tracing::warn!(port, "forcefully reclaiming port");
        let pids = pids_on_port(port)?;
        let mut killed = 0;
        for pid in pids {
            match kill_pid(pid) {
                Ok(()) => {
                    killed += 1;
                    tracing::info!(port, pid, "killed process");
                }
                Err(e) => tracing::warn!(port, pid, error = %e, "could not kill process"),
            }
        }
        Ok(killed)
    }

    /// Deletes allocation state files left by older, registry-based
    /// versions. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn reset_port_allocation_state(&self, state_dir: &Path) -> Result<usize> {
        let mut removed = 0;
        for name in LEGACY_STATE_FILES {
            let path = state_dir.join(name);
            if !path.exists() {
                continue;
            }
            std::fs::remove_file(&path).map_err(|e| TestbedError::Io {
                path: path.clone(),
                source: e,
            })?;
            tracing::info!(path = %path.display(), "removed legacy port state");
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn pids_on_port(port: u16) -> Result<Vec<u32>> {
    let lsof = which::which("lsof").map_err(|_| TestbedError::NotFound {
        kind: "program",
        id: "lsof".into(),
    })?;
    let out = exec::run_command(
        &lsof.to_string_lossy(),
        &["-t".into(), "-i".into(), format!("tcp:{port}")],
        &[],
        KILL_TIMEOUT,
    )?;
    // lsof exits 1 when nothing matches.
    Ok(parse_lsof_pids(&out.stdout))
}

#[cfg(windows)]
fn pids_on_port(port: u16) -> Result<Vec<u32>> {
    let out = exec::run_command("netstat", &["-ano".into()], &[], KILL_TIMEOUT)?;
    Ok(parse_netstat_pids(&out.stdout, port))
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let failed = |message: String| TestbedError::Command {
        command: format!("kill -9 {pid}"),
        message,
    };
    let raw = i32::try_from(pid).map_err(|e| failed(e.to_string()))?;
    kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(|e| failed(e.to_string()))
}

#[cfg(windows)]
fn kill_pid(pid: u32) -> Result<()> {
    let args = vec!["/F".to_string(), "/PID".to_string(), pid.to_string()];
    let out = exec::run_command("taskkill", &args, &[], KILL_TIMEOUT)?;
    if out.success() {
        Ok(())
    } else {
        Err(TestbedError::Command {
            command: exec::render("taskkill", &args),
            message: out.stderr.trim().to_string(),
        })
    }
}

fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout.lines().filter_map(|l| l.trim().parse().ok()).collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_pids(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [proto, local, _remote, state, pid]
                    if proto.eq_ignore_ascii_case("tcp") && local.ends_with(&suffix) && *state == "LISTENING" =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

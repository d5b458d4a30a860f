//! In-memory runtime that records every call.
//!
//! Used by the port manager and orchestrator tests to assert on call order
//! and to inject failures without a Docker daemon.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use testbed_common::error::{Result, TestbedError};

use super::{BuildSpec, ContainerRuntime, RunSpec};
use crate::inspect::{ContainerSummary, HealthStatus};

/// A runtime operation as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `version`
    Version,
    /// `network create`
    CreateNetwork(String),
    /// `network rm`
    RemoveNetwork(String),
    /// `build`, by tag.
    Build(String),
    /// `run`, with its full specification.
    Run(RunSpec),
    /// `inspect`, by container name.
    Inspect(String),
    /// `stop`, by container name.
    Stop(String),
    /// `rm`, by container name.
    Remove(String),
    /// `ps`, by prefix.
    List(String),
    /// `compose up`.
    ComposeUp {
        /// Compose file.
        file: PathBuf,
        /// Injected environment.
        env: Vec<(String, String)>,
    },
}

/// A call with its position and time.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Monotonic sequence number, starting at zero.
    pub seq: u64,
    /// When the call was made.
    pub at: Instant,
    /// The call itself.
    pub call: Call,
}

/// Fake [`ContainerRuntime`].
#[derive(Debug)]
pub struct FakeRuntime {
    calls: Mutex<Vec<RecordedCall>>,
    seq: AtomicU64,
    default_health: Mutex<HealthStatus>,
    health: Mutex<HashMap<String, HealthStatus>>,
    failing: Mutex<HashSet<String>>,
    containers: Mutex<Vec<ContainerSummary>>,
    build_delay: Mutex<Duration>,
    held_at_run: Mutex<HashMap<String, Vec<(u16, bool)>>>,
    available: bool,
}

impl FakeRuntime {
    /// Creates a fake where every container is immediately healthy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            default_health: Mutex::new(HealthStatus::Healthy),
            health: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            containers: Mutex::new(Vec::new()),
            build_delay: Mutex::new(Duration::ZERO),
            held_at_run: Mutex::new(HashMap::new()),
            available: true,
        }
    }

    /// Creates a fake whose `version` call fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Health reported for containers without an explicit override.
    pub fn set_default_health(&self, status: HealthStatus) {
        *self.default_health.lock() = status;
    }

    /// Health reported for one container (matched by name prefix).
    pub fn set_health(&self, name_prefix: &str, status: HealthStatus) {
        let _ = self.health.lock().insert(name_prefix.to_string(), status);
    }

    /// Makes every operation whose target (tag, container, network or
    /// compose file) starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        let _ = self.failing.lock().insert(prefix.to_string());
    }

    /// Makes every build sleep before returning.
    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    /// Adds a container to the `list_containers` result.
    pub fn add_container(&self, summary: ContainerSummary) {
        self.containers.lock().push(summary);
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Sequence number of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<u64> {
        self.calls.lock().iter().find(|c| pred(&c.call)).map(|c| c.seq)
    }

    /// Containers started so far, in start order.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.call {
                Call::Run(spec) => Some(spec.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Tags built so far.
    #[must_use]
    pub fn built(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.call {
                Call::Build(tag) => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    /// Host ports of every `run` call, by container name, each paired with
    /// whether something still had the port bound when the call was made.
    #[must_use]
    pub fn held_at_run(&self) -> HashMap<String, Vec<(u16, bool)>> {
        self.held_at_run.lock().clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(&c.call)).count()
    }

    fn record(&self, call: Call) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(RecordedCall {
            seq,
            at: Instant::now(),
            call,
        });
    }

    fn fails(&self, target: &str) -> bool {
        self.failing.lock().iter().any(|p| target.starts_with(p.as_str()))
    }

    fn check(&self, target: &str) -> Result<()> {
        if self.fails(target) {
            return Err(TestbedError::Command {
                command: format!("fake {target}"),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn version(&self) -> Result<String> {
        self.record(Call::Version);
        if self.available {
            Ok("fake".into())
        } else {
            Err(TestbedError::Command {
                command: "fake version".into(),
                message: "runtime unavailable".into(),
            })
        }
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.record(Call::CreateNetwork(name.to_string()));
        self.check(name)
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.record(Call::RemoveNetwork(name.to_string()));
        self.check(name)
    }

    fn build_image(&self, spec: &BuildSpec, timeout: Duration) -> Result<()> {
        self.record(Call::Build(spec.tag.clone()));
        let delay = *self.build_delay.lock();
        if delay > timeout {
            std::thread::sleep(timeout);
            return Err(TestbedError::Build {
                image: spec.tag.clone(),
                message: format!("build timed out after {timeout:?}"),
            });
        }
        std::thread::sleep(delay);
        if self.fails(&spec.tag) {
            return Err(TestbedError::Build {
                image: spec.tag.clone(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        self.record(Call::Run(spec.clone()));
        let bound: Vec<(u16, bool)> = spec
            .ports
            .iter()
            .map(|p| (p.host, TcpListener::bind((Ipv4Addr::UNSPECIFIED, p.host)).is_err()))
            .collect();
        let _ = self.held_at_run.lock().insert(spec.name.clone(), bound);
        if self.fails(&spec.name) {
            return Err(TestbedError::Run {
                container: spec.name.clone(),
                message: "injected failure".into(),
            });
        }
        Ok(format!("fake-{}", spec.name))
    }

    fn inspect_health(&self, name: &str) -> Result<HealthStatus> {
        self.record(Call::Inspect(name.to_string()));
        self.check(name)?;
        let overrides = self.health.lock();
        let status = overrides
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map_or_else(|| *self.default_health.lock(), |(_, status)| *status);
        Ok(status)
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        self.record(Call::Stop(name.to_string()));
        self.check(name)
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.record(Call::Remove(name.to_string()));
        self.check(name)?;
        self.containers.lock().retain(|c| c.name != name);
        Ok(())
    }

    fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerSummary>> {
        self.record(Call::List(prefix.to_string()));
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|c| c.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn compose_up(&self, file: &Path, env: &[(String, String)]) -> Result<()> {
        self.record(Call::ComposeUp {
            file: file.to_path_buf(),
            env: env.to_vec(),
        });
        self.check(&file.to_string_lossy())
    }
}

//! Environment lifecycle: create, query, tear down.
//!
//! Creation runs in fixed stages: batch port allocation, service
//! configuration, start order resolution, network, parallel image builds,
//! dependency-ordered start with health polling, socket handoff. A failing
//! stage aborts creation: the environment is not registered and containers
//! already started are left running; only its held sockets are closed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use testbed_common::config::TestbedConfig;
use testbed_common::constants::ENVIRONMENT_ID_LENGTH;
use testbed_common::error::{Result, TestbedError};
use testbed_common::types::{EnvironmentId, EnvironmentStatus, IsolationLevel, ServiceConfig, TestEnvironment};
use testbed_ports::allocator::SafePortAllocator;
use testbed_ports::manager::DockerPortManager;
use testbed_runtime::backend::{BuildSpec, ContainerRuntime, RunSpec};

use crate::executor::BuildExecutor;
use crate::graph::DependencyGraph;
use crate::health;
use crate::services::{self, ServiceContext, WellKnownService};

/// Extra time granted to a build worker beyond the runtime's own timeout.
const BUILD_GRACE: Duration = Duration::from_secs(5);

/// A registered environment and the resources only the orchestrator sees.
#[derive(Debug)]
struct ManagedEnvironment {
    environment: TestEnvironment,
    ports: DockerPortManager,
    start_order: Vec<String>,
}

/// Creates and owns isolated multi-container test environments.
///
/// Every environment created through an orchestrator is owned by it:
/// [`shutdown`](Self::shutdown), also run on drop, tears down the ones
/// marked `cleanup_on_exit`.
pub struct DockerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: TestbedConfig,
    allocator: Arc<SafePortAllocator>,
    environments: Mutex<HashMap<String, ManagedEnvironment>>,
    executor: Mutex<BuildExecutor>,
    counter: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for DockerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerOrchestrator")
            .field("config", &self.config)
            .field("environments", &self.environment_ids())
            .finish_non_exhaustive()
    }
}

impl DockerOrchestrator {
    /// Creates an orchestrator on top of `runtime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the runtime does
    /// not answer a version probe, or the build workers cannot be spawned.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TestbedConfig) -> Result<Self> {
        config.validate()?;
        let version = runtime.version().inspect_err(|e| {
            tracing::error!(error = %e, "container runtime unavailable");
        })?;
        tracing::info!(%version, port_environment = %config.port_environment, "orchestrator ready");
        let executor = BuildExecutor::new(config.build_workers)?;
        Ok(Self {
            runtime,
            config,
            allocator: Arc::new(SafePortAllocator::new()),
            environments: Mutex::new(HashMap::new()),
            executor: Mutex::new(executor),
            counter: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TestbedConfig {
        &self.config
    }

    /// Allocator holding this orchestrator's port reservations.
    #[must_use]
    pub fn allocator(&self) -> &Arc<SafePortAllocator> {
        &self.allocator
    }

    /// Creates an environment running `services`, each healthy on its own
    /// host port.
    ///
    /// Service names must come from the well-known catalog; duplicates are
    /// ignored. Nothing is registered unless every stage succeeds.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage: unknown service,
    /// port allocation, dependency cycle, network, build, run or health.
    pub fn create_test_environment(
        &self,
        name: &str,
        services: &[&str],
        isolation: IsolationLevel,
        use_alpine: bool,
    ) -> Result<TestEnvironment> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TestbedError::Config {
                message: "orchestrator is shut down".into(),
            });
        }
        let requested = services
            .iter()
            .map(|s| s.parse::<WellKnownService>())
            .collect::<Result<BTreeSet<_>>>()?;
        if requested.is_empty() {
            return Err(TestbedError::Config {
                message: "an environment needs at least one service".into(),
            });
        }

        let mut environment = TestEnvironment::new(self.next_id(name), name, isolation);
        environment.cleanup_on_exit = self.config.cleanup_on_exit;
        environment.status = EnvironmentStatus::Creating;
        tracing::info!(
            id = %environment.id,
            name,
            services = ?requested.iter().map(|s| s.name()).collect::<Vec<_>>(),
            %isolation,
            "creating environment"
        );

        let mut ports = DockerPortManager::new(
            Arc::clone(&self.allocator),
            self.config.port_environment,
            self.config.port_retries,
        )
        .with_handoff_delay(self.config.handoff_delay);

        match self.provision(&mut environment, &requested, use_alpine, &mut ports) {
            Ok(start_order) => {
                environment.status = EnvironmentStatus::Running;
                let snapshot = environment.clone();
                let _ = self.environments.lock().insert(
                    environment.id.as_str().to_string(),
                    ManagedEnvironment {
                        environment,
                        ports,
                        start_order,
                    },
                );
                Ok(snapshot)
            }
            Err(e) => {
                environment.status = EnvironmentStatus::Failed;
                tracing::error!(id = %environment.id, status = %environment.status, error = %e, "environment creation failed");
                ports.cleanup();
                Err(e)
            }
        }
    }

    fn provision(
        &self,
        environment: &mut TestEnvironment,
        requested: &BTreeSet<WellKnownService>,
        use_alpine: bool,
        ports: &mut DockerPortManager,
    ) -> Result<Vec<String>> {
        let total = Instant::now();

        let defaults: BTreeMap<String, u16> = requested
            .iter()
            .map(|s| (s.name().to_string(), s.default_port()))
            .collect();
        let host_ports = ports.allocate_service_ports(&defaults)?;

        let id = environment.id.clone();
        let ctx = ServiceContext {
            environment_id: &id,
            requested,
            services_root: &self.config.services_root,
            use_alpine,
        };
        for service in requested {
            let host_port = host_ports.get(service.name()).copied().ok_or_else(|| TestbedError::PortAllocation {
                service: service.name().to_string(),
                message: "missing from batch result".into(),
            })?;
            let _ = environment
                .services
                .insert(service.name().to_string(), services::service_config(*service, host_port, &ctx));
        }

        let start_order = DependencyGraph::from_services(&environment.services)?.resolve_order()?;
        tracing::debug!(id = %environment.id, order = ?start_order, "start order resolved");

        self.runtime.create_network(&environment.network)?;

        let stage = Instant::now();
        self.build_images(&environment.services)?;
        tracing::info!(id = %environment.id, elapsed = ?stage.elapsed(), "images ready");

        let stage = Instant::now();
        for name in &start_order {
            let service = environment.services.get(name).ok_or_else(|| TestbedError::NotFound {
                kind: "service",
                id: name.clone(),
            })?;
            let container_id = self
                .runtime
                .run_container(&RunSpec::for_service(service, &environment.network))?;
            tracing::info!(service = %name, container = %service.container_name, %container_id, port = ?service.primary_host_port(), "service started");
            health::wait_for_healthy(
                self.runtime.as_ref(),
                name,
                &service.container_name,
                self.config.health_timeout,
                self.config.health_poll_interval,
            )?;
        }
        tracing::info!(id = %environment.id, elapsed = ?stage.elapsed(), "services healthy");

        if !self.config.handoff_delay.is_zero() {
            std::thread::sleep(self.config.handoff_delay);
        }
        ports.release_sockets();

        tracing::info!(id = %environment.id, network = %environment.network, elapsed = ?total.elapsed(), "environment running");
        Ok(start_order)
    }

    /// Builds every custom image on the worker pool; the first failure wins.
    fn build_images(&self, services: &BTreeMap<String, ServiceConfig>) -> Result<()> {
        let timeout = self.config.build_timeout;
        let mut pending: Vec<(String, Receiver<Result<()>>)> = Vec::new();
        {
            let executor = self.executor.lock();
            for spec in services.values().filter_map(BuildSpec::for_service) {
                let runtime = Arc::clone(&self.runtime);
                let tag = spec.tag.clone();
                tracing::info!(image = %tag, dockerfile = %spec.dockerfile.display(), "building image");
                let rx = executor.submit(move || runtime.build_image(&spec, timeout))?;
                pending.push((tag, rx));
            }
        }

        let deadline = Instant::now() + timeout + BUILD_GRACE;
        for (tag, rx) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Ok(())) => tracing::debug!(image = %tag, "image built"),
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TestbedError::Build {
                        image: tag,
                        message: format!("build timed out after {timeout:?}"),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TestbedError::Build {
                        image: tag,
                        message: "build worker exited without a result".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Tears an environment down. Unknown ids are ignored.
    ///
    /// Every step is attempted; failures are logged and never returned.
    /// Returns whether the environment was known.
    pub fn cleanup_environment(&self, env_id: &str) -> bool {
        let Some(mut managed) = self.environments.lock().remove(env_id) else {
            tracing::debug!(id = env_id, "cleanup of unknown environment ignored");
            return false;
        };
        self.teardown(&managed.environment, &managed.start_order);
        managed.ports.cleanup();
        managed.environment.status = EnvironmentStatus::Stopped;
        tracing::info!(id = env_id, status = %managed.environment.status, "environment cleaned up");
        true
    }

    /// Stops and removes `started` in reverse order, then the network.
    fn teardown(&self, environment: &TestEnvironment, started: &[String]) {
        for name in started.iter().rev() {
            let Some(service) = environment.services.get(name) else {
                continue;
            };
            let container = &service.container_name;
            if let Err(e) = self.runtime.stop_container(container) {
                let err = TestbedError::cleanup(container.clone(), &e);
                tracing::warn!(error = %err, "stop failed");
            }
            if let Err(e) = self.runtime.remove_container(container) {
                let err = TestbedError::cleanup(container.clone(), &e);
                tracing::warn!(error = %err, "remove failed");
            }
        }
        if let Err(e) = self.runtime.remove_network(&environment.network) {
            let err = TestbedError::cleanup(environment.network.clone(), &e);
            tracing::warn!(error = %err, "network removal failed");
        }
    }

    /// Returns `http://localhost:<host port>` of a running service.
    ///
    /// # Errors
    ///
    /// Returns [`TestbedError::NotFound`] for an unknown environment or a
    /// service that is not part of it.
    pub fn get_service_url(&self, env_id: &str, service: &str) -> Result<String> {
        let environments = self.environments.lock();
        let managed = environments.get(env_id).ok_or_else(|| TestbedError::NotFound {
            kind: "environment",
            id: env_id.to_string(),
        })?;
        managed
            .environment
            .service_url(service)
            .ok_or_else(|| TestbedError::NotFound {
                kind: "service",
                id: format!("{service} in environment {env_id}"),
            })
    }

    /// Snapshot of a registered environment.
    #[must_use]
    pub fn environment(&self, env_id: &str) -> Option<TestEnvironment> {
        self.environments
            .lock()
            .get(env_id)
            .map(|m| m.environment.clone())
    }

    /// Ids of all registered environments, sorted.
    #[must_use]
    pub fn environment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.environments.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tears down every environment marked `cleanup_on_exit` and stops the
    /// build workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self
            .environments
            .lock()
            .iter()
            .filter(|(_, m)| m.environment.cleanup_on_exit)
            .map(|(id, _)| id.clone())
            .collect();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "cleaning up environments on shutdown");
        }
        for id in ids {
            let _ = self.cleanup_environment(&id);
        }
        self.executor.lock().shutdown();
        self.allocator.cleanup_all();
    }

    /// Eight hex characters derived from the name, the clock, the process
    /// and a counter; regenerated on collision with a registered id.
    fn next_id(&self, name: &str) -> EnvironmentId {
        loop {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let digest = Sha256::new()
                .chain_update(name.as_bytes())
                .chain_update(nanos.to_le_bytes())
                .chain_update(std::process::id().to_le_bytes())
                .chain_update(n.to_le_bytes())
                .finalize();
            let id = hex::encode(&digest[..ENVIRONMENT_ID_LENGTH / 2]);
            if !self.environments.lock().contains_key(&id) {
                return EnvironmentId::new(id);
            }
        }
    }
}

impl Drop for DockerOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use testbed_runtime::backend::fake::FakeRuntime;

    use super::*;

    fn orchestrator() -> DockerOrchestrator {
        let config = TestbedConfig {
            handoff_delay: Duration::ZERO,
            ..TestbedConfig::default()
        };
        DockerOrchestrator::new(Arc::new(FakeRuntime::new()), config).expect("orchestrator")
    }

    #[test]
    fn ids_are_eight_hex_chars_and_unique() {
        let orch = orchestrator();
        let a = orch.next_id("same");
        let b = orch.next_id("same");
        assert_ne!(a, b);
        for id in [&a, &b] {
            assert_eq!(id.as_str().len(), ENVIRONMENT_ID_LENGTH);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn unknown_service_is_rejected_before_allocation() {
        let orch = orchestrator();
        let err = orch
            .create_test_environment("bad", &["mysql"], IsolationLevel::Full, true)
            .expect_err("unknown service");
        assert!(matches!(err, TestbedError::Config { .. }));
        assert!(orch.allocator().held_ports().is_empty());
    }

    #[test]
    fn empty_service_list_is_rejected() {
        let orch = orchestrator();
        assert!(orch
            .create_test_environment("empty", &[], IsolationLevel::Full, true)
            .is_err());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let orch = orchestrator();
        orch.shutdown();
        orch.shutdown();
        assert!(orch
            .create_test_environment("late", &["redis"], IsolationLevel::Full, true)
            .is_err());
    }
}

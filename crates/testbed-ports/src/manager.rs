//! Batch port allocation for one environment and the handoff to the runtime.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use testbed_common::error::{Result, TestbedError};
use testbed_common::types::{PortEnvironment, ServiceConfig};
use testbed_runtime::backend::{ContainerRuntime, RunSpec};

use crate::allocator::SafePortAllocator;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const VERIFY_POLL: Duration = Duration::from_millis(200);

/// One service's reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    /// Host port.
    pub port: u16,
    /// Whether the allocator still holds the socket.
    pub held: bool,
}

/// Allocates the ports of one environment as a unit.
///
/// Reservations stay held in the shared [`SafePortAllocator`] until
/// [`release_sockets`](Self::release_sockets) hands them to the runtime.
#[derive(Debug)]
pub struct DockerPortManager {
    allocator: Arc<SafePortAllocator>,
    environment: PortEnvironment,
    max_retries: u32,
    handoff_delay: Duration,
    allocations: BTreeMap<String, PortAllocation>,
}

impl DockerPortManager {
    /// Creates a manager drawing ports from `environment`'s range.
    #[must_use]
    pub fn new(allocator: Arc<SafePortAllocator>, environment: PortEnvironment, max_retries: u32) -> Self {
        Self {
            allocator,
            environment,
            max_retries,
            handoff_delay: Duration::from_millis(500),
            allocations: BTreeMap::new(),
        }
    }

    /// Sets how long to wait between container start and socket release.
    #[must_use]
    pub fn with_handoff_delay(mut self, delay: Duration) -> Self {
        self.handoff_delay = delay;
        self
    }

    /// Reserves one host port per service.
    ///
    /// `services` maps service names to their default container port; the
    /// default only documents intent, host ports always come from the
    /// environment's range. Either every service gets a port or none does.
    ///
    /// # Errors
    ///
    /// Returns [`TestbedError::BatchAllocation`] wrapping the first failure,
    /// after releasing every port reserved by this call.
    pub fn allocate_service_ports(&mut self, services: &BTreeMap<String, u16>) -> Result<BTreeMap<String, u16>> {
        let mut batch: BTreeMap<String, u16> = BTreeMap::new();
        for (service, default_port) in services {
            match self
                .allocator
                .allocate_port_with_hold(service, self.environment, self.max_retries)
            {
                Ok(port) => {
                    tracing::debug!(service = %service, default_port, port, "service port reserved");
                    let _ = batch.insert(service.clone(), port);
                }
                Err(e) => {
                    for port in batch.values() {
                        let _ = self.allocator.release_held_port(*port);
                    }
                    tracing::warn!(service = %service, released = batch.len(), error = %e, "batch allocation rolled back");
                    return Err(TestbedError::BatchAllocation {
                        service: service.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        for (service, port) in &batch {
            let previous = self
                .allocations
                .insert(service.clone(), PortAllocation { port: *port, held: true });
            if let Some(old) = previous.filter(|old| old.held) {
                let _ = self.allocator.release_held_port(old.port);
                tracing::debug!(service = %service, port = old.port, "replaced reservation released");
            }
        }
        tracing::info!(ports = ?batch, "service ports allocated");
        Ok(batch)
    }

    /// Starts containers on the reserved ports, then hands the ports over.
    ///
    /// With a compose file, `docker-compose up -d` runs with one
    /// `<SERVICE>_PORT` variable per allocation; otherwise every service is
    /// started with `docker run` on `network`. Sockets are released only
    /// after the runtime call succeeded.
    ///
    /// # Errors
    ///
    /// Returns the runtime error; the ports then stay held.
    pub fn start_docker_with_ports(
        &mut self,
        runtime: &dyn ContainerRuntime,
        services: &[ServiceConfig],
        network: &str,
        compose_file: Option<&Path>,
    ) -> Result<()> {
        if let Some(file) = compose_file {
            runtime.compose_up(file, &self.port_env_vars())?;
        } else {
            for service in services {
                let _ = runtime.run_container(&RunSpec::for_service(service, network))?;
            }
        }

        if !self.handoff_delay.is_zero() {
            std::thread::sleep(self.handoff_delay);
        }
        self.release_sockets();
        Ok(())
    }

    /// `<SERVICE>_PORT=<port>` for every allocation.
    #[must_use]
    pub fn port_env_vars(&self) -> Vec<(String, String)> {
        self.allocations
            .iter()
            .map(|(service, a)| (format!("{}_PORT", env_key(service)), a.port.to_string()))
            .collect()
    }

    /// Closes every socket this manager still holds.
    pub fn release_sockets(&mut self) {
        for (service, allocation) in &mut self.allocations {
            if allocation.held {
                let _ = self.allocator.release_held_port(allocation.port);
                allocation.held = false;
                tracing::debug!(service = %service, port = allocation.port, "port handed off");
            }
        }
    }

    /// Waits until every allocated port accepts TCP connections.
    ///
    /// Returns `false` if any port still refuses connections once `timeout`
    /// has elapsed.
    #[must_use]
    pub fn verify_ports_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<u16> = self.allocations.values().map(|a| a.port).collect();
        loop {
            pending.retain(|port| {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, *port));
                TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_err()
            });
            if pending.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(ports = ?pending, "ports not accepting connections");
                return false;
            }
            std::thread::sleep(VERIFY_POLL);
        }
    }

    /// Host ports by service.
    #[must_use]
    pub fn ports(&self) -> BTreeMap<String, u16> {
        self.allocations
            .iter()
            .map(|(service, a)| (service.clone(), a.port))
            .collect()
    }

    /// Host port of one service.
    #[must_use]
    pub fn port_for(&self, service: &str) -> Option<u16> {
        self.allocations.get(service).map(|a| a.port)
    }

    /// Whether the service's socket is still held.
    #[must_use]
    pub fn is_held(&self, service: &str) -> bool {
        self.allocations.get(service).is_some_and(|a| a.held)
    }

    /// Releases everything and forgets all allocations.
    pub fn cleanup(&mut self) {
        self.release_sockets();
        self.allocations.clear();
    }
}

impl Drop for DockerPortManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn env_key(service: &str) -> String {
    service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};
    use std::net::TcpListener;

    use testbed_common::types::{PortMapping, ServiceSource};
    use testbed_runtime::backend::fake::{Call, FakeRuntime};

    use super::*;

    fn defaults(pairs: &[(&str, u16)]) -> BTreeMap<String, u16> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn manager(allocator: &Arc<SafePortAllocator>) -> DockerPortManager {
        DockerPortManager::new(Arc::clone(allocator), PortEnvironment::Test, 50)
            .with_handoff_delay(Duration::ZERO)
    }

    fn service(name: &str, host: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            container_name: format!("test-{name}-abc"),
            source: ServiceSource::Image(format!("{name}:latest")),
            ports: vec![PortMapping { container: 80, host }],
            environment: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            health_check: None,
            volumes: Vec::new(),
            command: None,
        }
    }

    #[test]
    fn batch_returns_distinct_held_ports() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let ports = mgr
            .allocate_service_ports(&defaults(&[("postgres", 5432), ("redis", 6379), ("backend", 8000)]))
            .expect("batch");

        assert_eq!(ports.len(), 3);
        let unique: HashSet<_> = ports.values().collect();
        assert_eq!(unique.len(), 3);
        for (service, port) in &ports {
            assert!(mgr.is_held(service));
            assert!(allocator.is_held(*port));
            assert!(TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_err());
        }
    }

    #[test]
    fn failed_batch_releases_everything() {
        let allocator = Arc::new(SafePortAllocator::new());
        // Zero retries: the first service to be allocated fails immediately.
        let mut mgr = DockerPortManager::new(Arc::clone(&allocator), PortEnvironment::Test, 0);
        let err = mgr
            .allocate_service_ports(&defaults(&[("auth", 8081), ("postgres", 5432)]))
            .expect_err("must fail");
        assert!(matches!(err, TestbedError::BatchAllocation { ref service, .. } if service == "auth"));
        assert!(allocator.held_ports().is_empty());
        assert!(mgr.ports().is_empty());
    }

    #[test]
    fn reallocating_a_service_releases_its_previous_port() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let first = mgr.allocate_service_ports(&defaults(&[("web", 80)])).expect("first")["web"];
        let second = mgr.allocate_service_ports(&defaults(&[("web", 80)])).expect("second")["web"];

        assert_ne!(first, second);
        assert!(!allocator.is_held(first));
        assert_eq!(allocator.held_ports(), vec![second]);
        assert_eq!(mgr.port_for("web"), Some(second));

        mgr.cleanup();
        assert!(allocator.held_ports().is_empty());
    }

    #[test]
    fn handoff_happens_after_runtime_start() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let ports = mgr
            .allocate_service_ports(&defaults(&[("web", 80)]))
            .expect("batch");
        let runtime = FakeRuntime::new();

        mgr.start_docker_with_ports(&runtime, &[service("web", ports["web"])], "test-net-abc", None)
            .expect("start");

        assert_eq!(runtime.started(), vec!["test-web-abc".to_string()]);
        assert!(!mgr.is_held("web"));
        assert!(allocator.held_ports().is_empty());
        assert_eq!(mgr.port_for("web"), Some(ports["web"]));
    }

    #[test]
    fn failed_start_keeps_ports_held() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let ports = mgr
            .allocate_service_ports(&defaults(&[("web", 80)]))
            .expect("batch");
        let runtime = FakeRuntime::new();
        runtime.fail_on("test-web");

        let err = mgr
            .start_docker_with_ports(&runtime, &[service("web", ports["web"])], "test-net-abc", None)
            .expect_err("run fails");
        assert!(matches!(err, TestbedError::Run { .. }));
        assert!(mgr.is_held("web"));
        assert!(allocator.is_held(ports["web"]));
    }

    #[test]
    fn compose_receives_port_variables() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let ports = mgr
            .allocate_service_ports(&defaults(&[("backend", 8000), ("redis", 6379)]))
            .expect("batch");
        let runtime = FakeRuntime::new();

        mgr.start_docker_with_ports(&runtime, &[], "unused", Some(Path::new("docker-compose.test.yml")))
            .expect("compose");

        let calls = runtime.calls();
        let Call::ComposeUp { file, env } = &calls[0].call else {
            panic!("expected compose call, got {:?}", calls[0].call);
        };
        assert_eq!(file, Path::new("docker-compose.test.yml"));
        assert!(env.contains(&("BACKEND_PORT".to_string(), ports["backend"].to_string())));
        assert!(env.contains(&("REDIS_PORT".to_string(), ports["redis"].to_string())));
        assert!(allocator.held_ports().is_empty());
    }

    #[test]
    fn verify_ports_detects_listener() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let ports = mgr
            .allocate_service_ports(&defaults(&[("web", 80)]))
            .expect("batch");
        mgr.release_sockets();

        assert!(!mgr.verify_ports_available(Duration::from_millis(300)));

        let _listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, ports["web"])).expect("bind");
        assert!(mgr.verify_ports_available(Duration::from_secs(2)));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let allocator = Arc::new(SafePortAllocator::new());
        let mut mgr = manager(&allocator);
        let _ = mgr
            .allocate_service_ports(&defaults(&[("a", 1), ("b", 2)]))
            .expect("batch");
        mgr.cleanup();
        mgr.cleanup();
        assert!(mgr.ports().is_empty());
        assert!(allocator.held_ports().is_empty());
    }

    #[test]
    fn env_keys_are_shell_safe() {
        assert_eq!(env_key("auth"), "AUTH");
        assert_eq!(env_key("my-api.v2"), "MY_API_V2");
    }
}

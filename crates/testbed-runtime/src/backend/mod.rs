//! Container runtime abstraction.

pub mod docker;
#[cfg(any(test, feature = "fake"))]
pub mod fake;

use std::path::{Path, PathBuf};
use std::time::Duration;

use testbed_common::error::Result;
use testbed_common::types::{PortMapping, ServiceConfig, ServiceSource};

use crate::inspect::{ContainerSummary, HealthStatus};

/// Everything `docker build` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Path to the Dockerfile.
    pub dockerfile: PathBuf,
    /// Tag of the resulting image.
    pub tag: String,
    /// Build context directory.
    pub context: PathBuf,
}

impl BuildSpec {
    /// Returns the build recipe of a service, or `None` for public images.
    #[must_use]
    pub fn for_service(service: &ServiceConfig) -> Option<Self> {
        match &service.source {
            ServiceSource::Image(_) => None,
            ServiceSource::Dockerfile {
                dockerfile,
                context,
                tag,
            } => Some(Self {
                dockerfile: dockerfile.clone(),
                tag: tag.clone(),
                context: context.clone(),
            }),
        }
    }
}

/// Everything `docker run` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Container name.
    pub name: String,
    /// Network to attach to.
    pub network: String,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Environment variables, sorted by key.
    pub env: Vec<(String, String)>,
    /// Volume specifications.
    pub volumes: Vec<String>,
    /// Health probe flags.
    pub health: Option<testbed_common::types::HealthCheck>,
    /// Image reference.
    pub image: String,
    /// Command override.
    pub command: Vec<String>,
}

impl RunSpec {
    /// Builds the run specification of a service on a network.
    #[must_use]
    pub fn for_service(service: &ServiceConfig, network: &str) -> Self {
        Self {
            name: service.container_name.clone(),
            network: network.to_string(),
            ports: service.ports.clone(),
            env: service
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            volumes: service.volumes.clone(),
            health: service.health_check.clone(),
            image: service.source.image().to_string(),
            command: service.command.clone().unwrap_or_default(),
        }
    }
}

/// Capability interface over a container engine.
///
/// Implementors must be shareable across the build worker threads.
pub trait ContainerRuntime: Send + Sync {
    /// Returns the engine version; doubles as an availability probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is not reachable.
    fn version(&self) -> Result<String>;

    /// Creates a named network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be created.
    fn create_network(&self, name: &str) -> Result<()>;

    /// Removes a named network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be removed.
    fn remove_network(&self, name: &str) -> Result<()>;

    /// Builds an image without cache, killing the build after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a build error on non-zero exit or timeout.
    fn build_image(&self, spec: &BuildSpec, timeout: Duration) -> Result<()>;

    /// Starts a detached container and returns its id.
    ///
    /// # Errors
    ///
    /// Returns a run error on non-zero exit.
    fn run_container(&self, spec: &RunSpec) -> Result<String>;

    /// Reads the container's current health status.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected.
    fn inspect_health(&self, name: &str) -> Result<HealthStatus>;

    /// Stops a running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    fn stop_container(&self, name: &str) -> Result<()>;

    /// Force-removes a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be removed.
    fn remove_container(&self, name: &str) -> Result<()>;

    /// Lists all containers (running or not) whose name starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerSummary>>;

    /// Brings up a compose file in detached mode with extra environment.
    ///
    /// # Errors
    ///
    /// Returns an error on non-zero exit.
    fn compose_up(&self, file: &Path, env: &[(String, String)]) -> Result<()>;
}

//! Domain primitive types used across the testbed workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TestbedError;

/// Unique identifier of a test environment (8 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Creates an environment ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive range of TCP ports, never empty and never containing 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = TestbedError;

    fn try_from(raw: RawPortRange) -> crate::error::Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl PortRange {
    /// Creates a range.
    ///
    /// # Errors
    ///
    /// Returns an error if `start` is 0 (the kernel would pick an ephemeral
    /// port) or greater than `end`.
    pub fn new(start: u16, end: u16) -> crate::error::Result<Self> {
        if start == 0 || start > end {
            return Err(TestbedError::Config {
                message: format!("invalid port range {start}-{end}"),
            });
        }
        Ok(Self { start, end })
    }

    /// First port of the range.
    #[must_use]
    pub const fn start(&self) -> u16 {
        self.start
    }

    /// Last port of the range (inclusive).
    #[must_use]
    pub const fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false: ranges are never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `port` lies inside the range.
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Iterates over every port of the range.
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Environment tag selecting the port range ports are drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortEnvironment {
    /// Local test runs: 30000-31000.
    #[default]
    Test,
    /// Development: 8000-9000.
    Dev,
    /// Continuous integration: 40000-41000.
    Ci,
}

impl PortEnvironment {
    /// Returns the port range for this tag.
    #[must_use]
    pub const fn range(self) -> PortRange {
        let (start, end) = match self {
            Self::Test => crate::constants::TEST_PORT_RANGE,
            Self::Dev => crate::constants::DEV_PORT_RANGE,
            Self::Ci => crate::constants::CI_PORT_RANGE,
        };
        PortRange { start, end }
    }
}

impl FromStr for PortEnvironment {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "dev" => Ok(Self::Dev),
            "ci" => Ok(Self::Ci),
            other => Err(TestbedError::Config {
                message: format!("unknown port environment '{other}' (expected test, dev or ci)"),
            }),
        }
    }
}

impl fmt::Display for PortEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Dev => write!(f, "dev"),
            Self::Ci => write!(f, "ci"),
        }
    }
}

/// Lifecycle status of a test environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Id generated, nothing created yet.
    Pending,
    /// Ports, network, images and containers are being set up.
    Creating,
    /// Every service passed its health check.
    Running,
    /// A creation stage failed.
    Failed,
    /// The environment was torn down.
    Stopped,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Requested isolation of an environment.
///
/// Every level gets its own Docker network; the level is recorded on the
/// environment for callers that want to assert on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Dedicated network, dedicated ports, fresh images.
    #[default]
    Full,
    /// Dedicated network and ports, images may be shared between environments.
    Network,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Network => write!(f, "network"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "network" => Ok(Self::Network),
            other => Err(TestbedError::Config {
                message: format!("unknown isolation level '{other}'"),
            }),
        }
    }
}

/// Where a service's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    /// A public image pulled by tag; no build step.
    Image(String),
    /// A custom image built from a Dockerfile.
    Dockerfile {
        /// Path to the Dockerfile.
        dockerfile: PathBuf,
        /// Build context directory.
        context: PathBuf,
        /// Tag given to the built image.
        tag: String,
    },
}

impl ServiceSource {
    /// The image reference passed to `docker run`.
    #[must_use]
    pub fn image(&self) -> &str {
        match self {
            Self::Image(tag) | Self::Dockerfile { tag, .. } => tag,
        }
    }

    /// Whether the image must be built before the container can start.
    #[must_use]
    pub const fn needs_build(&self) -> bool {
        matches!(self, Self::Dockerfile { .. })
    }
}

/// A published port: host port forwarded to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container.
    pub container: u16,
    /// Port on the host.
    pub host: u16,
}

/// Container health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Shell command run inside the container.
    pub command: String,
    /// Time between probes.
    pub interval: Duration,
    /// Time limit of a single probe.
    pub timeout: Duration,
    /// Consecutive failures before the container is `unhealthy`.
    pub retries: u32,
}

/// Fully resolved configuration of one service in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (`postgres`, `auth`, ...).
    pub name: String,
    /// Container name, unique to the environment.
    pub container_name: String,
    /// Image reference or build recipe.
    pub source: ServiceSource,
    /// Published ports, in declaration order.
    pub ports: Vec<PortMapping>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Services that must be healthy before this one starts.
    pub depends_on: BTreeSet<String>,
    /// Readiness probe, if any.
    pub health_check: Option<HealthCheck>,
    /// Volume specifications (`host:container[:mode]`).
    pub volumes: Vec<String>,
    /// Command override.
    pub command: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Host port of the first published mapping.
    #[must_use]
    pub fn primary_host_port(&self) -> Option<u16> {
        self.ports.first().map(|m| m.host)
    }
}

/// A set of networked containers created for one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEnvironment {
    /// Generated identifier.
    pub id: EnvironmentId,
    /// Caller-supplied name.
    pub name: String,
    /// Service name to configuration.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Dedicated network name.
    pub network: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: EnvironmentStatus,
    /// Requested isolation level.
    pub isolation: IsolationLevel,
    /// Whether scope exit tears this environment down.
    pub cleanup_on_exit: bool,
}

impl TestEnvironment {
    /// Creates a `pending` environment with no services.
    #[must_use]
    pub fn new(id: EnvironmentId, name: impl Into<String>, isolation: IsolationLevel) -> Self {
        let network = crate::constants::network_name(id.as_str());
        Self {
            id,
            name: name.into(),
            services: BTreeMap::new(),
            network,
            created_at: Utc::now(),
            status: EnvironmentStatus::Pending,
            isolation,
            cleanup_on_exit: true,
        }
    }

    /// Returns `http://localhost:<port>` for the service's first published port.
    #[must_use]
    pub fn service_url(&self, service: &str) -> Option<String> {
        self.services
            .get(service)
            .and_then(ServiceConfig::primary_host_port)
            .map(|port| format!("http://localhost:{port}"))
    }
}

//! Catalog of the well-known services an environment can contain.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use testbed_common::constants;
use testbed_common::error::TestbedError;
use testbed_common::types::{EnvironmentId, HealthCheck, PortMapping, ServiceConfig, ServiceSource};

const DB_USER: &str = "test";
const DB_PASSWORD: &str = "test";
const DB_NAME: &str = "testdb";

/// A service the orchestrator knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WellKnownService {
    /// PostgreSQL database (public image).
    Postgres,
    /// Redis cache (public image).
    Redis,
    /// Application backend (built locally).
    Backend,
    /// Authentication service (built locally).
    Auth,
    /// Web frontend (built locally).
    Frontend,
}

impl WellKnownService {
    /// Every known service.
    pub const ALL: [Self; 5] = [Self::Postgres, Self::Redis, Self::Backend, Self::Auth, Self::Frontend];

    /// Service name as used in requests and container names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Backend => "backend",
            Self::Auth => "auth",
            Self::Frontend => "frontend",
        }
    }

    /// Port the service listens on inside its container.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Redis => 6379,
            Self::Backend => 8000,
            Self::Auth => 8081,
            Self::Frontend => 3000,
        }
    }

    /// Services this one needs, when they are part of the environment.
    #[must_use]
    pub const fn dependencies(self) -> &'static [Self] {
        match self {
            Self::Postgres | Self::Redis => &[],
            Self::Backend | Self::Auth => &[Self::Postgres, Self::Redis],
            Self::Frontend => &[Self::Backend, Self::Auth],
        }
    }

    /// Public image tag, or `None` for services built from a Dockerfile.
    #[must_use]
    pub const fn public_image(self, use_alpine: bool) -> Option<&'static str> {
        match (self, use_alpine) {
            (Self::Postgres, true) => Some("postgres:15-alpine"),
            (Self::Postgres, false) => Some("postgres:15"),
            (Self::Redis, true) => Some("redis:7-alpine"),
            (Self::Redis, false) => Some("redis:7"),
            _ => None,
        }
    }

    /// `<root>/<name>/Dockerfile.alpine` or `<root>/<name>/Dockerfile`.
    #[must_use]
    pub fn dockerfile(self, services_root: &Path, use_alpine: bool) -> PathBuf {
        let file = if use_alpine { "Dockerfile.alpine" } else { "Dockerfile" };
        self.build_context(services_root).join(file)
    }

    /// Build context directory of a custom service.
    #[must_use]
    pub fn build_context(self, services_root: &Path) -> PathBuf {
        services_root.join(self.name())
    }

    fn health_command(self) -> String {
        match self {
            Self::Postgres => format!("pg_isready -U {DB_USER} -d {DB_NAME}"),
            Self::Redis => "redis-cli ping".to_string(),
            other => format!("curl -fsS http://localhost:{}/health || exit 1", other.default_port()),
        }
    }
}

impl FromStr for WellKnownService {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|svc| svc.name() == s.trim())
            .ok_or_else(|| TestbedError::Config {
                message: format!(
                    "unknown service '{s}' (expected one of: postgres, redis, backend, auth, frontend)"
                ),
            })
    }
}

impl fmt::Display for WellKnownService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Inputs shared by every service of one environment.
#[derive(Debug, Clone)]
pub struct ServiceContext<'a> {
    /// Environment the service belongs to.
    pub environment_id: &'a EnvironmentId,
    /// Every service requested for the environment.
    pub requested: &'a BTreeSet<WellKnownService>,
    /// Root of the per-service build contexts.
    pub services_root: &'a Path,
    /// Prefer Alpine images and Dockerfiles.
    pub use_alpine: bool,
}

impl ServiceContext<'_> {
    fn container(&self, service: WellKnownService) -> String {
        constants::container_name(service.name(), self.environment_id.as_str())
    }

    fn has(&self, service: WellKnownService) -> bool {
        self.requested.contains(&service)
    }

    fn url(&self, service: WellKnownService) -> String {
        format!("http://{}:{}", self.container(service), service.default_port())
    }
}

/// Builds the configuration of `service` published on `host_port`.
///
/// Dependencies and connection variables only refer to services that are
/// part of the same environment.
#[must_use]
pub fn service_config(service: WellKnownService, host_port: u16, ctx: &ServiceContext<'_>) -> ServiceConfig {
    let source = service.public_image(ctx.use_alpine).map_or_else(
        || ServiceSource::Dockerfile {
            dockerfile: service.dockerfile(ctx.services_root, ctx.use_alpine),
            context: service.build_context(ctx.services_root),
            tag: constants::image_tag(service.name(), ctx.environment_id.as_str()),
        },
        |image| ServiceSource::Image(image.to_string()),
    );

    let depends_on: BTreeSet<String> = service
        .dependencies()
        .iter()
        .filter(|dep| ctx.has(**dep))
        .map(|dep| dep.name().to_string())
        .collect();

    ServiceConfig {
        name: service.name().to_string(),
        container_name: ctx.container(service),
        source,
        ports: vec![PortMapping {
            container: service.default_port(),
            host: host_port,
        }],
        environment: environment_for(service, ctx),
        depends_on,
        health_check: Some(HealthCheck {
            command: service.health_command(),
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
            retries: 15,
        }),
        volumes: Vec::new(),
        command: None,
    }
}

fn environment_for(service: WellKnownService, ctx: &ServiceContext<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        let _ = env.insert(key.to_string(), value);
    };
    match service {
        WellKnownService::Postgres => {
            set("POSTGRES_USER", DB_USER.into());
            set("POSTGRES_PASSWORD", DB_PASSWORD.into());
            set("POSTGRES_DB", DB_NAME.into());
        }
        WellKnownService::Redis => {}
        WellKnownService::Backend | WellKnownService::Auth | WellKnownService::Frontend => {
            set("PORT", service.default_port().to_string());
            set("ENVIRONMENT", "test".into());
        }
    }
    if matches!(service, WellKnownService::Backend | WellKnownService::Auth) {
        if ctx.has(WellKnownService::Postgres) {
            set(
                "DATABASE_URL",
                format!(
                    "postgresql://{DB_USER}:{DB_PASSWORD}@{}:5432/{DB_NAME}",
                    ctx.container(WellKnownService::Postgres)
                ),
            );
        }
        if ctx.has(WellKnownService::Redis) {
            set(
                "REDIS_URL",
                format!("redis://{}:6379/0", ctx.container(WellKnownService::Redis)),
            );
        }
    }
    if service == WellKnownService::Auth {
        set("JWT_SECRET", format!("test-secret-{}", ctx.environment_id));
    }
    if matches!(service, WellKnownService::Backend | WellKnownService::Frontend) && ctx.has(WellKnownService::Auth) {
        set("AUTH_URL", ctx.url(WellKnownService::Auth));
    }
    if service == WellKnownService::Frontend && ctx.has(WellKnownService::Backend) {
        set("API_URL", ctx.url(WellKnownService::Backend));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        id: &'a EnvironmentId,
        requested: &'a BTreeSet<WellKnownService>,
        use_alpine: bool,
    ) -> ServiceContext<'a> {
        ServiceContext {
            environment_id: id,
            requested,
            services_root: Path::new("services"),
            use_alpine,
        }
    }

    #[test]
    fn parses_known_names_only() {
        assert_eq!("auth".parse::<WellKnownService>().expect("auth"), WellKnownService::Auth);
        assert!("mysql".parse::<WellKnownService>().is_err());
    }

    #[test]
    fn postgres_uses_public_image_without_build() {
        let id = EnvironmentId::new("0a1b2c3d");
        let requested = BTreeSet::from([WellKnownService::Postgres]);
        let cfg = service_config(WellKnownService::Postgres, 30001, &ctx(&id, &requested, true));
        assert_eq!(cfg.source, ServiceSource::Image("postgres:15-alpine".into()));
        assert_eq!(cfg.container_name, "test-postgres-0a1b2c3d");
        assert_eq!(cfg.ports, vec![PortMapping { container: 5432, host: 30001 }]);
        assert_eq!(cfg.environment.get("POSTGRES_DB").map(String::as_str), Some("testdb"));
        assert!(cfg.depends_on.is_empty());
    }

    #[test]
    fn custom_service_follows_dockerfile_convention() {
        let id = EnvironmentId::new("0a1b2c3d");
        let requested = BTreeSet::from([WellKnownService::Auth]);

        let alpine = service_config(WellKnownService::Auth, 30002, &ctx(&id, &requested, true));
        assert_eq!(
            alpine.source,
            ServiceSource::Dockerfile {
                dockerfile: PathBuf::from("services/auth/Dockerfile.alpine"),
                context: PathBuf::from("services/auth"),
                tag: "test-auth:0a1b2c3d".into(),
            }
        );

        let plain = service_config(WellKnownService::Auth, 30002, &ctx(&id, &requested, false));
        let ServiceSource::Dockerfile { dockerfile, .. } = plain.source else {
            panic!("auth must be built");
        };
        assert_eq!(dockerfile, PathBuf::from("services/auth/Dockerfile"));
    }

    #[test]
    fn dependencies_are_limited_to_requested_services() {
        let id = EnvironmentId::new("0a1b2c3d");
        let requested = BTreeSet::from([WellKnownService::Postgres, WellKnownService::Auth]);
        let cfg = service_config(WellKnownService::Auth, 30003, &ctx(&id, &requested, true));
        assert_eq!(cfg.depends_on, BTreeSet::from(["postgres".to_string()]));
        assert!(cfg.environment.contains_key("DATABASE_URL"));
        assert!(!cfg.environment.contains_key("REDIS_URL"));
    }

    #[test]
    fn backend_is_wired_to_its_dependencies() {
        let id = EnvironmentId::new("0a1b2c3d");
        let requested: BTreeSet<_> = WellKnownService::ALL.into_iter().collect();
        let cfg = service_config(WellKnownService::Backend, 30004, &ctx(&id, &requested, false));
        assert_eq!(
            cfg.depends_on,
            BTreeSet::from(["postgres".to_string(), "redis".to_string()])
        );
        assert_eq!(
            cfg.environment.get("REDIS_URL").map(String::as_str),
            Some("redis://test-redis-0a1b2c3d:6379/0")
        );
        assert_eq!(
            cfg.environment.get("AUTH_URL").map(String::as_str),
            Some("http://test-auth-0a1b2c3d:8081")
        );
    }

    #[test]
    fn every_service_has_a_health_check() {
        let id = EnvironmentId::new("0a1b2c3d");
        let requested: BTreeSet<_> = WellKnownService::ALL.into_iter().collect();
        for svc in WellKnownService::ALL {
            let cfg = service_config(svc, 30000, &ctx(&id, &requested, true));
            assert!(cfg.health_check.is_some(), "{svc} has no health check");
        }
    }
}

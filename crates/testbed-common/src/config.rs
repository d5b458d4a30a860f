//! Runtime configuration, read from `TESTBED_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TestbedError};
use crate::types::PortEnvironment;

/// Root configuration for the testbed orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedConfig {
    /// Tag selecting the host port range.
    pub port_environment: PortEnvironment,
    /// Candidate ports tried per service before giving up.
    pub port_retries: u32,
    /// Time a service has to report `healthy`.
    pub health_timeout: Duration,
    /// Delay between two `docker inspect` probes.
    pub health_poll_interval: Duration,
    /// Parallel image builds.
    pub build_workers: usize,
    /// Time limit of a single `docker build`.
    pub build_timeout: Duration,
    /// Time limit of every other runtime command.
    pub command_timeout: Duration,
    /// Pause between container start and socket release.
    pub handoff_delay: Duration,
    /// Directory holding one build context per custom service.
    pub services_root: PathBuf,
    /// Docker CLI binary.
    pub docker_binary: String,
    /// docker-compose binary.
    pub compose_binary: String,
    /// Containers older than this are considered stale.
    pub stale_container_age: Duration,
    /// Tear environments down when the orchestrator goes out of scope.
    pub cleanup_on_exit: bool,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            port_environment: PortEnvironment::Test,
            port_retries: crate::constants::DEFAULT_PORT_RETRIES,
            health_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(1),
            build_workers: crate::constants::DEFAULT_BUILD_WORKERS,
            build_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(120),
            handoff_delay: Duration::from_millis(500),
            services_root: PathBuf::from("services"),
            docker_binary: "docker".into(),
            compose_binary: "docker-compose".into(),
            stale_container_age: Duration::from_secs(3600),
            cleanup_on_exit: true,
        }
    }
}

impl TestbedConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary read-only lookup.
    ///
    /// Unset variables keep their default value.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparsable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("TESTBED_PORT_ENV") {
            config.port_environment = v.parse()?;
        }
        if let Some(v) = lookup("TESTBED_PORT_RETRIES") {
            config.port_retries = parse("TESTBED_PORT_RETRIES", &v)?;
        }
        if let Some(v) = lookup("TESTBED_HEALTH_TIMEOUT_SECS") {
            config.health_timeout = Duration::from_secs(parse("TESTBED_HEALTH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_HEALTH_POLL_MS") {
            config.health_poll_interval = Duration::from_millis(parse("TESTBED_HEALTH_POLL_MS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_BUILD_WORKERS") {
            config.build_workers = parse("TESTBED_BUILD_WORKERS", &v)?;
        }
        if let Some(v) = lookup("TESTBED_BUILD_TIMEOUT_SECS") {
            config.build_timeout = Duration::from_secs(parse("TESTBED_BUILD_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = Duration::from_secs(parse("TESTBED_COMMAND_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_HANDOFF_DELAY_MS") {
            config.handoff_delay = Duration::from_millis(parse("TESTBED_HANDOFF_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_SERVICES_ROOT") {
            config.services_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBED_DOCKER") {
            config.docker_binary = v;
        }
        if let Some(v) = lookup("TESTBED_COMPOSE") {
            config.compose_binary = v;
        }
        if let Some(v) = lookup("TESTBED_STALE_AGE_SECS") {
            config.stale_container_age = Duration::from_secs(parse("TESTBED_STALE_AGE_SECS", &v)?);
        }
        if let Some(v) = lookup("TESTBED_KEEP_ENVIRONMENTS") {
            config.cleanup_on_exit = !parse_bool("TESTBED_KEEP_ENVIRONMENTS", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the orchestrator cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker count, retry count or poll interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.build_workers == 0 {
            return Err(TestbedError::Config {
                message: "build_workers must be at least 1".into(),
            });
        }
        if self.port_retries == 0 {
            return Err(TestbedError::Config {
                message: "port_retries must be at least 1".into(),
            });
        }
        if self.health_poll_interval.is_zero() {
            return Err(TestbedError::Config {
                message: "health_poll_interval must be non-zero".into(),
            });
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| TestbedError::Config {
        message: format!("{key}: cannot parse '{value}'"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(TestbedError::Config {
            message: format!("{key}: expected a boolean, got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = TestbedConfig::from_lookup(|_| None).expect("defaults");
        assert_eq!(config, TestbedConfig::default());
        assert_eq!(config.build_workers, 4);
    }

    #[test]
    fn variables_override_defaults() {
        let config = TestbedConfig::from_lookup(lookup_from(&[
            ("TESTBED_PORT_ENV", "ci"),
            ("TESTBED_HEALTH_TIMEOUT_SECS", "5"),
            ("TESTBED_HEALTH_POLL_MS", "250"),
            ("TESTBED_BUILD_WORKERS", "2"),
            ("TESTBED_KEEP_ENVIRONMENTS", "true"),
        ]))
        .expect("config");
        assert_eq!(config.port_environment, PortEnvironment::Ci);
        assert_eq!(config.health_timeout, Duration::from_secs(5));
        assert_eq!(config.health_poll_interval, Duration::from_millis(250));
        assert_eq!(config.build_workers, 2);
        assert!(!config.cleanup_on_exit);
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = TestbedConfig::from_lookup(lookup_from(&[("TESTBED_PORT_RETRIES", "many")]))
            .expect_err("should fail");
        assert!(err.to_string().contains("TESTBED_PORT_RETRIES"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(TestbedConfig::from_lookup(lookup_from(&[("TESTBED_BUILD_WORKERS", "0")])).is_err());
    }
}

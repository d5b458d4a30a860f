//! Docker backend that shells out to the `docker` CLI.

use std::path::Path;
use std::time::Duration;

use testbed_common::config::TestbedConfig;
use testbed_common::error::{Result, TestbedError};

use super::{BuildSpec, ContainerRuntime, RunSpec};
use crate::exec::{self, ExecOutput};
use crate::inspect::{self, ContainerSummary, HealthStatus};

/// Runtime backed by the Docker CLI.
///
/// Every operation is one blocking subprocess call bounded by
/// `command_timeout` (builds use their own limit).
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: String,
    compose: String,
    command_timeout: Duration,
}

impl DockerCli {
    /// Creates a backend using the given binaries.
    #[must_use]
    pub fn new(docker: impl Into<String>, compose: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            docker: docker.into(),
            compose: compose.into(),
            command_timeout,
        }
    }

    /// Creates a backend from the workspace configuration.
    #[must_use]
    pub fn from_config(config: &TestbedConfig) -> Self {
        Self::new(
            config.docker_binary.clone(),
            config.compose_binary.clone(),
            config.command_timeout,
        )
    }

    /// Whether the docker binary is on `PATH`.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        which::which(&self.docker).is_ok()
    }

    fn docker(&self, args: Vec<String>) -> Result<ExecOutput> {
        exec::run_command(&self.docker, &args, &[], self.command_timeout)
    }

    /// Runs a docker command and turns a non-zero exit into [`TestbedError::Command`].
    fn docker_checked(&self, args: Vec<String>) -> Result<ExecOutput> {
        let command = exec::render(&self.docker, &args);
        let out = self.docker(args)?;
        if !out.success() {
            return Err(TestbedError::Command {
                command,
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::from_config(&TestbedConfig::default())
    }
}

impl ContainerRuntime for DockerCli {
    fn version(&self) -> Result<String> {
        let out = self.docker_checked(vec!["version".into()])?;
        Ok(out.stdout.trim().to_string())
    }

    fn create_network(&self, name: &str) -> Result<()> {
        tracing::info!(network = name, "creating network");
        let _ = self.docker_checked(vec!["network".into(), "create".into(), name.into()])?;
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        tracing::info!(network = name, "removing network");
        let _ = self.docker_checked(vec!["network".into(), "rm".into(), name.into()])?;
        Ok(())
    }

    fn build_image(&self, spec: &BuildSpec, timeout: Duration) -> Result<()> {
        tracing::info!(tag = %spec.tag, dockerfile = %spec.dockerfile.display(), "building image");
        let out = exec::run_command(&self.docker, &build_args(spec), &[], timeout).map_err(|e| match e {
            TestbedError::CommandTimeout { timeout, .. } => TestbedError::Build {
                image: spec.tag.clone(),
                message: format!("build timed out after {timeout:?}"),
            },
            other => other,
        })?;
        if !out.success() {
            return Err(TestbedError::Build {
                image: spec.tag.clone(),
                message: out.stderr.trim().to_string(),
            });
        }
        tracing::info!(tag = %spec.tag, "image built");
        Ok(())
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        tracing::info!(name = %spec.name, image = %spec.image, "starting container");
        let out = self.docker(run_args(spec))?;
        if !out.success() {
            return Err(TestbedError::Run {
                container: spec.name.clone(),
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    fn inspect_health(&self, name: &str) -> Result<HealthStatus> {
        let out = self.docker_checked(vec!["inspect".into(), name.into()])?;
        inspect::parse_health(&out.stdout)
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        tracing::debug!(name, "stopping container");
        let _ = self.docker_checked(vec!["stop".into(), name.into()])?;
        Ok(())
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        tracing::debug!(name, "removing container");
        let _ = self.docker_checked(vec!["rm".into(), "-f".into(), name.into()])?;
        Ok(())
    }

    fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerSummary>> {
        let out = self.docker_checked(vec![
            "ps".into(),
            "-a".into(),
            "--filter".into(),
            format!("name={prefix}"),
            "--format".into(),
            inspect::PS_FORMAT.into(),
        ])?;
        // The name filter matches substrings; keep real prefix matches only.
        Ok(out
            .stdout
            .lines()
            .filter_map(inspect::parse_ps_line)
            .filter(|c| c.name.starts_with(prefix))
            .collect())
    }

    fn compose_up(&self, file: &Path, env: &[(String, String)]) -> Result<()> {
        let args = vec![
            "-f".to_string(),
            file.to_string_lossy().into_owned(),
            "up".to_string(),
            "-d".to_string(),
        ];
        tracing::info!(file = %file.display(), "starting compose project");
        let command = exec::render(&self.compose, &args);
        let out = exec::run_command(&self.compose, &args, env, self.command_timeout)?;
        if !out.success() {
            return Err(TestbedError::Command {
                command,
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// `docker build -f <dockerfile> -t <tag> --build-arg BUILD_ENV=test --no-cache <context>`
#[must_use]
pub fn build_args(spec: &BuildSpec) -> Vec<String> {
    vec![
        "build".into(),
        "-f".into(),
        spec.dockerfile.to_string_lossy().into_owned(),
        "-t".into(),
        spec.tag.clone(),
        "--build-arg".into(),
        testbed_common::constants::BUILD_ENV_ARG.into(),
        "--no-cache".into(),
        spec.context.to_string_lossy().into_owned(),
    ]
}

/// `docker run -d --name <name> --network <net> [-p ...] [-e ...] [-v ...] [--health-*] <image> [command]`
#[must_use]
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
    ];
    for mapping in &spec.ports {
        args.push("-p".into());
        args.push(format!("{}:{}", mapping.host, mapping.container));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }
    if let Some(health) = &spec.health {
        args.extend([
            "--health-cmd".to_string(),
            health.command.clone(),
            "--health-interval".to_string(),
            format!("{}ms", health.interval.as_millis()),
            "--health-timeout".to_string(),
            format!("{}ms", health.timeout.as_millis()),
            "--health-retries".to_string(),
            health.retries.to_string(),
        ]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use testbed_common::types::{HealthCheck, PortMapping};

    use super::*;

    fn run_spec() -> RunSpec {
        RunSpec {
            name: "test-postgres-0a1b2c3d".into(),
            network: "test-net-0a1b2c3d".into(),
            ports: vec![PortMapping { container: 5432, host: 30042 }],
            env: vec![
                ("POSTGRES_DB".into(), "testdb".into()),
                ("POSTGRES_USER".into(), "test".into()),
            ],
            volumes: vec!["/tmp/data:/var/lib/postgresql/data".into()],
            health: None,
            image: "postgres:15-alpine".into(),
            command: Vec::new(),
        }
    }

    #[test]
    fn build_args_force_fresh_build() {
        let spec = BuildSpec {
            dockerfile: "services/auth/Dockerfile".into(),
            tag: "test-auth:0a1b2c3d".into(),
            context: "services/auth".into(),
        };
        assert_eq!(
            build_args(&spec),
            vec![
                "build",
                "-f",
                "services/auth/Dockerfile",
                "-t",
                "test-auth:0a1b2c3d",
                "--build-arg",
                "BUILD_ENV=test",
                "--no-cache",
                "services/auth",
            ]
        );
    }

    #[test]
    fn run_args_shape() {
        let args = run_args(&run_spec());
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "test-postgres-0a1b2c3d",
                "--network",
                "test-net-0a1b2c3d",
                "-p",
                "30042:5432",
                "-e",
                "POSTGRES_DB=testdb",
                "-e",
                "POSTGRES_USER=test",
                "-v",
                "/tmp/data:/var/lib/postgresql/data",
                "postgres:15-alpine",
            ]
        );
    }

    #[test]
    fn run_args_health_flags_precede_image_and_command() {
        let mut spec = run_spec();
        spec.health = Some(HealthCheck {
            command: "pg_isready -U test".into(),
            interval: Duration::from_secs(2),
            timeout: Duration::from_millis(1500),
            retries: 15,
        });
        spec.command = vec!["postgres".into(), "-c".into(), "fsync=off".into()];
        let args = run_args(&spec);

        let image_pos = args.iter().position(|a| a == "postgres:15-alpine").expect("image");
        let health_pos = args.iter().position(|a| a == "--health-cmd").expect("health");
        assert!(health_pos < image_pos);
        assert_eq!(args[health_pos + 1], "pg_isready -U test");
        assert!(args.contains(&"2000ms".to_string()));
        assert!(args.contains(&"1500ms".to_string()));
        assert_eq!(&args[image_pos + 1..], ["postgres", "-c", "fsync=off"]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_binary_maps_to_command_error() {
        let cli = DockerCli::new("false", "false", Duration::from_secs(5));
        let err = cli.create_network("test-net-x").expect_err("false always fails");
        assert!(matches!(err, TestbedError::Command { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn failing_build_maps_to_build_error() {
        let cli = DockerCli::new("false", "false", Duration::from_secs(5));
        let spec = BuildSpec {
            dockerfile: "Dockerfile".into(),
            tag: "test-x:1".into(),
            context: ".".into(),
        };
        let err = cli.build_image(&spec, Duration::from_secs(5)).expect_err("should fail");
        assert!(matches!(err, TestbedError::Build { ref image, .. } if image == "test-x:1"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_run_maps_to_run_error() {
        let cli = DockerCli::new("false", "false", Duration::from_secs(5));
        let err = cli.run_container(&run_spec()).expect_err("should fail");
        assert!(matches!(err, TestbedError::Run { .. }));
    }
}

//! System-wide constants and naming conventions.

/// Application name used in CLI output and logs.
pub const APP_NAME: &str = "testbed";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "testbed";

/// Prefix of every container this crate creates.
pub const CONTAINER_PREFIX: &str = "test-";

/// Prefix of every network this crate creates.
pub const NETWORK_PREFIX: &str = "test-net-";

/// Number of hex characters in an environment id.
pub const ENVIRONMENT_ID_LENGTH: usize = 8;

/// Port range used for the `test` environment tag.
pub const TEST_PORT_RANGE: (u16, u16) = (30000, 31000);

/// Port range used for the `dev` environment tag.
pub const DEV_PORT_RANGE: (u16, u16) = (8000, 9000);

/// Port range used for the `ci` environment tag.
pub const CI_PORT_RANGE: (u16, u16) = (40000, 41000);

/// Default number of candidate ports tried per allocation.
pub const DEFAULT_PORT_RETRIES: u32 = 50;

/// Default number of parallel image builds.
pub const DEFAULT_BUILD_WORKERS: usize = 4;

/// Build argument passed to every `docker build`.
pub const BUILD_ENV_ARG: &str = "BUILD_ENV=test";

/// Legacy allocation state files removed by the conflict resolver.
pub const LEGACY_STATE_FILES: &[&str] = &[
    "port_allocations.json",
    "port_allocations.lock",
    "port-registry.yaml",
];

/// Returns the network name for an environment id.
#[must_use]
pub fn network_name(environment_id: &str) -> String {
    format!("{NETWORK_PREFIX}{environment_id}")
}

/// Returns the container name for a service of an environment.
#[must_use]
pub fn container_name(service: &str, environment_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{service}-{environment_id}")
}

/// Returns the tag of a custom image built for an environment.
#[must_use]
pub fn image_tag(service: &str, environment_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{service}:{environment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_conventions() {
        assert_eq!(network_name("deadbeef"), "test-net-deadbeef");
        assert_eq!(container_name("auth", "deadbeef"), "test-auth-deadbeef");
        assert_eq!(image_tag("auth", "deadbeef"), "test-auth:deadbeef");
    }
}

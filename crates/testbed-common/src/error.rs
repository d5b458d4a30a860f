//! Unified error types for the testbed workspace.
//!
//! Allocation, build, run and health errors are fatal for environment
//! creation and propagate to the caller. [`TestbedError::Cleanup`] is only
//! ever constructed to be logged: teardown always runs to completion.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum TestbedError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path (or program) where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// No candidate port in the range could be bound.
    #[error("could not allocate a port for {service}: {message}")]
    PortAllocation {
        /// Service the port was requested for.
        service: String,
        /// What went wrong.
        message: String,
    },

    /// One service of a batch allocation failed; the whole batch was released.
    #[error("batch port allocation failed at service {service}: {source}")]
    BatchAllocation {
        /// Service whose allocation failed.
        service: String,
        /// Underlying allocation error.
        source: Box<TestbedError>,
    },

    /// `docker build` exited with a non-zero status or timed out.
    #[error("failed to build image {image}: {message}")]
    Build {
        /// Tag of the image being built.
        image: String,
        /// Captured stderr or timeout description.
        message: String,
    },

    /// `docker run` exited with a non-zero status.
    #[error("failed to start container {container}: {message}")]
    Run {
        /// Name of the container being started.
        container: String,
        /// Captured stderr.
        message: String,
    },

    /// Any other runtime command exited with a non-zero status.
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Rendered command line.
        command: String,
        /// Captured stderr.
        message: String,
    },

    /// A runtime command exceeded its time limit and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimeout {
        /// Rendered command line.
        command: String,
        /// Time limit that was exceeded.
        timeout: Duration,
    },

    /// A service never reported `healthy` within its time limit.
    #[error("health check for {service} timed out after {timeout:?} (last status: {last_status})")]
    HealthCheckTimeout {
        /// Service that never became healthy.
        service: String,
        /// Time limit that was exceeded.
        timeout: Duration,
        /// Last status reported by the runtime.
        last_status: String,
    },

    /// The `depends_on` graph contains a cycle.
    #[error("cyclic dependency detected involving service {service}")]
    CyclicDependency {
        /// A service that participates in the cycle.
        service: String,
    },

    /// A teardown step failed. Logged, never propagated.
    #[error("cleanup of {resource} failed: {message}")]
    Cleanup {
        /// Resource being torn down.
        resource: String,
        /// What went wrong.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl TestbedError {
    /// Wraps any error as a [`TestbedError::Cleanup`] for logging.
    pub fn cleanup(resource: impl Into<String>, err: &dyn std::fmt::Display) -> Self {
        Self::Cleanup {
            resource: resource.into(),
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TestbedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_allocation_exposes_source() {
        let err = TestbedError::BatchAllocation {
            service: "redis".into(),
            source: Box::new(TestbedError::PortAllocation {
                service: "redis".into(),
                message: "exhausted 3 candidates".into(),
            }),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("exhausted 3 candidates"));
    }

    #[test]
    fn health_timeout_message_mentions_timeout() {
        let err = TestbedError::HealthCheckTimeout {
            service: "postgres".into(),
            timeout: Duration::from_secs(2),
            last_status: "starting".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"), "got: {msg}");
        assert!(msg.contains("postgres"));
    }

    #[test]
    fn cleanup_wraps_display() {
        let err = TestbedError::cleanup("network test-net-1", &"no such network");
        assert!(err.to_string().contains("no such network"));
    }
}

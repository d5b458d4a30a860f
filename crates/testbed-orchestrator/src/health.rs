//! Readiness polling through `docker inspect`.

use std::time::{Duration, Instant};

use testbed_common::error::{Result, TestbedError};
use testbed_runtime::backend::ContainerRuntime;
use testbed_runtime::inspect::HealthStatus;

/// Polls `container` until it reports `healthy`.
///
/// Containers without a health check count as ready once started. Inspect
/// failures are treated as "not yet" since a freshly started container may
/// not be visible immediately.
///
/// # Errors
///
/// Returns [`TestbedError::HealthCheckTimeout`] carrying the last observed
/// status once `timeout` has elapsed.
pub fn wait_for_healthy(
    runtime: &dyn ContainerRuntime,
    service: &str,
    container: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_status = String::from("unknown");
    let mut probes = 0_u32;

    loop {
        probes += 1;
        match runtime.inspect_health(container) {
            Ok(HealthStatus::Healthy) => {
                tracing::info!(service, container, probes, elapsed = ?start.elapsed(), "service healthy");
                return Ok(());
            }
            Ok(HealthStatus::NotConfigured) => {
                tracing::debug!(service, container, "no health check, treating as ready");
                return Ok(());
            }
            Ok(status) => {
                tracing::trace!(service, container, %status, "waiting for health");
                last_status = status.to_string();
            }
            Err(e) => {
                tracing::trace!(service, container, error = %e, "inspect failed");
                last_status = e.to_string();
            }
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(service, container, probes, %last_status, "health check timed out");
            return Err(TestbedError::HealthCheckTimeout {
                service: service.to_string(),
                timeout,
                last_status,
            });
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

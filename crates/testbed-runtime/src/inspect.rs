//! Parsing of `docker inspect` and `docker ps` output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use testbed_common::error::{Result, TestbedError};

/// Health of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Health probes have not passed yet.
    Starting,
    /// The last probes passed.
    Healthy,
    /// Probes failed more than the configured retries.
    Unhealthy,
    /// The container has no health check.
    NotConfigured,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::NotConfigured => write!(f, "none"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

/// Extracts `[0].State.Health.Status` from `docker inspect` JSON.
///
/// # Errors
///
/// Returns an error if the JSON is malformed or the array is empty.
pub fn parse_health(json: &str) -> Result<HealthStatus> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    let entry = entries.into_iter().next().ok_or_else(|| TestbedError::NotFound {
        kind: "container",
        id: "inspect returned no entries".into(),
    })?;
    Ok(match entry.state.health.map(|h| h.status) {
        None => HealthStatus::NotConfigured,
        Some(status) => match status.as_str() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Starting,
        },
    })
}

/// A container listed by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// `--format` template whose output [`parse_ps_line`] understands.
pub const PS_FORMAT: &str = "{{.Names}}\t{{.CreatedAt}}";

/// Parses one `name<TAB>created` line of `docker ps --format`.
///
/// Docker prints the creation time as `2024-05-01 10:11:12 +0200 CEST`; the
/// trailing zone abbreviation is ignored.
#[must_use]
pub fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let (name, created) = line.split_once('\t')?;
    let timestamp = created.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
    let created_at = DateTime::parse_from_str(&timestamp, "%Y-%m-%d %H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);
    Some(ContainerSummary {
        name: name.trim().to_string(),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn healthy_container() {
        let json = r#"[{"Id":"abc","State":{"Status":"running","Health":{"Status":"healthy","FailingStreak":0}}}]"#;
        assert_eq!(parse_health(json).expect("parse"), HealthStatus::Healthy);
    }

    #[test]
    fn starting_and_unhealthy() {
        let starting = r#"[{"State":{"Health":{"Status":"starting"}}}]"#;
        let unhealthy = r#"[{"State":{"Health":{"Status":"unhealthy"}}}]"#;
        assert_eq!(parse_health(starting).expect("parse"), HealthStatus::Starting);
        assert_eq!(parse_health(unhealthy).expect("parse"), HealthStatus::Unhealthy);
    }

    #[test]
    fn container_without_health_check() {
        let json = r#"[{"State":{"Status":"running"}}]"#;
        assert_eq!(parse_health(json).expect("parse"), HealthStatus::NotConfigured);
    }

    #[test]
    fn empty_inspect_output_is_not_found() {
        assert!(matches!(parse_health("[]"), Err(TestbedError::NotFound { .. })));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            parse_health("Error: No such object"),
            Err(TestbedError::Serialization { .. })
        ));
    }

    #[test]
    fn ps_line_with_zone_abbreviation() {
        let summary = parse_ps_line("test-redis-0a1b2c3d\t2024-05-01 10:11:12 +0200 CEST")
            .expect("should parse");
        assert_eq!(summary.name, "test-redis-0a1b2c3d");
        assert_eq!(
            summary.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 11, 12).single().expect("valid")
        );
    }

    #[test]
    fn malformed_ps_line_is_skipped() {
        assert!(parse_ps_line("no-tab-here").is_none());
        assert!(parse_ps_line("name\tyesterday").is_none());
    }
}

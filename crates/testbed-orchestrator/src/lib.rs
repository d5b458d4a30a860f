//! # testbed-orchestrator
//!
//! Provisions ephemeral, isolated multi-container test environments and
//! tears them down again.
//!
//! [`orchestrator::DockerOrchestrator`] ties the pieces together:
//! - [`services`]: the catalog of well-known services and their defaults.
//! - [`graph`]: `depends_on` ordering with cycle detection.
//! - [`executor`]: the bounded worker pool that builds images in parallel.
//! - [`health`]: readiness polling.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod executor;
pub mod graph;
pub mod health;
pub mod orchestrator;
pub mod services;

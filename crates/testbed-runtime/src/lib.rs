//! Container runtime abstraction for the testbed orchestrator.
//!
//! The orchestration logic only talks to [`backend::ContainerRuntime`].
//! [`backend::docker::DockerCli`] shells out to the `docker` binary; with the
//! `fake` feature, [`backend::fake::FakeRuntime`] records calls in memory.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod exec;
pub mod inspect;

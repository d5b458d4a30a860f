//! # testbed-ports
//!
//! Host port reservation for ephemeral container environments.
//!
//! - [`allocator::SafePortAllocator`]: reserves a port by binding and holding
//!   a listening socket until a container takes it over.
//! - [`manager::DockerPortManager`]: all-or-nothing batch allocation for one
//!   environment and the socket handoff to the container runtime.
//! - [`resolver::PortConflictResolver`]: best-effort cleanup of stale
//!   containers and forced port reclamation.
//!
//! There is no shared registry. Two processes can never hold the same port
//! because the kernel's `bind()` is atomic; everything else is retries.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod allocator;
pub mod manager;
pub mod resolver;

//! Port reservation by socket holding.
//!
//! Checking whether a port is free and then handing the number to a
//! container leaves a window in which any other process can take it. The
//! allocator closes that window by keeping the port bound and listening
//! until the container runtime is about to bind it itself.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, Socket, Type};
use testbed_common::error::{Result, TestbedError};
use testbed_common::types::{PortEnvironment, PortRange};

/// A reserved port: the listening socket and the service it was taken for.
#[derive(Debug)]
struct HeldPort {
    service: String,
    _socket: Socket,
}

/// Reserves TCP ports by binding them and keeping the socket open.
///
/// The internal mutex serializes the candidate search within this process
/// only. Other processes are kept out by the kernel: a port that is bound
/// and listening cannot be bound again.
#[derive(Debug, Default)]
pub struct SafePortAllocator {
    held: Mutex<BTreeMap<u16, HeldPort>>,
}

impl SafePortAllocator {
    /// Creates an allocator holding no ports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a port from the range of `environment` for `service`.
    ///
    /// # Errors
    ///
    /// Returns [`TestbedError::PortAllocation`] if none of the first
    /// `max_retries` shuffled candidates could be bound.
    pub fn allocate_port_with_hold(
        &self,
        service: &str,
        environment: PortEnvironment,
        max_retries: u32,
    ) -> Result<u16> {
        self.allocate_port_in_range(service, environment.range(), max_retries)
    }

    /// Reserves a port from an explicit range for `service`.
    ///
    /// Candidates are shuffled so that concurrent test runners starting at the
    /// same moment rarely race for the same port. Ports this allocator
    /// already holds are never candidates.
    ///
    /// # Errors
    ///
    /// Returns [`TestbedError::PortAllocation`] if none of the first
    /// `max_retries` candidates could be bound, or the range is exhausted.
    pub fn allocate_port_in_range(&self, service: &str, range: PortRange, max_retries: u32) -> Result<u16> {
        let mut held = self.held.lock();

        let mut candidates: Vec<u16> = range.ports().filter(|p| !held.contains_key(p)).collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut tried = 0_u32;
        let mut last_error: Option<io::Error> = None;
        for port in candidates.into_iter().take(max_retries as usize) {
            tried += 1;
            match bind_and_listen(port) {
                Ok(socket) => {
                    let _ = held.insert(
                        port,
                        HeldPort {
                            service: service.to_string(),
                            _socket: socket,
                        },
                    );
                    tracing::debug!(service, port, attempts = tried, "port reserved");
                    return Ok(port);
                }
                Err(e) => {
                    tracing::trace!(service, port, error = %e, "candidate port unavailable");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(|| "no free candidates left".to_string(), |e| e.to_string());
        tracing::warn!(service, %range, tried, "port allocation failed");
        Err(TestbedError::PortAllocation {
            service: service.to_string(),
            message: format!("no bindable port in {range} after {tried} attempts ({reason})"),
        })
    }

    /// Closes the socket holding `port`. Returns whether it was held.
    pub fn release_held_port(&self, port: u16) -> bool {
        let released = self.held.lock().remove(&port);
        if let Some(hold) = &released {
            tracing::debug!(service = %hold.service, port, "port released");
        }
        released.is_some()
    }

    /// Whether `port` is currently held by this allocator.
    #[must_use]
    pub fn is_held(&self, port: u16) -> bool {
        self.held.lock().contains_key(&port)
    }

    /// Service a held port was reserved for.
    #[must_use]
    pub fn holder(&self, port: u16) -> Option<String> {
        self.held.lock().get(&port).map(|h| h.service.clone())
    }

    /// All ports currently held, ascending.
    #[must_use]
    pub fn held_ports(&self) -> Vec<u16> {
        self.held.lock().keys().copied().collect()
    }

    /// Closes every held socket.
    pub fn cleanup_all(&self) {
        let mut held = self.held.lock();
        if !held.is_empty() {
            tracing::debug!(count = held.len(), "releasing all held ports");
        }
        held.clear();
    }
}

impl Drop for SafePortAllocator {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

/// Binds `0.0.0.0:<port>` and listens, so the port is taken system-wide.
fn bind_and_listen(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    // On Windows SO_REUSEADDR lets a second socket steal the port.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::TcpListener;
    use std::sync::Arc;

    use super::*;

    fn can_bind(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }

    /// A port the OS just handed out and released, very likely still free.
    fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("ephemeral bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn allocates_distinct_held_ports_in_range() {
        let allocator = SafePortAllocator::new();
        let range = PortEnvironment::Test.range();
        let mut ports = HashSet::new();
        for i in 0..5 {
            let port = allocator
                .allocate_port_with_hold(&format!("svc{i}"), PortEnvironment::Test, 50)
                .expect("allocation");
            assert!(range.contains(port));
            assert!(ports.insert(port), "port {port} returned twice");
            assert!(!can_bind(port), "port {port} should be held");
        }
        assert_eq!(allocator.held_ports().len(), 5);
    }

    #[test]
    fn release_makes_port_bindable_again() {
        let allocator = SafePortAllocator::new();
        let port = allocator
            .allocate_port_with_hold("redis", PortEnvironment::Test, 50)
            .expect("allocation");
        assert_eq!(allocator.holder(port).as_deref(), Some("redis"));

        assert!(allocator.release_held_port(port));
        assert!(!allocator.is_held(port));
        assert!(can_bind(port));
    }

    #[test]
    fn release_is_idempotent() {
        let allocator = SafePortAllocator::new();
        let port = allocator
            .allocate_port_with_hold("redis", PortEnvironment::Test, 50)
            .expect("allocation");
        assert!(allocator.release_held_port(port));
        assert!(!allocator.release_held_port(port));
        assert!(!allocator.release_held_port(1));
    }

    #[test]
    fn held_port_is_never_returned_twice() {
        let port = free_port();
        let range = PortRange::new(port, port).expect("range");
        let allocator = SafePortAllocator::new();

        assert_eq!(allocator.allocate_port_in_range("a", range, 5).expect("first"), port);
        let err = allocator.allocate_port_in_range("b", range, 5).expect_err("held");
        assert!(matches!(err, TestbedError::PortAllocation { .. }));
    }

    #[test]
    fn port_taken_by_another_socket_is_skipped() {
        let outsider = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("bind");
        let port = outsider.local_addr().expect("addr").port();
        let range = PortRange::new(port, port).expect("range");

        let err = SafePortAllocator::new()
            .allocate_port_in_range("postgres", range, 3)
            .expect_err("port is taken");
        let msg = err.to_string();
        assert!(msg.contains("postgres"), "got: {msg}");
        assert!(msg.contains("1 attempts"), "got: {msg}");
    }

    #[test]
    fn cleanup_all_is_idempotent() {
        let allocator = SafePortAllocator::new();
        for name in ["a", "b", "c"] {
            let _ = allocator
                .allocate_port_with_hold(name, PortEnvironment::Test, 50)
                .expect("allocation");
        }
        allocator.cleanup_all();
        assert!(allocator.held_ports().is_empty());
        allocator.cleanup_all();
        assert!(allocator.held_ports().is_empty());
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let allocator = Arc::new(SafePortAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..4)
                        .map(|i| {
                            allocator
                                .allocate_port_with_hold(&format!("t{t}-{i}"), PortEnvironment::Test, 100)
                                .expect("allocation")
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for port in handle.join().expect("thread") {
                assert!(all.insert(port), "duplicate port {port}");
            }
        }
        assert_eq!(all.len(), 32);
    }
}

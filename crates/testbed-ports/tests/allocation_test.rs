//! Cross-instance allocation tests.
//!
//! Separate allocator instances share nothing but the kernel's port table,
//! the same situation as parallel test runners in different processes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use testbed_common::types::PortEnvironment;
use testbed_ports::allocator::SafePortAllocator;
use testbed_ports::manager::DockerPortManager;

#[test]
fn independent_allocators_never_share_a_port() {
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let allocator = SafePortAllocator::new();
                barrier.wait();
                let ports: Vec<u16> = (0..5)
                    .map(|i| {
                        allocator
                            .allocate_port_with_hold(&format!("runner{t}-{i}"), PortEnvironment::Test, 200)
                            .expect("allocation")
                    })
                    .collect();
                // Keep the allocator alive until every runner is done.
                barrier.wait();
                ports
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for port in handle.join().expect("runner") {
            assert!(seen.insert(port), "port {port} handed to two runners");
        }
    }
    assert_eq!(seen.len(), threads * 5);
}

#[test]
fn batch_ports_are_held_until_handoff_then_free() {
    let allocator = Arc::new(SafePortAllocator::new());
    let mut manager = DockerPortManager::new(Arc::clone(&allocator), PortEnvironment::Test, 50)
        .with_handoff_delay(Duration::ZERO);
    let defaults: BTreeMap<String, u16> = [("postgres", 5432), ("auth", 8081)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    let ports = manager.allocate_service_ports(&defaults).expect("batch");
    for port in ports.values() {
        assert!(TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_err(), "{port} must be held");
    }

    manager.release_sockets();
    for port in ports.values() {
        assert!(TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_ok(), "{port} must be free");
    }
}

#[test]
fn dropping_the_manager_releases_its_batch() {
    let allocator = Arc::new(SafePortAllocator::new());
    {
        let mut manager = DockerPortManager::new(Arc::clone(&allocator), PortEnvironment::Ci, 50);
        let ports = manager
            .allocate_service_ports(&BTreeMap::from([("redis".to_string(), 6379)]))
            .expect("batch");
        assert!(PortEnvironment::Ci.range().contains(ports["redis"]));
        assert_eq!(allocator.held_ports().len(), 1);
    }
    assert!(allocator.held_ports().is_empty());
}

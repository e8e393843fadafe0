//! Port allocation fallbacks and exclusivity.

use devfleet::config::ServiceClass;
use devfleet::port::PortRange;
use devfleet::PortAllocator;
use proptest::prelude::*;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

fn loopback() -> PortAllocator {
    PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// A small window of consecutive free ports above the class ranges. The scan
/// starts at a random offset so tests running in parallel pick different windows.
fn free_window(len: u16) -> PortRange {
    let offset: u16 = rand::thread_rng().gen_range(0..300);
    for start in (30_000u16 + offset * 97..60_000).step_by(97) {
        let all_free = (start..start + len).all(|p| TcpListener::bind(("127.0.0.1", p)).is_ok());
        if all_free {
            return PortRange::new(start as u32, (start + len - 1) as u32).unwrap();
        }
    }
    panic!("no free port window found");
}

#[tokio::test]
async fn exhausted_range_falls_back_to_class_range() {
    let allocator = loopback();
    let range = free_window(2);

    let mut ports = Vec::new();
    for name in ["a", "b", "c"] {
        ports.push(
            allocator
                .allocate(name, None, Some(range), ServiceClass::Auth)
                .await
                .unwrap(),
        );
    }

    assert!(range.contains(ports[0]));
    assert!(range.contains(ports[1]));
    let third = ports[2];
    assert!(!range.contains(third), "third service must leave the exhausted range");
    assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 3);
}

#[tokio::test]
async fn port_held_by_a_foreign_listener_is_skipped() {
    let allocator = loopback();
    let range = free_window(3);
    let squatter = TcpListener::bind(("127.0.0.1", range.start)).unwrap();

    let port = allocator
        .allocate("api", Some(range.start), Some(range), ServiceClass::Backend)
        .await
        .unwrap();

    assert_ne!(port, range.start);
    assert!(range.contains(port));
    drop(squatter);
}

#[tokio::test]
async fn released_port_can_be_handed_to_another_service() {
    let allocator = loopback();
    let range = free_window(1);

    let first = allocator
        .allocate("old", None, Some(range), ServiceClass::Other)
        .await
        .unwrap();
    allocator.release(first);

    let second = allocator
        .allocate("new", None, Some(range), ServiceClass::Other)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(allocator.owner_of(second).as_deref(), Some("new"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_service_gets_a_distinct_port(count in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let allocator = loopback();
        let range = free_window(4);

        let ports: Vec<u16> = runtime.block_on(async {
            let mut ports = Vec::new();
            for i in 0..count {
                let port = allocator
                    .allocate(&format!("svc-{i}"), None, Some(range), ServiceClass::Other)
                    .await
                    .unwrap();
                ports.push(port);
            }
            ports
        });

        let unique: HashSet<u16> = ports.iter().copied().collect();
        prop_assert_eq!(unique.len(), count);
        prop_assert_eq!(allocator.reservations().len(), count);
        for (i, port) in ports.iter().enumerate().take(4) {
            prop_assert!(range.contains(*port), "svc-{} got {}", i, port);
        }
    }
}

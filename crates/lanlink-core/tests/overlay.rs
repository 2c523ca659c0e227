//! Two-node overlay integration
//!
//! Drives two complete nodes over the in-memory substrate with
//! in-memory TUN devices: address negotiation, route learning and an
//! IP-packet round trip.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::{OverlayConfig, OverlayMode, OverlayNode};
use lanlink_net::tun::memory::MemoryTun;
use lanlink_net::{MemoryHub, TunDevice};
use lanlink_proto::UserId;

const ALICE: UserId = UserId(76_561_198_000_000_001);
const BOB: UserId = UserId(76_561_198_000_000_002);

fn tun_config() -> OverlayConfig {
    OverlayConfig {
        mode: OverlayMode::Tun,
        ..Default::default()
    }
}

fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_two_nodes_negotiate_and_exchange_packets() {
    let hub = MemoryHub::new();
    let alice_sub = hub.endpoint(ALICE, "alice");
    let bob_sub = hub.endpoint(BOB, "bob");
    hub.connect(ALICE, BOB);

    let (alice, _alice_events) = OverlayNode::new(alice_sub, tun_config()).unwrap();
    let (bob, _bob_events) = OverlayNode::new(bob_sub, tun_config()).unwrap();

    let alice_tun = Arc::new(MemoryTun::new("alice0", 1400));
    let bob_tun = Arc::new(MemoryTun::new("bob0", 1400));
    alice
        .start_with_tun(alice_tun.clone() as Arc<dyn TunDevice>)
        .await
        .unwrap();
    bob.start_with_tun(bob_tun.clone() as Arc<dyn TunDevice>)
        .await
        .unwrap();

    alice.transport().add_peer(BOB);
    bob.transport().add_peer(ALICE);

    // Both nodes settle on distinct addresses inside the subnet.
    {
        let alice = alice.clone();
        let bob = bob.clone();
        wait_for("distinct stable addresses", move || {
            match (alice.local_virtual_ip(), bob.local_virtual_ip()) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            }
        })
        .await;
    }
    let alice_ip = alice.local_virtual_ip().unwrap();
    let bob_ip = bob.local_virtual_ip().unwrap();
    assert_eq!(alice_ip.octets()[0], 10);
    assert_eq!(bob_ip.octets()[0], 10);

    // The TUN devices were configured and brought up.
    let state = alice_tun.state();
    assert_eq!(state.address, Some(alice_ip));
    assert!(state.up);

    // Each learns a route to the other.
    {
        let alice = alice.clone();
        let bob = bob.clone();
        wait_for("routes learned", move || {
            let a_knows = alice
                .bridge()
                .map(|b| b.routes().iter().any(|r| r.ipv4 == bob_ip))
                .unwrap_or(false);
            let b_knows = bob
                .bridge()
                .map(|b| b.routes().iter().any(|r| r.ipv4 == alice_ip))
                .unwrap_or(false);
            a_knows && b_knows
        })
        .await;
    }

    // A packet from Alice's OS reaches Bob's TUN byte for byte.
    let packet = ip_packet(alice_ip, bob_ip);
    alice_tun.inject(packet.clone());
    {
        let bob_tun = bob_tun.clone();
        let expected = packet.clone();
        wait_for("packet delivery", move || {
            bob_tun.written().iter().any(|p| p[..] == expected[..])
        })
        .await;
    }

    let stats = alice.bridge().unwrap().stats();
    assert!(stats.packets_sent >= 1);
    assert!(stats.bytes_sent as usize >= packet.len());

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_peer_departure_drops_routes() {
    let hub = MemoryHub::new();
    let alice_sub = hub.endpoint(ALICE, "alice");
    let bob_sub = hub.endpoint(BOB, "bob");
    hub.connect(ALICE, BOB);

    let (alice, _alice_events) = OverlayNode::new(alice_sub, tun_config()).unwrap();
    let (bob, _bob_events) = OverlayNode::new(bob_sub, tun_config()).unwrap();
    let alice_tun = Arc::new(MemoryTun::new("alice0", 1400));
    let bob_tun = Arc::new(MemoryTun::new("bob0", 1400));
    alice
        .start_with_tun(alice_tun as Arc<dyn TunDevice>)
        .await
        .unwrap();
    bob.start_with_tun(bob_tun as Arc<dyn TunDevice>)
        .await
        .unwrap();
    alice.transport().add_peer(BOB);
    bob.transport().add_peer(ALICE);

    {
        let alice = alice.clone();
        wait_for("bob's route learned", move || {
            alice
                .bridge()
                .map(|b| b.routes().iter().any(|r| !r.is_local))
                .unwrap_or(false)
        })
        .await;
    }

    alice.transport().remove_peer(BOB);
    {
        let alice = alice.clone();
        wait_for("bob's route dropped", move || {
            alice
                .bridge()
                .map(|b| b.routes().iter().all(|r| r.is_local))
                .unwrap_or(false)
        })
        .await;
    }

    alice.stop().await;
    bob.stop().await;
}

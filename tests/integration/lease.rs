//! Lease lifecycle end to end: bootstrap, renewal, expiry, removal,
//! capacity, and shutdown.

use std::time::Duration;

use edgelink_core::MembershipEvent;
use edgelink_services::LeaseState;

use crate::infra::*;

const SETTLE: Duration = Duration::from_secs(2);

#[tokio::test]
async fn fresh_connect_through_seed() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 60_000);
    let mut node = node(&fast_config(1, &[&rdv]), &net);

    assert!(node.edge.start().await);
    assert_eq!(node.events.recv().await.unwrap(), MembershipEvent::BecameEdge);
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );

    assert!(node.edge.is_connected_to_any_rendezvous());
    assert_eq!(node.edge.connected_peer_ids(), vec![rdv.peer_id()]);
    assert_eq!(node.edge.lease_state(&rdv.peer_id()), LeaseState::Connected);
    assert_eq!(rdv.lease_requests(), 1);

    node.edge.stop().await;
}

#[tokio::test]
async fn short_lease_is_renewed_before_expiry() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 400);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;

    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Reconnected(rdv.peer_id()))
    );

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(rdv.lease_requests() >= 3);
    assert!(node.edge.is_connected_to_any_rendezvous());
    assert!(!drain(&mut node.events)
        .iter()
        .any(|e| matches!(e, MembershipEvent::Failed(_))));

    node.edge.stop().await;
}

#[tokio::test]
async fn unanswered_renewals_end_in_failure() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 300);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );

    rdv.set_unreachable(true);
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Failed(rdv.peer_id()))
    );
    assert!(!node.edge.is_connected_to_any_rendezvous());

    node.edge.stop().await;
}

#[tokio::test]
async fn rendezvous_revokes_lease() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 300);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );

    // The next renewal is answered with a zero lease.
    rdv.set_lease_ms(0);
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Failed(rdv.peer_id()))
    );

    node.edge.stop().await;
}

#[tokio::test]
async fn caller_disconnect_notifies_rendezvous() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 60_000);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;
    next_event(&mut node.events, SETTLE).await;

    // Keep the bootstrap from reconnecting right away.
    rdv.set_silent(true);
    assert!(node.edge.disconnect_from_rendezvous(&rdv.peer_id()).await);
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Disconnected(rdv.peer_id()))
    );
    assert_eq!(rdv.disconnect_notices(), 1);
    assert!(!node.edge.connected_peer_ids().contains(&rdv.peer_id()));

    node.edge.stop().await;
}

#[tokio::test]
async fn challenge_with_delay_expires_unresponsive_rendezvous() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 60_000);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;
    next_event(&mut node.events, SETTLE).await;

    rdv.set_unreachable(true);
    assert!(node.edge.challenge_rendezvous(&rdv.peer_id(), 100));
    assert!(node.edge.is_connected_to_any_rendezvous());
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Failed(rdv.peer_id()))
    );

    node.edge.stop().await;
}

#[tokio::test]
async fn challenge_without_delay_removes_now() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 60_000);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;
    next_event(&mut node.events, SETTLE).await;

    rdv.set_silent(true);
    assert!(node.edge.challenge_rendezvous(&rdv.peer_id(), 0));
    assert!(!node.edge.is_connected_to_any_rendezvous());
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Failed(rdv.peer_id()))
    );
    assert_eq!(rdv.disconnect_notices(), 0);

    node.edge.stop().await;
}

#[tokio::test]
async fn never_exceeds_max_connections() {
    let net = SimNet::new();
    let rdvs: Vec<_> = (1..=4).map(|n| net.add_rendezvous(n, 60_000)).collect();
    let seeds: Vec<_> = rdvs.iter().collect();
    let node = node(&fast_config(2, &seeds), &net);
    node.edge.start().await;

    assert!(wait_until(SETTLE, || node.edge.connected_peer_ids().len() == 2).await);
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(node.edge.connected_peer_ids().len() <= 2);
    }

    node.edge.stop().await;
}

#[tokio::test]
async fn bootstrap_sends_three_requests_per_cycle() {
    let net = SimNet::new();
    let rdvs: Vec<_> = (1..=10).map(|n| net.add_rendezvous(n, 60_000)).collect();
    for r in &rdvs {
        r.set_silent(true);
    }
    let seeds: Vec<_> = rdvs.iter().collect();
    let mut config = fast_config(1, &seeds);
    config.rendezvous.monitor_interval_ms = 500;
    let node = node(&config, &net);
    node.edge.start().await;

    // Cycles are a full period apart; each one sends exactly three.
    assert!(wait_until(SETTLE, || net.total_lease_requests() >= 3).await);
    assert_eq!(net.total_lease_requests(), 3);

    assert!(wait_until(SETTLE, || net.total_lease_requests() >= 6).await);
    assert_eq!(net.total_lease_requests(), 6);
    assert_eq!(rdvs[3].lease_requests(), 1);
    assert_eq!(rdvs[9].lease_requests(), 0);

    node.edge.stop().await;
}

#[tokio::test]
async fn supplied_seed_connects_without_waiting_a_period() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(7, 60_000);
    let mut config = fast_config(1, &[]);
    config.rendezvous.monitor_interval_ms = 3_600_000;
    let mut node = node(&config, &net);
    node.edge.start().await;

    assert!(node.edge.connect_to_rendezvous(&rdv.address(), None));
    assert_eq!(
        next_event(&mut node.events, Duration::from_millis(500)).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );

    node.edge.stop().await;
}

#[tokio::test]
async fn nothing_happens_until_routing_is_ready() {
    let net = SimNet::new();
    let rdv = net.add_rendezvous(1, 60_000);
    net.set_ready(false);
    let mut node = node(&fast_config(1, &[&rdv]), &net);
    node.edge.start().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rdv.lease_requests(), 0);

    net.set_ready(true);
    assert_eq!(
        next_event(&mut node.events, SETTLE).await,
        Some(MembershipEvent::Connected(rdv.peer_id()))
    );

    node.edge.stop().await;
}

#[tokio::test]
async fn stop_disconnects_everyone_once() -> anyhow::Result<()> {
    let net = SimNet::new();
    let a = net.add_rendezvous(1, 60_000);
    let b = net.add_rendezvous(2, 60_000);
    let mut node = node(&fast_config(2, &[&a, &b]), &net);
    node.edge.start().await;
    assert!(wait_until(SETTLE, || node.edge.connected_peer_ids().len() == 2).await);
    drain(&mut node.events);

    node.edge.stop().await;
    assert!(!node.edge.is_connected_to_any_rendezvous());
    assert_eq!(a.disconnect_notices(), 1);
    assert_eq!(b.disconnect_notices(), 1);
    let events = drain(&mut node.events);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(e, MembershipEvent::Disconnected(_))));

    node.edge.stop().await;
    assert_eq!(a.disconnect_notices(), 1);
    assert!(drain(&mut node.events).is_empty());
    assert!(!node.edge.start().await);

    // No monitor left running: nothing new goes out.
    let requests = net.total_lease_requests();
    tokio::time::sleep(Duration::from_millis(150)).await;
    anyhow::ensure!(net.total_lease_requests() == requests, "monitor still running after stop");
    Ok(())
}

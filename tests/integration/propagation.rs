//! Propagation over live leases.

use std::time::Duration;

use edgelink_core::wire::PROP_HEADER_ELEMENT;
use edgelink_core::{Message, PropagationHeader};

use crate::infra::*;

const SETTLE: Duration = Duration::from_secs(2);

fn chat() -> Message {
    Message::new().with_element("app:chat", &b"hello"[..])
}

fn headers(rdv: &SimRendezvous) -> Vec<PropagationHeader> {
    rdv.received_with(PROP_HEADER_ELEMENT)
        .iter()
        .map(|m| PropagationHeader::read(m).unwrap().unwrap())
        .collect()
}

#[tokio::test]
async fn propagate_reaches_leases_and_group_with_clamped_ttl() {
    let net = SimNet::new();
    let a = net.add_rendezvous(1, 60_000);
    let b = net.add_rendezvous(2, 60_000);
    let mut config = fast_config(2, &[&a, &b]);
    config.rendezvous.max_ttl = 10;
    let node = node(&config, &net);
    node.edge.start().await;
    assert!(wait_until(SETTLE, || node.edge.connected_peer_ids().len() == 2).await);

    assert_eq!(node.edge.propagate(&chat(), "chat", "lobby", 50).await, 2);

    let (ha, hb) = (headers(&a), headers(&b));
    assert_eq!(ha.len(), 1);
    assert_eq!(hb.len(), 1);
    assert_eq!(ha[0].ttl, 10);
    assert_eq!(ha[0].msg_id, hb[0].msg_id);
    assert_eq!(ha[0].path, vec![EDGE_ID]);
    assert_eq!(net.group_messages().len(), 1);

    node.edge.stop().await;
}

#[tokio::test]
async fn group_modes_stay_on_leases() {
    let net = SimNet::new();
    let a = net.add_rendezvous(1, 60_000);
    let node = node(&fast_config(1, &[&a]), &net);
    node.edge.start().await;
    assert!(wait_until(SETTLE, || node.edge.is_connected_to_any_rendezvous()).await);

    assert_eq!(node.edge.propagate_in_group(&chat(), "chat", "lobby", 3).await, 1);
    assert_eq!(node.edge.walk(&chat(), "chat", "lobby", 3).await, 1);
    assert_eq!(node.edge.walk_to(&[a.peer_id()], &chat(), "chat", "lobby", 3).await, 1);
    assert!(net.group_messages().is_empty());
    assert_eq!(headers(&a).len(), 3);

    assert!(node.edge.propagate_to_neighbors(&chat(), "chat", "lobby", 3).await);
    assert_eq!(net.group_messages().len(), 1);
    assert_eq!(headers(&a).len(), 3);

    node.edge.stop().await;
}

#[tokio::test]
async fn unreachable_lease_does_not_block_the_rest() {
    let net = SimNet::new();
    let a = net.add_rendezvous(1, 60_000);
    let b = net.add_rendezvous(2, 60_000);
    let node = node(&fast_config(2, &[&a, &b]), &net);
    node.edge.start().await;
    assert!(wait_until(SETTLE, || node.edge.connected_peer_ids().len() == 2).await);

    a.set_unreachable(true);
    assert_eq!(node.edge.propagate(&chat(), "chat", "lobby", 5).await, 1);
    assert_eq!(headers(&b).len(), 1);
    assert!(headers(&a).is_empty());

    node.edge.stop().await;
}

#[tokio::test]
async fn forwarded_message_keeps_id_and_skips_sender() {
    let net = SimNet::new();
    let a = net.add_rendezvous(1, 60_000);
    let b = net.add_rendezvous(2, 60_000);
    let node = node(&fast_config(2, &[&a, &b]), &net);
    node.edge.start().await;
    assert!(wait_until(SETTLE, || node.edge.connected_peer_ids().len() == 2).await);

    // Arrived from rendezvous `a` with four hops left.
    let mut inbound = chat();
    let original = PropagationHeader::fresh(&a.peer_id(), "chat", "lobby", 4);
    original.attach(&mut inbound).unwrap();

    assert_eq!(node.edge.propagate_in_group(&inbound, "chat", "lobby", 100).await, 1);
    assert!(headers(&a).is_empty());
    let forwarded = headers(&b);
    assert_eq!(forwarded[0].msg_id, original.msg_id);
    assert_eq!(forwarded[0].ttl, 3);
    assert_eq!(forwarded[0].path, vec![a.peer_id(), EDGE_ID]);

    // Out of hops: dropped silently.
    let mut spent = chat();
    PropagationHeader::fresh(&a.peer_id(), "chat", "lobby", 0)
        .attach(&mut spent)
        .unwrap();
    assert_eq!(node.edge.propagate(&spent, "chat", "lobby", 100).await, 0);
    assert_eq!(headers(&b).len(), 1);

    node.edge.stop().await;
}

//! Two cluster nodes on loopback sharing their bound streams.

mod common;

use common::*;
use jackal_xmpp::C2sStream;

#[tokio::test]
async fn test_stanza_routed_to_peer_node() {
    let n1 = TestNode::start("n1", Vec::new()).await;
    let n2 = TestNode::start("n2", vec![n1.cluster.local_addr().to_string()]).await;
    n1.wait_for_members(1).await;
    n2.wait_for_members(1).await;

    let mut juliet = TestStream::bind(&n2.router, "juliet@jackal.im/phone", Some(1)).await;
    let registry = std::sync::Arc::clone(n1.router.registry());
    wait_until(|| registry.stream("juliet", "phone").is_some()).await;

    let proxy = registry.stream("juliet", "phone").unwrap();
    assert_eq!(proxy.cluster_node(), Some("n2"));
    assert_eq!(proxy.presence().map(|p| p.priority()), Some(1));

    let _romeo = TestStream::bind(&n1.router, "romeo@jackal.im/balcony", Some(1)).await;
    n1.router
        .route(&chat("romeo@jackal.im/balcony", "juliet@jackal.im/phone", "wherefore"), true)
        .await
        .unwrap();

    let delivered = juliet.recv().await;
    assert_eq!(delivered.attr("from"), Some("romeo@jackal.im/balcony"));
    assert_eq!(delivered.child("body").map(|b| b.text()), Some("wherefore"));

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn test_joining_node_learns_existing_bindings() {
    let n1 = TestNode::start("n1", Vec::new()).await;
    let _romeo = TestStream::bind(&n1.router, "romeo@jackal.im/balcony", Some(3)).await;

    let n2 = TestNode::start("n2", vec![n1.cluster.local_addr().to_string()]).await;
    let registry = std::sync::Arc::clone(n2.router.registry());
    wait_until(|| registry.stream("romeo", "balcony").is_some()).await;
    assert_eq!(
        registry.stream("romeo", "balcony").and_then(|s| s.presence()).map(|p| p.priority()),
        Some(3)
    );

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn test_unbind_and_leave_remove_proxies() {
    let n1 = TestNode::start("n1", Vec::new()).await;
    let n2 = TestNode::start("n2", vec![n1.cluster.local_addr().to_string()]).await;
    n1.wait_for_members(1).await;
    n2.wait_for_members(1).await;

    let juliet = TestStream::bind(&n2.router, "juliet@jackal.im/phone", Some(1)).await;
    let _nurse = TestStream::bind(&n2.router, "juliet@jackal.im/tablet", Some(1)).await;
    let registry = std::sync::Arc::clone(n1.router.registry());
    wait_until(|| registry.streams("juliet").len() == 2).await;

    n2.router.unbind(juliet.stream.as_ref()).await;
    wait_until(|| registry.streams("juliet").len() == 1).await;

    n2.stop().await;
    wait_until(|| registry.streams("juliet").is_empty()).await;
    n1.wait_for_members(0).await;

    n1.stop().await;
}

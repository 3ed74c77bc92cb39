//! IQ modules driven directly through the module set.

mod common;

use common::*;
use jackal_xmpp::stanza::Iq;
use jackal_xmpp::xml::ns;
use jackal_xmpp::{Modules, ModulesConfig, XElement};

fn iq(from: &str, to: &str, iq_type: &str, payload: XElement) -> Iq {
    let element = XElement::builder("iq")
        .attr("id", "m1")
        .attr("type", iq_type)
        .child(payload)
        .build();
    Iq::new(element, jid(from), jid(to)).unwrap()
}

fn publish(node: &str, id: &str) -> XElement {
    let tune = XElement::builder("tune")
        .attr("xmlns", "http://jabber.org/protocol/tune")
        .child(XElement::builder("title").text("Yesterday").build())
        .build();
    XElement::builder("pubsub")
        .attr("xmlns", ns::PUBSUB)
        .child(
            XElement::builder("publish")
                .attr("node", node)
                .child(XElement::builder("item").attr("id", id).child(tune).build())
                .build(),
        )
        .build()
}

/// Collect the next `n` elements written to `stream`.
async fn recv_all(stream: &mut TestStream, n: usize) -> Vec<XElement> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(stream.recv().await);
    }
    out
}

#[tokio::test]
async fn test_pep_publish_notifies_owner() {
    let router = router_fixture().await;
    let modules = Modules::new(&ModulesConfig::default(), router.clone());
    let mut balcony = TestStream::bind(&router, "ortuman@jackal.im/balcony", Some(1)).await;

    let request = iq(
        "ortuman@jackal.im/balcony",
        "ortuman@jackal.im",
        "set",
        publish("http://jabber.org/protocol/tune", "t1"),
    );
    assert!(modules.process_iq(&request).await);

    let received = recv_all(&mut balcony, 2).await;
    let result = received.iter().find(|e| e.name() == "iq").unwrap();
    assert_eq!(result.attr("type"), Some("result"));
    assert_eq!(result.attr("id"), Some("m1"));

    let event = received.iter().find(|e| e.name() == "message").unwrap();
    assert_eq!(event.attr("type"), Some("headline"));
    assert_eq!(event.attr("from"), Some("ortuman@jackal.im"));
    let items = event
        .child_ns("event", ns::PUBSUB_EVENT)
        .and_then(|e| e.child("items"))
        .unwrap();
    assert_eq!(items.attr("node"), Some("http://jabber.org/protocol/tune"));
    assert_eq!(items.child("item").and_then(|i| i.attr("id")), Some("t1"));
}

#[tokio::test]
async fn test_pep_items_require_presence_subscription() {
    let router = router_fixture().await;
    let modules = Modules::new(&ModulesConfig::default(), router.clone());
    let mut ortuman = TestStream::bind(&router, "ortuman@jackal.im/balcony", Some(1)).await;
    let mut hamlet = TestStream::bind(&router, "hamlet@jackal.im/garden", Some(1)).await;

    let request = iq(
        "ortuman@jackal.im/balcony",
        "ortuman@jackal.im",
        "set",
        publish("http://jabber.org/protocol/tune", "t1"),
    );
    assert!(modules.process_iq(&request).await);
    recv_all(&mut ortuman, 2).await;

    let items = XElement::builder("pubsub")
        .attr("xmlns", ns::PUBSUB)
        .child(
            XElement::builder("items")
                .attr("node", "http://jabber.org/protocol/tune")
                .build(),
        )
        .build();
    let request = iq("hamlet@jackal.im/garden", "ortuman@jackal.im", "get", items.clone());
    assert!(modules.process_iq(&request).await);
    let reply = hamlet.recv().await;
    assert_eq!(reply.attr("type"), Some("error"));

    let request = iq("ortuman@jackal.im/balcony", "ortuman@jackal.im", "get", items);
    assert!(modules.process_iq(&request).await);
    let reply = ortuman.recv().await;
    assert_eq!(reply.attr("type"), Some("result"));
    let item = reply
        .child_ns("pubsub", ns::PUBSUB)
        .and_then(|p| p.child("items"))
        .and_then(|i| i.child("item"))
        .unwrap();
    assert_eq!(item.attr("id"), Some("t1"));
}

#[tokio::test]
async fn test_roster_set_is_pushed_to_interested_resources() {
    let router = router_fixture().await;
    let modules = Modules::new(&ModulesConfig::default(), router.clone());
    let mut balcony = TestStream::bind(&router, "ortuman@jackal.im/balcony", Some(1)).await;
    let mut garden = TestStream::bind(&router, "ortuman@jackal.im/garden", Some(1)).await;

    let get = iq(
        "ortuman@jackal.im/balcony",
        "ortuman@jackal.im",
        "get",
        XElement::builder("query").attr("xmlns", ns::ROSTER).build(),
    );
    assert!(modules.process_iq(&get).await);
    let reply = balcony.recv().await;
    assert_eq!(reply.attr("type"), Some("result"));
    let query = reply.child_ns("query", ns::ROSTER).unwrap();
    assert!(query.children().is_empty());

    let item = XElement::builder("item")
        .attr("jid", "juliet@jackal.im")
        .attr("name", "Juliet")
        .build();
    let set = iq(
        "ortuman@jackal.im/balcony",
        "ortuman@jackal.im",
        "set",
        XElement::builder("query").attr("xmlns", ns::ROSTER).child(item).build(),
    );
    assert!(modules.process_iq(&set).await);

    let received = recv_all(&mut balcony, 2).await;
    let push = received.iter().find(|e| e.attr("type") == Some("set")).unwrap();
    let pushed = push
        .child_ns("query", ns::ROSTER)
        .and_then(|q| q.child("item"))
        .unwrap();
    assert_eq!(pushed.attr("jid"), Some("juliet@jackal.im"));
    assert_eq!(pushed.attr("subscription"), Some("none"));
    assert!(received.iter().any(|e| e.attr("type") == Some("result")));

    // Never requested the roster, so no push.
    assert!(garden.is_idle());
}

#[tokio::test]
async fn test_unclaimed_iq_is_left_to_the_router() {
    let router = router_fixture().await;
    let modules = Modules::new(&ModulesConfig::default(), router.clone());
    let request = iq(
        "ortuman@jackal.im/balcony",
        "hamlet@jackal.im/garden",
        "get",
        XElement::builder("query").attr("xmlns", "urn:example:custom").build(),
    );
    assert!(!modules.process_iq(&request).await);
}

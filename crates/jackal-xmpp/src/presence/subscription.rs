//! RFC 6121 presence subscription state machine.
//!
//! Both ends of a subscription keep a roster item for the other. Each
//! subscription presence updates the sender's item (outbound) and the
//! receiver's item (inbound).
//!
//! ## State Transitions
//!
//! Outbound, on the sender's item for the contact:
//! - `subscribe`: ask is set unless the sender is already subscribed
//! - `subscribed`: none → from, to → both
//! - `unsubscribe`: to → none, both → from, ask cleared
//! - `unsubscribed`: from → none, both → to
//!
//! Inbound, on the receiver's item for the sender:
//! - `subscribe`: no change; the request is kept until answered
//! - `subscribed`: with a pending ask, none → to, from → both
//! - `unsubscribe`: from → none, both → to
//! - `unsubscribed`: to → none, both → from, ask cleared

use crate::stanza::PresenceType;
use crate::storage::{RosterItem, Subscription};

/// Which end of the subscription an update is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDirection {
    /// The user sent the subscription presence.
    Outbound,
    /// The user is the addressee of the subscription presence.
    Inbound,
}

/// Apply a subscription presence to `item`. Returns whether the item
/// changed and must be stored and pushed.
pub fn apply(item: &mut RosterItem, presence_type: PresenceType, direction: SubscriptionDirection) -> bool {
    let before = (item.subscription, item.ask);
    let sub = item.subscription;
    match (direction, presence_type) {
        (SubscriptionDirection::Outbound, PresenceType::Subscribe) => {
            if !sub.has_to() {
                item.ask = true;
            }
        }
        (SubscriptionDirection::Outbound, PresenceType::Subscribed) => {
            item.subscription = match sub {
                Subscription::None => Subscription::From,
                Subscription::To => Subscription::Both,
                other => other,
            };
        }
        (SubscriptionDirection::Outbound, PresenceType::Unsubscribe) => {
            item.subscription = match sub {
                Subscription::To => Subscription::None,
                Subscription::Both => Subscription::From,
                other => other,
            };
            item.ask = false;
        }
        (SubscriptionDirection::Outbound, PresenceType::Unsubscribed) => {
            item.subscription = match sub {
                Subscription::From => Subscription::None,
                Subscription::Both => Subscription::To,
                other => other,
            };
        }
        (SubscriptionDirection::Inbound, PresenceType::Subscribed) => {
            if item.ask {
                item.subscription = match sub {
                    Subscription::None => Subscription::To,
                    Subscription::From => Subscription::Both,
                    other => other,
                };
                item.ask = false;
            }
        }
        (SubscriptionDirection::Inbound, PresenceType::Unsubscribe) => {
            item.subscription = match sub {
                Subscription::From => Subscription::None,
                Subscription::Both => Subscription::To,
                other => other,
            };
        }
        (SubscriptionDirection::Inbound, PresenceType::Unsubscribed) => {
            item.subscription = match sub {
                Subscription::To => Subscription::None,
                Subscription::Both => Subscription::From,
                other => other,
            };
            item.ask = false;
        }
        _ => {}
    }
    (item.subscription, item.ask) != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(subscription: Subscription, ask: bool) -> RosterItem {
        let mut item = RosterItem::new("ortuman", "noelia@jackal.im");
        item.subscription = subscription;
        item.ask = ask;
        item
    }

    #[test]
    fn test_full_subscription_handshake() {
        // ortuman asks noelia, noelia approves.
        let mut requester = item(Subscription::None, false);
        assert!(apply(&mut requester, PresenceType::Subscribe, SubscriptionDirection::Outbound));
        assert!(requester.ask);

        let mut contact = item(Subscription::None, false);
        assert!(!apply(&mut contact, PresenceType::Subscribe, SubscriptionDirection::Inbound));
        assert!(apply(&mut contact, PresenceType::Subscribed, SubscriptionDirection::Outbound));
        assert_eq!(contact.subscription, Subscription::From);

        assert!(apply(&mut requester, PresenceType::Subscribed, SubscriptionDirection::Inbound));
        assert_eq!(requester.subscription, Subscription::To);
        assert!(!requester.ask);
    }

    #[test]
    fn test_unsolicited_subscribed_is_ignored() {
        let mut it = item(Subscription::None, false);
        assert!(!apply(&mut it, PresenceType::Subscribed, SubscriptionDirection::Inbound));
        assert_eq!(it.subscription, Subscription::None);
    }

    #[test]
    fn test_mutual_subscription_teardown() {
        let mut it = item(Subscription::Both, false);
        assert!(apply(&mut it, PresenceType::Unsubscribe, SubscriptionDirection::Outbound));
        assert_eq!(it.subscription, Subscription::From);
        assert!(apply(&mut it, PresenceType::Unsubscribed, SubscriptionDirection::Outbound));
        assert_eq!(it.subscription, Subscription::None);

        let mut other = item(Subscription::Both, false);
        assert!(apply(&mut other, PresenceType::Unsubscribed, SubscriptionDirection::Inbound));
        assert_eq!(other.subscription, Subscription::From);
        assert!(apply(&mut other, PresenceType::Unsubscribe, SubscriptionDirection::Inbound));
        assert_eq!(other.subscription, Subscription::None);
    }

    #[test]
    fn test_subscribe_when_already_subscribed() {
        let mut it = item(Subscription::To, false);
        assert!(!apply(&mut it, PresenceType::Subscribe, SubscriptionDirection::Outbound));
        assert!(!it.ask);
    }
}

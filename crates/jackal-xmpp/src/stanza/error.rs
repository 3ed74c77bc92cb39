use crate::error::StanzaErrorCondition;
use crate::xml::{ns, XElement};

/// Build an error reply from any stanza element: `from`/`to` swapped,
/// `type="error"` and an `<error/>` child appended after the original
/// payload.
pub fn error_element(element: &XElement, condition: StanzaErrorCondition) -> XElement {
    let error = XElement::builder("error")
        .attr("code", condition.code().to_string())
        .attr("type", condition.error_type().as_str())
        .child(
            XElement::builder(condition.as_str())
                .attr("xmlns", ns::STANZAS)
                .build(),
        )
        .build();

    let from = element.attr("from").map(str::to_string);
    let to = element.attr("to").map(str::to_string);

    let mut builder = element
        .to_builder()
        .remove_children("error")
        .remove_attr("from")
        .remove_attr("to");
    if let Some(to) = to {
        builder = builder.attr("from", to);
    }
    if let Some(from) = from {
        builder = builder.attr("to", from);
    }
    builder.attr("type", "error").child(error).build()
}

/// Error-response constructors shared by every stanza kind.
pub trait ErrorReply: Sized {
    /// The reply carrying `condition`.
    fn error_reply(&self, condition: StanzaErrorCondition) -> Self;

    fn bad_request(&self) -> Self {
        self.error_reply(StanzaErrorCondition::BadRequest)
    }

    fn conflict(&self) -> Self {
        self.error_reply(StanzaErrorCondition::Conflict)
    }

    fn feature_not_implemented(&self) -> Self {
        self.error_reply(StanzaErrorCondition::FeatureNotImplemented)
    }

    fn forbidden(&self) -> Self {
        self.error_reply(StanzaErrorCondition::Forbidden)
    }

    fn gone(&self) -> Self {
        self.error_reply(StanzaErrorCondition::Gone)
    }

    fn internal_server_error(&self) -> Self {
        self.error_reply(StanzaErrorCondition::InternalServerError)
    }

    fn item_not_found(&self) -> Self {
        self.error_reply(StanzaErrorCondition::ItemNotFound)
    }

    fn jid_malformed(&self) -> Self {
        self.error_reply(StanzaErrorCondition::JidMalformed)
    }

    fn not_acceptable(&self) -> Self {
        self.error_reply(StanzaErrorCondition::NotAcceptable)
    }

    fn not_allowed(&self) -> Self {
        self.error_reply(StanzaErrorCondition::NotAllowed)
    }

    fn not_authorized(&self) -> Self {
        self.error_reply(StanzaErrorCondition::NotAuthorized)
    }

    fn payment_required(&self) -> Self {
        self.error_reply(StanzaErrorCondition::PaymentRequired)
    }

    fn recipient_unavailable(&self) -> Self {
        self.error_reply(StanzaErrorCondition::RecipientUnavailable)
    }

    fn redirect(&self) -> Self {
        self.error_reply(StanzaErrorCondition::Redirect)
    }

    fn registration_required(&self) -> Self {
        self.error_reply(StanzaErrorCondition::RegistrationRequired)
    }

    fn remote_server_not_found(&self) -> Self {
        self.error_reply(StanzaErrorCondition::RemoteServerNotFound)
    }

    fn remote_server_timeout(&self) -> Self {
        self.error_reply(StanzaErrorCondition::RemoteServerTimeout)
    }

    fn resource_constraint(&self) -> Self {
        self.error_reply(StanzaErrorCondition::ResourceConstraint)
    }

    fn service_unavailable(&self) -> Self {
        self.error_reply(StanzaErrorCondition::ServiceUnavailable)
    }

    fn subscription_required(&self) -> Self {
        self.error_reply(StanzaErrorCondition::SubscriptionRequired)
    }

    fn undefined_condition(&self) -> Self {
        self.error_reply(StanzaErrorCondition::UndefinedCondition)
    }

    fn unexpected_condition(&self) -> Self {
        self.error_reply(StanzaErrorCondition::UnexpectedCondition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_element_swaps_addresses() {
        let el = XElement::builder("message")
            .attr("from", "a@b/c")
            .attr("to", "d@e")
            .attr("id", "m1")
            .child(XElement::builder("body").text("hi").build())
            .build();
        let reply = error_element(&el, StanzaErrorCondition::ItemNotFound);
        assert_eq!(reply.attr("from"), Some("d@e"));
        assert_eq!(reply.attr("to"), Some("a@b/c"));
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("m1"));

        let error = reply.child("error").unwrap();
        assert_eq!(error.attr("code"), Some("404"));
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.child_ns("item-not-found", ns::STANZAS).is_some());
        assert_eq!(reply.children()[0].name(), "body");
    }
}

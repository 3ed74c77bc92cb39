//! PubSub node configuration.
//!
//! Node options travel as a `jabber:x:data` form with `pubsub#...` fields
//! (XEP-0060 Section 8.2).

use crate::error::StanzaErrorCondition;
use crate::storage::NodeOptions;
use crate::xml::{ns, XElement};

pub const FORM_TYPE_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

const FIELD_MAX_ITEMS: &str = "pubsub#max_items";
const FIELD_TITLE: &str = "pubsub#title";
const FIELD_NOTIFY_RETRACT: &str = "pubsub#notify_retract";
const FIELD_DELIVER_PAYLOADS: &str = "pubsub#deliver_payloads";

fn parse_bool(value: &str) -> Result<bool, StanzaErrorCondition> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(StanzaErrorCondition::NotAcceptable),
    }
}

/// Apply a submitted configuration form on top of `base`. Unknown fields
/// are ignored.
pub fn apply_config_form(base: &NodeOptions, form: &XElement) -> Result<NodeOptions, StanzaErrorCondition> {
    if form.name() != "x" || form.namespace() != Some(ns::DATA_FORMS) {
        return Err(StanzaErrorCondition::BadRequest);
    }
    let mut options = base.clone();
    for field in form.children_named("field") {
        let Some(var) = field.attr("var") else {
            continue;
        };
        let value = field.child("value").map(XElement::text).unwrap_or_default();
        match var {
            FIELD_MAX_ITEMS => {
                options.max_items = match value {
                    "max" => usize::MAX,
                    v => v.parse().map_err(|_| StanzaErrorCondition::NotAcceptable)?,
                };
            }
            FIELD_TITLE => options.title = value.to_string(),
            FIELD_NOTIFY_RETRACT => options.notify_retract = parse_bool(value)?,
            FIELD_DELIVER_PAYLOADS => options.deliver_payloads = parse_bool(value)?,
            _ => {}
        }
    }
    Ok(options)
}

fn field(var: &str, field_type: &str, value: String) -> XElement {
    XElement::builder("field")
        .attr("var", var)
        .attr("type", field_type)
        .child(XElement::builder("value").text(value).build())
        .build()
}

/// The configuration form of a node, as returned to its owner.
pub fn config_form(options: &NodeOptions) -> XElement {
    XElement::builder("x")
        .attr("xmlns", ns::DATA_FORMS)
        .attr("type", "form")
        .child(field("FORM_TYPE", "hidden", FORM_TYPE_NODE_CONFIG.to_string()))
        .child(field(FIELD_MAX_ITEMS, "text-single", options.max_items.to_string()))
        .child(field(FIELD_TITLE, "text-single", options.title.clone()))
        .child(field(FIELD_NOTIFY_RETRACT, "boolean", u8::from(options.notify_retract).to_string()))
        .child(field(
            FIELD_DELIVER_PAYLOADS,
            "boolean",
            u8::from(options.deliver_payloads).to_string(),
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(fields: &[(&str, &str)]) -> XElement {
        XElement::builder("x")
            .attr("xmlns", ns::DATA_FORMS)
            .attr("type", "submit")
            .children(fields.iter().map(|(var, value)| {
                XElement::builder("field")
                    .attr("var", *var)
                    .child(XElement::builder("value").text(*value).build())
                    .build()
            }))
            .build()
    }

    #[test]
    fn test_apply_max_items() {
        let options = apply_config_form(&NodeOptions::default(), &submit(&[("pubsub#max_items", "1")])).unwrap();
        assert_eq!(options.max_items, 1);
        assert!(options.notify_retract);
    }

    #[test]
    fn test_apply_booleans_and_title() {
        let form = submit(&[
            ("FORM_TYPE", FORM_TYPE_NODE_CONFIG),
            ("pubsub#title", "Avatar"),
            ("pubsub#notify_retract", "0"),
            ("pubsub#deliver_payloads", "false"),
        ]);
        let options = apply_config_form(&NodeOptions::default(), &form).unwrap();
        assert_eq!(options.title, "Avatar");
        assert!(!options.notify_retract);
        assert!(!options.deliver_payloads);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let form = submit(&[("pubsub#max_items", "lots")]);
        assert_eq!(
            apply_config_form(&NodeOptions::default(), &form),
            Err(StanzaErrorCondition::NotAcceptable)
        );
    }

    #[test]
    fn test_config_form_reflects_options() {
        let options = NodeOptions {
            max_items: 3,
            title: "Mood".to_string(),
            notify_retract: false,
            deliver_payloads: true,
        };
        assert_eq!(apply_config_form(&NodeOptions::default(), &config_form(&options)), Ok(options));
    }
}

//! Node configuration form binding (`pubsub#node_config`).
//!
//! Every option maps to a `pubsub#<name>` field. Submitted forms are merged
//! over the current options, so omitted fields keep their values.

use super::node::{AccessModel, NodeOptions, NotificationType, PublishModel, SendLastPublishedItem};
use crate::ns::PUBSUB_NODE_CONFIG;
use crate::xep::xep0004::{parse_bool, DataForm, Field, FormType};
use crate::XmppError;

const TITLE: &str = "pubsub#title";
const DELIVER_NOTIFICATIONS: &str = "pubsub#deliver_notifications";
const DELIVER_PAYLOADS: &str = "pubsub#deliver_payloads";
const NOTIFY_CONFIG: &str = "pubsub#notify_config";
const NOTIFY_DELETE: &str = "pubsub#notify_delete";
const NOTIFY_RETRACT: &str = "pubsub#notify_retract";
const NOTIFY_SUB: &str = "pubsub#notify_sub";
const PERSIST_ITEMS: &str = "pubsub#persist_items";
const MAX_ITEMS: &str = "pubsub#max_items";
const ITEM_EXPIRE: &str = "pubsub#item_expire";
const ACCESS_MODEL: &str = "pubsub#access_model";
const PUBLISH_MODEL: &str = "pubsub#publish_model";
const ROSTER_GROUPS_ALLOWED: &str = "pubsub#roster_groups_allowed";
const SEND_LAST_PUBLISHED_ITEM: &str = "pubsub#send_last_published_item";
const NOTIFICATION_TYPE: &str = "pubsub#notification_type";
const PRESENCE_BASED_DELIVERY: &str = "pubsub#presence_based_delivery";

/// Longest accepted `pubsub#item_expire`, in seconds (ten years).
pub const MAX_ITEM_EXPIRE: u64 = 10 * 365 * 24 * 60 * 60;

fn boolean(var: &str, label: &str, value: bool) -> Field {
    Field::new(var, Some("boolean"))
        .with_label(label)
        .with_value(if value { "1" } else { "0" })
}

fn list_single(var: &str, label: &str, options: &[&str], value: &str) -> Field {
    Field::new(var, Some("list-single"))
        .with_label(label)
        .with_options(options.iter().copied())
        .with_value(value)
}

/// Serialize `options` into a node configuration form of `type_`.
pub fn options_to_form(options: &NodeOptions, type_: FormType) -> DataForm {
    let mut groups = Field::new(ROSTER_GROUPS_ALLOWED, Some("list-multi"))
        .with_label("Roster groups allowed to subscribe");
    groups.values = options.roster_groups_allowed.clone();

    DataForm::new(type_)
        .with_form_type(PUBSUB_NODE_CONFIG)
        .with_field(
            Field::new(TITLE, Some("text-single"))
                .with_label("A friendly name for the node")
                .with_value(options.title.clone()),
        )
        .with_field(boolean(
            DELIVER_NOTIFICATIONS,
            "Whether to deliver event notifications",
            options.deliver_notifications,
        ))
        .with_field(boolean(
            DELIVER_PAYLOADS,
            "Whether to deliver payloads with event notifications",
            options.deliver_payloads,
        ))
        .with_field(boolean(
            NOTIFY_CONFIG,
            "Notify subscribers when the node configuration changes",
            options.notify_config,
        ))
        .with_field(boolean(
            NOTIFY_DELETE,
            "Notify subscribers when the node is deleted",
            options.notify_delete,
        ))
        .with_field(boolean(
            NOTIFY_RETRACT,
            "Notify subscribers when items are removed from the node",
            options.notify_retract,
        ))
        .with_field(boolean(
            NOTIFY_SUB,
            "Notify owners about new subscribers and unsubscribes",
            options.notify_sub,
        ))
        .with_field(boolean(
            PERSIST_ITEMS,
            "Persist items to storage",
            options.persist_items,
        ))
        .with_field(
            Field::new(MAX_ITEMS, Some("text-single"))
                .with_label("Max # of items to persist")
                .with_value(options.max_items.to_string()),
        )
        .with_field(
            Field::new(ITEM_EXPIRE, Some("text-single"))
                .with_label("Time after which to automatically purge items")
                .with_value(options.item_expire.to_string()),
        )
        .with_field(list_single(
            ACCESS_MODEL,
            "Specify the subscriber model",
            &["open", "presence", "roster", "authorize", "whitelist"],
            options.access_model.as_str(),
        ))
        .with_field(list_single(
            PUBLISH_MODEL,
            "Specify the publisher model",
            &["publishers", "subscribers", "open"],
            options.publish_model.as_str(),
        ))
        .with_field(groups)
        .with_field(list_single(
            SEND_LAST_PUBLISHED_ITEM,
            "When to send the last published item",
            &["never", "on_sub", "on_sub_and_presence"],
            options.send_last_published_item.as_str(),
        ))
        .with_field(list_single(
            NOTIFICATION_TYPE,
            "Specify the delivery style for event notifications",
            &["normal", "headline"],
            options.notification_type.as_str(),
        ))
        .with_field(boolean(
            PRESENCE_BASED_DELIVERY,
            "Only deliver notifications to available users",
            options.presence_based_delivery,
        ))
}

fn invalid(var: &str, value: &str) -> XmppError {
    XmppError::bad_request(Some(format!("Invalid value '{}' for {}", value, var)))
}

fn merge_bool(form: &DataForm, var: &str, slot: &mut bool) -> Result<(), XmppError> {
    if let Some(value) = form.value(var) {
        *slot = parse_bool(value).ok_or_else(|| invalid(var, value))?;
    }
    Ok(())
}

fn merge_enum<T>(
    form: &DataForm,
    var: &str,
    slot: &mut T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<(), XmppError> {
    if let Some(value) = form.value(var) {
        *slot = parse(value).ok_or_else(|| invalid(var, value))?;
    }
    Ok(())
}

fn merge_number<T: std::str::FromStr>(
    form: &DataForm,
    var: &str,
    slot: &mut T,
) -> Result<(), XmppError> {
    if let Some(value) = form.value(var) {
        *slot = value.trim().parse().map_err(|_| invalid(var, value))?;
    }
    Ok(())
}

/// Merge a submitted form over `current`.
///
/// Unknown enumerated values and malformed booleans or numbers are rejected
/// with `bad-request`; a form of another `FORM_TYPE` is rejected as well.
pub fn form_to_options(form: &DataForm, current: &NodeOptions) -> Result<NodeOptions, XmppError> {
    if let Some(form_type) = form.form_type() {
        if form_type != PUBSUB_NODE_CONFIG {
            return Err(XmppError::bad_request(Some(format!(
                "Unexpected form type: {}",
                form_type
            ))));
        }
    }

    let mut options = current.clone();
    if let Some(title) = form.value(TITLE) {
        options.title = title.to_string();
    }
    merge_bool(form, DELIVER_NOTIFICATIONS, &mut options.deliver_notifications)?;
    merge_bool(form, DELIVER_PAYLOADS, &mut options.deliver_payloads)?;
    merge_bool(form, NOTIFY_CONFIG, &mut options.notify_config)?;
    merge_bool(form, NOTIFY_DELETE, &mut options.notify_delete)?;
    merge_bool(form, NOTIFY_RETRACT, &mut options.notify_retract)?;
    merge_bool(form, NOTIFY_SUB, &mut options.notify_sub)?;
    merge_bool(form, PERSIST_ITEMS, &mut options.persist_items)?;
    merge_bool(form, PRESENCE_BASED_DELIVERY, &mut options.presence_based_delivery)?;
    merge_number(form, MAX_ITEMS, &mut options.max_items)?;
    merge_number(form, ITEM_EXPIRE, &mut options.item_expire)?;
    if options.item_expire > MAX_ITEM_EXPIRE {
        return Err(XmppError::not_acceptable(Some(format!(
            "{} may not exceed {} seconds",
            ITEM_EXPIRE, MAX_ITEM_EXPIRE
        ))));
    }
    merge_enum(form, ACCESS_MODEL, &mut options.access_model, AccessModel::from_str)?;
    merge_enum(form, PUBLISH_MODEL, &mut options.publish_model, PublishModel::from_str)?;
    merge_enum(
        form,
        SEND_LAST_PUBLISHED_ITEM,
        &mut options.send_last_published_item,
        SendLastPublishedItem::from_str,
    )?;
    merge_enum(
        form,
        NOTIFICATION_TYPE,
        &mut options.notification_type,
        NotificationType::from_str,
    )?;
    if form.field(ROSTER_GROUPS_ALLOWED).is_some() {
        options.roster_groups_allowed = form.values(ROSTER_GROUPS_ALLOWED).to_vec();
    }
    Ok(options)
}

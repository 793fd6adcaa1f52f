//! Task tag grammar.
//!
//! Tags are opaque strings except for *resource tags* of the form
//! `type:id`. The cancellation path for agent-routed tasks parses these to
//! find the consumer a task was dispatched to.

/// Resource-tag type naming a consumer.
pub const RESOURCE_CONSUMER_TYPE: &str = "consumer";

/// Build a resource tag from a type and an id.
pub fn resource_tag(resource_type: &str, resource_id: &str) -> String {
    format!("{}:{}", resource_type, resource_id)
}

/// Whether a tag follows the `type:id` resource-tag form.
pub fn is_resource_tag(tag: &str) -> bool {
    parse_resource_tag(tag).is_some()
}

/// Split a resource tag into `(type, id)`. Returns `None` for opaque tags.
///
/// Only the first `:` separates; ids may themselves contain colons.
pub fn parse_resource_tag(tag: &str) -> Option<(&str, &str)> {
    let (rtype, rid) = tag.split_once(':')?;
    if rtype.is_empty() || rid.is_empty() {
        return None;
    }
    Some((rtype, rid))
}

/// Extract the consumer id from a task's tags, if any tag names one.
pub fn consumer_id(tags: &[String]) -> Option<&str> {
    tags.iter()
        .filter_map(|t| parse_resource_tag(t))
        .find(|(rtype, _)| *rtype == RESOURCE_CONSUMER_TYPE)
        .map(|(_, rid)| rid)
}

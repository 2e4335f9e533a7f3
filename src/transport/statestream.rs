//! Home Assistant `mqtt_statestream` ingest.
//!
//! With `publish_attributes: true` Home Assistant publishes every entity as:
//! - `<base>/<domain>/<object_id>/state`: raw state string
//! - `<base>/<domain>/<object_id>/<attribute>`: JSON encoded attribute value
//!
//! Messages are folded into an [`EntityRegistry`] so a poll can read a
//! complete attribute bag per entity.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashSet;

use crate::state::EntityRegistry;

/// Attributes that are timestamps about the entity, not attributes of it.
const IGNORED_FIELDS: &[&str] = &["last_updated", "last_changed"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatestreamField {
    State,
    Attribute(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatestreamTopic {
    pub entity_id: String,
    pub field: StatestreamField,
}

/// Subscription filter covering every entity under `base`.
pub fn subscription_filter(base: &str) -> String {
    format!("{}/#", base.trim_end_matches('/'))
}

/// Splits `<base>/<domain>/<object_id>/<field>` into its parts.
pub fn parse_topic(base: &str, topic: &str) -> Option<StatestreamTopic> {
    let base = base.trim_end_matches('/');
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let domain = parts.next().filter(|s| !s.is_empty())?;
    let object_id = parts.next().filter(|s| !s.is_empty())?;
    let field = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    let field = match field {
        "state" => StatestreamField::State,
        other => StatestreamField::Attribute(other.to_string()),
    };
    Some(StatestreamTopic {
        entity_id: format!("{}.{}", domain, object_id),
        field,
    })
}

/// Applies one statestream message.
///
/// Returns `Ok(false)` for topics outside `base`, for entities not in
/// `wanted`, and for timestamp fields.
pub fn apply_message(
    registry: &mut EntityRegistry,
    base: &str,
    wanted: &HashSet<String>,
    topic: &str,
    payload: &[u8],
) -> Result<bool> {
    let Some(parsed) = parse_topic(base, topic) else {
        return Ok(false);
    };
    if !wanted.contains(&parsed.entity_id) {
        return Ok(false);
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| anyhow!("non-utf8 payload on {}: {}", topic, e))?;

    match parsed.field {
        StatestreamField::State => {
            registry.set_state(&parsed.entity_id, text.trim().trim_matches('"').to_string());
        }
        StatestreamField::Attribute(name) => {
            if IGNORED_FIELDS.contains(&name.as_str()) {
                return Ok(false);
            }
            // Attribute payloads are JSON; tolerate bare strings from older setups.
            let value =
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
            registry.set_attribute(&parsed.entity_id, &name, value);
        }
    }
    Ok(true)
}

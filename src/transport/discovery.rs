//! Home Assistant MQTT Discovery for the per-person display entities.
//!
//! Entities created in Home Assistant per configured person:
//! - sensor `<Name> Transport Status`: status value plus the attribute map
//! - sensor `<Name> Transport ETA`: transit arrival or car ETA
//! - binary_sensor `<Name> On Planned Route`
//!
//! All three read the same retained state document published at
//! `<topic_prefix>/person/<object_id>/state`.
//!
//! MQTT entities take their icon from the discovery config only, so the
//! configs are republished whenever a person's status icon changes.

use anyhow::Result;
use serde::Serialize;

use crate::classify::{StatusResult, TransitStatus};
use crate::config::PersonConfig;
use crate::display::{display_name, on_route_icon, status_icon, StatusPayload, StatusView};
use crate::notify::Notification;
use crate::session::PollResults;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_TOPIC_PREFIX: &str = "transit";
pub const AVAILABILITY_TOPIC_SUFFIX: &str = "status";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Home Assistant MQTT Discovery config for a sensor.
#[derive(Clone, Debug, Serialize)]
pub struct HaSensorConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub device: HaDeviceInfo,
}

/// Home Assistant MQTT Discovery config for a binary sensor.
#[derive(Clone, Debug, Serialize)]
pub struct HaBinarySensorConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_template: Option<String>,
    pub value_template: String,
    pub payload_on: String,
    pub payload_off: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub device: HaDeviceInfo,
}

/// Home Assistant device info for entity grouping.
#[derive(Clone, Debug, Serialize)]
pub struct HaDeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl HaDeviceInfo {
    pub fn tracker(device_id: &str) -> Self {
        Self {
            identifiers: vec![device_id.to_string()],
            name: "Family Transit Tracker".to_string(),
            manufacturer: "transit-tracker".to_string(),
            model: "trackerd".to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One MQTT message ready to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Topic layout shared by discovery, state and notification messages.
#[derive(Clone, Debug)]
pub struct TopicLayout {
    pub discovery_prefix: String,
    pub topic_prefix: String,
    pub device_id: String,
}

impl TopicLayout {
    pub fn new(discovery_prefix: &str, topic_prefix: &str, device_id: &str) -> Self {
        Self {
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            device_id: sanitize_for_id(device_id),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/{}", self.topic_prefix, AVAILABILITY_TOPIC_SUFFIX)
    }

    pub fn person_state(&self, person: &str) -> String {
        format!("{}/person/{}/state", self.topic_prefix, person_object_id(person))
    }

    pub fn notification(&self, target: &str) -> String {
        format!("{}/notify/{}", self.topic_prefix, sanitize_for_id(target))
    }

    fn config_topic(&self, component: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix, component, self.device_id, object_id
        )
    }
}

/// Object id used in topics and unique ids: `device_tracker.anna` → `anna`.
pub fn person_object_id(entity_id: &str) -> String {
    let object_id = entity_id.split_once('.').map_or(entity_id, |(_, id)| id);
    sanitize_for_id(object_id)
}

pub fn sanitize_for_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Icons the discovery configs carry for a result; `None` means no poll yet.
fn entity_icons(result: Option<&StatusResult>) -> (&'static str, &'static str) {
    match result {
        Some(result) => (status_icon(result.status), on_route_icon(result.on_planned_route())),
        None => (status_icon(TransitStatus::NotTraveling), on_route_icon(false)),
    }
}

/// Discovery configs for one person's three entities, with icons for
/// `current` when known.
pub fn person_discovery(
    layout: &TopicLayout,
    person: &PersonConfig,
    current: Option<&StatusResult>,
) -> Result<Vec<Publication>> {
    let (state_icon, route_icon) = entity_icons(current);
    let device = HaDeviceInfo::tracker(&layout.device_id);
    let object_id = person_object_id(&person.person);
    let name = display_name(&person.person);
    let state_topic = layout.person_state(&person.person);
    let availability_topic = layout.availability();

    let status = HaSensorConfig {
        name: format!("{} Transport Status", name),
        unique_id: format!("{}_{}_status", layout.device_id, object_id),
        state_topic: state_topic.clone(),
        json_attributes_topic: Some(state_topic.clone()),
        json_attributes_template: Some("{{ value_json.attributes | tojson }}".to_string()),
        value_template: Some("{{ value_json.status }}".to_string()),
        device_class: None,
        icon: Some(state_icon.to_string()),
        availability_topic: availability_topic.clone(),
        payload_available: PAYLOAD_ONLINE.to_string(),
        payload_not_available: PAYLOAD_OFFLINE.to_string(),
        device: device.clone(),
    };

    let eta = HaSensorConfig {
        name: format!("{} Transport ETA", name),
        unique_id: format!("{}_{}_eta", layout.device_id, object_id),
        state_topic: state_topic.clone(),
        json_attributes_topic: Some(state_topic.clone()),
        json_attributes_template: Some(
            "{{ {'delay': value_json.attributes.delay_minutes} | tojson }}".to_string(),
        ),
        value_template: Some("{{ value_json.eta if value_json.eta else 'unknown' }}".to_string()),
        device_class: None,
        icon: Some("mdi:clock-outline".to_string()),
        availability_topic: availability_topic.clone(),
        payload_available: PAYLOAD_ONLINE.to_string(),
        payload_not_available: PAYLOAD_OFFLINE.to_string(),
        device: device.clone(),
    };

    let on_route = HaBinarySensorConfig {
        name: format!("{} On Planned Route", name),
        unique_id: format!("{}_{}_on_route", layout.device_id, object_id),
        state_topic: state_topic.clone(),
        json_attributes_topic: Some(state_topic),
        json_attributes_template: Some(
            "{{ {'confidence': value_json.attributes.confidence, \
             'planned_route': value_json.attributes.planned_route} | tojson }}"
                .to_string(),
        ),
        value_template: "{{ 'ON' if value_json.on_planned_route else 'OFF' }}".to_string(),
        payload_on: "ON".to_string(),
        payload_off: "OFF".to_string(),
        icon: Some(route_icon.to_string()),
        availability_topic,
        payload_available: PAYLOAD_ONLINE.to_string(),
        payload_not_available: PAYLOAD_OFFLINE.to_string(),
        device,
    };

    Ok(vec![
        Publication {
            topic: layout.config_topic("sensor", &format!("{}_status", object_id)),
            payload: serde_json::to_vec(&status)?,
            retain: true,
        },
        Publication {
            topic: layout.config_topic("sensor", &format!("{}_eta", object_id)),
            payload: serde_json::to_vec(&eta)?,
            retain: true,
        },
        Publication {
            topic: layout.config_topic("binary_sensor", &format!("{}_on_route", object_id)),
            payload: serde_json::to_vec(&on_route)?,
            retain: true,
        },
    ])
}

/// Discovery configs for people whose entity icons differ from the previous poll.
pub fn icon_updates(
    layout: &TopicLayout,
    people: &[PersonConfig],
    previous: &PollResults,
    current: &PollResults,
) -> Result<Vec<Publication>> {
    let mut messages = Vec::new();
    for person in people {
        let Some(now) = current.get(&person.person) else {
            continue;
        };
        let before = previous.get(&person.person);
        if entity_icons(before) == entity_icons(Some(now)) {
            continue;
        }
        messages.extend(person_discovery(layout, person, Some(now))?);
    }
    Ok(messages)
}

/// Retained state document for one person.
pub fn state_publication(
    layout: &TopicLayout,
    person: &str,
    payload: &StatusPayload,
) -> Result<Publication> {
    Ok(Publication {
        topic: layout.person_state(person),
        payload: serde_json::to_vec(payload)?,
        retain: true,
    })
}

/// Notifications are events, never retained.
pub fn notification_publication(
    layout: &TopicLayout,
    notification: &Notification,
) -> Result<Publication> {
    Ok(Publication {
        topic: layout.notification(&notification.target),
        payload: serde_json::to_vec(notification)?,
        retain: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{StatusResult, TransitStatus};
    use crate::display::payload;
    use serde_json::Value;

    fn layout() -> TopicLayout {
        TopicLayout::new("homeassistant", "transit/", "trackerd-home")
    }

    fn anna() -> PersonConfig {
        PersonConfig {
            person: "device_tracker.anna".into(),
            morning: None,
            evening: None,
            notify: vec!["notify.mobile_app_anna".into()],
        }
    }

    #[test]
    fn sanitize_for_id_replaces_special_chars() {
        assert_eq!(sanitize_for_id("front-door"), "front_door");
        assert_eq!(sanitize_for_id("notify.phone"), "notify_phone");
        assert_eq!(person_object_id("device_tracker.anna_b"), "anna_b");
        assert_eq!(person_object_id("anna"), "anna");
    }

    #[test]
    fn topics_follow_layout() {
        let layout = layout();
        assert_eq!(layout.availability(), "transit/status");
        assert_eq!(
            layout.person_state("device_tracker.anna"),
            "transit/person/anna/state"
        );
        assert_eq!(
            layout.notification("notify.mobile_app_anna"),
            "transit/notify/notify_mobile_app_anna"
        );
    }

    #[test]
    fn person_discovery_creates_three_entities() {
        let messages = person_discovery(&layout(), &anna(), None).expect("discovery");
        let topics: Vec<_> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/trackerd_home/anna_status/config",
                "homeassistant/sensor/trackerd_home/anna_eta/config",
                "homeassistant/binary_sensor/trackerd_home/anna_on_route/config",
            ]
        );
        assert!(messages.iter().all(|m| m.retain));

        let status: Value = serde_json::from_slice(&messages[0].payload).expect("json");
        assert_eq!(status["name"], "Anna Transport Status");
        assert_eq!(status["state_topic"], "transit/person/anna/state");
        assert_eq!(status["value_template"], "{{ value_json.status }}");
        assert_eq!(status["availability_topic"], "transit/status");
        assert_eq!(status["device"]["identifiers"][0], "trackerd_home");
        assert_eq!(status["icon"], "mdi:help");

        let eta: Value = serde_json::from_slice(&messages[1].payload).expect("json");
        assert_eq!(eta["json_attributes_topic"], "transit/person/anna/state");
        assert!(eta["json_attributes_template"]
            .as_str()
            .unwrap()
            .contains("'delay': value_json.attributes.delay_minutes"));

        let on_route: Value = serde_json::from_slice(&messages[2].payload).expect("json");
        assert_eq!(on_route["payload_on"], "ON");
        assert_eq!(on_route["icon"], "mdi:close-circle");
        assert_eq!(on_route["json_attributes_topic"], "transit/person/anna/state");
        let template = on_route["json_attributes_template"].as_str().unwrap();
        assert!(template.contains("'confidence': value_json.attributes.confidence"));
        assert!(template.contains("'planned_route': value_json.attributes.planned_route"));
    }

    #[test]
    fn discovery_icons_follow_current_status() {
        let riding = StatusResult {
            status: TransitStatus::OnRoute,
            ..StatusResult::unavailable()
        };
        let messages = person_discovery(&layout(), &anna(), Some(&riding)).expect("discovery");
        let status: Value = serde_json::from_slice(&messages[0].payload).expect("json");
        assert_eq!(status["icon"], "mdi:train-car");
        let on_route: Value = serde_json::from_slice(&messages[2].payload).expect("json");
        assert_eq!(on_route["icon"], "mdi:check-circle");
    }

    #[test]
    fn icon_updates_only_for_changed_icons() {
        let people = vec![anna()];
        let results = |status| -> PollResults {
            [(
                "device_tracker.anna".to_string(),
                StatusResult {
                    status,
                    ..StatusResult::unavailable()
                },
            )]
            .into_iter()
            .collect()
        };
        let layout = layout();

        let first = icon_updates(
            &layout,
            &people,
            &PollResults::new(),
            &results(TransitStatus::ByCar),
        )
        .expect("updates");
        assert_eq!(first.len(), 3);
        let status: Value = serde_json::from_slice(&first[0].payload).expect("json");
        assert_eq!(status["icon"], "mdi:car");

        let unchanged = icon_updates(
            &layout,
            &people,
            &results(TransitStatus::ByCar),
            &results(TransitStatus::ByCar),
        )
        .expect("updates");
        assert!(unchanged.is_empty());

        let quiet = icon_updates(
            &layout,
            &people,
            &PollResults::new(),
            &results(TransitStatus::NotTraveling),
        )
        .expect("updates");
        assert!(quiet.is_empty());
    }

    #[test]
    fn state_publication_is_retained_status_document() {
        let result = StatusResult {
            status: TransitStatus::ByCar,
            ..StatusResult::unavailable()
        };
        let msg = state_publication(&layout(), "device_tracker.anna", &payload(&result))
            .expect("state");
        assert!(msg.retain);
        let json: Value = serde_json::from_slice(&msg.payload).expect("json");
        assert_eq!(json["status"], "By Car");
        assert_eq!(json["on_planned_route"], false);
    }

    #[test]
    fn notification_publication_is_not_retained() {
        let note = Notification {
            target: "notify.mobile_app_anna".into(),
            person: "device_tracker.anna".into(),
            title: "Anna: By Car".into(),
            message: "Anna is travelling by car instead of A → B".into(),
        };
        let msg = notification_publication(&layout(), &note).expect("notify");
        assert!(!msg.retain);
        assert_eq!(msg.topic, "transit/notify/notify_mobile_app_anna");
    }
}

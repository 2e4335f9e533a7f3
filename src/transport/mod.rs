//! MQTT transport for the tracker daemon.
//!
//! Broker address and TLS trust, Home Assistant statestream ingest and
//! Home Assistant MQTT Discovery payloads.

mod broker;
pub mod discovery;
pub mod statestream;

pub use broker::{Broker, BrokerTrust};
pub use discovery::{
    icon_updates, notification_publication, person_discovery, person_object_id, sanitize_for_id,
    state_publication, HaBinarySensorConfig, HaDeviceInfo, HaSensorConfig, Publication,
    TopicLayout, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};
pub use statestream::{apply_message, parse_topic, subscription_filter, StatestreamTopic};

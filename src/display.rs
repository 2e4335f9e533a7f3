//! Read-only projections of a [`StatusResult`] for display entities.
//!
//! Three entities are rendered per person: the transport status sensor, the
//! ETA sensor and the "on planned route" binary sensor. None of them feed
//! back into classification.

use serde::Serialize;

use crate::classify::{StatusResult, TimedPoint, TransitStatus, TravelMode};

/// Anything that can render one person's status.
pub trait StatusView {
    fn result(&self) -> &StatusResult;

    fn state_value(&self) -> &'static str {
        self.result().status.as_str()
    }

    fn on_planned_route(&self) -> bool {
        self.result().status == TransitStatus::OnRoute
    }
}

impl StatusView for StatusResult {
    fn result(&self) -> &StatusResult {
        self
    }
}

/// Icon for the status sensor.
pub fn status_icon(status: TransitStatus) -> &'static str {
    match status {
        TransitStatus::OnRoute => "mdi:train-car",
        TransitStatus::Missed => "mdi:alert",
        TransitStatus::AtStation => "mdi:train-station",
        TransitStatus::ByCar => "mdi:car",
        TransitStatus::Stopped => "mdi:map-marker-alert",
        TransitStatus::Detoured => "mdi:map-marker-question",
        TransitStatus::AlternativeRoute => "mdi:map-marker-path",
        TransitStatus::NotTraveling => "mdi:help",
    }
}

pub fn on_route_icon(on_route: bool) -> &'static str {
    if on_route {
        "mdi:check-circle"
    } else {
        "mdi:close-circle"
    }
}

/// Attribute set of the status sensor. Every key is always present.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusAttributes {
    pub planned_route: Option<String>,
    pub departure_time: Option<String>,
    pub expected_arrival: Option<String>,
    pub delay_minutes: Option<i64>,
    pub confidence: u8,
    pub travel_mode: Option<TravelMode>,
    pub left_on_time: Option<bool>,
    pub driving_speed: Option<f64>,
    pub car_eta: Option<String>,
    pub stop_duration: Option<u32>,
    pub stop_address: Option<String>,
    pub detour_location: Option<TimedPoint>,
}

/// Full state document published for one person.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
    pub on_planned_route: bool,
    pub icon: &'static str,
    /// Transit arrival if known, otherwise the car ETA.
    pub eta: Option<String>,
    pub attributes: StatusAttributes,
}

pub fn attributes(result: &StatusResult) -> StatusAttributes {
    StatusAttributes {
        planned_route: result.planned_route.clone(),
        departure_time: result.departure_time.clone(),
        expected_arrival: result.expected_arrival.clone(),
        delay_minutes: result.delay_minutes,
        confidence: result.confidence,
        travel_mode: result.travel_mode,
        left_on_time: result.left_on_time,
        driving_speed: result.driving_speed,
        car_eta: result.car_eta.map(|eta| eta.to_rfc3339()),
        stop_duration: result.stop_duration,
        stop_address: result.address.clone(),
        detour_location: result.detour_location,
    }
}

pub fn payload<V: StatusView + ?Sized>(view: &V) -> StatusPayload {
    let result = view.result();
    let attributes = attributes(result);
    StatusPayload {
        status: view.state_value(),
        on_planned_route: view.on_planned_route(),
        icon: status_icon(result.status),
        eta: attributes
            .expected_arrival
            .clone()
            .or_else(|| attributes.car_eta.clone()),
        attributes,
    }
}

/// Friendly name derived from an entity id: `device_tracker.anna_b` → `Anna B`.
pub fn display_name(entity_id: &str) -> String {
    let object_id = entity_id.rsplit('.').next().unwrap_or(entity_id);
    object_id
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

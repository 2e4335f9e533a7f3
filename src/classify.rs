//! Per-person transit status classification.
//!
//! Each poll re-derives a person's status from scratch. The only state that
//! survives between polls lives in [`MemoryStore`]: the stop anchor (where a
//! low-speed dwell began) and the last detour point.
//!
//! Decision order for one person:
//! 1. no location → default (`NotTraveling`, confidence 0)
//! 2. no scheduled route → `NotTraveling`, confidence 100
//! 3. route state unavailable → default
//! 4. driving → `ByCar` / `Detoured`; slow → stop check
//! 5. no geometry or no departure time → `NotTraveling`, confidence 50
//! 6. otherwise proximity to the route → `AtStation` / `OnRoute` / `NotTraveling`
//!
//! Car and stop detection always run before route proximity.

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::TrackerSettings;
use crate::geo::{distance, min_distance_to_polyline, GeoPoint};
use crate::state::{PersonObservation, RouteSnapshot};

/// Address reported when the tracker gave none.
pub const UNKNOWN_ADDRESS: &str = "Unknown";

pub const CONFIDENCE_UNKNOWN: u8 = 0;
pub const CONFIDENCE_NO_ROUTE: u8 = 100;
pub const CONFIDENCE_NO_GEOMETRY: u8 = 50;
pub const CONFIDENCE_NO_DEPARTURE: u8 = 50;
pub const CONFIDENCE_AT_STATION: u8 = 90;
pub const CONFIDENCE_ON_ROUTE: u8 = 85;
pub const CONFIDENCE_OFF_ROUTE: u8 = 70;
pub const CONFIDENCE_CAR: u8 = 90;
pub const CONFIDENCE_STOPPED: u8 = 95;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitStatus {
    #[serde(rename = "Not Traveling")]
    NotTraveling,
    #[serde(rename = "On Route")]
    OnRoute,
    #[serde(rename = "At Station")]
    AtStation,
    #[serde(rename = "By Car")]
    ByCar,
    #[serde(rename = "Stopped")]
    Stopped,
    #[serde(rename = "Detoured")]
    Detoured,
    /// Reserved: not produced by the current rules.
    #[serde(rename = "Missed")]
    Missed,
    /// Reserved: not produced by the current rules.
    #[serde(rename = "Alternative Route")]
    AlternativeRoute,
}

impl TransitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotTraveling => "Not Traveling",
            Self::OnRoute => "On Route",
            Self::AtStation => "At Station",
            Self::ByCar => "By Car",
            Self::Stopped => "Stopped",
            Self::Detoured => "Detoured",
            Self::Missed => "Missed",
            Self::AlternativeRoute => "Alternative Route",
        }
    }
}

impl std::fmt::Display for TransitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    PublicTransport,
    Car,
    Stopped,
    Unknown,
}

/// A remembered position with the time it was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedPoint {
    pub lat: f64,
    pub lon: f64,
    pub time: DateTime<FixedOffset>,
}

impl TimedPoint {
    pub fn new(point: GeoPoint, time: DateTime<FixedOffset>) -> Self {
        Self {
            lat: point.lat,
            lon: point.lon,
            time,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Classification output for one person and one poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub status: TransitStatus,
    pub planned_route: Option<String>,
    pub current_location: Option<GeoPoint>,
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_mode: Option<TravelMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_arrival: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car_eta: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driving_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_on_time: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour_location: Option<TimedPoint>,
}

impl StatusResult {
    /// Result used whenever the person or their route cannot be resolved.
    pub fn unavailable() -> Self {
        Self {
            status: TransitStatus::NotTraveling,
            planned_route: None,
            current_location: None,
            confidence: CONFIDENCE_UNKNOWN,
            travel_mode: Some(TravelMode::Unknown),
            address: None,
            departure_time: None,
            expected_arrival: None,
            delay_minutes: None,
            car_eta: None,
            driving_speed: None,
            left_on_time: None,
            stop_duration: None,
            detour_location: None,
        }
    }

    fn bare(status: TransitStatus, confidence: u8) -> Self {
        Self {
            status,
            confidence,
            travel_mode: None,
            ..Self::unavailable()
        }
    }
}

/// What the schedule says about a person's route this poll.
#[derive(Clone, Copy, Debug)]
pub enum RouteExpectation<'a> {
    /// No schedule is active.
    None,
    /// A route is expected but its state could not be read.
    Unavailable,
    Available(&'a RouteSnapshot),
}

/// Memory retained for one person across polls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersonMemory {
    pub stop_anchor: Option<TimedPoint>,
    pub last_detour_point: Option<TimedPoint>,
}

/// Per-person memory, keyed by person entity id. Lives for the process only.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    people: HashMap<String, PersonMemory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, person: &str) -> Option<&PersonMemory> {
        self.people.get(person)
    }

    fn entry(&mut self, person: &str) -> &mut PersonMemory {
        self.people.entry(person.to_string()).or_default()
    }

    /// Drops memory for people no longer configured.
    pub fn retain_people<'a>(&mut self, people: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = people.into_iter().collect();
        self.people.retain(|person, _| keep.contains(person.as_str()));
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

pub struct PersonStatusClassifier {
    settings: TrackerSettings,
    memory: MemoryStore,
}

impl PersonStatusClassifier {
    pub fn new(settings: TrackerSettings) -> Self {
        Self::with_memory(settings, MemoryStore::new())
    }

    pub fn with_memory(settings: TrackerSettings, memory: MemoryStore) -> Self {
        Self { settings, memory }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryStore {
        &mut self.memory
    }

    pub fn classify(
        &mut self,
        person: &str,
        observation: Option<&PersonObservation>,
        expected: RouteExpectation<'_>,
        now: DateTime<FixedOffset>,
    ) -> StatusResult {
        let Some(observation) = observation else {
            return StatusResult::unavailable();
        };
        let Some(location) = observation.location else {
            return StatusResult::unavailable();
        };
        let anchor_released = self.release_stale_anchor(person, location);

        let route = match expected {
            RouteExpectation::None => {
                return StatusResult {
                    current_location: Some(location),
                    ..StatusResult::bare(TransitStatus::NotTraveling, CONFIDENCE_NO_ROUTE)
                };
            }
            RouteExpectation::Unavailable => {
                log::debug!("{}: expected route state unavailable", person);
                return StatusResult::unavailable();
            }
            RouteExpectation::Available(route) => route,
        };

        let address = observation
            .address
            .clone()
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

        if let Some(mut result) =
            self.check_car_or_stop(person, observation, location, route, now, anchor_released)
        {
            result.planned_route = Some(route.label());
            result.current_location = Some(location);
            result.address = Some(address);
            return result;
        }

        let (status, confidence) = self.transit_status(location, route);
        StatusResult {
            status,
            planned_route: Some(route.label()),
            current_location: Some(location),
            confidence,
            travel_mode: Some(TravelMode::PublicTransport),
            address: Some(address),
            departure_time: route.departure_time.clone(),
            expected_arrival: route.arrival_time.clone(),
            delay_minutes: Some(route.delay_minutes),
            ..StatusResult::unavailable()
        }
    }

    fn check_car_or_stop(
        &mut self,
        person: &str,
        observation: &PersonObservation,
        location: GeoPoint,
        route: &RouteSnapshot,
        now: DateTime<FixedOffset>,
        anchor_released: bool,
    ) -> Option<StatusResult> {
        let origin = route.origin_point()?;
        let destination = route.destination_point()?;
        let speed = observation.speed_kmh;

        let driving = observation.driving || speed > self.settings.driving_speed_kmh;
        if !driving {
            if speed < self.settings.stopped_speed_kmh {
                return self.check_stop(person, location, now, anchor_released);
            }
            return None;
        }

        // TODO: compare the departure moment against departure_time +/- departure_window
        // once journey planners publish parseable timestamps.
        let left_origin = distance(location, origin) > self.settings.station_radius_m;
        let left_on_time = left_origin && route.has_departure();

        let car_eta = if speed > 0.0 {
            let hours = (distance(location, destination) / 1000.0) / self.settings.car_speed_kmh;
            Duration::try_milliseconds((hours * 3_600_000.0).round() as i64)
                .and_then(|d| now.checked_add_signed(d))
        } else {
            None
        };

        let off_route = min_distance_to_polyline(location, &route.coordinates);
        let memory = self.memory.entry(person);
        let status = if off_route > self.settings.detour_threshold_m {
            memory.last_detour_point = Some(TimedPoint::new(location, now));
            log::info!("{}: detour detected {:.0} m from route", person, off_route);
            TransitStatus::Detoured
        } else {
            TransitStatus::ByCar
        };

        Some(StatusResult {
            travel_mode: Some(TravelMode::Car),
            car_eta,
            driving_speed: Some(speed),
            left_on_time: Some(left_on_time),
            detour_location: memory.last_detour_point,
            ..StatusResult::bare(status, CONFIDENCE_CAR)
        })
    }

    /// Forgets a stop anchor the person has moved away from, whatever the
    /// rest of this poll decides. Returns whether one was dropped.
    fn release_stale_anchor(&mut self, person: &str, location: GeoPoint) -> bool {
        let Some(memory) = self.memory.people.get_mut(person) else {
            return false;
        };
        match memory.stop_anchor {
            Some(anchor) if distance(location, anchor.point()) >= self.settings.stop_radius_m => {
                memory.stop_anchor = None;
                log::debug!("{}: moved away from stop anchor", person);
                true
            }
            _ => false,
        }
    }

    /// A poll that just released an anchor does not start a new one.
    fn check_stop(
        &mut self,
        person: &str,
        location: GeoPoint,
        now: DateTime<FixedOffset>,
        anchor_released: bool,
    ) -> Option<StatusResult> {
        let confirm_min = self.settings.stop_confirm_min;
        let memory = self.memory.entry(person);

        let Some(anchor) = memory.stop_anchor else {
            if !anchor_released {
                memory.stop_anchor = Some(TimedPoint::new(location, now));
            }
            return None;
        };

        let elapsed_min = (now - anchor.time).num_seconds() as f64 / 60.0;
        if elapsed_min <= confirm_min {
            return None;
        }

        Some(StatusResult {
            travel_mode: Some(TravelMode::Stopped),
            stop_duration: Some(elapsed_min as u32),
            ..StatusResult::bare(TransitStatus::Stopped, CONFIDENCE_STOPPED)
        })
    }

    fn transit_status(&self, location: GeoPoint, route: &RouteSnapshot) -> (TransitStatus, u8) {
        let Some(origin) = route.origin_point() else {
            return (TransitStatus::NotTraveling, CONFIDENCE_NO_GEOMETRY);
        };
        if !route.has_departure() {
            return (TransitStatus::NotTraveling, CONFIDENCE_NO_DEPARTURE);
        }

        if distance(location, origin) <= self.settings.station_radius_m {
            return (TransitStatus::AtStation, CONFIDENCE_AT_STATION);
        }

        let tolerance = self.settings.route_tolerance_m;
        if route
            .coordinates
            .iter()
            .any(|c| distance(location, *c) <= tolerance)
        {
            return (TransitStatus::OnRoute, CONFIDENCE_ON_ROUTE);
        }

        (TransitStatus::NotTraveling, CONFIDENCE_OFF_ROUTE)
    }
}

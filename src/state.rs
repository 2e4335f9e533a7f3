//! Host state boundary.
//!
//! Home Assistant exposes people and routes as entities carrying loose
//! attribute maps. This module is the only place those maps are read: every
//! missing or malformed attribute is resolved here into an explicit `Option`
//! or a documented default, so the classifier only ever sees typed values.
//!
//! Defaults applied at this boundary:
//! - person `speed` absent or non-numeric → 0 km/h
//! - person `driving` absent → false
//! - person `latitude`/`longitude`: either absent (or zero) → location unknown
//! - route `delay` absent → 0 minutes
//! - route `origin`/`destination` absent → empty label
//! - route coordinate entries that are not `[lat, lon]` pairs are skipped

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::geo::GeoPoint;

/// Live position of one tracked person.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersonObservation {
    pub location: Option<GeoPoint>,
    pub speed_kmh: f64,
    pub driving: bool,
    pub address: Option<String>,
}

/// Planned route as published by the journey planner entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteSnapshot {
    pub origin: String,
    pub destination: String,
    pub departure_time: Option<String>,
    pub arrival_time: Option<String>,
    pub delay_minutes: i64,
    pub coordinates: Vec<GeoPoint>,
}

impl RouteSnapshot {
    /// Human readable `origin → destination` label.
    pub fn label(&self) -> String {
        format!("{} → {}", self.origin, self.destination)
    }

    pub fn origin_point(&self) -> Option<GeoPoint> {
        self.coordinates.first().copied()
    }

    pub fn destination_point(&self) -> Option<GeoPoint> {
        self.coordinates.last().copied()
    }

    /// Blank departure strings count as missing.
    pub fn has_departure(&self) -> bool {
        self.departure_time
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

/// Source of person and route state for a poll.
pub trait StateProvider {
    /// Fails when the provider as a whole is unusable for this poll.
    fn health(&self) -> Result<()> {
        Ok(())
    }

    /// `Ok(None)` when the entity is unknown.
    fn observation(&self, entity_id: &str) -> Result<Option<PersonObservation>>;

    /// `Ok(None)` when the entity is unknown.
    fn route(&self, entity_id: &str) -> Result<Option<RouteSnapshot>>;
}

/// One host entity: state string plus attribute bag.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EntityState {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ApiStateRecord {
    entity_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

/// In-memory entity registry keyed by entity id.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityState>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `/api/states` style dump: a JSON array of
    /// `{entity_id, state, attributes}` records.
    pub fn from_states_json(raw: &[u8]) -> Result<Self> {
        let records: Vec<ApiStateRecord> =
            serde_json::from_slice(raw).context("invalid state dump")?;
        let mut registry = Self::new();
        for record in records {
            registry.entities.insert(
                record.entity_id,
                EntityState {
                    state: record.state,
                    attributes: record.attributes,
                },
            );
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read state file {}: {}", path.display(), e))?;
        Self::from_states_json(&raw).with_context(|| format!("state file {}", path.display()))
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityState> {
        self.entities.get(entity_id)
    }

    pub fn set_state(&mut self, entity_id: &str, state: String) {
        self.entities
            .entry(entity_id.to_string())
            .or_default()
            .state = Some(state);
    }

    pub fn set_attribute(&mut self, entity_id: &str, name: &str, value: Value) {
        self.entities
            .entry(entity_id.to_string())
            .or_default()
            .attributes
            .insert(name.to_string(), value);
    }

    pub fn insert(&mut self, entity_id: &str, entity: EntityState) {
        self.entities.insert(entity_id.to_string(), entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl StateProvider for EntityRegistry {
    fn observation(&self, entity_id: &str) -> Result<Option<PersonObservation>> {
        Ok(self.get(entity_id).map(observation_from_entity))
    }

    fn route(&self, entity_id: &str) -> Result<Option<RouteSnapshot>> {
        Ok(self.get(entity_id).map(route_from_entity))
    }
}

/// Registry shared with a background ingest thread.
///
/// Reports unhealthy until the feeding connection marks itself online.
#[derive(Clone, Debug, Default)]
pub struct SharedRegistry {
    inner: Arc<Mutex<EntityRegistry>>,
    online: Arc<AtomicBool>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut EntityRegistry) -> T) -> Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("entity registry lock poisoned"))?;
        Ok(f(&mut guard))
    }

    fn with<T>(&self, f: impl FnOnce(&EntityRegistry) -> T) -> Result<T> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("entity registry lock poisoned"))?;
        Ok(f(&guard))
    }
}

impl StateProvider for SharedRegistry {
    fn health(&self) -> Result<()> {
        if !self.is_online() {
            return Err(anyhow!("state stream is not connected"));
        }
        Ok(())
    }

    fn observation(&self, entity_id: &str) -> Result<Option<PersonObservation>> {
        self.with(|registry| registry.get(entity_id).map(observation_from_entity))
    }

    fn route(&self, entity_id: &str) -> Result<Option<RouteSnapshot>> {
        self.with(|registry| registry.get(entity_id).map(route_from_entity))
    }
}

/// Re-reads a state dump from disk on every poll.
#[derive(Clone, Debug)]
pub struct StateFileProvider {
    path: std::path::PathBuf,
    current: EntityRegistry,
}

impl StateFileProvider {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: EntityRegistry::new(),
        }
    }

    /// Loads the file; an unreadable file fails the whole poll.
    pub fn reload(&mut self) -> Result<()> {
        self.current = EntityRegistry::load(&self.path)?;
        log::debug!(
            "loaded {} entities from {}",
            self.current.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl StateProvider for StateFileProvider {
    fn health(&self) -> Result<()> {
        if !self.path.exists() {
            return Err(anyhow!("state file {} is missing", self.path.display()));
        }
        Ok(())
    }

    fn observation(&self, entity_id: &str) -> Result<Option<PersonObservation>> {
        self.current.observation(entity_id)
    }

    fn route(&self, entity_id: &str) -> Result<Option<RouteSnapshot>> {
        self.current.route(entity_id)
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "on" | "yes"),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn coordinate(value: &Value) -> Option<GeoPoint> {
    match value {
        Value::Array(pair) if pair.len() >= 2 => {
            Some(GeoPoint::new(number(&pair[0])?, number(&pair[1])?))
        }
        Value::Object(obj) => {
            let lat = obj.get("lat").or_else(|| obj.get("latitude"))?;
            let lon = obj.get("lon").or_else(|| obj.get("longitude"))?;
            Some(GeoPoint::new(number(lat)?, number(lon)?))
        }
        _ => None,
    }
}

/// Maps a person entity's attributes to an observation.
pub fn observation_from_entity(entity: &EntityState) -> PersonObservation {
    let attrs = &entity.attributes;
    let lat = attrs.get("latitude").and_then(number);
    let lon = attrs.get("longitude").and_then(number);
    // A zero coordinate is how trackers report "no fix".
    let location = match (lat, lon) {
        (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some(GeoPoint::new(lat, lon)),
        _ => None,
    };
    PersonObservation {
        location,
        speed_kmh: attrs.get("speed").and_then(number).unwrap_or(0.0),
        driving: attrs.get("driving").map(flag).unwrap_or(false),
        address: attrs.get("address").and_then(text),
    }
}

/// Maps a route entity's attributes to a snapshot.
pub fn route_from_entity(entity: &EntityState) -> RouteSnapshot {
    let attrs = &entity.attributes;
    let coordinates = match attrs.get("route_coordinates") {
        Some(Value::Array(items)) => items.iter().filter_map(coordinate).collect(),
        _ => Vec::new(),
    };
    RouteSnapshot {
        origin: attrs.get("origin").and_then(text).unwrap_or_default(),
        destination: attrs.get("destination").and_then(text).unwrap_or_default(),
        departure_time: attrs.get("departure_time").and_then(text),
        arrival_time: attrs.get("arrival_time").and_then(text),
        delay_minutes: attrs
            .get("delay")
            .and_then(number)
            .map(|v| v.round() as i64)
            .unwrap_or(0),
        coordinates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DUMP: &str = r#"[
        {
            "entity_id": "device_tracker.anna",
            "state": "not_home",
            "attributes": {
                "latitude": 52.0894,
                "longitude": 5.1100,
                "speed": "12.5",
                "driving": false,
                "address": "Stationsplein, Utrecht"
            }
        },
        {
            "entity_id": "sensor.route_to_work",
            "state": "07:45",
            "attributes": {
                "origin": "Utrecht Centraal",
                "destination": "Amsterdam Centraal",
                "departure_time": "2025-06-10T07:45:00+02:00",
                "arrival_time": "2025-06-10T08:12:00+02:00",
                "delay": 3,
                "route_coordinates": [[52.0894, 5.1100], "junk", [52.3791, 4.9003]]
            }
        }
    ]"#;

    #[test]
    fn parses_state_dump() {
        let registry = EntityRegistry::from_states_json(DUMP.as_bytes()).expect("parse");
        assert_eq!(registry.len(), 2);

        let obs = registry
            .observation("device_tracker.anna")
            .unwrap()
            .expect("person");
        assert_eq!(obs.location, Some(GeoPoint::new(52.0894, 5.1100)));
        assert_eq!(obs.speed_kmh, 12.5);
        assert!(!obs.driving);
        assert_eq!(obs.address.as_deref(), Some("Stationsplein, Utrecht"));

        let route = registry
            .route("sensor.route_to_work")
            .unwrap()
            .expect("route");
        assert_eq!(route.label(), "Utrecht Centraal → Amsterdam Centraal");
        assert_eq!(route.delay_minutes, 3);
        assert_eq!(route.coordinates.len(), 2);
        assert_eq!(route.destination_point(), Some(GeoPoint::new(52.3791, 4.9003)));
    }

    #[test]
    fn unknown_entities_are_none() {
        let registry = EntityRegistry::new();
        assert!(registry.observation("device_tracker.nobody").unwrap().is_none());
        assert!(registry.route("sensor.nothing").unwrap().is_none());
    }

    #[test]
    fn missing_attributes_take_documented_defaults() {
        let mut registry = EntityRegistry::new();
        registry.set_attribute("device_tracker.bob", "latitude", json!(52.0));
        let obs = registry.observation("device_tracker.bob").unwrap().unwrap();
        assert_eq!(obs.location, None);
        assert_eq!(obs.speed_kmh, 0.0);
        assert!(!obs.driving);
        assert_eq!(obs.address, None);

        registry.set_attribute("sensor.empty_route", "origin", json!("Home"));
        let route = registry.route("sensor.empty_route").unwrap().unwrap();
        assert_eq!(route.delay_minutes, 0);
        assert!(route.coordinates.is_empty());
        assert_eq!(route.origin_point(), None);
    }

    #[test]
    fn object_coordinates_are_accepted() {
        let mut entity = EntityState::default();
        entity.attributes.insert(
            "route_coordinates".into(),
            json!([{"lat": 52.0, "lon": 5.0}, {"latitude": 52.1, "longitude": 5.1}]),
        );
        let route = route_from_entity(&entity);
        assert_eq!(
            route.coordinates,
            vec![GeoPoint::new(52.0, 5.0), GeoPoint::new(52.1, 5.1)]
        );
    }

    #[test]
    fn shared_registry_reports_offline_until_marked() {
        let shared = SharedRegistry::new();
        assert!(shared.health().is_err());
        shared.set_online(true);
        assert!(shared.health().is_ok());
        shared
            .update(|r| r.set_attribute("device_tracker.anna", "driving", json!("on")))
            .unwrap();
        let obs = shared.observation("device_tracker.anna").unwrap().unwrap();
        assert!(obs.driving);
    }

    #[test]
    fn state_file_provider_reloads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("states.json");
        let mut provider = StateFileProvider::new(&path);
        assert!(provider.health().is_err());

        std::fs::write(&path, DUMP).expect("write");
        provider.health().expect("healthy");
        provider.reload().expect("reload");
        assert!(provider
            .observation("device_tracker.anna")
            .unwrap()
            .is_some());
    }
}

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::{Entry, HashMap};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::schedule::ScheduleConfig;
use crate::transport::person_object_id;

const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_STATION_RADIUS_M: f64 = 100.0;
const DEFAULT_ROUTE_TOLERANCE_M: f64 = 500.0;
const DEFAULT_DEPARTURE_WINDOW_MIN: u32 = 5;
const DEFAULT_DRIVING_SPEED_KMH: f64 = 30.0;
const DEFAULT_STOPPED_SPEED_KMH: f64 = 5.0;
const DEFAULT_STOP_CONFIRM_MIN: f64 = 5.0;
const DEFAULT_STOP_RADIUS_M: f64 = 50.0;
const DEFAULT_DETOUR_THRESHOLD_M: f64 = 1000.0;
const DEFAULT_CAR_SPEED_KMH: f64 = 50.0;

/// Classification thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerSettings {
    pub station_radius_m: f64,
    pub route_tolerance_m: f64,
    /// Reserved for on-time departure checks; not consulted yet.
    pub departure_window_min: u32,
    pub driving_speed_kmh: f64,
    pub stopped_speed_kmh: f64,
    pub stop_confirm_min: f64,
    pub stop_radius_m: f64,
    pub detour_threshold_m: f64,
    pub car_speed_kmh: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            station_radius_m: DEFAULT_STATION_RADIUS_M,
            route_tolerance_m: DEFAULT_ROUTE_TOLERANCE_M,
            departure_window_min: DEFAULT_DEPARTURE_WINDOW_MIN,
            driving_speed_kmh: DEFAULT_DRIVING_SPEED_KMH,
            stopped_speed_kmh: DEFAULT_STOPPED_SPEED_KMH,
            stop_confirm_min: DEFAULT_STOP_CONFIRM_MIN,
            stop_radius_m: DEFAULT_STOP_RADIUS_M,
            detour_threshold_m: DEFAULT_DETOUR_THRESHOLD_M,
            car_speed_kmh: DEFAULT_CAR_SPEED_KMH,
        }
    }
}

/// A route entity plus the schedule that makes it expected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRoute {
    pub route: String,
    #[serde(flatten)]
    pub schedule: ScheduleConfig,
}

/// One tracked household member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonConfig {
    /// Tracker entity id, e.g. `device_tracker.anna`.
    pub person: String,
    #[serde(default)]
    pub morning: Option<ScheduledRoute>,
    #[serde(default)]
    pub evening: Option<ScheduledRoute>,
    /// Notify service targets, e.g. `notify.mobile_app_anna`.
    #[serde(default, alias = "notify_entities")]
    pub notify: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    poll_interval_secs: Option<u64>,
    people: Option<Vec<PersonConfig>>,
    thresholds: Option<ThresholdsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdsConfigFile {
    station_radius: Option<f64>,
    route_tolerance: Option<f64>,
    departure_window: Option<u32>,
    driving_speed: Option<f64>,
    stopped_speed: Option<f64>,
    stop_confirm_minutes: Option<f64>,
    stop_radius: Option<f64>,
    detour_threshold: Option<f64>,
    car_speed: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub people: Vec<PersonConfig>,
    pub settings: TrackerSettings,
}

impl TrackerConfig {
    /// Loads `TRACKER_CONFIG` (if set), applies env overrides and validates.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRACKER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads an explicit file, then env overrides and validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Every person and route entity a poll may read.
    pub fn watched_entities(&self) -> std::collections::HashSet<String> {
        let mut out = std::collections::HashSet::new();
        for person in &self.people {
            out.insert(person.person.clone());
            for route in [&person.morning, &person.evening].into_iter().flatten() {
                out.insert(route.route.clone());
            }
        }
        out
    }

    fn from_file(file: TrackerConfigFile) -> Self {
        let defaults = TrackerSettings::default();
        let t = file.thresholds.unwrap_or_default();
        let settings = TrackerSettings {
            station_radius_m: t.station_radius.unwrap_or(defaults.station_radius_m),
            route_tolerance_m: t.route_tolerance.unwrap_or(defaults.route_tolerance_m),
            departure_window_min: t.departure_window.unwrap_or(defaults.departure_window_min),
            driving_speed_kmh: t.driving_speed.unwrap_or(defaults.driving_speed_kmh),
            stopped_speed_kmh: t.stopped_speed.unwrap_or(defaults.stopped_speed_kmh),
            stop_confirm_min: t.stop_confirm_minutes.unwrap_or(defaults.stop_confirm_min),
            stop_radius_m: t.stop_radius.unwrap_or(defaults.stop_radius_m),
            detour_threshold_m: t.detour_threshold.unwrap_or(defaults.detour_threshold_m),
            car_speed_kmh: t.car_speed.unwrap_or(defaults.car_speed_kmh),
        };
        Self {
            poll_interval: Duration::from_secs(
                file.poll_interval_secs.unwrap_or(DEFAULT_POLL_SECS),
            ),
            people: file.people.unwrap_or_default(),
            settings,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(radius) = std::env::var("TRACKER_STATION_RADIUS") {
            self.settings.station_radius_m = radius
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRACKER_STATION_RADIUS must be a number of meters"))?;
        }
        if let Ok(tolerance) = std::env::var("TRACKER_ROUTE_TOLERANCE") {
            self.settings.route_tolerance_m = tolerance
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRACKER_ROUTE_TOLERANCE must be a number of meters"))?;
        }
        if let Ok(secs) = std::env::var("TRACKER_POLL_SECS") {
            let seconds: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("TRACKER_POLL_SECS must be an integer number of seconds")
            })?;
            self.poll_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.poll_interval.as_secs() == 0 {
            return Err(anyhow!("poll interval must be greater than zero"));
        }

        let s = &self.settings;
        for (name, value) in [
            ("station_radius", s.station_radius_m),
            ("route_tolerance", s.route_tolerance_m),
            ("driving_speed", s.driving_speed_kmh),
            ("stopped_speed", s.stopped_speed_kmh),
            ("stop_radius", s.stop_radius_m),
            ("detour_threshold", s.detour_threshold_m),
            ("car_speed", s.car_speed_kmh),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("{} must be a positive number", name));
            }
        }
        if !s.stop_confirm_min.is_finite() || s.stop_confirm_min < 0.0 {
            return Err(anyhow!("stop_confirm_minutes must not be negative"));
        }
        if s.stopped_speed_kmh > s.driving_speed_kmh {
            return Err(anyhow!(
                "stopped_speed ({}) must not exceed driving_speed ({})",
                s.stopped_speed_kmh,
                s.driving_speed_kmh
            ));
        }

        // Published topics and unique ids are keyed by object id alone.
        let mut object_ids: HashMap<String, String> = HashMap::new();
        for person in &mut self.people {
            person.person = person.person.trim().to_lowercase();
            validate_entity_id(&person.person)?;
            match object_ids.entry(person_object_id(&person.person)) {
                Entry::Occupied(taken) if taken.get() == &person.person => {
                    return Err(anyhow!("person {} is configured twice", person.person));
                }
                Entry::Occupied(taken) => {
                    return Err(anyhow!(
                        "{} and {} share object id {}",
                        taken.get(),
                        person.person,
                        taken.key()
                    ));
                }
                Entry::Vacant(slot) => {
                    slot.insert(person.person.clone());
                }
            }
            for route in [person.morning.as_mut(), person.evening.as_mut()]
                .into_iter()
                .flatten()
            {
                route.route = route.route.trim().to_lowercase();
                validate_entity_id(&route.route)
                    .with_context(|| format!("route for {}", person.person))?;
            }
            for target in &person.notify {
                validate_entity_id(target)
                    .with_context(|| format!("notify target for {}", person.person))?;
            }
        }
        Ok(())
    }
}

/// Entity ids are `<domain>.<object_id>` in lowercase snake case.
pub fn validate_entity_id(entity_id: &str) -> Result<()> {
    static ENTITY_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENTITY_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("static entity id pattern")
    });
    if !re.is_match(entity_id) {
        return Err(anyhow!(
            "entity id {:?} must match <domain>.<object_id>",
            entity_id
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

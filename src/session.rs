//! One poll cycle over every configured person.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use std::collections::BTreeMap;

use crate::classify::{PersonStatusClassifier, RouteExpectation, StatusResult};
use crate::config::{PersonConfig, TrackerSettings};
use crate::schedule::select_route;
use crate::state::StateProvider;

/// Results of one poll, keyed by person entity id.
pub type PollResults = BTreeMap<String, StatusResult>;

pub struct TrackingSession {
    people: Vec<PersonConfig>,
    classifier: PersonStatusClassifier,
    last_good: PollResults,
    polls: u64,
}

impl TrackingSession {
    pub fn new(people: Vec<PersonConfig>, settings: TrackerSettings) -> Self {
        Self {
            people,
            classifier: PersonStatusClassifier::new(settings),
            last_good: PollResults::new(),
            polls: 0,
        }
    }

    pub fn people(&self) -> &[PersonConfig] {
        &self.people
    }

    pub fn classifier(&self) -> &PersonStatusClassifier {
        &self.classifier
    }

    /// Swaps in a new person list. Memory of removed people is dropped.
    pub fn replace_people(&mut self, people: Vec<PersonConfig>) {
        self.classifier
            .memory_mut()
            .retain_people(people.iter().map(|p| p.person.as_str()));
        self.people = people;
    }

    /// Classifies every configured person.
    ///
    /// Fails only when the provider itself is unhealthy; lookups that fail for
    /// a single person degrade to the default result for that person.
    pub fn poll<P: StateProvider + ?Sized>(
        &mut self,
        provider: &P,
        now: DateTime<FixedOffset>,
    ) -> Result<PollResults> {
        provider.health().context("state provider unavailable")?;

        let mut results = PollResults::new();
        for person in &self.people {
            let result = classify_person(&mut self.classifier, person, provider, now);
            log::debug!(
                "{}: {} (confidence {})",
                person.person,
                result.status,
                result.confidence
            );
            results.insert(person.person.clone(), result);
        }
        self.polls += 1;
        Ok(results)
    }

    /// Polls and remembers the outcome; on failure returns the last good results.
    pub fn refresh<P: StateProvider + ?Sized>(
        &mut self,
        provider: &P,
        now: DateTime<FixedOffset>,
    ) -> &PollResults {
        match self.poll(provider, now) {
            Ok(results) => self.last_good = results,
            Err(e) => log::warn!("poll failed, keeping previous results: {:#}", e),
        }
        &self.last_good
    }

    pub fn last_results(&self) -> &PollResults {
        &self.last_good
    }

    pub fn completed_polls(&self) -> u64 {
        self.polls
    }
}

fn classify_person<P: StateProvider + ?Sized>(
    classifier: &mut PersonStatusClassifier,
    person: &PersonConfig,
    provider: &P,
    now: DateTime<FixedOffset>,
) -> StatusResult {
    let observation = match provider.observation(&person.person) {
        Ok(observation) => observation,
        Err(e) => {
            log::warn!("{}: failed to read person state: {:#}", person.person, e);
            return StatusResult::unavailable();
        }
    };

    let route = select_route(person, &now).map(|(slot, route_id)| {
        log::debug!("{}: expecting {:?} route {}", person.person, slot, route_id);
        match provider.route(route_id) {
            Ok(route) => route,
            Err(e) => {
                log::warn!("{}: failed to read route {}: {:#}", person.person, route_id, e);
                None
            }
        }
    });
    let expected = match &route {
        None => RouteExpectation::None,
        Some(None) => RouteExpectation::Unavailable,
        Some(Some(snapshot)) => RouteExpectation::Available(snapshot),
    };

    classifier.classify(&person.person, observation.as_ref(), expected, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TransitStatus;
    use crate::config::ScheduledRoute;
    use crate::schedule::ScheduleConfig;
    use crate::state::{EntityRegistry, PersonObservation, RouteSnapshot};
    use anyhow::anyhow;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7200)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 10, 8, 0, 0)
            .unwrap()
    }

    fn person(id: &str, route: Option<&str>) -> PersonConfig {
        PersonConfig {
            person: id.into(),
            morning: route.map(|r| ScheduledRoute {
                route: r.into(),
                schedule: ScheduleConfig {
                    days: Vec::new(),
                    exclude_holidays: false,
                    ..ScheduleConfig::default()
                },
            }),
            evening: None,
            notify: Vec::new(),
        }
    }

    fn registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.set_attribute("device_tracker.anna", "latitude", json!(52.0894));
        registry.set_attribute("device_tracker.anna", "longitude", json!(5.1100));
        registry.set_attribute("sensor.route_to_work", "origin", json!("Utrecht"));
        registry.set_attribute("sensor.route_to_work", "destination", json!("Amsterdam"));
        registry.set_attribute("sensor.route_to_work", "departure_time", json!("07:45"));
        registry.set_attribute(
            "sensor.route_to_work",
            "route_coordinates",
            json!([[52.0894, 5.1100], [52.3791, 4.9003]]),
        );
        registry
    }

    struct BrokenProvider;

    impl StateProvider for BrokenProvider {
        fn health(&self) -> Result<()> {
            Err(anyhow!("registry unreachable"))
        }
        fn observation(&self, _: &str) -> Result<Option<PersonObservation>> {
            Ok(None)
        }
        fn route(&self, _: &str) -> Result<Option<RouteSnapshot>> {
            Ok(None)
        }
    }

    struct FlakyPersonProvider(EntityRegistry);

    impl StateProvider for FlakyPersonProvider {
        fn observation(&self, entity_id: &str) -> Result<Option<PersonObservation>> {
            if entity_id == "device_tracker.bob" {
                return Err(anyhow!("bob's tracker timed out"));
            }
            self.0.observation(entity_id)
        }
        fn route(&self, entity_id: &str) -> Result<Option<RouteSnapshot>> {
            self.0.route(entity_id)
        }
    }

    #[test]
    fn every_person_gets_an_entry() {
        let people = vec![
            person("device_tracker.anna", Some("sensor.route_to_work")),
            person("device_tracker.ghost", Some("sensor.route_to_work")),
            person("device_tracker.carl", Some("sensor.missing_route")),
        ];
        let mut session = TrackingSession::new(people, TrackerSettings::default());
        let results = session.poll(&registry(), now()).expect("poll");
        assert_eq!(results.len(), 3);
        assert_eq!(results["device_tracker.anna"].status, TransitStatus::AtStation);
        assert_eq!(results["device_tracker.ghost"], StatusResult::unavailable());
        assert_eq!(results["device_tracker.carl"], StatusResult::unavailable());
    }

    #[test]
    fn unresolvable_route_degrades_to_default() {
        let mut reg = registry();
        reg.set_attribute("device_tracker.carl", "latitude", json!(52.0));
        reg.set_attribute("device_tracker.carl", "longitude", json!(5.0));
        let mut session = TrackingSession::new(
            vec![person("device_tracker.carl", Some("sensor.missing_route"))],
            TrackerSettings::default(),
        );
        let results = session.poll(&reg, now()).expect("poll");
        assert_eq!(results["device_tracker.carl"].confidence, 0);
        assert!(results["device_tracker.carl"].current_location.is_none());
    }

    #[test]
    fn person_without_routes_is_not_traveling() {
        let mut session = TrackingSession::new(
            vec![person("device_tracker.anna", None)],
            TrackerSettings::default(),
        );
        let results = session.poll(&registry(), now()).expect("poll");
        let anna = &results["device_tracker.anna"];
        assert_eq!(anna.status, TransitStatus::NotTraveling);
        assert_eq!(anna.confidence, 100);
    }

    #[test]
    fn one_failing_person_does_not_block_others() {
        let people = vec![
            person("device_tracker.bob", Some("sensor.route_to_work")),
            person("device_tracker.anna", Some("sensor.route_to_work")),
        ];
        let mut session = TrackingSession::new(people, TrackerSettings::default());
        let results = session
            .poll(&FlakyPersonProvider(registry()), now())
            .expect("poll");
        assert_eq!(results["device_tracker.bob"], StatusResult::unavailable());
        assert_eq!(results["device_tracker.anna"].status, TransitStatus::AtStation);
    }

    #[test]
    fn refresh_keeps_previous_results_on_failure() {
        let mut session = TrackingSession::new(
            vec![person("device_tracker.anna", Some("sensor.route_to_work"))],
            TrackerSettings::default(),
        );
        assert!(session.poll(&BrokenProvider, now()).is_err());
        assert!(session.refresh(&BrokenProvider, now()).is_empty());

        let good = session.refresh(&registry(), now()).clone();
        assert_eq!(good.len(), 1);
        let after_failure = session.refresh(&BrokenProvider, now()).clone();
        assert_eq!(after_failure, good);
        assert_eq!(session.completed_polls(), 1);
    }

    #[test]
    fn replacing_people_drops_stale_memory() {
        let mut session = TrackingSession::new(
            vec![person("device_tracker.anna", Some("sensor.route_to_work"))],
            TrackerSettings::default(),
        );
        session.poll(&registry(), now()).expect("poll");
        assert_eq!(session.classifier().memory().len(), 1);

        session.replace_people(vec![person("device_tracker.bob", None)]);
        assert!(session.classifier().memory().is_empty());
        assert_eq!(session.people().len(), 1);
    }
}

//! Status change notifications.
//!
//! Each configured notify target receives a message when a person's status
//! changes between two successful polls. The first poll after start-up only
//! establishes a baseline.

use serde::Serialize;

use crate::classify::{StatusResult, TransitStatus};
use crate::config::PersonConfig;
use crate::display::display_name;
use crate::session::PollResults;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    /// Notify service entity, e.g. `notify.mobile_app_anna`.
    pub target: String,
    pub person: String,
    pub title: String,
    pub message: String,
}

fn describe(name: &str, result: &StatusResult) -> String {
    let route = result.planned_route.as_deref().unwrap_or("no planned route");
    match result.status {
        TransitStatus::OnRoute => format!("{name} is on the way ({route})"),
        TransitStatus::AtStation => format!("{name} is at the station ({route})"),
        TransitStatus::ByCar => format!("{name} is travelling by car instead of {route}"),
        TransitStatus::Detoured => format!("{name} has left the planned route ({route})"),
        TransitStatus::Stopped => format!(
            "{name} has been stopped for {} minutes at {}",
            result.stop_duration.unwrap_or(0),
            result.address.as_deref().unwrap_or("an unknown location")
        ),
        TransitStatus::Missed => format!("{name} missed {route}"),
        TransitStatus::AlternativeRoute => format!("{name} is taking another route than {route}"),
        TransitStatus::NotTraveling => format!("{name} is not travelling"),
    }
}

/// Notifications for every person whose status differs from `previous`.
pub fn status_changes(
    people: &[PersonConfig],
    previous: &PollResults,
    current: &PollResults,
) -> Vec<Notification> {
    let mut out = Vec::new();
    for person in people {
        if person.notify.is_empty() {
            continue;
        }
        let (Some(before), Some(after)) =
            (previous.get(&person.person), current.get(&person.person))
        else {
            continue;
        };
        if before.status == after.status {
            continue;
        }
        let name = display_name(&person.person);
        let title = format!("{name}: {}", after.status);
        let message = describe(&name, after);
        for target in &person.notify {
            out.push(Notification {
                target: target.clone(),
                person: person.person.clone(),
                title: title.clone(),
                message: message.clone(),
            });
        }
    }
    out
}

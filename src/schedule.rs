//! Route schedules: when is a configured route expected?

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::PersonConfig;
use crate::holidays::is_holiday;

/// Hours either side of the departure hour during which a route stays active.
pub const DEPARTURE_WINDOW_HOURS: i32 = 2;

fn default_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

/// Day, holiday, date and time-window rules for one route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Weekday tokens (`mon`..`sun`). Empty means every day.
    #[serde(default = "default_days")]
    pub days: Vec<String>,
    #[serde(default = "default_true")]
    pub exclude_holidays: bool,
    /// Comma-separated `YYYY-MM-DD` dates.
    #[serde(default)]
    pub custom_exclude_dates: String,
    /// `HH:MM` local departure time.
    #[serde(default)]
    pub departure_time: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            days: default_days(),
            exclude_holidays: true,
            custom_exclude_dates: String::new(),
            departure_time: None,
        }
    }
}

/// Which of a person's routes was selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteSlot {
    Morning,
    Evening,
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token.trim().to_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_departure_hour(value: &str) -> Option<i32> {
    let hour: i32 = value.trim().split(':').next()?.trim().parse().ok()?;
    (0..24).contains(&hour).then_some(hour)
}

/// Returns true when none of the schedule's filters exclude `now`.
pub fn is_active<Tz: TimeZone>(schedule: &ScheduleConfig, now: &DateTime<Tz>) -> bool {
    if !schedule.days.is_empty() {
        let weekday = now.weekday();
        let allowed = schedule
            .days
            .iter()
            .filter_map(|token| parse_weekday(token))
            .any(|day| day == weekday);
        if !allowed {
            return false;
        }
    }

    if schedule.exclude_holidays && is_holiday(now.date_naive()) {
        return false;
    }

    if !schedule.custom_exclude_dates.trim().is_empty() {
        let today = now.date_naive().format("%Y-%m-%d").to_string();
        if schedule
            .custom_exclude_dates
            .split(',')
            .any(|entry| entry.trim() == today)
        {
            return false;
        }
    }

    if let Some(departure) = schedule.departure_time.as_deref() {
        match parse_departure_hour(departure) {
            Some(dep_hour) => {
                let hour = now.hour() as i32;
                if hour < dep_hour - DEPARTURE_WINDOW_HOURS
                    || hour > dep_hour + DEPARTURE_WINDOW_HOURS
                {
                    return false;
                }
            }
            None => log::debug!("ignoring malformed departure time {:?}", departure),
        }
    }

    true
}

/// Picks the route a person is expected to travel right now.
///
/// Morning wins when both schedules are active.
pub fn select_route<'a, Tz: TimeZone>(
    person: &'a PersonConfig,
    now: &DateTime<Tz>,
) -> Option<(RouteSlot, &'a str)> {
    if let Some(morning) = &person.morning {
        if is_active(&morning.schedule, now) {
            return Some((RouteSlot::Morning, morning.route.as_str()));
        }
    }
    if let Some(evening) = &person.evening {
        if is_active(&evening.schedule, now) {
            return Some((RouteSlot::Evening, evening.route.as_str()));
        }
    }
    None
}

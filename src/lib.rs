//! Family Transit Tracker
//!
//! Infers, for each tracked household member, what kind of commute they are
//! currently on by combining their live location with a planned transit
//! route and a weekly schedule.
//!
//! # Module Structure
//!
//! - `geo`: great-circle distance and polyline proximity
//! - `holidays`, `schedule`: when a route is expected
//! - `classify`: the per-person status classifier and its memory store
//! - `session`: one poll over all configured people
//! - `state`: typed boundary over Home Assistant style entity attributes
//! - `display`, `notify`: read-only projections of poll results
//! - `transport`: MQTT statestream ingest and discovery publishing

pub mod classify;
pub mod config;
pub mod display;
pub mod geo;
pub mod holidays;
pub mod notify;
pub mod schedule;
pub mod session;
pub mod state;
pub mod transport;

pub use classify::{
    MemoryStore, PersonMemory, PersonStatusClassifier, RouteExpectation, StatusResult,
    TimedPoint, TransitStatus, TravelMode,
};
pub use config::{PersonConfig, ScheduledRoute, TrackerConfig, TrackerSettings};
pub use display::{StatusPayload, StatusView};
pub use geo::GeoPoint;
pub use notify::Notification;
pub use schedule::{RouteSlot, ScheduleConfig};
pub use session::{PollResults, TrackingSession};
pub use state::{
    EntityRegistry, EntityState, PersonObservation, RouteSnapshot, SharedRegistry,
    StateFileProvider, StateProvider,
};

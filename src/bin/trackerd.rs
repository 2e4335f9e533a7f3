//! trackerd - Infer family transit status and publish it to Home Assistant.
//!
//! The daemon:
//! 1. Reads person and route entities from a state dump or from Home
//!    Assistant's MQTT statestream
//! 2. Classifies every configured person on a fixed poll interval
//! 3. Publishes HA MQTT Discovery configs and retained state documents
//! 4. Publishes status change notifications per notify target
//! 5. Uses Last Will Testament (LWT) for availability tracking
//!
//! `--once` runs a single poll against `--states-file` and prints the
//! resulting state documents as JSON.

use anyhow::{anyhow, Result};
use chrono::{Datelike, DateTime, FixedOffset};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use transit_tracker::display::payload;
use transit_tracker::notify::status_changes;
use transit_tracker::transport::discovery::{DEFAULT_DISCOVERY_PREFIX, DEFAULT_TOPIC_PREFIX};
use transit_tracker::transport::{
    apply_message, icon_updates, notification_publication, person_discovery, state_publication,
    subscription_filter, Broker, BrokerTrust, Publication, TopicLayout, PAYLOAD_OFFLINE,
    PAYLOAD_ONLINE,
};
use transit_tracker::{
    holidays, PollResults, SharedRegistry, StateFileProvider, StateProvider, StatusPayload,
    TrackerConfig, TrackingSession,
};

const DAEMON_NAME: &str = "trackerd";
const DEFAULT_STATESTREAM_PREFIX: &str = "homeassistant";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Infer family transit status and publish it to Home Assistant"
)]
struct Args {
    /// Tracker configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "TRACKER_CONFIG")]
    config: Option<PathBuf>,

    /// Read entity states from a Home Assistant /api/states dump instead of
    /// the MQTT statestream. Re-read on every poll.
    #[arg(long, env = "TRACKER_STATES_FILE")]
    states_file: Option<PathBuf>,

    /// Poll once, print the state documents as JSON and exit.
    #[arg(long)]
    once: bool,

    /// MQTT broker address.
    /// By default, only loopback addresses are allowed.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections.
    /// Use in trusted environments like Home Assistant containers.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (required for mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// Base topic of Home Assistant's mqtt_statestream.
    #[arg(long, env = "HA_STATESTREAM_PREFIX", default_value = DEFAULT_STATESTREAM_PREFIX)]
    statestream_prefix: String,

    /// Home Assistant MQTT discovery prefix.
    #[arg(long, env = "HA_DISCOVERY_PREFIX", default_value = DEFAULT_DISCOVERY_PREFIX)]
    ha_discovery_prefix: String,

    /// MQTT topic prefix for state, availability and notifications.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = DEFAULT_TOPIC_PREFIX)]
    mqtt_topic_prefix: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DAEMON_NAME)]
    mqtt_client_id: String,

    /// Device identifier for Home Assistant.
    #[arg(long, env = "HA_DEVICE_ID", default_value = DAEMON_NAME)]
    ha_device_id: String,

    /// Disable Home Assistant discovery (publish state documents only).
    #[arg(long, env = "NO_DISCOVERY")]
    no_discovery: bool,
}

/// Where entity states come from.
enum StateSource {
    File(StateFileProvider),
    Stream(SharedRegistry),
}

impl StateSource {
    /// Brings the source up to date before a poll.
    fn prepare(&mut self) -> Result<()> {
        match self {
            StateSource::File(provider) => provider.reload(),
            StateSource::Stream(_) => Ok(()),
        }
    }

    fn provider(&self) -> &dyn StateProvider {
        match self {
            StateSource::File(provider) => provider,
            StateSource::Stream(registry) => registry,
        }
    }
}

/// Statestream subscription fed into a shared registry.
struct StreamIngest {
    registry: SharedRegistry,
    base: String,
    wanted: HashSet<String>,
}

impl StreamIngest {
    fn handle(&self, topic: &[u8], payload: &[u8]) {
        let topic = match std::str::from_utf8(topic) {
            Ok(topic) => topic,
            Err(e) => {
                log::warn!("Skipping publish with invalid topic: {}", e);
                return;
            }
        };
        let outcome = self
            .registry
            .update(|registry| apply_message(registry, &self.base, &self.wanted, topic, payload))
            .and_then(|applied| applied);
        match outcome {
            Ok(true) => log::trace!("applied {}", topic),
            Ok(false) => {}
            Err(e) => log::warn!("Failed to apply {}: {:#}", topic, e),
        }
    }
}

struct MqttRuntime {
    client: Client,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection, ingest: Option<StreamIngest>) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = Arc::clone(&stopping);
        let thread_client = client.clone();
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        log::info!("Connected to MQTT broker");
                        if let Some(ingest) = &ingest {
                            let filter = subscription_filter(&ingest.base);
                            match thread_client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                                Ok(()) => log::info!("Subscribed to {}", filter),
                                Err(e) => log::error!("Failed to subscribe to {}: {}", filter, e),
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::SubAck(_))) => {
                        if let Some(ingest) = &ingest {
                            ingest.registry.set_online(true);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Some(ingest) = &ingest {
                            ingest.handle(&publish.topic, &publish.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(ingest) = &ingest {
                            ingest.registry.set_online(false);
                        }
                        if thread_stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}. Reconnecting...", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        });

        Self {
            client,
            stopping,
            connection_handle: Some(handle),
        }
    }

    fn publish(&self, message: &Publication) -> Result<()> {
        self.client.publish(
            message.topic.as_str(),
            QoS::AtLeastOnce,
            message.retain,
            message.payload.clone(),
        )?;
        Ok(())
    }

    fn disconnect(mut self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrackerConfig::load_from(path)?,
        None => TrackerConfig::load()?,
    };
    if config.people.is_empty() {
        log::warn!("No people configured; every poll will be empty");
    }
    let year = now().year();
    if !holidays::supported_years().contains(&year) {
        log::warn!(
            "Holiday table covers {}..={} only; Easter holidays in {} will not be excluded",
            holidays::supported_years().start(),
            holidays::supported_years().end(),
            year
        );
    }

    let mut session = TrackingSession::new(config.people.clone(), config.settings.clone());

    if args.once {
        let path = args
            .states_file
            .clone()
            .ok_or_else(|| anyhow!("--once requires --states-file"))?;
        return run_once(&mut session, path);
    }

    let broker = Broker::parse(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    broker.check_reachability(args.allow_remote_mqtt)?;
    let trust = BrokerTrust::from_files(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;

    let layout = TopicLayout::new(
        &args.ha_discovery_prefix,
        &args.mqtt_topic_prefix,
        &args.ha_device_id,
    );

    let (mut source, ingest) = match &args.states_file {
        Some(path) => {
            log::info!("Reading entity states from {}", path.display());
            (StateSource::File(StateFileProvider::new(path.clone())), None)
        }
        None => {
            let registry = SharedRegistry::new();
            let ingest = StreamIngest {
                registry: registry.clone(),
                base: args.statestream_prefix.clone(),
                wanted: config.watched_entities(),
            };
            (StateSource::Stream(registry), Some(ingest))
        }
    };

    let credentials = args
        .mqtt_username
        .as_deref()
        .map(|user| (user, args.mqtt_password.as_deref().unwrap_or_default()));
    let options = broker.options(trust, &args.mqtt_client_id, credentials, &layout.availability())?;
    let (client, connection) = Client::new(options, 64);
    log::info!(
        "Connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
        broker.host,
        broker.port,
        broker.tls,
        credentials.is_some()
    );
    let runtime = MqttRuntime::new(client, connection, ingest);

    let ctx = RunContext {
        args: &args,
        layout: &layout,
        poll_interval: config.poll_interval,
    };
    let result = run_daemon(&ctx, &runtime, &mut session, &mut source);

    if let Err(e) = runtime.publish(&availability(&layout, PAYLOAD_OFFLINE)) {
        log::warn!("Failed to publish offline status: {}", e);
    }
    runtime.disconnect()?;
    result
}

struct RunContext<'a> {
    args: &'a Args,
    layout: &'a TopicLayout,
    poll_interval: Duration,
}

fn run_once(session: &mut TrackingSession, states_file: PathBuf) -> Result<()> {
    let mut provider = StateFileProvider::new(states_file);
    provider.reload()?;
    let results = session.poll(&provider, now())?;
    let documents: BTreeMap<&str, StatusPayload> = results
        .iter()
        .map(|(person, result)| (person.as_str(), payload(result)))
        .collect();
    println!("{}", serde_json::to_string_pretty(&documents)?);
    Ok(())
}

fn run_daemon(
    ctx: &RunContext<'_>,
    runtime: &MqttRuntime,
    session: &mut TrackingSession,
    source: &mut StateSource,
) -> Result<()> {
    log::info!(
        "Starting {} (poll interval: {}s, {} people)",
        DAEMON_NAME,
        ctx.poll_interval.as_secs(),
        session.people().len()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    runtime.publish(&availability(ctx.layout, PAYLOAD_ONLINE))?;
    log::info!("Published online status to {}", ctx.layout.availability());

    if !ctx.args.no_discovery {
        for person in session.people() {
            for message in person_discovery(ctx.layout, person, None)? {
                runtime.publish(&message)?;
            }
        }
        log::info!(
            "Published HA discovery for {} people",
            session.people().len()
        );
    }

    loop {
        let previous = session.last_results().clone();
        let current = match source.prepare() {
            Ok(()) => session.refresh(source.provider(), now()).clone(),
            Err(e) => {
                log::warn!("State refresh failed, keeping previous results: {:#}", e);
                previous.clone()
            }
        };

        if let Err(e) = publish_results(ctx, runtime, session, &previous, &current) {
            log::warn!("Failed to publish results: {:#}", e);
        }

        match rx.recv_timeout(ctx.poll_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping {}...", DAEMON_NAME);
                return Ok(());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
}

fn publish_results(
    ctx: &RunContext<'_>,
    runtime: &MqttRuntime,
    session: &TrackingSession,
    previous: &PollResults,
    current: &PollResults,
) -> Result<()> {
    let layout = ctx.layout;
    if !ctx.args.no_discovery {
        for message in icon_updates(layout, session.people(), previous, current)? {
            runtime.publish(&message)?;
        }
    }
    for (person, result) in current {
        runtime.publish(&state_publication(layout, person, &payload(result))?)?;
    }
    let notifications = status_changes(session.people(), previous, current);
    for notification in &notifications {
        log::info!("{}: {}", notification.target, notification.title);
        runtime.publish(&notification_publication(layout, notification)?)?;
    }
    log::debug!(
        "Published {} states and {} notifications",
        current.len(),
        notifications.len()
    );
    Ok(())
}

fn availability(layout: &TopicLayout, payload: &str) -> Publication {
    Publication {
        topic: layout.availability(),
        payload: payload.as_bytes().to_vec(),
        retain: true,
    }
}

fn now() -> DateTime<FixedOffset> {
    chrono::Local::now().fixed_offset()
}

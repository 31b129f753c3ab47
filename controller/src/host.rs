use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use vtherm_common::{
    attributes_topic, command_topic, entity_from_state_topic, event_topic, Fleet, FleetConfig,
    FleetOutcome, Schedule, SystemClock, ThermostatSnapshot, TOPIC_STATE_WILDCARD,
};

use crate::api;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) fleet: Arc<Mutex<Fleet>>,
    pub(crate) timezone: Arc<String>,
    pub(crate) mqtt: AsyncClient,
    pub(crate) store: AppStore,
}

#[derive(Clone)]
pub(crate) struct AppStore {
    fleet_path: Arc<PathBuf>,
    state_dir: Arc<PathBuf>,
    schedule_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let config = store.load_fleet_config().await.unwrap_or_else(|err| {
        warn!("failed to load fleet config from store: {err:#}");
        FleetConfig::default()
    });
    if config.timezone.parse::<Tz>().is_err() {
        warn!(timezone = %config.timezone, "unknown timezone, schedules are disabled");
    }

    let mut fleet = Fleet::from_config(&config, Arc::new(SystemClock))
        .context("invalid fleet configuration")?;
    restore_fleet(&store, &mut fleet).await;
    let startup = fleet.start_all();
    info!(
        thermostats = fleet.names().count(),
        entities = fleet.watched_entities().len(),
        "fleet started"
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("vtherm-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        fleet: Arc::new(Mutex::new(fleet)),
        timezone: Arc::new(config.timezone),
        mqtt,
        store,
    };

    app_state
        .mqtt
        .subscribe(TOPIC_STATE_WILDCARD, QoS::AtMostOnce)
        .await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    execute_outcome(&app_state, startup).await;
    spawn_control_loop(app_state.clone());
    spawn_attributes_publish_loop(app_state.clone());

    let app = api::router(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let shutdown = { app_state.fleet.lock().await.stop_all() };
    execute_outcome(&app_state, shutdown).await;
    // Lets the event loop flush the final turn-off commands.
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

async fn restore_fleet(store: &AppStore, fleet: &mut Fleet) {
    let names: Vec<String> = fleet.names().map(str::to_string).collect();
    for name in names {
        match store.load_schedule(&name).await {
            Ok(Some(schedule)) => {
                if let Err(err) = fleet.set_schedule(&name, schedule) {
                    warn!(name = %name, "stored schedule not applied: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(name = %name, "failed to load schedule: {err:#}"),
        }
        match store.load_snapshot(&name).await {
            Ok(Some(snapshot)) => {
                if let Err(err) = fleet.restore(&snapshot) {
                    warn!(name = %name, "stored state not restored: {err}");
                }
            }
            Ok(None) => debug!(name = %name, "no stored state"),
            Err(err) => warn!(name = %name, "failed to load stored state: {err:#}"),
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Subscriptions do not survive a clean reconnect.
                    if let Err(err) = app_state
                        .mqtt
                        .try_subscribe(TOPIC_STATE_WILDCARD, QoS::AtMostOnce)
                    {
                        warn!("mqtt resubscribe failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let Some(entity_id) = entity_from_state_topic(&topic) else {
        return Ok(());
    };
    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    let outcome = {
        let mut fleet = app_state.fleet.lock().await;
        fleet.ingest(entity_id, &message, Utc::now())
    };
    execute_outcome(app_state, outcome).await;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;

            let local_now = now_in_timezone(&app_state.timezone);
            let outcome = {
                let mut fleet = app_state.fleet.lock().await;
                let mut outcome = fleet.tick();
                if let Some(now) = local_now {
                    let scheduled = fleet.apply_schedules(&now);
                    outcome.commands.extend(scheduled.commands);
                    outcome.events.extend(scheduled.events);
                    outcome.persist.extend(scheduled.persist);
                }
                outcome
            };

            if !outcome.is_empty() {
                execute_outcome(&app_state, outcome).await;
            }
        }
    });
}

fn spawn_attributes_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let payloads: Vec<(String, serde_json::Value)> = {
                let fleet = app_state.fleet.lock().await;
                fleet
                    .names()
                    .filter_map(|name| Some((name.to_string(), fleet.attributes(name)?)))
                    .collect()
            };

            for (name, attributes) in payloads {
                publish_attributes(&app_state, &name, &attributes).await;
            }
        }
    });
}

/// Publishes device commands and events, then writes the snapshots the outcome
/// asked for. A command that cannot be queued is reported back to the fleet so
/// the next tick resends it.
pub(crate) async fn execute_outcome(app_state: &AppState, outcome: FleetOutcome) {
    let mut failed = Vec::new();
    for command in &outcome.commands {
        let topic = command_topic(&command.entity_id, command.action.name());
        debug!(%topic, payload = %command.action.payload(), "publishing command");
        if let Err(err) = app_state
            .mqtt
            .publish(topic, QoS::AtLeastOnce, false, command.action.payload())
            .await
        {
            warn!(
                entity_id = %command.entity_id,
                action = command.action.name(),
                "command publish failed: {err}"
            );
            failed.push(command);
        }
    }

    let mut events = outcome.events;
    let mut persist: BTreeSet<String> = outcome.persist;
    if !failed.is_empty() {
        let mut fleet = app_state.fleet.lock().await;
        for command in failed {
            let retry = fleet.dispatch_failed(&command.entity_id, command.action.name());
            events.extend(retry.events);
            persist.extend(retry.persist);
        }
    }

    for (name, event) in &events {
        match serde_json::to_vec(event) {
            Ok(body) => {
                if let Err(err) = app_state
                    .mqtt
                    .publish(event_topic(name), QoS::AtLeastOnce, false, body)
                    .await
                {
                    warn!(name = %name, "event publish failed: {err}");
                }
            }
            Err(err) => warn!(name = %name, "event serialization failed: {err}"),
        }
    }

    if persist.is_empty() {
        return;
    }
    let saved: Vec<(ThermostatSnapshot, serde_json::Value)> = {
        let fleet = app_state.fleet.lock().await;
        persist
            .iter()
            .filter_map(|name| Some((fleet.snapshot(name)?, fleet.attributes(name)?)))
            .collect()
    };
    for (snapshot, attributes) in saved {
        if let Err(err) = app_state.store.save_snapshot(&snapshot).await {
            warn!(name = %snapshot.name, "failed to persist state: {err:#}");
        }
        publish_attributes(app_state, &snapshot.name, &attributes).await;
    }
}

async fn publish_attributes(app_state: &AppState, name: &str, attributes: &serde_json::Value) {
    match serde_json::to_vec(attributes) {
        Ok(body) => {
            if let Err(err) = app_state
                .mqtt
                .publish(attributes_topic(name), QoS::AtLeastOnce, true, body)
                .await
            {
                warn!(name = %name, "attributes publish failed: {err}");
            }
        }
        Err(err) => warn!(name = %name, "attributes serialization failed: {err}"),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("VTHERM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.vtherm"));

        Self {
            fleet_path: Arc::new(data_dir.join("fleet.json")),
            state_dir: Arc::new(data_dir.join("state")),
            schedule_dir: Arc::new(data_dir.join("schedules")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_fleet_config(&self) -> anyhow::Result<FleetConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.fleet_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<FleetConfig>(&raw)
                .with_context(|| format!("invalid {}", self.fleet_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.fleet_path.display(), "no fleet config, starting empty");
                Ok(FleetConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_snapshot(&self, name: &str) -> anyhow::Result<Option<ThermostatSnapshot>> {
        let path = self.state_dir.join(file_name(name));
        self.load_json(path).await
    }

    pub(crate) async fn save_snapshot(&self, snapshot: &ThermostatSnapshot) -> anyhow::Result<()> {
        let path = self.state_dir.join(file_name(&snapshot.name));
        self.save_json(path, snapshot).await
    }

    async fn load_schedule(&self, name: &str) -> anyhow::Result<Option<Schedule>> {
        let path = self.schedule_dir.join(file_name(name));
        self.load_json(path).await
    }

    pub(crate) async fn save_schedule(&self, name: &str, schedule: &Schedule) -> anyhow::Result<()> {
        let path = self.schedule_dir.join(file_name(name));
        self.save_json(path, schedule).await
    }

    async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        path: PathBuf,
    ) -> anyhow::Result<Option<T>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(
                serde_json::from_slice::<T>(&raw)
                    .with_context(|| format!("invalid {}", path.display()))?,
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_json<T: serde::Serialize>(&self, path: PathBuf, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Thermostat names come from the config file; keep them from escaping the data dir.
fn file_name(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.json")
}

pub(crate) fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_stay_inside_the_data_dir() {
        assert_eq!(file_name("living"), "living.json");
        assert_eq!(file_name("../etc/passwd"), "___etc_passwd.json");
    }

    #[test]
    fn timezone_resolution() {
        assert!(now_in_timezone("Europe/Paris").is_some());
        assert!(now_in_timezone("Mars/Olympus").is_none());
    }
}

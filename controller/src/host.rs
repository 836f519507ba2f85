use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dishwasher_common::{
    config::parse_devices, select_device, ConfigurationError, Controller, ControllerSettings,
    ControllerStatus, DeviceDescriptor, DeviceEvent, DeviceTransport, RuntimeConfig,
    ScheduleOptimizer, DEVICE_MARKER,
};

use crate::{
    price_feed::MarketPriceFeed,
    transport::{BridgeTopics, MqttTransport},
};

const EVENT_QUEUE_DEPTH: usize = 64;
const STABLE_SESSION: Duration = Duration::from_secs(300);

type StatusTx = watch::Sender<Option<ControllerStatus>>;
type StatusRx = watch::Receiver<Option<ControllerStatus>>;

#[derive(Clone)]
struct AppStore {
    devices_path: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = AppStore::new();
    let devices = store
        .load_devices()
        .await
        .context("failed to load device descriptors")?;
    let device = select_device(&devices, DEVICE_MARKER)?.clone();

    let mut runtime = store
        .load_runtime_config()
        .await
        .context("failed to load runtime config")?;
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    // Surface bad finish times or zones before the first session.
    let settings = ControllerSettings::from_config(&runtime)?;
    info!(
        device = %device.name,
        host = %device.host,
        timezone = %settings.timezone,
        finish_times = ?settings.finish_window.times(),
        "controlling appliance"
    );

    let (status_tx, status_rx) = watch::channel(None);
    if let Some(port) = runtime.status_port {
        spawn_status_server(port, status_rx).await?;
    }

    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        tokio::select! {
            result = run_session(&runtime, &device, status_tx.clone()) => match result {
                Ok(()) => info!("device session ended"),
                Err(err) => warn!("device session failed: {err:#}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }

        if started.elapsed() >= STABLE_SESSION {
            attempt = 0;
        }
        let delay = runtime.retry.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        info!(attempt, delay_secs = delay.as_secs(), "reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.mqtt.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.mqtt.user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.mqtt.pass = pass;
    }
    if let Ok(timezone) = std::env::var("DISHWASHER_TZ") {
        runtime.timezone = timezone;
    }
}

/// One connection lifetime: a fresh MQTT client, a fresh controller and a
/// single dispatch worker. Returns when the event stream closes or a start
/// command fails.
async fn run_session(
    runtime: &RuntimeConfig,
    device: &DeviceDescriptor,
    status: StatusTx,
) -> anyhow::Result<()> {
    let prefix = runtime.mqtt.topic_prefix.clone();
    let topics = BridgeTopics::new(&prefix, &device.name);

    let client_id = format!("dishwasher-controller-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, runtime.mqtt.host.clone(), runtime.mqtt.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !runtime.mqtt.user.is_empty() {
        mqtt_options.set_credentials(runtime.mqtt.user.clone(), runtime.mqtt.pass.clone());
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    mqtt.subscribe(topics.state.clone(), QoS::AtLeastOnce).await?;
    mqtt.subscribe(topics.availability.clone(), QoS::AtLeastOnce)
        .await?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let pump = tokio::spawn(pump_events(eventloop, topics, events_tx));

    let transport = MqttTransport::new(mqtt, prefix, device.name.clone());
    let settings = ControllerSettings::from_config(runtime)?;
    let optimizer = ScheduleOptimizer::new(&runtime.scheduler);
    let price_config = runtime.price_feed.clone();

    // The blocking HTTP client must be built and dropped off the async runtime.
    let dispatch = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut controller = Controller::new(transport, settings, optimizer);
        if let Some(config) = price_config {
            let feed = MarketPriceFeed::new(&config).context("failed to build price feed")?;
            controller = controller.with_price_feed(Box::new(feed));
        }
        dispatch_events(&mut controller, events_rx, &status, Utc::now)
    });

    let result = dispatch.await.context("dispatch worker panicked");
    pump.abort();
    result?
}

/// Forwards bridge publishes to the dispatch worker. Ends the stream with a
/// `Closed` event on the first connection error.
async fn pump_events(
    mut eventloop: EventLoop,
    topics: BridgeTopics,
    events: mpsc::Sender<DeviceEvent>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(message))) => topics.classify(&message),
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                None
            }
            Ok(_) => None,
            Err(err) => {
                warn!("mqtt poll error: {err}");
                let _ = events
                    .send(DeviceEvent::Closed {
                        code: None,
                        reason: err.to_string(),
                    })
                    .await;
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Runs every event through the controller in arrival order and publishes
/// the resulting status.
fn dispatch_events<T: DeviceTransport>(
    controller: &mut Controller<T>,
    mut events: mpsc::Receiver<DeviceEvent>,
    status: &StatusTx,
    clock: fn() -> DateTime<Utc>,
) -> anyhow::Result<()> {
    while let Some(event) = events.blocking_recv() {
        let closed = matches!(event, DeviceEvent::Closed { .. });
        let now = controller.local_time(clock());
        let result = controller.handle_event(event, now);
        status.send_replace(Some(controller.status()));

        if let Err(err) = result {
            error!(state = controller.state().as_str(), "program start failed: {err}");
            return Err(err).context("program start failed");
        }
        if closed {
            break;
        }
    }
    Ok(())
}

async fn spawn_status_server(port: u16, status: StatusRx) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .with_state(status);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status endpoint listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("status server stopped: {err}");
        }
    });
    Ok(())
}

async fn handle_get_status(State(status): State<StatusRx>) -> impl IntoResponse {
    let current = status.borrow().clone();
    match current {
        Some(current) => Json(current).into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No device events processed yet",
        ),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("DISHWASHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.dishwasher"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            devices_path: Arc::new(data_dir.join("devices.json")),
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_devices(&self) -> Result<Vec<DeviceDescriptor>, ConfigurationError> {
        let path = self.devices_path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigurationError::Io {
                path: path.clone(),
                source,
            })?;
        parse_devices(&raw)
    }

    async fn load_runtime_config(&self) -> Result<RuntimeConfig, ConfigurationError> {
        let path = self.runtime_path.as_ref();
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(source) => Err(ConfigurationError::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dishwasher_common::{
        CommandPath, ControlState, ProgramRequest, ScheduleDecision, TransportError,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    // 20:00 in Berlin, ten hours before the default 06:00 deadline.
    fn evening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 19, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingTransport {
        commands: Vec<CommandPath>,
        fail: bool,
    }

    impl DeviceTransport for RecordingTransport {
        fn submit_command(
            &mut self,
            path: CommandPath,
            _request: &ProgramRequest,
        ) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected);
            }
            self.commands.push(path);
            Ok(())
        }
    }

    fn controller(fail: bool) -> Controller<RecordingTransport> {
        let runtime = RuntimeConfig::default();
        Controller::new(
            RecordingTransport {
                commands: Vec::new(),
                fail,
            },
            ControllerSettings::from_config(&runtime).unwrap(),
            ScheduleOptimizer::new(&runtime.scheduler),
        )
    }

    fn ready_delta() -> DeviceEvent {
        DeviceEvent::StateDelta(
            br#"{
                "BSH.Common.Status.DoorState": "Closed",
                "BSH.Common.Status.RemoteControlStartAllowed": true,
                "BSH.Common.Setting.PowerState": "On"
            }"#
            .to_vec(),
        )
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dishwasher-controller-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn dispatch_drains_queue_in_order_and_publishes_status() {
        let (tx, rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(None);
        tx.try_send(DeviceEvent::Opened).unwrap();
        tx.try_send(ready_delta()).unwrap();
        drop(tx);

        let mut controller = controller(false);
        dispatch_events(&mut controller, rx, &status_tx, evening).unwrap();

        let status = status_rx.borrow().clone().unwrap();
        assert_eq!(status.events_processed, 1);
        assert_eq!(status.state, ControlState::Start.as_str());
        assert!(status.connected);
        assert_eq!(status.last_decision, Some(ScheduleDecision::StartIn(25_200)));
        assert_eq!(controller.transport().commands, vec![CommandPath::ActivateProgram]);
    }

    #[test]
    fn dispatch_stops_after_close() {
        let (tx, rx) = mpsc::channel(8);
        let (status_tx, _status_rx) = watch::channel(None);
        tx.try_send(DeviceEvent::Closed {
            code: None,
            reason: "broker gone".to_string(),
        })
        .unwrap();
        tx.try_send(ready_delta()).unwrap();

        let mut controller = controller(false);
        dispatch_events(&mut controller, rx, &status_tx, evening).unwrap();

        assert!(controller.transport().commands.is_empty());
        assert_eq!(controller.state(), ControlState::Idle);
    }

    #[test]
    fn dispatch_surfaces_command_failures() {
        let (tx, rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(None);
        tx.try_send(ready_delta()).unwrap();
        drop(tx);

        let mut controller = controller(true);
        let result = dispatch_events(&mut controller, rx, &status_tx, evening);

        assert!(result.is_err());
        assert!(status_rx.borrow().is_some());
    }

    #[tokio::test]
    async fn missing_runtime_config_uses_defaults() {
        let store = AppStore::at(scratch_dir("missing-runtime"));
        let runtime = store.load_runtime_config().await.unwrap();

        assert_eq!(runtime.timezone, RuntimeConfig::default().timezone);
        assert_eq!(runtime.status_port, None);
    }

    #[tokio::test]
    async fn malformed_runtime_config_is_rejected() {
        let dir = scratch_dir("malformed-runtime");
        std::fs::write(dir.join("runtime.json"), b"{ not json").unwrap();

        let result = AppStore::at(dir).load_runtime_config().await;
        assert!(matches!(result, Err(ConfigurationError::Parse(_))));
    }

    #[tokio::test]
    async fn device_descriptors_are_required() {
        let store = AppStore::at(scratch_dir("missing-devices"));
        assert!(matches!(
            store.load_devices().await,
            Err(ConfigurationError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn device_descriptors_load_from_data_dir() {
        let dir = scratch_dir("devices");
        std::fs::write(
            dir.join("devices.json"),
            br#"[{"name": "dishwasher", "host": "192.168.1.40", "key": "c2VjcmV0"}]"#,
        )
        .unwrap();

        let devices = AppStore::at(dir).load_devices().await.unwrap();
        let device = select_device(&devices, DEVICE_MARKER).unwrap();
        assert_eq!(device.host, "192.168.1.40");
    }
}

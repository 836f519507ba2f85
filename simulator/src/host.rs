use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Publish, QoS};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dishwasher_common::{
    device_topic,
    state::{
        KEY_ACTIVE_PROGRAM, KEY_DOOR_STATE, KEY_OPERATION_STATE, KEY_POWER_STATE,
        KEY_REMAINING_PROGRAM_TIME, KEY_REMOTE_START_ALLOWED,
    },
    ProgramRequest, TOPIC_ACTIVE_PROGRAM, TOPIC_AVAILABILITY, TOPIC_SELECTED_PROGRAM, TOPIC_STATE,
};

const KEY_SELECTED_PROGRAM: &str = "BSH.Common.Root.SelectedProgram";

// Simulated appliance time, divided by SIM_TIME_SCALE before sleeping.
const READY_REPEAT: Duration = Duration::from_secs(60);
const FINISH_LINGER: Duration = Duration::from_secs(60);

struct SimSettings {
    prefix: String,
    device: String,
    time_scale: f64,
    run_time: Duration,
    idle_time: Duration,
}

impl SimSettings {
    fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        Self {
            prefix: std::env::var("SIM_PREFIX").unwrap_or_else(|_| "homeconnect".to_string()),
            device: std::env::var("SIM_DEVICE").unwrap_or_else(|_| "dishwasher".to_string()),
            time_scale: std::env::var("SIM_TIME_SCALE")
                .ok()
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|scale| scale.is_finite() && *scale > 0.0)
                .unwrap_or(1.0),
            run_time: secs("SIM_RUN_SECS", 7_200),
            idle_time: secs("SIM_IDLE_SECS", 1_800),
        }
    }

    fn topic(&self, leaf: &str) -> String {
        device_topic(&self.prefix, &self.device, leaf)
    }

    fn scaled(&self, duration: Duration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() / self.time_scale)
            .unwrap_or(Duration::MAX)
    }
}

/// A state delta published `after` the previous one.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    after: Duration,
    delta: Value,
}

fn delta<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<Map<String, Value>>(),
    )
}

fn ready_state(run_time: Duration) -> Value {
    delta([
        (KEY_DOOR_STATE, json!("Closed")),
        (KEY_REMOTE_START_ALLOWED, json!(true)),
        (KEY_ACTIVE_PROGRAM, Value::Null),
        (KEY_POWER_STATE, json!("On")),
        (KEY_OPERATION_STATE, json!("Ready")),
        (KEY_REMAINING_PROGRAM_TIME, json!(run_time.as_secs())),
    ])
}

/// What the appliance reports after accepting `request`: an optional delayed
/// start, the run, the finish, power-off and finally ready again.
fn program_cycle(request: &ProgramRequest, run_time: Duration, idle_time: Duration) -> Vec<Step> {
    let delay = request
        .start_delay()
        .and_then(|secs| u64::try_from(secs).ok())
        .unwrap_or(0);

    let mut steps = Vec::with_capacity(5);
    if delay > 0 {
        steps.push(Step {
            after: Duration::ZERO,
            delta: delta([
                (KEY_ACTIVE_PROGRAM, json!(request.program)),
                (KEY_OPERATION_STATE, json!("DelayedStart")),
            ]),
        });
    }

    steps.push(Step {
        after: Duration::from_secs(delay),
        delta: delta([
            (KEY_ACTIVE_PROGRAM, json!(request.program)),
            (KEY_OPERATION_STATE, json!("Run")),
            (KEY_REMAINING_PROGRAM_TIME, json!(run_time.as_secs())),
        ]),
    });
    steps.push(Step {
        after: run_time,
        delta: delta([
            (KEY_OPERATION_STATE, json!("Finished")),
            (KEY_REMAINING_PROGRAM_TIME, json!(0)),
        ]),
    });
    steps.push(Step {
        after: FINISH_LINGER,
        delta: delta([
            (KEY_POWER_STATE, json!("Off")),
            (KEY_ACTIVE_PROGRAM, Value::Null),
            (KEY_OPERATION_STATE, json!("Inactive")),
        ]),
    });
    steps.push(Step {
        after: idle_time,
        delta: ready_state(run_time),
    });
    steps
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = SimSettings::from_env();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("dishwasher-simulator", mqtt_host, mqtt_port);
    mqtt_options.set_clean_session(false);
    mqtt_options.set_last_will(LastWill::new(
        settings.topic(TOPIC_AVAILABILITY),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    for leaf in [TOPIC_ACTIVE_PROGRAM, TOPIC_SELECTED_PROGRAM] {
        mqtt.subscribe(settings.topic(leaf), QoS::AtLeastOnce)
            .await
            .with_context(|| format!("failed to subscribe to {leaf}"))?;
    }
    mqtt.publish(settings.topic(TOPIC_AVAILABILITY), QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish availability")?;

    let (commands_tx, mut commands_rx) = mpsc::channel::<Publish>(8);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if commands_tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("simulator mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("simulator mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        device = %settings.device,
        time_scale = settings.time_scale,
        "appliance simulator started"
    );

    let mut ready_ticker =
        tokio::time::interval(settings.scaled(READY_REPEAT).max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            _ = ready_ticker.tick() => {
                publish_state(&mqtt, &settings, &ready_state(settings.run_time)).await?;
            }
            message = commands_rx.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                handle_command(&mqtt, &settings, message).await?;
                ready_ticker.reset();
            }
        }
    }
}

async fn handle_command(
    mqtt: &AsyncClient,
    settings: &SimSettings,
    message: Publish,
) -> anyhow::Result<()> {
    let request: ProgramRequest = match serde_json::from_slice(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(topic = %message.topic, "ignoring malformed program request: {err}");
            return Ok(());
        }
    };

    if message.topic == settings.topic(TOPIC_SELECTED_PROGRAM) {
        info!(program = request.program, "program selected");
        let selected = delta([(KEY_SELECTED_PROGRAM, json!(request.program))]);
        return publish_state(mqtt, settings, &selected).await;
    }

    info!(
        program = request.program,
        delay_secs = ?request.start_delay(),
        "program activated"
    );
    for step in program_cycle(&request, settings.run_time, settings.idle_time) {
        tokio::time::sleep(settings.scaled(step.after)).await;
        publish_state(mqtt, settings, &step.delta).await?;
    }
    Ok(())
}

async fn publish_state(
    mqtt: &AsyncClient,
    settings: &SimSettings,
    delta: &Value,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(delta)?;
    mqtt.publish(settings.topic(TOPIC_STATE), QoS::AtLeastOnce, false, payload)
        .await
        .context("failed to publish appliance state")
}

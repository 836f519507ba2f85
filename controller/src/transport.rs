use rumqttc::{AsyncClient, Publish, QoS};

use dishwasher_common::{
    command_topic, device_topic, CommandPath, DeviceEvent, DeviceTransport, ProgramRequest,
    TransportError, TOPIC_AVAILABILITY, TOPIC_STATE,
};

/// Topics the appliance bridge publishes for one device.
#[derive(Debug, Clone)]
pub struct BridgeTopics {
    pub state: String,
    pub availability: String,
}

impl BridgeTopics {
    pub fn new(prefix: &str, device: &str) -> Self {
        Self {
            state: device_topic(prefix, device, TOPIC_STATE),
            availability: device_topic(prefix, device, TOPIC_AVAILABILITY),
        }
    }

    /// Maps a bridge publish onto a device event. Unrelated topics yield `None`.
    pub fn classify(&self, publish: &Publish) -> Option<DeviceEvent> {
        if publish.topic == self.state {
            return Some(DeviceEvent::StateDelta(publish.payload.to_vec()));
        }

        if publish.topic == self.availability {
            let status = String::from_utf8_lossy(&publish.payload);
            return match status.trim().to_ascii_lowercase().as_str() {
                "online" => Some(DeviceEvent::Opened),
                "offline" => Some(DeviceEvent::Closed {
                    code: None,
                    reason: "appliance bridge offline".to_string(),
                }),
                _ => None,
            };
        }

        None
    }
}

/// Sends program commands to the bridge. Publishing only queues the request
/// for the MQTT event loop, so it never blocks the dispatch worker.
pub struct MqttTransport {
    client: AsyncClient,
    prefix: String,
    device: String,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, prefix: String, device: String) -> Self {
        Self {
            client,
            prefix,
            device,
        }
    }
}

impl DeviceTransport for MqttTransport {
    fn submit_command(
        &mut self,
        path: CommandPath,
        request: &ProgramRequest,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(request)?;
        let topic = command_topic(&self.prefix, &self.device, path);

        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| TransportError::Rejected {
                path: path.as_str(),
                reason: err.to_string(),
            })
    }
}

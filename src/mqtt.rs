use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};

use crate::config::MqttConfig;
use crate::error::ChannelError;
use crate::queue::ConnectivityChannel;
use crate::readings::Reading;

/// MQTT-backed connectivity channel. One batch becomes one JSON-array
/// message on `<topic_path>/<publisher_id>/<device_key>`.
#[derive(Debug, Clone)]
pub struct MqttChannel {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttChannel {
    pub fn new(config: &MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "presence-gateway".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttChannel {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("readings".to_string()),
            },
            eventloop,
        )
    }

    fn topic_for(&self, device_key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_key(device_key)
        )
    }
}

impl ConnectivityChannel for MqttChannel {
    async fn publish(&self, device_key: &str, batch: &[Reading]) -> Result<(), ChannelError> {
        let topic = self.topic_for(device_key);
        let payload =
            serde_json::to_vec(batch).map_err(|err| ChannelError::new(&topic, err))?;

        info!(
            "publishing {} reading(s) for {} to {}",
            batch.len(),
            device_key,
            topic
        );
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| ChannelError::new(&topic, err))
    }
}

/// Drives the rumqttc connection; must be polled for the client's queued
/// publishes to go out. Runs as a background task for the process lifetime.
pub async fn run_event_loop(mut eventloop: rumqttc::EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(notification) => match notification {
                rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                    debug!("connection acknowledged");
                }
                rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_)) => {
                    debug!("publish acknowledged");
                }
                _ => {}
            },
            Err(e) => {
                error!("Error polling MQTT event loop: {:?}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn sanitize_key(key: &str) -> String {
    // Keep topic segments free of separators and whitespace
    key.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_sanitize_key() {
        let key = "Office Sensor/1";
        let sanitized = super::sanitize_key(key);
        assert_eq!(sanitized, "Office_Sensor_1");
    }
}

use anyhow::{Context, Result};
use rumqttc::{Client, Connection, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "jbdbms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("jbdbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(1)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive_interval);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        log::info!(
            "Connecting to MQTT broker {}:{} with client_id {}",
            config.host,
            config.port,
            config.client_id
        );

        let (client, connection) = Client::new(options, 16);
        let reconnect_delay = config.reconnect_delay;
        std::thread::spawn(move || Self::poll_connection(connection, reconnect_delay));

        Ok(Self { client, config })
    }

    // The sync client needs its event loop driven for publishes to go out
    // and for automatic reconnects to happen.
    fn poll_connection(mut connection: Connection, reconnect_delay: Duration) {
        for notification in connection.iter() {
            match notification {
                Ok(event) => log::trace!("MQTT event: {event:?}"),
                Err(e) => {
                    log::warn!("MQTT connection error: {e}");
                    std::thread::sleep(reconnect_delay);
                }
            }
        }
    }

    fn qos(&self) -> QoS {
        match self.config.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={}",
            self.config.qos
        );

        let mut client = self.client.clone();
        client
            .publish(topic, self.qos(), false, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: broker.local").unwrap();
        writeln!(file, "topic: battery/shed").unwrap();

        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "battery/shed");
        assert_eq!(config.qos, 0);
        assert!(config.client_id.starts_with("jbdbms-"));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
    }
}

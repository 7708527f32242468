use rumqttc::{MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;

/// Broker login, only sent when present in the config file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Broker connection and topic settings.
///
/// Mirrors the `[mqtt]` section of the configuration file. The QoS level is
/// kept as a raw number here so that the file stays readable; use
/// [`MqttConfig::qos`] to obtain the rumqttc value.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Topic that receives the presence announcement after every connect
    pub status_topic: String,
    /// The single topic the actuator listens on
    pub control_topic: String,
    /// QoS used for both the announcement and the control subscription (0, 1 or 2)
    pub qos: u8,
    /// Fixed delay between reconnect attempts
    pub retry_interval_ms: u64,
    pub keep_alive_secs: u64,
    /// How often a rejected control subscription is re-sent per session, 0 disables
    pub resubscribe_attempts: u8,
    pub credentials: Option<Credentials>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "remoteswitch".to_string(),
            status_topic: "ESP/status".to_string(),
            control_topic: "ESP/control".to_string(),
            qos: 1,
            retry_interval_ms: 10_000,
            keep_alive_secs: 15,
            resubscribe_attempts: 0,
            credentials: None,
        }
    }
}

impl MqttConfig {
    pub fn qos(&self) -> Result<QoS, ConfigError> {
        qos_from_level(self.qos)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker_host must not be empty".into()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.client_id must not be empty".into()));
        }
        if self.status_topic.is_empty() {
            return Err(ConfigError::Invalid("mqtt.status_topic must not be empty".into()));
        }
        if self.status_topic.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.status_topic '{}' must not contain wildcards",
                self.status_topic
            )));
        }
        if self.control_topic.is_empty() {
            return Err(ConfigError::Invalid("mqtt.control_topic must not be empty".into()));
        }
        // Messages are matched by exact topic, so a filter would never match.
        if self.control_topic.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.control_topic '{}' must not contain wildcards",
                self.control_topic
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("mqtt.retry_interval_ms must be greater than 0".into()));
        }
        self.qos()?;
        Ok(())
    }

    /// Builds the rumqttc options used for every connect attempt.
    ///
    /// Clean session is kept on (rumqttc default) so the control subscription
    /// is always re-issued by the device controller after a reconnect.
    pub fn to_mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.broker_host.clone(),
            self.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));

        if let Some(credentials) = &self.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        options
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::Invalid(format!(
            "QoS level must be 0, 1 or 2, got {}",
            other
        ))),
    }
}

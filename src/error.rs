use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },
    #[error("Failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },
}

impl MqttError {
    pub fn publish(topic: &str, reason: impl ToString) -> Self {
        MqttError::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn subscribe(topic: &str, reason: impl ToString) -> Self {
        MqttError::Subscribe {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_connected(topic: &str) -> Self {
        Self::publish(topic, "client is not connected")
    }
}

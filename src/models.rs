use std::borrow::Cow;

use crate::config::ConfigError;

/// MQTT delivery guarantee, validated at the boundary instead of cast from an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QualityOfService {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ConfigError::ParsingError(format!(
                "QoS must be 0, 1 or 2, got {}",
                other
            ))),
        }
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// An outgoing application message. Not kept after it is handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
    pub retain: bool,
}

impl Message {
    /// QoS 1, not retained.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QualityOfService::default(),
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QualityOfService,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QualityOfService) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// A message delivered by the broker for one of our subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

use std::sync::Arc;

use log::{error, info, warn};

use crate::config::ClientSettings;
use crate::error::MqttError;
use crate::models::{ConnectionState, Message};
use crate::mqtt_service::{ClientHandle, ClientRole};
use crate::transport::{RumqttTransport, Transport};

/// Publishes messages over its own broker session.
///
/// Unlike [`crate::subscriber::MqttSubscriber`], publishing never connects
/// implicitly: callers run `connect` first.
pub struct MqttPublisher {
    handle: ClientHandle,
}

impl MqttPublisher {
    pub fn new(settings: Arc<ClientSettings>) -> Self {
        Self::with_transport(settings, Arc::new(RumqttTransport::new()))
    }

    pub fn with_transport(settings: Arc<ClientSettings>, transport: Arc<dyn Transport>) -> Self {
        let client_id = settings.client_id.clone();
        Self {
            handle: ClientHandle::new(ClientRole::Publisher, settings, client_id, transport, None),
        }
    }

    pub async fn connect(&self) -> Result<(), MqttError> {
        self.handle.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.handle.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Hands `message` to the transport. Returns once the client accepted it.
    pub async fn publish(&self, message: Message) -> Result<(), MqttError> {
        if !self.handle.is_connected() {
            warn!("Cannot publish to '{}': client is not connected.", message.topic);
            return Err(MqttError::not_connected(&message.topic));
        }

        let topic = message.topic.clone();
        let size = message.payload.len();
        match self.handle.transport().publish(message).await {
            Ok(()) => {
                info!("Message published to '{}' ({} bytes)", topic, size);
                Ok(())
            }
            Err(e) => {
                error!("Failed to publish message to '{}': {}", topic, e);
                Err(e)
            }
        }
    }
}

use std::sync::Arc;

use log::{error, info};
use tokio::sync::broadcast;

use crate::config::ClientSettings;
use crate::error::MqttError;
use crate::models::{ConnectionState, QualityOfService, ReceivedMessage, Subscription};
use crate::mqtt_service::{ClientHandle, ClientRole};
use crate::transport::{RumqttTransport, Transport};

const MESSAGE_BUFFER: usize = 256;

/// Subscribes to topic filters and logs every message the broker delivers.
///
/// Received messages are also fanned out to [`MqttSubscriber::messages`]
/// receivers in transport order. A receiver that falls more than the buffer
/// behind skips ahead instead of stalling delivery.
pub struct MqttSubscriber {
    handle: ClientHandle,
    messages: broadcast::Sender<ReceivedMessage>,
}

impl MqttSubscriber {
    pub fn new(settings: Arc<ClientSettings>) -> Self {
        Self::with_transport(settings, Arc::new(RumqttTransport::new()))
    }

    pub fn with_transport(settings: Arc<ClientSettings>, transport: Arc<dyn Transport>) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        let client_id = settings.subscriber_client_id();
        Self {
            handle: ClientHandle::new(
                ClientRole::Subscriber,
                settings,
                client_id,
                transport,
                Some(messages.clone()),
            ),
            messages,
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

    /// Registers one topic filter, connecting first if needed.
    ///
    /// Active filters are not tracked locally, so they are not restored after
    /// the session drops and `connect` is called again.
    pub async fn subscribe(&self, topic: &str, qos: QualityOfService) -> Result<(), MqttError> {
        self.handle.connect().await?;

        let subscription = Subscription::new(topic, qos);
        match self.handle.transport().subscribe(&subscription).await {
            Ok(()) => {
                info!("Subscribed to {}", topic);
                Ok(())
            }
            Err(e) => {
                error!("Failed to subscribe to topic '{}': {}", topic, e);
                Err(e)
            }
        }
    }

    /// A new observer of received messages. Dropping it unregisters it.
    pub fn messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.messages.subscribe()
    }
}

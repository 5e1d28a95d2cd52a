use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::QualityOfService;
use crate::publisher::MqttPublisher;
use crate::subscriber::MqttSubscriber;

/// Registers the configured topic filters in the background.
///
/// Failures are logged and not retried; a later `subscribe` call can try again.
pub fn start_subscriptions(
    subscriber: Arc<MqttSubscriber>,
    topics: Vec<String>,
    qos: QualityOfService,
) -> Option<JoinHandle<()>> {
    if topics.is_empty() {
        info!("No startup subscriptions configured.");
        return None;
    }

    Some(tokio::spawn(async move {
        for topic in topics {
            if let Err(e) = subscriber.subscribe(&topic, qos).await {
                error!("Startup subscription to '{}' failed: {}", topic, e);
            }
        }
    }))
}

/// Closes both broker sessions once the HTTP server has stopped.
pub async fn handle_shutdown(publisher: &MqttPublisher, subscriber: &MqttSubscriber) {
    info!("Disconnecting MQTT clients...");

    if let Err(e) = publisher.disconnect().await {
        warn!("Publisher did not disconnect cleanly: {}", e);
    }
    if let Err(e) = subscriber.disconnect().await {
        warn!("Subscriber did not disconnect cleanly: {}", e);
    }
}

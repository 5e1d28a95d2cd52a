use own_mqtt::config::Config;
use own_mqtt::error::MqttError;
use own_mqtt::publisher::MqttPublisher;
use own_mqtt::rest_server::run_rest_server;
use own_mqtt::service_utils::{handle_shutdown, start_subscriptions};
use own_mqtt::subscriber::MqttSubscriber;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration, refusing to start without it
    let config = match Config::from_env().map_err(MqttError::from) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Refusing to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let settings = Arc::new(config.client.clone());
    info!(
        "MQTT broker configured at {}:{} (tls: {})",
        settings.host, settings.port, settings.use_tls
    );

    let publisher = Arc::new(MqttPublisher::new(settings.clone()));
    let subscriber = Arc::new(MqttSubscriber::new(settings));

    let subscriptions = start_subscriptions(
        subscriber.clone(),
        config.subscribe_topics,
        config.subscribe_qos,
    );

    let result = run_rest_server(publisher.clone()).await;

    if let Some(task) = subscriptions {
        task.abort();
    }
    handle_shutdown(&publisher, &subscriber).await;

    match result {
        Ok(()) => {
            info!("All services shut down successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("REST server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ClientSettings;
use crate::error::MqttError;
use crate::models::{ConnectionState, ReceivedMessage};
use crate::transport::{ConnectionOptions, Transport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Publisher,
    Subscriber,
}

impl ClientRole {
    fn connected_message(self) -> &'static str {
        match self {
            ClientRole::Publisher => "Connected to MQTT Broker.",
            ClientRole::Subscriber => "Connected to MQTT Broker as subscriber.",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Publisher => write!(f, "publisher"),
            ClientRole::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// One broker session and its connection state machine.
///
/// `connect` and `disconnect` are serialized and idempotent. A session that
/// drops underneath us moves the state back to `Disconnected` and stays there
/// until the next explicit `connect`.
pub struct ClientHandle {
    role: ClientRole,
    client_id: String,
    settings: Arc<ClientSettings>,
    options: OnceLock<ConnectionOptions>,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<ConnectionState>>,
    lifecycle: tokio::sync::Mutex<()>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    message_sink: Option<broadcast::Sender<ReceivedMessage>>,
}

impl ClientHandle {
    pub fn new(
        role: ClientRole,
        settings: Arc<ClientSettings>,
        client_id: String,
        transport: Arc<dyn Transport>,
        message_sink: Option<broadcast::Sender<ReceivedMessage>>,
    ) -> Self {
        Self {
            role,
            client_id,
            settings,
            options: OnceLock::new(),
            transport,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            lifecycle: tokio::sync::Mutex::new(()),
            event_pump: Mutex::new(None),
            message_sink,
        }
    }

    /// Built on first use and never rebuilt.
    pub fn options(&self) -> &ConnectionOptions {
        self.options
            .get_or_init(|| ConnectionOptions::from_settings(&self.settings, &self.client_id))
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.transport.is_connected()
    }

    pub async fn connect(&self) -> Result<(), MqttError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_connected() {
            debug!("MQTT {} already connected.", self.role);
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        // A pump left over from a dropped session must not touch the new one.
        self.abort_event_pump();

        let options = self.options();
        info!(
            "Connecting MQTT {} '{}' to {}:{}...",
            self.role, options.client_id, options.host, options.port
        );

        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if let Err(e) = self.transport.open(options, events).await {
            self.set_state(ConnectionState::Disconnected);
            error!("MQTT {} failed to connect: {}", self.role, e);
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        self.start_event_pump(receiver);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == ConnectionState::Disconnected && !self.transport.is_connected() {
            debug!("MQTT {} already disconnected.", self.role);
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);
        let result = self.transport.close().await;

        // The transport drops its event sender on close, which ends the pump.
        let pump = lock(&self.event_pump).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                if !e.is_cancelled() {
                    warn!("MQTT {} event pump failed: {}", self.role, e);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        result
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn abort_event_pump(&self) {
        if let Some(pump) = lock(&self.event_pump).take() {
            pump.abort();
        }
    }

    fn start_event_pump(&self, mut receiver: mpsc::Receiver<TransportEvent>) {
        let role = self.role;
        let state = self.state.clone();
        let sink = self.message_sink.clone();

        let pump = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    TransportEvent::Connected => info!("{}", role.connected_message()),
                    TransportEvent::Disconnected => {
                        *lock(&state) = ConnectionState::Disconnected;
                        info!("Disconnected from MQTT Broker.");
                    }
                    TransportEvent::Message(message) => match &sink {
                        Some(sink) => {
                            info!(
                                "Message received on topic {}: {}",
                                message.topic,
                                message.payload_str()
                            );
                            // No receivers is fine, the log line above is the default handler.
                            let _ = sink.send(message);
                        }
                        None => debug!(
                            "MQTT {} ignoring message on topic {}",
                            role, message.topic
                        ),
                    },
                }
            }
        });

        *lock(&self.event_pump) = Some(pump);
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.abort_event_pump();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockTransport};
    use std::time::Duration;

    fn settings() -> Arc<ClientSettings> {
        Arc::new(ClientSettings {
            client_id: "own-mqtt".to_string(),
            host: "broker.local".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
            keep_alive: Duration::from_secs(10),
        })
    }

    fn handle(transport: Arc<MockTransport>) -> ClientHandle {
        ClientHandle::new(
            ClientRole::Publisher,
            settings(),
            "own-mqtt".to_string(),
            transport,
            None,
        )
    }

    #[tokio::test]
    async fn reconnect_reuses_cached_options() {
        let transport = Arc::new(MockTransport::default());
        let handle = handle(transport.clone());

        handle.connect().await.unwrap();
        handle.disconnect().await.unwrap();
        handle.connect().await.unwrap();

        let opened: Vec<_> = transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Open(options) => Some(options),
                _ => None,
            })
            .collect();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0], opened[1]);
        assert!(std::ptr::eq(handle.options(), handle.options()));
    }

    #[tokio::test]
    async fn disconnect_walks_back_to_disconnected() {
        let transport = Arc::new(MockTransport::default());
        let handle = handle(transport.clone());

        handle.connect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.disconnect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn failed_open_leaves_handle_disconnected() {
        let transport = Arc::new(MockTransport::default());
        transport.refuse_connections(true);
        let handle = handle(transport.clone());

        let err = handle.connect().await.unwrap_err();

        assert!(matches!(err, MqttError::Connection(_)));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn transport_drop_is_observed_without_reconnecting() {
        let transport = Arc::new(MockTransport::default());
        let handle = handle(transport.clone());
        handle.connect().await.unwrap();

        transport.drop_connection().await;
        assert!(!handle.is_connected());

        tokio::time::timeout(Duration::from_secs(1), async {
            while handle.state() != ConnectionState::Disconnected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.open_count(), 1);

        handle.connect().await.unwrap();
        assert_eq!(transport.open_count(), 2);
        assert!(handle.is_connected());
    }
}

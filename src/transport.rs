use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, SubAck,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientSettings;
use crate::error::MqttError;
use crate::models::{Message, ReceivedMessage, Subscription};

const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Parameters for opening a broker session, derived once from [`ClientSettings`].
#[derive(Clone, PartialEq)]
pub struct ConnectionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub use_tls: bool,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl ConnectionOptions {
    pub fn from_settings(settings: &ClientSettings, client_id: &str) -> Self {
        // Credentials only apply when both halves are present
        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username.clone(), password.clone()))
            }
            _ => None,
        };

        Self {
            client_id: client_id.to_string(),
            host: settings.host.clone(),
            port: settings.port,
            credentials,
            use_tls: settings.use_tls,
            keep_alive: settings.keep_alive,
            clean_session: true,
        }
    }

    pub fn to_mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(self.clean_session);

        if let Some((username, password)) = &self.credentials {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        if self.use_tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        mqtt_options
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|(username, _)| (username, "***")),
            )
            .field("use_tls", &self.use_tls)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

/// Typed notifications a transport pushes to the facade that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(ReceivedMessage),
}

/// The MQTT engine behind a facade. Framing, acks and sockets live below this seam.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session and returns once the broker accepted it.
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), MqttError>;

    /// Ends the session. The event sender handed to `open` must be dropped
    /// by the time this returns.
    async fn close(&self) -> Result<(), MqttError>;

    async fn publish(&self, message: Message) -> Result<(), MqttError>;

    async fn subscribe(&self, subscription: &Subscription) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;
}

type AckWaiter = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct PendingSubscriptions {
    queued: VecDeque<AckWaiter>,
    in_flight: HashMap<u16, AckWaiter>,
    /// Set once the event loop ended; nothing will resolve new waiters after that.
    closed: bool,
}

struct Session {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<PendingSubscriptions>>,
    event_loop: JoinHandle<()>,
}

/// [`Transport`] backed by `rumqttc`.
#[derive(Default)]
pub struct RumqttTransport {
    session: Mutex<Option<Session>>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_session(&self) -> Option<(AsyncClient, Arc<Mutex<PendingSubscriptions>>)> {
        self.lock_session()
            .as_ref()
            .filter(|session| session.connected.load(Ordering::SeqCst))
            .map(|session| (session.client.clone(), session.pending.clone()))
    }

    /// Drops a session whose event loop already ended.
    fn discard_stale_session(&self) {
        let stale = self.lock_session().take();
        if let Some(session) = stale {
            session.event_loop.abort();
        }
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.lock_session().take() {
            session.event_loop.abort();
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), MqttError> {
        self.discard_stale_session();

        debug!("Configuring MQTT broker at {}:{}...", options.host, options.port);
        let (client, mut eventloop) =
            AsyncClient::new(options.to_mqtt_options(), REQUEST_CHANNEL_CAPACITY);

        wait_for_connack(&mut eventloop).await?;

        let connected = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(Mutex::new(PendingSubscriptions::default()));

        if events.send(TransportEvent::Connected).await.is_err() {
            debug!("Event receiver dropped before the session was established.");
        }

        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            events,
            connected.clone(),
            pending.clone(),
        ));

        *self.lock_session() = Some(Session {
            client,
            connected,
            pending,
            event_loop,
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), MqttError> {
        let session = self.lock_session().take();
        let Some(session) = session else {
            return Ok(());
        };

        if session.connected.load(Ordering::SeqCst) {
            if let Err(e) = session.client.disconnect().await {
                // The request channel only closes once the event loop is gone.
                warn!("Failed to send MQTT disconnect: {}", e);
                session.event_loop.abort();
            }
        } else {
            session.event_loop.abort();
        }

        if let Err(e) = session.event_loop.await {
            if !e.is_cancelled() {
                warn!("MQTT event loop task failed: {}", e);
            }
        }

        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<(), MqttError> {
        let Message {
            topic,
            payload,
            qos,
            retain,
        } = message;

        let (client, _) = self
            .live_session()
            .ok_or_else(|| MqttError::not_connected(&topic))?;

        client
            .publish(topic.clone(), qos.into(), retain, payload)
            .await
            .map_err(|e| MqttError::publish(&topic, e))
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<(), MqttError> {
        let topic = &subscription.topic;
        let (client, pending) = self
            .live_session()
            .ok_or_else(|| MqttError::subscribe(topic, "client is not connected"))?;

        let ack = queue_subscription(&pending, topic, || {
            client.try_subscribe(topic.clone(), subscription.qos.into())
        })?;

        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(MqttError::subscribe(topic, reason)),
            Err(_) => Err(MqttError::subscribe(
                topic,
                "connection closed before the broker acknowledged the subscription",
            )),
        }
    }

    fn is_connected(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|session| session.connected.load(Ordering::SeqCst))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(MqttError::Connection(format!(
                    "broker refused the connection: {:?}",
                    ack.code
                )));
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(MqttError::Connection(e.to_string())),
        }
    }
}

/// Polls until the session ends. Never reconnects: one poll error ends the task.
async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<PendingSubscriptions>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = ReceivedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    debug!("Event receiver dropped, stopping MQTT event loop.");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(waiter) = pending.queued.pop_front() {
                    pending.in_flight.insert(pkid, waiter);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                resolve_suback(&pending, ack);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Received MQTT Disconnect packet from broker.");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Sent MQTT Disconnect packet to broker.");
                break;
            }
            Ok(event) => debug!("Unhandled event: {:?}", event),
            Err(e) => {
                error!("Error in MQTT event loop: {:?}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    close_pending(&pending);
    let _ = events.send(TransportEvent::Disconnected).await;
}

/// Sends a SUBSCRIBE and queues its waiter under one lock, so waiters stay in
/// packet order and nothing is queued after the event loop closed.
fn queue_subscription<F>(
    pending: &Mutex<PendingSubscriptions>,
    topic: &str,
    send: F,
) -> Result<oneshot::Receiver<Result<(), String>>, MqttError>
where
    F: FnOnce() -> Result<(), rumqttc::ClientError>,
{
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    if pending.closed {
        return Err(MqttError::subscribe(topic, "client is not connected"));
    }

    send().map_err(|e| MqttError::subscribe(topic, e))?;

    let (waiter, ack) = oneshot::channel();
    pending.queued.push_back(waiter);
    Ok(ack)
}

/// Dropping the waiters fails any subscribe still waiting for its SUBACK.
fn close_pending(pending: &Mutex<PendingSubscriptions>) {
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    pending.closed = true;
    pending.queued.clear();
    pending.in_flight.clear();
}

fn resolve_suback(pending: &Mutex<PendingSubscriptions>, ack: SubAck) {
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .in_flight
        .remove(&ack.pkid);

    let Some(waiter) = waiter else {
        warn!("SUBACK for unknown packet id {}", ack.pkid);
        return;
    };

    let rejected = ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure));
    let result = if rejected {
        Err("broker rejected the topic filter".to_string())
    } else {
        Ok(())
    };
    let _ = waiter.send(result);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open(ConnectionOptions),
        Close,
        Publish(Message),
        Subscribe(Subscription),
    }

    /// In-memory transport that records every call.
    #[derive(Default)]
    pub struct MockTransport {
        calls: Mutex<Vec<Call>>,
        events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        connected: AtomicBool,
        refuse_connections: AtomicBool,
        reject_publishes: AtomicBool,
        reject_subscriptions: AtomicBool,
    }

    impl MockTransport {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn open_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, Call::Open(_)))
                .count()
        }

        pub fn refuse_connections(&self, refuse: bool) {
            self.refuse_connections.store(refuse, Ordering::SeqCst);
        }

        pub fn reject_publishes(&self, reject: bool) {
            self.reject_publishes.store(reject, Ordering::SeqCst);
        }

        pub fn reject_subscriptions(&self, reject: bool) {
            self.reject_subscriptions.store(reject, Ordering::SeqCst);
        }

        /// Simulates the broker pushing a message for an active subscription.
        pub async fn deliver(&self, topic: &str, payload: &[u8]) {
            let events = self.events.lock().unwrap().clone();
            if let Some(events) = events {
                let message = ReceivedMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                };
                events.send(TransportEvent::Message(message)).await.unwrap();
            }
        }

        /// Simulates a network drop.
        pub async fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
            let events = self.events.lock().unwrap().take();
            if let Some(events) = events {
                let _ = events.send(TransportEvent::Disconnected).await;
            }
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(
            &self,
            options: &ConnectionOptions,
            events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), MqttError> {
            self.record(Call::Open(options.clone()));
            if self.refuse_connections.load(Ordering::SeqCst) {
                return Err(MqttError::Connection("connection refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            events.send(TransportEvent::Connected).await.unwrap();
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn close(&self) -> Result<(), MqttError> {
            self.record(Call::Close);
            self.drop_connection().await;
            Ok(())
        }

        async fn publish(&self, message: Message) -> Result<(), MqttError> {
            let topic = message.topic.clone();
            self.record(Call::Publish(message));
            if !self.connected.load(Ordering::SeqCst) {
                return Err(MqttError::not_connected(&topic));
            }
            if self.reject_publishes.load(Ordering::SeqCst) {
                return Err(MqttError::publish(&topic, "request channel closed"));
            }
            Ok(())
        }

        async fn subscribe(&self, subscription: &Subscription) -> Result<(), MqttError> {
            self.record(Call::Subscribe(subscription.clone()));
            if !self.connected.load(Ordering::SeqCst) {
                return Err(MqttError::subscribe(&subscription.topic, "client is not connected"));
            }
            if self.reject_subscriptions.load(Ordering::SeqCst) {
                return Err(MqttError::subscribe(
                    &subscription.topic,
                    "broker rejected the topic filter",
                ));
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}

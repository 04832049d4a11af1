use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing};
use std::time::Duration;
use tb_shared::{ClientConfig, ClientError, QoS, Result};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parameters of one MQTT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl From<&ClientConfig> for ConnectOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: config.keep_alive(),
            clean_session: config.clean_session,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

/// CONNACK as seen by the client; `code` 0 means accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub session_present: bool,
    pub code: u8,
}

/// What the transport reports after the initial handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A later CONNACK, i.e. the transport reconnected on its own.
    Connected(ConnectAck),
    Message { topic: String, payload: Vec<u8> },
    Disconnected(String),
}

/// Publish/subscribe transport. Only the connection manager talks to it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs the handshake. Inbound traffic and later connection changes
    /// are sent to `events` until `disconnect`.
    async fn connect(&self, options: &ConnectOptions, events: mpsc::UnboundedSender<TransportEvent>) -> Result<ConnectAck>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

fn to_rumqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// [`Transport`] backed by `rumqttc`.
#[derive(Default)]
pub struct RumqttTransport {
    client: RwLock<Option<AsyncClient>>,
    shutdown: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<AsyncClient> {
        self.client.read().await.clone().ok_or(ClientError::NotConnected)
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<ConnectAck> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    return Ok(ConnectAck {
                        session_present: connack.session_present,
                        code: return_code(connack.code),
                    });
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Ok(ConnectAck { session_present: false, code: return_code(code) });
                }
                Err(e) => return Err(ClientError::Connection(e.to_string())),
            }
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
        reconnect_delay: Duration,
    ) {
        info!("Starting MQTT event loop");

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = event_loop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    info!("MQTT connection re-established: {:?}", connack);
                    Some(TransportEvent::Connected(ConnectAck {
                        session_present: connack.session_present,
                        code: return_code(connack.code),
                    }))
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("Received MQTT message on topic: {}", publish.topic);
                    Some(TransportEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    })
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    warn!("MQTT broker initiated disconnect");
                    Some(TransportEvent::Disconnected("broker initiated disconnect".to_string()))
                }
                Ok(Event::Incoming(incoming)) => {
                    debug!("Received MQTT packet: {:?}", incoming);
                    None
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent to MQTT broker");
                    None
                }
                Ok(Event::Outgoing(_)) => None,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!("MQTT connection error: {}", e);
                    if events.send(TransportEvent::Disconnected(e.to_string())).is_err() {
                        break;
                    }
                    // rumqttc reconnects on the next poll
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    None
                }
            };

            if let Some(event) = event {
                if events.send(event).is_err() {
                    warn!("Transport event receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
        }

        info!("MQTT event loop stopped");
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, options: &ConnectOptions, events: mpsc::UnboundedSender<TransportEvent>) -> Result<ConnectAck> {
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), &options.host, options.port);

        if let Some(username) = &options.username {
            mqtt_options.set_credentials(username, options.password.clone().unwrap_or_default());
        }

        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 64);

        let ack = tokio::time::timeout(options.connect_timeout, Self::wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| ClientError::Connection("timed out waiting for CONNACK".to_string()))??;

        if ack.code != 0 {
            return Ok(ack);
        }

        *self.client.write().await = Some(client);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            events,
            cancel.clone(),
            options.reconnect_delay,
        ));

        if let Some((previous, _)) = self.shutdown.lock().await.replace((cancel, handle)) {
            previous.cancel();
        }

        Ok(ack)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.client()
            .await?
            .publish(topic, to_rumqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to publish to {}: {}", topic, e)))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client()
            .await?
            .subscribe(topic, to_rumqtt_qos(qos))
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to subscribe to {}: {}", topic, e)))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client()
            .await?
            .unsubscribe(topic)
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to unsubscribe from {}: {}", topic, e)))
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!("Failed to send MQTT disconnect: {}", e);
            }
        }

        if let Some((cancel, handle)) = self.shutdown.lock().await.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("MQTT event loop task ended abnormally: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        pub topic: String,
        pub payload: Vec<u8>,
        pub qos: QoS,
        pub retain: bool,
    }

    impl Published {
        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
        }

        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.payload).into_owned()
        }
    }

    /// Records every call and lets tests inject inbound events.
    #[derive(Default)]
    pub struct MockTransport {
        pub connect_code: StdMutex<u8>,
        pub connects: StdMutex<Vec<ConnectOptions>>,
        pub published: StdMutex<Vec<Published>>,
        pub subscribed: StdMutex<Vec<(String, QoS)>>,
        pub unsubscribed: StdMutex<Vec<String>>,
        pub disconnects: StdMutex<usize>,
        events: StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl MockTransport {
        pub fn refusing(code: u8) -> Self {
            let transport = Self::default();
            *transport.connect_code.lock().unwrap() = code;
            transport
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }

        pub fn published_on(&self, topic: &str) -> Vec<Published> {
            self.published().into_iter().filter(|p| p.topic == topic).collect()
        }

        pub fn subscribed_topics(&self) -> Vec<String> {
            self.subscribed.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }

        pub fn clear(&self) {
            self.published.lock().unwrap().clear();
            self.subscribed.lock().unwrap().clear();
        }

        pub fn inject(&self, event: TransportEvent) {
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                let _ = events.send(event);
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, options: &ConnectOptions, events: mpsc::UnboundedSender<TransportEvent>) -> Result<ConnectAck> {
            self.connects.lock().unwrap().push(options.clone());
            *self.events.lock().unwrap() = Some(events);
            Ok(ConnectAck { session_present: false, code: *self.connect_code.lock().unwrap() })
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
            self.published.lock().unwrap().push(Published { topic: topic.to_string(), payload, qos, retain });
            Ok(())
        }

        async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
            self.subscribed.lock().unwrap().push((topic.to_string(), qos));
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.unsubscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            *self.disconnects.lock().unwrap() += 1;
            self.events.lock().unwrap().take();
            Ok(())
        }
    }
}

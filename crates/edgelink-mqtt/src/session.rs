//! The broker session.
//!
//! One `MqttSession` owns exactly one connection to one broker. Opening
//! a second session with the same ClientID makes the broker kick both
//! off in a loop, so every other component borrows this session instead
//! of connecting on its own.
//!
//! Subscriptions are stored as topic-filter → handler and re-issued
//! after every reconnect. Inbound messages are routed to **every**
//! stored filter whose wildcard pattern matches the topic, not just an
//! exact lookup, because rumqttc itself dispatches nothing.

use crate::credentials::mqtt_credentials;
use crate::tls;
use crate::topics::matches_filter;
use edgelink_core::config::Config;
use edgelink_core::error::{Error, Result};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, Transport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Bounded wait for a graceful disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// An inbound message handler: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |topic, payload| Box::pin(f(topic, payload)))
}

#[derive(Clone)]
struct Subscription {
    qos: QoS,
    handler: MessageHandler,
}

type SubscriptionMap = Arc<RwLock<HashMap<String, Subscription>>>;

/// A single authenticated MQTT session with automatic reconnect.
pub struct MqttSession {
    config: Config,
    client: Arc<std::sync::RwLock<Option<AsyncClient>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    subscriptions: SubscriptionMap,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MqttSession {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: Arc::new(std::sync::RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            poll_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to the broker.
    ///
    /// Validates the configuration, derives credentials, performs one
    /// CONNECT attempt (failing on refusal or transport error), then
    /// spawns the poll task that routes messages and reconnects with
    /// bounded backoff.
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;

        let credentials = mqtt_credentials(
            &self.config.device.product_key,
            &self.config.device.device_name,
            &self.config.device.device_secret,
            self.config.secure_mode(),
        );
        debug!("derived client id: {}", credentials.client_id);

        let mut options = MqttOptions::new(
            credentials.client_id,
            &self.config.mqtt.host,
            self.config.mqtt.port,
        );
        options.set_credentials(credentials.username, credentials.password);
        options.set_keep_alive(Duration::from_secs(self.config.mqtt.keep_alive_secs));
        options.set_clean_session(self.config.mqtt.clean_session);
        if self.config.mqtt.use_tls {
            options.set_transport(Transport::Tls(tls::tls_configuration(&self.config.tls)?));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // Drive the event loop until the broker answers the CONNECT.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(Error::auth(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::transport(format!("failed to connect: {e}")));
                }
            }
        }

        *self.client.write().unwrap() = Some(client.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        info!("connected to MQTT broker: {}", self.config.broker_url());

        // Anything subscribed before connect is issued now.
        self.reissue_subscriptions(&client).await;

        let connected = self.connected.clone();
        let running = self.running.clone();
        let subscriptions = self.subscriptions.clone();
        let poll_client = client.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("reconnected to MQTT broker");
                            connected.store(true, Ordering::SeqCst);
                            backoff = Duration::from_secs(1);
                            reissue_all(&poll_client, &subscriptions).await;
                        } else {
                            warn!("broker refused reconnect: {:?}", ack.code);
                            connected.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload = publish.payload.to_vec();
                        dispatch(&subscriptions, topic, payload).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!("broker sent disconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        connected.store(false, Ordering::SeqCst);
                        warn!("connection lost: {e}, retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_RECONNECT_INTERVAL);
                    }
                }
            }
            debug!("session poll task exited");
        });
        *self.poll_task.lock().await = Some(handle);

        Ok(())
    }

    /// Graceful, idempotent disconnect with a bounded wait.
    pub async fn disconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);

        let client = self.client.write().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }

        if let Some(mut handle) = self.poll_task.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                debug!("poll task still draining after disconnect window, aborting");
                handle.abort();
            }
        }
        info!("disconnected from MQTT broker");
    }

    /// Conservative connectivity check: both the local flag and the
    /// presence of the underlying client must agree.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.read().unwrap().is_some()
    }

    /// Publish a message. Fails fast when the session is down.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::transport("client is not connected"));
        }
        let client = self
            .client
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::transport("client is not connected"))?;

        client
            .publish(topic, qos, retained, payload)
            .await
            .map_err(|e| Error::transport(format!("failed to publish message: {e}")))?;
        debug!("published message to topic: {topic}");
        Ok(())
    }

    /// Store `filter → handler` and issue a SUBSCRIBE when connected.
    ///
    /// Subscribing the same filter again replaces the handler. Filters
    /// stored while disconnected are issued on (re)connect.
    pub async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .insert(filter.to_string(), Subscription { qos, handler });

        let client = self.client.read().unwrap().clone();
        if let (true, Some(client)) = (self.connected.load(Ordering::SeqCst), client) {
            if let Err(e) = client.subscribe(filter, qos).await {
                self.subscriptions.write().await.remove(filter);
                return Err(Error::transport(format!(
                    "failed to subscribe to topic: {e}"
                )));
            }
        }
        debug!("subscribed to topic: {filter}");
        Ok(())
    }

    /// Remove the stored mapping and issue an UNSUBSCRIBE.
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let client = self.client.read().unwrap().clone();
        if let (true, Some(client)) = (self.connected.load(Ordering::SeqCst), client) {
            client
                .unsubscribe(filter)
                .await
                .map_err(|e| Error::transport(format!("failed to unsubscribe: {e}")))?;
        }
        self.subscriptions.write().await.remove(filter);
        debug!("unsubscribed from topic: {filter}");
        Ok(())
    }

    /// Number of stored subscription filters.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    async fn reissue_subscriptions(&self, client: &AsyncClient) {
        reissue_all(client, &self.subscriptions).await;
    }
}

async fn reissue_all(client: &AsyncClient, subscriptions: &SubscriptionMap) {
    let filters: Vec<(String, QoS)> = subscriptions
        .read()
        .await
        .iter()
        .map(|(topic, sub)| (topic.clone(), sub.qos))
        .collect();
    for (filter, qos) in filters {
        if let Err(e) = client.subscribe(&filter, qos).await {
            warn!("failed to resubscribe to {filter}: {e}");
        }
    }
}

/// Route one inbound message to every matching stored filter.
async fn dispatch(subscriptions: &SubscriptionMap, topic: String, payload: Vec<u8>) {
    let handlers: Vec<MessageHandler> = {
        let subs = subscriptions.read().await;
        subs.iter()
            .filter(|(filter, _)| matches_filter(filter, &topic))
            .map(|(_, sub)| sub.handler.clone())
            .collect()
    };
    if handlers.is_empty() {
        debug!("no handler for message on topic {topic}");
        return;
    }
    for handler in handlers {
        handler(topic.clone(), payload.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Config {
        let mut config = Config::new();
        config.device.product_key = "A".to_string();
        config.device.device_name = "b".to_string();
        config.device.device_secret = "s".to_string();
        config.mqtt.host = "h".to_string();
        config
    }

    #[tokio::test]
    async fn test_publish_when_disconnected_fails() {
        let session = MqttSession::new(test_config());
        let err = session
            .publish("t", b"x".to_vec(), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = test_config();
        config.device.product_key.clear();
        let session = MqttSession::new(config);
        assert!(matches!(session.connect().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_replaces_handler() {
        let session = MqttSession::new(test_config());

        let first = Arc::new(AtomicUsize::new(0));
        let c = first.clone();
        session
            .subscribe(
                "a/+",
                QoS::AtMostOnce,
                message_handler(move |_, _| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        let second = Arc::new(AtomicUsize::new(0));
        let c = second.clone();
        session
            .subscribe(
                "a/+",
                QoS::AtMostOnce,
                message_handler(move |_, _| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        assert_eq!(session.subscription_count().await, 1);
        dispatch(&session.subscriptions, "a/x".to_string(), Vec::new()).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_every_matching_filter() {
        let session = MqttSession::new(test_config());

        let wildcard_hits = Arc::new(AtomicUsize::new(0));
        let exact_hits = Arc::new(AtomicUsize::new(0));
        let other_hits = Arc::new(AtomicUsize::new(0));

        let c = wildcard_hits.clone();
        session
            .subscribe(
                "/sys/A/b/rrpc/request/+",
                QoS::AtMostOnce,
                message_handler(move |_, _| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        let c = exact_hits.clone();
        session
            .subscribe(
                "/sys/A/b/rrpc/request/R1",
                QoS::AtMostOnce,
                message_handler(move |_, _| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        let c = other_hits.clone();
        session
            .subscribe(
                "/ota/device/upgrade/A/b",
                QoS::AtMostOnce,
                message_handler(move |_, _| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        dispatch(
            &session.subscriptions,
            "/sys/A/b/rrpc/request/R1".to_string(),
            Vec::new(),
        )
        .await;

        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_mapping() {
        let session = MqttSession::new(test_config());
        session
            .subscribe("a/b", QoS::AtMostOnce, message_handler(|_, _| async {}))
            .await
            .unwrap();
        assert_eq!(session.subscription_count().await, 1);
        session.unsubscribe("a/b").await.unwrap();
        assert_eq!(session.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let session = MqttSession::new(test_config());
        session.disconnect().await;
        session.disconnect().await;
        assert!(!session.is_connected());
    }
}

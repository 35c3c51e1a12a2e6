//! The MQTT framework plugin.
//!
//! Bridges framework events onto the Thing-Model topics and translates
//! inbound cloud messages back into framework events. Hosts the RRPC
//! client and exposes the single broker session to peer plugins: the
//! ClientID namespace tolerates exactly one session per device, so
//! peers must borrow this one rather than connect on their own.

use crate::rrpc::{request_handler, RequestHandler, RrpcClient};
use crate::session::{message_handler, MqttSession};
use crate::topics;
use async_trait::async_trait;
use edgelink_core::device::ServiceRequest;
use edgelink_core::error::{Error, Result};
use edgelink_core::event::{handler, Event, EventType};
use edgelink_core::framework::Framework;
use edgelink_core::plugin::Plugin;
use rumqttc::QoS;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, warn};

/// Thing-Model topic set for one device identity.
#[derive(Debug, Clone)]
struct ThingTopics {
    property_post: String,
    property_set: String,
    property_set_reply: String,
    event_post: String,
    service_invoke_filter: String,
}

impl ThingTopics {
    fn new(pk: &str, dn: &str) -> Self {
        Self {
            property_post: topics::property_post(pk, dn),
            property_set: topics::property_set(pk, dn),
            property_set_reply: topics::property_set_reply(pk, dn),
            event_post: topics::event_post(pk, dn),
            service_invoke_filter: topics::service_invoke_filter(pk, dn),
        }
    }
}

/// MQTT connectivity plugin. Leaf of the plugin graph.
pub struct MqttPlugin {
    session: Arc<MqttSession>,
    rrpc: Arc<RrpcClient>,
    framework: RwLock<Option<Weak<Framework>>>,
    topics: ThingTopics,
    product_key: String,
    device_name: String,
}

impl MqttPlugin {
    pub fn new(config: edgelink_core::config::Config) -> Arc<Self> {
        let product_key = config.device.product_key.clone();
        let device_name = config.device.device_name.clone();
        let session = MqttSession::new(config);
        let rrpc = RrpcClient::new(session.clone(), &product_key, &device_name);
        Arc::new(Self {
            topics: ThingTopics::new(&product_key, &device_name),
            session,
            rrpc,
            framework: RwLock::new(None),
            product_key,
            device_name,
        })
    }

    /// The shared broker session, for peer plugins (OTA).
    pub fn mqtt_client(&self) -> Arc<MqttSession> {
        self.session.clone()
    }

    /// Register an RRPC method handler on the hosted client.
    pub fn register_rrpc_handler(&self, method: impl Into<String>, handler: RequestHandler) {
        let method = method.into();
        info!("registered RRPC handler for method: {method}");
        self.rrpc.register_handler(method, handler);
    }

    fn framework(&self) -> Option<Arc<Framework>> {
        self.framework
            .read()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    /// Outbound translation: framework events → Thing-Model publishes.
    fn register_event_handlers(&self, framework: &Arc<Framework>) {
        // property.report → property post topic.
        let session = self.session.clone();
        let topic = self.topics.property_post.clone();
        framework.on(
            EventType::PropertyReport,
            handler(move |event| {
                let session = session.clone();
                let topic = topic.clone();
                async move {
                    let properties: HashMap<String, Value> =
                        serde_json::from_value(event.data)
                            .map_err(|_| Error::protocol("invalid property data"))?;
                    let payload = property_post_payload(
                        &properties,
                        chrono::Utc::now().timestamp(),
                    );
                    session
                        .publish(&topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
                        .await?;
                    debug!("reported properties to {topic}");
                    Ok(())
                }
            }),
        );

        // service.response → invoke reply topic (legacy shape when the
        // response names no service).
        let session = self.session.clone();
        let pk = self.product_key.clone();
        let dn = self.device_name.clone();
        framework.on(
            EventType::ServiceResponse,
            handler(move |event| {
                let session = session.clone();
                let pk = pk.clone();
                let dn = dn.clone();
                async move {
                    let response: edgelink_core::device::ServiceResponse =
                        serde_json::from_value(event.data)
                            .map_err(|_| Error::protocol("invalid service response data"))?;
                    let topic = match &response.service {
                        Some(service) => topics::service_invoke_reply(&pk, &dn, service),
                        None => topics::legacy_service_reply(&pk, &dn),
                    };
                    let payload = service_response_payload(
                        &response.id,
                        response.code,
                        &response.data,
                        response.message.as_deref(),
                    );
                    session
                        .publish(&topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
                        .await?;
                    debug!("sent service response to {topic}");
                    Ok(())
                }
            }),
        );

        // event.report → event post topic.
        let session = self.session.clone();
        let topic = self.topics.event_post.clone();
        framework.on(
            EventType::EventReport,
            handler(move |event| {
                let session = session.clone();
                let topic = topic.clone();
                async move { publish_event_report(&session, &topic, &event.data).await }
            }),
        );

        // Legacy bridge: `custom` events that carry an `event_type`
        // field are treated as event reports.
        let session = self.session.clone();
        let topic = self.topics.event_post.clone();
        framework.on(
            EventType::Custom,
            handler(move |event| {
                let session = session.clone();
                let topic = topic.clone();
                async move {
                    if event.data.get("event_type").and_then(Value::as_str).is_some() {
                        publish_event_report(&session, &topic, &event.data).await
                    } else {
                        Ok(())
                    }
                }
            }),
        );
    }

    /// Framework-level RRPC methods.
    fn register_rrpc_handlers(&self) {
        let framework = self.framework.read().unwrap().clone();
        self.rrpc.register_handler(
            "InvokeService",
            request_handler(move |request_id, payload| {
                let framework = framework.clone();
                async move {
                    #[derive(Deserialize)]
                    struct Invoke {
                        service: String,
                        #[serde(default)]
                        params: HashMap<String, Value>,
                    }
                    let invoke: Invoke = serde_json::from_slice(&payload)
                        .map_err(|e| Error::protocol(format!("invalid request format: {e}")))?;

                    let fw = framework
                        .as_ref()
                        .and_then(|weak| weak.upgrade())
                        .ok_or_else(|| Error::lifecycle("framework is gone"))?;

                    let request =
                        ServiceRequest::new(request_id, invoke.service, invoke.params);
                    fw.emit(Event::new(
                        EventType::ServiceCall,
                        "rrpc",
                        serde_json::to_value(request)?,
                    ))
                    .await?;

                    Ok(serde_json::to_vec(&json!({
                        "code": 0,
                        "message": "Service invoked successfully",
                    }))?)
                }
            }),
        );

        self.rrpc.register_handler(
            "GetDeviceStatus",
            request_handler(|_request_id, _payload| async {
                Ok(serde_json::to_vec(&json!({
                    "status": "online",
                    "timestamp": chrono::Utc::now().timestamp(),
                }))?)
            }),
        );
    }

    /// Inbound subscriptions, with the legacy `/sys` fallback when the
    /// primary `$SYS` subscribe is refused.
    async fn subscribe_topics(&self) -> Result<()> {
        let property_handler = self.property_set_handler();
        if let Err(e) = self
            .session
            .subscribe(&self.topics.property_set, QoS::AtMostOnce, property_handler.clone())
            .await
        {
            warn!(
                "could not subscribe to {}: {e}, trying legacy topic",
                self.topics.property_set
            );
            let legacy = topics::legacy_property_set(&self.product_key, &self.device_name);
            match self
                .session
                .subscribe(&legacy, QoS::AtMostOnce, property_handler)
                .await
            {
                Ok(()) => info!("subscribed to legacy property topic: {legacy}"),
                Err(e) => warn!("could not subscribe to legacy property topic: {e}"),
            }
        }

        let service_handler = self.service_invoke_handler();
        if let Err(e) = self
            .session
            .subscribe(
                &self.topics.service_invoke_filter,
                QoS::AtMostOnce,
                service_handler.clone(),
            )
            .await
        {
            warn!(
                "could not subscribe to {}: {e}, trying legacy topic",
                self.topics.service_invoke_filter
            );
            let legacy = topics::legacy_service_filter(&self.product_key, &self.device_name);
            match self
                .session
                .subscribe(&legacy, QoS::AtMostOnce, service_handler)
                .await
            {
                Ok(()) => info!("subscribed to legacy service topic: {legacy}"),
                Err(e) => warn!("could not subscribe to legacy service topic: {e}"),
            }
        }

        // Reply inspection: the platform acks our posts; surface
        // rejections in the logs.
        for reply_topic in [
            topics::property_post_reply(&self.product_key, &self.device_name),
            topics::event_post_reply(&self.product_key, &self.device_name),
        ] {
            if let Err(e) = self
                .session
                .subscribe(&reply_topic, QoS::AtMostOnce, reply_inspection_handler())
                .await
            {
                debug!("could not subscribe to reply topic {reply_topic}: {e}");
            }
        }

        debug!("topic subscription completed");
        Ok(())
    }

    fn property_set_handler(&self) -> crate::session::MessageHandler {
        let framework = self.framework.read().unwrap().clone();
        let session = self.session.clone();
        let reply_topic = self.topics.property_set_reply.clone();
        message_handler(move |_topic, payload| {
            let framework = framework.clone();
            let session = session.clone();
            let reply_topic = reply_topic.clone();
            async move {
                #[derive(Deserialize)]
                struct PropertySet {
                    #[serde(default)]
                    id: String,
                    #[serde(default)]
                    params: Value,
                }
                let msg: PropertySet = match serde_json::from_slice(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("failed to parse property set message: {e}");
                        return;
                    }
                };

                if let Some(fw) = framework.as_ref().and_then(|weak| weak.upgrade()) {
                    let event = Event::new(EventType::PropertySet, "mqtt", msg.params)
                        .with_metadata("messageId", json!(msg.id));
                    if let Err(e) = fw.emit(event).await {
                        warn!("failed to emit property set event: {e}");
                        fw.emit_async(Event::new(
                            EventType::SystemError,
                            "mqtt",
                            json!({ "message": e.to_string() }),
                        ));
                    }
                }

                let reply = property_set_reply_payload(&msg.id);
                match serde_json::to_vec(&reply) {
                    Ok(data) => {
                        if let Err(e) =
                            session.publish(&reply_topic, data, QoS::AtMostOnce, false).await
                        {
                            warn!("failed to send property set reply: {e}");
                        }
                    }
                    Err(e) => warn!("failed to serialize property set reply: {e}"),
                }
            }
        })
    }

    fn service_invoke_handler(&self) -> crate::session::MessageHandler {
        let framework = self.framework.read().unwrap().clone();
        message_handler(move |topic, payload| {
            let framework = framework.clone();
            async move {
                // Replies to our own publishes come back on sibling
                // topics; ignore them.
                if topic.contains("_reply") || topic.ends_with("/reply") {
                    return;
                }

                let service = match service_name_from_topic(&topic) {
                    Some(service) => service.to_string(),
                    None => {
                        warn!("invalid service topic: {topic}");
                        return;
                    }
                };

                #[derive(Deserialize)]
                struct ServiceCall {
                    #[serde(default)]
                    id: String,
                    #[serde(default)]
                    params: HashMap<String, Value>,
                }
                let msg: ServiceCall = match serde_json::from_slice(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("failed to parse service call message: {e}");
                        return;
                    }
                };

                let Some(fw) = framework.as_ref().and_then(|weak| weak.upgrade()) else {
                    return;
                };
                let request = ServiceRequest::new(msg.id, service, msg.params);
                let event = match serde_json::to_value(request) {
                    Ok(data) => Event::new(EventType::ServiceCall, "mqtt", data),
                    Err(e) => {
                        warn!("failed to serialize service request: {e}");
                        return;
                    }
                };
                if let Err(e) = fw.emit(event).await {
                    warn!("failed to emit service call event: {e}");
                    fw.emit_async(Event::new(
                        EventType::SystemError,
                        "mqtt",
                        json!({ "message": e.to_string() }),
                    ));
                }
            }
        })
    }
}

#[async_trait]
impl Plugin for MqttPlugin {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "MQTT connectivity plugin for the EdgeLink framework"
    }

    async fn init(&self, framework: Arc<Framework>) -> Result<()> {
        *self.framework.write().unwrap() = Some(Arc::downgrade(&framework));
        self.register_event_handlers(&framework);
        info!(
            "MQTT plugin initialized for device {}.{}",
            self.product_key, self.device_name
        );
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!("MQTT plugin starting");

        self.session.connect().await?;

        self.register_rrpc_handlers();
        match self.rrpc.start().await {
            Ok(()) => info!("RRPC client started"),
            // RRPC is an optional capability; the session stays useful
            // without it.
            Err(e) => warn!("failed to start RRPC client: {e}"),
        }

        if let Err(e) = self.subscribe_topics().await {
            self.session.disconnect().await;
            return Err(e);
        }

        if let Some(fw) = self.framework() {
            fw.emit(Event::new(EventType::Connected, "mqtt", Value::Null))
                .await
                .ok();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("MQTT plugin stopping");

        if let Err(e) = self.rrpc.stop().await {
            debug!("RRPC stop: {e}");
        }

        if let Some(fw) = self.framework() {
            fw.emit(Event::new(EventType::Disconnected, "mqtt", Value::Null))
                .await
                .ok();
        }

        self.session.disconnect().await;
        info!("MQTT plugin stopped");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wrap each property as `{value: <stringified>, time: <unix seconds>}`
/// and envelope it in the Thing-Model post shape.
fn property_post_payload(properties: &HashMap<String, Value>, timestamp: i64) -> Value {
    let mut params = serde_json::Map::new();
    for (name, value) in properties {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.insert(
            name.clone(),
            json!({ "value": text, "time": timestamp }),
        );
    }
    json!({
        "id": timestamp.to_string(),
        "version": "1.0",
        "params": params,
    })
}

/// Thing-Model event post payload with the `thing.event.{name}.post`
/// method tag.
fn event_post_payload(event_type: &str, data: &Value, time: &Value) -> Value {
    json!({
        "id": chrono::Utc::now().timestamp().to_string(),
        "version": "1.0",
        "params": {
            "eventType": event_type,
            "value": data,
            "time": time,
        },
        "method": format!("thing.event.{event_type}.post"),
    })
}

fn property_set_reply_payload(id: &str) -> Value {
    json!({ "id": id, "code": 200, "data": {} })
}

fn service_response_payload(
    id: &str,
    code: i32,
    data: &Value,
    message: Option<&str>,
) -> Value {
    let mut payload = json!({ "id": id, "code": code, "data": data });
    if let Some(message) = message {
        payload["message"] = json!(message);
    }
    payload
}

/// Log post replies the platform rejected.
fn reply_inspection_handler() -> crate::session::MessageHandler {
    message_handler(move |topic, payload| async move {
        #[derive(Deserialize)]
        struct Reply {
            #[serde(default)]
            id: String,
            #[serde(default)]
            code: i32,
            #[serde(default)]
            message: String,
        }
        match serde_json::from_slice::<Reply>(&payload) {
            Ok(reply) if reply.code != 200 && reply.code != 0 => {
                warn!(
                    "post rejected on {topic}: id={} code={} {}",
                    reply.id, reply.code, reply.message
                );
            }
            Ok(_) => debug!("post acknowledged on {topic}"),
            Err(e) => warn!("failed to parse reply on {topic}: {e}"),
        }
    })
}

/// Service name from `$SYS/{pk}/{dn}/service/{name}/invoke`. The name
/// sits at slash index 4; topics with fewer than six segments are
/// malformed.
fn service_name_from_topic(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 6 {
        return None;
    }
    Some(parts[4])
}

async fn publish_event_report(
    session: &Arc<MqttSession>,
    topic: &str,
    data: &Value,
) -> Result<()> {
    let event_type = data
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("invalid event data"))?;
    let payload = event_post_payload(
        event_type,
        data.get("data").unwrap_or(&Value::Null),
        data.get("timestamp").unwrap_or(&Value::Null),
    );
    session
        .publish(topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
        .await?;
    debug!("reported event {event_type} to {topic}");
    Ok(())
}

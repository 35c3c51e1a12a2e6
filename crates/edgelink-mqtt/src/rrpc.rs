//! Synchronous request/response over MQTT.
//!
//! The caller publishes on `/sys/{pk}/{dn}/rrpc/request/{id}` and the
//! device answers on `/sys/{pk}/{dn}/rrpc/response/{id}`; correlation
//! lives entirely in the topic tail. Inbound requests are dispatched by
//! the `method` field of the JSON payload.

use crate::session::{message_handler, MqttSession};
use crate::topics;
use edgelink_core::error::{Error, Result};
use futures::future::BoxFuture;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// An RRPC request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrpcRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub method: String,
}

/// An RRPC response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrpcResponse {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A method handler: `(request_id, raw payload)` → response bytes.
pub type RequestHandler =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// Wrap an async closure into a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |request_id, payload| Box::pin(f(request_id, payload)))
}

/// RRPC endpoint bound to one device identity over the shared session.
pub struct RrpcClient {
    session: Arc<MqttSession>,
    product_key: String,
    device_name: String,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    request_prefix: String,
}

impl RrpcClient {
    pub fn new(
        session: Arc<MqttSession>,
        product_key: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Arc<Self> {
        let product_key = product_key.into();
        let device_name = device_name.into();
        let request_prefix = topics::rrpc_request_prefix(&product_key, &device_name);
        Arc::new(Self {
            session,
            product_key,
            device_name,
            handlers: RwLock::new(HashMap::new()),
            request_prefix,
        })
    }

    /// Subscribe the request filter. Requires a connected session;
    /// handlers may be registered at any time afterwards.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.session.is_connected() {
            return Err(Error::transport("MQTT client is not connected"));
        }
        let filter = topics::rrpc_request_filter(&self.product_key, &self.device_name);
        let this = self.clone();
        self.session
            .subscribe(
                &filter,
                QoS::AtMostOnce,
                message_handler(move |topic, payload| {
                    let this = this.clone();
                    async move {
                        this.handle_request(topic, payload).await;
                    }
                }),
            )
            .await
    }

    /// Unsubscribe the request filter.
    pub async fn stop(&self) -> Result<()> {
        let filter = topics::rrpc_request_filter(&self.product_key, &self.device_name);
        self.session.unsubscribe(&filter).await
    }

    /// Register a handler for `method`. Replaces any previous handler.
    pub fn register_handler(&self, method: impl Into<String>, handler: RequestHandler) {
        self.handlers.write().unwrap().insert(method.into(), handler);
    }

    pub fn unregister_handler(&self, method: &str) {
        self.handlers.write().unwrap().remove(method);
    }

    async fn handle_request(&self, topic: String, payload: Vec<u8>) {
        debug!("received RRPC request on topic: {topic}");

        let Some(request_id) = extract_request_id(&self.request_prefix, &topic) else {
            warn!("failed to extract request id from topic: {topic}");
            return;
        };

        let request: RrpcRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("failed to parse RRPC request: {e}");
                self.send_response(&request_id, error_response(400, "Invalid JSON format"))
                    .await;
                return;
            }
        };

        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&request.method).cloned()
        };
        let Some(handler) = handler else {
            warn!("no handler registered for method: {}", request.method);
            self.send_response(
                &request_id,
                error_response(404, format!("Method '{}' not found", request.method)),
            )
            .await;
            return;
        };

        match handler(request_id.clone(), payload).await {
            Ok(data) => {
                self.send_response(&request_id, success_response(&data)).await;
            }
            Err(e) => {
                warn!("RRPC handler returned error: {e}");
                self.send_response(&request_id, error_response(500, e.to_string()))
                    .await;
            }
        }
    }

    async fn send_response(&self, request_id: &str, response: RrpcResponse) {
        let topic = topics::rrpc_response(&self.product_key, &self.device_name, request_id);
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize RRPC response: {e}");
                return;
            }
        };
        if let Err(e) = self
            .session
            .publish(&topic, payload, QoS::AtMostOnce, false)
            .await
        {
            warn!("failed to publish RRPC response: {e}");
            return;
        }
        debug!("sent RRPC response to topic: {topic}");
    }

    /// Outbound RRPC: publish a request and await the correlated
    /// response within `timeout`.
    pub async fn call(
        &self,
        method: &str,
        params: HashMap<String, Value>,
        timeout: Duration,
    ) -> Result<RrpcResponse> {
        let request_id = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();

        let request = RrpcRequest {
            id: request_id.clone(),
            version: "1.0".to_string(),
            params,
            method: method.to_string(),
        };
        let payload = serde_json::to_vec(&request)?;

        let request_topic =
            topics::rrpc_request(&self.product_key, &self.device_name, &request_id);
        let response_topic =
            topics::rrpc_response(&self.product_key, &self.device_name, &request_id);

        let (tx, rx) = oneshot::channel::<RrpcResponse>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        self.session
            .subscribe(
                &response_topic,
                QoS::AtMostOnce,
                message_handler(move |_topic, payload| {
                    let tx = tx.clone();
                    async move {
                        let Ok(response) = serde_json::from_slice::<RrpcResponse>(&payload)
                        else {
                            warn!("failed to parse RRPC response payload");
                            return;
                        };
                        if let Some(tx) = tx.lock().unwrap().take() {
                            let _ = tx.send(response);
                        }
                    }
                }),
            )
            .await?;

        let result = async {
            self.session
                .publish(&request_topic, payload, QoS::AtMostOnce, false)
                .await?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(Error::protocol("response channel closed")),
                Err(_) => Err(Error::timeout(format!(
                    "RRPC call timed out after {timeout:?}"
                ))),
            }
        }
        .await;

        let _ = self.session.unsubscribe(&response_topic).await;
        result
    }
}

fn extract_request_id(prefix: &str, topic: &str) -> Option<String> {
    topic
        .strip_prefix(prefix)
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .map(|id| id.to_string())
}

/// Wrap handler output: valid JSON objects embed as `data`, anything
/// else becomes `{"result": <text>}`.
fn success_response(data: &[u8]) -> RrpcResponse {
    let data = if data.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(data) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => Some(serde_json::json!({
                "result": String::from_utf8_lossy(data),
            })),
        }
    };
    RrpcResponse {
        id: "1".to_string(),
        version: "1.0".to_string(),
        code: Some(200),
        data,
        message: None,
    }
}

fn error_response(code: i32, message: impl Into<String>) -> RrpcResponse {
    RrpcResponse {
        id: "1".to_string(),
        version: "1.0".to_string(),
        code: Some(code),
        data: None,
        message: Some(message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_request_id() {
        let prefix = topics::rrpc_request_prefix("A", "b");
        assert_eq!(
            extract_request_id(&prefix, "/sys/A/b/rrpc/request/R1"),
            Some("R1".to_string())
        );
        assert_eq!(extract_request_id(&prefix, "/sys/A/b/rrpc/request/"), None);
        assert_eq!(
            extract_request_id(&prefix, "/sys/A/b/rrpc/response/R1"),
            None
        );
    }

    #[test]
    fn test_unknown_method_response_shape() {
        let response = error_response(404, "Method 'Nope' not found");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "1",
                "version": "1.0",
                "code": 404,
                "message": "Method 'Nope' not found",
            })
        );
    }

    #[test]
    fn test_invalid_json_response_shape() {
        let response = error_response(400, "Invalid JSON format");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["code"], 400);
        assert_eq!(value["message"], "Invalid JSON format");
    }

    #[test]
    fn test_success_wraps_json_object_as_data() {
        let response = success_response(br#"{"LightSwitch": 0}"#);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["code"], 200);
        assert_eq!(value["data"]["LightSwitch"], 0);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_success_wraps_plain_text_as_result() {
        let response = success_response(b"pong");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["data"]["result"], "pong");
    }

    #[test]
    fn test_success_with_empty_payload_has_no_data() {
        let response = success_response(b"");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["code"], 200);
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_request_round_trip() {
        let request = RrpcRequest {
            id: "42".to_string(),
            version: "1.0".to_string(),
            params: HashMap::from([("key".to_string(), json!("value"))]),
            method: "Echo".to_string(),
        };
        let text = serde_json::to_string(&request).unwrap();
        let back: RrpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, "Echo");
        assert_eq!(back.params["key"], "value");
    }

    #[test]
    fn test_response_round_trip() {
        let response = success_response(br#"{"answer": 42}"#);
        let text = serde_json::to_string(&response).unwrap();
        let back: RrpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(back.code, Some(200));
        assert_eq!(back.data.unwrap()["answer"], 42);
        assert_eq!(back.version, "1.0");
    }

    #[test]
    fn test_request_with_missing_fields_parses() {
        let back: RrpcRequest =
            serde_json::from_str(r#"{"method":"Nope","params":{}}"#).unwrap();
        assert_eq!(back.method, "Nope");
        assert!(back.id.is_empty());
    }
}

//! Device abstraction and Thing-Model records.
//!
//! Applications implement [`Device`] for each physical or simulated
//! device. Every callback has a default no-op so implementors override
//! only what they need.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Device identification information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub product_key: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl DeviceInfo {
    pub fn new(product_key: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: device_name.into(),
            ..Default::default()
        }
    }

    /// The framework-wide device identifier, `{product_key}.{device_name}`.
    pub fn device_id(&self) -> String {
        format!("{}.{}", self.product_key, self.device_name)
    }
}

/// A single property write arriving from the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub name: String,
    pub value: Value,
}

/// A service invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceRequest {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        params: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            params,
            timestamp: Utc::now(),
        }
    }
}

/// A service invocation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Name of the service that produced this response, used to derive
    /// the reply topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceResponse {
    /// A successful response with no payload.
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: 0,
            data: Value::Null,
            message: None,
            service: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: -1,
            data: Value::Null,
            message: Some(message.into()),
            service: None,
            timestamp: Utc::now(),
        }
    }
}

/// A device-generated business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub name: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// A firmware task forwarded to the device callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareNotice {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub url: String,
    pub size: u64,
    pub sign: String,
    pub sign_method: String,
}

/// An IoT device managed by the framework.
///
/// Callbacks run concurrently across event-bus workers but are never
/// re-entered for the same event.
#[async_trait]
pub trait Device: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    /// Called once when the framework starts (or on registration if the
    /// framework is already running).
    async fn on_initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the agent's broker session comes up.
    async fn on_connect(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the agent's broker session goes down.
    async fn on_disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Called during unregistration or framework stop.
    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Called for each property the cloud writes.
    async fn on_property_set(&self, _update: PropertyUpdate) -> Result<()> {
        Ok(())
    }

    /// Called when a property value is requested.
    async fn on_property_get(&self, _name: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Called when the cloud invokes a service no registered handler
    /// claimed. Returning an error passes the request to the next device.
    async fn on_service_invoke(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        Ok(ServiceResponse::ok(request.id))
    }

    /// Called when a business event is routed to this device.
    async fn on_event_receive(&self, _event: DeviceEvent) -> Result<()> {
        Ok(())
    }

    /// Called when a firmware task targets this device.
    async fn on_ota_notify(&self, _notice: FirmwareNotice) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_id() {
        let info = DeviceInfo::new("A", "b");
        assert_eq!(info.device_id(), "A.b");
    }

    #[test]
    fn test_service_round_trip() {
        let mut params = HashMap::new();
        params.insert("target".to_string(), json!(200));
        let request = ServiceRequest::new("s7", "toggle_door", params);
        let text = serde_json::to_string(&request).unwrap();
        let back: ServiceRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "s7");
        assert_eq!(back.service, "toggle_door");
        assert_eq!(back.params["target"], 200);

        let response = ServiceResponse::ok("s7").with_data(json!({"door": "open"}));
        let text = serde_json::to_string(&response).unwrap();
        let back: ServiceResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(back.code, 0);
        assert_eq!(back.data["door"], "open");
        assert!(back.message.is_none());
    }

    #[test]
    fn test_failure_response() {
        let response = ServiceResponse::failure("s1", "no handler");
        assert_eq!(response.code, -1);
        assert_eq!(response.message.as_deref(), Some("no handler"));
    }
}

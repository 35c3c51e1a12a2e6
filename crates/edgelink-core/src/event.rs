//! Event model for the framework.
//!
//! Events carry a type from a closed taxonomy, an opaque JSON payload,
//! and free-form metadata. Handlers are async function objects compared
//! by pointer identity for removal.

use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Closed event-type taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `system.connected`: the MQTT session came up.
    Connected,
    /// `system.disconnected`: the MQTT session went down.
    Disconnected,
    /// `system.error`: an internal failure worth surfacing.
    SystemError,
    /// `system.ready`: framework start completed.
    Ready,

    /// `property.set`: the cloud wrote one or more properties.
    PropertySet,
    /// `property.get`: the cloud requested a property value.
    PropertyGet,
    /// `property.report`: the device reports properties upward.
    PropertyReport,

    /// `event.report`: a device business event should go to the cloud.
    EventReport,

    /// `service.call`: the cloud invoked a service.
    ServiceCall,
    /// `service.response`: a service produced its response.
    ServiceResponse,

    /// `ota.notify`: a firmware task arrived.
    OtaNotify,
    /// `ota.progress`: download/upgrade progress.
    OtaProgress,
    /// `ota.complete`: an update finished.
    OtaComplete,
    /// `ota.failed`: an update failed.
    OtaFailed,
    /// `ota.status_changed`: the OTA state machine moved.
    OtaStatusChanged,
    /// `ota.check_update`: command: query for updates now.
    OtaCheckUpdate,
    /// `ota.perform_update`: command: apply a known update.
    OtaPerformUpdate,

    /// `device.online`
    DeviceOnline,
    /// `device.offline`
    DeviceOffline,
    /// `device.registered`
    DeviceRegistered,
    /// `device.unregistered`
    DeviceUnregistered,
    /// `device.update`
    DeviceUpdate,

    /// `custom`: application-defined payloads.
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "system.connected",
            EventType::Disconnected => "system.disconnected",
            EventType::SystemError => "system.error",
            EventType::Ready => "system.ready",
            EventType::PropertySet => "property.set",
            EventType::PropertyGet => "property.get",
            EventType::PropertyReport => "property.report",
            EventType::EventReport => "event.report",
            EventType::ServiceCall => "service.call",
            EventType::ServiceResponse => "service.response",
            EventType::OtaNotify => "ota.notify",
            EventType::OtaProgress => "ota.progress",
            EventType::OtaComplete => "ota.complete",
            EventType::OtaFailed => "ota.failed",
            EventType::OtaStatusChanged => "ota.status_changed",
            EventType::OtaCheckUpdate => "ota.check_update",
            EventType::OtaPerformUpdate => "ota.perform_update",
            EventType::DeviceOnline => "device.online",
            EventType::DeviceOffline => "device.offline",
            EventType::DeviceRegistered => "device.registered",
            EventType::DeviceUnregistered => "device.unregistered",
            EventType::DeviceUpdate => "device.update",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let t = match s {
            "system.connected" => EventType::Connected,
            "system.disconnected" => EventType::Disconnected,
            "system.error" => EventType::SystemError,
            "system.ready" => EventType::Ready,
            "property.set" => EventType::PropertySet,
            "property.get" => EventType::PropertyGet,
            "property.report" => EventType::PropertyReport,
            "event.report" => EventType::EventReport,
            "service.call" => EventType::ServiceCall,
            "service.response" => EventType::ServiceResponse,
            "ota.notify" => EventType::OtaNotify,
            "ota.progress" => EventType::OtaProgress,
            "ota.complete" => EventType::OtaComplete,
            "ota.failed" => EventType::OtaFailed,
            "ota.status_changed" => EventType::OtaStatusChanged,
            "ota.check_update" => EventType::OtaCheckUpdate,
            "ota.perform_update" => EventType::OtaPerformUpdate,
            "device.online" => EventType::DeviceOnline,
            "device.offline" => EventType::DeviceOffline,
            "device.registered" => EventType::DeviceRegistered,
            "device.unregistered" => EventType::DeviceUnregistered,
            "device.update" => EventType::DeviceUpdate,
            "custom" => EventType::Custom,
            other => {
                return Err(crate::error::Error::protocol(format!(
                    "unknown event type: {other}"
                )))
            }
        };
        Ok(t)
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A system or business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing nanosecond-timestamp identifier.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: now.timestamp_nanos_opt().unwrap_or_default().to_string(),
            event_type,
            source: source.into(),
            timestamp: now,
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The future an event handler returns.
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// An event handler as a shareable async function object.
///
/// Handlers are compared by `Arc` pointer identity for unsubscription, so
/// keep the value returned by [`handler`] if removal is needed later.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_round_trip() {
        for t in [
            EventType::Connected,
            EventType::PropertySet,
            EventType::ServiceCall,
            EventType::OtaStatusChanged,
            EventType::DeviceRegistered,
            EventType::Custom,
        ] {
            let parsed: EventType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert!("nope.nope".parse::<EventType>().is_err());
    }

    #[test]
    fn test_event_ids_increase() {
        let a = Event::new(EventType::Ready, "test", json!(null));
        let b = Event::new(EventType::Ready, "test", json!(null));
        assert!(b.id.parse::<i64>().unwrap() >= a.id.parse::<i64>().unwrap());
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = Event::new(EventType::PropertyReport, "framework", json!({"temp": 21}))
            .with_metadata("messageId", json!("m1"));
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_type, EventType::PropertyReport);
        assert_eq!(back.data["temp"], 21);
        assert_eq!(back.metadata["messageId"], "m1");
    }
}

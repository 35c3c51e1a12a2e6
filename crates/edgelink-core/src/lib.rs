//! EdgeLink framework core.
//!
//! The core crate owns the pieces every agent shares: the configuration
//! model, the unified error type, the typed event bus with its worker
//! pool, the dependency-ordered plugin manager, the device abstraction,
//! and the framework that wires them together.
//!
//! Connectivity (MQTT, RRPC, dynamic registration) lives in
//! `edgelink-mqtt`; the OTA engine lives in `edgelink-ota`.

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod framework;
pub mod plugin;

pub use bus::EventBus;
pub use config::{AdvancedSettings, Config, DeviceSettings, MqttSettings, TlsSettings};
pub use device::{
    Device, DeviceEvent, DeviceInfo, FirmwareNotice, PropertyUpdate, ServiceRequest,
    ServiceResponse,
};
pub use error::{Error, Result};
pub use event::{handler, Event, EventHandler, EventType};
pub use framework::{
    ConnectionState, Framework, LifecycleState, PropertyGetter, PropertySetter, ServiceHandler,
};
pub use plugin::{Plugin, PluginManager};

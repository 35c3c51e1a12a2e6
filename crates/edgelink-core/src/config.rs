//! Agent configuration.
//!
//! Settings are grouped by concern (device identity, MQTT transport, TLS,
//! advanced tuning) and can be loaded from the `IOT_*` environment
//! variables. Validation happens before the first connect attempt.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Device identity configuration.
///
/// A device is identified by the (ProductKey, DeviceName, DeviceSecret)
/// triple; (ProductKey, ProductSecret) identifies a product for dynamic
/// registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub product_key: String,
    pub device_name: String,
    #[serde(default)]
    pub device_secret: String,
    #[serde(default)]
    pub product_secret: String,
}

impl DeviceSettings {
    /// The broker-unique device identifier, `{product_key}.{device_name}`.
    ///
    /// Two concurrent sessions with the same identifier kick each other
    /// off the broker in a loop; operators must never run duplicates.
    pub fn device_id(&self) -> String {
        format!("{}.{}", self.product_key, self.device_name)
    }
}

/// MQTT transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Override for the secure-mode tag in the ClientID. Empty means
    /// derive from `use_tls` ("2" with TLS, "3" without).
    #[serde(default)]
    pub secure_mode: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            keep_alive_secs: 60,
            clean_session: true,
            secure_mode: String::new(),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Path to an additional CA certificate in PEM format.
    #[serde(default)]
    pub ca_cert: String,
    /// Disable server certificate verification.
    #[serde(default)]
    pub skip_verify: bool,
    /// Expected server name when connecting by IP.
    #[serde(default)]
    pub server_name: String,
}

/// Advanced tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    /// Event-bus worker count.
    pub worker_count: usize,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self { worker_count: 10 }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceSettings,
    pub mqtt: MqttSettings,
    pub tls: TlsSettings,
    pub advanced: AdvancedSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from the `IOT_*` environment variables, keeping
    /// existing values for any variable that is unset or unparsable.
    pub fn load_from_env(&mut self) {
        if let Ok(val) = std::env::var("IOT_PRODUCT_KEY") {
            if !val.is_empty() {
                self.device.product_key = val;
            }
        }
        if let Ok(val) = std::env::var("IOT_DEVICE_NAME") {
            if !val.is_empty() {
                self.device.device_name = val;
            }
        }
        if let Ok(val) = std::env::var("IOT_DEVICE_SECRET") {
            if !val.is_empty() {
                self.device.device_secret = val;
            }
        }
        if let Ok(val) = std::env::var("IOT_PRODUCT_SECRET") {
            if !val.is_empty() {
                self.device.product_secret = val;
            }
        }

        if let Ok(val) = std::env::var("IOT_MQTT_HOST") {
            if !val.is_empty() {
                self.mqtt.host = val;
            }
        }
        if let Ok(val) = std::env::var("IOT_MQTT_PORT") {
            if let Ok(port) = val.parse() {
                self.mqtt.port = port;
            }
        }
        if let Ok(val) = std::env::var("IOT_MQTT_USE_TLS") {
            if let Ok(use_tls) = val.parse() {
                self.mqtt.use_tls = use_tls;
            }
        }
        if let Ok(val) = std::env::var("IOT_MQTT_KEEPALIVE") {
            if let Ok(keep_alive) = val.parse() {
                self.mqtt.keep_alive_secs = keep_alive;
            }
        }
        if let Ok(val) = std::env::var("IOT_MQTT_SECURE_MODE") {
            if !val.is_empty() {
                self.mqtt.secure_mode = val;
            }
        }

        if let Ok(val) = std::env::var("IOT_TLS_CA_CERT") {
            if !val.is_empty() {
                self.tls.ca_cert = val;
            }
        }
        if let Ok(val) = std::env::var("IOT_TLS_SKIP_VERIFY") {
            if let Ok(skip) = val.parse() {
                self.tls.skip_verify = skip;
            }
        }
    }

    /// Convenience constructor: defaults overlaid with the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Validate identity and transport settings before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.device.product_key.is_empty() {
            return Err(Error::config("product key is required"));
        }
        if self.device.device_name.is_empty() {
            return Err(Error::config("device name is required"));
        }
        if self.device.device_secret.is_empty() && self.device.product_secret.is_empty() {
            return Err(Error::config(
                "either device secret or product secret is required",
            ));
        }
        if self.mqtt.host.is_empty() {
            return Err(Error::config("MQTT host is required"));
        }
        if self.mqtt.port == 0 {
            return Err(Error::config("MQTT port must be between 1 and 65535"));
        }
        Ok(())
    }

    /// The secure-mode tag used in the ClientID: an explicit override if
    /// configured, otherwise "2" with TLS and "3" without.
    pub fn secure_mode(&self) -> &str {
        if !self.mqtt.secure_mode.is_empty() {
            return &self.mqtt.secure_mode;
        }
        if self.mqtt.use_tls {
            "2"
        } else {
            "3"
        }
    }

    /// The broker URL, scheme chosen by the TLS flag.
    pub fn broker_url(&self) -> String {
        let scheme = if self.mqtt.use_tls { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.mqtt.host, self.mqtt.port)
    }
}

//! Dynamic registration over MQTT.
//!
//! A one-shot session authenticated with the product secret obtains the
//! device secret. No manual subscribe happens: the server pushes the
//! result on `/ext/register/{pk}/{dn}` as soon as the CONNECT is
//! accepted. The response arrives either unwrapped
//! (`{"deviceSecret":"…"}`) or wrapped
//! (`{"code":…,"data":{…},"message":…,"requestId":…}`); both shapes are
//! accepted.

use crate::credentials::{dynreg_credentials, AuthType};
use crate::tls;
use edgelink_core::config::Config;
use edgelink_core::error::{Error, Result};
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, Transport};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registration outcome pushed by the server.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynRegResult {
    #[serde(default)]
    pub device_secret: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedResponse {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    data: DynRegResult,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
}

/// One-shot MQTT dynamic-registration client.
pub struct MqttDynReg {
    config: Config,
}

impl MqttDynReg {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Register the device and wait up to `timeout` for the pushed
    /// result. `skip_pre_regist` selects `regnwl` (non-whitelist) over
    /// `register` (whitelist).
    pub async fn register(&self, skip_pre_regist: bool, timeout: Duration) -> Result<DynRegResult> {
        if self.config.device.product_secret.is_empty() {
            return Err(Error::config(
                "product secret is required for MQTT dynamic registration",
            ));
        }

        let auth_type = if skip_pre_regist {
            AuthType::NoWhitelist
        } else {
            AuthType::Register
        };
        // Random nonce, ten digits max, distinct from the fixed
        // steady-state timestamp.
        let random = rand::thread_rng().gen_range(0..10_000_000_000u64).to_string();

        let credentials = dynreg_credentials(
            &self.config.device.product_key,
            &self.config.device.device_name,
            &self.config.device.product_secret,
            &random,
            auth_type,
        );
        debug!(
            "dynamic registration connecting with client id: {}",
            credentials.client_id
        );

        let mut options = MqttOptions::new(
            credentials.client_id,
            &self.config.mqtt.host,
            self.config.mqtt.port,
        );
        options.set_credentials(credentials.username, credentials.password);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        if self.config.mqtt.use_tls {
            options.set_transport(Transport::Tls(tls::tls_configuration(&self.config.tls)?));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let expected_topic = crate::topics::dynreg_response(
            &self.config.device.product_key,
            &self.config.device.device_name,
        );

        let deadline = Instant::now() + timeout;
        let result = loop {
            let event = match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                Ok(event) => event,
                Err(_) => {
                    break Err(Error::timeout(format!(
                        "dynamic registration timeout after {timeout:?}"
                    )))
                }
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("connected for dynamic registration, waiting for push");
                    } else {
                        break Err(Error::auth(format!(
                            "broker refused dynamic registration connect: {:?}",
                            ack.code
                        )));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != expected_topic {
                        debug!("ignoring message on topic {}", publish.topic);
                        continue;
                    }
                    break parse_response(&publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    break Err(Error::transport(format!(
                        "dynamic registration connection failed: {e}"
                    )))
                }
            }
        };

        let _ = client.disconnect().await;
        result
    }
}

/// Accept both the unwrapped and wrapped response shapes.
fn parse_response(payload: &[u8]) -> Result<DynRegResult> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| Error::protocol(format!("invalid registration response: {e}")))?;

    if value.get("data").is_some() || value.get("code").is_some() {
        let wrapped: WrappedResponse = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("invalid registration response: {e}")))?;
        // Some servers answer 0 for success instead of 200.
        if wrapped.code != 200 && wrapped.code != 0 {
            return Err(Error::auth(format!(
                "dynamic registration failed: code={}, message={}, requestId={}",
                wrapped.code, wrapped.message, wrapped.request_id
            )));
        }
        info!("dynamic registration succeeded");
        return Ok(wrapped.data);
    }

    let direct: DynRegResult = serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("invalid registration response: {e}")))?;
    if direct.device_secret.is_empty() && direct.password.is_empty() {
        warn!("registration response carried no secret");
    } else {
        info!("dynamic registration succeeded");
    }
    Ok(direct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unwrapped_response() {
        let result = parse_response(br#"{"deviceSecret":"abc123"}"#).unwrap();
        assert_eq!(result.device_secret, "abc123");
    }

    #[test]
    fn test_parse_wrapped_response() {
        let payload = br#"{
            "code": 200,
            "data": {"deviceSecret": "xyz", "clientId": "c", "username": "u", "password": "p"},
            "message": "success",
            "requestId": "r-1"
        }"#;
        let result = parse_response(payload).unwrap();
        assert_eq!(result.device_secret, "xyz");
        assert_eq!(result.client_id, "c");
    }

    #[test]
    fn test_parse_wrapped_zero_code_is_success() {
        let payload = br#"{"code": 0, "data": {"deviceSecret": "s"}}"#;
        let result = parse_response(payload).unwrap();
        assert_eq!(result.device_secret, "s");
    }

    #[test]
    fn test_parse_wrapped_failure_code() {
        let payload = br#"{"code": 403, "data": {}, "message": "denied"}"#;
        let err = parse_response(payload).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            parse_response(b"not json"),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_register_requires_product_secret() {
        let mut config = Config::new();
        config.device.product_key = "pk".to_string();
        config.device.device_name = "dn".to_string();
        let client = MqttDynReg::new(config);
        let err = client
            .register(false, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

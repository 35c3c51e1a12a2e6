//! Broker credential derivation.
//!
//! Credentials are pure functions of the device identity: the same
//! inputs always produce byte-identical output, which the C SDK on the
//! other side of the broker depends on. The timestamp in the ClientID is
//! a fixed constant, not wall-clock time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed timestamp baked into the steady-state ClientID (C-SDK parity).
pub const AUTH_TIMESTAMP: &str = "2524608000000";

/// SDK version tag carried in the ClientID.
const SDK_VERSION: &str = "sdk-go-4.2.0";

/// A derived credential set for one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Derive the steady-state session credentials.
///
/// `secure_mode` is `"2"` with TLS and `"3"` without (see
/// `Config::secure_mode`).
pub fn mqtt_credentials(
    product_key: &str,
    device_name: &str,
    device_secret: &str,
    secure_mode: &str,
) -> Credentials {
    let client_id = format!(
        "{product_key}.{device_name}|timestamp={AUTH_TIMESTAMP},_ss=1,_v={SDK_VERSION},securemode={secure_mode},signmethod=hmacsha256,ext=3,_conn=tl|"
    );

    let username = format!("{device_name}&{product_key}");

    let sign_content = format!(
        "clientId{product_key}.{device_name}deviceName{device_name}productKey{product_key}timestamp{AUTH_TIMESTAMP}"
    );
    let password = hmac_sha256_hex(&sign_content, device_secret);

    Credentials {
        client_id,
        username,
        password,
    }
}

/// Authentication type for dynamic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Whitelist mode: the device name was pre-registered.
    Register,
    /// Non-whitelist mode.
    NoWhitelist,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Register => "register",
            AuthType::NoWhitelist => "regnwl",
        }
    }
}

/// Derive the one-shot dynamic-registration credentials.
///
/// Unlike the steady-state form, the ClientID leads with the device
/// name, carries a random nonce instead of the fixed timestamp, and the
/// password digest is UPPERCASE hex keyed by the product secret.
pub fn dynreg_credentials(
    product_key: &str,
    device_name: &str,
    product_secret: &str,
    random: &str,
    auth_type: AuthType,
) -> Credentials {
    let client_id = format!(
        "{device_name}.{product_key}|random={random},authType={},securemode=2,signmethod=hmacsha256|",
        auth_type.as_str()
    );

    let username = format!("{device_name}&{product_key}");

    let sign_content =
        format!("deviceName{device_name}productKey{product_key}random{random}");
    let password = hmac_sha256_hex(&sign_content, product_secret).to_uppercase();

    Credentials {
        client_id,
        username,
        password,
    }
}

/// Standalone dynamic-registration signature (payload `sign` field).
pub fn dynreg_signature(
    product_key: &str,
    device_name: &str,
    product_secret: &str,
    random: &str,
) -> String {
    let sign_content =
        format!("deviceName{device_name}productKey{product_key}random{random}");
    hmac_sha256_hex(&sign_content, product_secret).to_uppercase()
}

fn hmac_sha256_hex(data: &str, key: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

//! EdgeLink MQTT connectivity.
//!
//! One authenticated broker session per device, wildcard-aware message
//! routing, the Thing-Model bridge plugin, the RRPC request/response
//! channel, and one-shot dynamic registration.

pub mod credentials;
pub mod dynreg;
pub mod plugin;
pub mod rrpc;
pub mod session;
pub mod tls;
pub mod topics;

pub use credentials::{dynreg_credentials, mqtt_credentials, AuthType, Credentials};
pub use dynreg::{DynRegResult, MqttDynReg};
pub use plugin::MqttPlugin;
pub use rrpc::{request_handler, RequestHandler, RrpcClient, RrpcRequest, RrpcResponse};
pub use session::{message_handler, MessageHandler, MqttSession};
pub use topics::matches_filter;

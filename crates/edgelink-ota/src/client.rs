//! Low-level OTA wire client.
//!
//! Subscribes the firmware push and query-reply topics, publishes
//! version/progress/query messages, and downloads firmware images.
//! `simple_download` is the preferred path: one GET with a long
//! timeout, read to the end, then size and digest checks. The ranged
//! `download` keeps the observed false-EOF workaround and is retained
//! as a secondary strategy.

use crate::types::{DigestMethod, RecvKind, TaskDesc};
use edgelink_core::error::{Error, Result};
use edgelink_mqtt::session::MqttSession;
use edgelink_mqtt::{message_handler, topics};
use futures::future::BoxFuture;
use futures::StreamExt;
use md5::Md5;
use rumqttc::QoS;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for the single-shot download. Firmware images can be large
/// and links slow; the digest check catches truncation anyway.
const SIMPLE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Timeout for the ranged download path.
const RANGED_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Callback invoked when a firmware task arrives.
pub type RecvHandler = Arc<dyn Fn(RecvKind, TaskDesc) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`RecvHandler`].
pub fn recv_handler<F, Fut>(f: F) -> RecvHandler
where
    F: Fn(RecvKind, TaskDesc) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |kind, task| Box::pin(f(kind, task)))
}

/// Per-chunk progress callback: `(percent, error message)`. Negative
/// percents carry the wire progress codes.
pub type DownloadHandler = Arc<dyn Fn(i32, Option<String>) + Send + Sync>;

/// OTA wire client bound to one device identity on the shared session.
pub struct OtaClient {
    session: Arc<MqttSession>,
    product_key: String,
    device_name: String,
    recv_handler: RwLock<Option<RecvHandler>>,
    download_handler: RwLock<Option<DownloadHandler>>,
    current_version: RwLock<String>,
}

impl OtaClient {
    pub fn new(
        session: Arc<MqttSession>,
        product_key: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            product_key: product_key.into(),
            device_name: device_name.into(),
            recv_handler: RwLock::new(None),
            download_handler: RwLock::new(None),
            current_version: RwLock::new(String::new()),
        })
    }

    pub fn set_recv_handler(&self, handler: RecvHandler) {
        *self.recv_handler.write().unwrap() = Some(handler);
    }

    pub fn set_download_handler(&self, handler: DownloadHandler) {
        *self.download_handler.write().unwrap() = Some(handler);
    }

    /// Subscribe the firmware push and query-reply topics.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let fota_topic = topics::ota_upgrade(&self.product_key, &self.device_name);
        let reply_topic = topics::firmware_get_reply(&self.product_key, &self.device_name);

        for topic in [&fota_topic, &reply_topic] {
            let this = self.clone();
            self.session
                .subscribe(
                    topic,
                    QoS::AtMostOnce,
                    message_handler(move |topic, payload| {
                        let this = this.clone();
                        async move {
                            this.handle_message(topic, payload).await;
                        }
                    }),
                )
                .await?;
        }

        info!(
            "OTA client started, subscribed to {fota_topic} and {reply_topic}"
        );
        Ok(())
    }

    /// Unsubscribe the OTA topics.
    pub async fn stop(&self) -> Result<()> {
        let fota_topic = topics::ota_upgrade(&self.product_key, &self.device_name);
        let reply_topic = topics::firmware_get_reply(&self.product_key, &self.device_name);
        self.session.unsubscribe(&fota_topic).await.ok();
        self.session.unsubscribe(&reply_topic).await.ok();
        Ok(())
    }

    /// Report the current version with the default module.
    pub async fn report_version(&self, version: &str) -> Result<()> {
        self.report_version_with_module(version, "default").await
    }

    /// Report the current version for a module. The module key is
    /// omitted entirely when empty (C-SDK parity).
    pub async fn report_version_with_module(&self, version: &str, module: &str) -> Result<()> {
        *self.current_version.write().unwrap() = version.to_string();

        let topic = topics::ota_inform(&self.product_key, &self.device_name);
        let payload = version_report_payload(version, module);
        self.session
            .publish(&topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
            .await?;

        if module.is_empty() {
            info!("reported version: {version}");
        } else {
            info!("reported version: {version} (module: {module})");
        }
        Ok(())
    }

    /// Report download/upgrade progress.
    pub async fn report_progress(
        &self,
        step: &str,
        desc: &str,
        progress: i32,
        module: &str,
    ) -> Result<()> {
        let topic = topics::ota_progress(&self.product_key, &self.device_name);
        let payload = progress_report_payload(step, desc, progress, module);
        self.session
            .publish(&topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
            .await
    }

    /// Query for firmware without targeting a module.
    pub async fn query_firmware(&self) -> Result<()> {
        self.query_firmware_with_module("").await
    }

    /// Query for firmware. `params` carries `module` when non-empty;
    /// the platform only answers with module-targeted payloads when
    /// it is present.
    pub async fn query_firmware_with_module(&self, module: &str) -> Result<()> {
        let topic = topics::firmware_get(&self.product_key, &self.device_name);
        let payload = firmware_query_payload(module);
        self.session
            .publish(&topic, serde_json::to_vec(&payload)?, QoS::AtMostOnce, false)
            .await?;

        if module.is_empty() {
            info!("queried for firmware updates");
        } else {
            info!("queried for firmware updates (module: {module})");
        }
        Ok(())
    }

    async fn handle_message(&self, topic: String, payload: Vec<u8>) {
        debug!("received OTA message on topic {topic}");

        let msg: Value = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to parse OTA message: {e}");
                return;
            }
        };

        let is_query_reply = topic.contains("/thing/ota/firmware/get_reply");
        let task = TaskDesc::parse(&self.product_key, &self.device_name, &msg);
        let Some(task) = task else {
            if is_query_reply {
                debug!("no firmware update available");
            } else {
                warn!("failed to parse OTA task description");
            }
            return;
        };

        let kind = if is_query_reply {
            RecvKind::Fota
        } else {
            RecvKind::classify(&topic)
        };

        let handler = self.recv_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(kind, task).await;
        }
    }

    /// Single-shot download: GET, read to end, check size, check digest.
    pub async fn simple_download(&self, task: &TaskDesc) -> Result<Vec<u8>> {
        info!("starting simple download from {}", task.url);

        let client = reqwest::Client::builder()
            .timeout(SIMPLE_DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;

        let response = client
            .get(&task.url)
            .header("Accept", "*/*")
            .header("User-Agent", "EdgeLink-OTA/1.0")
            .send()
            .await
            .map_err(|e| Error::ota(format!("failed to download: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::ota(format!(
                "unexpected status code: {}",
                response.status().as_u16()
            )));
        }
        debug!(
            "response status {}, content-length {:?}",
            response.status(),
            response.content_length()
        );

        let data = response
            .bytes()
            .await
            .map_err(|e| Error::ota(format!("failed to read response: {e}")))?
            .to_vec();
        info!("downloaded {} bytes", data.len());

        if data.len() as u64 != task.size {
            return Err(Error::ota(format!(
                "size mismatch: got {} bytes, expected {} bytes",
                data.len(),
                task.size
            )));
        }

        verify_digest(task.digest_method, &task.expect_digest, &data)?;
        info!("download successful, digest verified");
        Ok(data)
    }

    /// Ranged download with per-percent progress callbacks.
    ///
    /// A stream end before the expected size gets one retry after
    /// 100 ms; a second EOF surfaces as download-incomplete. Partial
    /// (ranged) downloads skip the digest check; the caller verifies
    /// the assembled file.
    pub async fn download(
        &self,
        task: &TaskDesc,
        range_start: u64,
        range_end: u64,
    ) -> Result<Vec<u8>> {
        let client = reqwest::Client::builder()
            .timeout(RANGED_DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;

        let mut request = client
            .get(&task.url)
            .header("Accept", "*/*")
            .header("User-Agent", "EdgeLink-OTA/1.0");
        let is_partial = range_start > 0 || range_end > 0;
        if range_end > 0 {
            request = request.header("Range", format!("bytes={range_start}-{range_end}"));
        } else if range_start > 0 {
            request = request.header("Range", format!("bytes={range_start}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ota(format!("failed to download: {e}")))?;
        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Err(Error::ota(format!("unexpected status code: {status}")));
        }

        let mut total = if range_end > 0 && range_start <= range_end {
            range_end - range_start + 1
        } else {
            task.size
        };
        if let Some(len) = response.content_length() {
            if len > 0 {
                total = len;
            }
        }

        let mut data: Vec<u8> = Vec::with_capacity(total as usize);
        let mut last_percent = -1i32;
        let mut stream = response.bytes_stream();
        let mut retried = false;

        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    data.extend_from_slice(&chunk);
                    let percent = ((data.len() as u64 * 100) / total.max(1)).min(100) as i32;
                    if percent != last_percent {
                        last_percent = percent;
                        self.notify_download(percent, None);
                    }
                }
                Some(Err(e)) => {
                    self.notify_download(
                        crate::types::progress_code::UPGRADE_FAILED,
                        Some(e.to_string()),
                    );
                    return Err(Error::ota(format!("failed to read response: {e}")));
                }
                None => {
                    if (data.len() as u64) < total && !retried {
                        // A false EOF before the full size was observed
                        // in the field; give the stream one more chance.
                        warn!(
                            "EOF at {} of {} bytes, retrying once",
                            data.len(),
                            total
                        );
                        retried = true;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        if (data.len() as u64) < total {
            let message = format!(
                "download incomplete: got {} bytes, expected {} bytes",
                data.len(),
                total
            );
            self.notify_download(
                crate::types::progress_code::DOWNLOAD_FAILED,
                Some(message.clone()),
            );
            return Err(Error::ota(message));
        }

        if !is_partial {
            if let Err(e) = verify_digest(task.digest_method, &task.expect_digest, &data) {
                self.notify_download(
                    crate::types::progress_code::VERIFY_FAILED,
                    Some(e.to_string()),
                );
                return Err(e);
            }
        }

        self.notify_download(100, None);
        Ok(data)
    }

    fn notify_download(&self, percent: i32, error: Option<String>) {
        let handler = self.download_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(percent, error);
        }
    }
}

/// Verify a firmware digest, lowercase hex on both sides.
pub fn verify_digest(method: DigestMethod, expected: &str, data: &[u8]) -> Result<()> {
    let digest = compute_digest(method, data);
    if digest != expected.to_lowercase() {
        return Err(Error::ota(format!(
            "digest mismatch: expected {expected}, got {digest}"
        )));
    }
    Ok(())
}

pub fn compute_digest(method: DigestMethod, data: &[u8]) -> String {
    match method {
        DigestMethod::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        DigestMethod::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
    }
}

fn message_id() -> String {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}

fn version_report_payload(version: &str, module: &str) -> Value {
    let mut params = json!({ "version": version });
    if !module.is_empty() {
        params["module"] = json!(module);
    }
    json!({ "id": message_id(), "params": params })
}

fn progress_report_payload(step: &str, desc: &str, progress: i32, module: &str) -> Value {
    let mut params = json!({ "step": step, "desc": desc, "progress": progress });
    if !module.is_empty() {
        params["module"] = json!(module);
    }
    json!({ "id": message_id(), "params": params })
}

fn firmware_query_payload(module: &str) -> Value {
    let params = if module.is_empty() {
        json!({})
    } else {
        json!({ "module": module })
    };
    json!({ "id": message_id(), "version": "1.0", "params": params })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_report_payload_omits_empty_module() {
        let payload = version_report_payload("1.0.0", "default");
        assert_eq!(payload["params"]["version"], "1.0.0");
        assert_eq!(payload["params"]["module"], "default");

        let payload = version_report_payload("1.0.0", "");
        assert_eq!(payload["params"]["version"], "1.0.0");
        assert!(payload["params"].get("module").is_none());
    }

    #[test]
    fn test_progress_report_payload() {
        let payload = progress_report_payload("download", "Downloading", 50, "arm");
        assert_eq!(payload["params"]["step"], "download");
        assert_eq!(payload["params"]["progress"], 50);
        assert_eq!(payload["params"]["module"], "arm");

        let payload = progress_report_payload("download", "failed", -3, "");
        assert_eq!(payload["params"]["progress"], -3);
        assert!(payload["params"].get("module").is_none());
    }

    #[test]
    fn test_firmware_query_payload() {
        let payload = firmware_query_payload("arm64");
        assert_eq!(payload["version"], "1.0");
        assert_eq!(payload["params"]["module"], "arm64");

        let payload = firmware_query_payload("");
        assert_eq!(payload["params"], json!({}));
    }

    #[test]
    fn test_digest_verification() {
        // MD5 of the empty string.
        assert!(verify_digest(
            DigestMethod::Md5,
            "d41d8cd98f00b204e9800998ecf8427e",
            b""
        )
        .is_ok());
        // Uppercase expected digests are accepted.
        assert!(verify_digest(
            DigestMethod::Md5,
            "D41D8CD98F00B204E9800998ECF8427E",
            b""
        )
        .is_ok());
        assert!(verify_digest(DigestMethod::Md5, "00000000", b"data").is_err());

        let sha = compute_digest(DigestMethod::Sha256, b"firmware");
        assert!(verify_digest(DigestMethod::Sha256, &sha, b"firmware").is_ok());
        assert!(verify_digest(DigestMethod::Sha256, &sha, b"tampered").is_err());
    }
}

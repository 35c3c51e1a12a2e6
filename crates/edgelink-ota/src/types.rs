//! OTA wire types and state machine vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Digest method for firmware verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestMethod {
    Md5,
    Sha256,
}

impl DigestMethod {
    /// Map the wire `signMethod` field: `"Md5"`/`"MD5"` mean MD5,
    /// anything else SHA-256.
    pub fn from_sign_method(method: &str) -> Self {
        if method == "Md5" || method == "MD5" {
            DigestMethod::Md5
        } else {
            DigestMethod::Sha256
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestMethod::Md5 => "MD5",
            DigestMethod::Sha256 => "SHA256",
        }
    }
}

/// Kind of OTA message, classified by ingress topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvKind {
    /// Firmware over-the-air.
    Fota,
    /// Configuration over-the-air.
    Cota,
}

impl RecvKind {
    pub fn classify(topic: &str) -> Self {
        if topic.starts_with("/ota/device/upgrade/") {
            RecvKind::Fota
        } else {
            RecvKind::Cota
        }
    }
}

/// A parsed OTA task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDesc {
    pub product_key: String,
    pub device_name: String,
    pub url: String,
    pub size: u64,
    pub digest_method: DigestMethod,
    #[serde(rename = "sign")]
    pub expect_digest: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<String>,
}

impl TaskDesc {
    /// Parse a task from a firmware message.
    ///
    /// Returns `None` when `data` is missing or empty (meaning "no
    /// update available", not an error) or when the mandatory `url` and
    /// `size` fields are absent.
    pub fn parse(product_key: &str, device_name: &str, msg: &Value) -> Option<Self> {
        let data = msg.get("data")?.as_object()?;
        if data.is_empty() {
            return None;
        }

        let url = data.get("url")?.as_str()?.to_string();
        let size = data.get("size")?.as_u64()?;
        if url.is_empty() || size == 0 {
            return None;
        }

        let digest_method = data
            .get("signMethod")
            .and_then(Value::as_str)
            .map(DigestMethod::from_sign_method)
            .unwrap_or(DigestMethod::Sha256);

        Some(Self {
            product_key: product_key.to_string(),
            device_name: device_name.to_string(),
            url,
            size,
            digest_method,
            expect_digest: data
                .get("sign")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            version: data
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            module: data
                .get("module")
                .and_then(Value::as_str)
                .map(str::to_string),
            extra_data: data
                .get("extData")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Firmware update descriptor consumed by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version: String,
    pub url: String,
    pub size: u64,
    #[serde(rename = "sign")]
    pub digest: String,
    #[serde(rename = "signMethod")]
    pub digest_method: DigestMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&TaskDesc> for UpdateInfo {
    fn from(task: &TaskDesc) -> Self {
        Self {
            version: task.version.clone(),
            url: task.url.clone(),
            size: task.size,
            digest: task.expect_digest.clone(),
            digest_method: task.digest_method,
            description: None,
        }
    }
}

/// Outcome of a [`PerformUpdate`](crate::manager::OtaManager::perform_update).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub success: bool,
    pub message: String,
    pub code: i32,
}

/// OTA state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Idle,
    Downloading,
    Verifying,
    Updating,
    Restarting,
    Failed,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Idle => "idle",
            OtaStatus::Downloading => "downloading",
            OtaStatus::Verifying => "verifying",
            OtaStatus::Updating => "updating",
            OtaStatus::Restarting => "restarting",
            OtaStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire progress codes (C-SDK parity).
pub mod progress_code {
    /// Generic/upgrade failure.
    pub const UPGRADE_FAILED: i32 = -1;
    /// Download failure.
    pub const DOWNLOAD_FAILED: i32 = -2;
    /// Digest/verify failure.
    pub const VERIFY_FAILED: i32 = -3;
    /// Write/prepare failure.
    pub const PREPARE_FAILED: i32 = -4;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_method_mapping() {
        assert_eq!(DigestMethod::from_sign_method("Md5"), DigestMethod::Md5);
        assert_eq!(DigestMethod::from_sign_method("MD5"), DigestMethod::Md5);
        assert_eq!(
            DigestMethod::from_sign_method("SHA256"),
            DigestMethod::Sha256
        );
        assert_eq!(
            DigestMethod::from_sign_method("anything"),
            DigestMethod::Sha256
        );
    }

    #[test]
    fn test_classify_by_topic_prefix() {
        assert_eq!(
            RecvKind::classify("/ota/device/upgrade/A/b"),
            RecvKind::Fota
        );
        assert_eq!(
            RecvKind::classify("/sys/A/b/thing/ota/firmware/get_reply"),
            RecvKind::Cota
        );
    }

    #[test]
    fn test_parse_full_task() {
        let msg = json!({
            "code": 200,
            "data": {
                "version": "1.0.13",
                "module": "arm",
                "size": 1024,
                "url": "https://firmware.example/fw.bin",
                "sign": "d41d8cd98f00b204e9800998ecf8427e",
                "signMethod": "Md5",
                "extData": "{\"key\":\"v\"}",
            }
        });
        let task = TaskDesc::parse("A", "b", &msg).unwrap();
        assert_eq!(task.version, "1.0.13");
        assert_eq!(task.module.as_deref(), Some("arm"));
        assert_eq!(task.size, 1024);
        assert_eq!(task.digest_method, DigestMethod::Md5);
        assert_eq!(task.product_key, "A");
        assert_eq!(task.device_name, "b");
    }

    #[test]
    fn test_empty_data_means_no_update() {
        let msg = json!({"code": 200, "data": {}});
        assert!(TaskDesc::parse("A", "b", &msg).is_none());

        let msg = json!({"code": 200});
        assert!(TaskDesc::parse("A", "b", &msg).is_none());
    }

    #[test]
    fn test_missing_url_or_size_rejected() {
        let msg = json!({"data": {"version": "1.0.1", "size": 10}});
        assert!(TaskDesc::parse("A", "b", &msg).is_none());

        let msg = json!({"data": {"version": "1.0.1", "url": "https://x/f.bin"}});
        assert!(TaskDesc::parse("A", "b", &msg).is_none());
    }

    #[test]
    fn test_task_round_trip() {
        let msg = json!({
            "data": {
                "version": "2.0.0",
                "size": 42,
                "url": "https://x/f.bin",
                "sign": "abc",
                "signMethod": "SHA256",
            }
        });
        let task = TaskDesc::parse("A", "b", &msg).unwrap();
        let text = serde_json::to_string(&task).unwrap();
        let back: TaskDesc = serde_json::from_str(&text).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_update_info_from_task() {
        let msg = json!({
            "data": {
                "version": "2.0.0",
                "size": 42,
                "url": "https://x/f.bin",
                "sign": "abc",
                "signMethod": "Md5",
            }
        });
        let task = TaskDesc::parse("A", "b", &msg).unwrap();
        let info = UpdateInfo::from(&task);
        assert_eq!(info.version, "2.0.0");
        assert_eq!(info.digest, "abc");
        assert_eq!(info.digest_method, DigestMethod::Md5);
    }
}

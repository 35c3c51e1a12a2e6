//! EdgeLink OTA engine.
//!
//! Firmware query and push over the shared MQTT session, verified
//! HTTP(S) download, binary self-replacement with backup and rollback,
//! and a per-device manager that reports status as device properties
//! and `ota.status_changed` events.

pub mod client;
pub mod downloader;
pub mod manager;
pub mod plugin;
pub mod types;
pub mod updater;
pub mod version;

pub use client::{compute_digest, recv_handler, verify_digest, OtaClient, RecvHandler};
pub use downloader::{ChunkedDownloader, Downloader, HttpDownloader, ProgressCallback};
pub use manager::{OtaManager, StatusCallback, DEFAULT_CHECK_INTERVAL};
pub use plugin::OtaPlugin;
pub use types::{
    progress_code, DigestMethod, OtaStatus, RecvKind, TaskDesc, UpdateInfo, UpdateResult,
};
pub use updater::{BinaryUpdater, Updater};
pub use version::{FileVersionStore, VersionInfo, VersionProvider, VERSION_FILE};

//! Per-device OTA orchestration.
//!
//! Each managed device gets one manager that reports its stored
//! version on start, queries for module-targeted firmware on a timer,
//! and drives the update pipeline Idle → Downloading → Verifying →
//! Updating → Restarting, reporting status at every transition. At most
//! one update runs at a time; a second request while busy is refused
//! without touching the downloader.

use crate::client::{recv_handler, OtaClient};
use crate::downloader::{Downloader, HttpDownloader, ProgressCallback};
use crate::types::{progress_code, OtaStatus, TaskDesc, UpdateInfo, UpdateResult};
use crate::updater::{BinaryUpdater, Updater};
use crate::version::VersionProvider;
use edgelink_core::error::Result;
use edgelink_mqtt::session::MqttSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default interval between firmware queries.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay before the first query after start.
const INITIAL_CHECK_DELAY: Duration = Duration::from_secs(30);

/// Join budget for manager tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Status observer: `(status, progress, message)`.
pub type StatusCallback = Arc<dyn Fn(OtaStatus, i32, &str) + Send + Sync>;

/// Task observer, invoked for every firmware task that arrives,
/// including ones the manager skips.
pub type TaskCallback = Arc<dyn Fn(TaskDesc) + Send + Sync>;

/// Drives the firmware lifecycle for one device.
pub struct OtaManager {
    ota: Arc<OtaClient>,
    versions: Arc<dyn VersionProvider>,
    downloader: Arc<dyn Downloader>,
    updater: Arc<dyn Updater>,
    status: RwLock<OtaStatus>,
    status_callback: RwLock<Option<StatusCallback>>,
    task_callback: RwLock<Option<TaskCallback>>,
    auto_update: AtomicBool,
    check_interval: RwLock<Duration>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl OtaManager {
    pub fn new(
        session: Arc<MqttSession>,
        product_key: &str,
        device_name: &str,
        versions: Arc<dyn VersionProvider>,
    ) -> Result<Self> {
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            ota: OtaClient::new(session, product_key, device_name),
            versions,
            downloader: Arc::new(HttpDownloader::new()?),
            updater: Arc::new(BinaryUpdater::new()),
            status: RwLock::new(OtaStatus::Idle),
            status_callback: RwLock::new(None),
            task_callback: RwLock::new(None),
            auto_update: AtomicBool::new(true),
            check_interval: RwLock::new(DEFAULT_CHECK_INTERVAL),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Swap the download strategy. Test seam and chunked fallback.
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Swap the update executor.
    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = updater;
        self
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.write().unwrap() = Some(callback);
    }

    pub fn set_task_callback(&self, callback: TaskCallback) {
        *self.task_callback.write().unwrap() = Some(callback);
    }

    pub fn set_auto_update(&self, enabled: bool) {
        self.auto_update.store(enabled, Ordering::SeqCst);
    }

    pub fn set_check_interval(&self, interval: Duration) {
        *self.check_interval.write().unwrap() = interval;
    }

    pub fn status(&self) -> OtaStatus {
        *self.status.read().unwrap()
    }

    pub fn current_version(&self) -> String {
        self.versions.version()
    }

    /// Start: wire the task handler, subscribe the OTA topics, report
    /// the stored version, and launch the periodic query loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let version = self.versions.version();
        info!("starting OTA manager, current version: {version}");

        let this = self.clone();
        self.ota.set_recv_handler(recv_handler(move |_kind, task| {
            let this = this.clone();
            async move {
                this.on_task(task).await;
            }
        }));

        self.ota.start().await?;
        self.report_version().await;

        let this = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(INITIAL_CHECK_DELAY) => {}
                _ = stop_rx.changed() => return,
            }
            this.check_update().await;

            loop {
                let interval = *this.check_interval.read().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => this.check_update().await,
                    _ = stop_rx.changed() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Stop the manager, joining its tasks within the budget.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping OTA manager");
        let _ = self.stop_tx.send(true);

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("timeout waiting for OTA manager task to stop");
                handle.abort();
            }
        }

        self.ota.stop().await
    }

    /// Report the stored version and query for module-targeted firmware.
    pub async fn check_update(&self) {
        let version = self.versions.version();
        let module = self.versions.module();
        if let Err(e) = self
            .ota
            .report_version_with_module(&version, &module)
            .await
        {
            warn!("failed to report version: {e}");
        }
        if let Err(e) = self.ota.query_firmware_with_module(&module).await {
            warn!("failed to query firmware: {e}");
        }
    }

    /// React to a pushed or queried firmware task.
    async fn on_task(self: &Arc<Self>, task: TaskDesc) {
        let current = self.versions.version();
        let module = self.versions.module();
        info!(
            "firmware task: current={current} new={} size={} bytes",
            task.version, task.size
        );

        let observer = self.task_callback.read().unwrap().clone();
        if let Some(observer) = observer {
            observer(task.clone());
        }

        if task.version == current {
            info!("already on version {current}, skipping update");
            if let Err(e) = self
                .ota
                .report_progress("download", "Already on latest version", 100, &module)
                .await
            {
                warn!("failed to report progress: {e}");
            }
            return;
        }

        if !self.auto_update.load(Ordering::SeqCst) {
            info!("auto-update disabled, ignoring firmware task");
            return;
        }

        let info = UpdateInfo::from(&task);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.perform_update(&info).await;
            if !result.success {
                warn!("auto-update failed: {}", result.message);
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Run the full update pipeline.
    ///
    /// Refused immediately while a previous update is anywhere but
    /// Idle; the downloader is not called in that case.
    pub async fn perform_update(&self, info: &UpdateInfo) -> UpdateResult {
        {
            let mut status = self.status.write().unwrap();
            if *status != OtaStatus::Idle {
                return UpdateResult {
                    success: false,
                    message: "Update already in progress".to_string(),
                    code: progress_code::UPGRADE_FAILED,
                };
            }
            *status = OtaStatus::Downloading;
        }

        let module = self.versions.module();
        self.notify_status(OtaStatus::Downloading, 0, "Starting download");

        let progress: ProgressCallback = {
            let this_cb = self.status_callback.read().unwrap().clone();
            let ota = self.ota.clone();
            let module = module.clone();
            let last = Arc::new(Mutex::new(-1i32));
            Arc::new(move |current, total, percentage| {
                let percent = percentage as i32;
                {
                    let mut last = last.lock().unwrap();
                    if *last == percent {
                        return;
                    }
                    *last = percent;
                }
                if let Some(cb) = &this_cb {
                    cb(
                        OtaStatus::Downloading,
                        percent,
                        &format!("Downloading: {current}/{total} bytes"),
                    );
                }
                let ota = ota.clone();
                let module = module.clone();
                tokio::spawn(async move {
                    let _ = ota
                        .report_progress("download", "Downloading", percent, &module)
                        .await;
                });
            })
        };

        let data = match self.downloader.download(info, Some(progress)).await {
            Ok(data) => data,
            Err(e) => {
                return self
                    .fail(
                        progress_code::DOWNLOAD_FAILED,
                        format!("Download failed: {e}"),
                    )
                    .await;
            }
        };

        self.set_status(OtaStatus::Verifying);
        self.notify_status(OtaStatus::Verifying, 50, "Verifying firmware");
        if let Err(e) = self.downloader.verify(&data, info) {
            return self
                .fail(
                    progress_code::VERIFY_FAILED,
                    format!("Verification failed: {e}"),
                )
                .await;
        }

        self.set_status(OtaStatus::Updating);
        self.notify_status(OtaStatus::Updating, 75, "Preparing update");
        if let Err(e) = self.updater.prepare_update(&data) {
            return self
                .fail(
                    progress_code::PREPARE_FAILED,
                    format!("Update preparation failed: {e}"),
                )
                .await;
        }

        if let Err(e) = self.versions.set_version(&info.version) {
            warn!("failed to save version: {e}");
        }
        if let Err(e) = self
            .ota
            .report_progress("download", "Update prepared", 100, &module)
            .await
        {
            warn!("failed to report progress: {e}");
        }

        self.set_status(OtaStatus::Restarting);
        self.notify_status(OtaStatus::Restarting, 100, "Restarting with new version");
        if let Err(e) = self.updater.execute_update() {
            if let Err(rollback_err) = self.updater.rollback() {
                warn!("rollback failed: {rollback_err}");
            }
            return self
                .fail(
                    progress_code::UPGRADE_FAILED,
                    format!("Update execution failed: {e}"),
                )
                .await;
        }

        // Only reachable on platforms where execute returns (the Unix
        // path replaces the process).
        self.set_status(OtaStatus::Idle);
        self.notify_status(OtaStatus::Idle, 100, "Update completed");
        UpdateResult {
            success: true,
            message: "Update completed successfully".to_string(),
            code: 0,
        }
    }

    async fn fail(&self, code: i32, message: String) -> UpdateResult {
        self.set_status(OtaStatus::Failed);
        self.notify_status(OtaStatus::Failed, 0, &message);

        let module = self.versions.module();
        if let Err(e) = self
            .ota
            .report_progress("download", &message, code, &module)
            .await
        {
            warn!("failed to report progress: {e}");
        }

        // Failed is transient; the manager returns to Idle so a later
        // task can run.
        self.set_status(OtaStatus::Idle);
        self.notify_status(OtaStatus::Idle, 0, "");

        UpdateResult {
            success: false,
            message,
            code,
        }
    }

    async fn report_version(&self) {
        let version = self.versions.version();
        let module = self.versions.module();
        info!("reporting version to platform: {version} (module: {module})");
        if let Err(e) = self
            .ota
            .report_version_with_module(&version, &module)
            .await
        {
            warn!("failed to report version: {e}");
        }
    }

    fn set_status(&self, status: OtaStatus) {
        *self.status.write().unwrap() = status;
    }

    fn notify_status(&self, status: OtaStatus, progress: i32, message: &str) {
        let callback = self.status_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(status, progress, message);
        }
    }
}

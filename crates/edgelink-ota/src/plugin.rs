//! The OTA framework plugin.
//!
//! Listens for device registrations and gives each device its own
//! manager. The broker session is borrowed from the MQTT plugin,
//! acquired strictly OUTSIDE this plugin's own lock; then the lock is
//! taken to mutate the manager map. Nesting those two the other way
//! around deadlocks against the plugin registry.

use crate::manager::{OtaManager, DEFAULT_CHECK_INTERVAL};
use crate::types::{OtaStatus, UpdateInfo};
use crate::version::{FileVersionStore, VERSION_FILE};
use async_trait::async_trait;
use edgelink_core::device::{Device, PropertyUpdate};
use edgelink_core::error::{Error, Result};
use edgelink_core::event::{handler, Event, EventType};
use edgelink_core::framework::Framework;
use edgelink_core::plugin::Plugin;
use edgelink_mqtt::plugin::MqttPlugin;
use edgelink_mqtt::session::MqttSession;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Settle time before a freshly registered device is wired for OTA,
/// letting the registration cascade finish first.
const REGISTRATION_DELAY: Duration = Duration::from_secs(2);

/// Attempts to resolve a just-registered device.
const REGISTRATION_RETRIES: usize = 3;

/// Join budget for plugin tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state of the plugin. Event handlers and background tasks
/// hold clones of this.
struct Inner {
    framework: RwLock<Option<Weak<Framework>>>,
    /// Non-owning handle to the shared broker session.
    mqtt: RwLock<Option<Weak<MqttSession>>>,
    managers: AsyncMutex<HashMap<String, Arc<OtaManager>>>,
    auto_update: AtomicBool,
    check_interval: RwLock<Duration>,
    running: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// OTA firmware update plugin. Depends on the MQTT plugin.
pub struct OtaPlugin {
    inner: Arc<Inner>,
}

impl OtaPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                framework: RwLock::new(None),
                mqtt: RwLock::new(None),
                managers: AsyncMutex::new(HashMap::new()),
                auto_update: AtomicBool::new(true),
                check_interval: RwLock::new(DEFAULT_CHECK_INTERVAL),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Inject the broker session directly, bypassing plugin lookup.
    /// Breaks the registry/lock cycle in tests and embeddings.
    pub fn set_mqtt_client(&self, session: &Arc<MqttSession>) {
        *self.inner.mqtt.write().unwrap() = Some(Arc::downgrade(session));
        info!("MQTT client set directly for OTA plugin");
    }

    /// Enable or disable auto-update on the plugin and every manager.
    pub async fn set_auto_update(&self, enabled: bool) {
        self.inner.auto_update.store(enabled, Ordering::SeqCst);
        for manager in self.inner.managers.lock().await.values() {
            manager.set_auto_update(enabled);
        }
    }

    /// The OTA manager for a device, if one exists.
    pub async fn manager(&self, device_id: &str) -> Option<Arc<OtaManager>> {
        self.inner.managers.lock().await.get(device_id).cloned()
    }

    /// Create and start the manager for one device.
    pub async fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        self.inner.register_device(device).await
    }

    /// Stop and drop the manager for one device.
    pub async fn unregister_device(&self, device_id: &str) -> Result<()> {
        self.inner.unregister_device(device_id).await
    }
}

impl Inner {
    fn framework(&self) -> Option<Arc<Framework>> {
        self.framework
            .read()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    /// Resolve the shared session: the cached handle when alive,
    /// otherwise through the MQTT plugin's accessor. Runs with NO OTA
    /// lock held.
    fn acquire_mqtt_client(&self) -> Option<Arc<MqttSession>> {
        if let Some(session) = self
            .mqtt
            .read()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade())
        {
            return Some(session);
        }

        let framework = self.framework()?;
        let plugin = framework.get_plugin("mqtt")?;
        let mqtt = plugin.as_any().downcast_ref::<MqttPlugin>()?;
        let session = mqtt.mqtt_client();
        *self.mqtt.write().unwrap() = Some(Arc::downgrade(&session));
        debug!("acquired MQTT client from mqtt plugin");
        Some(session)
    }

    async fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let info = device.device_info();
        let device_id = info.device_id();
        info!("creating OTA manager for device {device_id}");

        // Session first, manager-map lock second. Never the reverse.
        let session = self.acquire_mqtt_client().ok_or_else(|| {
            Error::lifecycle(format!("MQTT client not available for device {device_id}"))
        })?;

        let mut managers = self.managers.lock().await;
        if managers.contains_key(&device_id) {
            debug!("OTA manager for device {device_id} already exists");
            return Ok(());
        }

        let versions = Arc::new(FileVersionStore::new(VERSION_FILE));
        let manager = Arc::new(OtaManager::new(
            session,
            &info.product_key,
            &info.device_name,
            versions,
        )?);
        manager.set_auto_update(self.auto_update.load(Ordering::SeqCst));
        manager.set_check_interval(*self.check_interval.read().unwrap());

        let framework = self.framework.read().unwrap().clone();
        let status_device = device.clone();
        let status_device_id = device_id.clone();
        manager.set_status_callback(Arc::new(move |status, progress, message| {
            let device = status_device.clone();
            let framework = framework.clone();
            let device_id = status_device_id.clone();
            let message = message.to_string();
            tokio::spawn(async move {
                apply_status_to_device(&device, status, progress, &message).await;
                if let Some(fw) = framework.as_ref().and_then(|weak| weak.upgrade()) {
                    fw.emit_async(Event::new(
                        EventType::OtaStatusChanged,
                        "ota",
                        json!({
                            "device_id": device_id,
                            "status": status.as_str(),
                            "progress": progress,
                            "message": message,
                        }),
                    ));
                }
            });
        }));

        // Every task arrival notifies the device and the bus, even the
        // ones the manager skips.
        let framework = self.framework.read().unwrap().clone();
        let notify_device = device.clone();
        let notify_device_id = device_id.clone();
        manager.set_task_callback(Arc::new(move |task| {
            let device = notify_device.clone();
            let framework = framework.clone();
            let device_id = notify_device_id.clone();
            tokio::spawn(async move {
                let notice = firmware_notice(&task);
                if let Err(e) = device.on_ota_notify(notice).await {
                    debug!("device {device_id} on_ota_notify failed: {e}");
                }
                if let Some(fw) = framework.as_ref().and_then(|weak| weak.upgrade()) {
                    fw.emit_async(Event::new(
                        EventType::OtaNotify,
                        "ota",
                        serde_json::to_value(&task).unwrap_or(Value::Null),
                    ));
                }
            });
        }));

        manager.start().await?;
        managers.insert(device_id.clone(), manager);
        info!("created OTA manager for device {device_id}");
        Ok(())
    }

    async fn unregister_device(&self, device_id: &str) -> Result<()> {
        let manager = self.managers.lock().await.remove(device_id);
        if let Some(manager) = manager {
            manager.stop().await?;
            info!("removed OTA manager for device {device_id}");
        }
        Ok(())
    }

    async fn wire_device_with_retries(self: &Arc<Self>, device_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        debug!("processing device registration for {device_id}");

        for attempt in 1..=REGISTRATION_RETRIES {
            let device = self.framework().and_then(|fw| fw.get_device(device_id));
            match device {
                Some(device) => match self.register_device(device).await {
                    Ok(()) => {
                        info!("registered device {device_id} for OTA");
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "failed to register device {device_id} for OTA (attempt {attempt}): {e}"
                        );
                    }
                },
                None => {
                    warn!("device {device_id} not found (attempt {attempt})");
                }
            }
            if attempt < REGISTRATION_RETRIES {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        warn!("giving up on OTA registration for device {device_id}");
    }

    fn register_event_handlers(self: &Arc<Self>, framework: &Arc<Framework>) {
        // New devices get a manager once the registration cascade has
        // settled.
        let inner = self.clone();
        framework.on(
            EventType::DeviceRegistered,
            handler(move |event| {
                let inner = inner.clone();
                async move {
                    let Some(device_id) =
                        event.data.get("device_id").and_then(Value::as_str)
                    else {
                        return Ok(());
                    };
                    let device_id = device_id.to_string();
                    let task_inner = inner.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(REGISTRATION_DELAY).await;
                        task_inner.wire_device_with_retries(&device_id).await;
                    });
                    inner.tasks.lock().unwrap().push(handle);
                    Ok(())
                }
            }),
        );

        let inner = self.clone();
        framework.on(
            EventType::DeviceUnregistered,
            handler(move |event| {
                let inner = inner.clone();
                async move {
                    if let Some(device_id) =
                        event.data.get("device_id").and_then(Value::as_str)
                    {
                        if let Err(e) = inner.unregister_device(device_id).await {
                            warn!("failed to unregister device {device_id} from OTA: {e}");
                        }
                    }
                    Ok(())
                }
            }),
        );

        // Manual controls.
        let inner = self.clone();
        framework.on(
            EventType::OtaCheckUpdate,
            handler(move |event| {
                let inner = inner.clone();
                async move {
                    if let Some(device_id) =
                        event.data.get("device_id").and_then(Value::as_str)
                    {
                        let manager = inner.managers.lock().await.get(device_id).cloned();
                        if let Some(manager) = manager {
                            manager.check_update().await;
                        }
                    }
                    Ok(())
                }
            }),
        );

        let inner = self.clone();
        framework.on(
            EventType::OtaPerformUpdate,
            handler(move |event| {
                let inner = inner.clone();
                async move {
                    let Some(device_id) =
                        event.data.get("device_id").and_then(Value::as_str)
                    else {
                        return Ok(());
                    };
                    let Some(info_value) = event.data.get("update_info") else {
                        return Err(Error::protocol("missing update_info"));
                    };
                    let info: UpdateInfo = serde_json::from_value(info_value.clone())
                        .map_err(|e| Error::protocol(format!("invalid update_info: {e}")))?;
                    let manager = inner.managers.lock().await.get(device_id).cloned();
                    if let Some(manager) = manager {
                        let device_id = device_id.to_string();
                        tokio::spawn(async move {
                            let result = manager.perform_update(&info).await;
                            info!(
                                "update result for device {device_id}: code={} {}",
                                result.code, result.message
                            );
                        });
                    }
                    Ok(())
                }
            }),
        );
    }
}

#[async_trait]
impl Plugin for OtaPlugin {
    fn name(&self) -> &str {
        "ota"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "OTA firmware update plugin"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["mqtt".to_string()]
    }

    async fn init(&self, framework: Arc<Framework>) -> Result<()> {
        info!("initializing OTA plugin");
        *self.inner.framework.write().unwrap() = Some(Arc::downgrade(&framework));
        self.inner.register_event_handlers(&framework);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!("starting OTA plugin");
        // The MQTT client is acquired lazily on first device
        // registration; grabbing it here would re-enter the plugin
        // registry mid-start.
        self.inner.running.store(true, Ordering::SeqCst);
        info!("OTA plugin started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping OTA plugin");
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let managers: Vec<(String, Arc<OtaManager>)> = {
            let mut map = self.inner.managers.lock().await;
            map.drain().collect()
        };
        let mut errors = Vec::new();
        for (device_id, manager) in managers {
            if let Err(e) = manager.stop().await {
                warn!("failed to stop OTA manager for device {device_id}: {e}");
                errors.push(e);
            }
        }

        let handles: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("timeout waiting for OTA plugin task to stop");
                handle.abort();
            }
        }

        info!("OTA plugin stopped");
        errors.into_iter().next().map_or(Ok(()), Err)
    }

    fn configure(&self, config: Value) -> Result<()> {
        if let Some(auto_update) = config.get("auto_update").and_then(Value::as_bool) {
            self.inner.auto_update.store(auto_update, Ordering::SeqCst);
        }
        if let Some(secs) = config.get("check_interval_secs").and_then(Value::as_u64) {
            *self.inner.check_interval.write().unwrap() = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn firmware_notice(task: &crate::types::TaskDesc) -> edgelink_core::device::FirmwareNotice {
    edgelink_core::device::FirmwareNotice {
        version: task.version.clone(),
        module: task.module.clone(),
        url: task.url.clone(),
        size: task.size,
        sign: task.expect_digest.clone(),
        sign_method: task.digest_method.as_str().to_string(),
    }
}

/// Mirror OTA state into the device's properties.
async fn apply_status_to_device(
    device: &Arc<dyn Device>,
    status: OtaStatus,
    progress: i32,
    message: &str,
) {
    let mut updates = vec![
        ("ota_status", json!(status.as_str())),
        ("ota_progress", json!(progress)),
    ];
    if !message.is_empty() {
        updates.push(("ota_message", json!(message)));
    }
    if status == OtaStatus::Idle {
        updates.push(("last_update_time", json!(chrono::Utc::now().to_rfc3339())));
    }

    for (name, value) in updates {
        let update = PropertyUpdate {
            name: name.to_string(),
            value,
        };
        if let Err(e) = device.on_property_set(update).await {
            debug!("device rejected {name} update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_core::device::DeviceInfo;

    struct NullDevice;

    #[async_trait]
    impl Device for NullDevice {
        fn device_info(&self) -> DeviceInfo {
            DeviceInfo::new("A", "b")
        }
    }

    #[tokio::test]
    async fn test_register_device_requires_session() {
        let plugin = OtaPlugin::new();
        let err = plugin
            .register_device(Arc::new(NullDevice))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }

    #[tokio::test]
    async fn test_configure_map() {
        let plugin = OtaPlugin::new();
        plugin
            .configure(json!({"auto_update": false, "check_interval_secs": 60}))
            .unwrap();
        assert!(!plugin.inner.auto_update.load(Ordering::SeqCst));
        assert_eq!(
            *plugin.inner.check_interval.read().unwrap(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_set_mqtt_client_seam() {
        let mut config = edgelink_core::config::Config::new();
        config.device.product_key = "A".to_string();
        config.device.device_name = "b".to_string();
        config.device.device_secret = "s".to_string();
        config.mqtt.host = "h".to_string();
        let session = MqttSession::new(config);

        let plugin = OtaPlugin::new();
        plugin.set_mqtt_client(&session);
        assert!(plugin.inner.acquire_mqtt_client().is_some());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let plugin = OtaPlugin::new();
        plugin.start().await.unwrap();
        plugin.stop().await.unwrap();
        plugin.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_properties_reach_device() {
        use std::sync::Mutex as StdMutex;

        struct RecordingDevice {
            sets: StdMutex<Vec<(String, Value)>>,
        }

        #[async_trait]
        impl Device for RecordingDevice {
            fn device_info(&self) -> DeviceInfo {
                DeviceInfo::new("A", "b")
            }
            async fn on_property_set(&self, update: PropertyUpdate) -> Result<()> {
                self.sets.lock().unwrap().push((update.name, update.value));
                Ok(())
            }
        }

        let recording = Arc::new(RecordingDevice {
            sets: StdMutex::new(Vec::new()),
        });
        let device: Arc<dyn Device> = recording.clone();
        apply_status_to_device(&device, OtaStatus::Downloading, 50, "halfway").await;

        let sets = recording.sets.lock().unwrap();
        assert!(sets.iter().any(|(name, value)| name == "ota_status"
            && value == &json!("downloading")));
        assert!(sets
            .iter()
            .any(|(name, value)| name == "ota_progress" && value == &json!(50)));
        assert!(sets
            .iter()
            .any(|(name, value)| name == "ota_message" && value == &json!("halfway")));
        // last_update_time only appears on return to Idle.
        assert!(!sets.iter().any(|(name, _)| name == "last_update_time"));
    }
}

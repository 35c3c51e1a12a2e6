//! Framework core: owns the device, property, and service tables, the
//! event bus, and the plugin manager, and wires the internal handlers
//! that translate inbound events into device callbacks.
//!
//! Locking rule: every table is guarded by its own reader/writer lock,
//! and iteration copies the entries out under the read lock before any
//! user callback runs. A write lock is never held across a callback.

use crate::bus::EventBus;
use crate::config::Config;
use crate::device::{Device, PropertyUpdate, ServiceRequest, ServiceResponse};
use crate::error::{Error, Result};
use crate::event::{handler, Event, EventType};
use crate::plugin::{Plugin, PluginManager};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, info, warn};

/// Framework lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Broker connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Synchronous property getter.
pub type PropertyGetter = Arc<dyn Fn() -> Value + Send + Sync>;
/// Synchronous property setter.
pub type PropertySetter = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;
/// Synchronous service handler.
pub type ServiceHandler = Arc<dyn Fn(HashMap<String, Value>) -> Result<Value> + Send + Sync>;

struct PropertyEntry {
    getter: PropertyGetter,
    setter: Option<PropertySetter>,
    mode: &'static str,
}

/// The framework instance.
///
/// Construct with [`Framework::new`], then `initialize`, register
/// plugins and devices, and `start`.
pub struct Framework {
    config: Config,
    bus: EventBus,
    plugins: PluginManager,
    devices: RwLock<HashMap<String, Arc<dyn Device>>>,
    properties: RwLock<HashMap<String, PropertyEntry>>,
    services: RwLock<HashMap<String, ServiceHandler>>,
    state: RwLock<LifecycleState>,
    connection: RwLock<ConnectionState>,
}

impl Framework {
    pub fn new(config: Config) -> Arc<Self> {
        let worker_count = config.advanced.worker_count;
        Arc::new(Self {
            config,
            bus: EventBus::new(worker_count),
            plugins: PluginManager::new(),
            devices: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            state: RwLock::new(LifecycleState::Uninitialized),
            connection: RwLock::new(ConnectionState::Disconnected),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.read().unwrap()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write().unwrap() = state;
    }

    /// Initialize the framework: install the internal event wiring.
    /// Fails if called twice.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != LifecycleState::Uninitialized {
                return Err(Error::lifecycle("framework already initialized"));
            }
            *state = LifecycleState::Initializing;
        }

        info!("initializing framework");
        self.register_internal_handlers();
        self.set_state(LifecycleState::Initialized);
        info!("framework initialized");
        Ok(())
    }

    /// Start the framework: event bus, plugins (init then start in
    /// dependency order), device initialization, then `system.ready`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != LifecycleState::Initialized {
                return Err(Error::lifecycle(
                    "framework must be initialized before starting",
                ));
            }
            *state = LifecycleState::Starting;
        }

        info!("starting framework");
        self.bus.start().await;

        self.plugins.init_all(self.clone()).await?;
        self.plugins.start_all().await?;

        for (device_id, device) in self.device_snapshot() {
            if let Err(e) = device.on_initialize().await {
                error!("failed to initialize device {device_id}: {e}");
            }
        }

        self.set_state(LifecycleState::Started);
        self.emit(Event::new(EventType::Ready, "framework", Value::Null))
            .await
            .ok();
        info!("framework started");
        Ok(())
    }

    /// Stop the framework: devices, plugins, then the event bus. A stop
    /// without a prior start (or a second stop) is a lifecycle error but
    /// never panics.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != LifecycleState::Started {
                return Err(Error::lifecycle("framework is not running"));
            }
            *state = LifecycleState::Stopping;
        }

        info!("stopping framework");

        for (device_id, device) in self.device_snapshot() {
            if let Err(e) = device.on_destroy().await {
                error!("failed to destroy device {device_id}: {e}");
            }
        }

        if let Err(e) = self.plugins.stop_all().await {
            error!("error stopping plugins: {e}");
        }

        self.bus.stop().await;
        self.set_state(LifecycleState::Stopped);
        info!("framework stopped");
        Ok(())
    }

    /// Block until SIGINT or SIGTERM, then stop.
    pub async fn wait_for_shutdown(&self) {
        info!("waiting for shutdown signal");
        wait_for_signal().await;
        info!("shutdown signal received");
        if let Err(e) = self.stop().await {
            error!("error during stop: {e}");
        }
    }

    // ----- devices ---------------------------------------------------

    /// Register a device. If the framework is already running, the
    /// device's `on_initialize` runs asynchronously. Emits
    /// `device.registered` with the device id.
    pub async fn register_device(self: &Arc<Self>, device: Arc<dyn Device>) -> Result<()> {
        let device_id = device.device_info().device_id();

        {
            let mut devices = self.devices.write().unwrap();
            if devices.contains_key(&device_id) {
                return Err(Error::lifecycle(format!(
                    "device {device_id} already registered"
                )));
            }
            devices.insert(device_id.clone(), device.clone());
        }
        info!("registered device: {device_id}");

        if self.state() == LifecycleState::Started {
            let id = device_id.clone();
            tokio::spawn(async move {
                if let Err(e) = device.on_initialize().await {
                    error!("failed to initialize device {id}: {e}");
                }
            });
        }

        self.emit(Event::new(
            EventType::DeviceRegistered,
            "framework",
            json!({ "device_id": device_id }),
        ))
        .await
        .ok();
        Ok(())
    }

    /// Unregister a device, invoking its `on_destroy`. Emits
    /// `device.unregistered`.
    pub async fn unregister_device(&self, device_id: &str) -> Result<()> {
        let device = {
            let mut devices = self.devices.write().unwrap();
            devices
                .remove(device_id)
                .ok_or_else(|| Error::not_found(format!("device {device_id} not found")))?
        };

        if let Err(e) = device.on_destroy().await {
            error!("error destroying device {device_id}: {e}");
        }
        info!("unregistered device: {device_id}");

        self.emit(Event::new(
            EventType::DeviceUnregistered,
            "framework",
            json!({ "device_id": device_id }),
        ))
        .await
        .ok();
        Ok(())
    }

    pub fn get_device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.devices.read().unwrap().get(device_id).cloned()
    }

    fn device_snapshot(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect()
    }

    // ----- plugins ---------------------------------------------------

    pub fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.plugins.register(plugin)
    }

    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        self.plugins.unregister(name).await
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    // ----- events ----------------------------------------------------

    /// Register an event handler with default priority.
    pub fn on(&self, event_type: EventType, handler: crate::event::EventHandler) {
        self.bus.subscribe(event_type, handler);
    }

    /// Publish an event on the bus.
    pub async fn emit(&self, event: Event) -> Result<()> {
        self.bus.publish(event).await
    }

    /// Publish without waiting; errors are logged.
    pub fn emit_async(&self, event: Event) {
        self.bus.publish_async(event);
    }

    // ----- properties and services ----------------------------------

    /// Register a property. Mode is `r` without a setter, `rw` with one.
    pub fn register_property(
        &self,
        name: impl Into<String>,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
    ) {
        let name = name.into();
        let mode = if setter.is_some() { "rw" } else { "r" };
        info!("registered property: {name} (mode: {mode})");
        self.properties.write().unwrap().insert(
            name,
            PropertyEntry {
                getter,
                setter,
                mode,
            },
        );
    }

    /// Current value of a registered property.
    pub fn property_value(&self, name: &str) -> Option<Value> {
        let properties = self.properties.read().unwrap();
        properties.get(name).map(|entry| (entry.getter)())
    }

    /// Report a single property to the cloud.
    pub async fn report_property(&self, name: impl Into<String>, value: Value) -> Result<()> {
        let mut map = HashMap::new();
        map.insert(name.into(), value);
        self.report_properties(map).await
    }

    /// Report multiple properties to the cloud.
    pub async fn report_properties(&self, properties: HashMap<String, Value>) -> Result<()> {
        self.emit(Event::new(
            EventType::PropertyReport,
            "framework",
            serde_json::to_value(properties)?,
        ))
        .await
    }

    /// Report a device business event to the cloud.
    pub async fn report_event(
        &self,
        event_name: impl Into<String>,
        data: HashMap<String, Value>,
    ) -> Result<()> {
        let payload = json!({
            "event_type": event_name.into(),
            "data": data,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        self.emit(Event::new(EventType::EventReport, "framework", payload))
            .await
    }

    /// Register a service handler. A later registration of the same name
    /// replaces the earlier one.
    pub fn register_service(&self, name: impl Into<String>, handler: ServiceHandler) {
        let name = name.into();
        info!("registered service: {name}");
        self.services.write().unwrap().insert(name, handler);
    }

    // ----- internal wiring ------------------------------------------

    fn register_internal_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        // Connection up: flip state, notify devices concurrently.
        let w = weak.clone();
        self.bus.subscribe(
            EventType::Connected,
            handler(move |_event| {
                let w = w.clone();
                async move {
                    let Some(fw) = w.upgrade() else { return Ok(()) };
                    *fw.connection.write().unwrap() = ConnectionState::Connected;
                    for (device_id, device) in fw.device_snapshot() {
                        tokio::spawn(async move {
                            if let Err(e) = device.on_connect().await {
                                warn!("device {device_id} on_connect failed: {e}");
                            }
                        });
                    }
                    Ok(())
                }
            }),
        );

        // Connection down.
        let w = weak.clone();
        self.bus.subscribe(
            EventType::Disconnected,
            handler(move |_event| {
                let w = w.clone();
                async move {
                    let Some(fw) = w.upgrade() else { return Ok(()) };
                    *fw.connection.write().unwrap() = ConnectionState::Disconnected;
                    for (device_id, device) in fw.device_snapshot() {
                        tokio::spawn(async move {
                            if let Err(e) = device.on_disconnect().await {
                                warn!("device {device_id} on_disconnect failed: {e}");
                            }
                        });
                    }
                    Ok(())
                }
            }),
        );

        // Cloud property writes.
        let w = weak.clone();
        self.bus.subscribe(
            EventType::PropertySet,
            handler(move |event| {
                let w = w.clone();
                async move {
                    let Some(fw) = w.upgrade() else { return Ok(()) };
                    let props = event
                        .data
                        .as_object()
                        .ok_or_else(|| Error::protocol("invalid property data"))?
                        .clone();

                    for (name, value) in props {
                        fw.apply_property_set(&name, value).await;
                    }
                    Ok(())
                }
            }),
        );

        // Cloud service invocations.
        let w = weak;
        self.bus.subscribe(
            EventType::ServiceCall,
            handler(move |event| {
                let w = w.clone();
                async move {
                    let Some(fw) = w.upgrade() else { return Ok(()) };
                    let request: ServiceRequest = serde_json::from_value(event.data)
                        .map_err(|_| Error::protocol("invalid service request"))?;
                    fw.dispatch_service_call(request).await
                }
            }),
        );
    }

    /// Apply one cloud property write: run the registered setter when the
    /// property is writable, then notify every device.
    async fn apply_property_set(&self, name: &str, value: Value) {
        let setter = {
            let properties = self.properties.read().unwrap();
            match properties.get(name) {
                Some(entry) => match (&entry.setter, entry.mode) {
                    (Some(setter), _) => Some(setter.clone()),
                    (None, _) => {
                        warn!("property {name} rejects cloud writes (mode: r)");
                        None
                    }
                },
                None => None,
            }
        };

        if let Some(setter) = setter {
            if let Err(e) = setter(value.clone()) {
                error!("error setting property {name}: {e}");
            }
        }

        for (device_id, device) in self.device_snapshot() {
            let update = PropertyUpdate {
                name: name.to_string(),
                value: value.clone(),
            };
            if let Err(e) = device.on_property_set(update).await {
                warn!("device {device_id} on_property_set failed: {e}");
            }
        }
    }

    /// Route a service call: the registered handler wins; otherwise the
    /// request falls through each device until one accepts it.
    async fn dispatch_service_call(&self, request: ServiceRequest) -> Result<()> {
        let service_handler = {
            let services = self.services.read().unwrap();
            services.get(&request.service).cloned()
        };

        if let Some(service_handler) = service_handler {
            let mut response = match service_handler(request.params.clone()) {
                Ok(result) => ServiceResponse::ok(&request.id).with_data(result),
                Err(e) => ServiceResponse::failure(&request.id, e.to_string()),
            };
            response.service = Some(request.service.clone());
            return self
                .emit(Event::new(
                    EventType::ServiceResponse,
                    "framework",
                    serde_json::to_value(response)?,
                ))
                .await;
        }

        for (_, device) in self.device_snapshot() {
            if let Ok(mut response) = device.on_service_invoke(request.clone()).await {
                response.service = Some(request.service.clone());
                return self
                    .emit(Event::new(
                        EventType::ServiceResponse,
                        "framework",
                        serde_json::to_value(response)?,
                    ))
                    .await;
            }
        }

        warn!("service {} not found", request.service);
        Err(Error::not_found(format!(
            "service {} not found",
            request.service
        )))
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_config() -> Config {
        let mut config = Config::new();
        config.device.product_key = "A".to_string();
        config.device.device_name = "b".to_string();
        config.device.device_secret = "s".to_string();
        config.mqtt.host = "h".to_string();
        config.advanced.worker_count = 2;
        config
    }

    struct ProbeDevice {
        info: DeviceInfo,
        initialized: AtomicBool,
        destroyed: AtomicBool,
        property_sets: Arc<StdMutex<Vec<(String, Value)>>>,
    }

    impl ProbeDevice {
        fn new(pk: &str, dn: &str) -> Arc<Self> {
            Arc::new(Self {
                info: DeviceInfo::new(pk, dn),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                property_sets: Arc::new(StdMutex::new(Vec::new())),
            })
        }
    }

    #[async_trait]
    impl Device for ProbeDevice {
        fn device_info(&self) -> DeviceInfo {
            self.info.clone()
        }
        async fn on_initialize(&self) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn on_destroy(&self) -> Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn on_property_set(&self, update: PropertyUpdate) -> Result<()> {
            self.property_sets
                .lock()
                .unwrap()
                .push((update.name, update.value));
            Ok(())
        }
        async fn on_service_invoke(&self, request: ServiceRequest) -> Result<ServiceResponse> {
            if request.service == "toggle_door" {
                Ok(ServiceResponse::ok(request.id).with_data(json!({"door": "open"})))
            } else {
                Err(Error::not_found("unsupported"))
            }
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let fw = Framework::new(test_config());
        assert_eq!(fw.state(), LifecycleState::Uninitialized);

        fw.initialize().unwrap();
        assert_eq!(fw.state(), LifecycleState::Initialized);
        // Double initialize is an error.
        assert!(fw.initialize().is_err());

        let device = ProbeDevice::new("A", "b");
        fw.register_device(device.clone()).await.unwrap();

        fw.start().await.unwrap();
        assert_eq!(fw.state(), LifecycleState::Started);
        assert!(device.initialized.load(Ordering::SeqCst));

        fw.stop().await.unwrap();
        assert_eq!(fw.state(), LifecycleState::Stopped);
        assert!(device.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_error_not_panic() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();
        assert!(matches!(fw.stop().await, Err(Error::Lifecycle(_))));

        fw.start().await.unwrap();
        fw.stop().await.unwrap();
        // Double stop is an error but never panics.
        assert!(matches!(fw.stop().await, Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_duplicate_device_rejected() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();
        fw.register_device(ProbeDevice::new("A", "b")).await.unwrap();
        assert!(fw.register_device(ProbeDevice::new("A", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_device_registered_event_carries_id() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        fw.on(
            EventType::DeviceRegistered,
            handler(move |event| {
                let s = s.clone();
                async move {
                    s.lock()
                        .unwrap()
                        .push(event.data["device_id"].as_str().unwrap().to_string());
                    Ok(())
                }
            }),
        );
        fw.start().await.unwrap();

        fw.register_device(ProbeDevice::new("A", "b")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["A.b".to_string()]);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_property_set_invokes_setter_and_devices() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();

        let stored = Arc::new(StdMutex::new(json!(0)));
        let s = stored.clone();
        fw.register_property(
            "target_temperature",
            Arc::new(|| json!(0)),
            Some(Arc::new(move |v| {
                *s.lock().unwrap() = v;
                Ok(())
            })),
        );

        let device = ProbeDevice::new("A", "b");
        fw.register_device(device.clone()).await.unwrap();
        fw.start().await.unwrap();

        fw.emit(Event::new(
            EventType::PropertySet,
            "mqtt",
            json!({"target_temperature": 200}),
        ))
        .await
        .unwrap();

        assert_eq!(*stored.lock().unwrap(), json!(200));
        let sets = device.property_sets.lock().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].0, "target_temperature");
        assert_eq!(sets[0].1, json!(200));
        drop(sets);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_property_rejects_write_but_devices_still_notified() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();
        fw.register_property("serial", Arc::new(|| json!("sn-1")), None);

        let device = ProbeDevice::new("A", "b");
        fw.register_device(device.clone()).await.unwrap();
        fw.start().await.unwrap();

        fw.emit(Event::new(
            EventType::PropertySet,
            "mqtt",
            json!({"serial": "sn-2"}),
        ))
        .await
        .unwrap();

        assert_eq!(fw.property_value("serial"), Some(json!("sn-1")));
        assert_eq!(device.property_sets.lock().unwrap().len(), 1);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_call_prefers_registered_handler() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        fw.register_service(
            "toggle_door",
            Arc::new(move |_params| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"door": "toggled"}))
            }),
        );

        let responses = Arc::new(StdMutex::new(Vec::new()));
        let r = responses.clone();
        fw.on(
            EventType::ServiceResponse,
            handler(move |event| {
                let r = r.clone();
                async move {
                    r.lock().unwrap().push(event.data);
                    Ok(())
                }
            }),
        );
        fw.start().await.unwrap();

        let request = ServiceRequest::new("s7", "toggle_door", HashMap::new());
        fw.emit(Event::new(
            EventType::ServiceCall,
            "mqtt",
            serde_json::to_value(&request).unwrap(),
        ))
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "s7");
        assert_eq!(responses[0]["code"], 0);
        assert_eq!(responses[0]["data"]["door"], "toggled");
        drop(responses);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_call_falls_through_to_device() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();

        let responses = Arc::new(StdMutex::new(Vec::new()));
        let r = responses.clone();
        fw.on(
            EventType::ServiceResponse,
            handler(move |event| {
                let r = r.clone();
                async move {
                    r.lock().unwrap().push(event.data);
                    Ok(())
                }
            }),
        );

        fw.register_device(ProbeDevice::new("A", "b")).await.unwrap();
        fw.start().await.unwrap();

        let request = ServiceRequest::new("s7", "toggle_door", HashMap::new());
        fw.emit(Event::new(
            EventType::ServiceCall,
            "mqtt",
            serde_json::to_value(&request).unwrap(),
        ))
        .await
        .unwrap();

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "s7");
        assert_eq!(responses[0]["data"]["door"], "open");
        drop(responses);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service_surfaces_not_found() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();
        fw.start().await.unwrap();

        let request = ServiceRequest::new("s1", "nope", HashMap::new());
        let err = fw
            .emit(Event::new(
                EventType::ServiceCall,
                "mqtt",
                serde_json::to_value(&request).unwrap(),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_report_event_payload_shape() {
        let fw = Framework::new(test_config());
        fw.initialize().unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        fw.on(
            EventType::EventReport,
            handler(move |event| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(event.data);
                    Ok(())
                }
            }),
        );
        fw.start().await.unwrap();

        let mut data = HashMap::new();
        data.insert("door".to_string(), json!("open"));
        fw.report_event("door_opened", data).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["event_type"], "door_opened");
        assert_eq!(seen[0]["data"]["door"], "open");
        assert!(seen[0]["timestamp"].is_i64());
        drop(seen);
        fw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_service_registration_wins() {
        let fw = Framework::new(test_config());
        fw.register_service("s", Arc::new(|_| Ok(json!(1))));
        fw.register_service("s", Arc::new(|_| Ok(json!(2))));

        let services = fw.services.read().unwrap();
        let result = services.get("s").unwrap()(HashMap::new()).unwrap();
        assert_eq!(result, json!(2));
    }
}

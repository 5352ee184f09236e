//! Bluetooth Service Module
//!
//! [`ConnectionManager`] coordinates discovery, advertisement watches, connection,
//! recovery and command dispatch for the LED fixture.
//!
//! Per tracked device:
//!
//! ```text
//!   Idle ──watch──▶ Scanning ──advertisement──▶ Connecting ──▶ Connected
//!    ▲                 ▲                           │               │
//!    │ (selected)      │ (authorized)              ▼               ▼
//!    └──────────────── Disconnected ◀────── error / link lost ─────┘
//! ```
//!
//! The manager owns the single active connection. Other components get a weak
//! [`CommandSink`] or read the cached configuration, never the link itself.

use crate::domain::error::{ConnectError, ControlError, SendError};
use crate::domain::models::{
    AppEvent, Configuration, DeviceHandle, DeviceId, DeviceOrigin, LinkState, MessageSeverity,
    StatusMessage,
};
use crate::domain::zones::ZoneRegistry;
use crate::infrastructure::bluetooth::command_queue::{CommandQueue, CommandSink};
use crate::infrastructure::bluetooth::config_sync::{ConfigSync, SharedConfiguration};
use crate::infrastructure::bluetooth::connection::{
    BleConnector, ConnectionConfig, ConnectionResult,
};
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::scanner::AdvertisementWatch;
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, BleError, ControlCharacteristic, GattSession,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identity of an established connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub device: DeviceHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(ConnectionInfo),
    /// Another attempt or connection already owns the slot
    Ignored,
}

struct DeviceSlot {
    device: DeviceHandle,
    origin: DeviceOrigin,
    state: LinkState,
    watch: Option<AdvertisementWatch>,
}

struct ActiveConnection {
    info: ConnectionInfo,
    session: Arc<dyn GattSession>,
    characteristic: Arc<dyn ControlCharacteristic>,
    queue: CommandQueue,
    link_monitor: JoinHandle<()>,
}

impl ActiveConnection {
    async fn close(self) {
        self.link_monitor.abort();
        self.release().await;
    }

    /// Close without touching the link monitor; used from the monitor itself
    async fn release(self) {
        self.queue.close();
        if let Err(e) = self.characteristic.unsubscribe().await {
            debug!("Unsubscribe on close failed: {}", e);
        }
        if let Err(e) = self.session.close().await {
            warn!("Failed to close GATT session: {}", e);
        }
        info!("Connection {} to {} closed", self.info.id, self.info.device.id);
    }
}

#[derive(Default)]
struct ManagerState {
    slots: HashMap<DeviceId, DeviceSlot>,
    active: Option<ActiveConnection>,
    /// Bumped by `disconnect_all`; stale callbacks compare against it
    epoch: u64,
}

struct ManagerInner {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<ZoneRegistry>,
    config: ConnectionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config_sync: Arc<ConfigSync>,
    /// Held across the subscribe round-trip so one connection subscribes once
    subscribe_lock: tokio::sync::Mutex<()>,
    state: Mutex<ManagerState>,
    next_connection_id: AtomicU64,
}

/// Main Bluetooth service coordinating all BLE operations
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<ZoneRegistry>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let config_sync = ConfigSync::new(event_sender.clone());
        Self {
            inner: Arc::new(ManagerInner {
                adapter,
                registry,
                config,
                event_sender,
                config_sync,
                subscribe_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(ManagerState::default()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.inner.registry
    }

    pub fn state_of(&self, device: &DeviceId) -> LinkState {
        self.lock()
            .slots
            .get(device)
            .map_or(LinkState::Idle, |slot| slot.state)
    }

    pub fn active_connection(&self) -> Option<ConnectionInfo> {
        self.lock().active.as_ref().map(|c| c.info.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Previously authorized devices. Discovery failure reports and yields none.
    pub async fn list_authorized_devices(&self) -> Vec<DeviceHandle> {
        info!("Getting existing permitted Bluetooth devices...");
        match self.inner.adapter.authorized_devices().await {
            Ok(devices) => {
                info!("Got {} Bluetooth devices", devices.len());
                devices
            }
            Err(e) => {
                error!("Listing authorized devices failed: {}", e);
                self.report(ControlError::Discovery(e.to_string()));
                Vec::new()
            }
        }
    }

    /// Watch every authorized device; returns how many watches were armed
    pub async fn start(&self) -> usize {
        let devices = self.list_authorized_devices().await;
        devices
            .into_iter()
            .filter(|device| self.watch_for_advertisement(device.clone()))
            .count()
    }

    /// Track `device` as authorized and arm a watch for its next advertisement.
    ///
    /// Returns `false` when the device is already watched, connecting or connected.
    pub fn watch_for_advertisement(&self, device: DeviceHandle) -> bool {
        let mut state = self.lock();
        let epoch = state.epoch;
        let slot = state
            .slots
            .entry(device.id.clone())
            .or_insert_with(|| DeviceSlot {
                device: device.clone(),
                origin: DeviceOrigin::Authorized,
                state: LinkState::Idle,
                watch: None,
            });

        if slot.watch.is_some()
            || matches!(slot.state, LinkState::Connecting | LinkState::Connected)
        {
            debug!("{} already tracked in {:?}", device.id, slot.state);
            return false;
        }

        slot.origin = DeviceOrigin::Authorized;
        self.arm_watch(slot, epoch, Duration::ZERO);
        true
    }

    fn arm_watch(&self, slot: &mut DeviceSlot, epoch: u64, delay: Duration) {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        slot.watch = Some(AdvertisementWatch::spawn(
            self.inner.adapter.clone(),
            slot.device.clone(),
            delay,
            move |device, result| {
                if let Some(inner) = manager.upgrade() {
                    ConnectionManager::from_inner(inner).on_advertisement(device, epoch, result);
                }
            },
        ));
        self.set_state(slot, LinkState::Scanning);
    }

    fn on_advertisement(&self, device: DeviceHandle, epoch: u64, result: Result<(), BleError>) {
        {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }
            let Some(slot) = state.slots.get_mut(&device.id) else {
                return;
            };
            slot.watch = None;

            if let Err(e) = result {
                warn!("Advertisement watch for {} failed: {}", device.id, e);
                self.set_state(slot, LinkState::Idle);
                drop(state);
                self.report(ControlError::Discovery(e.to_string()));
                return;
            }
        }

        info!("Received advertisement from \"{}\"", device.display_name());
        let manager = self.clone();
        tokio::spawn(async move {
            let _ = manager.connect(device).await;
        });
    }

    /// Manual path: a device returned by the picker
    pub async fn select_device(
        &self,
        device: DeviceHandle,
    ) -> Result<ConnectOutcome, ConnectError> {
        self.connect(device).await
    }

    /// Connect to `device`; untracked devices are tracked as picker selections.
    ///
    /// While the device is connecting or connected, later attempts are ignored.
    pub async fn connect(&self, device: DeviceHandle) -> Result<ConnectOutcome, ConnectError> {
        let epoch = {
            let mut state = self.lock();
            let epoch = state.epoch;
            let busy_with = state
                .active
                .as_ref()
                .map(|active| active.info.device.id.clone());

            let slot = state
                .slots
                .entry(device.id.clone())
                .or_insert_with(|| DeviceSlot {
                    device: device.clone(),
                    origin: DeviceOrigin::Selected,
                    state: LinkState::Idle,
                    watch: None,
                });

            if matches!(slot.state, LinkState::Connecting | LinkState::Connected) {
                debug!("Ignoring connect to {}: already {:?}", device.id, slot.state);
                return Ok(ConnectOutcome::Ignored);
            }
            if let Some(other) = busy_with {
                info!("{} parked: {} holds the active connection", device.id, other);
                slot.watch = None;
                self.set_state(slot, LinkState::Idle);
                return Ok(ConnectOutcome::Ignored);
            }

            slot.watch = None;
            self.set_state(slot, LinkState::Connecting);
            epoch
        };

        let connector = BleConnector::new(self.inner.event_sender.clone(), self.inner.config.clone());
        match connector.connect(self.inner.adapter.as_ref(), &device).await {
            Ok(link) => Ok(self.install(device, epoch, link).await),
            Err(e) => {
                self.handle_connect_failure(&device.id, epoch, e.clone());
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        device: DeviceHandle,
        epoch: u64,
        link: ConnectionResult,
    ) -> ConnectOutcome {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            id,
            device: device.clone(),
        };

        let queue = CommandQueue::spawn(
            link.characteristic.clone(),
            self.inner.registry.clone(),
            self.inner.config.queue_depth,
            self.inner.event_sender.clone(),
        );

        let session = link.session.clone();
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let link_monitor = tokio::spawn(async move {
            session.disconnected().await;
            if let Some(inner) = manager.upgrade() {
                ConnectionManager::from_inner(inner).handle_link_lost(id).await;
            }
        });

        let connection = ActiveConnection {
            info: info.clone(),
            session: link.session,
            characteristic: link.characteristic,
            queue,
            link_monitor,
        };

        let rejected = {
            let mut state = self.lock();
            let in_epoch = state.epoch == epoch;
            let link_free = state.active.is_none();
            match state.slots.get_mut(&device.id) {
                Some(slot) if in_epoch && slot.state == LinkState::Connecting => {
                    if link_free {
                        self.set_state(slot, LinkState::Connected);
                        state.active = Some(connection);
                        None
                    } else {
                        // Another device won the race; park this one
                        self.set_state(slot, LinkState::Idle);
                        Some(connection)
                    }
                }
                _ => Some(connection),
            }
        };

        if let Some(connection) = rejected {
            info!("Discarding superseded connection to {}", device.id);
            connection.close().await;
            return ConnectOutcome::Ignored;
        }

        info!("Bluetooth device \"{}\" ready", device.display_name());
        ConnectOutcome::Connected(info)
    }

    fn handle_connect_failure(&self, device: &DeviceId, epoch: u64, error: ConnectError) {
        self.report(ControlError::Connect(error));

        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        if let Some(slot) = state.slots.get_mut(device) {
            if slot.state == LinkState::Connecting {
                self.set_state(slot, LinkState::Disconnected);
                self.recover(slot, epoch);
            }
        }
    }

    /// Disconnected → Scanning for authorized devices, Idle for picker selections
    fn recover(&self, slot: &mut DeviceSlot, epoch: u64) {
        match slot.origin {
            DeviceOrigin::Authorized => {
                self.arm_watch(slot, epoch, self.inner.config.reconnect_delay)
            }
            DeviceOrigin::Selected => self.set_state(slot, LinkState::Idle),
        }
    }

    async fn handle_link_lost(&self, connection_id: u64) {
        let connection = {
            let mut state = self.lock();
            if state.active.as_ref().map(|c| c.info.id) != Some(connection_id) {
                return;
            }
            let Some(connection) = state.active.take() else {
                return;
            };
            let epoch = state.epoch;

            warn!("Lost connection to {}", connection.info.device.id);
            self.send_log(
                &format!("Disconnected from {}", connection.info.device.display_name()),
                MessageSeverity::Warning,
            );

            for slot in state.slots.values_mut() {
                if slot.device.id == connection.info.device.id {
                    self.set_state(slot, LinkState::Disconnected);
                    self.recover(slot, epoch);
                } else if slot.origin == DeviceOrigin::Authorized
                    && slot.state == LinkState::Idle
                    && slot.watch.is_none()
                {
                    // Parked while the link was busy
                    self.arm_watch(slot, epoch, Duration::ZERO);
                }
            }
            connection
        };

        self.inner.config_sync.detach();
        connection.release().await;
    }

    /// Tear down the active connection and every watch. Idempotent.
    pub async fn disconnect_all(&self) {
        let (slots, active) = {
            let mut state = self.lock();
            state.epoch += 1;
            let slots: Vec<_> = state.slots.drain().collect();
            (slots, state.active.take())
        };

        for (id, slot) in slots {
            drop(slot.watch);
            if slot.state != LinkState::Idle {
                self.emit_state(&id, LinkState::Idle);
            }
        }

        self.inner.config_sync.detach();
        if let Some(connection) = active {
            connection.close().await;
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
    }

    /// Weak enqueue capability on the active connection
    pub fn command_sink(&self) -> Option<CommandSink> {
        self.lock().active.as_ref().map(|c| c.queue.sink())
    }

    pub fn send(&self, command: &Command) -> Result<(), SendError> {
        let sink = self.command_sink().ok_or(SendError::NotConnected)?;
        sink.send(command).inspect_err(|e| {
            if let SendError::Encoding(e) = e {
                self.report(ControlError::Encoding(e.clone()));
            }
        })
    }

    /// Subscribe to configuration notifications (once per connection) and ask the
    /// device for its configuration
    pub async fn request_config(&self) -> Result<(), SendError> {
        let (connection_id, characteristic, sink) = {
            let state = self.lock();
            let active = state.active.as_ref().ok_or(SendError::NotConnected)?;
            (
                active.info.id,
                active.characteristic.clone(),
                active.queue.sink(),
            )
        };

        let config_sync = &self.inner.config_sync;
        let subscribing = self.inner.subscribe_lock.lock().await;
        if !config_sync.is_attached(connection_id) {
            let notifications = characteristic
                .subscribe()
                .await
                .map_err(|e| SendError::Subscribe(e.to_string()))?;

            let still_active = self
                .lock()
                .active
                .as_ref()
                .is_some_and(|c| c.info.id == connection_id);
            if !still_active {
                return Err(SendError::NotConnected);
            }
            config_sync.attach(connection_id, notifications);
        }
        drop(subscribing);

        sink.send(&Command::RequestConfig)
    }

    pub fn current_configuration(&self) -> SharedConfiguration {
        self.inner.config_sync.current()
    }

    pub fn watch_configuration(&self) -> watch::Receiver<Option<Arc<Configuration>>> {
        self.inner.config_sync.watch()
    }

    fn set_state(&self, slot: &mut DeviceSlot, state: LinkState) {
        if slot.state != state {
            slot.state = state;
            self.emit_state(&slot.device.id, state);
        }
    }

    fn emit_state(&self, device: &DeviceId, state: LinkState) {
        debug!("{} -> {:?}", device, state);
        let _ = self.inner.event_sender.send(AppEvent::StateChanged {
            device: device.clone(),
            state,
        });
    }

    fn report(&self, error: ControlError) {
        self.send_log(&error.to_string(), MessageSeverity::Error);
        let _ = self.inner.event_sender.send(AppEvent::Error(error));
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.inner.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

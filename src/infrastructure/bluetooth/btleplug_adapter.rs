//! btleplug backend for the transport traits
//!
//! Devices are identified by their Bluetooth address string. "Authorized" devices
//! are the ones the user paired through the CLI and persisted in settings.

use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, BleError, ControlCharacteristic, GattSession, NotificationStream,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{future, Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backstop for platforms that drop or never deliver `DeviceDisconnected`
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on the best-effort disconnect after a failed open
const ABORT_TIMEOUT: Duration = Duration::from_secs(2);

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => BleError::NotFound("device".to_string()),
            btleplug::Error::NoSuchCharacteristic => {
                BleError::NotFound("characteristic".to_string())
            }
            btleplug::Error::NotConnected => BleError::DeviceUnavailable(e.to_string()),
            btleplug::Error::PermissionDenied => BleError::Adapter(e.to_string()),
            other => BleError::Gatt(other.to_string()),
        }
    }
}

/// A device seen during an interactive scan
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub handle: DeviceHandle,
    pub rssi: Option<i16>,
    /// Advertised the control service UUID
    pub is_fixture: bool,
}

pub struct BtleplugAdapter {
    adapter: Adapter,
    known: Vec<DeviceHandle>,
    service_uuid: Uuid,
    active_scans: Arc<AtomicUsize>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter
    pub async fn new(known: Vec<DeviceHandle>, service_uuid: Uuid) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::Adapter("No Bluetooth adapter found".to_string()))?;

        Ok(Self {
            adapter,
            known,
            service_uuid,
            active_scans: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Scan for `duration` and list every device seen (the device picker)
    pub async fn scan_for_devices(
        &self,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BleError> {
        info!("Scanning for BLE devices ({:?})...", duration);
        let _scan = self.start_scan().await?;
        tokio::time::sleep(duration).await;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let is_fixture = props.services.contains(&self.service_uuid);
            devices.push(DiscoveredDevice {
                handle: DeviceHandle::new(peripheral.address().to_string(), props.local_name),
                rssi: props.rssi,
                is_fixture,
            });
        }

        // Fixtures first, then by signal strength
        devices.sort_by_key(|d| (!d.is_fixture, std::cmp::Reverse(d.rssi)));
        info!("Found {} devices", devices.len());
        Ok(devices)
    }

    async fn start_scan(&self) -> Result<ScanGuard, BleError> {
        if self.active_scans.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                self.active_scans.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
            debug!("BLE scan started");
        }
        Ok(ScanGuard {
            adapter: self.adapter.clone(),
            active_scans: self.active_scans.clone(),
        })
    }

    async fn find_peripheral(&self, device: &DeviceHandle) -> Result<Peripheral, BleError> {
        for peripheral in self.adapter.peripherals().await? {
            if matches_address(&peripheral, device) {
                return Ok(peripheral);
            }
        }
        Err(BleError::DeviceUnavailable(device.id.to_string()))
    }

    async fn is_device(&self, id: &PeripheralId, device: &DeviceHandle) -> bool {
        match self.adapter.peripheral(id).await {
            Ok(peripheral) => matches_address(&peripheral, device),
            Err(_) => false,
        }
    }
}

fn matches_address(peripheral: &Peripheral, device: &DeviceHandle) -> bool {
    peripheral
        .address()
        .to_string()
        .eq_ignore_ascii_case(device.id.as_str())
}

/// Scanning stays on while any guard is alive
struct ScanGuard {
    adapter: Adapter,
    active_scans: Arc<AtomicUsize>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if self.active_scans.fetch_sub(1, Ordering::SeqCst) == 1 {
            let adapter = self.adapter.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop BLE scan: {}", e);
                    }
                });
            }
        }
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, BleError> {
        Ok(self.known.clone())
    }

    async fn watch_advertisement(&self, device: &DeviceHandle) -> Result<(), BleError> {
        let mut events = self.adapter.events().await?;
        let _scan = self.start_scan().await?;

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                | CentralEvent::ServiceDataAdvertisement { id, .. }
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                _ => continue,
            };
            if self.is_device(&id, device).await {
                debug!("Advertisement from {}", device.id);
                return Ok(());
            }
        }

        Err(BleError::Adapter("adapter event stream ended".to_string()))
    }

    async fn open_session(&self, device: &DeviceHandle) -> Result<Arc<dyn GattSession>, BleError> {
        let peripheral = self.find_peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(Arc::new(BtleplugSession {
            adapter: self.adapter.clone(),
            peripheral,
        }))
    }

    async fn abort_session(&self, device: &DeviceHandle) -> Result<(), BleError> {
        let peripheral = self.find_peripheral(device).await?;
        // Cancels a connect the platform is still completing
        match tokio::time::timeout(ABORT_TIMEOUT, peripheral.disconnect()).await {
            Ok(result) => result.map_err(BleError::from),
            Err(_) => Err(BleError::Gatt("disconnect timed out".to_string())),
        }
    }
}

struct BtleplugSession {
    adapter: Adapter,
    peripheral: Peripheral,
}

#[async_trait]
impl GattSession for BtleplugSession {
    async fn resolve_service(&self, service: Uuid) -> Result<bool, BleError> {
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.services().iter().any(|s| s.uuid == service))
    }

    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn ControlCharacteristic>, BleError> {
        let found = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| BleError::NotFound(format!("characteristic {characteristic}")))?;

        Ok(Arc::new(BtleplugCharacteristic {
            peripheral: self.peripheral.clone(),
            characteristic: found,
        }))
    }

    async fn disconnected(&self) {
        let id = self.peripheral.id();
        let events = match self.adapter.events().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("No adapter events, polling link state: {}", e);
                None
            }
        };

        let peripheral = &self.peripheral;
        wait_for_link_loss(
            events,
            |event| matches!(event, CentralEvent::DeviceDisconnected(lost) if *lost == id),
            || async move { peripheral.is_connected().await.unwrap_or(false) },
            LINK_POLL_INTERVAL,
        )
        .await;
    }

    async fn close(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Resolve once the link is gone.
///
/// `events` must be subscribed before the call. The link state is checked right
/// away and then every `poll`, so a drop that happened before subscribing, or a
/// missed event, is still noticed.
async fn wait_for_link_loss<S, C, F>(
    mut events: Option<S>,
    is_lost: impl Fn(&S::Item) -> bool,
    is_connected: C,
    poll: Duration,
) where
    S: Stream + Unpin,
    C: Fn() -> F,
    F: Future<Output = bool>,
{
    let mut ticks = tokio::time::interval(poll);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = next_or_pending(&mut events) => match event {
                Some(event) if is_lost(&event) => return,
                Some(_) => {}
                None => {
                    debug!("Adapter event stream ended, polling link state");
                    events = None;
                }
            },
            _ = ticks.tick() => {
                if !is_connected().await {
                    return;
                }
            }
        }
    }
}

async fn next_or_pending<S: Stream + Unpin>(events: &mut Option<S>) -> Option<S::Item> {
    match events {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl ControlCharacteristic for BtleplugCharacteristic {
    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        self.peripheral
            .write(&self.characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, BleError> {
        self.peripheral.subscribe(&self.characteristic).await?;
        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter(move |n| future::ready(n.uuid == uuid))
            .map(|n| n.value)
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<(), BleError> {
        self.peripheral.unsubscribe(&self.characteristic).await?;
        Ok(())
    }
}

//! BLE Transport Seams
//!
//! The connection core talks to the platform BLE stack only through these traits.
//! [`btleplug_adapter`](super::btleplug_adapter) is the production implementation.

use crate::domain::models::DeviceHandle;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Notification payloads from the control characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth adapter error: {0}")]
    Adapter(String),

    #[error("device {0} not available")]
    DeviceUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("GATT error: {0}")]
    Gatt(String),
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Devices the user authorized earlier. They may be out of range.
    async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, BleError>;

    /// Resolve once a single advertisement from `device` is observed.
    ///
    /// Dropping the future stops the watch.
    async fn watch_advertisement(&self, device: &DeviceHandle) -> Result<(), BleError>;

    async fn open_session(&self, device: &DeviceHandle) -> Result<Arc<dyn GattSession>, BleError>;

    /// Tear down any platform link left behind by an `open_session` that failed
    /// or was dropped before returning a session.
    async fn abort_session(&self, device: &DeviceHandle) -> Result<(), BleError>;
}

#[async_trait]
pub trait GattSession: Send + Sync {
    /// Look up a primary service; `Ok(false)` when the device does not expose it
    async fn resolve_service(&self, service: Uuid) -> Result<bool, BleError>;

    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn ControlCharacteristic>, BleError>;

    /// Resolve when the link drops
    async fn disconnected(&self);

    async fn close(&self) -> Result<(), BleError>;
}

#[async_trait]
pub trait ControlCharacteristic: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), BleError>;

    async fn subscribe(&self) -> Result<NotificationStream, BleError>;

    async fn unsubscribe(&self) -> Result<(), BleError>;
}

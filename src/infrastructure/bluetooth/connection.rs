//! BLE Connection Module
//!
//! Opens the GATT session and resolves the control service and characteristic,
//! all under one caller-supplied deadline.

use crate::domain::error::{ConnectCause, ConnectError, ConnectStage};
use crate::domain::models::{AppEvent, DeviceHandle, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, BleError, ControlCharacteristic, GattSession,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Control characteristic UUID
    pub control_char_uuid: Uuid,
    /// Bound on session open plus service and characteristic lookup
    pub connect_timeout: Duration,
    /// Wait before re-arming a watch after a failure or drop
    pub reconnect_delay: Duration,
    /// Maximum pending commands per connection
    pub queue_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b),
            control_char_uuid: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            queue_depth: 32,
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            control_char_uuid: protocol::parse_uuid(&settings.ble_control_char_uuid)?,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            queue_depth: settings.command_queue_depth.max(1),
        })
    }
}

/// Result of a successful connection
pub struct ConnectionResult {
    pub session: Arc<dyn GattSession>,
    pub characteristic: Arc<dyn ControlCharacteristic>,
}

/// BLE Connection handler
pub struct BleConnector {
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl BleConnector {
    /// Create a new connection handler
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>, config: ConnectionConfig) -> Self {
        Self {
            event_sender,
            config,
        }
    }

    /// Connect to a device.
    ///
    /// A session opened by a failed attempt is closed before the error returns.
    pub async fn connect(
        &self,
        adapter: &dyn BleAdapter,
        device: &DeviceHandle,
    ) -> Result<ConnectionResult, ConnectError> {
        info!("Connecting to GATT server of \"{}\"...", device.display_name());
        self.send_log(
            &format!("Connecting to {}...", device.display_name()),
            MessageSeverity::Info,
        );

        let deadline = Instant::now() + self.config.connect_timeout;

        // Step 1: Open the GATT session. A timed-out or failed open may leave the
        // platform link half-established, so tear it down before reporting.
        let session = match self
            .stage(device, ConnectStage::OpenSession, deadline, adapter.open_session(device))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                if let Err(abort_err) = adapter.abort_session(device).await {
                    warn!("Failed to abort session after failed open: {}", abort_err);
                }
                return Err(e);
            }
        };
        info!("Device \"{}\" connected", device.display_name());

        // Steps 2-3: Resolve service and characteristic, releasing the session on failure
        match self.resolve(device, session.as_ref(), deadline).await {
            Ok(characteristic) => {
                self.send_log("Connected!", MessageSeverity::Success);
                Ok(ConnectionResult {
                    session,
                    characteristic,
                })
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!("Failed to close session after failed connect: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        &self,
        device: &DeviceHandle,
        session: &dyn GattSession,
        deadline: Instant,
    ) -> Result<Arc<dyn ControlCharacteristic>, ConnectError> {
        let service_uuid = self.config.service_uuid;
        let found = self
            .stage(
                device,
                ConnectStage::ResolveService,
                deadline,
                session.resolve_service(service_uuid),
            )
            .await?;
        if !found {
            error!("Control service {} not found", service_uuid);
            return Err(ConnectError {
                device: device.id.clone(),
                stage: ConnectStage::ResolveService,
                cause: ConnectCause::Failed(format!("service {service_uuid} not found")),
            });
        }
        info!("Found control service");

        let characteristic = self
            .stage(
                device,
                ConnectStage::ResolveCharacteristic,
                deadline,
                session.resolve_characteristic(service_uuid, self.config.control_char_uuid),
            )
            .await?;
        info!("Found control characteristic");
        Ok(characteristic)
    }

    async fn stage<T>(
        &self,
        device: &DeviceHandle,
        stage: ConnectStage,
        deadline: Instant,
        step: impl Future<Output = Result<T, BleError>>,
    ) -> Result<T, ConnectError> {
        let cause = match tokio::time::timeout_at(deadline, step).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => ConnectCause::Failed(e.to_string()),
            Err(_) => ConnectCause::Timeout,
        };

        error!("Connect to {} failed while {}: {}", device.id, stage, cause);
        Err(ConnectError {
            device: device.id.clone(),
            stage,
            cause,
        })
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::FakeAdapter;

    fn connector(timeout: Duration) -> BleConnector {
        let (tx, _rx) = mpsc::unbounded_channel();
        BleConnector::new(
            tx,
            ConnectionConfig {
                connect_timeout: timeout,
                ..ConnectionConfig::default()
            },
        )
    }

    #[test]
    fn test_default_uuids_match_protocol() {
        let config = ConnectionConfig::default();
        assert_eq!(config.service_uuid.to_string(), protocol::SERVICE_UUID);
        assert_eq!(config.control_char_uuid.to_string(), protocol::CONTROL_CHAR_UUID);

        let from_settings = ConnectionConfig::from_settings(&Settings::default()).unwrap();
        assert_eq!(from_settings.service_uuid, config.service_uuid);
        assert_eq!(from_settings.connect_timeout, config.connect_timeout);
    }

    #[tokio::test]
    async fn test_connect_resolves_characteristic() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:10", "fixture");

        let result = connector(Duration::from_secs(1))
            .connect(adapter.as_ref(), &device)
            .await;
        assert!(result.is_ok());
        assert_eq!(adapter.sessions_opened(), 1);
        assert_eq!(adapter.sessions_closed(), 0);
        assert_eq!(adapter.sessions_aborted(), 0);
    }

    #[tokio::test]
    async fn test_failed_stage_releases_session() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:11", "fixture");
        adapter.fail_stage(Some(ConnectStage::ResolveCharacteristic));

        let err = connector(Duration::from_secs(1))
            .connect(adapter.as_ref(), &device)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage, ConnectStage::ResolveCharacteristic);
        assert!(!err.is_timeout());
        assert_eq!(adapter.sessions_opened(), 1);
        assert_eq!(adapter.sessions_closed(), 1);
        assert_eq!(adapter.sessions_aborted(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_aborts_platform_link() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:14", "fixture");
        adapter.fail_stage(Some(ConnectStage::OpenSession));

        let err = connector(Duration::from_secs(1))
            .connect(adapter.as_ref(), &device)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage, ConnectStage::OpenSession);
        assert!(!err.is_timeout());
        assert_eq!(adapter.sessions_opened(), 0);
        assert_eq!(adapter.sessions_aborted(), 1);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:12", "fixture");
        adapter.hide_service(true);

        let err = connector(Duration::from_secs(1))
            .connect(adapter.as_ref(), &device)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage, ConnectStage::ResolveService);
        assert_eq!(adapter.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_slow_stage_times_out() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:13", "fixture");
        adapter.set_stage_delay(Duration::from_secs(5));

        let err = connector(Duration::from_millis(30))
            .connect(adapter.as_ref(), &device)
            .await
            .err()
            .unwrap();
        assert!(err.is_timeout());
        assert_eq!(err.stage, ConnectStage::OpenSession);
        assert_eq!(adapter.sessions_closed(), 0);
        assert_eq!(adapter.sessions_aborted(), 1);
    }
}

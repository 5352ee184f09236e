//! Configuration Sync
//!
//! Caches the device-reported configuration. Each notification decodes on its own
//! and replaces the cache wholesale; a payload that fails to decode leaves the
//! previous configuration in place.

use crate::domain::error::{ControlError, DecodeError};
use crate::domain::models::{AppEvent, Configuration};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::NotificationStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type SharedConfiguration = Option<Arc<Configuration>>;

struct Subscription {
    connection_id: u64,
    task: JoinHandle<()>,
}

pub struct ConfigSync {
    current: watch::Sender<SharedConfiguration>,
    subscription: Mutex<Option<Subscription>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConfigSync {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Arc<Self> {
        let (current, _) = watch::channel(None);
        Arc::new(Self {
            current,
            subscription: Mutex::new(None),
            event_sender,
        })
    }

    /// Latest decoded configuration, if any arrived on this connection
    pub fn current(&self) -> SharedConfiguration {
        self.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SharedConfiguration> {
        self.current.subscribe()
    }

    /// Decode one notification and replace the cache.
    ///
    /// Empty notifications acknowledge plain commands and return `Ok(None)`.
    pub fn apply_notification(
        &self,
        bytes: &[u8],
    ) -> Result<Option<Arc<Configuration>>, DecodeError> {
        if protocol::is_empty_notification(bytes) {
            return Ok(None);
        }

        match protocol::decode_configuration(bytes) {
            Ok(config) => {
                let config = Arc::new(config);
                info!(
                    "Configuration synced: mode {}, {} zones",
                    config.mode,
                    config.zones.len()
                );
                self.current.send_replace(Some(config.clone()));
                let _ = self
                    .event_sender
                    .send(AppEvent::Configuration(config.clone()));
                Ok(Some(config))
            }
            Err(e) => {
                warn!("Ignoring configuration notification: {}", e);
                let _ = self
                    .event_sender
                    .send(AppEvent::Error(ControlError::Decode(e.clone())));
                Err(e)
            }
        }
    }

    pub fn is_attached(&self, connection_id: u64) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.connection_id == connection_id && !s.task.is_finished())
    }

    /// Consume `notifications` for `connection_id`, replacing any earlier subscription
    pub fn attach(self: &Arc<Self>, connection_id: u64, notifications: NotificationStream) {
        let sync: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(bytes) = notifications.next().await {
                let Some(sync) = sync.upgrade() else {
                    break;
                };
                let _ = sync.apply_notification(&bytes);
            }
            debug!("Notification stream for connection {} ended", connection_id);
        });

        if let Some(previous) = self.lock().replace(Subscription {
            connection_id,
            task,
        }) {
            previous.task.abort();
        }
    }

    /// Stop listening and forget the cached configuration
    pub fn detach(&self) {
        if let Some(subscription) = self.lock().take() {
            subscription.task.abort();
        }
        self.current.send_replace(None);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConfigSync {
    fn drop(&mut self) {
        if let Some(subscription) = self.lock().take() {
            subscription.task.abort();
        }
    }
}

//! BLE Scanner Module
//!
//! Advertisement watches for authorized devices. Each watch is an explicit
//! subscription object: it fires at most once and is cancelled when dropped.

use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::transport::{BleAdapter, BleError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One pending advertisement watch for one device
pub struct AdvertisementWatch {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AdvertisementWatch {
    /// Start watching `device`, optionally after `delay`.
    ///
    /// `on_advertisement` runs at most once: with `Ok` for the first advertisement,
    /// or with the adapter error. It never runs after cancellation.
    pub fn spawn<F>(
        adapter: Arc<dyn BleAdapter>,
        device: DeviceHandle,
        delay: Duration,
        on_advertisement: F,
    ) -> Self
    where
        F: FnOnce(DeviceHandle, Result<(), BleError>) + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let watch = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                info!("Watching advertisements from \"{}\"...", device.display_name());
                adapter.watch_advertisement(&device).await
            };

            let result = tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!("Advertisement watch for {} cancelled", device.id);
                    return;
                }
                result = watch => result,
            };

            // Stop watching before handing off so a second advertisement can't fire.
            cancelled.cancel();
            on_advertisement(device, result);
        });

        Self { token, task }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AdvertisementWatch {
    fn drop(&mut self) {
        // The callback may be dropping this watch from inside its own task, so only
        // signal; never abort.
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::FakeAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_watch_fires_once() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:01", "fixture");
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let watch = AdvertisementWatch::spawn(
            adapter.clone(),
            device.clone(),
            Duration::ZERO,
            move |_, result| {
                assert!(result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        adapter.wait_for_watchers(&device.id, 1).await;
        adapter.advertise(&device.id);
        adapter.advertise(&device.id);

        crate::infrastructure::bluetooth::testing::wait_until(|| watch.is_finished()).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watch.is_cancelled());
        assert_eq!(adapter.watcher_count(&device.id), 0);
    }

    #[tokio::test]
    async fn test_dropped_watch_never_fires() {
        let adapter = FakeAdapter::new();
        let device = adapter.add_device("AA:02", "fixture");
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let watch = AdvertisementWatch::spawn(
            adapter.clone(),
            device.clone(),
            Duration::ZERO,
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        adapter.wait_for_watchers(&device.id, 1).await;
        drop(watch);

        crate::infrastructure::bluetooth::testing::wait_until(|| {
            adapter.watcher_count(&device.id) == 0
        })
        .await;
        adapter.advertise(&device.id);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

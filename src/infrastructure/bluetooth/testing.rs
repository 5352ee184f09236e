//! In-memory BLE stack for tests

use crate::domain::error::ConnectStage;
use crate::domain::models::{DeviceHandle, DeviceId};
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, BleError, ControlCharacteristic, GattSession, NotificationStream,
};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct Script {
    discovery_error: Option<BleError>,
    fail_stage: Option<ConnectStage>,
    hide_service: bool,
    stage_delay: Duration,
}

pub struct FakeAdapter {
    devices: Mutex<Vec<DeviceHandle>>,
    script: Mutex<Script>,
    adverts: broadcast::Sender<DeviceId>,
    watchers: Mutex<HashMap<DeviceId, usize>>,
    sessions_opened: AtomicUsize,
    sessions_closed: Arc<AtomicUsize>,
    sessions_aborted: AtomicUsize,
    links: Mutex<Vec<CancellationToken>>,
    pub characteristic: Arc<FakeCharacteristic>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        let (adverts, _) = broadcast::channel(16);
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            adverts,
            watchers: Mutex::new(HashMap::new()),
            sessions_opened: AtomicUsize::new(0),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
            sessions_aborted: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            characteristic: FakeCharacteristic::new(),
        })
    }

    pub fn add_device(&self, id: &str, name: &str) -> DeviceHandle {
        let device = DeviceHandle::new(id, Some(name.to_string()));
        self.devices.lock().unwrap().push(device.clone());
        device
    }

    pub fn fail_discovery(&self, error: Option<BleError>) {
        self.script.lock().unwrap().discovery_error = error;
    }

    pub fn fail_stage(&self, stage: Option<ConnectStage>) {
        self.script.lock().unwrap().fail_stage = stage;
    }

    pub fn hide_service(&self, hidden: bool) {
        self.script.lock().unwrap().hide_service = hidden;
    }

    pub fn set_stage_delay(&self, delay: Duration) {
        self.script.lock().unwrap().stage_delay = delay;
    }

    pub fn advertise(&self, id: &DeviceId) {
        let _ = self.adverts.send(id.clone());
    }

    pub fn watcher_count(&self, id: &DeviceId) -> usize {
        self.watchers.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub async fn wait_for_watchers(&self, id: &DeviceId, count: usize) {
        wait_until(|| self.watcher_count(id) == count).await;
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn sessions_aborted(&self) -> usize {
        self.sessions_aborted.load(Ordering::SeqCst)
    }

    /// Simulate the peripheral dropping every open link
    pub fn drop_links(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.cancel();
        }
    }

    async fn step(&self, stage: ConnectStage) -> Result<(), BleError> {
        let (delay, fail) = {
            let script = self.script.lock().unwrap();
            (script.stage_delay, script.fail_stage == Some(stage))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        if fail {
            return Err(BleError::Gatt(format!("scripted failure at {stage}")));
        }
        Ok(())
    }
}

struct WatcherGuard<'a> {
    watchers: &'a Mutex<HashMap<DeviceId, usize>>,
    id: DeviceId,
}

impl<'a> WatcherGuard<'a> {
    fn new(watchers: &'a Mutex<HashMap<DeviceId, usize>>, id: DeviceId) -> Self {
        *watchers.lock().unwrap().entry(id.clone()).or_default() += 1;
        Self { watchers, id }
    }
}

impl Drop for WatcherGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.watchers.lock().unwrap().get_mut(&self.id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, BleError> {
        if let Some(e) = self.script.lock().unwrap().discovery_error.clone() {
            return Err(e);
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn watch_advertisement(&self, device: &DeviceHandle) -> Result<(), BleError> {
        let mut adverts = self.adverts.subscribe();
        let _guard = WatcherGuard::new(&self.watchers, device.id.clone());
        loop {
            match adverts.recv().await {
                Ok(id) if id == device.id => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BleError::Adapter("advertisement feed closed".into()))
                }
            }
        }
    }

    async fn open_session(&self, device: &DeviceHandle) -> Result<Arc<dyn GattSession>, BleError> {
        self.step(ConnectStage::OpenSession).await?;
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);

        let link = CancellationToken::new();
        self.links.lock().unwrap().push(link.clone());
        let hide_service = self.script.lock().unwrap().hide_service;

        Ok(Arc::new(FakeSession {
            adapter_script_failure: self.script.lock().unwrap().fail_stage,
            hide_service,
            link,
            closed: self.sessions_closed.clone(),
            characteristic: self.characteristic.clone(),
            device: device.id.clone(),
        }))
    }

    async fn abort_session(&self, _device: &DeviceHandle) -> Result<(), BleError> {
        self.sessions_aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeSession {
    adapter_script_failure: Option<ConnectStage>,
    hide_service: bool,
    link: CancellationToken,
    closed: Arc<AtomicUsize>,
    characteristic: Arc<FakeCharacteristic>,
    device: DeviceId,
}

#[async_trait]
impl GattSession for FakeSession {
    async fn resolve_service(&self, _service: Uuid) -> Result<bool, BleError> {
        tokio::task::yield_now().await;
        if self.adapter_script_failure == Some(ConnectStage::ResolveService) {
            return Err(BleError::Gatt("scripted service failure".into()));
        }
        Ok(!self.hide_service)
    }

    async fn resolve_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn ControlCharacteristic>, BleError> {
        tokio::task::yield_now().await;
        if self.adapter_script_failure == Some(ConnectStage::ResolveCharacteristic) {
            return Err(BleError::NotFound(format!(
                "characteristic {characteristic} on {}",
                self.device
            )));
        }
        Ok(self.characteristic.clone())
    }

    async fn disconnected(&self) {
        self.link.cancelled().await;
    }

    async fn close(&self) -> Result<(), BleError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.link.cancel();
        Ok(())
    }
}

pub struct FakeCharacteristic {
    writes: Mutex<Vec<String>>,
    started: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    failing: Mutex<Vec<String>>,
    notifier: Mutex<Option<fmpsc::UnboundedSender<Vec<u8>>>>,
    subscribed: AtomicBool,
    subscriptions: AtomicUsize,
}

impl FakeCharacteristic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            gate: Mutex::new(None),
            failing: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            subscriptions: AtomicUsize::new(0),
        })
    }

    /// Completed writes, in wire order
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Block writes until [`open_writes`](Self::open_writes)
    pub fn hold_writes(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_writes(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1024);
        }
    }

    pub fn fail_payload(&self, payload: &str) {
        self.failing.lock().unwrap().push(payload.to_string());
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Successful `subscribe` calls so far
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Push a notification to the current subscriber
    pub fn notify(&self, payload: &[u8]) {
        if let Some(tx) = self.notifier.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(payload.to_vec());
        }
    }
}

#[async_trait]
impl ControlCharacteristic for FakeCharacteristic {
    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let text = String::from_utf8_lossy(data).into_owned();
        if self.failing.lock().unwrap().contains(&text) {
            return Err(BleError::Gatt(format!("scripted write failure for {text}")));
        }
        self.writes.lock().unwrap().push(text);
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, BleError> {
        // A real CCCD write round-trips to the device
        tokio::task::yield_now().await;
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = fmpsc::unbounded();
        *self.notifier.lock().unwrap() = Some(tx);
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self) -> Result<(), BleError> {
        self.notifier.lock().unwrap().take();
        self.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

//! Command Queue
//!
//! Serializes writes to the control characteristic: one writer task per connection,
//! one write in flight, FIFO order.
//!
//! Continuous controls (color and brightness drags) coalesce. A command with a
//! [`CoalesceKey`] removes any still-pending command for the same key and joins the
//! back of the queue. While a write is in flight, any burst of commands to one target
//! therefore costs at most one extra write: five brightness updates sent during a
//! single in-flight write reach the wire as two writes.

use crate::domain::error::{ControlError, SendError, WriteError};
use crate::domain::models::AppEvent;
use crate::domain::zones::ZoneRegistry;
use crate::infrastructure::bluetooth::protocol::{CoalesceKey, Command};
use crate::infrastructure::bluetooth::transport::ControlCharacteristic;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Pending {
    key: Option<CoalesceKey>,
    payload: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    in_flight: bool,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Notify,
    drained: Notify,
    registry: Arc<ZoneRegistry>,
    depth: usize,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, command: &Command) -> Result<(), SendError> {
        let payload = command.encode(&self.registry)?;
        let key = command.coalesce_key();

        {
            let mut state = self.lock();
            if state.closed {
                return Err(SendError::NotConnected);
            }
            if let Some(key) = key {
                state.pending.retain(|p| p.key != Some(key));
            }
            if state.pending.len() >= self.depth {
                return Err(SendError::QueueFull { depth: self.depth });
            }
            debug!("Queued {:?} ({} pending)", payload, state.pending.len() + 1);
            state.pending.push_back(Pending { key, payload });
        }

        self.wake.notify_one();
        Ok(())
    }

    fn is_idle(state: &QueueState) -> bool {
        state.closed || (state.pending.is_empty() && !state.in_flight)
    }
}

/// Write queue owned by one connection
pub struct CommandQueue {
    shared: Arc<QueueShared>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    pub fn spawn(
        characteristic: Arc<dyn ControlCharacteristic>,
        registry: Arc<ZoneRegistry>,
        depth: usize,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            drained: Notify::new(),
            registry,
            depth: depth.max(1),
        });

        let worker = tokio::spawn(run_writer(shared.clone(), characteristic, event_sender));

        Self { shared, worker }
    }

    /// Weak enqueue capability for other components
    pub fn sink(&self) -> CommandSink {
        CommandSink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Drop pending commands and stop the writer
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.pending.clear();
        }
        self.shared.wake.notify_one();
        self.shared.drained.notify_waiters();
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.close();
        self.worker.abort();
    }
}

async fn run_writer(
    shared: Arc<QueueShared>,
    characteristic: Arc<dyn ControlCharacteristic>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
) {
    loop {
        let next = {
            let mut state = shared.lock();
            if state.closed {
                return;
            }
            let next = state.pending.pop_front();
            state.in_flight = next.is_some();
            next
        };

        let Some(command) = next else {
            shared.drained.notify_waiters();
            shared.wake.notified().await;
            continue;
        };

        debug!("Writing {:?}", command.payload);
        if let Err(e) = characteristic.write(command.payload.as_bytes()).await {
            warn!("Dropping command {:?}: {}", command.payload, e);
            let _ = event_sender.send(AppEvent::Error(ControlError::Write(WriteError {
                command: command.payload,
                cause: e.to_string(),
            })));
        }

        shared.lock().in_flight = false;
    }
}

/// Transient capability to enqueue commands on the active connection.
///
/// Holds the queue weakly; every call fails with [`SendError::NotConnected`] once
/// the connection is gone.
#[derive(Clone)]
pub struct CommandSink {
    shared: Weak<QueueShared>,
}

impl CommandSink {
    pub fn send(&self, command: &Command) -> Result<(), SendError> {
        let shared = self.shared.upgrade().ok_or(SendError::NotConnected)?;
        shared.enqueue(command)
    }

    pub fn is_live(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.lock().closed)
    }

    /// Wait until every queued command has been written (or the queue closed)
    pub async fn flush(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        loop {
            let drained = shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if QueueShared::is_idle(&shared.lock()) {
                return;
            }
            drained.await;
        }
    }
}

impl std::fmt::Debug for CommandSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSink")
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::EncodingError;
    use crate::domain::models::{Color, Mode};
    use crate::infrastructure::bluetooth::testing::{wait_until, FakeCharacteristic};

    fn queue(
        characteristic: &Arc<FakeCharacteristic>,
        depth: usize,
    ) -> (CommandQueue, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = CommandQueue::spawn(
            characteristic.clone(),
            Arc::new(ZoneRegistry::default()),
            depth,
            tx,
        );
        (queue, rx)
    }

    fn brightness(value: i32) -> Command {
        Command::SetMaskedState {
            mask: 511,
            color: Color::new(0xff, 0, 0),
            brightness: value,
            mode: Mode::simple(),
        }
    }

    #[tokio::test]
    async fn test_writes_in_fifo_order() {
        let characteristic = FakeCharacteristic::new();
        let (queue, _rx) = queue(&characteristic, 32);
        let sink = queue.sink();

        sink.send(&Command::PowerOn).unwrap();
        sink.send(&Command::SetMode(Mode::named("EYES"))).unwrap();
        sink.send(&Command::SetGlobalColor(Color::new(1, 2, 3))).unwrap();
        sink.send(&Command::Breath).unwrap();
        sink.flush().await;

        assert_eq!(
            characteristic.writes(),
            vec!["ON", "MODE:EYES", "COLOR:010203", "BREATH"]
        );
    }

    #[tokio::test]
    async fn test_rapid_slider_coalesces_while_write_in_flight() {
        let characteristic = FakeCharacteristic::new();
        characteristic.hold_writes();
        let (queue, _rx) = queue(&characteristic, 32);
        let sink = queue.sink();

        sink.send(&brightness(10)).unwrap();
        wait_until(|| characteristic.writes_started() == 1).await;

        for value in [20, 30, 40, 50] {
            sink.send(&brightness(value)).unwrap();
        }
        characteristic.open_writes();
        sink.flush().await;

        assert_eq!(
            characteristic.writes(),
            vec!["MASK:511:ff0000:10:SIMPLE", "MASK:511:ff0000:50:SIMPLE"]
        );
    }

    #[tokio::test]
    async fn test_coalescing_keeps_other_targets_in_order() {
        let characteristic = FakeCharacteristic::new();
        characteristic.hold_writes();
        let (queue, _rx) = queue(&characteristic, 32);
        let sink = queue.sink();

        sink.send(&Command::PowerOn).unwrap();
        wait_until(|| characteristic.writes_started() == 1).await;

        sink.send(&Command::SetZoneColor { zone: 1, color: Color::new(1, 1, 1) }).unwrap();
        sink.send(&Command::SetMode(Mode::named("RANDOM"))).unwrap();
        sink.send(&Command::SetZoneColor { zone: 2, color: Color::new(2, 2, 2) }).unwrap();
        sink.send(&Command::SetZoneColor { zone: 1, color: Color::new(9, 9, 9) }).unwrap();
        characteristic.open_writes();
        sink.flush().await;

        assert_eq!(
            characteristic.writes(),
            vec!["ON", "MODE:RANDOM", "SCOLOR:2:020202", "SCOLOR:1:090909"]
        );
    }

    #[tokio::test]
    async fn test_failed_write_is_reported_and_queue_continues() {
        let characteristic = FakeCharacteristic::new();
        characteristic.fail_payload("OFF");
        let (queue, mut rx) = queue(&characteristic, 32);
        let sink = queue.sink();

        sink.send(&Command::PowerOff).unwrap();
        sink.send(&Command::PowerOn).unwrap();
        sink.flush().await;

        assert_eq!(characteristic.writes(), vec!["ON"]);
        match rx.try_recv() {
            Ok(AppEvent::Error(ControlError::Write(e))) => assert_eq!(e.command, "OFF"),
            other => panic!("expected write error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_encoding_error_rejected_before_io() {
        let characteristic = FakeCharacteristic::new();
        let (queue, _rx) = queue(&characteristic, 32);
        let sink = queue.sink();

        assert_eq!(
            sink.send(&brightness(300)),
            Err(SendError::Encoding(EncodingError::BrightnessOutOfRange(300)))
        );
        sink.flush().await;
        assert_eq!(characteristic.writes_started(), 0);
    }

    #[tokio::test]
    async fn test_depth_is_bounded() {
        let characteristic = FakeCharacteristic::new();
        characteristic.hold_writes();
        let (queue, _rx) = queue(&characteristic, 2);
        let sink = queue.sink();

        sink.send(&Command::PowerOn).unwrap();
        wait_until(|| characteristic.writes_started() == 1).await;

        sink.send(&Command::Breath).unwrap();
        sink.send(&Command::SetGlobalColor(Color::BLACK)).unwrap();
        assert_eq!(
            sink.send(&Command::PowerOff),
            Err(SendError::QueueFull { depth: 2 })
        );
        // A superseding command reuses the slot of the one it replaces
        sink.send(&Command::SetGlobalColor(Color::WHITE)).unwrap();
        characteristic.open_writes();
        sink.flush().await;
        assert_eq!(characteristic.writes(), vec!["ON", "BREATH", "COLOR:ffffff"]);
    }

    #[tokio::test]
    async fn test_sink_dies_with_queue() {
        let characteristic = FakeCharacteristic::new();
        let (queue, _rx) = queue(&characteristic, 32);
        let sink = queue.sink();
        assert!(sink.is_live());

        drop(queue);
        assert!(!sink.is_live());
        assert_eq!(sink.send(&Command::PowerOn), Err(SendError::NotConnected));
        sink.flush().await;
    }
}

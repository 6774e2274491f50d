//! Running synchronization session
//!
//! A [`SyncSession`] owns the controller behind a single mutex plus the two
//! threads that drive it:
//!
//! - the tick worker, which waits on a control channel with the send
//!   interval as timeout and runs [`SyncController::on_tick`] on every
//!   timeout
//! - the OSC receive thread, which decodes datagrams and runs
//!   [`SyncController::on_message_received`] for each message
//!
//! Every public method takes the same lock, so writes from the interface,
//! the host and the network are serialized. Dropping the session (or
//! calling [`SyncSession::shutdown`]) stops and joins both threads.

use crate::config::SyncConfig;
use crate::connection::{EndpointError, OscReceiver, Transport, UdpTransport};
use crate::controller::{SessionEvent, SyncController, EVENT_QUEUE_CAPACITY};
use crate::registry::SourceHandle;
use crate::source::SourceSnapshot;
use crate::types::{ChangeSource, ComsMode, DirtyFlags, ParameterKind};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

/// Errors starting a session
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to spawn tick worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Commands for the tick worker
#[derive(Debug, Clone, Copy)]
enum WorkerCommand {
    /// Restart the countdown with the current send interval
    Reschedule,
    Shutdown,
}

/// Slot of the process-wide session handed out by [`SyncSession::acquire`]
///
/// `Some` with a dead `Weak` means the last owner is gone but the session's
/// teardown is still running. Its `Drop` empties the slot and wakes waiters
/// once both threads are joined.
struct SharedSession {
    slot: Mutex<Option<Weak<SyncSession>>>,
    released: Condvar,
}

static SHARED_SESSION: SharedSession = SharedSession {
    slot: Mutex::new(None),
    released: Condvar::new(),
};

fn lock(controller: &Mutex<SyncController>) -> MutexGuard<'_, SyncController> {
    // Every critical section leaves the controller consistent
    controller.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running session
pub struct SyncSession {
    controller: Arc<Mutex<SyncController>>,
    control_tx: Sender<WorkerCommand>,
    events_rx: Receiver<SessionEvent>,
    tick_worker: Mutex<Option<thread::JoinHandle<()>>>,
    receiver: Mutex<Option<OscReceiver>>,
    listen_addr: Option<SocketAddr>,
}

impl SyncSession {
    /// Start a standalone session
    ///
    /// If the listen port cannot be bound the session still runs, without
    /// a receiver; it then never goes Online.
    pub fn start(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::start_with(config, Box::new(UdpTransport::new(config.device_port)), false)
    }

    /// Like [`SyncSession::start`] but fails if the listen port cannot be bound
    pub fn start_strict(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::start_with(config, Box::new(UdpTransport::new(config.device_port)), true)
    }

    /// The process-wide session, started on first use
    ///
    /// Only a weak reference is kept; the session stops when the last
    /// returned `Arc` is dropped and the next call starts a fresh one with the
    /// then-given config. A call racing that drop blocks until the old
    /// session has released its sockets.
    pub fn acquire(config: &SyncConfig) -> Result<Arc<Self>, SyncError> {
        let mut slot = SHARED_SESSION.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let current = slot.as_ref().map(Weak::upgrade);
            match current {
                Some(Some(session)) => return Ok(session),
                Some(None) => {
                    log::debug!("Sync: Waiting for previous session to stop");
                    slot = SHARED_SESSION
                        .released
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }
        let session = Arc::new(Self::start(config)?);
        *slot = Some(Arc::downgrade(&session));
        Ok(session)
    }

    /// Start a session over an arbitrary transport
    pub fn start_with(config: &SyncConfig, transport: Box<dyn Transport>, strict: bool) -> Result<Self, SyncError> {
        let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE_CAPACITY);
        let controller = Arc::new(Mutex::new(SyncController::new(transport, config, events_tx)));

        let receiver = {
            let controller = controller.clone();
            match OscReceiver::bind(config.listen_port, move |message| {
                lock(&controller).on_message_received(&message);
            }) {
                Ok(receiver) => Some(receiver),
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    log::warn!("OSC: {}; running without receiver", e);
                    None
                }
            }
        };
        let listen_addr = receiver.as_ref().map(OscReceiver::local_addr);

        let (control_tx, control_rx) = flume::unbounded();
        let tick_worker = {
            let controller = controller.clone();
            thread::Builder::new()
                .name("sync-tick".to_string())
                .spawn(move || Self::tick_loop(controller, control_rx))
                .map_err(SyncError::Spawn)?
        };

        log::info!(
            "Sync: Session started (device {}:{}, interval {} ms)",
            config.endpoint_address,
            config.device_port,
            lock(&controller).send_interval_ms()
        );

        Ok(Self {
            controller,
            control_tx,
            events_rx,
            tick_worker: Mutex::new(Some(tick_worker)),
            receiver: Mutex::new(receiver),
            listen_addr,
        })
    }

    /// Tick worker: one `on_tick` per elapsed send interval
    fn tick_loop(controller: Arc<Mutex<SyncController>>, control_rx: Receiver<WorkerCommand>) {
        log::debug!("Sync: Tick worker started");
        loop {
            let interval = Duration::from_millis(lock(&controller).send_interval_ms() as u64);
            match control_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => lock(&controller).on_tick(),
                Ok(WorkerCommand::Reschedule) => continue,
                Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("Sync: Tick worker stopped");
    }

    /// Stop both threads; further ticks and receipts stop immediately
    pub fn shutdown(&self) {
        let worker = self.tick_worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            let _ = self.control_tx.send(WorkerCommand::Shutdown);
            let _ = handle.join();
            log::info!("Sync: Session stopped");
        }
        // Dropping the receiver joins its thread
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Address replies are received on, if the receiver is running
    pub fn local_listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    fn controller(&self) -> MutexGuard<'_, SyncController> {
        lock(&self.controller)
    }

    /// Run several controller operations under one lock acquisition
    ///
    /// `f` gets the locked controller only. The lock is not reentrant:
    /// calling any `SyncSession` method from inside `f` deadlocks.
    pub fn with_controller<R>(&self, f: impl FnOnce(&mut SyncController) -> R) -> R {
        f(&mut self.controller())
    }

    fn reschedule(&self) {
        let _ = self.control_tx.send(WorkerCommand::Reschedule);
    }

    // ─── Events ─────────────────────────────────────────────────────

    /// Session event stream
    ///
    /// The queue holds [`EVENT_QUEUE_CAPACITY`] events; while it is full,
    /// new events are dropped.
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events_rx
    }

    /// All events queued since the last call
    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.events_rx.try_iter().collect()
    }

    // ─── Sources ────────────────────────────────────────────────────

    pub fn add_source(&self) -> SourceHandle {
        self.controller().add_source()
    }

    pub fn remove_source(&self, handle: SourceHandle) -> bool {
        self.controller().remove_source(handle)
    }

    pub fn source_count(&self) -> usize {
        self.controller().source_count()
    }

    pub fn source_handles(&self) -> Vec<SourceHandle> {
        self.controller().source_handles()
    }

    pub fn set_parameter_value(&self, handle: SourceHandle, origin: ChangeSource, kind: ParameterKind, value: f32) -> bool {
        self.controller().set_parameter_value(handle, origin, kind, value)
    }

    pub fn parameter_value(&self, handle: SourceHandle, kind: ParameterKind) -> Option<f32> {
        self.controller().parameter_value(handle, kind)
    }

    pub fn set_coms_mode(&self, handle: SourceHandle, origin: ChangeSource, mode: ComsMode) -> bool {
        self.controller().set_coms_mode(handle, origin, mode)
    }

    pub fn restore_coms_mode(&self, handle: SourceHandle, origin: ChangeSource) -> bool {
        self.controller().restore_coms_mode(handle, origin)
    }

    pub fn coms_mode(&self, handle: SourceHandle) -> Option<ComsMode> {
        self.controller().coms_mode(handle)
    }

    pub fn set_source_id(&self, handle: SourceHandle, origin: ChangeSource, source_id: i32) -> bool {
        self.controller().set_source_id(handle, origin, source_id)
    }

    pub fn source_id(&self, handle: SourceHandle) -> Option<i32> {
        self.controller().source_id(handle)
    }

    pub fn set_mapping_id(&self, handle: SourceHandle, origin: ChangeSource, mapping_id: i32) -> bool {
        self.controller().set_mapping_id(handle, origin, mapping_id)
    }

    pub fn mapping_id(&self, handle: SourceHandle) -> Option<i32> {
        self.controller().mapping_id(handle)
    }

    pub fn set_display_name(&self, handle: SourceHandle, origin: ChangeSource, name: &str) {
        self.controller().set_display_name(handle, origin, name)
    }

    pub fn display_name(&self, handle: SourceHandle) -> Option<String> {
        self.controller().source(handle).map(|s| s.display_name().to_string())
    }

    pub fn begin_gesture(&self, handle: SourceHandle, kind: ParameterKind) {
        self.controller().begin_gesture(handle, kind)
    }

    pub fn end_gesture(&self, handle: SourceHandle, kind: ParameterKind) {
        self.controller().end_gesture(handle, kind)
    }

    /// Host automation-period tick for one source
    pub fn tick_source(&self, handle: SourceHandle) {
        self.controller().tick_source(handle)
    }

    pub fn pop_dirty(&self, handle: SourceHandle, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.controller().pop_dirty(handle, observer, mask)
    }

    pub fn peek_dirty(&self, handle: SourceHandle, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.controller().peek_dirty(handle, observer, mask)
    }

    pub fn snapshot_source(&self, handle: SourceHandle) -> Option<SourceSnapshot> {
        self.controller().snapshot_source(handle)
    }

    pub fn restore_source(&self, handle: SourceHandle, snapshot: &SourceSnapshot) -> bool {
        let (restored, rescheduled) = {
            let mut controller = self.controller();
            let before = controller.send_interval_ms();
            let restored = controller.restore_source(handle, snapshot);
            (restored, controller.send_interval_ms() != before)
        };
        if rescheduled {
            self.reschedule();
        }
        restored
    }

    // ─── Session-wide settings ──────────────────────────────────────

    pub fn pop_global_dirty(&self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.controller().pop_global_dirty(observer, mask)
    }

    pub fn peek_global_dirty(&self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.controller().peek_global_dirty(observer, mask)
    }

    pub fn set_endpoint_address(&self, origin: ChangeSource, address: &str) -> bool {
        self.controller().set_endpoint_address(origin, address)
    }

    pub fn endpoint_address(&self) -> String {
        self.controller().endpoint_address().to_string()
    }

    pub fn set_send_interval(&self, origin: ChangeSource, interval_ms: i64) -> bool {
        let changed = self.controller().set_send_interval(origin, interval_ms);
        if changed {
            self.reschedule();
        }
        changed
    }

    pub fn send_interval_ms(&self) -> u32 {
        self.controller().send_interval_ms()
    }

    pub fn init_global_settings(&self, origin: ChangeSource, address: &str, interval_ms: i64) {
        let rescheduled = {
            let mut controller = self.controller();
            let before = controller.send_interval_ms();
            controller.init_global_settings(origin, address, interval_ms);
            controller.send_interval_ms() != before
        };
        if rescheduled {
            self.reschedule();
        }
    }

    pub fn is_online(&self) -> bool {
        self.controller().is_online()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shutdown();

        let this: *const Self = self;
        let mut slot = SHARED_SESSION.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|weak| weak.as_ptr() == this) {
            *slot = None;
            SHARED_SESSION.released.notify_all();
        }
    }
}

//! Synchronization controller
//!
//! Owns the source registry, the outbound transport and the liveness
//! counters. [`SyncController::on_tick`] decides per source and parameter
//! whether to send a SET, a GET or nothing; [`SyncController::on_message_received`]
//! routes device responses back into the matching sources.
//!
//! The controller itself is single-threaded. The session wraps it in one
//! mutex shared by the tick worker, the receive thread and the public API.

use crate::config::SyncConfig;
use crate::connection::Transport;
use crate::notifier::ChangeNotifier;
use crate::parameter::GestureEdge;
use crate::protocol::{self, Inbound};
use crate::registry::{SourceHandle, SourceRegistry};
use crate::source::{Source, SourceSnapshot};
use crate::types::{
    clamp_source_id, ChangeSource, ComsMode, DirtyFlags, OscParameter, ParameterKind,
};
use flume::{Sender, TrySendError};
use rosc::OscMessage;
use std::ops::RangeInclusive;

/// Shortest supported send interval
pub const SEND_INTERVAL_MIN_MS: u32 = 20;
/// Longest supported send interval
pub const SEND_INTERVAL_MAX_MS: u32 = 5000;
/// Send interval used when nothing else is configured
pub const DEFAULT_SEND_INTERVAL_MS: u32 = 50;

/// Device address used when nothing else is configured
pub const DEFAULT_ENDPOINT_ADDRESS: &str = "127.0.0.1";

/// Silence after which the device is considered offline
pub const KEEPALIVE_TIMEOUT_MS: u64 = 5000;
/// Silence after which an idle tick sends a ping
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u32 = 1500;
/// Cap of both heartbeat counters
pub const MAX_HEARTBEAT_TICKS: u32 = 0xFFFF;

/// Capacity of the session event channel; events beyond it are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Supported send interval range in milliseconds
pub fn supported_send_interval_range() -> RangeInclusive<u32> {
    SEND_INTERVAL_MIN_MS..=SEND_INTERVAL_MAX_MS
}

/// Clamp a requested send interval into the supported range
pub fn clamp_send_interval(interval_ms: i64) -> u32 {
    interval_ms.clamp(SEND_INTERVAL_MIN_MS as i64, SEND_INTERVAL_MAX_MS as i64) as u32
}

/// Notifications for the process hosting the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A parameter gesture started or ended; forward to the host's automation
    Gesture {
        source: SourceHandle,
        kind: ParameterKind,
        edge: GestureEdge,
    },
    /// The last source was removed
    Idle,
}

/// Session state behind the single lock
pub struct SyncController {
    sources: SourceRegistry,
    transport: Box<dyn Transport>,
    /// Session-wide pending changes per observer
    notifier: ChangeNotifier,
    endpoint_address: String,
    send_interval_ms: u32,
    keepalive_interval_ms: u32,
    default_coms_mode: ComsMode,
    /// Ticks since anything was received
    rx_heartbeat_ticks: u32,
    /// Ticks since anything was sent
    tx_heartbeat_ticks: u32,
    events: Sender<SessionEvent>,
}

impl SyncController {
    /// Create a controller and connect the transport to the configured device
    ///
    /// A failed connect is logged; the controller then reports Offline until
    /// the address is changed to a reachable one.
    pub fn new(mut transport: Box<dyn Transport>, config: &SyncConfig, events: Sender<SessionEvent>) -> Self {
        if let Err(e) = transport.connect(&config.endpoint_address) {
            log::warn!("OSC: {}", e);
        }
        Self {
            sources: SourceRegistry::new(),
            transport,
            notifier: ChangeNotifier::new(),
            endpoint_address: config.endpoint_address.clone(),
            send_interval_ms: clamp_send_interval(config.send_interval_ms as i64),
            keepalive_interval_ms: config.keepalive_interval_ms,
            default_coms_mode: config.default_coms_mode,
            rx_heartbeat_ticks: MAX_HEARTBEAT_TICKS,
            tx_heartbeat_ticks: 0,
            events,
        }
    }

    // ─── Registry ───────────────────────────────────────────────────

    /// Register a new source
    ///
    /// The source starts in the configured default mode with a source id one
    /// greater than the highest id currently in use.
    pub fn add_source(&mut self) -> SourceHandle {
        let next_id = clamp_source_id(self.sources.max_source_id() + 1);
        let mut source = Source::new(self.default_coms_mode);
        source.set_source_id(ChangeSource::Network, next_id);

        let handle = self.sources.insert(source);
        self.publish_global(ChangeSource::Network, DirtyFlags::SOURCE_COUNT);
        log::debug!("Sync: Added source {} (id {})", handle, next_id);
        handle
    }

    /// Unregister a source
    ///
    /// Emits [`SessionEvent::Idle`] when the last source goes away.
    pub fn remove_source(&mut self, handle: SourceHandle) -> bool {
        if self.sources.remove(handle).is_none() {
            return false;
        }
        self.publish_global(ChangeSource::Network, DirtyFlags::SOURCE_COUNT);
        log::debug!("Sync: Removed source {}", handle);

        if self.sources.is_empty() {
            log::info!("Sync: Last source removed, session idle");
            emit(&self.events, SessionEvent::Idle);
        }
        true
    }

    pub fn contains(&self, handle: SourceHandle) -> bool {
        self.sources.contains(handle)
    }

    pub fn source(&self, handle: SourceHandle) -> Option<&Source> {
        self.sources.get(handle)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Handles of all sources in registration order
    pub fn source_handles(&self) -> Vec<SourceHandle> {
        self.sources.handles().to_vec()
    }

    /// Run `f` on one source and forward the gesture edges it produced
    fn with_source<R>(&mut self, handle: SourceHandle, f: impl FnOnce(&mut Source) -> R) -> Option<R> {
        let source = self.sources.get_mut(handle)?;
        let result = f(source);
        forward_gestures(&self.events, handle, source);
        Some(result)
    }

    // ─── Per-source operations ──────────────────────────────────────

    pub fn set_parameter_value(
        &mut self,
        handle: SourceHandle,
        origin: ChangeSource,
        kind: ParameterKind,
        value: f32,
    ) -> bool {
        self.with_source(handle, |s| s.set_parameter_value(origin, kind, value))
            .unwrap_or(false)
    }

    pub fn parameter_value(&self, handle: SourceHandle, kind: ParameterKind) -> Option<f32> {
        self.source(handle).map(|s| s.parameter_value(kind))
    }

    pub fn set_coms_mode(&mut self, handle: SourceHandle, origin: ChangeSource, mode: ComsMode) -> bool {
        self.with_source(handle, |s| s.set_coms_mode(origin, mode))
            .unwrap_or(false)
    }

    pub fn restore_coms_mode(&mut self, handle: SourceHandle, origin: ChangeSource) -> bool {
        self.with_source(handle, |s| s.restore_coms_mode(origin))
            .unwrap_or(false)
    }

    pub fn coms_mode(&self, handle: SourceHandle) -> Option<ComsMode> {
        self.source(handle).map(Source::coms_mode)
    }

    pub fn set_source_id(&mut self, handle: SourceHandle, origin: ChangeSource, source_id: i32) -> bool {
        self.with_source(handle, |s| s.set_source_id(origin, source_id))
            .unwrap_or(false)
    }

    pub fn source_id(&self, handle: SourceHandle) -> Option<i32> {
        self.source(handle).map(Source::source_id)
    }

    pub fn set_mapping_id(&mut self, handle: SourceHandle, origin: ChangeSource, mapping_id: i32) -> bool {
        self.with_source(handle, |s| s.set_mapping_id(origin, mapping_id))
            .unwrap_or(false)
    }

    pub fn mapping_id(&self, handle: SourceHandle) -> Option<i32> {
        self.source(handle).map(Source::mapping_id)
    }

    pub fn set_display_name(&mut self, handle: SourceHandle, origin: ChangeSource, name: &str) {
        self.with_source(handle, |s| s.set_display_name(origin, name));
    }

    pub fn begin_gesture(&mut self, handle: SourceHandle, kind: ParameterKind) {
        self.with_source(handle, |s| s.begin_gesture(kind));
    }

    pub fn end_gesture(&mut self, handle: SourceHandle, kind: ParameterKind) {
        self.with_source(handle, |s| s.end_gesture(kind));
    }

    /// Advance one source's gesture counters (host automation period)
    pub fn tick_source(&mut self, handle: SourceHandle) {
        self.with_source(handle, Source::tick);
    }

    pub fn pop_dirty(&mut self, handle: SourceHandle, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.sources
            .get_mut(handle)
            .is_some_and(|s| s.pop_dirty(observer, mask))
    }

    pub fn peek_dirty(&self, handle: SourceHandle, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.source(handle).is_some_and(|s| s.peek_dirty(observer, mask))
    }

    // ─── Session-wide settings ──────────────────────────────────────

    /// Publish a session-wide change to the session notifier and every source
    fn publish_global(&mut self, origin: ChangeSource, changes: DirtyFlags) {
        self.notifier.publish(origin, changes);
        self.sources.for_each_mut(|_, source| source.publish(origin, changes));
    }

    pub fn pop_global_dirty(&mut self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.notifier.pop(observer, mask)
    }

    pub fn peek_global_dirty(&self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.notifier.peek(observer, mask)
    }

    pub fn endpoint_address(&self) -> &str {
        &self.endpoint_address
    }

    /// Point the session at another device
    ///
    /// The session goes Offline until the new device answers.
    pub fn set_endpoint_address(&mut self, origin: ChangeSource, address: &str) -> bool {
        if self.endpoint_address == address {
            return false;
        }
        let was_online = self.is_online();

        self.endpoint_address = address.to_string();
        self.rx_heartbeat_ticks = MAX_HEARTBEAT_TICKS;
        self.tx_heartbeat_ticks = 0;
        if let Err(e) = self.transport.connect(address) {
            log::warn!("OSC: {}", e);
        }

        let mut changes = DirtyFlags::ENDPOINT_ADDRESS;
        if was_online {
            log::info!("Sync: Offline (endpoint changed)");
            changes |= DirtyFlags::ONLINE;
        }
        self.publish_global(origin, changes);
        true
    }

    pub fn send_interval_ms(&self) -> u32 {
        self.send_interval_ms
    }

    /// Change the tick period; out-of-range values are clamped
    pub fn set_send_interval(&mut self, origin: ChangeSource, interval_ms: i64) -> bool {
        let interval_ms = clamp_send_interval(interval_ms);
        if self.send_interval_ms == interval_ms {
            return false;
        }
        log::debug!("Sync: Send interval {} ms -> {} ms", self.send_interval_ms, interval_ms);
        self.send_interval_ms = interval_ms;
        self.publish_global(origin, DirtyFlags::SEND_INTERVAL);
        true
    }

    /// Apply endpoint address and send interval together
    pub fn init_global_settings(&mut self, origin: ChangeSource, address: &str, interval_ms: i64) {
        self.set_endpoint_address(origin, address);
        self.set_send_interval(origin, interval_ms);
    }

    /// True while the device answered within the liveness window
    pub fn is_online(&self) -> bool {
        (self.rx_heartbeat_ticks as u64) * (self.send_interval_ms as u64) < KEEPALIVE_TIMEOUT_MS
    }

    /// Ticks since the device last answered
    pub fn rx_heartbeat_ticks(&self) -> u32 {
        self.rx_heartbeat_ticks
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    /// Persistable state of one source plus the session settings
    pub fn snapshot_source(&self, handle: SourceHandle) -> Option<SourceSnapshot> {
        let source = self.source(handle)?;
        Some(SourceSnapshot {
            x: source.parameter_value(ParameterKind::X),
            y: source.parameter_value(ParameterKind::Y),
            source_id: source.source_id(),
            mapping_id: source.mapping_id(),
            coms_mode: source.coms_mode(),
            reverb_send_gain: source.parameter_value(ParameterKind::ReverbSendGain),
            source_spread: source.parameter_value(ParameterKind::SourceSpread),
            delay_mode: source.delay_mode(),
            endpoint_address: self.endpoint_address.clone(),
            send_interval_ms: self.send_interval_ms,
        })
    }

    /// Apply a persisted snapshot as host-originated changes
    ///
    /// Session settings are taken only while the session still talks to the
    /// default address; the first restored source configures the session.
    pub fn restore_source(&mut self, handle: SourceHandle, snapshot: &SourceSnapshot) -> bool {
        if self.with_source(handle, |s| s.apply_settings(snapshot)).is_none() {
            return false;
        }
        if self.endpoint_address == DEFAULT_ENDPOINT_ADDRESS {
            self.init_global_settings(
                ChangeSource::Host,
                &snapshot.endpoint_address,
                snapshot.send_interval_ms as i64,
            );
        }
        self.with_source(handle, |s| s.apply_values(snapshot));
        true
    }

    // ─── Tick ───────────────────────────────────────────────────────

    /// Send one message, counting a success as outbound heartbeat
    fn send(&mut self, message: OscMessage) -> bool {
        let sent = self.transport.send(message);
        if sent {
            self.tx_heartbeat_ticks = 0;
        }
        sent
    }

    /// One cycle of the periodic send loop
    pub fn on_tick(&mut self) {
        if self.sources.is_empty() {
            return;
        }

        let keepalive_ms = self.keepalive_interval_ms as u64;
        let interval_ms = self.send_interval_ms as u64;
        let mut send_keepalive = (self.rx_heartbeat_ticks as u64) * interval_ms > keepalive_ms
            || (self.tx_heartbeat_ticks as u64) * interval_ms > keepalive_ms;

        for handle in self.sources.handles().to_vec() {
            let Some(source) = self.sources.get_mut(handle) else {
                continue;
            };

            if source.pop_dirty(ChangeSource::Network, DirtyFlags::BYPASS) {
                if source.bypass_requested() && !source.is_bypassed() {
                    source.set_coms_mode(ChangeSource::Network, ComsMode::OFF);
                } else if !source.bypass_requested() && source.is_bypassed() {
                    source.restore_coms_mode(ChangeSource::Network);
                }
                source.pop_dirty(ChangeSource::Network, DirtyFlags::BYPASS);
            }

            source.tick();
            forward_gestures(&self.events, handle, source);

            let sent = !source.is_bypassed() && sync_source(source, self.transport.as_mut());
            source.pop_dirty(ChangeSource::Network, DirtyFlags::AUTOMATION_PARAMETERS);
            if sent {
                self.tx_heartbeat_ticks = 0;
                send_keepalive = false;
            }
        }

        if send_keepalive {
            log::trace!("OSC: Sending keepalive");
            self.send(protocol::ping_message());
        }

        let was_online = self.is_online();
        self.rx_heartbeat_ticks = (self.rx_heartbeat_ticks + 1).min(MAX_HEARTBEAT_TICKS);
        self.tx_heartbeat_ticks = (self.tx_heartbeat_ticks + 1).min(MAX_HEARTBEAT_TICKS);
        if was_online && !self.is_online() {
            log::info!("Sync: Offline (no response from {})", self.endpoint_address);
            self.publish_global(ChangeSource::Network, DirtyFlags::ONLINE);
        }
    }

    // ─── Receive ────────────────────────────────────────────────────

    /// Route one inbound message to the matching sources
    ///
    /// Unrecognized messages are dropped. Any recognized message counts as
    /// a sign of life from the device, whether or not a source accepts it.
    pub fn on_message_received(&mut self, message: &OscMessage) {
        let inbound = match protocol::parse_inbound(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::trace!("OSC: Ignoring message: {}", e);
                return;
            }
        };

        let was_online = self.is_online();
        self.rx_heartbeat_ticks = 0;
        if !was_online {
            log::info!("Sync: Online ({})", self.endpoint_address);
            self.publish_global(ChangeSource::Network, DirtyFlags::ONLINE);
        }

        let Inbound::Value(value) = inbound else {
            return;
        };
        let kind = value.parameter().dirty_flag();

        for handle in self.sources.handles().to_vec() {
            let Some(source) = self.sources.get_mut(handle) else {
                continue;
            };
            if source.source_id() != value.source_id() {
                continue;
            }
            if source.is_in_flight(kind) {
                log::trace!("Sync: {} response for {} discarded, SET in flight", message.addr, handle);
                continue;
            }
            if source.peek_dirty(ChangeSource::Network, kind) {
                log::trace!("Sync: {} response for {} discarded, local change pending", message.addr, handle);
                continue;
            }
            if !source.coms_mode().accepts_responses() {
                continue;
            }
            if value.mapping_id().is_some_and(|m| m != source.mapping_id()) {
                continue;
            }

            for (parameter, v) in value.writes() {
                source.set_parameter_value(ChangeSource::Network, parameter, v);
            }
            source.clear_poll_once(ChangeSource::Network);
            forward_gestures(&self.events, handle, source);
        }
    }
}

/// SET dirty parameters, GET the rest when receiving, mark SETs in flight
///
/// A GET is only sent for a parameter whose SET was not attempted this tick.
/// Returns true if anything reached the network.
fn sync_source(source: &mut Source, transport: &mut dyn Transport) -> bool {
    let mode = source.coms_mode();
    let mut sets_in_flight = DirtyFlags::NONE;
    let mut any_sent = false;

    for parameter in OscParameter::ALL {
        let kind = parameter.dirty_flag();

        if mode.can_send && source.peek_dirty(ChangeSource::Network, kind) {
            sets_in_flight |= kind;
            if transport.send(protocol::set_message(parameter, source)) {
                any_sent = true;
            } else {
                log::debug!("OSC: SET for source {} not sent", source.source_id());
            }
            continue;
        }

        if mode.accepts_responses() && transport.send(protocol::get_message(parameter, source)) {
            any_sent = true;
        }
    }

    source.set_in_flight(sets_in_flight);
    any_sent
}

fn forward_gestures(events: &Sender<SessionEvent>, handle: SourceHandle, source: &mut Source) {
    for notice in source.take_gestures() {
        emit(
            events,
            SessionEvent::Gesture {
                source: handle,
                kind: notice.kind,
                edge: notice.edge,
            },
        );
    }
}

/// Queue an event without blocking the lock holder
fn emit(events: &Sender<SessionEvent>, event: SessionEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(event)) => log::trace!("Sync: Event queue full, dropping {:?}", event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EndpointError;
    use crate::types::DelayMode;
    use std::sync::{Arc, Mutex};

    /// In-memory transport recording every message handed to it
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<OscMessage>>>,
        connects: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<OscMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&mut self, address: &str) -> Result<(), EndpointError> {
            self.connects.lock().unwrap().push(address.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn send(&mut self, message: OscMessage) -> bool {
            self.sent.lock().unwrap().push(message);
            true
        }
    }

    struct Fixture {
        controller: SyncController,
        transport: RecordingTransport,
        events: flume::Receiver<SessionEvent>,
    }

    fn fixture(mode: ComsMode) -> Fixture {
        let transport = RecordingTransport::default();
        let (tx, rx) = flume::unbounded();
        let config = SyncConfig {
            default_coms_mode: mode,
            ..SyncConfig::default()
        };
        Fixture {
            controller: SyncController::new(Box::new(transport.clone()), &config, tx),
            transport,
            events: rx,
        }
    }

    fn pong() -> OscMessage {
        OscMessage { addr: "/pong".to_string(), args: vec![] }
    }

    fn position(mapping_id: i32, source_id: i32, x: f32, y: f32) -> OscMessage {
        OscMessage {
            addr: protocol::parameter_address(OscParameter::Position, source_id, mapping_id),
            args: vec![rosc::OscType::Float(x), rosc::OscType::Float(y)],
        }
    }

    #[test]
    fn test_tx_tick_sends_single_set() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();
        f.controller.on_message_received(&pong());
        f.controller.set_parameter_value(s, ChangeSource::Interface, ParameterKind::X, 0.3);

        f.controller.on_tick();

        let sent = f.transport.take();
        assert_eq!(sent.len(), 1, "one SET and no keepalive: {:?}", sent);
        assert_eq!(sent[0].addr, "/dbaudio1/coordinatemapping/source_position_xy/1/1");
        assert_eq!(sent[0].args.len(), 2);
        let source = f.controller.source(s).unwrap();
        assert_eq!(source.in_flight(), DirtyFlags::SOURCE_POSITION);
        assert!(!source.peek_dirty(ChangeSource::Network, DirtyFlags::SOURCE_POSITION));
    }

    #[test]
    fn test_response_discarded_while_set_in_flight() {
        let mut f = fixture(ComsMode::SYNC);
        let s = f.controller.add_source();
        f.controller.set_parameter_value(s, ChangeSource::Interface, ParameterKind::X, 0.2);
        f.controller.on_tick();

        // Local flag is already consumed; only the in-flight gate applies
        assert!(!f.controller.peek_dirty(s, ChangeSource::Network, DirtyFlags::SOURCE_POSITION));
        f.controller.on_message_received(&position(1, 1, 0.9, 0.9));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.2));
        assert!(!f.controller.peek_dirty(s, ChangeSource::Network, DirtyFlags::SOURCE_POSITION));

        // Next tick sends a GET; its answer is accepted
        f.controller.on_tick();
        assert!(f.controller.source(s).unwrap().in_flight().is_empty());
        f.controller.on_message_received(&position(1, 1, 0.9, 0.9));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.9));
        assert!(f.controller.peek_dirty(s, ChangeSource::Interface, DirtyFlags::SOURCE_POSITION));
    }

    #[test]
    fn test_response_discarded_while_local_change_pending() {
        let mut f = fixture(ComsMode::SYNC);
        let s = f.controller.add_source();
        f.controller.set_parameter_value(s, ChangeSource::Interface, ParameterKind::X, 0.2);

        // Nothing in flight yet; only the pending-change gate applies
        assert!(f.controller.source(s).unwrap().in_flight().is_empty());
        f.controller.on_message_received(&position(1, 1, 0.9, 0.9));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.2));

        f.controller.on_tick();
        let sent = f.transport.take();
        let set = sent
            .iter()
            .find(|m| m.addr.contains("source_position_xy") && !m.args.is_empty())
            .expect("position SET");
        assert_eq!(set.args[0], rosc::OscType::Float(0.2));
    }

    #[test]
    fn test_sync_sends_gets_for_clean_parameters() {
        let mut f = fixture(ComsMode::SYNC);
        let s = f.controller.add_source();
        f.controller.set_parameter_value(s, ChangeSource::Host, ParameterKind::SourceSpread, 0.9);
        f.controller.on_tick();

        let sent = f.transport.take();
        let sets: Vec<_> = sent.iter().filter(|m| !m.args.is_empty()).collect();
        let gets: Vec<_> = sent.iter().filter(|m| m.args.is_empty() && m.addr != "/ping").collect();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].addr, "/dbaudio1/positioning/source_spread/1");
        assert_eq!(gets.len(), 3);
        assert!(!sent.iter().any(|m| m.addr == "/ping"));
    }

    #[test]
    fn test_offline_after_liveness_window() {
        let mut f = fixture(ComsMode::TX);
        let handles: Vec<_> = (0..3).map(|_| f.controller.add_source()).collect();
        assert_eq!(f.controller.send_interval_ms(), 50);

        f.controller.on_message_received(&pong());
        assert!(f.controller.is_online());
        for &h in &handles {
            assert!(f.controller.pop_dirty(h, ChangeSource::Interface, DirtyFlags::ONLINE));
        }

        for _ in 0..99 {
            f.controller.on_tick();
        }
        assert!(f.controller.is_online());
        assert!(!f.controller.peek_dirty(handles[0], ChangeSource::Interface, DirtyFlags::ONLINE));

        f.controller.on_tick();
        assert!(!f.controller.is_online());
        for &h in &handles {
            assert!(f.controller.pop_dirty(h, ChangeSource::Interface, DirtyFlags::ONLINE));
        }
        assert!(f.controller.pop_global_dirty(ChangeSource::SecondaryView, DirtyFlags::ONLINE));

        for _ in 0..100 {
            f.controller.on_tick();
        }
        assert!(!f.controller.peek_dirty(handles[1], ChangeSource::Interface, DirtyFlags::ONLINE));
    }

    #[test]
    fn test_position_for_other_mapping_is_ignored() {
        let mut f = fixture(ComsMode::RX);
        let s = f.controller.add_source();
        f.controller.set_mapping_id(s, ChangeSource::Interface, 2);

        f.controller.on_message_received(&position(1, 1, 0.1, 0.1));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.5));
        // Still evidence of life
        assert!(f.controller.is_online());

        f.controller.on_message_received(&position(2, 1, 0.1, 0.2));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.1));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::Y), Some(0.2));
    }

    #[test]
    fn test_tx_only_source_ignores_responses() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();
        f.controller.on_message_received(&position(1, 1, 0.1, 0.1));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.5));
    }

    #[test]
    fn test_response_reaches_every_source_with_matching_id() {
        let mut f = fixture(ComsMode::RX);
        let a = f.controller.add_source();
        let b = f.controller.add_source();
        f.controller.set_source_id(b, ChangeSource::Interface, 1);

        f.controller.on_message_received(&OscMessage {
            addr: "/dbaudio1/matrixinput/reverbsendgain/1".to_string(),
            args: vec![rosc::OscType::Float(-20.0)],
        });
        assert_eq!(f.controller.parameter_value(a, ParameterKind::ReverbSendGain), Some(-20.0));
        assert_eq!(f.controller.parameter_value(b, ParameterKind::ReverbSendGain), Some(-20.0));
    }

    #[test]
    fn test_mapping_change_polls_once() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();
        f.controller.set_mapping_id(s, ChangeSource::Interface, 2);
        assert!(f.controller.coms_mode(s).unwrap().poll_once);

        f.controller.on_tick();
        let sent = f.transport.take();
        assert!(sent.iter().any(|m| m.addr == "/dbaudio1/coordinatemapping/source_position_xy/2/1" && m.args.is_empty()));

        f.controller.on_message_received(&position(2, 1, 0.7, 0.6));
        assert_eq!(f.controller.parameter_value(s, ParameterKind::X), Some(0.7));
        assert_eq!(f.controller.coms_mode(s), Some(ComsMode::TX));
    }

    #[test]
    fn test_keepalive_is_throttled() {
        let mut f = fixture(ComsMode::TX);
        f.controller.add_source();

        // Never heard from the device: ping right away
        f.controller.on_tick();
        assert_eq!(f.transport.take().len(), 1);

        f.controller.on_message_received(&pong());
        for _ in 0..30 {
            f.controller.on_tick();
        }
        assert!(f.transport.take().is_empty());

        f.controller.on_tick();
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, "/ping");
    }

    #[test]
    fn test_bypass_parameter_switches_mode() {
        let mut f = fixture(ComsMode::SYNC);
        let s = f.controller.add_source();

        f.controller.set_parameter_value(s, ChangeSource::Host, ParameterKind::Bypass, 1.0);
        f.controller.on_tick();
        assert_eq!(f.controller.coms_mode(s), Some(ComsMode::OFF));
        assert!(f.transport.take().iter().all(|m| m.addr == "/ping"));

        f.controller.set_parameter_value(s, ChangeSource::Host, ParameterKind::Bypass, 0.0);
        f.controller.on_tick();
        assert_eq!(f.controller.coms_mode(s), Some(ComsMode::SYNC));
        assert!(f.controller.peek_dirty(s, ChangeSource::Interface, DirtyFlags::COMS_MODE));
    }

    #[test]
    fn test_changes_while_bypassed_are_not_sent_later() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();
        f.controller.set_coms_mode(s, ChangeSource::Interface, ComsMode::OFF);
        f.controller.set_parameter_value(s, ChangeSource::Interface, ParameterKind::SourceSpread, 0.1);
        f.controller.on_tick();
        f.transport.take();

        f.controller.restore_coms_mode(s, ChangeSource::Interface);
        f.controller.on_message_received(&pong());
        f.controller.on_tick();
        assert!(f.transport.take().is_empty());
    }

    #[test]
    fn test_add_source_assigns_next_id() {
        let mut f = fixture(ComsMode::TX);
        let a = f.controller.add_source();
        let b = f.controller.add_source();
        f.controller.set_source_id(b, ChangeSource::Interface, 10);
        let c = f.controller.add_source();
        assert_eq!(f.controller.source_id(a), Some(1));
        assert_eq!(f.controller.source_id(c), Some(11));
        assert!(f.controller.pop_global_dirty(ChangeSource::Interface, DirtyFlags::SOURCE_COUNT));
    }

    #[test]
    fn test_removal_from_middle_and_idle_event() {
        let mut f = fixture(ComsMode::TX);
        let handles: Vec<_> = (0..3).map(|_| f.controller.add_source()).collect();

        assert!(f.controller.remove_source(handles[1]));
        assert!(!f.controller.remove_source(handles[1]));
        assert_eq!(f.controller.source_handles(), vec![handles[0], handles[2]]);
        assert!(!f.controller.set_source_id(handles[1], ChangeSource::Interface, 5));

        f.controller.remove_source(handles[0]);
        assert!(f.events.try_recv().is_err());
        f.controller.remove_source(handles[2]);
        assert_eq!(f.events.try_recv(), Ok(SessionEvent::Idle));
        assert_eq!(f.controller.source_count(), 0);
    }

    #[test]
    fn test_send_interval_is_clamped_and_published() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();

        assert!(f.controller.set_send_interval(ChangeSource::Interface, 5));
        assert_eq!(f.controller.send_interval_ms(), 20);
        assert!(f.controller.set_send_interval(ChangeSource::Interface, 100_000));
        assert_eq!(f.controller.send_interval_ms(), 5000);
        assert!(!f.controller.set_send_interval(ChangeSource::Interface, 9000));

        assert!(f.controller.peek_dirty(s, ChangeSource::SecondaryView, DirtyFlags::SEND_INTERVAL));
        assert!(!f.controller.peek_dirty(s, ChangeSource::Interface, DirtyFlags::SEND_INTERVAL));
        assert!(f.controller.peek_global_dirty(ChangeSource::Host, DirtyFlags::SEND_INTERVAL));
    }

    #[test]
    fn test_endpoint_change_goes_offline_and_reconnects() {
        let mut f = fixture(ComsMode::TX);
        let s = f.controller.add_source();
        f.controller.on_message_received(&pong());
        f.controller.pop_dirty(s, ChangeSource::Interface, DirtyFlags::ONLINE);

        assert!(f.controller.set_endpoint_address(ChangeSource::Interface, "10.0.0.5"));
        assert!(!f.controller.set_endpoint_address(ChangeSource::Interface, "10.0.0.5"));
        assert!(!f.controller.is_online());
        assert_eq!(
            *f.transport.connects.lock().unwrap(),
            vec!["127.0.0.1".to_string(), "10.0.0.5".to_string()]
        );
        assert!(f.controller.peek_dirty(s, ChangeSource::Host, DirtyFlags::ENDPOINT_ADDRESS));
        assert!(f.controller.peek_dirty(s, ChangeSource::Host, DirtyFlags::ONLINE));
    }

    #[test]
    fn test_inbound_change_opens_and_closes_gesture() {
        let mut f = fixture(ComsMode::RX);
        let s = f.controller.add_source();
        f.controller.on_message_received(&OscMessage {
            addr: "/dbaudio1/positioning/source_delaymode/1".to_string(),
            args: vec![rosc::OscType::Int(2)],
        });
        assert_eq!(
            f.events.try_recv(),
            Ok(SessionEvent::Gesture { source: s, kind: ParameterKind::DelayMode, edge: GestureEdge::Begin })
        );

        for _ in 0..9 {
            f.controller.tick_source(s);
        }
        assert_eq!(
            f.events.try_recv(),
            Ok(SessionEvent::Gesture { source: s, kind: ParameterKind::DelayMode, edge: GestureEdge::End })
        );
    }

    #[test]
    fn test_undrained_events_stay_bounded() {
        let transport = RecordingTransport::default();
        let (tx, rx) = flume::bounded(2);
        let config = SyncConfig {
            default_coms_mode: ComsMode::RX,
            ..SyncConfig::default()
        };
        let mut controller = SyncController::new(Box::new(transport), &config, tx);
        let s = controller.add_source();

        // Every change opens and closes a gesture; nobody drains
        for round in 0..50 {
            let spread = if round % 2 == 0 { 0.1 } else { 0.9 };
            controller.set_parameter_value(s, ChangeSource::Network, ParameterKind::SourceSpread, spread);
            for _ in 0..9 {
                controller.tick_source(s);
            }
        }
        assert_eq!(rx.len(), 2);
        assert!(controller.remove_source(s));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_restore_source_applies_session_settings_once() {
        let mut f = fixture(ComsMode::TX);
        let a = f.controller.add_source();
        let b = f.controller.add_source();

        let mut snapshot = f.controller.snapshot_source(a).unwrap();
        snapshot.x = 0.1;
        snapshot.source_id = 12;
        snapshot.coms_mode = ComsMode::RX;
        snapshot.delay_mode = DelayMode::Off;
        snapshot.endpoint_address = "192.168.1.20".to_string();
        snapshot.send_interval_ms = 100;
        assert!(f.controller.restore_source(a, &snapshot));

        assert_eq!(f.controller.source_id(a), Some(12));
        assert_eq!(f.controller.coms_mode(a), Some(ComsMode::RX));
        assert_eq!(f.controller.parameter_value(a, ParameterKind::X), Some(0.1));
        assert_eq!(f.controller.parameter_value(a, ParameterKind::DelayMode), Some(0.0));
        assert_eq!(f.controller.endpoint_address(), "192.168.1.20");
        assert_eq!(f.controller.send_interval_ms(), 100);

        let mut other = snapshot.clone();
        other.endpoint_address = "192.168.1.99".to_string();
        other.send_interval_ms = 200;
        f.controller.restore_source(b, &other);
        assert_eq!(f.controller.endpoint_address(), "192.168.1.20");
        assert_eq!(f.controller.send_interval_ms(), 100);
        assert!(f.controller.peek_dirty(b, ChangeSource::Interface, DirtyFlags::SOURCE_ID));
    }

    #[test]
    fn test_unrecognized_message_is_not_heartbeat() {
        let mut f = fixture(ComsMode::RX);
        f.controller.add_source();
        f.controller.on_message_received(&OscMessage {
            addr: "/dbaudio1/matrixinput/mute/1".to_string(),
            args: vec![rosc::OscType::Int(1)],
        });
        assert!(!f.controller.is_online());
        assert_eq!(f.controller.rx_heartbeat_ticks(), MAX_HEARTBEAT_TICKS);
    }
}

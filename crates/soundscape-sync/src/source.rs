//! One synchronized sound source
//!
//! A source owns its parameter bindings, identifiers, communication mode and
//! its own [`ChangeNotifier`]. Every setter takes the [`ChangeSource`] that
//! caused the write so the change is published to all other observers.

use crate::notifier::ChangeNotifier;
use crate::parameter::{GestureEdge, ParameterBinding};
use crate::types::{
    clamp_mapping_id, clamp_source_id, ChangeSource, ComsMode, DelayMode, DirtyFlags, ParameterKind,
    DEFAULT_MAPPING_ID, SOURCE_ID_MIN,
};
use serde::{Deserialize, Serialize};

/// Gesture edge produced by one of a source's bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureNotice {
    /// Parameter whose gesture changed
    pub kind: ParameterKind,
    /// Begin or end
    pub edge: GestureEdge,
}

/// Restorable state of a source plus the session settings it was saved with
///
/// Hosts persist this however they like; the core only produces and consumes
/// the values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub x: f32,
    pub y: f32,
    pub source_id: i32,
    pub mapping_id: i32,
    pub coms_mode: ComsMode,
    pub reverb_send_gain: f32,
    pub source_spread: f32,
    pub delay_mode: DelayMode,
    pub endpoint_address: String,
    pub send_interval_ms: u32,
}

/// Synchronized state of one controllable object
#[derive(Debug, Clone)]
pub struct Source {
    source_id: i32,
    mapping_id: i32,
    coms_mode: ComsMode,
    /// Mode to go back to when bypass is switched off
    coms_mode_before_bypass: ComsMode,
    display_name: String,
    params: [ParameterBinding; ParameterKind::COUNT],
    notifier: ChangeNotifier,
    /// Kinds with a SET sent this tick; their responses are stale
    in_flight: DirtyFlags,
    /// Gesture edges not yet forwarded to the host
    gestures: Vec<GestureNotice>,
}

impl Source {
    /// Create a source in the given communication mode with default values
    pub fn new(coms_mode: ComsMode) -> Self {
        Self {
            source_id: SOURCE_ID_MIN,
            mapping_id: DEFAULT_MAPPING_ID,
            coms_mode,
            coms_mode_before_bypass: coms_mode,
            display_name: String::new(),
            params: ParameterKind::ALL.map(ParameterBinding::for_kind),
            notifier: ChangeNotifier::new(),
            in_flight: DirtyFlags::NONE,
            gestures: Vec::new(),
        }
    }

    // ─── Identifiers ────────────────────────────────────────────────

    /// Protocol source id (matrix input number), 1..=64
    pub fn source_id(&self) -> i32 {
        self.source_id
    }

    /// Set the source id, clamped into range
    pub fn set_source_id(&mut self, origin: ChangeSource, source_id: i32) -> bool {
        let source_id = clamp_source_id(source_id);
        if self.source_id == source_id {
            return false;
        }
        log::debug!("Sync: source id {} -> {}", self.source_id, source_id);
        self.source_id = source_id;
        self.notifier.publish(origin, DirtyFlags::SOURCE_ID);
        true
    }

    /// Coordinate mapping the X/Y values belong to, 1..=4
    pub fn mapping_id(&self) -> i32 {
        self.mapping_id
    }

    /// Set the coordinate mapping, clamped into range
    ///
    /// A source that cannot receive polls the position once so it learns
    /// where it sits in the new mapping.
    pub fn set_mapping_id(&mut self, origin: ChangeSource, mapping_id: i32) -> bool {
        let mapping_id = clamp_mapping_id(mapping_id);
        if self.mapping_id == mapping_id {
            return false;
        }
        self.mapping_id = mapping_id;

        let mut changes = DirtyFlags::MAPPING_ID;
        if !self.coms_mode.can_receive {
            self.coms_mode.poll_once = true;
            changes |= DirtyFlags::COMS_MODE;
        }
        self.notifier.publish(origin, changes);
        true
    }

    /// Host-provided display name (usually the track name)
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Set the display name; observers refresh labels via the source id kind
    pub fn set_display_name(&mut self, origin: ChangeSource, name: impl Into<String>) {
        let name = name.into();
        if self.display_name != name {
            self.display_name = name;
            self.notifier.publish(origin, DirtyFlags::SOURCE_ID);
        }
    }

    // ─── Communication mode ─────────────────────────────────────────

    /// Current communication mode
    pub fn coms_mode(&self) -> ComsMode {
        self.coms_mode
    }

    /// True if the source neither sends nor receives
    pub fn is_bypassed(&self) -> bool {
        self.coms_mode.is_bypassed()
    }

    /// True if the bypass pseudo-parameter is switched on
    pub fn bypass_requested(&self) -> bool {
        self.params[ParameterKind::Bypass.index()].value() >= 0.5
    }

    /// Change the communication mode
    ///
    /// Remembers non-bypassed modes for [`Source::restore_coms_mode`],
    /// discards in-flight markers and mirrors the new state into the bypass
    /// pseudo-parameter.
    pub fn set_coms_mode(&mut self, origin: ChangeSource, mode: ComsMode) -> bool {
        if self.coms_mode == mode {
            return false;
        }
        self.coms_mode = mode;
        if !mode.is_bypassed() {
            self.coms_mode_before_bypass = mode;
        }
        self.in_flight = DirtyFlags::NONE;
        self.notifier.publish(origin, DirtyFlags::COMS_MODE);

        let bypass = if mode.is_bypassed() { 1.0 } else { 0.0 };
        self.set_parameter_value(origin, ParameterKind::Bypass, bypass);
        true
    }

    /// Re-apply the mode that was active before bypass
    pub fn restore_coms_mode(&mut self, origin: ChangeSource) -> bool {
        let mode = self.coms_mode_before_bypass;
        if mode.is_bypassed() {
            return false;
        }
        self.set_coms_mode(origin, mode)
    }

    /// Drop a pending one-shot poll once its response was applied
    pub(crate) fn clear_poll_once(&mut self, origin: ChangeSource) {
        if self.coms_mode.poll_once {
            self.set_coms_mode(origin, self.coms_mode.with_poll_once(false));
        }
    }

    // ─── Parameters ─────────────────────────────────────────────────

    /// Current value of a parameter, in its natural units
    pub fn parameter_value(&self, kind: ParameterKind) -> f32 {
        self.params[kind.index()].value()
    }

    /// Delay mode choice
    pub fn delay_mode(&self) -> DelayMode {
        DelayMode::from_index(self.parameter_value(ParameterKind::DelayMode) as i32)
    }

    /// Current value of a parameter mapped to 0..1
    pub fn normalized_parameter_value(&self, kind: ParameterKind) -> f32 {
        self.params[kind.index()].normalized_value()
    }

    /// Write a parameter value on behalf of `origin`
    ///
    /// Returns true if the value actually changed (beyond the step
    /// tolerance); only then are the other observers notified.
    pub fn set_parameter_value(&mut self, origin: ChangeSource, kind: ParameterKind, value: f32) -> bool {
        let Some(change) = self.params[kind.index()].set_value(value) else {
            return false;
        };
        if let Some(edge) = change.gesture {
            self.gestures.push(GestureNotice { kind, edge });
        }
        self.notifier.publish(origin, kind.dirty_flag());
        true
    }

    /// Open an explicit interface gesture on a parameter
    pub fn begin_gesture(&mut self, kind: ParameterKind) {
        if let Some(edge) = self.params[kind.index()].begin_gesture() {
            self.gestures.push(GestureNotice { kind, edge });
        }
    }

    /// Close an explicit interface gesture on a parameter
    pub fn end_gesture(&mut self, kind: ParameterKind) {
        if let Some(edge) = self.params[kind.index()].end_gesture() {
            self.gestures.push(GestureNotice { kind, edge });
        }
    }

    /// Advance every binding's gesture counter by one tick
    pub fn tick(&mut self) {
        for binding in &mut self.params {
            if let Some(edge) = binding.tick() {
                self.gestures.push(GestureNotice { kind: binding.kind(), edge });
            }
        }
    }

    /// Drain gesture edges produced since the last call
    pub fn take_gestures(&mut self) -> Vec<GestureNotice> {
        std::mem::take(&mut self.gestures)
    }

    // ─── Change notification ────────────────────────────────────────

    /// Publish changes made by `origin` to the other observers
    pub fn publish(&mut self, origin: ChangeSource, changes: DirtyFlags) {
        self.notifier.publish(origin, changes);
    }

    /// Consume `mask` for `observer`, returning whether any of it was pending
    pub fn pop_dirty(&mut self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.notifier.pop(observer, mask)
    }

    /// True if any of `mask` is pending for `observer`
    pub fn peek_dirty(&self, observer: ChangeSource, mask: DirtyFlags) -> bool {
        self.notifier.peek(observer, mask)
    }

    /// Consume everything pending for `observer`
    pub fn take_dirty(&mut self, observer: ChangeSource) -> DirtyFlags {
        self.notifier.take(observer)
    }

    // ─── In-flight tracking ─────────────────────────────────────────

    /// Kinds with a SET command sent during the last tick
    pub fn in_flight(&self) -> DirtyFlags {
        self.in_flight
    }

    /// True if any of `kinds` has a SET command in flight
    pub fn is_in_flight(&self, kinds: DirtyFlags) -> bool {
        self.in_flight.intersects(kinds)
    }

    /// Replace the in-flight set with the kinds sent this tick
    pub(crate) fn set_in_flight(&mut self, kinds: DirtyFlags) {
        self.in_flight = kinds;
    }

    /// Apply persisted per-source settings as a host-originated change
    pub(crate) fn apply_settings(&mut self, snapshot: &SourceSnapshot) {
        self.set_source_id(ChangeSource::Host, snapshot.source_id);
        self.set_mapping_id(ChangeSource::Host, snapshot.mapping_id);
        self.set_coms_mode(ChangeSource::Host, snapshot.coms_mode);
    }

    /// Apply persisted parameter values as a host-originated change
    pub(crate) fn apply_values(&mut self, snapshot: &SourceSnapshot) {
        self.set_parameter_value(ChangeSource::Host, ParameterKind::X, snapshot.x);
        self.set_parameter_value(ChangeSource::Host, ParameterKind::Y, snapshot.y);
        self.set_parameter_value(ChangeSource::Host, ParameterKind::ReverbSendGain, snapshot.reverb_send_gain);
        self.set_parameter_value(ChangeSource::Host, ParameterKind::SourceSpread, snapshot.source_spread);
        self.set_parameter_value(ChangeSource::Host, ParameterKind::DelayMode, snapshot.delay_mode.index() as f32);
    }
}

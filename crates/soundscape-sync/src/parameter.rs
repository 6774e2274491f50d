//! Automatable parameter bindings with gesture bracketing
//!
//! A host records automation in "gestures": a begin call, value changes, an
//! end call. Interface edits bracket themselves (mouse down / mouse up).
//! Changes arriving from the network or the host have no natural end, so a
//! binding opens an implicit gesture on change and closes it after
//! [`GESTURE_LENGTH_IN_TICKS`] quiet ticks.
//!
//! Bindings never call into the host themselves; every operation returns the
//! gesture edge (if any) it produced and the caller forwards it.

use crate::types::ParameterKind;

/// Quiet ticks after which an implicit gesture is closed
pub const GESTURE_LENGTH_IN_TICKS: u32 = 8;

/// Tick counter value meaning "no implicit gesture open"
const GESTURE_EXPIRED: u32 = GESTURE_LENGTH_IN_TICKS + 1;

/// Gesture boundary to report to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEdge {
    /// A gesture started
    Begin,
    /// A gesture ended
    End,
}

/// Value domain of a binding
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRange {
    /// Continuous value with a change tolerance
    Continuous {
        /// Lower bound
        min: f32,
        /// Upper bound
        max: f32,
        /// Smallest delta considered a real change
        step: f32,
    },
    /// Discrete choice index in `0..count`
    Choice {
        /// Number of choices
        count: u32,
    },
}

impl ValueRange {
    /// Clip a raw value into the domain (choices are truncated to an index)
    pub fn clip(&self, value: f32) -> f32 {
        match *self {
            ValueRange::Continuous { min, max, .. } => value.clamp(min, max),
            ValueRange::Choice { count } => {
                let last = count.saturating_sub(1) as f32;
                value.trunc().clamp(0.0, last)
            }
        }
    }

    /// Map a value to 0..1
    pub fn normalize(&self, value: f32) -> f32 {
        match *self {
            ValueRange::Continuous { min, max, .. } => {
                if max > min {
                    (value - min) / (max - min)
                } else {
                    0.0
                }
            }
            ValueRange::Choice { count } => {
                if count > 1 {
                    value / (count - 1) as f32
                } else {
                    0.0
                }
            }
        }
    }

    /// True if `value` differs from `current` enough to count as a change
    fn is_change(&self, current: f32, value: f32) -> bool {
        match *self {
            ValueRange::Continuous { step, .. } => {
                value >= current + step || value <= current - step
            }
            ValueRange::Choice { .. } => value as i32 != current as i32,
        }
    }
}

/// An accepted value change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueChange {
    /// Value before the change
    pub previous: f32,
    /// Value after the change (clipped)
    pub current: f32,
    /// Gesture edge opened by this change, if any
    pub gesture: Option<GestureEdge>,
}

/// One automatable value of a source
#[derive(Debug, Clone)]
pub struct ParameterBinding {
    kind: ParameterKind,
    range: ValueRange,
    current: f32,
    previous: f32,
    /// Ticks since the last externally-driven change, saturating at expired
    ticks_since_change: u32,
    /// Inside an explicit begin/end bracket from the interface
    in_interface_gesture: bool,
}

impl ParameterBinding {
    /// Create a binding at its default value
    pub fn new(kind: ParameterKind, range: ValueRange, default_value: f32) -> Self {
        let default_value = range.clip(default_value);
        Self {
            kind,
            range,
            current: default_value,
            previous: default_value,
            ticks_since_change: GESTURE_EXPIRED,
            in_interface_gesture: false,
        }
    }

    /// Binding with the standard range and default for `kind`
    pub fn for_kind(kind: ParameterKind) -> Self {
        match kind {
            ParameterKind::X | ParameterKind::Y => Self::new(
                kind,
                ValueRange::Continuous { min: 0.0, max: 1.0, step: 0.001 },
                0.5,
            ),
            ParameterKind::ReverbSendGain => Self::new(
                kind,
                ValueRange::Continuous { min: -120.0, max: 24.0, step: 0.1 },
                0.0,
            ),
            ParameterKind::SourceSpread => Self::new(
                kind,
                ValueRange::Continuous { min: 0.0, max: 1.0, step: 0.001 },
                0.5,
            ),
            ParameterKind::DelayMode => Self::new(kind, ValueRange::Choice { count: 3 }, 1.0),
            ParameterKind::Bypass => Self::new(kind, ValueRange::Choice { count: 2 }, 0.0),
        }
    }

    /// Which parameter this binding holds
    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    /// Value domain
    pub fn range(&self) -> ValueRange {
        self.range
    }

    /// Current value
    pub fn value(&self) -> f32 {
        self.current
    }

    /// Current value mapped to 0..1
    pub fn normalized_value(&self) -> f32 {
        self.range.normalize(self.current)
    }

    /// Value before the last accepted change
    pub fn previous_value(&self) -> f32 {
        self.previous
    }

    /// True while the interface holds an explicit gesture
    pub fn in_interface_gesture(&self) -> bool {
        self.in_interface_gesture
    }

    /// True while any gesture (explicit or implicit) is open
    pub fn gesture_open(&self) -> bool {
        self.in_interface_gesture || self.ticks_since_change <= GESTURE_LENGTH_IN_TICKS
    }

    /// Write a new value
    ///
    /// Non-finite values are rejected. Others are clipped to range. Deltas
    /// within the step tolerance are ignored, which absorbs float round-trip
    /// noise from some hosts.
    /// Outside an explicit gesture, an accepted change opens an implicit
    /// gesture unless one is still open, and restarts its tick counter.
    pub fn set_value(&mut self, value: f32) -> Option<ValueChange> {
        if !value.is_finite() {
            return None;
        }
        let value = self.range.clip(value);
        if !self.range.is_change(self.current, value) {
            return None;
        }

        let mut gesture = None;
        if !self.in_interface_gesture {
            if self.ticks_since_change > GESTURE_LENGTH_IN_TICKS {
                gesture = Some(GestureEdge::Begin);
            }
            self.ticks_since_change = 0;
        }

        self.previous = self.current;
        self.current = value;

        Some(ValueChange {
            previous: self.previous,
            current: self.current,
            gesture,
        })
    }

    /// Open an explicit interface gesture (mouse down on a control)
    ///
    /// Choice bindings have no explicit gestures.
    pub fn begin_gesture(&mut self) -> Option<GestureEdge> {
        if self.in_interface_gesture || matches!(self.range, ValueRange::Choice { .. }) {
            return None;
        }
        self.in_interface_gesture = true;
        Some(GestureEdge::Begin)
    }

    /// Close an explicit interface gesture (mouse up)
    ///
    /// Expires the tick counter so the next tick does not close the gesture a
    /// second time.
    pub fn end_gesture(&mut self) -> Option<GestureEdge> {
        if !self.in_interface_gesture {
            return None;
        }
        self.in_interface_gesture = false;
        self.ticks_since_change = GESTURE_EXPIRED;
        Some(GestureEdge::End)
    }

    /// Advance the implicit gesture counter by one tick
    ///
    /// Returns [`GestureEdge::End`] on the tick that crosses the gesture
    /// length. Suspended while an explicit gesture is open.
    pub fn tick(&mut self) -> Option<GestureEdge> {
        if self.in_interface_gesture || self.ticks_since_change > GESTURE_LENGTH_IN_TICKS {
            return None;
        }
        self.ticks_since_change += 1;
        (self.ticks_since_change > GESTURE_LENGTH_IN_TICKS).then_some(GestureEdge::End)
    }
}

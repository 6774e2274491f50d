//! Shared vocabulary of the synchronization core
//!
//! Change sources, parameter kinds, dirty-flag bitfields, the communication
//! mode and the clamped identifier ranges. Everything else in the crate is
//! expressed in these terms.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Lowest valid source id (matrix input number)
pub const SOURCE_ID_MIN: i32 = 1;
/// Highest valid source id (matrix input number)
pub const SOURCE_ID_MAX: i32 = 64;

/// Lowest valid coordinate mapping id
pub const MAPPING_ID_MIN: i32 = 1;
/// Highest valid coordinate mapping id
pub const MAPPING_ID_MAX: i32 = 4;
/// Coordinate mapping used by freshly created sources
pub const DEFAULT_MAPPING_ID: i32 = 1;

/// Clamp a source id into [`SOURCE_ID_MIN`, `SOURCE_ID_MAX`]
pub fn clamp_source_id(source_id: i32) -> i32 {
    source_id.clamp(SOURCE_ID_MIN, SOURCE_ID_MAX)
}

/// Clamp a mapping id into [`MAPPING_ID_MIN`, `MAPPING_ID_MAX`]
pub fn clamp_mapping_id(mapping_id: i32) -> i32 {
    mapping_id.clamp(MAPPING_ID_MIN, MAPPING_ID_MAX)
}

/// Where a parameter or property change originated
///
/// Each change source is also an observer: it gets told about every change
/// made by the others, never about its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSource {
    /// The on-screen controls of a source (knobs, sliders, text fields)
    Interface,
    /// The host application (project load, automation playback)
    Host,
    /// The device connection, including the controller's own bookkeeping
    Network,
    /// The secondary overview window showing all sources at once
    SecondaryView,
}

impl ChangeSource {
    /// All change sources, in observer-slot order
    pub const ALL: [ChangeSource; 4] = [
        ChangeSource::Interface,
        ChangeSource::Host,
        ChangeSource::Network,
        ChangeSource::SecondaryView,
    ];

    /// Number of observer slots
    pub const COUNT: usize = Self::ALL.len();

    /// Observer slot index
    pub fn index(self) -> usize {
        match self {
            Self::Interface => 0,
            Self::Host => 1,
            Self::Network => 2,
            Self::SecondaryView => 3,
        }
    }
}

/// Bitfield of changed properties ("dirty kinds")
///
/// Session-wide kinds live in the low bits, per-source kinds above them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DirtyFlags(u32);

impl DirtyFlags {
    /// Nothing changed
    pub const NONE: Self = Self(0);

    /// Number of registered sources changed
    pub const SOURCE_COUNT: Self = Self(1 << 0);
    /// Device address changed
    pub const ENDPOINT_ADDRESS: Self = Self(1 << 1);
    /// Send interval changed
    pub const SEND_INTERVAL: Self = Self(1 << 2);
    /// Online/offline status flipped
    pub const ONLINE: Self = Self(1 << 3);
    /// Endpoint address, interval and online status together
    pub const SESSION_CONFIG: Self =
        Self(Self::ENDPOINT_ADDRESS.0 | Self::SEND_INTERVAL.0 | Self::ONLINE.0);

    /// Source id (or display name) changed
    pub const SOURCE_ID: Self = Self(1 << 4);
    /// Coordinate mapping changed
    pub const MAPPING_ID: Self = Self(1 << 5);
    /// Communication mode changed
    pub const COMS_MODE: Self = Self(1 << 6);

    /// X and/or Y changed
    pub const SOURCE_POSITION: Self = Self(1 << 7);
    /// Reverb send gain changed
    pub const REVERB_SEND_GAIN: Self = Self(1 << 8);
    /// Source spread changed
    pub const SOURCE_SPREAD: Self = Self(1 << 9);
    /// Delay mode changed
    pub const DELAY_MODE: Self = Self(1 << 10);
    /// Bypass pseudo-parameter changed
    pub const BYPASS: Self = Self(1 << 11);
    /// The four parameter kinds exchanged with the device
    pub const OSC_PARAMETERS: Self = Self(
        Self::SOURCE_POSITION.0 | Self::REVERB_SEND_GAIN.0 | Self::SOURCE_SPREAD.0 | Self::DELAY_MODE.0,
    );
    /// Every automatable parameter kind, bypass included
    pub const AUTOMATION_PARAMETERS: Self = Self(Self::OSC_PARAMETERS.0 | Self::BYPASS.0);

    /// Every kind
    pub const ALL: Self = Self((1 << 12) - 1);

    /// Raw bit representation
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if no bit is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any bit of `other` is set in `self`
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DirtyFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for DirtyFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

/// One automatable parameter of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Horizontal position within the coordinate mapping, 0..1
    X,
    /// Vertical position within the coordinate mapping, 0..1
    Y,
    /// Reverb (En-Space) send gain in dB, -120..24
    ReverbSendGain,
    /// Source spread factor, 0..1
    SourceSpread,
    /// Delay mode choice: 0 = Off, 1 = Tight, 2 = Full
    DelayMode,
    /// OSC bypass pseudo-parameter: 0 = OSC on, 1 = OSC off
    Bypass,
}

impl ParameterKind {
    /// All parameter kinds in binding order
    pub const ALL: [ParameterKind; 6] = [
        ParameterKind::X,
        ParameterKind::Y,
        ParameterKind::ReverbSendGain,
        ParameterKind::SourceSpread,
        ParameterKind::DelayMode,
        ParameterKind::Bypass,
    ];

    /// Number of bindings per source
    pub const COUNT: usize = Self::ALL.len();

    /// Binding slot index
    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::ReverbSendGain => 2,
            Self::SourceSpread => 3,
            Self::DelayMode => 4,
            Self::Bypass => 5,
        }
    }

    /// Dirty kind raised when this parameter changes
    pub fn dirty_flag(self) -> DirtyFlags {
        match self {
            Self::X | Self::Y => DirtyFlags::SOURCE_POSITION,
            Self::ReverbSendGain => DirtyFlags::REVERB_SEND_GAIN,
            Self::SourceSpread => DirtyFlags::SOURCE_SPREAD,
            Self::DelayMode => DirtyFlags::DELAY_MODE,
            Self::Bypass => DirtyFlags::BYPASS,
        }
    }

    /// Short display name
    pub fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::ReverbSendGain => "Reverb",
            Self::SourceSpread => "Spread",
            Self::DelayMode => "Delay",
            Self::Bypass => "OSCBypass",
        }
    }
}

/// Parameter groups exchanged with the device, in tick processing order
///
/// Position covers X and Y, which always travel in one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OscParameter {
    /// X/Y position within a coordinate mapping
    Position,
    /// Reverb send gain
    ReverbSendGain,
    /// Source spread
    SourceSpread,
    /// Delay mode
    DelayMode,
}

impl OscParameter {
    /// Processing order within one tick
    pub const ALL: [OscParameter; 4] = [
        OscParameter::Position,
        OscParameter::ReverbSendGain,
        OscParameter::SourceSpread,
        OscParameter::DelayMode,
    ];

    /// Dirty kind covering this group
    pub fn dirty_flag(self) -> DirtyFlags {
        match self {
            Self::Position => DirtyFlags::SOURCE_POSITION,
            Self::ReverbSendGain => DirtyFlags::REVERB_SEND_GAIN,
            Self::SourceSpread => DirtyFlags::SOURCE_SPREAD,
            Self::DelayMode => DirtyFlags::DELAY_MODE,
        }
    }
}

/// Delay mode choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DelayMode {
    /// No delay compensation
    Off,
    /// Tight delay compensation
    #[default]
    Tight,
    /// Full delay compensation
    Full,
}

impl DelayMode {
    /// Map a choice index, clamping out-of-range values
    pub fn from_index(index: i32) -> Self {
        match index {
            i32::MIN..=0 => Self::Off,
            1 => Self::Tight,
            _ => Self::Full,
        }
    }

    /// Choice index
    pub fn index(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::Tight => 1,
            Self::Full => 2,
        }
    }
}

/// What a source is allowed to exchange with the device
///
/// `can_send` issues SET commands for local changes, `can_receive` issues
/// GET requests and accepts responses. `poll_once` is a one-shot overlay:
/// request values once and accept the first response even without
/// `can_receive`, then clear itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComsMode {
    /// Send SET commands (Tx)
    pub can_send: bool,
    /// Send GET requests and accept responses (Rx)
    pub can_receive: bool,
    /// Pending one-shot poll
    pub poll_once: bool,
}

impl ComsMode {
    /// No traffic; equivalent to bypassed
    pub const OFF: Self = Self { can_send: false, can_receive: false, poll_once: false };
    /// Send only
    pub const TX: Self = Self { can_send: true, can_receive: false, poll_once: false };
    /// Receive only
    pub const RX: Self = Self { can_send: false, can_receive: true, poll_once: false };
    /// Send and receive
    pub const SYNC: Self = Self { can_send: true, can_receive: true, poll_once: false };

    /// True if neither sending nor receiving is enabled
    pub fn is_bypassed(self) -> bool {
        !self.can_send && !self.can_receive
    }

    /// True if responses may be accepted (Rx or a pending poll)
    pub fn accepts_responses(self) -> bool {
        self.can_receive || self.poll_once
    }

    /// Copy with the one-shot poll flag set or cleared
    pub fn with_poll_once(self, poll_once: bool) -> Self {
        Self { poll_once, ..self }
    }

    /// Parse "off", "tx", "rx" or "sync" (case-insensitive)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "bypass" => Some(Self::OFF),
            "tx" | "send" => Some(Self::TX),
            "rx" | "receive" => Some(Self::RX),
            "sync" | "txrx" | "rxtx" => Some(Self::SYNC),
            _ => None,
        }
    }

    /// Short label ("Off", "Tx", "Rx", "Sync"), ignoring the poll flag
    pub fn label(self) -> &'static str {
        match (self.can_send, self.can_receive) {
            (false, false) => "Off",
            (true, false) => "Tx",
            (false, true) => "Rx",
            (true, true) => "Sync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_clamping() {
        assert_eq!(clamp_source_id(-5), 1);
        assert_eq!(clamp_source_id(0), 1);
        assert_eq!(clamp_source_id(17), 17);
        assert_eq!(clamp_source_id(64), 64);
        assert_eq!(clamp_source_id(65), 64);
        assert_eq!(clamp_source_id(i32::MAX), 64);
    }

    #[test]
    fn test_mapping_id_clamping() {
        assert_eq!(clamp_mapping_id(0), 1);
        assert_eq!(clamp_mapping_id(3), 3);
        assert_eq!(clamp_mapping_id(9), 4);
    }

    #[test]
    fn test_dirty_flag_ops() {
        let mut flags = DirtyFlags::SOURCE_POSITION | DirtyFlags::DELAY_MODE;
        assert!(flags.intersects(DirtyFlags::OSC_PARAMETERS));
        assert!(!flags.contains(DirtyFlags::OSC_PARAMETERS));
        assert!(DirtyFlags::OSC_PARAMETERS.contains(flags));

        flags.remove(DirtyFlags::SOURCE_POSITION);
        assert_eq!(flags, DirtyFlags::DELAY_MODE);
        assert_eq!(!DirtyFlags::ALL, DirtyFlags::NONE);
        assert!(!DirtyFlags::AUTOMATION_PARAMETERS.intersects(DirtyFlags::SESSION_CONFIG));
    }

    #[test]
    fn test_position_kinds_share_flag() {
        assert_eq!(ParameterKind::X.dirty_flag(), ParameterKind::Y.dirty_flag());
        assert_eq!(OscParameter::Position.dirty_flag(), DirtyFlags::SOURCE_POSITION);
    }

    #[test]
    fn test_coms_mode_regions() {
        assert!(ComsMode::OFF.is_bypassed());
        assert!(!ComsMode::TX.is_bypassed());
        assert!(!ComsMode::RX.is_bypassed());
        assert!(!ComsMode::SYNC.is_bypassed());

        // A pending poll alone does not leave bypass
        assert!(ComsMode::OFF.with_poll_once(true).is_bypassed());
        assert!(ComsMode::TX.with_poll_once(true).accepts_responses());
        assert!(!ComsMode::TX.accepts_responses());
    }

    #[test]
    fn test_coms_mode_parse() {
        assert_eq!(ComsMode::parse("Sync"), Some(ComsMode::SYNC));
        assert_eq!(ComsMode::parse(" rx "), Some(ComsMode::RX));
        assert_eq!(ComsMode::parse("off"), Some(ComsMode::OFF));
        assert_eq!(ComsMode::parse("loud"), None);
        assert_eq!(ComsMode::SYNC.label(), "Sync");
    }

    #[test]
    fn test_delay_mode_index() {
        assert_eq!(DelayMode::from_index(-3), DelayMode::Off);
        assert_eq!(DelayMode::from_index(1), DelayMode::Tight);
        assert_eq!(DelayMode::from_index(7), DelayMode::Full);
        assert_eq!(DelayMode::Full.index(), 2);
    }
}

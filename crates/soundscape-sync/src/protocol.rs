//! OSC address space of the device
//!
//! Builds outbound SET/GET/ping messages and classifies inbound messages.
//! Packets are encoded and decoded with `rosc`; bundles are flattened into
//! their messages in order.

use crate::source::Source;
use crate::types::{DelayMode, OscParameter, ParameterKind};
use rosc::{OscMessage, OscPacket, OscType};
use thiserror::Error;

/// Keepalive request
pub const PING_ADDRESS: &str = "/ping";
/// Keepalive reply
pub const PONG_ADDRESS: &str = "/pong";
/// Position prefix, followed by `{mapping_id}/{source_id}`
pub const POSITION_PREFIX: &str = "/dbaudio1/coordinatemapping/source_position_xy/";
/// Reverb send gain prefix, followed by `{source_id}`
pub const REVERB_SEND_GAIN_PREFIX: &str = "/dbaudio1/matrixinput/reverbsendgain/";
/// Source spread prefix, followed by `{source_id}`
pub const SOURCE_SPREAD_PREFIX: &str = "/dbaudio1/positioning/source_spread/";
/// Delay mode prefix, followed by `{source_id}`
pub const DELAY_MODE_PREFIX: &str = "/dbaudio1/positioning/source_delaymode/";

/// UDP port the device listens on
pub const DEFAULT_DEVICE_PORT: u16 = 50010;
/// UDP port the device replies to
pub const DEFAULT_LISTEN_PORT: u16 = 50011;

/// Largest datagram the receiver reads
pub const MAX_DATAGRAM_SIZE: usize = 1536;

/// Errors classifying or transcoding OSC traffic
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unrecognized address: {0}")]
    UnknownAddress(String),

    #[error("Invalid index in address: {0}")]
    InvalidIndex(String),

    #[error("{address}: expected {expected} argument(s), got {found}")]
    MissingArguments {
        address: String,
        expected: usize,
        found: usize,
    },

    #[error("{0}: argument is not numeric")]
    NonNumericArgument(String),

    #[error("OSC decode failed: {0}")]
    Decode(String),

    #[error("OSC encode failed: {0}")]
    Encode(String),
}

/// A value reported by the device for one source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundValue {
    Position { mapping_id: i32, source_id: i32, x: f32, y: f32 },
    ReverbSendGain { source_id: i32, gain: f32 },
    SourceSpread { source_id: i32, spread: f32 },
    DelayMode { source_id: i32, mode: DelayMode },
}

impl InboundValue {
    /// Parameter group this value belongs to
    pub fn parameter(&self) -> OscParameter {
        match self {
            Self::Position { .. } => OscParameter::Position,
            Self::ReverbSendGain { .. } => OscParameter::ReverbSendGain,
            Self::SourceSpread { .. } => OscParameter::SourceSpread,
            Self::DelayMode { .. } => OscParameter::DelayMode,
        }
    }

    /// Target source id from the address
    pub fn source_id(&self) -> i32 {
        match *self {
            Self::Position { source_id, .. }
            | Self::ReverbSendGain { source_id, .. }
            | Self::SourceSpread { source_id, .. }
            | Self::DelayMode { source_id, .. } => source_id,
        }
    }

    /// Mapping id for position values
    pub fn mapping_id(&self) -> Option<i32> {
        match *self {
            Self::Position { mapping_id, .. } => Some(mapping_id),
            _ => None,
        }
    }

    /// Parameter writes carried by this value
    pub fn writes(&self) -> Vec<(ParameterKind, f32)> {
        match *self {
            Self::Position { x, y, .. } => vec![(ParameterKind::X, x), (ParameterKind::Y, y)],
            Self::ReverbSendGain { gain, .. } => vec![(ParameterKind::ReverbSendGain, gain)],
            Self::SourceSpread { spread, .. } => vec![(ParameterKind::SourceSpread, spread)],
            Self::DelayMode { mode, .. } => vec![(ParameterKind::DelayMode, mode.index() as f32)],
        }
    }
}

/// Classified inbound message
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inbound {
    Pong,
    Value(InboundValue),
}

// ─── Outbound ──────────────────────────────────────────────────────────

/// Address of a parameter group for one source
pub fn parameter_address(parameter: OscParameter, source_id: i32, mapping_id: i32) -> String {
    match parameter {
        OscParameter::Position => format!("{}{}/{}", POSITION_PREFIX, mapping_id, source_id),
        OscParameter::ReverbSendGain => format!("{}{}", REVERB_SEND_GAIN_PREFIX, source_id),
        OscParameter::SourceSpread => format!("{}{}", SOURCE_SPREAD_PREFIX, source_id),
        OscParameter::DelayMode => format!("{}{}", DELAY_MODE_PREFIX, source_id),
    }
}

/// Keepalive ping
pub fn ping_message() -> OscMessage {
    OscMessage {
        addr: PING_ADDRESS.to_string(),
        args: Vec::new(),
    }
}

/// SET command carrying the source's current value(s)
pub fn set_message(parameter: OscParameter, source: &Source) -> OscMessage {
    let args = match parameter {
        OscParameter::Position => vec![
            OscType::Float(source.parameter_value(ParameterKind::X)),
            OscType::Float(source.parameter_value(ParameterKind::Y)),
        ],
        OscParameter::ReverbSendGain => {
            vec![OscType::Float(source.parameter_value(ParameterKind::ReverbSendGain))]
        }
        OscParameter::SourceSpread => {
            vec![OscType::Float(source.parameter_value(ParameterKind::SourceSpread))]
        }
        OscParameter::DelayMode => {
            vec![OscType::Int(source.delay_mode().index())]
        }
    };
    OscMessage {
        addr: parameter_address(parameter, source.source_id(), source.mapping_id()),
        args,
    }
}

/// GET request: the address alone
pub fn get_message(parameter: OscParameter, source: &Source) -> OscMessage {
    OscMessage {
        addr: parameter_address(parameter, source.source_id(), source.mapping_id()),
        args: Vec::new(),
    }
}

/// Encode a single message into a datagram
pub fn encode_message(message: OscMessage) -> Result<Vec<u8>, ProtocolError> {
    rosc::encoder::encode(&OscPacket::Message(message))
        .map_err(|e| ProtocolError::Encode(format!("{:?}", e)))
}

// ─── Inbound ───────────────────────────────────────────────────────────

/// Decode a datagram into its messages, flattening bundles
pub fn decode_datagram(datagram: &[u8]) -> Result<Vec<OscMessage>, ProtocolError> {
    let (_, packet) =
        rosc::decoder::decode_udp(datagram).map_err(|e| ProtocolError::Decode(format!("{:?}", e)))?;
    let mut messages = Vec::new();
    flatten_packet(packet, &mut messages);
    Ok(messages)
}

fn flatten_packet(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(message) => out.push(message),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten_packet(inner, out);
            }
        }
    }
}

/// Classify an inbound message
///
/// Messages without arguments (echoed GET requests, for instance) and
/// addresses outside the modelled set are reported as errors; callers drop
/// them.
pub fn parse_inbound(message: &OscMessage) -> Result<Inbound, ProtocolError> {
    let address = message.addr.as_str();
    if address == PONG_ADDRESS {
        return Ok(Inbound::Pong);
    }

    if let Some(rest) = address.strip_prefix(POSITION_PREFIX) {
        let (mapping, source) = rest
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidIndex(address.to_string()))?;
        let mapping_id = parse_index(address, mapping)?;
        let source_id = parse_index(address, source)?;
        let [x, y] = numeric_args::<2>(message)?;
        return Ok(Inbound::Value(InboundValue::Position { mapping_id, source_id, x, y }));
    }

    if let Some(rest) = address.strip_prefix(REVERB_SEND_GAIN_PREFIX) {
        let source_id = parse_index(address, rest)?;
        let [gain] = numeric_args::<1>(message)?;
        return Ok(Inbound::Value(InboundValue::ReverbSendGain { source_id, gain }));
    }

    if let Some(rest) = address.strip_prefix(SOURCE_SPREAD_PREFIX) {
        let source_id = parse_index(address, rest)?;
        let [spread] = numeric_args::<1>(message)?;
        return Ok(Inbound::Value(InboundValue::SourceSpread { source_id, spread }));
    }

    if let Some(rest) = address.strip_prefix(DELAY_MODE_PREFIX) {
        let source_id = parse_index(address, rest)?;
        let [mode] = numeric_args::<1>(message)?;
        return Ok(Inbound::Value(InboundValue::DelayMode {
            source_id,
            mode: DelayMode::from_index(mode as i32),
        }));
    }

    Err(ProtocolError::UnknownAddress(address.to_string()))
}

/// Parse one address segment as a positive integer
fn parse_index(address: &str, segment: &str) -> Result<i32, ProtocolError> {
    match segment.parse::<i32>() {
        Ok(index) if index > 0 => Ok(index),
        _ => Err(ProtocolError::InvalidIndex(address.to_string())),
    }
}

/// First `N` arguments as floats; ints are accepted too
fn numeric_args<const N: usize>(message: &OscMessage) -> Result<[f32; N], ProtocolError> {
    if message.args.len() < N {
        return Err(ProtocolError::MissingArguments {
            address: message.addr.clone(),
            expected: N,
            found: message.args.len(),
        });
    }
    let mut values = [0.0; N];
    for (value, arg) in values.iter_mut().zip(&message.args) {
        *value = match *arg {
            OscType::Float(f) => f,
            OscType::Int(i) => i as f32,
            OscType::Double(d) => d as f32,
            OscType::Long(l) => l as f32,
            _ => return Err(ProtocolError::NonNumericArgument(message.addr.clone())),
        };
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeSource, ComsMode};

    fn msg(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage { addr: addr.to_string(), args }
    }

    #[test]
    fn test_set_position_address_and_args() {
        let mut source = Source::new(ComsMode::TX);
        source.set_source_id(ChangeSource::Host, 7);
        source.set_mapping_id(ChangeSource::Host, 3);
        source.set_parameter_value(ChangeSource::Host, ParameterKind::X, 0.25);

        let message = set_message(OscParameter::Position, &source);
        assert_eq!(message.addr, "/dbaudio1/coordinatemapping/source_position_xy/3/7");
        assert_eq!(message.args, vec![OscType::Float(0.25), OscType::Float(0.5)]);

        let get = get_message(OscParameter::Position, &source);
        assert_eq!(get.addr, message.addr);
        assert!(get.args.is_empty());
    }

    #[test]
    fn test_delay_mode_is_sent_as_int() {
        let source = Source::new(ComsMode::TX);
        let message = set_message(OscParameter::DelayMode, &source);
        assert_eq!(message.addr, "/dbaudio1/positioning/source_delaymode/1");
        assert_eq!(message.args, vec![OscType::Int(1)]);
    }

    #[test]
    fn test_inbound_delay_mode_is_clamped_to_choices() {
        let delay = parse_inbound(&msg("/dbaudio1/positioning/source_delaymode/2", vec![OscType::Int(9)])).unwrap();
        let Inbound::Value(value) = delay else {
            panic!("expected a value, got {:?}", delay);
        };
        assert_eq!(value, InboundValue::DelayMode { source_id: 2, mode: DelayMode::Full });
        assert_eq!(value.writes(), vec![(ParameterKind::DelayMode, 2.0)]);
    }

    #[test]
    fn test_parse_pong() {
        assert_eq!(parse_inbound(&msg("/pong", vec![])).unwrap(), Inbound::Pong);
    }

    #[test]
    fn test_parse_position_response() {
        let inbound = parse_inbound(&msg(
            "/dbaudio1/coordinatemapping/source_position_xy/2/12",
            vec![OscType::Float(0.1), OscType::Float(0.9)],
        ))
        .unwrap();
        let Inbound::Value(value) = inbound else {
            panic!("expected a value, got {:?}", inbound);
        };
        assert_eq!(value.parameter(), OscParameter::Position);
        assert_eq!(value.source_id(), 12);
        assert_eq!(value.mapping_id(), Some(2));
        assert_eq!(value.writes(), vec![(ParameterKind::X, 0.1), (ParameterKind::Y, 0.9)]);
    }

    #[test]
    fn test_parse_accepts_int_and_float() {
        let delay = parse_inbound(&msg("/dbaudio1/positioning/source_delaymode/4", vec![OscType::Int(2)])).unwrap();
        assert_eq!(delay, Inbound::Value(InboundValue::DelayMode { source_id: 4, mode: DelayMode::Full }));

        let gain = parse_inbound(&msg("/dbaudio1/matrixinput/reverbsendgain/4", vec![OscType::Int(-6)])).unwrap();
        assert_eq!(gain, Inbound::Value(InboundValue::ReverbSendGain { source_id: 4, gain: -6.0 }));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // Echoed GET without arguments
        assert!(matches!(
            parse_inbound(&msg("/dbaudio1/positioning/source_spread/3", vec![])),
            Err(ProtocolError::MissingArguments { expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            parse_inbound(&msg("/dbaudio1/positioning/source_spread/abc", vec![OscType::Float(0.2)])),
            Err(ProtocolError::InvalidIndex(_))
        ));
        assert!(matches!(
            parse_inbound(&msg("/dbaudio1/positioning/source_spread/0", vec![OscType::Float(0.2)])),
            Err(ProtocolError::InvalidIndex(_))
        ));
        assert!(matches!(
            parse_inbound(&msg("/dbaudio1/coordinatemapping/source_position_xy/5", vec![])),
            Err(ProtocolError::InvalidIndex(_))
        ));
        assert!(matches!(
            parse_inbound(&msg("/dbaudio1/matrixinput/mute/1", vec![OscType::Int(1)])),
            Err(ProtocolError::UnknownAddress(_))
        ));
        assert!(matches!(
            parse_inbound(&msg(
                "/dbaudio1/positioning/source_spread/3",
                vec![OscType::String("wide".into())]
            )),
            Err(ProtocolError::NonNumericArgument(_))
        ));
    }

    #[test]
    fn test_encode_then_decode_bundle_flattens() {
        let bundle = OscPacket::Bundle(rosc::OscBundle {
            timetag: rosc::OscTime { seconds: 0, fractional: 1 },
            content: vec![
                OscPacket::Message(msg("/pong", vec![])),
                OscPacket::Message(msg(
                    "/dbaudio1/positioning/source_spread/1",
                    vec![OscType::Float(0.3)],
                )),
            ],
        });
        let bytes = rosc::encoder::encode(&bundle).unwrap();
        let messages = decode_datagram(&bytes).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].addr, "/pong");

        assert!(decode_datagram(&[0x01, 0x02]).is_err());
        assert_eq!(decode_datagram(&encode_message(ping_message()).unwrap()).unwrap()[0].addr, "/ping");
    }
}

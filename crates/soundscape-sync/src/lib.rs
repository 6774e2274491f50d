//! OSC synchronization of sound source parameters with a spatial audio processor
//!
//! This crate provides:
//! - Sound sources with position, reverb send, spread, delay mode and bypass
//!   parameters, each bracketed into host automation gestures
//! - Change fan-out between the interface, the host, the network and a
//!   secondary overview, so every observer learns about every change exactly
//!   once and never about its own
//! - A controller that multiplexes all sources over one UDP/OSC connection,
//!   gates stale responses and tracks device liveness
//! - A session that runs the controller on a tick worker and a receive thread
//!
//! # Architecture
//!
//! ```text
//! interface / host ──► SyncSession ──► Mutex<SyncController> ──► UdpTransport ──► device
//!                                            ▲      │
//!              tick worker (send interval) ──┘      └──► SessionEvent channel ──► host
//!              OSC receive thread ◄───────────────────────────────────────────── device
//! ```
//!
//! A tick sends, per source and parameter, a SET for local changes (Tx), a
//! GET otherwise (Rx or a pending one-shot poll), and a ping when nothing
//! else went out for a while. Responses are applied unless a SET for the same
//! parameter is in flight or a local change is still waiting to be sent.

mod config;
mod connection;
mod controller;
mod notifier;
mod parameter;
mod protocol;
mod registry;
mod session;
mod source;
mod types;

pub use config::{default_sync_config_path, load_sync_config, save_sync_config, SyncConfig};
pub use connection::{EndpointError, OscReceiver, Transport, UdpTransport};
pub use controller::{
    clamp_send_interval, supported_send_interval_range, SessionEvent, SyncController,
    DEFAULT_ENDPOINT_ADDRESS, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_SEND_INTERVAL_MS, EVENT_QUEUE_CAPACITY,
    KEEPALIVE_TIMEOUT_MS, MAX_HEARTBEAT_TICKS, SEND_INTERVAL_MAX_MS, SEND_INTERVAL_MIN_MS,
};
pub use notifier::ChangeNotifier;
pub use parameter::{GestureEdge, ParameterBinding, ValueChange, ValueRange, GESTURE_LENGTH_IN_TICKS};
pub use protocol::{
    parse_inbound, Inbound, InboundValue, ProtocolError, DEFAULT_DEVICE_PORT, DEFAULT_LISTEN_PORT,
};
pub use registry::{SourceHandle, SourceRegistry};
pub use session::{SyncError, SyncSession};
pub use source::{GestureNotice, Source, SourceSnapshot};
pub use types::{
    clamp_mapping_id, clamp_source_id, ChangeSource, ComsMode, DelayMode, DirtyFlags,
    OscParameter, ParameterKind, MAPPING_ID_MAX, MAPPING_ID_MIN, SOURCE_ID_MAX, SOURCE_ID_MIN,
};

//! # rcc-core
//!
//! Client-side protocol engine for instrument remote control.
//!
//! This crate contains:
//! - **Codec**: `FrameCodec`, the 4-byte little-endian length-prefix framing
//! - **Transport**: the continuous read loop and the framed writer
//! - **Markup**: root inspection and `Cookie`/`Culture` stamping
//! - **Router**: reply vs. broadcast vs. raw classification of inbound messages
//! - **Dispatch**: the single-outstanding-command worker
//! - **Heartbeat**: the idle keep-alive timer
//! - **Events**: `EventBus`, the injected publish/subscribe seam
//! - **Relay**: `AlternateTransport` and relay status parsing
//! - **Engine**: `Engine`, tying it all to one connection
//! - **Error**: `RccError`, a `thiserror`-based error type

pub mod codec;
pub mod config;
mod dispatch;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod markup;
pub mod relay;
pub mod request;
pub mod router;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{DEFAULT_MAX_FRAME_LEN, FrameCodec, PREFIX_LEN};
pub use config::{DEFAULT_BROADCAST_TAG, DEFAULT_HEARTBEAT_PAYLOAD, EngineConfig};
pub use encoding::TextEncoding;
pub use engine::{ConnectionInfo, Engine};
pub use error::RccError;
pub use event::{Direction, EngineEvent, EventBus, LocalEventBus, TrafficRecord};
pub use relay::{AlternateTransport, ServerError, TransportMode, parse_server_error};
pub use request::{
    ChannelSink, LOGOFF_COOKIE, LOGON_COOKIE, OutgoingRequest, Reply, ReplySink, SinkEvent,
};
pub use router::{ResponseRouter, Routed};
pub use state::{CommandSlot, ConnectionPhase, PendingCommand};

//! Events published by the engine and the bus they travel on.
//!
//! The bus is injected into the engine at construction. Publishing never
//! blocks: a bus without subscribers, or with lagging ones, has no effect
//! on the protocol.

use std::fmt::Write as _;

use bytes::Bytes;
use tokio::sync::broadcast;

/// Default capacity of [`LocalEventBus`].
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Which way a chunk of traffic travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the instrument.
    Inbound,
    /// Written to the instrument.
    Outbound,
}

/// One raw chunk as it crossed the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub direction: Direction,
    pub bytes: Bytes,
}

impl TrafficRecord {
    pub fn new(direction: Direction, bytes: Bytes) -> Self {
        Self { direction, bytes }
    }

    /// Upper-case hex pairs separated by spaces, e.g. `0A 00 3C 00`.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len() * 3);
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{b:02X}");
        }
        out
    }
}

/// Everything the engine tells the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The connection was torn down. `requested` is `true` when a caller
    /// asked for it, `false` when an I/O failure forced it.
    ClientDisconnected { requested: bool },
    /// A markup message not addressed to the pending command.
    MessageArrived(String),
    /// A non-markup message (plain text, bracket or brace delimited).
    RawMessageArrived(String),
    /// A raw chunk was sent or received.
    TrafficRecorded(TrafficRecord),
    /// A command was given up on (timeout, malformed reply, send failure).
    CommandFailed { cookie: String, reason: String },
}

/// Publish/subscribe seam between the engine and its observers.
pub trait EventBus: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
    fn publish(&self, event: EngineEvent);
}

/// In-process bus backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct LocalEventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_MAX_FRAME_LEN, PREFIX_LEN};
use crate::encoding::TextEncoding;
use crate::error::RccError;

/// Root element name that marks an unsolicited broadcast.
pub const DEFAULT_BROADCAST_TAG: &str = "CornerstoneMessage";

/// No-op command sent to keep the session alive.
pub const DEFAULT_HEARTBEAT_PAYLOAD: &str = "<Heartbeat/>";

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Payload text encoding.
    pub encoding: TextEncoding,
    /// Culture stamped on every markup command.
    pub culture: String,
    /// Root element name of broadcast messages.
    pub broadcast_tag: String,
    /// Idle time after which a heartbeat is sent, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat command document.
    pub heartbeat_payload: String,
    /// Reply deadline per command in milliseconds (0 = wait forever).
    pub command_timeout_ms: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Largest accepted payload in bytes.
    pub max_frame_len: usize,
    /// Publish every raw chunk as a traffic event.
    pub record_traffic: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            encoding: TextEncoding::Utf16Le,
            culture: "en-US".into(),
            broadcast_tag: DEFAULT_BROADCAST_TAG.into(),
            heartbeat_interval_ms: 30_000,
            heartbeat_payload: DEFAULT_HEARTBEAT_PAYLOAD.into(),
            command_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            read_buffer_size: 4096,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            record_traffic: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), RccError> {
        if self.read_buffer_size < PREFIX_LEN {
            return Err(RccError::Config(format!(
                "read_buffer_size must be at least {PREFIX_LEN} bytes, got {}",
                self.read_buffer_size
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RccError::Config("heartbeat_interval_ms must be non-zero".into()));
        }
        if self.broadcast_tag.trim().is_empty() {
            return Err(RccError::Config("broadcast_tag must not be empty".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

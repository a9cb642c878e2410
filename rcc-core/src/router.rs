//! Classification and delivery of completed inbound messages.
//!
//! A markup message is the reply to the pending command unless its root
//! is the broadcast tag or nothing is pending; then it goes to the bus.
//! Non-markup messages are delivered to the pending command (if any) and
//! always mirrored on the raw-message bus.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::event::{EngineEvent, EventBus};
use crate::markup::{self, MarkupInfo};
use crate::request::Reply;
use crate::state::{CommandSlot, PendingCommand};

/// Where a message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Delivered as the reply to the command with this cookie.
    Reply { cookie: String },
    /// Published as an unsolicited message.
    Broadcast,
    /// Mirrored on the raw bus; `replied` tells whether a command took it.
    Raw { replied: bool },
    /// Could not be parsed; the pending command (if any) was failed.
    Malformed,
}

impl Routed {
    /// Whether routing freed the command slot.
    pub fn freed_slot(&self) -> bool {
        matches!(
            self,
            Routed::Reply { .. } | Routed::Raw { replied: true } | Routed::Malformed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResponseRouter {
    broadcast_tag: String,
}

impl ResponseRouter {
    pub fn new(broadcast_tag: impl Into<String>) -> Self {
        Self {
            broadcast_tag: broadcast_tag.into(),
        }
    }

    pub fn broadcast_tag(&self) -> &str {
        &self.broadcast_tag
    }

    pub fn route(&self, text: String, slot: &Mutex<CommandSlot>, bus: &dyn EventBus) -> Routed {
        if !markup::looks_like_markup(&text) {
            return self.route_raw(text, slot, bus);
        }

        match markup::inspect(&text) {
            Ok(info) => self.route_markup(text, info, slot, bus),
            Err(e) => {
                let failed = slot.lock().take();
                match failed {
                    Some(cmd) => {
                        warn!(cookie = %cmd.cookie, error = %e, "malformed reply; failing pending command");
                        fail(cmd, format!("malformed reply: {e}"), bus);
                    }
                    None => {
                        warn!(error = %e, "malformed unsolicited message");
                        bus.publish(EngineEvent::RawMessageArrived(text));
                    }
                }
                Routed::Malformed
            }
        }
    }

    fn route_markup(
        &self,
        text: String,
        info: MarkupInfo,
        slot: &Mutex<CommandSlot>,
        bus: &dyn EventBus,
    ) -> Routed {
        if info.root != self.broadcast_tag {
            let pending = slot.lock().take();
            if let Some(cmd) = pending {
                if let Some(echoed) = info.cookie.as_deref() {
                    if echoed != cmd.cookie {
                        warn!(expected = %cmd.cookie, echoed, "reply cookie does not match pending command");
                    }
                }
                debug!(cookie = %cmd.cookie, root = %info.root, "reply routed");
                let cookie = cmd.cookie.clone();
                if let Some(sink) = cmd.sink {
                    sink.process_response(Reply::Markup(text));
                }
                return Routed::Reply { cookie };
            }
        }

        debug!(root = %info.root, "broadcast routed");
        bus.publish(EngineEvent::MessageArrived(text));
        Routed::Broadcast
    }

    fn route_raw(&self, text: String, slot: &Mutex<CommandSlot>, bus: &dyn EventBus) -> Routed {
        let pending = slot.lock().take();
        let replied = pending.is_some();
        if let Some(cmd) = pending {
            debug!(cookie = %cmd.cookie, "raw reply routed");
            if let Some(sink) = cmd.sink {
                sink.process_response(Reply::Raw(text.clone()));
            }
        }
        bus.publish(EngineEvent::RawMessageArrived(text));
        Routed::Raw { replied }
    }
}

/// Give up on `cmd`: tell its sink and the bus.
pub(crate) fn fail(cmd: PendingCommand, reason: String, bus: &dyn EventBus) {
    if let Some(sink) = &cmd.sink {
        sink.process_response(Reply::Failed {
            cookie: cmd.cookie.clone(),
            reason: reason.clone(),
        });
    }
    bus.publish(EngineEvent::CommandFailed {
        cookie: cmd.cookie,
        reason,
    });
}

// ── Tests ────────────────────────────────────────────────────────

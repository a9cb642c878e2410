//! The single in-flight command.
//!
//! The wire protocol has no multiplexing, so at most one command may be
//! outstanding. [`CommandSlot`] holds it together with an optional
//! deadline after which the dispatch loop gives up on the reply.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RccError;
use crate::request::ReplySink;

// ── PendingCommand ───────────────────────────────────────────────

/// A command that was written to the wire and awaits its reply.
pub struct PendingCommand {
    pub cookie: String,
    pub sink: Option<Arc<dyn ReplySink>>,
    pub sent_at: Instant,
    /// `None` means wait forever.
    pub deadline: Option<Duration>,
}

impl PendingCommand {
    pub fn new(
        cookie: impl Into<String>,
        sink: Option<Arc<dyn ReplySink>>,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            cookie: cookie.into(),
            sink,
            sent_at: Instant::now(),
            deadline,
        }
    }

    /// Returns `true` if this command has exceeded its deadline.
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => self.sent_at.elapsed() >= d,
            None => false,
        }
    }

    /// How long this command has been in flight.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// The instant at which the command expires.
    pub fn expires_at(&self) -> Option<Instant> {
        self.deadline.map(|d| self.sent_at + d)
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("cookie", &self.cookie)
            .field("has_sink", &self.sink.is_some())
            .field("elapsed", &self.elapsed())
            .field("deadline", &self.deadline)
            .finish()
    }
}

// ── CommandSlot ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CommandSlot {
    current: Option<PendingCommand>,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `cmd` as the outstanding command.
    pub fn occupy(&mut self, cmd: PendingCommand) -> Result<(), RccError> {
        if self.current.is_some() {
            return Err(RccError::ProtocolViolation(
                "a command is already outstanding",
            ));
        }
        self.current = Some(cmd);
        Ok(())
    }

    /// Remove and return the outstanding command.
    pub fn take(&mut self) -> Option<PendingCommand> {
        self.current.take()
    }

    /// Remove the outstanding command only if it carries `cookie`.
    pub fn take_if(&mut self, cookie: &str) -> Option<PendingCommand> {
        match &self.current {
            Some(cmd) if cmd.cookie == cookie => self.current.take(),
            _ => None,
        }
    }

    /// Remove and return the outstanding command if its deadline passed.
    pub fn take_expired(&mut self) -> Option<PendingCommand> {
        match &self.current {
            Some(cmd) if cmd.is_expired() => self.current.take(),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }

    pub fn cookie(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.cookie.as_str())
    }

    pub fn get(&self) -> Option<&PendingCommand> {
        self.current.as_ref()
    }
}

// ── Tests ─────────────────────────────────────────────────────────

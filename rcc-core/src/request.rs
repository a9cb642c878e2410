//! Outgoing requests and the sinks their replies are delivered to.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

/// Cookie used by the logon command; its reply is special-cased upstream.
pub const LOGON_COOKIE: &str = "LOGON";

/// Cookie used by the logoff command.
pub const LOGOFF_COOKIE: &str = "LOGOFF";

/// What a [`ReplySink`] receives for its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A markup reply document.
    Markup(String),
    /// A non-markup reply, passed through verbatim.
    Raw(String),
    /// No usable reply will arrive.
    Failed { cookie: String, reason: String },
}

/// Receiver of a request's reply and of its outbound traffic notice.
///
/// Called from engine tasks; implementations must not block.
pub trait ReplySink: Send + Sync {
    fn process_response(&self, reply: Reply);

    /// The request left for the wire, exactly as written.
    fn traffic_out(&self, _data: &str) {}
}

/// A command waiting to be dispatched.
#[derive(Clone)]
pub struct OutgoingRequest {
    pub payload: String,
    pub cookie: Option<String>,
    /// Overrides the engine's request culture for this command.
    pub culture: Option<String>,
    pub sink: Option<Arc<dyn ReplySink>>,
}

impl OutgoingRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            cookie: None,
            culture: None,
            sink: None,
        }
    }

    /// Use a fixed cookie instead of a generated one. Empty means "generate".
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        self.cookie = (!cookie.is_empty()).then_some(cookie);
        self
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = Some(culture.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReplySink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("payload", &self.payload)
            .field("cookie", &self.cookie)
            .field("culture", &self.culture)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

// ── ChannelSink ──────────────────────────────────────────────────

/// Notifications forwarded by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    TrafficOut(String),
    Reply(Reply),
}

/// A sink that forwards everything over an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ReplySink for ChannelSink {
    fn process_response(&self, reply: Reply) {
        let _ = self.tx.send(SinkEvent::Reply(reply));
    }

    fn traffic_out(&self, data: &str) {
        let _ = self.tx.send(SinkEvent::TrafficOut(data.to_string()));
    }
}

//! The communication engine: one connection, one queue, one worker.
//!
//! [`Engine`] owns the shared state the three execution contexts work on:
//! the dispatch worker, the socket reader, and the heartbeat timer. The
//! write half of the socket sits behind an async mutex so that a
//! disconnect cannot interleave with an in-flight write; the queue and
//! the command slot are guarded by short `parking_lot` critical sections.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::config::EngineConfig;
use crate::dispatch;
use crate::encoding::TextEncoding;
use crate::error::RccError;
use crate::event::{Direction, EngineEvent, EventBus, TrafficRecord};
use crate::heartbeat::HeartbeatKeeper;
use crate::markup;
use crate::relay::{AlternateTransport, TransportMode};
use crate::request::{OutgoingRequest, Reply};
use crate::router::ResponseRouter;
use crate::state::{CommandSlot, ConnectionPhase};
use crate::transport::{self, ReadOutcome};

// ── ConnectionInfo ───────────────────────────────────────────────

/// Address of the instrument an engine is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// Write side of the live connection.
pub(crate) struct Link {
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) generation: u64,
}

/// Background tasks bound to the live connection.
struct Session {
    reader: JoinHandle<()>,
    heartbeat: HeartbeatKeeper,
    peer: ConnectionInfo,
}

impl Session {
    fn stop(&self) {
        self.heartbeat.stop();
        self.reader.abort();
    }
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) bus: Arc<dyn EventBus>,
    router: ResponseRouter,
    pub(crate) culture: RwLock<String>,
    pub(crate) encoding: RwLock<TextEncoding>,
    mode: RwLock<TransportMode>,
    alternate: RwLock<Option<Arc<dyn AlternateTransport>>>,
    phase: Mutex<ConnectionPhase>,
    pub(crate) link: tokio::sync::Mutex<Option<Link>>,
    session: Mutex<Option<Session>>,
    pub(crate) queue: Mutex<VecDeque<OutgoingRequest>>,
    pub(crate) slot: Mutex<CommandSlot>,
    /// Wakes the dispatch worker: a request was queued or the slot freed.
    pub(crate) wake: Notify,
    /// Restarts the heartbeat countdown after every wire write.
    pub(crate) traffic_reset: Arc<Notify>,
    generation: AtomicU64,
    runtime: Handle,
}

impl Inner {
    fn enqueue(&self, request: OutgoingRequest) {
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(request);
            queue.len()
        };
        debug!(depth, "request queued");
        self.wake.notify_one();
    }

    /// A heartbeat is only worth queueing when nothing else is waiting to
    /// go out. Pending or queued commands will write to the wire, and that
    /// write restarts the countdown.
    fn heartbeat_due(&self) -> bool {
        if self.slot.lock().is_pending() || !self.queue.lock().is_empty() {
            trace!("heartbeat skipped; traffic outstanding");
            return false;
        }
        true
    }

    pub(crate) fn record(&self, direction: Direction, chunk: &[u8]) {
        if self.config.record_traffic {
            self.bus.publish(EngineEvent::TrafficRecorded(TrafficRecord::new(
                direction,
                Bytes::copy_from_slice(chunk),
            )));
        }
    }

    fn abandon_connect(&self) {
        if let Err(e) = self.phase.lock().finish_disconnect() {
            // A concurrent disconnect already reset the phase.
            debug!(error = %e, "connect attempt already abandoned");
        }
    }

    fn deliver(&self, frame: BytesMut) {
        let text = self.encoding.read().decode(&frame);
        let routed = self.router.route(text, &self.slot, self.bus.as_ref());
        if routed.freed_slot() {
            self.wake.notify_one();
        }
    }

    /// Drop the connection and everything queued on it.
    ///
    /// With `only` set, nothing happens unless the live connection is that
    /// generation; a stale reader or writer cannot kill its successor.
    pub(crate) async fn teardown(&self, requested: bool, only: Option<u64>) -> bool {
        let (link, session) = {
            let mut guard = self.link.lock().await;
            match (only, guard.as_ref()) {
                (Some(wanted), Some(live)) if live.generation != wanted => return false,
                (Some(_), None) => return false,
                _ => {}
            }
            (guard.take(), self.session.lock().take())
        };
        self.phase.lock().force_disconnect();

        if let Some(session) = &session {
            session.stop();
        }
        let Some(mut link) = link else {
            return false;
        };
        if let Err(e) = link.writer.shutdown().await {
            debug!(error = %e, "socket shutdown failed");
        }

        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        let pending = self.slot.lock().take();
        info!(
            peer = %session.as_ref().map(|s| s.peer.to_string()).unwrap_or_default(),
            requested,
            dropped,
            pending = ?pending.as_ref().map(|c| c.cookie.as_str()),
            "disconnected"
        );
        self.bus.publish(EngineEvent::ClientDisconnected { requested });
        self.wake.notify_one();
        true
    }
}

async fn read_task(inner: Arc<Inner>, reader: OwnedReadHalf, generation: u64) {
    let codec = FrameCodec::with_max_frame_len(inner.config.max_frame_len);
    let outcome = transport::read_loop(
        reader,
        inner.config.read_buffer_size,
        codec,
        |chunk| inner.record(Direction::Inbound, chunk),
        |frame| inner.deliver(frame),
    )
    .await;

    match outcome {
        ReadOutcome::PeerClosed => {
            info!(generation, "peer closed the stream; reading stopped");
        }
        ReadOutcome::Failed(e) => {
            warn!(generation, error = %e, "read failed; disconnecting");
            // Teardown aborts this task, so it has to run elsewhere.
            tokio::spawn(async move {
                inner.teardown(false, Some(generation)).await;
            });
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// Client side of the instrument remote-control protocol.
pub struct Engine {
    inner: Arc<Inner>,
    worker: JoinHandle<()>,
}

impl Engine {
    /// Build an engine on the current tokio runtime and start its
    /// dispatch worker.
    pub fn new(config: EngineConfig, bus: Arc<dyn EventBus>) -> Result<Self, RccError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RccError::NoRuntime)?;

        let inner = Arc::new(Inner {
            router: ResponseRouter::new(config.broadcast_tag.clone()),
            culture: RwLock::new(config.culture.clone()),
            encoding: RwLock::new(config.encoding),
            mode: RwLock::new(TransportMode::Stream),
            alternate: RwLock::new(None),
            phase: Mutex::new(ConnectionPhase::Disconnected),
            link: tokio::sync::Mutex::new(None),
            session: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            slot: Mutex::new(CommandSlot::new()),
            wake: Notify::new(),
            traffic_reset: Arc::new(Notify::new()),
            generation: AtomicU64::new(0),
            config,
            bus,
            runtime: runtime.clone(),
        });
        let worker = runtime.spawn(dispatch::run(inner.clone()));
        Ok(Self { inner, worker })
    }

    /// Install the exchange used when the transport mode is
    /// [`TransportMode::Relay`].
    pub fn with_alternate_transport(self, transport: Arc<dyn AlternateTransport>) -> Self {
        *self.inner.alternate.write() = Some(transport);
        self
    }

    /// Open a connection, replacing any existing one.
    ///
    /// Returns `false` if the instrument could not be reached; the engine
    /// is then disconnected.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        let inner = &self.inner;
        inner.teardown(true, None).await;

        if let Err(e) = inner.phase.lock().begin_connect() {
            warn!(error = %e, "connect refused");
            return false;
        }
        let peer = ConnectionInfo::new(host, port);
        info!(%peer, "connecting");

        let attempt =
            tokio::time::timeout(inner.config.connect_timeout(), TcpStream::connect((host, port)))
                .await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "connect failed");
                inner.abandon_connect();
                return false;
            }
            Err(_) => {
                let e = RccError::ConnectTimeout(inner.config.connect_timeout());
                warn!(%peer, error = %e, "connect failed");
                inner.abandon_connect();
                return false;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut guard = inner.link.lock().await;
            if inner.phase.lock().complete_connect().is_err() {
                // A disconnect arrived while the socket was opening.
                info!(%peer, "connect abandoned");
                return false;
            }
            let reader = tokio::spawn(read_task(inner.clone(), read_half, generation));
            let heartbeat = self.start_heartbeat();
            *inner.session.lock() = Some(Session {
                reader,
                heartbeat,
                peer: peer.clone(),
            });
            *guard = Some(Link {
                writer: write_half,
                generation,
            });
        }

        info!(%peer, generation, "connected");
        true
    }

    fn start_heartbeat(&self) -> HeartbeatKeeper {
        let weak = Arc::downgrade(&self.inner);
        let payload = self.inner.config.heartbeat_payload.clone();
        HeartbeatKeeper::start(
            self.inner.config.heartbeat_interval(),
            self.inner.traffic_reset.clone(),
            move || {
                let Some(inner) = weak.upgrade() else { return };
                if inner.heartbeat_due() {
                    inner.enqueue(OutgoingRequest::new(payload.clone()));
                }
            },
        )
    }

    /// Close the connection, discard all queued requests and the pending
    /// command. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        self.inner.teardown(true, None).await;
    }

    /// Submit a request. Never blocks; the reply arrives at the request's
    /// sink.
    pub fn send(&self, request: OutgoingRequest) {
        let mode = self.inner.mode.read().clone();
        match mode {
            TransportMode::Stream => self.inner.enqueue(request),
            TransportMode::Relay { uri } => self.relay(uri, request),
        }
    }

    fn relay(&self, uri: String, request: OutgoingRequest) {
        let transport = self.inner.alternate.read().clone();
        let cookie = request
            .cookie
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let culture = request
            .culture
            .unwrap_or_else(|| self.inner.culture.read().clone());
        let sink = request.sink;
        let payload = request.payload;

        self.inner.runtime.spawn(async move {
            let fail = |reason: String| {
                warn!(%cookie, %reason, "relay request failed");
                if let Some(sink) = &sink {
                    sink.process_response(Reply::Failed {
                        cookie: cookie.clone(),
                        reason,
                    });
                }
            };
            let Some(transport) = transport else {
                fail("no alternate transport installed".into());
                return;
            };

            let body = if markup::looks_like_markup(&payload) {
                markup::stamp(&payload, &cookie, &culture).unwrap_or(payload)
            } else {
                payload
            };
            if let Some(sink) = &sink {
                sink.traffic_out(&body);
            }
            match transport.make_request(&uri, &body).await {
                Ok(document) => {
                    debug!(%cookie, %uri, "relay reply received");
                    if let Some(sink) = &sink {
                        sink.process_response(Reply::Markup(document));
                    }
                }
                Err(e) => fail(e.to_string()),
            }
        });
    }

    pub fn set_request_culture(&self, culture: impl Into<String>) {
        *self.inner.culture.write() = culture.into();
    }

    pub fn request_culture(&self) -> String {
        self.inner.culture.read().clone()
    }

    /// Takes effect for the next frame written or decoded.
    pub fn set_encoding(&self, encoding: TextEncoding) {
        *self.inner.encoding.write() = encoding;
    }

    pub fn encoding(&self) -> TextEncoding {
        *self.inner.encoding.read()
    }

    pub fn set_transport_mode(&self, mode: TransportMode) {
        info!(?mode, "transport mode changed");
        *self.inner.mode.write() = mode;
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.inner.mode.read().clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.phase.lock().is_connected()
    }

    /// The instrument address, while connected.
    pub fn peer(&self) -> Option<ConnectionInfo> {
        self.inner.session.lock().as_ref().map(|s| s.peer.clone())
    }

    /// Cookie of the outstanding command, if any.
    pub fn pending_cookie(&self) -> Option<String> {
        self.inner.slot.lock().cookie().map(str::to_owned)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.worker.abort();
        if let Some(session) = self.inner.session.lock().take() {
            session.stop();
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("phase", &self.phase())
            .field("peer", &self.peer())
            .field("pending", &self.pending_cookie())
            .field("queued", &self.queued_len())
            .finish()
    }
}

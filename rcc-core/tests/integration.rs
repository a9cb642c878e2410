//! Integration tests: the engine against a scripted instrument on a real
//! localhost socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rcc_core::{
    AlternateTransport, ChannelSink, Direction, Engine, EngineConfig, EngineEvent, EventBus,
    FrameCodec, LocalEventBus, OutgoingRequest, RccError, Reply, SinkEvent, TextEncoding,
    TransportMode, markup,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

type Instrument = Framed<TcpStream, FrameCodec>;

// ── Helpers ──────────────────────────────────────────────────────

fn quiet_config() -> EngineConfig {
    EngineConfig {
        heartbeat_interval_ms: 60_000,
        command_timeout_ms: 10_000,
        record_traffic: false,
        ..Default::default()
    }
}

struct Harness {
    engine: Engine,
    events: broadcast::Receiver<EngineEvent>,
    instrument: Instrument,
}

/// Start an engine and connect it to a fresh listener on an OS-assigned
/// port.
async fn connected(config: EngineConfig) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let bus = Arc::new(LocalEventBus::new());
    let events = bus.subscribe();
    let engine = Engine::new(config, bus).unwrap();

    let (ok, accepted) = tokio::join!(engine.connect("127.0.0.1", port), listener.accept());
    assert!(ok, "connect failed");
    let (stream, _) = accepted.unwrap();

    Harness {
        engine,
        events,
        instrument: Framed::new(stream, FrameCodec::new()),
    }
}

async fn recv(instrument: &mut Instrument) -> String {
    let frame = timeout(WAIT, instrument.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("bad frame");
    TextEncoding::Utf16Le.decode(&frame)
}

async fn reply(instrument: &mut Instrument, text: &str) {
    instrument
        .send(Bytes::from(TextEncoding::Utf16Le.encode(text)))
        .await
        .unwrap();
}

fn cookie_of(text: &str) -> String {
    markup::inspect(text).unwrap().cookie.expect("no cookie")
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Reply {
    loop {
        match timeout(WAIT, rx.recv()).await.expect("timeout").expect("sink closed") {
            SinkEvent::Reply(r) => return r,
            SinkEvent::TrafficOut(_) => {}
        }
    }
}

async fn next_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    timeout(WAIT, events.recv()).await.expect("timeout").expect("bus closed")
}

// ── Command round-trips ──────────────────────────────────────────

#[tokio::test]
async fn test_command_is_stamped_and_reply_delivered() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine.send(OutgoingRequest::new("<Foo/>").with_sink(sink));

    let wire = recv(&mut h.instrument).await;
    let cookie = cookie_of(&wire);
    assert!(uuid::Uuid::parse_str(&cookie).is_ok(), "cookie {cookie} is not a guid");
    assert_eq!(wire, format!(r#"<Foo Cookie="{cookie}" Culture="en-US"/>"#));

    let answer = format!(r#"<Foo Cookie="{cookie}"/>"#);
    reply(&mut h.instrument, &answer).await;

    assert_eq!(next_reply(&mut rx).await, Reply::Markup(answer));
    assert!(h.engine.pending_cookie().is_none());
}

#[tokio::test]
async fn test_traffic_out_reports_the_wire_text() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine
        .send(OutgoingRequest::new("<Foo/>").with_cookie("C1").with_culture("fr-FR").with_sink(sink));
    let wire = recv(&mut h.instrument).await;
    assert_eq!(wire, r#"<Foo Cookie="C1" Culture="fr-FR"/>"#);

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, SinkEvent::TrafficOut(wire));
}

#[tokio::test]
async fn test_request_culture_applies_to_later_commands() {
    let mut h = connected(quiet_config()).await;
    h.engine.set_request_culture("de-DE");
    h.engine.send(OutgoingRequest::new("<Foo/>").with_cookie("C1"));
    assert_eq!(
        recv(&mut h.instrument).await,
        r#"<Foo Cookie="C1" Culture="de-DE"/>"#
    );
}

#[tokio::test]
async fn test_opaque_payload_sent_verbatim_and_raw_reply_mirrored() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine.send(OutgoingRequest::new("{\"cmd\":\"status\"}").with_sink(sink));
    assert_eq!(recv(&mut h.instrument).await, "{\"cmd\":\"status\"}");

    reply(&mut h.instrument, "[ready]").await;
    assert_eq!(next_reply(&mut rx).await, Reply::Raw("[ready]".into()));
    assert_eq!(
        next_event(&mut h.events).await,
        EngineEvent::RawMessageArrived("[ready]".into())
    );
}

#[tokio::test]
async fn test_broadcast_goes_to_bus() {
    let mut h = connected(quiet_config()).await;

    let push = "<CornerstoneMessage>run complete</CornerstoneMessage>";
    reply(&mut h.instrument, push).await;

    assert_eq!(
        next_event(&mut h.events).await,
        EngineEvent::MessageArrived(push.into())
    );
}

#[tokio::test]
async fn test_broadcast_does_not_complete_pending_command() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine.send(OutgoingRequest::new("<Foo/>").with_cookie("C1").with_sink(sink));
    recv(&mut h.instrument).await;

    let push = "<CornerstoneMessage>progress</CornerstoneMessage>";
    reply(&mut h.instrument, push).await;
    assert_eq!(next_event(&mut h.events).await, EngineEvent::MessageArrived(push.into()));
    assert_eq!(h.engine.pending_cookie().as_deref(), Some("C1"));

    reply(&mut h.instrument, r#"<Foo Cookie="C1"/>"#).await;
    assert_eq!(
        next_reply(&mut rx).await,
        Reply::Markup(r#"<Foo Cookie="C1"/>"#.into())
    );
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_command_outstanding_at_a_time() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    for cookie in ["A", "B", "C"] {
        h.engine
            .send(OutgoingRequest::new("<Cmd/>").with_cookie(cookie).with_sink(sink.clone()));
    }

    for cookie in ["A", "B", "C"] {
        let wire = recv(&mut h.instrument).await;
        assert_eq!(cookie_of(&wire), cookie);

        // Nothing else may be written before this command is answered.
        let early = timeout(Duration::from_millis(150), h.instrument.next()).await;
        assert!(early.is_err(), "second command sent while {cookie} outstanding");

        reply(&mut h.instrument, &format!(r#"<Cmd Cookie="{cookie}"/>"#)).await;
        assert_eq!(
            next_reply(&mut rx).await,
            Reply::Markup(format!(r#"<Cmd Cookie="{cookie}"/>"#))
        );
    }
}

#[tokio::test]
async fn test_fragmented_reply_is_reassembled() {
    let mut h = connected(quiet_config()).await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine.send(OutgoingRequest::new("<Foo/>").with_cookie("F").with_sink(sink));
    recv(&mut h.instrument).await;

    let body = TextEncoding::Utf16Le.encode(r#"<Foo Cookie="F"><Item/></Foo>"#);
    let mut wire = (body.len() as i32).to_le_bytes().to_vec();
    wire.extend_from_slice(&body);

    let stream = h.instrument.get_mut();
    for piece in [&wire[..2], &wire[2..7], &wire[7..20], &wire[20..]] {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        next_reply(&mut rx).await,
        Reply::Markup(r#"<Foo Cookie="F"><Item/></Foo>"#.into())
    );
}

// ── Disconnect ───────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_clears_queue_and_pending() {
    let mut h = connected(quiet_config()).await;

    for cookie in ["A", "B", "C"] {
        h.engine.send(OutgoingRequest::new("<Cmd/>").with_cookie(cookie));
    }
    assert_eq!(cookie_of(&recv(&mut h.instrument).await), "A");
    assert_eq!(h.engine.pending_cookie().as_deref(), Some("A"));
    assert_eq!(h.engine.queued_len(), 2);

    h.engine.disconnect().await;
    assert!(h.engine.pending_cookie().is_none());
    assert_eq!(h.engine.queued_len(), 0);
    assert!(h.engine.phase().is_disconnected());
    assert!(h.engine.peer().is_none());
    assert_eq!(
        h.events.try_recv().unwrap(),
        EngineEvent::ClientDisconnected { requested: true }
    );

    h.engine.disconnect().await;
    assert!(matches!(
        h.events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    // The instrument sees the socket close.
    let end = timeout(WAIT, h.instrument.next()).await.expect("timeout");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_connect_to_closed_port_returns_false() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let bus = Arc::new(LocalEventBus::new());
    let mut events = bus.subscribe();
    let engine = Engine::new(quiet_config(), bus).unwrap();

    assert!(!engine.connect("127.0.0.1", port).await);
    assert!(engine.phase().is_disconnected());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_replaces_connection() {
    let mut h = connected(quiet_config()).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (ok, accepted) = tokio::join!(h.engine.connect("127.0.0.1", port), listener.accept());
    assert!(ok);
    let mut second: Instrument = Framed::new(accepted.unwrap().0, FrameCodec::new());

    assert_eq!(
        next_event(&mut h.events).await,
        EngineEvent::ClientDisconnected { requested: true }
    );
    assert_eq!(h.engine.peer().unwrap().port(), port);
    assert!(timeout(WAIT, h.instrument.next()).await.unwrap().is_none());

    h.engine.send(OutgoingRequest::new("<Foo/>").with_cookie("N"));
    assert_eq!(cookie_of(&recv(&mut second).await), "N");
}

#[tokio::test]
async fn test_bad_frame_from_instrument_disconnects() {
    let mut h = connected(quiet_config()).await;

    let stream = h.instrument.get_mut();
    stream.write_all(&(-1i32).to_le_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(
        next_event(&mut h.events).await,
        EngineEvent::ClientDisconnected { requested: false }
    );
    assert!(h.engine.phase().is_disconnected());
}

#[tokio::test]
async fn test_send_while_disconnected_fails_request() {
    let bus = Arc::new(LocalEventBus::new());
    let engine = Engine::new(quiet_config(), bus).unwrap();
    let (sink, mut rx) = ChannelSink::new();

    engine.send(OutgoingRequest::new("<Foo/>").with_cookie("X").with_sink(sink));
    match next_reply(&mut rx).await {
        Reply::Failed { cookie, reason } => {
            assert_eq!(cookie, "X");
            assert!(reason.contains("not connected"), "reason: {reason}");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert!(engine.pending_cookie().is_none());
}

// ── Timers ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_heartbeat_sent_when_idle() {
    let mut h = connected(EngineConfig {
        heartbeat_interval_ms: 100,
        ..quiet_config()
    })
    .await;

    let wire = recv(&mut h.instrument).await;
    let info = markup::inspect(&wire).unwrap();
    assert_eq!(info.root, "Heartbeat");
    assert!(info.cookie.is_some());
}

#[tokio::test]
async fn test_command_timeout_fails_and_unblocks_queue() {
    let mut h = connected(EngineConfig {
        command_timeout_ms: 100,
        ..quiet_config()
    })
    .await;
    let (sink, mut rx) = ChannelSink::new();

    h.engine.send(OutgoingRequest::new("<Slow/>").with_cookie("S").with_sink(sink.clone()));
    h.engine.send(OutgoingRequest::new("<Next/>").with_cookie("N").with_sink(sink));
    assert_eq!(cookie_of(&recv(&mut h.instrument).await), "S");

    match next_reply(&mut rx).await {
        Reply::Failed { cookie, .. } => assert_eq!(cookie, "S"),
        other => panic!("unexpected reply: {other:?}"),
    }
    assert!(matches!(
        next_event(&mut h.events).await,
        EngineEvent::CommandFailed { ref cookie, .. } if cookie == "S"
    ));
    assert_eq!(cookie_of(&recv(&mut h.instrument).await), "N");
}

#[tokio::test]
async fn test_heartbeats_do_not_pile_up_behind_unanswered_command() {
    let mut h = connected(EngineConfig {
        heartbeat_interval_ms: 50,
        command_timeout_ms: 0,
        ..quiet_config()
    })
    .await;

    h.engine.send(OutgoingRequest::new("<Slow/>").with_cookie("S"));
    loop {
        let wire = recv(&mut h.instrument).await;
        let cookie = cookie_of(&wire);
        if cookie == "S" {
            break;
        }
        // A heartbeat beat the command to the wire.
        reply(&mut h.instrument, &format!(r#"<Heartbeat Cookie="{cookie}"/>"#)).await;
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.engine.pending_cookie().as_deref(), Some("S"));
    assert_eq!(h.engine.queued_len(), 0);

    reply(&mut h.instrument, r#"<Slow Cookie="S"/>"#).await;
    let wire = recv(&mut h.instrument).await;
    assert_eq!(markup::inspect(&wire).unwrap().root, "Heartbeat");
}

#[tokio::test]
async fn test_command_postpones_heartbeat() {
    let mut h = connected(EngineConfig {
        heartbeat_interval_ms: 400,
        ..quiet_config()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    h.engine.send(OutgoingRequest::new("PING"));
    assert_eq!(recv(&mut h.instrument).await, "PING");
    let sent = Instant::now();
    reply(&mut h.instrument, "PONG").await;

    // The countdown restarted at the write, so the original 400 ms mark
    // passes quietly.
    assert!(
        timeout(Duration::from_millis(250), h.instrument.next())
            .await
            .is_err(),
        "heartbeat was not postponed"
    );

    let wire = recv(&mut h.instrument).await;
    assert_eq!(markup::inspect(&wire).unwrap().root, "Heartbeat");
    assert!(sent.elapsed() >= Duration::from_millis(300));
}

// ── Write failures ───────────────────────────────────────────────

#[tokio::test]
async fn test_write_failure_fails_command_and_disconnects() {
    let Harness {
        engine,
        mut events,
        instrument,
    } = connected(EngineConfig {
        command_timeout_ms: 100,
        ..quiet_config()
    })
    .await;

    // The instrument goes away; the first write draws a reset and the
    // writes after it fail.
    drop(instrument);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for cookie in ["A", "B", "C"] {
        engine.send(OutgoingRequest::new("<Foo/>").with_cookie(cookie));
    }

    let mut send_failed = false;
    loop {
        match next_event(&mut events).await {
            EngineEvent::CommandFailed { reason, .. } => {
                send_failed |= reason.starts_with("send failed");
            }
            EngineEvent::ClientDisconnected { requested } => {
                assert!(!requested);
                break;
            }
            _ => {}
        }
    }
    assert!(send_failed, "no command failed on write");
    assert!(engine.phase().is_disconnected());
    assert!(engine.pending_cookie().is_none());
    assert_eq!(engine.queued_len(), 0);
}

// ── Traffic recording ────────────────────────────────────────────

#[tokio::test]
async fn test_traffic_is_recorded_both_ways() {
    let mut h = connected(EngineConfig {
        record_traffic: true,
        ..quiet_config()
    })
    .await;

    h.engine.send(OutgoingRequest::new("PING"));
    recv(&mut h.instrument).await;

    let payload = TextEncoding::Utf16Le.encode("PING");
    match next_event(&mut h.events).await {
        EngineEvent::TrafficRecorded(rec) => {
            assert_eq!(rec.direction, Direction::Outbound);
            assert_eq!(&rec.bytes[..], (payload.len() as i32).to_le_bytes());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut h.events).await {
        EngineEvent::TrafficRecorded(rec) => {
            assert_eq!(rec.direction, Direction::Outbound);
            assert_eq!(&rec.bytes[..], payload.as_slice());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    reply(&mut h.instrument, "PONG").await;
    loop {
        if let EngineEvent::TrafficRecorded(rec) = next_event(&mut h.events).await {
            assert_eq!(rec.direction, Direction::Inbound);
            break;
        }
    }
}

// ── Relay ────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRelay {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AlternateTransport for FakeRelay {
    async fn make_request(&self, uri: &str, post_body: &str) -> Result<String, RccError> {
        self.calls.lock().push((uri.to_string(), post_body.to_string()));
        if post_body.contains("Broken") {
            return Err(RccError::Relay("503 service unavailable".into()));
        }
        Ok("<Samples/>".to_string())
    }
}

#[tokio::test]
async fn test_relay_mode_bypasses_queue() {
    let relay = Arc::new(FakeRelay::default());
    let engine = Engine::new(quiet_config(), Arc::new(LocalEventBus::new()))
        .unwrap()
        .with_alternate_transport(relay.clone());
    engine.set_transport_mode(TransportMode::Relay {
        uri: "https://relay.example/cmd".into(),
    });
    let (sink, mut rx) = ChannelSink::new();

    engine.send(OutgoingRequest::new("<GetSamples/>").with_cookie("R1").with_sink(sink));

    let body = r#"<GetSamples Cookie="R1" Culture="en-US"/>"#;
    assert_eq!(
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        SinkEvent::TrafficOut(body.into())
    );
    assert_eq!(next_reply(&mut rx).await, Reply::Markup("<Samples/>".into()));
    assert_eq!(
        relay.calls.lock().as_slice(),
        &[("https://relay.example/cmd".to_string(), body.to_string())]
    );
    assert_eq!(engine.queued_len(), 0);
    assert!(engine.pending_cookie().is_none());
}

#[tokio::test]
async fn test_relay_failure_is_reported_to_sink() {
    let engine = Engine::new(quiet_config(), Arc::new(LocalEventBus::new()))
        .unwrap()
        .with_alternate_transport(Arc::new(FakeRelay::default()));
    engine.set_transport_mode(TransportMode::Relay {
        uri: "https://relay.example/cmd".into(),
    });
    let (sink, mut rx) = ChannelSink::new();

    engine.send(OutgoingRequest::new("<Broken/>").with_cookie("R2").with_sink(sink));
    match next_reply(&mut rx).await {
        Reply::Failed { cookie, reason } => {
            assert_eq!(cookie, "R2");
            assert!(reason.contains("503"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_mode_without_transport_fails() {
    let engine = Engine::new(quiet_config(), Arc::new(LocalEventBus::new())).unwrap();
    engine.set_transport_mode(TransportMode::Relay {
        uri: "https://relay.example/cmd".into(),
    });
    let (sink, mut rx) = ChannelSink::new();

    engine.send(OutgoingRequest::new("<Foo/>").with_sink(sink));
    assert!(matches!(next_reply(&mut rx).await, Reply::Failed { .. }));
}

//! The dispatch worker.
//!
//! One task per engine pops requests off the FIFO queue and writes them
//! to the wire, one at a time. A request is only popped while the command
//! slot is empty; the router frees the slot when the reply arrives and
//! wakes the worker through [`Notify`](tokio::sync::Notify).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::Inner;
use crate::error::RccError;
use crate::event::Direction;
use crate::markup;
use crate::request::{OutgoingRequest, Reply};
use crate::router;
use crate::state::{CommandSlot, PendingCommand};
use crate::transport;

enum Step {
    /// The outstanding command ran out of time.
    Expired(PendingCommand),
    /// Nothing to do until woken, or until the deadline passes.
    Wait(Option<Instant>),
    Send(OutgoingRequest),
}

pub(crate) async fn run(inner: Arc<Inner>) {
    debug!("dispatch worker started");
    loop {
        step(&inner).await;
    }
}

async fn step(inner: &Inner) {
    let next = {
        let mut slot = inner.slot.lock();
        if let Some(cmd) = slot.take_expired() {
            Step::Expired(cmd)
        } else if let Some(cmd) = slot.get() {
            Step::Wait(cmd.expires_at())
        } else {
            match inner.queue.lock().pop_front() {
                Some(request) => Step::Send(request),
                None => Step::Wait(None),
            }
        }
    };

    match next {
        Step::Expired(cmd) => {
            warn!(cookie = %cmd.cookie, elapsed = ?cmd.elapsed(), "command timed out");
            router::fail(cmd, "timed out waiting for reply".into(), inner.bus.as_ref());
        }
        Step::Wait(Some(deadline)) => {
            let _ = tokio::time::timeout_at(deadline, inner.wake.notified()).await;
        }
        Step::Wait(None) => inner.wake.notified().await,
        Step::Send(request) => send_one(inner, request).await,
    }
}

async fn send_one(inner: &Inner, request: OutgoingRequest) {
    let OutgoingRequest {
        payload,
        cookie,
        culture,
        sink,
    } = request;

    let cookie = cookie.unwrap_or_else(|| Uuid::new_v4().to_string());
    let culture = culture.unwrap_or_else(|| inner.culture.read().clone());
    let text = prepare(payload, &cookie, &culture);
    let bytes = inner.encoding.read().encode(&text);

    let cmd = PendingCommand::new(cookie.clone(), sink.clone(), inner.config.command_timeout());
    if !claim(&inner.slot, cmd) {
        return;
    }

    let mut guard = inner.link.lock().await;
    let Some(link) = guard.as_mut() else {
        drop(guard);
        abandon(inner, &cookie, &RccError::NotConnected);
        return;
    };
    let generation = link.generation;
    let written = transport::write_frame(&mut link.writer, &bytes, |chunk| {
        inner.record(Direction::Outbound, chunk)
    })
    .await;
    drop(guard);

    match written {
        Ok(()) => {
            inner.traffic_reset.notify_one();
            debug!(%cookie, bytes = bytes.len(), "command sent");
            if let Some(sink) = &sink {
                sink.traffic_out(&text);
            }
        }
        Err(e) => {
            warn!(%cookie, error = %e, "send failed; disconnecting");
            abandon(inner, &cookie, &e);
            inner.teardown(false, Some(generation)).await;
        }
    }
}

/// Put `cmd` in the slot. On failure the command's sink is told, after
/// the slot lock is released.
fn claim(slot: &Mutex<CommandSlot>, cmd: PendingCommand) -> bool {
    let cookie = cmd.cookie.clone();
    let sink = cmd.sink.clone();
    let occupied = slot.lock().occupy(cmd);
    match occupied {
        Ok(()) => true,
        Err(e) => {
            error!(%cookie, error = %e, "command slot unexpectedly occupied; dropping request");
            if let Some(sink) = sink {
                sink.process_response(Reply::Failed {
                    cookie,
                    reason: e.to_string(),
                });
            }
            false
        }
    }
}

/// Stamp markup commands with their cookie and culture; pass anything
/// else through untouched.
fn prepare(payload: String, cookie: &str, culture: &str) -> String {
    if !markup::looks_like_markup(&payload) {
        return payload;
    }
    match markup::stamp(&payload, cookie, culture) {
        Ok(stamped) => stamped,
        Err(e) => {
            warn!(%cookie, error = %e, "could not stamp command; sending as-is");
            payload
        }
    }
}

fn abandon(inner: &Inner, cookie: &str, reason: &RccError) {
    let cmd = inner.slot.lock().take_if(cookie);
    if let Some(cmd) = cmd {
        router::fail(cmd, format!("send failed: {reason}"), inner.bus.as_ref());
    }
}

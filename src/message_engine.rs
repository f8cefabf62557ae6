//! MESSAGE state machine: the four-phase UDP exchange (§4.3, §5).
//!
//! Sending and receiving a message are both Header → `OK` → Body → `OK`.
//! A per-peer conversation lock keeps two concurrent sends to the same
//! peer from interleaving their header/body/ack phases on a socket that
//! has no framing beyond datagram boundaries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{pack_header, pack_response, Header, OpCode, PeerId, Response, Status};
use crate::config::PeerConfig;
use crate::dispatcher::{encode_body, Dispatcher, InboundHeader};
use crate::error::{LcpError, Result};
use crate::events::{emit_log, EventSender, PeerEvent};
use crate::peer_table::PeerTable;

/// Soft cap on the number of per-peer conversation locks kept around
/// (§5: "evicting half at random to bound memory" once the table exceeds
/// this).
const CONVERSATION_LOCK_SOFT_CAP: usize = 100;

/// Serializes the header/ack/body/ack phases of every exchange with a
/// given peer address so concurrent sends can't interleave on the shared
/// socket.
#[derive(Default)]
struct ConversationLocks {
    locks: SyncMutex<HashMap<SocketAddr, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    fn get(&self, addr: SocketAddr) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock();
        let lock = guard
            .entry(addr)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        if guard.len() > CONVERSATION_LOCK_SOFT_CAP {
            evict_half_at_random(&mut guard);
        }

        lock
    }
}

/// Evict roughly half of the currently-idle locks (ones with no other
/// `Arc` holder, i.e. no exchange in flight) once the soft cap is
/// exceeded. Never evicts a lock an in-progress exchange still holds.
fn evict_half_at_random(map: &mut HashMap<SocketAddr, Arc<AsyncMutex<()>>>) {
    let idle: Vec<SocketAddr> = map
        .iter()
        .filter(|(_, lock)| Arc::strong_count(lock) == 1)
        .map(|(addr, _)| *addr)
        .collect();
    let target = map.len() / 2;
    let mut removed = 0;
    let mut seed = pseudo_random_seed();

    for addr in idle {
        if removed >= target {
            break;
        }
        // Cheap LCG coin flip — "at random" per §5, without pulling in a
        // `rand` dependency the teacher's stack doesn't carry.
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        if seed & 1 == 0 {
            map.remove(&addr);
            removed += 1;
        }
    }
}

fn pseudo_random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

/// Outbound half of the message engine: sends text to a resolved peer
/// address and drives the four-phase exchange, retrying the header phase
/// up to `config.message_retries` times.
pub struct MessageSender {
    dispatcher: Dispatcher,
    self_id: PeerId,
    locks: Arc<ConversationLocks>,
    header_timeout: Duration,
    body_timeout: Duration,
    retries: u32,
}

impl MessageSender {
    pub fn new(dispatcher: Dispatcher, config: &PeerConfig) -> Self {
        Self {
            dispatcher,
            self_id: PeerId::from_str(&config.local_peer_id),
            locks: Arc::new(ConversationLocks::default()),
            header_timeout: Duration::from_secs(config.header_timeout_secs),
            body_timeout: Duration::from_secs(config.body_timeout_secs),
            retries: config.message_retries,
        }
    }

    /// Send `text` to `peer_id` at `target`, running the full exchange to
    /// completion. Held for the duration by the peer's conversation lock.
    pub async fn send(&self, peer_id: &PeerId, target: SocketAddr, text: &str) -> Result<()> {
        let lock = self.locks.get(target);
        let _guard = lock.lock().await;

        let body = text.as_bytes();
        let body_id: u8 = rand_body_id();
        let header = Header {
            from: self.self_id.clone(),
            to: peer_id.clone(),
            op: OpCode::Message,
            body_id,
            body_length: body.len() as u64,
        };
        let packed_header = pack_header(&header);

        let mut last_err = None;
        let mut header_acked = false;
        for attempt in 0..=self.retries {
            let response_rx = self.dispatcher.register_response_waiter(target);
            self.dispatcher.send_to(&packed_header, target).await?;

            match tokio::time::timeout(self.header_timeout, response_rx).await {
                Ok(Ok(response)) if response.status == Status::Ok => {
                    header_acked = true;
                    break;
                }
                Ok(Ok(response)) => {
                    last_err = Some(LcpError::protocol(format!(
                        "peer rejected message header: {:?}",
                        response.status
                    )));
                    break;
                }
                Ok(Err(_)) => {
                    last_err = Some(LcpError::ChannelClosed);
                }
                Err(_) => {
                    last_err = Some(LcpError::timeout(format!(
                        "message header ack from {target} (attempt {attempt})"
                    )));
                }
            }
        }

        if !header_acked {
            return Err(last_err.unwrap_or_else(|| LcpError::timeout("message header ack")));
        }

        let body_response_rx = self.dispatcher.register_response_waiter(target);
        let wire_body = encode_body(body_id, body);
        self.dispatcher.send_to(&wire_body, target).await?;

        match tokio::time::timeout(self.body_timeout, body_response_rx).await {
            Ok(Ok(response)) if response.status == Status::Ok => Ok(()),
            Ok(Ok(response)) => Err(LcpError::protocol(format!(
                "peer rejected message body: {:?}",
                response.status
            ))),
            Ok(Err(_)) => Err(LcpError::ChannelClosed),
            Err(_) => Err(LcpError::timeout(format!("message body ack from {target}"))),
        }
    }

    /// Best-effort broadcast: fire the full exchange at every currently
    /// online peer without letting one slow/unreachable peer block the
    /// others. Failures are logged, not propagated.
    pub async fn broadcast(&self, peers: &[(PeerId, SocketAddr)], text: &str) {
        let mut tasks = Vec::with_capacity(peers.len());
        for (peer_id, target) in peers {
            let peer_id = peer_id.clone();
            let target = *target;
            let text = text.to_string();
            let sender = self.clone_for_task();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = sender.send(&peer_id, target, &text).await {
                    warn!("broadcast message to {target} failed: {e}");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    fn clone_for_task(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            self_id: self.self_id.clone(),
            locks: self.locks.clone(),
            header_timeout: self.header_timeout,
            body_timeout: self.body_timeout,
            retries: self.retries,
        }
    }
}

/// Inbound half: consumes MESSAGE headers routed by the dispatcher,
/// receives the body, and emits [`PeerEvent::Message`] on success.
///
/// Each sender address gets its own exclusive lock (§4.5 receiver state
/// machine) so that a second message from the same peer can't interleave
/// its header/body/ack phases with one already in flight — two different
/// senders are still handled concurrently.
pub async fn run_receiver(
    mut rx: mpsc::Receiver<InboundHeader>,
    dispatcher: Dispatcher,
    self_id: PeerId,
    body_timeout: Duration,
    events: EventSender,
    peer_table: Arc<PeerTable>,
    cancel: CancellationToken,
) {
    let locks = Arc::new(ConversationLocks::default());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => {
                let Some(inbound) = inbound else { break };
                let dispatcher = dispatcher.clone();
                let self_id = self_id.clone();
                let events = events.clone();
                let locks = locks.clone();
                let peer_table = peer_table.clone();
                tokio::spawn(handle_inbound_message(inbound, dispatcher, self_id, body_timeout, events, peer_table, locks));
            }
        }
    }
}

async fn handle_inbound_message(
    inbound: InboundHeader,
    dispatcher: Dispatcher,
    self_id: PeerId,
    body_timeout: Duration,
    events: EventSender,
    peer_table: Arc<PeerTable>,
    locks: Arc<ConversationLocks>,
) {
    let InboundHeader { header, source } = inbound;
    // Any incoming Header from a non-self peer touches the PeerTable before
    // dispatch (§4.8), so a peer announces itself merely by sending MESSAGE
    // traffic, not just ECHO.
    peer_table.touch_and_notify(*header.from.raw(), source).await;

    let lock = locks.get(source);
    let _guard = lock.lock().await;
    let expected_len = 8 + header.body_length as usize;

    let body_rx = dispatcher.register_body_waiter(source, expected_len);
    let ack = Response {
        status: Status::Ok,
        responder: self_id.clone(),
    };
    if let Err(e) = dispatcher.send_to(&pack_response(&ack), source).await {
        warn!("failed to ack message header from {source}: {e}");
        return;
    }

    let body = match tokio::time::timeout(body_timeout, body_rx).await {
        Ok(Ok(body)) => body,
        _ => {
            dispatcher.cancel_body_waiter(source, expected_len);
            emit_log(
                &events,
                log::Level::Warn,
                format!("timed out waiting for message body from {source}"),
            )
            .await;
            let timeout_response = Response {
                status: Status::InternalError,
                responder: self_id,
            };
            let _ = dispatcher.send_to(&pack_response(&timeout_response), source).await;
            return;
        }
    };

    let (status, text) = match decode_message_body(&header, &body) {
        Ok(text) => (Status::Ok, Some(text)),
        Err(e) => {
            warn!("malformed message body from {source}: {e}");
            (Status::BadRequest, None)
        }
    };

    let final_ack = Response {
        status,
        responder: self_id,
    };
    let _ = dispatcher.send_to(&pack_response(&final_ack), source).await;

    if let Some(text) = text {
        let _ = events
            .send(PeerEvent::Message {
                from: header.from.normalized().to_string(),
                text,
            })
            .await;
    }
}

fn decode_message_body(header: &Header, body: &[u8]) -> Result<String> {
    if body.len() < 8 {
        return Err(LcpError::malformed("message body shorter than BodyId prefix"));
    }
    let prefix: [u8; 8] = body[..8].try_into().unwrap();
    if !crate::codec::body_id_matches(header.body_id, &prefix) {
        return Err(LcpError::protocol("body_id does not match header"));
    }
    String::from_utf8(body[8..].to_vec())
        .map_err(|e| LcpError::malformed(format!("message body is not valid UTF-8: {e}")))
}

/// Cheap pseudo-random BodyId: the low byte of the current monotonic
/// clock reading, which is all §3 needs (a per-exchange value that lets a
/// receiver match a body against its header, not a cryptographic nonce).
fn rand_body_id() -> u8 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u8)
        .unwrap_or(0)
}

//! Periodic ECHO broadcasting and reply handling (§4.2, §6.1).
//!
//! Two concerns, same shape as the teacher's beacon broadcaster/listener
//! split: a ticking broadcaster that announces our presence, and a
//! consumer of inbound ECHO headers (routed here by [`crate::dispatcher`])
//! that refreshes the peer table and answers with an `OK` response.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::codec::{pack_header, pack_response, Header, OpCode, PeerId, Response, Status};
use crate::config::PeerConfig;
use crate::dispatcher::{Dispatcher, InboundHeader};
use crate::peer_table::PeerTable;
use crate::transport::broadcast_target;

/// Periodically broadcast an ECHO header to every configured broadcast
/// address until `cancel` fires.
pub async fn run_broadcaster(
    config: Arc<PeerConfig>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) {
    let self_id = PeerId::from_str(&config.local_peer_id);
    let targets: Vec<_> = config
        .broadcast_addresses
        .iter()
        .filter_map(|addr| match broadcast_target(addr, config.listen_port) {
            Ok(target) => Some(target),
            Err(e) => {
                warn!("skipping invalid broadcast address {addr}: {e}");
                None
            }
        })
        .collect();

    if targets.is_empty() {
        warn!("discovery broadcaster has no valid broadcast targets, exiting");
        return;
    }

    let header = Header {
        from: self_id.clone(),
        to: PeerId::broadcast(),
        op: OpCode::Echo,
        body_id: 0,
        body_length: 0,
    };
    let packed = pack_header(&header);

    let mut tick = interval(Duration::from_secs(config.discovery_period_secs));
    debug!("discovery broadcaster started ({} target(s))", targets.len());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                for target in &targets {
                    if let Err(e) = dispatcher.send_to(&packed, *target).await {
                        warn!("echo broadcast to {target} failed: {e}");
                    }
                }
            }
        }
    }

    debug!("discovery broadcaster stopped");
}

/// Consume inbound ECHO headers: refresh the peer table and reply `OK`.
/// Self-originated echoes are dropped inside [`PeerTable::touch`], so this
/// loop doesn't need to special-case its own broadcasts.
pub async fn run_echo_responder(
    mut rx: mpsc::Receiver<InboundHeader>,
    peer_table: Arc<PeerTable>,
    dispatcher: Dispatcher,
    self_id: PeerId,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => {
                let Some(inbound) = inbound else { break };
                let InboundHeader { header, source } = inbound;

                peer_table.touch_and_notify(*header.from.raw(), source).await;

                let response = Response {
                    status: Status::Ok,
                    responder: self_id.clone(),
                };
                let packed = pack_response(&response);
                if let Err(e) = dispatcher.send_to(&packed, source).await {
                    warn!("echo reply to {source} failed: {e}");
                }
            }
        }
    }

    debug!("echo responder stopped");
}

/// Periodically sweep the peer table for peers past the liveness window.
pub async fn run_expiry_sweep(
    peer_table: Arc<PeerTable>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                peer_table.expire(std::time::Instant::now()).await;
            }
        }
    }
}

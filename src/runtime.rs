//! Public orchestrator: wires transport, discovery, the message and file
//! engines, and the peer table into one handle the host can start and
//! stop (§6).
//!
//! Shaped after the teacher's `spawn_runtime`/`RuntimeHandle` split: a
//! cheaply cloneable handle exposes the operations a host calls
//! (`send_message`, `send_file`, `peers`, `shutdown`), while every
//! background task talks back to the host exclusively through the bounded
//! [`crate::events::EventReceiver`] returned alongside the handle.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::codec::PeerId;
use crate::config::PeerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{LcpError, Result};
use crate::events::{self, EventReceiver};
use crate::file_engine::{self, FileSender};
use crate::message_engine::MessageSender;
use crate::peer_table::{PeerRecord, PeerTable};
use crate::transport;
use crate::worker_pool::{self, SystemResources};

/// Handle to a running peer. Cloning shares the same underlying runtime;
/// `shutdown` stops it for every clone.
#[derive(Clone)]
pub struct PeerRuntime {
    config: Arc<PeerConfig>,
    peer_table: Arc<PeerTable>,
    message_sender: Arc<MessageSender>,
    file_sender: Arc<FileSender>,
    cancel: CancellationToken,
}

impl PeerRuntime {
    /// Current snapshot of online peers.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peer_table.snapshot_online()
    }

    /// Send a chat message to a specific peer, resolved by normalized id.
    pub async fn send_message(&self, peer_normalized_id: &str, text: &str) -> Result<()> {
        let target = self
            .peer_table
            .resolve(peer_normalized_id)
            .ok_or_else(|| LcpError::UnknownPeer(peer_normalized_id.to_string()))?;
        let peer_id = PeerId::from_str(peer_normalized_id);
        self.message_sender.send(&peer_id, target, text).await
    }

    /// Best-effort broadcast of a chat message to every online peer.
    pub async fn broadcast_message(&self, text: &str) {
        let peers: Vec<(PeerId, SocketAddr)> = self
            .peer_table
            .snapshot_online()
            .into_iter()
            .map(|record| (PeerId::from_raw(record.raw), record.address))
            .collect();
        self.message_sender.broadcast(&peers, text).await;
    }

    /// Send a file to a specific peer, resolved by normalized id.
    pub async fn send_file(&self, peer_normalized_id: &str, path: &Path) -> Result<()> {
        let target = self
            .peer_table
            .resolve(peer_normalized_id)
            .ok_or_else(|| LcpError::UnknownPeer(peer_normalized_id.to_string()))?;
        let peer_id = PeerId::from_str(peer_normalized_id);
        self.file_sender.send(&peer_id, target, path).await
    }

    pub fn local_peer_id(&self) -> &str {
        self.peer_table.self_id()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Signal every background task to stop. Does not wait for them —
    /// the event channel closing (no more senders) is the host's signal
    /// that teardown is complete.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Start the peer runtime: bind sockets, probe system resources for pool
/// sizing, and spawn every background task. Returns a handle plus the
/// event receiver the host drains for chat/file/presence notifications.
pub async fn spawn(config: PeerConfig) -> Result<(PeerRuntime, EventReceiver)> {
    let config = Arc::new(config);
    let (event_tx, event_rx) = events::channel();
    let cancel = CancellationToken::new();

    let udp_socket = transport::bind_udp(config.listen_port)?;
    let tcp_listener = transport::bind_tcp(config.listen_port).await?;
    let dispatcher = Dispatcher::new(udp_socket, event_tx.clone());

    let self_id = PeerId::from_str(&config.local_peer_id);
    let peer_table = PeerTable::new(
        config.local_peer_id.clone(),
        event_tx.clone(),
        Duration::from_secs(config.peer_timeout_secs),
    );

    // Worker counts size the ingress queues; each exchange still runs as
    // its own spawned task rather than pinning a fixed set of workers.
    let pool_sizes = worker_pool::compute_pool_sizes(SystemResources::probe());

    let (discovery_tx, discovery_rx) = tokio::sync::mpsc::channel(pool_sizes.message_workers);
    let (message_tx, message_rx) = tokio::sync::mpsc::channel(pool_sizes.message_workers);
    let (file_tx, file_rx) = tokio::sync::mpsc::channel(pool_sizes.file_workers);

    let mut handles = Vec::new();

    handles.push(tokio::spawn(dispatcher.clone().run(
        discovery_tx,
        message_tx,
        file_tx,
        cancel.clone(),
    )));

    handles.push(tokio::spawn(crate::discovery::run_broadcaster(
        config.clone(),
        dispatcher.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(crate::discovery::run_echo_responder(
        discovery_rx,
        peer_table.clone(),
        dispatcher.clone(),
        self_id.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(crate::discovery::run_expiry_sweep(
        peer_table.clone(),
        Duration::from_secs(config.peer_timeout_secs.max(1) / 3 + 1),
        cancel.clone(),
    )));

    let message_sender = Arc::new(MessageSender::new(dispatcher.clone(), &config));
    handles.push(tokio::spawn(crate::message_engine::run_receiver(
        message_rx,
        dispatcher.clone(),
        self_id.clone(),
        Duration::from_secs(config.body_timeout_secs),
        event_tx.clone(),
        peer_table.clone(),
        cancel.clone(),
    )));

    let max_concurrent_file_sends = config
        .max_concurrent_file_sends
        .unwrap_or(pool_sizes.max_concurrent_transfers);
    let file_sender = Arc::new(FileSender::new(
        dispatcher.clone(),
        &config,
        max_concurrent_file_sends,
        event_tx.clone(),
    ));
    let expected_transfers = file_engine::new_expected_transfers();
    handles.push(tokio::spawn(file_engine::run_header_receiver(
        file_rx,
        dispatcher.clone(),
        self_id.clone(),
        expected_transfers.clone(),
        peer_table.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(file_engine::run_tcp_receiver(
        tcp_listener,
        expected_transfers.clone(),
        file_engine::FileSink::directory(config.received_file_directory.clone()),
        self_id.clone(),
        event_tx.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(file_engine::run_expiry_sweep(
        expected_transfers,
        Duration::from_secs(10),
        cancel.clone(),
    )));

    let runtime = PeerRuntime {
        config,
        peer_table,
        message_sender,
        file_sender,
        cancel,
    };

    // Reap the background tasks in their own task rather than detaching
    // them entirely, so a panic inside one surfaces in the log instead of
    // vanishing silently.
    tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
    });

    Ok((runtime, event_rx))
}

//! The callback surface (§6.5) exposed to the host application.
//!
//! Rather than invoking host-supplied closures directly from worker tasks —
//! which would couple the core's thread topology to whatever threading
//! model the host uses — events are pushed onto a bounded
//! single-producer/multi-consumer channel that the host drains at its own
//! pace (§9 design note: "prefer a narrow event channel over direct
//! upcalls").

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

/// Progress phase of an outbound file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Initiating,
    Progress,
    Completed,
    Error,
}

/// Every externally visible occurrence the core reports to its host.
///
/// `Serialize`s to the same JSON shape the teacher ships `RuntimeEvent`
/// across its webview IPC boundary with — a host that bridges these
/// events to a GUI or a remote collaborator over a socket doesn't need to
/// hand-roll its own wire format.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerEvent {
    /// A MESSAGE was fully received and accepted.
    Message { from: String, text: String },
    /// A FILE was fully received and written to disk.
    File { from: String, path: PathBuf },
    /// A peer transitioned from unknown/offline to online.
    PeerOnline { peer: String },
    /// A peer's liveness window elapsed with no traffic.
    PeerOffline { peer: String },
    /// Progress of an outbound file transfer.
    FileProgress {
        peer: String,
        path: PathBuf,
        percent: u8,
        status: FileStatus,
    },
    /// A non-fatal diagnostic the host may want to surface or log.
    Log { level: log::Level, message: String },
}

/// Sending half of the event channel; cloned into every worker.
pub type EventSender = mpsc::Sender<PeerEvent>;
/// Receiving half handed to the host; drained at the host's own pace.
pub type EventReceiver = mpsc::Receiver<PeerEvent>;

/// Capacity of the event channel. Generous enough that a burst of file
/// progress updates doesn't back-pressure the workers producing them.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Convenience for emitting a log event without blocking the caller
/// indefinitely if the host has stopped draining events.
pub async fn emit_log(events: &EventSender, level: log::Level, message: impl Into<String>) {
    let message = message.into();
    // Forward through the `log` facade first so diagnostics are never lost
    // even if the host hasn't started draining the event channel yet.
    log::log!(level, "{}", message);
    let _ = events.send(PeerEvent::Log { level, message }).await;
}

//! FILE transfer state machine: a UDP header handshake followed by a TCP
//! body (§4.4, §5).
//!
//! The sender announces an incoming transfer over UDP (same Header shape
//! as MESSAGE, `op = File`), then opens a TCP connection to the receiver's
//! listener and streams the file. The receiver has to correlate the TCP
//! connection it accepts with the UDP header it already saw — there is no
//! shared identifier on the wire beyond the source IP — so it tracks
//! "expected transfers" keyed by source IP with a short GC window in case
//! the TCP connection never arrives.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::codec::{pack_header, pack_response, Header, OpCode, PeerId, Response, Status};
use crate::config::PeerConfig;
use crate::dispatcher::{Dispatcher, InboundHeader};
use crate::error::{LcpError, Result};
use crate::events::{emit_log, EventSender, FileStatus, PeerEvent};
use crate::peer_table::PeerTable;

/// How long an expected transfer is kept around waiting for its TCP
/// connection before being garbage-collected.
const EXPECTED_TRANSFER_TTL: Duration = Duration::from_secs(30);

/// How often file progress is reported to the event channel.
const PROGRESS_STEP_PERCENT: u8 = 5;
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// I/O timeout applied to each chunk read/write during a transfer.
const CHUNK_IO_TIMEOUT: Duration = Duration::from_secs(10);

const CHUNK_SIZE: usize = 64 * 1024;

struct ExpectedTransfer {
    header: Header,
    registered_at: Instant,
}

/// Bookkeeping for transfers we've been told (over UDP) to expect but
/// whose TCP body hasn't arrived yet, keyed by the sender's IP address.
#[derive(Default)]
pub struct ExpectedTransfers {
    by_source_ip: Mutex<HashMap<IpAddr, ExpectedTransfer>>,
}

impl ExpectedTransfers {
    fn insert(&self, ip: IpAddr, header: Header) {
        self.by_source_ip.lock().insert(
            ip,
            ExpectedTransfer {
                header,
                registered_at: Instant::now(),
            },
        );
    }

    fn take(&self, ip: IpAddr) -> Option<Header> {
        self.by_source_ip.lock().remove(&ip).map(|e| e.header)
    }

    fn sweep(&self) {
        let mut guard = self.by_source_ip.lock();
        let before = guard.len();
        guard.retain(|_, e| e.registered_at.elapsed() < EXPECTED_TRANSFER_TTL);
        let pruned = before - guard.len();
        if pruned > 0 {
            warn!("dropped {pruned} stale expected file transfer(s)");
        }
    }
}

/// Outbound half: announces and streams a file to a peer, gated by a
/// semaphore so at most `max_concurrent_file_sends` transfers run at
/// once (§5 resource model).
pub struct FileSender {
    dispatcher: Dispatcher,
    self_id: PeerId,
    tcp_port: u16,
    header_timeout: Duration,
    semaphore: Arc<Semaphore>,
    events: EventSender,
}

impl FileSender {
    /// `max_concurrent_file_sends` is the effective ceiling to gate on:
    /// `config.max_concurrent_file_sends` when the host set it, or the
    /// §4.7 worker-pool formula's computed ceiling otherwise (§6.6 —
    /// the config value *overrides* the computed default, implying the
    /// computed value is what applies when the host leaves it unset).
    pub fn new(
        dispatcher: Dispatcher,
        config: &PeerConfig,
        max_concurrent_file_sends: usize,
        events: EventSender,
    ) -> Self {
        Self {
            dispatcher,
            self_id: PeerId::from_str(&config.local_peer_id),
            tcp_port: config.listen_port,
            header_timeout: Duration::from_secs(config.header_timeout_secs),
            semaphore: Arc::new(Semaphore::new(max_concurrent_file_sends)),
            events,
        }
    }

    /// Send `path` to `peer_id` at `target`. Blocks on the concurrency
    /// gate if `max_concurrent_file_sends` transfers are already running.
    pub async fn send(&self, peer_id: &PeerId, target: SocketAddr, path: &Path) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LcpError::ChannelClosed)?;

        let metadata = tokio::fs::metadata(path).await.map_err(LcpError::Io)?;
        let file_size = metadata.len();

        self.events
            .send(PeerEvent::FileProgress {
                peer: peer_id.normalized().to_string(),
                path: path.to_path_buf(),
                percent: 0,
                status: FileStatus::Initiating,
            })
            .await
            .ok();

        let header = Header {
            from: self.self_id.clone(),
            to: peer_id.clone(),
            op: OpCode::File,
            body_id: rand_file_id(),
            body_length: file_size,
        };
        let packed = pack_header(&header);

        let response_rx = self.dispatcher.register_response_waiter(target);
        self.dispatcher.send_to(&packed, target).await?;
        match tokio::time::timeout(self.header_timeout, response_rx).await {
            Ok(Ok(response)) if response.status == Status::Ok => {}
            Ok(Ok(response)) => {
                return Err(LcpError::protocol(format!(
                    "peer rejected file header: {:?}",
                    response.status
                )))
            }
            Ok(Err(_)) => return Err(LcpError::ChannelClosed),
            Err(_) => return Err(LcpError::timeout(format!("file header ack from {target}"))),
        }

        let tcp_target = SocketAddr::new(target.ip(), self.tcp_port);
        let stream = TcpStream::connect(tcp_target).await.map_err(LcpError::Io)?;
        let result = stream_file_to_peer(stream, header.body_id, path, file_size, peer_id, &self.events).await;

        let status = if result.is_ok() {
            FileStatus::Completed
        } else {
            FileStatus::Error
        };
        self.events
            .send(PeerEvent::FileProgress {
                peer: peer_id.normalized().to_string(),
                path: path.to_path_buf(),
                percent: 100,
                status,
            })
            .await
            .ok();

        result
    }
}

async fn stream_file_to_peer(
    mut stream: TcpStream,
    file_id: u8,
    path: &Path,
    file_size: u64,
    peer_id: &PeerId,
    events: &EventSender,
) -> Result<()> {
    let mut file = File::open(path).await.map_err(LcpError::Io)?;
    let mut sent: u64 = 0;
    let mut last_reported_percent: u8 = 0;
    let mut last_reported_bytes: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    tokio::time::timeout(
        CHUNK_IO_TIMEOUT,
        stream.write_all(&crate::codec::encode_body_id_prefix(file_id)),
    )
    .await
    .map_err(|_| LcpError::timeout("writing file id prefix to peer"))?
    .map_err(LcpError::Io)?;

    loop {
        let n = tokio::time::timeout(CHUNK_IO_TIMEOUT, file.read(&mut buf))
            .await
            .map_err(|_| LcpError::timeout("reading file chunk"))?
            .map_err(LcpError::Io)?;
        if n == 0 {
            break;
        }

        tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.write_all(&buf[..n]))
            .await
            .map_err(|_| LcpError::timeout("writing file chunk to peer"))?
            .map_err(LcpError::Io)?;

        sent += n as u64;
        let percent = if file_size > 0 {
            ((sent * 100) / file_size) as u8
        } else {
            100
        };

        if percent >= last_reported_percent + PROGRESS_STEP_PERCENT
            || sent >= last_reported_bytes + PROGRESS_STEP_BYTES
        {
            last_reported_percent = percent;
            last_reported_bytes = sent;
            events
                .send(PeerEvent::FileProgress {
                    peer: peer_id.normalized().to_string(),
                    path: path.to_path_buf(),
                    percent,
                    status: FileStatus::Progress,
                })
                .await
                .ok();
        }
    }

    stream.flush().await.map_err(LcpError::Io)?;

    // The connection is only closed once the receiver has sent its final
    // 25-byte Response back over the same stream (§3 FileBody contract).
    let mut response_buf = [0u8; crate::codec::RESPONSE_SIZE];
    tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.read_exact(&mut response_buf))
        .await
        .map_err(|_| LcpError::timeout("reading final file response from peer"))?
        .map_err(LcpError::Io)?;
    let response = crate::codec::unpack_response(&response_buf)?;
    if response.status != Status::Ok {
        return Err(LcpError::protocol(format!(
            "peer rejected file body: {:?}",
            response.status
        )));
    }

    Ok(())
}

/// Inbound half: consumes FILE headers routed by the dispatcher, records
/// an expected transfer, and acks. The matching TCP body is handled by
/// [`run_tcp_receiver`].
pub async fn run_header_receiver(
    mut rx: mpsc::Receiver<InboundHeader>,
    dispatcher: Dispatcher,
    self_id: PeerId,
    expected: Arc<ExpectedTransfers>,
    peer_table: Arc<PeerTable>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => {
                let Some(inbound) = inbound else { break };
                let InboundHeader { header, source } = inbound;
                // §4.8: any incoming Header from a non-self peer touches the
                // PeerTable before dispatch, so a peer announces itself by
                // sending a FILE header just as surely as an ECHO.
                peer_table.touch_and_notify(*header.from.raw(), source).await;

                expected.insert(source.ip(), header);

                let ack = Response { status: Status::Ok, responder: self_id.clone() };
                if let Err(e) = dispatcher.send_to(&pack_response(&ack), source).await {
                    warn!("failed to ack file header from {source}: {e}");
                }
            }
        }
    }
}

/// Where a received file body is written. The default writes into a
/// configured directory under the spec's default naming scheme
/// (§4.6/§6.4); a host can instead supply a function deciding the
/// destination path per `(peer, file_id, size)`.
#[derive(Clone)]
pub enum FileSink {
    Directory(PathBuf),
    Custom(Arc<dyn Fn(&str, u8, u64) -> PathBuf + Send + Sync>),
}

impl FileSink {
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self::Directory(dir.into())
    }

    pub fn custom(f: impl Fn(&str, u8, u64) -> PathBuf + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    fn resolve(&self, peer: &str, file_id: u8, size: u64) -> PathBuf {
        match self {
            Self::Directory(dir) => dir.join(default_file_name(peer)),
            Self::Custom(f) => f(peer, file_id, size),
        }
    }
}

/// Default destination name: `lcp_file_<unix-seconds>_<peer>.dat`.
fn default_file_name(peer: &str) -> String {
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("lcp_file_{unix_secs}_{peer}.dat")
}

/// Accepts TCP connections and matches each one to an expected transfer
/// by source IP, then streams the body to disk under
/// `received_file_directory`.
pub async fn run_tcp_receiver(
    listener: TcpListener,
    expected: Arc<ExpectedTransfers>,
    sink: FileSink,
    self_id: PeerId,
    events: EventSender,
    cancel: CancellationToken,
) {
    if let FileSink::Directory(dir) = &sink {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("failed to create received-file directory {dir:?}: {e}");
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, peer_addr)) => {
                        let header = expected.take(peer_addr.ip());
                        let Some(header) = header else {
                            warn!("unexpected file TCP connection from {peer_addr} with no prior header");
                            reject_orphan_connection(&mut stream, self_id.clone()).await;
                            continue;
                        };
                        let sink = sink.clone();
                        let events = events.clone();
                        let self_id = self_id.clone();
                        tokio::spawn(receive_file_body(stream, header, sink, self_id, events));
                    }
                    Err(e) => warn!("file TCP accept error: {e}"),
                }
            }
        }
    }
}

/// A TCP connection with no matching `ExpectedTransfer` is a protocol
/// violation (§7): reply BAD_REQUEST and close, no `onFile` ever fires.
async fn reject_orphan_connection(stream: &mut TcpStream, self_id: PeerId) {
    let response = Response {
        status: Status::BadRequest,
        responder: self_id,
    };
    let _ = tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.write_all(&pack_response(&response))).await;
}

async fn receive_file_body(
    mut stream: TcpStream,
    header: Header,
    sink: FileSink,
    self_id: PeerId,
    events: EventSender,
) {
    let peer = header.from.normalized().to_string();
    let dest = sink.resolve(&peer, header.body_id, header.body_length);

    let result = receive_and_write_body(&mut stream, &header, &dest).await;

    let final_status = match &result {
        Ok(()) => Status::Ok,
        Err(LcpError::Protocol(_)) | Err(LcpError::Malformed(_)) => Status::BadRequest,
        Err(_) => Status::InternalError,
    };
    let response = Response {
        status: final_status,
        responder: self_id,
    };
    let _ = tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.write_all(&pack_response(&response))).await;

    let progress_status = if result.is_ok() {
        FileStatus::Completed
    } else {
        FileStatus::Error
    };
    if let Err(e) = &result {
        emit_log(&events, log::Level::Warn, format!("file transfer from {peer} failed: {e}")).await;
    } else {
        info!("received file from {peer} -> {dest:?}");
    }

    events
        .send(PeerEvent::FileProgress {
            peer: peer.clone(),
            path: dest.clone(),
            percent: 100,
            status: progress_status,
        })
        .await
        .ok();

    if result.is_ok() {
        events
            .send(PeerEvent::File { from: peer, path: dest })
            .await
            .ok();
    }
}

/// Read the 8-byte FileId prefix (verified against the header's `BodyId`
/// per §9's BodyId-width resolution), then stream exactly
/// `header.body_length` bytes to `dest`.
async fn receive_and_write_body(stream: &mut TcpStream, header: &Header, dest: &Path) -> Result<()> {
    let mut prefix = [0u8; 8];
    tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.read_exact(&mut prefix))
        .await
        .map_err(|_| LcpError::timeout("reading file id prefix from peer"))?
        .map_err(LcpError::Io)?;
    if !crate::codec::body_id_matches(header.body_id, &prefix) {
        return Err(LcpError::protocol("file id prefix does not match accepted header"));
    }

    write_body_to_disk(stream, dest, header.body_length).await
}

async fn write_body_to_disk(stream: &mut TcpStream, dest: &Path, expected_len: u64) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(LcpError::Io)?;
    }
    let mut file = File::create(dest).await.map_err(LcpError::Io)?;
    let mut received: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    while received < expected_len {
        let remaining = (expected_len - received).min(CHUNK_SIZE as u64) as usize;
        let n = tokio::time::timeout(CHUNK_IO_TIMEOUT, stream.read(&mut buf[..remaining]))
            .await
            .map_err(|_| LcpError::timeout("reading file chunk from peer"))?
            .map_err(LcpError::Io)?;
        if n == 0 {
            return Err(LcpError::protocol("peer closed connection before file complete"));
        }
        file.write_all(&buf[..n]).await.map_err(LcpError::Io)?;
        received += n as u64;
    }

    file.flush().await.map_err(LcpError::Io)?;
    Ok(())
}

/// Cheap pseudo-random FileId: the low byte of the current monotonic
/// clock reading, mirroring `message_engine::rand_body_id` — the header's
/// `BodyId` field doubles as the file nonce per §4.4.
fn rand_file_id() -> u8 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u8)
        .unwrap_or(0)
}

pub fn new_expected_transfers() -> Arc<ExpectedTransfers> {
    Arc::new(ExpectedTransfers::default())
}

/// Periodically prune expected transfers that never got a TCP connection.
pub async fn run_expiry_sweep(
    expected: Arc<ExpectedTransfers>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => expected.sweep(),
        }
    }
}

//! Single receive path for the shared UDP socket (§4.1, §9).
//!
//! Exactly one task ever calls `recv_from` on the control socket. It
//! classifies each datagram by length and routes it:
//!
//! - 100 bytes → a [`Header`]; routed to discovery/message/file by `OpCode`.
//! - 25 bytes  → a [`Response`]; delivered to whichever send-side call is
//!   waiting on that source address.
//! - anything else → checked against the pending-body registry (source
//!   address + exact expected length) before being logged and dropped.
//!   MESSAGE bodies are arbitrary length and share this socket with
//!   headers and responses, so a registry lookup has to happen before a
//!   datagram can be written off as unsolicited noise.
//!
//! Maintaining two registries — one for response waiters, one for body
//! waiters — keyed by source address (and, for bodies, length) lets the
//! send- and receive-side state machines in [`crate::message_engine`] and
//! [`crate::file_engine`] `await` a specific reply without themselves
//! touching the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, unpack_header, unpack_response, Header, OpCode, Response, HEADER_SIZE, RESPONSE_SIZE};
use crate::error::{LcpError, Result};
use crate::events::{emit_log, EventSender};

/// Largest datagram the dispatcher will read. MESSAGE bodies are capped
/// well below the UDP practical limit to keep a single malicious or
/// misbehaving peer from forcing large allocations.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// A decoded header paired with the address it arrived from.
#[derive(Debug, Clone)]
pub struct InboundHeader {
    pub header: Header,
    pub source: SocketAddr,
}

struct Registries {
    responses: Mutex<HashMap<SocketAddr, oneshot::Sender<Response>>>,
    bodies: Mutex<HashMap<(SocketAddr, usize), oneshot::Sender<Vec<u8>>>>,
}

/// Owns the shared UDP socket and the registries send-side callers use to
/// wait for a specific reply. Cheap to clone (internally `Arc`-backed) so
/// every worker that needs to send a datagram can hold one.
#[derive(Clone)]
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    registries: Arc<Registries>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
    events: EventSender,
}

impl Dispatcher {
    pub fn new(socket: UdpSocket, events: EventSender) -> Self {
        Self {
            socket: Arc::new(socket),
            registries: Arc::new(Registries {
                responses: Mutex::new(HashMap::new()),
                bodies: Mutex::new(HashMap::new()),
            }),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a raw datagram. Serialized through a single lock per the
    /// design note favoring one disciplined send path over concurrent
    /// unordered `sendto` calls from every worker.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.socket.send_to(buf, target).await.map_err(LcpError::Io)?;
        Ok(())
    }

    /// Register interest in the next `Response` datagram from `source`.
    /// Must be called *before* the header/body that will trigger the
    /// reply is sent, to avoid a race against the dispatcher loop.
    pub fn register_response_waiter(&self, source: SocketAddr) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.registries.responses.lock().insert(source, tx);
        rx
    }

    /// Register interest in a body datagram of exactly `expected_len` bytes
    /// from `source`. The expected length is the 8-byte `BodyId` prefix
    /// plus the header's declared `body_length`.
    pub fn register_body_waiter(
        &self,
        source: SocketAddr,
        expected_len: usize,
    ) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.registries
            .bodies
            .lock()
            .insert((source, expected_len), tx);
        rx
    }

    /// Drop a previously registered body waiter, e.g. after a timeout, so
    /// a late datagram doesn't get delivered into a dead receiver.
    pub fn cancel_body_waiter(&self, source: SocketAddr, expected_len: usize) {
        self.registries.bodies.lock().remove(&(source, expected_len));
    }

    /// Run the single receive loop until `cancel` fires. Decoded headers
    /// are routed to `discovery_tx`/`message_tx`/`file_tx` by `OpCode`;
    /// everything else is resolved against the registries above.
    pub async fn run(
        self,
        discovery_tx: mpsc::Sender<InboundHeader>,
        message_tx: mpsc::Sender<InboundHeader>,
        file_tx: mpsc::Sender<InboundHeader>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, source)) => {
                            self.handle_datagram(&buf[..len], source, &discovery_tx, &message_tx, &file_tx).await;
                        }
                        Err(e) => {
                            warn!("dispatcher recv error: {e}");
                        }
                    }
                }
            }
        }

        debug!("dispatcher stopped");
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
        discovery_tx: &mpsc::Sender<InboundHeader>,
        message_tx: &mpsc::Sender<InboundHeader>,
        file_tx: &mpsc::Sender<InboundHeader>,
    ) {
        match data.len() {
            HEADER_SIZE => match unpack_header(data) {
                Ok(header) => {
                    let target = match header.op {
                        OpCode::Echo => discovery_tx,
                        OpCode::Message => message_tx,
                        OpCode::File => file_tx,
                    };
                    let _ = target.send(InboundHeader { header, source }).await;
                }
                Err(e) => warn!("malformed header from {source}: {e}"),
            },
            RESPONSE_SIZE => match unpack_response(data) {
                Ok(response) => {
                    let waiter = self.registries.responses.lock().remove(&source);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => {
                            emit_log(
                                &self.events,
                                log::Level::Debug,
                                LcpError::NoWaiter(source).to_string(),
                            )
                            .await;
                        }
                    }
                }
                Err(e) => warn!("malformed response from {source}: {e}"),
            },
            other_len => {
                let waiter = self
                    .registries
                    .bodies
                    .lock()
                    .remove(&(source, other_len));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(data.to_vec());
                    }
                    None => {
                        debug!(
                            "dropping unsolicited {other_len}-byte datagram from {source}"
                        );
                    }
                }
            }
        }
    }
}

/// Build the 8-byte-prefixed body datagram sent after a header/ack.
pub fn encode_body(body_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&codec::encode_body_id_prefix(body_id));
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{pack_header, pack_response, PeerId, Status};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    async fn make_dispatcher() -> Dispatcher {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Dispatcher::new(socket, crate::events::channel().0)
    }

    #[tokio::test]
    async fn response_delivered_to_registered_waiter() {
        let dispatcher = make_dispatcher().await;
        let source = addr(1);
        let rx = dispatcher.register_response_waiter(source);

        let response = Response {
            status: Status::Ok,
            responder: PeerId::from_str("bob"),
        };
        let packed = pack_response(&response);
        dispatcher.handle_datagram(&packed, source, &mpsc::channel(1).0, &mpsc::channel(1).0, &mpsc::channel(1).0).await;

        let delivered = rx.await.unwrap();
        assert_eq!(delivered, response);
    }

    #[tokio::test]
    async fn unsolicited_response_is_dropped_not_panicking() {
        let dispatcher = make_dispatcher().await;
        let response = Response {
            status: Status::Ok,
            responder: PeerId::from_str("bob"),
        };
        let packed = pack_response(&response);
        dispatcher
            .handle_datagram(&packed, addr(2), &mpsc::channel(1).0, &mpsc::channel(1).0, &mpsc::channel(1).0)
            .await;
    }

    #[tokio::test]
    async fn body_delivered_only_to_matching_length_waiter() {
        let dispatcher = make_dispatcher().await;
        let source = addr(3);
        let rx = dispatcher.register_body_waiter(source, 11);

        let body = encode_body(5, b"hi");
        assert_eq!(body.len(), 10); // wrong length on purpose
        dispatcher
            .handle_datagram(&body, source, &mpsc::channel(1).0, &mpsc::channel(1).0, &mpsc::channel(1).0)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn header_routed_by_opcode() {
        let dispatcher = make_dispatcher().await;
        let (disco_tx, mut disco_rx) = mpsc::channel(1);
        let (msg_tx, _msg_rx) = mpsc::channel(1);
        let (file_tx, _file_rx) = mpsc::channel(1);

        let header = Header {
            from: PeerId::from_str("alice"),
            to: PeerId::broadcast(),
            op: OpCode::Echo,
            body_id: 0,
            body_length: 0,
        };
        let packed = pack_header(&header);
        dispatcher
            .handle_datagram(&packed, addr(4), &disco_tx, &msg_tx, &file_tx)
            .await;

        let inbound = disco_rx.try_recv().unwrap();
        assert_eq!(inbound.header.op, OpCode::Echo);
    }
}

//! Loopback discovery: two dispatchers on localhost exchange an ECHO
//! header and a peer gets added to the other's table.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lcp::codec::{pack_header, Header, OpCode, PeerId};
use lcp::dispatcher::Dispatcher;
use lcp::events;
use lcp::peer_table::PeerTable;
use tokio::net::UdpSocket;

async fn bind_loopback() -> (Dispatcher, SocketAddr) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Dispatcher::new(socket, events::channel().0), addr)
}

#[tokio::test]
async fn echo_header_registers_the_sender_as_online() {
    let (alice_dispatcher, alice_addr) = bind_loopback().await;
    let (bob_dispatcher, bob_addr) = bind_loopback().await;

    let (bob_events_tx, _bob_events_rx) = events::channel();
    let bob_table = PeerTable::new("bob", bob_events_tx, Duration::from_secs(90));

    let header = Header {
        from: PeerId::from_str("alice"),
        to: PeerId::broadcast(),
        op: OpCode::Echo,
        body_id: 0,
        body_length: 0,
    };
    let packed = pack_header(&header);
    alice_dispatcher.send_to(&packed, bob_addr).await.unwrap();

    // Receive directly through the dispatcher's recv path by routing one
    // datagram through the same classification the runtime uses.
    let (discovery_tx, mut discovery_rx) = tokio::sync::mpsc::channel(1);
    let (message_tx, _message_rx) = tokio::sync::mpsc::channel(1);
    let (file_tx, _file_rx) = tokio::sync::mpsc::channel(1);

    let cancel = tokio_util::sync::CancellationToken::new();
    let run_cancel = cancel.clone();
    let dispatcher_task = tokio::spawn(bob_dispatcher.run(discovery_tx, message_tx, file_tx, run_cancel));

    let inbound = tokio::time::timeout(Duration::from_secs(2), discovery_rx.recv())
        .await
        .expect("should receive an echo header")
        .expect("channel should not be closed");

    bob_table
        .touch_and_notify(*inbound.header.from.raw(), inbound.source)
        .await;

    assert_eq!(bob_table.snapshot_online().len(), 1);
    assert_eq!(bob_table.snapshot_online()[0].normalized, "alice");

    cancel.cancel();
    let _ = dispatcher_task.await;
    let _ = alice_addr;
}

//! Loopback file transfer: a `FileSender` delivers a small file to a
//! receiver running the real header/TCP-accept/body pipeline, and a
//! second test checks that an orphan TCP connect (no matching UDP
//! header) is rejected without ever touching disk.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use lcp::config::PeerConfig;
use lcp::dispatcher::{Dispatcher, InboundHeader};
use lcp::events;
use lcp::file_engine::{self, run_header_receiver, run_tcp_receiver, FileSender, FileSink};
use lcp::peer_table::PeerTable;
use lcp::{PeerEvent, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn bind_loopback_udp() -> (Dispatcher, SocketAddr) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Dispatcher::new(socket, events::channel().0), addr)
}

#[tokio::test]
async fn file_is_delivered_with_matching_bytes_and_final_ack() {
    let dir = tempfile_dir("lcp-file-recv");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let src_path = dir.join("source.bin");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&src_path, &payload).await.unwrap();

    let (sender_udp, _sender_udp_addr) = bind_loopback_udp().await;
    let (receiver_udp, receiver_udp_addr) = bind_loopback_udp().await;
    let receiver_tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let receiver_tcp_addr = receiver_tcp.local_addr().unwrap();

    let cancel = CancellationToken::new();

    let (s_disco_tx, _s_disco_rx) = mpsc::channel::<InboundHeader>(1);
    let (s_msg_tx, _s_msg_rx) = mpsc::channel::<InboundHeader>(1);
    let (s_file_tx, _s_file_rx) = mpsc::channel::<InboundHeader>(1);
    let sender_dispatcher_task = tokio::spawn(sender_udp.clone().run(
        s_disco_tx,
        s_msg_tx,
        s_file_tx,
        cancel.clone(),
    ));

    let (r_disco_tx, _r_disco_rx) = mpsc::channel::<InboundHeader>(1);
    let (r_msg_tx, _r_msg_rx) = mpsc::channel::<InboundHeader>(1);
    let (r_file_tx, r_file_rx) = mpsc::channel::<InboundHeader>(8);
    let receiver_dispatcher_task = tokio::spawn(receiver_udp.clone().run(
        r_disco_tx,
        r_msg_tx,
        r_file_tx,
        cancel.clone(),
    ));

    let receiver_self_id = PeerId::from_str("receiver");
    let expected = file_engine::new_expected_transfers();
    let (events_tx, mut events_rx) = events::channel();
    let peer_table = PeerTable::new("receiver", events_tx.clone(), Duration::from_secs(90));
    let header_receiver_task = tokio::spawn(run_header_receiver(
        r_file_rx,
        receiver_udp.clone(),
        receiver_self_id.clone(),
        expected.clone(),
        peer_table,
        cancel.clone(),
    ));

    let tcp_receiver_task = tokio::spawn(run_tcp_receiver(
        receiver_tcp,
        expected,
        FileSink::directory(dir.clone()),
        receiver_self_id,
        events_tx,
        cancel.clone(),
    ));

    // The FileSender connects to the receiver's TCP port, which in this
    // test is not the same as the UDP port it just handshook on — so we
    // wire the sender's "tcp_port" via config.listen_port, matching the
    // receiver's TCP listener port, and target the UDP header at the
    // receiver's UDP address for the handshake.
    let mut config = PeerConfig::default();
    config.local_peer_id = "sender".to_string();
    config.listen_port = receiver_tcp_addr.port();
    let sender = FileSender::new(sender_udp.clone(), &config, 4, events::channel().0);

    let receiver_peer_id = PeerId::from_str("receiver");
    sender
        .send(&receiver_peer_id, receiver_udp_addr, &src_path)
        .await
        .expect("file transfer should succeed");

    // The inbound header also touches the PeerTable (§4.8), so a
    // `PeerOnline`/`FileProgress` event may arrive ahead of `File`.
    let file_event = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("should receive a file event")
            .expect("channel should not be closed");
        if let PeerEvent::File { .. } = &event {
            break event;
        }
    };

    match file_event {
        PeerEvent::File { from, path } => {
            assert_eq!(from, "sender");
            let written = tokio::fs::read(&path).await.unwrap();
            assert_eq!(written.len(), payload.len());
            assert_eq!(written, payload);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
    let _ = sender_dispatcher_task.await;
    let _ = receiver_dispatcher_task.await;
    let _ = header_receiver_task.await;
    let _ = tcp_receiver_task.await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn orphan_tcp_connect_is_rejected_without_delivering_a_file() {
    let dir = tempfile_dir("lcp-file-orphan");
    let receiver_tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let receiver_tcp_addr = receiver_tcp.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let expected = file_engine::new_expected_transfers(); // nothing registered
    let (events_tx, mut events_rx) = events::channel();
    let receiver_self_id = PeerId::from_str("receiver");
    let tcp_receiver_task = tokio::spawn(run_tcp_receiver(
        receiver_tcp,
        expected,
        FileSink::directory(dir.clone()),
        receiver_self_id,
        events_tx,
        cancel.clone(),
    ));

    let mut stream = TcpStream::connect(receiver_tcp_addr).await.unwrap();
    stream.write_all(&8u64.to_be_bytes()).await.unwrap();
    stream.write_all(b"uninvited").await.unwrap();

    let mut response_buf = [0u8; lcp::codec::RESPONSE_SIZE];
    tokio::io::AsyncReadExt::read_exact(&mut stream, &mut response_buf)
        .await
        .expect("orphan connection should still get a Response before close");
    let response = lcp::codec::unpack_response(&response_buf).unwrap();
    assert_eq!(response.status, lcp::codec::Status::BadRequest);

    assert!(
        tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .is_err(),
        "no onFile/progress event should fire for an orphan connection"
    );

    cancel.cancel();
    let _ = tcp_receiver_task.await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

fn tempfile_dir(prefix: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", std::process::id()));
    dir
}

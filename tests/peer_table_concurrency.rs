//! Concurrent touches from many tasks collapse to one record per
//! normalized key, with the last write setting the stored address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lcp::codec::PeerId;
use lcp::events;
use lcp::peer_table::PeerTable;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

#[tokio::test]
async fn concurrent_touches_collapse_to_one_record() {
    let (tx, _rx) = events::channel();
    let table = PeerTable::new("observer", tx, Duration::from_secs(90));

    let mut tasks = Vec::new();
    for i in 0..50u16 {
        let table = table.clone();
        tasks.push(tokio::spawn(async move {
            let raw = *PeerId::from_str("bob").raw();
            table.touch(raw, addr(1000 + i));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = table.snapshot_online();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].normalized, "bob");
}

#[tokio::test]
async fn concurrent_touches_of_distinct_peers_all_survive() {
    let (tx, _rx) = events::channel();
    let table = PeerTable::new("observer", tx, Duration::from_secs(90));

    let mut tasks = Vec::new();
    for i in 0..20u16 {
        let table = table.clone();
        tasks.push(tokio::spawn(async move {
            let raw = *PeerId::from_str(&format!("peer-{i}")).raw();
            table.touch(raw, addr(2000 + i));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(table.snapshot_online().len(), 20);
}

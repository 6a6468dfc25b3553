//! End-to-end tests running several nodes over loopback TCP.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, SystemTime},
};

use kadnode::{
    message::{Body, FindValueReply, Message},
    Error, Identity, KademliaConfig, KademliaNode, Key, ServerHandle, MAX_RECORD_SIZE,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> KademliaConfig {
    let mut config = KademliaConfig::default();
    config
        .set_listen_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .set_rpc_timeout(Duration::from_secs(2))
        .set_maintenance_interval(None);
    config
}

async fn spawn_node() -> (KademliaNode, ServerHandle) {
    KademliaNode::listen(config()).await.expect("listen failed")
}

/// Writes raw bytes to `addr` and returns whatever the node sends back
/// before closing the connection.
async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream.write_all(bytes).await.expect("write failed");

    let mut reply = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .expect("node kept the connection open")
        .expect("read failed");
    reply
}

#[tokio::test]
async fn ping_records_both_sides() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;

    let answered = a.ping(b_server.local_addr()).await.expect("ping failed");

    assert_eq!(answered, b.local());
    assert_eq!(a.node_count().await, 1);
    assert_eq!(b.node_count().await, 1);
    assert_eq!(b.closest_to(a.local_key(), 1).await, vec![a.local()]);
}

#[tokio::test]
async fn value_stored_on_one_node_is_found_through_another() {
    let (a, a_server) = spawn_node().await;
    let (b, _b_server) = spawn_node().await;
    let (c, _c_server) = spawn_node().await;

    // b only knows a, a knows c.
    a.ping(c.local().socket_addr()).await.unwrap();
    b.ping(a_server.local_addr()).await.unwrap();

    let value = b"some value".to_vec();
    let key = Key::from_content(value.as_slice());
    a.store_at(
        c.local().socket_addr(),
        key,
        value.clone(),
        SystemTime::now() + Duration::from_secs(60),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();

    assert!(b.get_local(&key).await.is_err());
    let found = timeout(TEST_TIMEOUT, b.lookup_value(&key))
        .await
        .unwrap()
        .expect("value not found");
    assert_eq!(found, value);

    // The lookup went through a, which pointed b at c.
    assert!(b.closest_to(c.local_key(), 1).await.contains(&c.local()));
}

#[tokio::test]
async fn find_value_on_empty_node_returns_nodes() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;

    let reply = a
        .find_value_at(b_server.local_addr(), Key::random())
        .await
        .unwrap();

    // b learned about a from the request itself.
    assert_eq!(reply, FindValueReply::Nodes(vec![a.local()]));
    assert_eq!(b.node_count().await, 1);
}

#[tokio::test]
async fn lookup_converges_after_joins() {
    let (bootstrap, bootstrap_server) = spawn_node().await;
    let mut nodes = Vec::new();

    for _ in 0..6 {
        let (node, server) = spawn_node().await;
        timeout(TEST_TIMEOUT, node.join(bootstrap_server.local_addr()))
            .await
            .unwrap()
            .expect("join failed");
        nodes.push((node, server));
    }

    assert_eq!(bootstrap.node_count().await, 6);

    let (last, _) = nodes.last().unwrap();
    for (node, _) in &nodes[..nodes.len() - 1] {
        let found = timeout(TEST_TIMEOUT, last.lookup_nodes(node.local_key()))
            .await
            .unwrap();

        assert_eq!(found.first(), Some(&node.local()));
        assert!(!found.contains(&last.local()));
    }
}

#[tokio::test]
async fn put_replicates_to_known_nodes() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;
    let (c, _c_server) = spawn_node().await;

    a.join(b_server.local_addr()).await.unwrap();
    c.join(b_server.local_addr()).await.unwrap();

    let value = b"replicated".to_vec();
    let key = timeout(TEST_TIMEOUT, a.put(value.clone()))
        .await
        .unwrap()
        .expect("put failed");

    assert_eq!(key, Key::from_content(value.as_slice()));
    assert_eq!(a.get_local(&key).await.unwrap(), value);
    assert_eq!(b.get_local(&key).await.unwrap(), value);
    assert_eq!(c.get_local(&key).await.unwrap(), value);
}

#[tokio::test]
async fn unreachable_peer_is_reported() {
    let (a, _a_server) = spawn_node().await;

    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let err = a.ping(addr).await.unwrap_err();
    assert!(err.is_unreachable(), "unexpected error {err:?}");
    assert!(matches!(err, Error::UnreachablePeer { addr: failed, .. } if failed == addr));
    assert_eq!(a.node_count().await, 0);
}

#[tokio::test]
async fn lookup_skips_dead_contacts() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;
    let (dead, dead_server) = spawn_node().await;

    a.ping(b_server.local_addr()).await.unwrap();
    a.ping(dead_server.local_addr()).await.unwrap();
    dead_server.shutdown().await;

    let found = timeout(TEST_TIMEOUT, a.lookup_nodes(dead.local_key()))
        .await
        .unwrap();

    assert!(!found.contains(&dead.local()));
    assert!(found.contains(&b.local()));
}

#[tokio::test]
async fn garbage_does_not_stop_the_server() {
    let (a, _a_server) = spawn_node().await;
    let (_b, b_server) = spawn_node().await;
    let addr = b_server.local_addr();

    // PING tag followed by bytes that are not a message.
    let reply = send_raw(addr, &[0, 0, 0, 5, 1, 0xff, 0xff, 0xff, 0xff]).await;
    assert!(reply.is_empty());

    // Length prefix far above the frame limit.
    let reply = send_raw(addr, &[0xff, 0xff, 0xff, 0xff]).await;
    assert!(reply.is_empty());

    a.ping(addr).await.expect("server stopped answering");
}

#[tokio::test]
async fn unknown_message_kind_gets_no_reply() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;
    let addr = b_server.local_addr();

    let reply = send_raw(addr, &[0, 0, 0, 3, 9, 0, 0]).await;
    assert!(reply.is_empty());
    assert_eq!(b.node_count().await, 0);

    a.ping(addr).await.expect("server stopped answering");
}

#[tokio::test]
async fn connection_closed_without_message() {
    let (a, _a_server) = spawn_node().await;
    let (_b, b_server) = spawn_node().await;
    let addr = b_server.local_addr();

    drop(TcpStream::connect(addr).await.unwrap());

    a.ping(addr).await.expect("server stopped answering");
}

#[tokio::test]
async fn shutdown_closes_the_listener() {
    let (a, _a_server) = spawn_node().await;
    let (_b, b_server) = spawn_node().await;
    let addr = b_server.local_addr();

    a.ping(addr).await.unwrap();
    timeout(TEST_TIMEOUT, b_server.shutdown())
        .await
        .expect("shutdown hung");

    assert!(a.ping(addr).await.unwrap_err().is_unreachable());
}

#[tokio::test]
async fn maintenance_expires_and_replicates_records() {
    let mut a_config = config();
    a_config.set_replication_interval(Duration::ZERO);
    let (a, _a_server) = KademliaNode::listen(a_config).await.unwrap();
    let (b, b_server) = spawn_node().await;

    a.ping(b_server.local_addr()).await.unwrap();

    let live = Key::from_content(b"live".as_slice());
    let stale = Key::from_content(b"stale".as_slice());
    let now = SystemTime::now();
    a.store_local(live, b"live".to_vec(), now + Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap();
    a.store_local(stale, b"stale".to_vec(), now - Duration::from_secs(1), Duration::ZERO)
        .await
        .unwrap();

    let report = timeout(TEST_TIMEOUT, a.run_maintenance()).await.unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(report.replicated, 1);
    assert_eq!(report.refreshed, 0);
    assert!(a.get_local(&stale).await.unwrap_err().is_not_found());
    assert_eq!(b.get_local(&live).await.unwrap(), b"live".to_vec());
    assert!(b.get_local(&stale).await.is_err());
}

#[tokio::test]
async fn shutdown_completes_while_all_slots_are_taken() {
    let mut b_config = config();
    b_config
        .set_max_connections(Some(1))
        .set_rpc_timeout(Duration::from_secs(60));
    let (_b, b_server) = KademliaNode::listen(b_config).await.unwrap();
    let addr = b_server.local_addr();

    // The first connection takes the only slot and never sends anything,
    // the second one leaves the accept loop waiting for a slot.
    let _idle = TcpStream::connect(addr).await.unwrap();
    let _queued = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(5), b_server.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test]
async fn stalled_reader_releases_its_slot() {
    let mut b_config = config();
    b_config
        .set_max_connections(Some(1))
        .set_rpc_timeout(Duration::from_millis(500));
    let (b, b_server) = KademliaNode::listen(b_config).await.unwrap();
    let (a, _a_server) = spawn_node().await;
    let addr = b_server.local_addr();

    let value = vec![7u8; MAX_RECORD_SIZE];
    let key = Key::from_content(value.as_slice());
    b.store_local(
        key,
        value,
        SystemTime::now() + Duration::from_secs(60),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();

    // Asks for the large record with a tiny receive window and never reads.
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(1024).unwrap();
    let mut stalled = socket.connect(addr).await.unwrap();
    let sender = Identity::new(Key::random(), "127.0.0.1:1".parse().unwrap());
    let request = Message::request(sender, Body::FindValue { key });
    stalled.write_all(&request.encode().unwrap()).await.unwrap();

    timeout(TEST_TIMEOUT, a.ping(addr))
        .await
        .unwrap()
        .expect("slot never released");
    drop(stalled);
}

#[tokio::test]
async fn rejected_store_is_not_counted_as_stored() {
    let (a, _a_server) = spawn_node().await;
    let (b, b_server) = spawn_node().await;

    let value = vec![1u8; MAX_RECORD_SIZE + 1];
    let key = Key::from_content(value.as_slice());
    let err = a
        .store_at(
            b_server.local_addr(),
            key,
            value,
            SystemTime::now() + Duration::from_secs(60),
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();

    assert!(err.is_unreachable(), "unexpected error {err:?}");
    assert!(b.get_local(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn refreshed_bucket_is_not_stale_again() {
    let mut a_config = config();
    a_config.set_refresh_interval(Duration::from_millis(200));
    let (a, _a_server) = KademliaNode::listen(a_config).await.unwrap();
    let (_b, b_server) = spawn_node().await;

    a.ping(b_server.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let report = timeout(TEST_TIMEOUT, a.run_maintenance()).await.unwrap();
    assert_eq!(report.refreshed, 1);

    let report = timeout(TEST_TIMEOUT, a.run_maintenance()).await.unwrap();
    assert_eq!(report.refreshed, 0);
}

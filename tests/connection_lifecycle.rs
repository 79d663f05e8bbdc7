//! Connect, close and failure paths over the loopback stack.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::mpsc;

use async_secure_tcp::{Connection, Listener, Phase};
use common::{drain, eventually, harness, next, record, Seen};

fn local(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Listener that hands every accepted connection to the returned channel.
fn accepting(h: &common::Harness, port: u16) -> (Listener, mpsc::UnboundedReceiver<Connection>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(port));
    listener.on_client(move |conn| {
        let _ = tx.send(conn);
    });
    listener.begin().unwrap();
    (listener, rx)
}

async fn accepted(rx: &mut mpsc::UnboundedReceiver<Connection>) -> Connection {
    tokio::time::timeout(common::WAIT, rx.recv())
        .await
        .ok()
        .flatten()
        .expect("no connection accepted")
}

#[tokio::test]
async fn test_connect_then_local_close() {
    let h = harness();
    let (_listener, _accepted) = accepting(&h, 7001);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    assert_eq!(client.phase(), Phase::Idle);

    client.connect(local(7001), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    assert!(client.connected());
    assert_eq!(client.phase(), Phase::Established);
    assert_eq!(client.remote_port(), 7001);
    assert_eq!(client.remote_ip(), Ipv4Addr::LOCALHOST);

    client.close(false);
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
    assert!(client.disconnected());
    assert!(client.binding().is_none());

    // A second close must not report the disconnect again.
    client.close(true);
    assert!(drain(&mut rx, Duration::from_millis(100)).await.is_empty());
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let h = harness();
    let (_listener, _accepted) = accepting(&h, 7002);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7002), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    assert!(client.connect(local(7002), false).is_err());
    assert!(client.connect_host("127.0.0.1", 7002, false).is_err());
    assert!(client.connected());
}

#[tokio::test]
async fn test_remote_close_reaches_both_sides() {
    let h = harness();
    let (_listener, mut incoming) = accepting(&h, 7003);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7003), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    let server = accepted(&mut incoming).await;
    let mut server_rx = record(&server);
    server.close(false);
    assert_eq!(next(&mut server_rx).await, Some(Seen::Disconnect));

    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
    assert!(eventually(|| h.stack.open_handles() == 1).await, "only the listener should remain");
    assert!(eventually(|| h.ctx.slots().free_count() == h.ctx.slots().capacity()).await);
}

#[tokio::test]
async fn test_refused_connect_reports_error_then_disconnect() {
    let h = harness();
    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);

    client.connect(local(7999), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Error(-14)));
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
    assert!(drain(&mut rx, Duration::from_millis(100)).await.is_empty());
    assert!(client.is_free());
}

#[tokio::test]
async fn test_unknown_host_reports_dns_failure_only() {
    let h = harness();
    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);

    client.connect_host("nowhere.invalid", 80, false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Error(-55)));
    assert!(drain(&mut rx, Duration::from_millis(100)).await.is_empty());
    assert!(client.binding().is_none());
    assert_eq!(h.ctx.active_bindings(), 0);
}

#[tokio::test]
async fn test_asynchronous_resolution_connects() {
    let h = harness();
    h.stack.add_host("device.local", Ipv4Addr::LOCALHOST);
    h.stack.set_async_dns(true);
    let (_listener, _accepted) = accepting(&h, 7004);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect_host("device.local", 7004, false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    assert_eq!(client.remote_port(), 7004);
}

#[tokio::test]
async fn test_empty_host_fails_immediately() {
    let h = harness();
    let client = Connection::new(&h.ctx);
    assert!(client.connect_host("", 80, false).is_err());
    assert!(client.is_free());
}

#[tokio::test]
async fn test_abort_reports_error_then_disconnect() {
    let h = harness();
    let (_listener, mut incoming) = accepting(&h, 7005);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7005), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    let server = accepted(&mut incoming).await;
    let mut server_rx = record(&server);

    client.abort();
    assert_eq!(next(&mut rx).await, Some(Seen::Error(-13)));
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));

    assert_eq!(next(&mut server_rx).await, Some(Seen::Error(-14)));
    assert_eq!(next(&mut server_rx).await, Some(Seen::Disconnect));
}

#[tokio::test]
async fn test_injected_error_closes_the_connection() {
    let h = harness();
    let (_listener, _accepted) = accepting(&h, 7006);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7006), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    let pcb = h.stack.connected_handles()[0];
    h.stack.inject_error(pcb, async_secure_tcp::ErrorCode::Timeout);
    assert_eq!(next(&mut rx).await, Some(Seen::Error(-3)));
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
    assert!(client.disconnected());
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let h = harness();
    let (_listener, _accepted) = accepting(&h, 7007);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7007), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    client.close(false);
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));

    client.connect(local(7007), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    assert!(client.connected());
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() {
    let h = harness();
    let (_listener, mut incoming) = accepting(&h, 7008);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.on_data(|_, _| panic!("handler failure"));
    client.connect(local(7008), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    let server = accepted(&mut incoming).await;
    assert_eq!(server.write(b"boom"), 4);
    server.close(false);

    assert_eq!(common::next_non_ack(&mut rx).await, Some(Seen::Disconnect));
}

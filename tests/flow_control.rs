//! Send window, deferred acknowledgement and poll-driven timeouts.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::mpsc;

use async_secure_tcp::{Connection, Listener, RuntimeConfig, WriteFlags};
use common::{drain, harness, harness_with, next, next_non_ack, record, Harness, Seen, WAIT};

fn local(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Client connected to a listener whose accepted side is returned as well.
async fn pair(h: &Harness, port: u16) -> (Listener, Connection, mpsc::UnboundedReceiver<Seen>, Connection) {
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(port));
    listener.on_client(move |conn| {
        let _ = tx.send(conn);
    });
    listener.begin().unwrap();

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(port), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    let server = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .ok()
        .flatten()
        .expect("no connection accepted");
    (listener, client, rx, server)
}

#[tokio::test]
async fn test_add_is_bounded_by_the_send_window() {
    let h = harness();
    h.stack.set_send_buffer(10);
    let (_listener, client, mut rx, _server) = pair(&h, 7101).await;

    assert_eq!(client.space(), 10);
    assert_eq!(client.add(b"0123456789abcdef", WriteFlags::COPY), 10);
    assert_eq!(client.space(), 0);
    assert!(!client.can_send());
    assert_eq!(client.add(b"more", WriteFlags::COPY), 0);

    assert!(client.send());
    assert_eq!(next(&mut rx).await, Some(Seen::Ack(10)));
    assert!(!client.is_busy());
    assert_eq!(client.space(), 10);
}

#[tokio::test]
async fn test_empty_write_and_unbound_write() {
    let h = harness();
    let idle = Connection::new(&h.ctx);
    assert_eq!(idle.write(b"nowhere"), 0);
    assert!(!idle.send());
    assert_eq!(idle.space(), 0);

    let (_listener, client, _rx, _server) = pair(&h, 7102).await;
    assert_eq!(client.add(b"", WriteFlags::COPY), 0);
}

#[tokio::test]
async fn test_data_reaches_the_peer_and_is_acked() {
    let h = harness();
    let (_listener, client, mut rx, server) = pair(&h, 7103).await;
    let mut server_rx = record(&server);

    assert_eq!(client.write(b"hello"), 5);
    assert!(client.is_busy());
    assert_eq!(next(&mut server_rx).await, Some(Seen::Data(b"hello".to_vec())));
    assert_eq!(next(&mut rx).await, Some(Seen::Ack(5)));
    assert!(common::eventually(|| h.stack.recved_total() == 5).await);
}

#[tokio::test]
async fn test_deferred_ack_holds_the_window() {
    let h = harness();
    let (_listener, client, _rx, server) = pair(&h, 7104).await;

    let (tx, mut received) = mpsc::unbounded_channel();
    server.on_data(move |c, data| {
        c.ack_later();
        let _ = tx.send(data.len());
    });

    let before = h.stack.recved_total();
    assert_eq!(client.write(b"hello"), 5);
    assert_eq!(tokio::time::timeout(WAIT, received.recv()).await.ok().flatten(), Some(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stack.recved_total(), before);

    assert_eq!(server.ack(3), 3);
    assert_eq!(h.stack.recved_total(), before + 3);
    assert_eq!(server.ack(100), 2);
    assert_eq!(server.ack(1), 0);
    assert_eq!(h.stack.recved_total(), before + 5);
}

#[tokio::test]
async fn test_close_releases_deferred_acks() {
    let h = harness();
    let (_listener, client, _rx, server) = pair(&h, 7105).await;

    let (tx, mut received) = mpsc::unbounded_channel();
    server.on_data(move |c, _| {
        c.ack_later();
        let _ = tx.send(());
    });

    let before = h.stack.recved_total();
    client.write(b"abcdefgh");
    assert!(tokio::time::timeout(WAIT, received.recv()).await.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close(false);
    assert_eq!(h.stack.recved_total(), before + 8);
}

#[tokio::test]
async fn test_packet_handler_takes_precedence() {
    let h = harness();
    let (_listener, client, mut rx, server) = pair(&h, 7106).await;

    let (tx, mut packets) = mpsc::unbounded_channel();
    client.on_packet(move |_, segment| {
        let _ = tx.send(segment);
    });

    let before = h.stack.recved_total();
    server.write(b"raw bytes");
    let segment = tokio::time::timeout(WAIT, packets.recv())
        .await
        .ok()
        .flatten()
        .expect("no packet delivered");
    assert_eq!(&segment[..], b"raw bytes");
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());
    assert_eq!(h.stack.recved_total(), before);

    client.ack_packet(&segment);
    assert_eq!(h.stack.recved_total(), before + segment.len());
}

#[tokio::test]
async fn test_ack_timeout_fires_once_without_closing() {
    let h = harness();
    h.stack.set_auto_ack(false);
    let (_listener, client, mut rx, _server) = pair(&h, 7107).await;
    client.set_ack_timeout(100);
    assert_eq!(client.ack_timeout(), 100);

    assert_eq!(client.write(b"x"), 1);
    h.clock.advance(Duration::from_millis(99));
    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());

    h.clock.advance(Duration::from_millis(51));
    h.stack.tick();
    assert_eq!(next(&mut rx).await, Some(Seen::Timeout(150)));
    assert!(!client.is_busy());

    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());
    assert!(client.connected());

    h.stack.release_acks();
    assert_eq!(next(&mut rx).await, Some(Seen::Ack(1)));
}

#[tokio::test]
async fn test_ack_timeout_zero_disables_the_check() {
    let h = harness();
    h.stack.set_auto_ack(false);
    let (_listener, client, mut rx, _server) = pair(&h, 7108).await;
    client.set_ack_timeout(0);

    client.write(b"x");
    h.clock.advance(Duration::from_secs(60));
    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());
    assert!(client.is_busy());
}

#[tokio::test]
async fn test_idle_receive_timeout_closes_once() {
    let h = harness();
    let (_listener, client, mut rx, _server) = pair(&h, 7109).await;
    client.set_rx_timeout(2);
    assert_eq!(client.rx_timeout(), 2);

    h.clock.advance(Duration::from_millis(1_999));
    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());

    h.clock.advance(Duration::from_millis(1));
    h.stack.tick();
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));

    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());
    assert!(client.disconnected());
}

#[tokio::test]
async fn test_received_data_resets_the_idle_timer() {
    let h = harness();
    let (_listener, client, mut rx, server) = pair(&h, 7110).await;
    client.set_rx_timeout(2);

    h.clock.advance(Duration::from_millis(1_500));
    server.write(b"keepalive");
    assert_eq!(next_non_ack(&mut rx).await, Some(Seen::Data(b"keepalive".to_vec())));

    h.clock.advance(Duration::from_millis(1_500));
    h.stack.tick();
    assert!(drain(&mut rx, Duration::from_millis(50)).await.is_empty());
    assert!(client.connected());
}

#[tokio::test]
async fn test_configured_defaults_apply_to_new_connections() {
    let mut config = RuntimeConfig::default();
    config.tcp.ack_timeout_ms = 250;
    config.tcp.rx_timeout_secs = 9;
    let h = harness_with(config);

    let conn = Connection::new(&h.ctx);
    assert_eq!(conn.ack_timeout(), 250);
    assert_eq!(conn.rx_timeout(), 9);
}

#[tokio::test]
async fn test_poll_handler_runs_on_tick() {
    let h = harness();
    let (_listener, client, _rx, _server) = pair(&h, 7111).await;

    let (tx, mut polls) = mpsc::unbounded_channel();
    client.on_poll(move |_| {
        let _ = tx.send(());
    });
    h.stack.tick();
    assert!(tokio::time::timeout(WAIT, polls.recv()).await.is_ok());
}

#[tokio::test]
async fn test_no_delay_follows_the_handle() {
    let h = harness();
    let idle = Connection::new(&h.ctx);
    assert!(!idle.no_delay());

    let (_listener, client, _rx, _server) = pair(&h, 7112).await;
    client.set_no_delay(true);
    assert!(client.no_delay());
    client.set_no_delay(false);
    assert!(!client.no_delay());
    assert_eq!(client.mss(), 1460);
}

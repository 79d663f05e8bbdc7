//! Accepting connections: handlers, shutdown and port handling.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::mpsc;

use async_secure_tcp::{Connection, Listener, TcpState};
use common::{drain, eventually, harness, next, next_non_ack, record, Seen, WAIT};

fn local(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[tokio::test]
async fn test_listener_without_handler_closes_clients() {
    let h = harness();
    let listener = Listener::new(&h.ctx, local(7301));
    listener.begin().unwrap();
    assert_eq!(listener.status(), TcpState::Listen);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7301), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
    assert!(listener.clients().is_empty());
}

#[tokio::test]
async fn test_accepted_connection_echoes() {
    let h = harness();
    let listener = Listener::new(&h.ctx, local(7302));
    listener.on_client(|conn| {
        conn.on_data(|c, data| {
            c.write(data);
        });
    });
    listener.begin().unwrap();

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7302), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    client.write(b"echo me");
    assert_eq!(next_non_ack(&mut rx).await, Some(Seen::Data(b"echo me".to_vec())));
    assert!(eventually(|| listener.clients().len() == 1).await);

    let servers = listener.clients();
    let server = &servers[0];
    assert_eq!(server.local_port(), 7302);
    assert_eq!(server.remote_port(), client.local_port());
}

#[tokio::test]
async fn test_begin_is_idempotent_and_ports_are_exclusive() {
    let h = harness();
    let first = Listener::new(&h.ctx, local(7303));
    first.begin().unwrap();
    first.begin().unwrap();
    assert_eq!(first.local_port(), 7303);

    let second = Listener::new(&h.ctx, local(7303));
    assert!(second.begin().is_err());
    assert_eq!(second.status(), TcpState::Closed);
}

#[tokio::test]
async fn test_port_zero_picks_a_free_port() {
    let h = harness();
    let listener = Listener::new(&h.ctx, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    listener.on_client(|_| {});
    listener.begin().unwrap();
    let port = listener.local_port();
    assert_ne!(port, 0);

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(port), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
}

#[tokio::test]
async fn test_end_stops_accepting_but_keeps_clients() {
    let h = harness();
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(7304));
    listener.on_client(move |conn| {
        let _ = tx.send(conn);
    });
    listener.begin().unwrap();

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7304), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    let server = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .ok()
        .flatten()
        .expect("no connection accepted");

    listener.end();
    assert_eq!(listener.status(), TcpState::Closed);
    assert_eq!(listener.local_port(), 0);
    listener.end();

    server.write(b"still here");
    assert_eq!(next_non_ack(&mut rx).await, Some(Seen::Data(b"still here".to_vec())));

    let late = Connection::new(&h.ctx);
    let mut late_rx = record(&late);
    late.connect(local(7304), false).unwrap();
    assert_eq!(next(&mut late_rx).await, Some(Seen::Error(-14)));
}

#[tokio::test]
async fn test_no_delay_is_inherited_by_accepted_connections() {
    let h = harness();
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(7305));
    listener.set_no_delay(true);
    assert!(listener.no_delay());
    listener.on_client(move |conn| {
        let _ = tx.send(conn);
    });
    listener.begin().unwrap();

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7305), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    let server = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .ok()
        .flatten()
        .expect("no connection accepted");
    assert!(server.no_delay());
    assert!(!client.no_delay());
}

#[tokio::test]
async fn test_many_clients_are_served() {
    let h = harness();
    let listener = Listener::new(&h.ctx, local(7306));
    listener.on_client(|conn| {
        conn.on_data(|c, data| {
            c.write(data);
        });
    });
    listener.begin().unwrap();

    let mut clients = Vec::new();
    for i in 0..8u8 {
        let client = Connection::new(&h.ctx);
        let rx = record(&client);
        client.connect(local(7306), false).unwrap();
        clients.push((i, client, rx));
    }
    for (i, client, rx) in &mut clients {
        assert_eq!(next(rx).await, Some(Seen::Connect));
        client.write(&[*i]);
    }
    for (i, _, rx) in &mut clients {
        assert_eq!(next_non_ack(rx).await, Some(Seen::Data(vec![*i])));
    }
    assert!(eventually(|| listener.clients().len() == 8).await);

    for (_, client, _) in &clients {
        client.close(false);
    }
    assert!(eventually(|| listener.clients().is_empty()).await);
    for (_, _, rx) in &mut clients {
        let seen = drain(rx, Duration::from_millis(20)).await;
        assert_eq!(seen.iter().filter(|s| **s == Seen::Disconnect).count(), 1);
    }
}

#[tokio::test]
async fn test_end_delivers_accepts_already_queued() {
    let h = harness();
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(7307));
    listener.on_client(move |conn| {
        let _ = tx.send(conn);
    });
    listener.begin().unwrap();

    // Hold the worker inside the first client's connect callback.
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let (held_tx, mut held) = mpsc::unbounded_channel();
    let first = Connection::new(&h.ctx);
    first.on_connect(move |_| {
        let _ = held_tx.send(());
        let _ = release_rx.lock().map(|rx| rx.recv());
    });
    first.connect(local(7307), false).unwrap();
    assert!(tokio::time::timeout(WAIT, held.recv()).await.is_ok());

    let second = Connection::new(&h.ctx);
    let mut rx = record(&second);
    second.connect(local(7307), false).unwrap();
    // listener, first client and its server side, second client and its server side
    assert!(eventually(|| h.ctx.active_bindings() == 5).await);

    listener.end();
    release_tx.send(()).unwrap();

    let mut accepted = Vec::new();
    while let Ok(Some(conn)) = tokio::time::timeout(Duration::from_millis(500), incoming.recv()).await {
        accepted.push(conn);
    }
    assert_eq!(accepted.len(), 2);
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));

    let server = accepted
        .iter()
        .find(|conn| conn.remote_port() == second.local_port())
        .expect("second connection not delivered");
    assert!(server.connected());
    server.close(false);
    assert_eq!(next(&mut rx).await, Some(Seen::Disconnect));
}

#[tokio::test]
async fn test_dropped_listener_still_delivers_queued_accepts() {
    let h = harness();
    let listener = Listener::new(&h.ctx, local(7308));
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counted = calls.clone();
    listener.on_client(move |_| {
        counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    listener.begin().unwrap();

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let (held_tx, mut held) = mpsc::unbounded_channel();
    let first = Connection::new(&h.ctx);
    first.on_connect(move |_| {
        let _ = held_tx.send(());
        let _ = release_rx.lock().map(|rx| rx.recv());
    });
    first.connect(local(7308), false).unwrap();
    assert!(tokio::time::timeout(WAIT, held.recv()).await.is_ok());

    let second = Connection::new(&h.ctx);
    let mut rx = record(&second);
    second.connect(local(7308), false).unwrap();
    assert!(eventually(|| h.ctx.active_bindings() == 5).await);

    listener.end();
    drop(listener);
    release_tx.send(()).unwrap();

    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    assert!(eventually(|| calls.load(std::sync::atomic::Ordering::SeqCst) == 2).await);
}

#[tokio::test]
async fn test_plain_begin_after_secure_end_is_plain() {
    let h = harness();
    let pki = common::pki();
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let listener = Listener::new(&h.ctx, local(7309));
    listener.on_client(move |conn| {
        conn.on_data(|c, data| {
            c.write(data);
        });
        let _ = tx.send(conn);
    });
    listener
        .begin_secure(&async_secure_tcp::ServerCredentials::new(
            pki.server_cert_pem.clone(),
            pki.server_key_pem.clone(),
        ))
        .unwrap();
    listener.end();
    listener.begin().unwrap();

    let client = Connection::new(&h.ctx);
    let mut rx = record(&client);
    client.connect(local(7309), false).unwrap();
    assert_eq!(next(&mut rx).await, Some(Seen::Connect));
    let server = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .ok()
        .flatten()
        .expect("no connection accepted");
    assert!(!server.is_secure());

    client.write(b"plain");
    assert_eq!(next_non_ack(&mut rx).await, Some(Seen::Data(b"plain".to_vec())));
}

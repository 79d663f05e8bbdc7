//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tokio::sync::mpsc;

use async_secure_tcp::config::RuntimeConfig;
use async_secure_tcp::stack::loopback::LoopbackStack;
use async_secure_tcp::{Connection, Context, ManualClock};

/// How long a test waits for an expected callback.
pub const WAIT: Duration = Duration::from_secs(2);

/// One observed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connect,
    Disconnect,
    Data(Vec<u8>),
    Ack(usize),
    Error(i32),
    Timeout(u32),
}

/// Install recording callbacks on `conn`.
pub fn record(conn: &Connection) -> mpsc::UnboundedReceiver<Seen> {
    let (tx, rx) = mpsc::unbounded_channel();

    let t = tx.clone();
    conn.on_connect(move |_| {
        let _ = t.send(Seen::Connect);
    });
    let t = tx.clone();
    conn.on_disconnect(move |_| {
        let _ = t.send(Seen::Disconnect);
    });
    let t = tx.clone();
    conn.on_data(move |_, data| {
        let _ = t.send(Seen::Data(data.to_vec()));
    });
    let t = tx.clone();
    conn.on_ack(move |_, len, _| {
        let _ = t.send(Seen::Ack(len));
    });
    let t = tx.clone();
    conn.on_error(move |_, err| {
        let _ = t.send(Seen::Error(err.code()));
    });
    conn.on_timeout(move |_, waited| {
        let _ = tx.send(Seen::Timeout(waited));
    });
    rx
}

/// Next callback, or `None` after `WAIT`.
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Option<Seen> {
    tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten()
}

/// Skip acks until something else arrives.
pub async fn next_non_ack(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Option<Seen> {
    loop {
        match next(rx).await {
            Some(Seen::Ack(_)) => continue,
            other => return other,
        }
    }
}

/// Everything that arrives within `window`.
pub async fn drain(rx: &mut mpsc::UnboundedReceiver<Seen>, window: Duration) -> Vec<Seen> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        seen.push(event);
    }
    seen
}

/// Wait until `cond` holds, polling briefly.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub struct Harness {
    pub ctx: Context,
    pub stack: Arc<LoopbackStack>,
    pub clock: ManualClock,
}

/// Loopback stack, manual clock, default configuration.
pub fn harness() -> Harness {
    harness_with(RuntimeConfig::default())
}

pub fn harness_with(config: RuntimeConfig) -> Harness {
    let stack = LoopbackStack::new();
    let clock = ManualClock::new(1_000);
    let ctx = Context::with_clock(stack.clone(), config, Arc::new(clock.clone()));
    Harness { ctx, stack, clock }
}

/// PEM material for TLS tests.
pub struct Pki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    /// A CA that did not sign the server certificate.
    pub foreign_ca_pem: String,
}

fn certificate_authority(name: &str) -> (rcgen::Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, name);
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

/// A CA, a `localhost` leaf it signed, and an unrelated CA.
pub fn pki() -> Pki {
    let (ca_cert, ca_key) = certificate_authority("Test Root");
    let (foreign_ca, _) = certificate_authority("Other Root");

    let leaf_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, "localhost");
    let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        server_cert_pem: leaf.pem(),
        server_key_pem: leaf_key.serialize_pem(),
        foreign_ca_pem: foreign_ca.pem(),
    }
}

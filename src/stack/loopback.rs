//! In-process network stack.
//!
//! Connections to a port with a listener are paired inside the process;
//! bytes written on one side arrive as segments on the other. Callbacks run
//! on a dedicated delivery thread that plays the stack context. Polls happen
//! on `tick()` or on an optional timer.
//!
//! Useful knobs for exercising edge cases: a small send buffer, held
//! acknowledgements, injected errors and asynchronous name resolution.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::stack::{
    AcceptEvents, DnsCallback, NetStack, PcbEvents, PcbId, Resolution, Segment, TcpApi, TcpState, WriteFlags,
};

pub const DEFAULT_SEND_BUFFER: usize = 5744;
pub const DEFAULT_MSS: u16 = 1460;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

enum Delivery {
    Connected(PcbId),
    Recv(PcbId, Option<Segment>),
    Sent(PcbId, u16),
    Poll(PcbId),
    /// The handle is already gone, so the callbacks travel with the delivery.
    Error(Arc<dyn PcbEvents>, ErrorCode),
    Accept { listener: PcbId, pcb: PcbId },
    Dns(DnsCallback, Option<Ipv4Addr>),
}

#[derive(Default)]
struct Pcb {
    state: TcpState,
    events: Option<Arc<dyn PcbEvents>>,
    accept: Option<Arc<dyn AcceptEvents>>,
    local: Option<SocketAddrV4>,
    remote: Option<SocketAddrV4>,
    peer: Option<PcbId>,
    staged: Vec<u8>,
    in_flight: usize,
    nodelay: bool,
}

struct Core {
    tx: mpsc::UnboundedSender<Delivery>,
    pcbs: HashMap<PcbId, Pcb>,
    listeners: HashMap<u16, PcbId>,
    hosts: HashMap<String, Ipv4Addr>,
    held_acks: Vec<(PcbId, u16)>,
    next_pcb: u64,
    next_port: u16,
    send_buffer: usize,
    mss: u16,
    auto_ack: bool,
    async_dns: bool,
    recved_total: usize,
}

impl Core {
    fn deliver(&self, delivery: Delivery) {
        // Fails only once the delivery thread is gone.
        let _ = self.tx.send(delivery);
    }

    fn ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.listeners.contains_key(&port) {
                return port;
            }
        }
    }

    fn remove(&mut self, pcb: PcbId) -> Option<Pcb> {
        let removed = self.pcbs.remove(&pcb)?;
        if removed.state == TcpState::Listen {
            if let Some(local) = removed.local {
                self.listeners.remove(&local.port());
            }
        }
        Some(removed)
    }

    fn fail(&mut self, pcb: PcbId, code: ErrorCode) {
        if let Some(removed) = self.remove(pcb) {
            if let Some(events) = removed.events {
                self.deliver(Delivery::Error(events, code));
            }
        }
    }

    fn send_acks(&self, pcb: PcbId, mut len: usize) {
        while len > 0 {
            let chunk = len.min(u16::MAX as usize);
            self.deliver(Delivery::Sent(pcb, chunk as u16));
            len -= chunk;
        }
    }
}

impl TcpApi for Core {
    fn tcp_new(&mut self) -> Option<PcbId> {
        let pcb = PcbId(self.next_pcb);
        self.next_pcb += 1;
        self.pcbs.insert(pcb, Pcb::default());
        Some(pcb)
    }

    fn set_events(&mut self, pcb: PcbId, events: Option<Arc<dyn PcbEvents>>) {
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.events = events;
        }
    }

    fn set_accept(&mut self, pcb: PcbId, accept: Option<Arc<dyn AcceptEvents>>) {
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.accept = accept;
        }
    }

    fn connect(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode> {
        match self.pcbs.get(&pcb) {
            None => return Err(ErrorCode::Arg),
            Some(p) if p.state != TcpState::Closed => return Err(ErrorCode::IsConn),
            Some(_) => {}
        }

        let local = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.ephemeral_port());
        let Some(listener) = self.listeners.get(&addr.port()).copied() else {
            if let Some(p) = self.pcbs.get_mut(&pcb) {
                p.state = TcpState::SynSent;
                p.local = Some(local);
                p.remote = Some(addr);
            }
            self.fail(pcb, ErrorCode::Rst);
            return Ok(());
        };

        let server = PcbId(self.next_pcb);
        self.next_pcb += 1;
        let nodelay = self.pcbs.get(&listener).is_some_and(|l| l.nodelay);
        self.pcbs.insert(
            server,
            Pcb {
                state: TcpState::Established,
                local: Some(addr),
                remote: Some(local),
                peer: Some(pcb),
                nodelay,
                ..Pcb::default()
            },
        );
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.state = TcpState::Established;
            p.local = Some(local);
            p.remote = Some(addr);
            p.peer = Some(server);
        }

        self.deliver(Delivery::Accept { listener, pcb: server });
        self.deliver(Delivery::Connected(pcb));
        Ok(())
    }

    fn bind(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode> {
        if addr.port() != 0 && self.listeners.contains_key(&addr.port()) {
            return Err(ErrorCode::Use);
        }
        let port = match addr.port() {
            0 => self.ephemeral_port(),
            port => port,
        };
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Arg)?;
        p.local = Some(SocketAddrV4::new(*addr.ip(), port));
        Ok(())
    }

    fn listen(&mut self, pcb: PcbId, _backlog: u8) -> Result<PcbId, ErrorCode> {
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Arg)?;
        let local = p.local.ok_or(ErrorCode::Conn)?;
        p.state = TcpState::Listen;
        self.listeners.insert(local.port(), pcb);
        Ok(pcb)
    }

    fn write(&mut self, pcb: PcbId, data: &[u8], _flags: WriteFlags) -> Result<(), ErrorCode> {
        let room = self.sndbuf(pcb);
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Conn)?;
        if p.state != TcpState::Established {
            return Err(ErrorCode::Conn);
        }
        if data.len() > room {
            return Err(ErrorCode::Mem);
        }
        p.staged.extend_from_slice(data);
        Ok(())
    }

    fn output(&mut self, pcb: PcbId) -> Result<(), ErrorCode> {
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Conn)?;
        if p.staged.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut p.staged);
        let len = data.len();
        p.in_flight += len;
        let peer = p.peer;

        if let Some(peer) = peer.filter(|peer| self.pcbs.contains_key(peer)) {
            self.deliver(Delivery::Recv(peer, Some(Segment::new(data))));
        }
        if self.auto_ack {
            self.send_acks(pcb, len);
        } else {
            self.held_acks.push((pcb, len.min(u16::MAX as usize) as u16));
        }
        Ok(())
    }

    fn recved(&mut self, _pcb: PcbId, len: usize) {
        self.recved_total += len;
    }

    fn close(&mut self, pcb: PcbId) -> Result<(), ErrorCode> {
        let Some(removed) = self.remove(pcb) else {
            return Ok(());
        };
        if let Some(peer) = removed.peer.filter(|peer| self.pcbs.contains_key(peer)) {
            if let Some(p) = self.pcbs.get_mut(&peer) {
                p.state = TcpState::CloseWait;
            }
            self.deliver(Delivery::Recv(peer, None));
        }
        Ok(())
    }

    fn abort(&mut self, pcb: PcbId) {
        let peer = self.pcbs.get(&pcb).and_then(|p| p.peer);
        self.fail(pcb, ErrorCode::Abrt);
        if let Some(peer) = peer {
            self.fail(peer, ErrorCode::Rst);
        }
    }

    fn sndbuf(&self, pcb: PcbId) -> usize {
        self.pcbs
            .get(&pcb)
            .map_or(0, |p| self.send_buffer.saturating_sub(p.staged.len() + p.in_flight))
    }

    fn mss(&self, pcb: PcbId) -> u16 {
        if self.pcbs.contains_key(&pcb) {
            self.mss
        } else {
            0
        }
    }

    fn state(&self, pcb: PcbId) -> TcpState {
        self.pcbs.get(&pcb).map_or(TcpState::Closed, |p| p.state)
    }

    fn set_nodelay(&mut self, pcb: PcbId, nodelay: bool) {
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.nodelay = nodelay;
        }
    }

    fn nodelay(&self, pcb: PcbId) -> bool {
        self.pcbs.get(&pcb).is_some_and(|p| p.nodelay)
    }

    fn local_addr(&self, pcb: PcbId) -> Option<SocketAddrV4> {
        self.pcbs.get(&pcb).and_then(|p| p.local)
    }

    fn remote_addr(&self, pcb: PcbId) -> Option<SocketAddrV4> {
        self.pcbs.get(&pcb).and_then(|p| p.remote)
    }
}

/// An in-process stack. See the module docs.
pub struct LoopbackStack {
    core: Mutex<Core>,
}

impl LoopbackStack {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stack = Arc::new(Self {
            core: Mutex::new(Core {
                tx,
                pcbs: HashMap::new(),
                listeners: HashMap::new(),
                hosts: HashMap::new(),
                held_acks: Vec::new(),
                next_pcb: 1,
                next_port: FIRST_EPHEMERAL_PORT,
                send_buffer: DEFAULT_SEND_BUFFER,
                mss: DEFAULT_MSS,
                auto_ack: true,
                async_dns: false,
                recved_total: 0,
            }),
        });

        let weak = Arc::downgrade(&stack);
        let spawned = std::thread::Builder::new()
            .name("loopback-stack".to_string())
            .spawn(move || {
                while let Some(delivery) = rx.blocking_recv() {
                    let Some(stack) = weak.upgrade() else {
                        break;
                    };
                    stack.run(delivery);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start loopback delivery thread");
        }
        stack
    }

    /// Poll every connection each `interval` until the stack is dropped.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("loopback-poll".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                match weak.upgrade() {
                    Some(stack) => stack.tick(),
                    None => break,
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start loopback poller");
        }
    }

    /// Deliver one poll to every connection with callbacks attached.
    pub fn tick(&self) {
        let core = self.core.lock();
        for (pcb, p) in &core.pcbs {
            if p.events.is_some() && p.state != TcpState::Listen {
                core.deliver(Delivery::Poll(*pcb));
            }
        }
    }

    /// Send window for every handle, including ones already open.
    pub fn set_send_buffer(&self, bytes: usize) {
        self.core.lock().send_buffer = bytes;
    }

    /// When off, acknowledgements wait for `release_acks`.
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.core.lock().auto_ack = auto_ack;
    }

    /// Acknowledge everything sent while auto-ack was off.
    pub fn release_acks(&self) {
        let mut core = self.core.lock();
        for (pcb, len) in std::mem::take(&mut core.held_acks) {
            if core.pcbs.contains_key(&pcb) {
                core.deliver(Delivery::Sent(pcb, len));
            }
        }
    }

    pub fn add_host(&self, name: &str, addr: Ipv4Addr) {
        self.core.lock().hosts.insert(name.to_string(), addr);
    }

    /// Answer every lookup through the callback instead of synchronously.
    pub fn set_async_dns(&self, async_dns: bool) {
        self.core.lock().async_dns = async_dns;
    }

    /// Fail a handle as if the network reported `code`.
    pub fn inject_error(&self, pcb: PcbId, code: ErrorCode) {
        self.core.lock().fail(pcb, code);
    }

    /// Total bytes acknowledged through `recved`.
    pub fn recved_total(&self) -> usize {
        self.core.lock().recved_total
    }

    /// Handles that still exist, listeners included.
    pub fn open_handles(&self) -> usize {
        self.core.lock().pcbs.len()
    }

    /// Handles currently connected to a peer, oldest first.
    pub fn connected_handles(&self) -> Vec<PcbId> {
        let core = self.core.lock();
        let mut pcbs: Vec<PcbId> = core
            .pcbs
            .iter()
            .filter(|(_, p)| p.peer.is_some())
            .map(|(pcb, _)| *pcb)
            .collect();
        pcbs.sort_by_key(|pcb| pcb.0);
        pcbs
    }

    fn events_of(&self, pcb: PcbId) -> Option<Arc<dyn PcbEvents>> {
        self.core.lock().pcbs.get(&pcb).and_then(|p| p.events.clone())
    }

    fn run(&self, delivery: Delivery) {
        match delivery {
            Delivery::Connected(pcb) => {
                if let Some(events) = self.events_of(pcb) {
                    events.connected(pcb);
                }
            }
            Delivery::Recv(pcb, segment) => {
                if let Some(events) = self.events_of(pcb) {
                    events.recv(pcb, segment);
                }
            }
            Delivery::Sent(pcb, len) => {
                let events = {
                    let mut core = self.core.lock();
                    core.pcbs.get_mut(&pcb).and_then(|p| {
                        p.in_flight = p.in_flight.saturating_sub(len as usize);
                        p.events.clone()
                    })
                };
                if let Some(events) = events {
                    events.sent(pcb, len);
                }
            }
            Delivery::Poll(pcb) => {
                if let Some(events) = self.events_of(pcb) {
                    events.poll(pcb);
                }
            }
            Delivery::Error(events, code) => events.error(code),
            Delivery::Accept { listener, pcb } => {
                let accept = self.core.lock().pcbs.get(&listener).and_then(|p| p.accept.clone());
                match accept {
                    Some(accept) => accept.accept(Ok(pcb)),
                    None => self.core.lock().abort(pcb),
                }
            }
            Delivery::Dns(found, addr) => found(addr),
        }
    }
}

impl NetStack for LoopbackStack {
    fn api_call(&self, call: &mut dyn FnMut(&mut dyn TcpApi)) {
        let mut core = self.core.lock();
        call(&mut *core);
    }

    fn resolve(&self, host: &str, found: DnsCallback) -> Resolution {
        if host.is_empty() {
            return Resolution::Failed(ErrorCode::Arg);
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Resolution::Ready(ip);
        }
        let core = self.core.lock();
        match core.hosts.get(host).copied() {
            Some(ip) if !core.async_dns => Resolution::Ready(ip),
            known => {
                core.deliver(Delivery::Dns(found, known));
                Resolution::Pending
            }
        }
    }
}

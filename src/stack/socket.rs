//! Network stack over real sockets.
//!
//! # Responsibilities
//! - Own a single-threaded tokio runtime that plays the stack context
//! - Map raw-handle primitives onto tokio TCP streams and listeners
//! - Report connection events through the attached stubs, from that thread
//!
//! # Design Decisions
//! - Every stub call happens on the runtime thread with the core unlocked,
//!   so stubs may call back into `api_call`
//! - A per-connection receive window is only reopened by `recved`, which
//!   gives deferred acknowledgement real backpressure
//! - I/O tasks for an accepted stream start once callbacks are attached

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;

use crate::error::{io_error_code, ErrorCode};
use crate::stack::{
    AcceptEvents, DnsCallback, NetStack, PcbEvents, PcbId, Resolution, Segment, TcpApi, TcpState, WriteFlags,
};

pub const SEND_BUFFER: usize = 5744;
pub const RECEIVE_WINDOW: usize = 5744;
pub const DEFAULT_MSS: u16 = 1460;
pub const POLL_INTERVAL: Duration = Duration::from_millis(125);

enum WriterCmd {
    Data(Bytes),
    NoDelay(bool),
    /// Drop the connection with a reset instead of a FIN.
    Reset,
}

/// Receive credit, consumed by reads and returned by `recved`.
struct RxWindow {
    available: AtomicUsize,
    notify: Notify,
}

impl RxWindow {
    fn new() -> Self {
        Self {
            available: AtomicUsize::new(RECEIVE_WINDOW),
            notify: Notify::new(),
        }
    }

    async fn credit(&self) -> usize {
        loop {
            let available = self.available.load(Ordering::Acquire);
            if available > 0 {
                return available;
            }
            self.notify.notified().await;
        }
    }

    fn consume(&self, n: usize) {
        self.available.fetch_sub(n, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        let _ = self.available.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((cur + n).min(RECEIVE_WINDOW))
        });
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct Pcb {
    state: TcpState,
    events: Option<Arc<dyn PcbEvents>>,
    accept: Option<Arc<dyn AcceptEvents>>,
    bound: Option<Socket>,
    local: Option<SocketAddrV4>,
    remote: Option<SocketAddrV4>,
    nodelay: bool,
    /// Accepted stream waiting for callbacks before its tasks start.
    pending: Option<TcpStream>,
    staged: Vec<u8>,
    in_flight: Arc<AtomicUsize>,
    window: Option<Arc<RxWindow>>,
    writer: Option<mpsc::UnboundedSender<WriterCmd>>,
    writer_task: Option<AbortHandle>,
    tasks: Vec<AbortHandle>,
}

impl Pcb {
    /// Stop everything but the writer, which exits once its channel closes.
    fn abort_readers(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn abort_tasks(&mut self) {
        self.abort_readers();
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

fn v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

struct Shared {
    core: Mutex<Core>,
    handle: Handle,
}

struct Core {
    this: Weak<Shared>,
    handle: Handle,
    pcbs: HashMap<PcbId, Pcb>,
    next_pcb: u64,
}

impl Shared {
    fn events_of(&self, pcb: PcbId) -> Option<Arc<dyn PcbEvents>> {
        self.core.lock().pcbs.get(&pcb).and_then(|p| p.events.clone())
    }

    /// Drop the handle and report `code` through its callbacks.
    fn fail(&self, pcb: PcbId, code: ErrorCode) {
        let events = {
            let mut core = self.core.lock();
            core.pcbs.remove(&pcb).and_then(|mut p| {
                p.abort_tasks();
                p.events
            })
        };
        if let Some(events) = events {
            events.error(code);
        }
    }
}

impl Core {
    fn insert(&mut self, pcb: Pcb) -> PcbId {
        let id = PcbId(self.next_pcb);
        self.next_pcb += 1;
        self.pcbs.insert(id, pcb);
        id
    }

    /// Start reader, writer and poller once both a stream and callbacks exist.
    fn start_io(&mut self, id: PcbId) {
        let Some(pcb) = self.pcbs.get_mut(&id) else {
            return;
        };
        if pcb.events.is_none() {
            return;
        }
        let Some(stream) = pcb.pending.take() else {
            return;
        };
        let _ = stream.set_nodelay(pcb.nodelay);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Arc::new(RxWindow::new());

        pcb.state = TcpState::Established;
        pcb.writer = Some(tx);
        pcb.window = Some(window.clone());

        let shared = self.this.clone();
        let in_flight = pcb.in_flight.clone();
        pcb.tasks.push(self.handle.spawn(read_loop(shared.clone(), id, reader, window)).abort_handle());
        pcb.writer_task = Some(self.handle.spawn(write_loop(shared.clone(), id, writer, rx, in_flight)).abort_handle());
        pcb.tasks.push(self.handle.spawn(poll_loop(shared, id)).abort_handle());
    }

    /// Report an error from the runtime thread rather than the caller's.
    fn fail_later(&self, events: Arc<dyn PcbEvents>, code: ErrorCode) {
        self.handle.spawn(async move { events.error(code) });
    }
}

impl TcpApi for Core {
    fn tcp_new(&mut self) -> Option<PcbId> {
        Some(self.insert(Pcb::default()))
    }

    fn set_events(&mut self, pcb: PcbId, events: Option<Arc<dyn PcbEvents>>) {
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.events = events;
        }
        self.start_io(pcb);
    }

    fn set_accept(&mut self, pcb: PcbId, accept: Option<Arc<dyn AcceptEvents>>) {
        if let Some(p) = self.pcbs.get_mut(&pcb) {
            p.accept = accept;
        }
    }

    fn connect(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode> {
        let shared = self.this.clone();
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Arg)?;
        if p.state != TcpState::Closed {
            return Err(ErrorCode::IsConn);
        }
        p.state = TcpState::SynSent;
        p.remote = Some(addr);

        let task = self.handle.spawn(async move {
            let result = TcpStream::connect(addr).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match result {
                Ok(stream) => {
                    let events = {
                        let mut core = shared.core.lock();
                        let Some(p) = core.pcbs.get_mut(&pcb) else {
                            return;
                        };
                        p.local = stream.local_addr().ok().and_then(v4);
                        p.pending = Some(stream);
                        core.start_io(pcb);
                        core.pcbs.get(&pcb).and_then(|p| p.events.clone())
                    };
                    if let Some(events) = events {
                        events.connected(pcb);
                    }
                }
                Err(e) => shared.fail(pcb, io_error_code(&e)),
            }
        });
        p.tasks.push(task.abort_handle());
        Ok(())
    }

    fn bind(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode> {
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Arg)?;
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|e| io_error_code(&e))?;
        socket.set_reuse_address(true).map_err(|e| io_error_code(&e))?;
        socket.bind(&SocketAddr::V4(addr).into()).map_err(|e| io_error_code(&e))?;
        p.local = socket.local_addr().ok().and_then(|a| a.as_socket()).and_then(v4);
        p.bound = Some(socket);
        Ok(())
    }

    fn listen(&mut self, pcb: PcbId, backlog: u8) -> Result<PcbId, ErrorCode> {
        let shared = self.this.clone();
        let handle = self.handle.clone();
        let p = self.pcbs.get_mut(&pcb).ok_or(ErrorCode::Arg)?;
        let socket = p.bound.take().ok_or(ErrorCode::Conn)?;
        socket.listen(i32::from(backlog)).map_err(|e| io_error_code(&e))?;
        socket.set_nonblocking(true).map_err(|e| io_error_code(&e))?;

        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(socket.into()).map_err(|e| io_error_code(&e))?
        };
        p.state = TcpState::Listen;
        let task = handle.spawn(accept_loop(shared, pcb, listener));
        p.tasks.push(task.abort_handle());
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
        let writer = p.writer.as_ref().ok_or(ErrorCode::Conn)?;
        let data = Bytes::from(std::mem::take(&mut p.staged));
        p.in_flight.fetch_add(data.len(), Ordering::AcqRel);
        writer.send(WriterCmd::Data(data)).map_err(|_| ErrorCode::Clsd)
    }

    fn recved(&mut self, pcb: PcbId, len: usize) {
        if let Some(window) = self.pcbs.get(&pcb).and_then(|p| p.window.as_ref()) {
            window.release(len);
        }
    }

    fn close(&mut self, pcb: PcbId) -> Result<(), ErrorCode> {
        let Some(mut p) = self.pcbs.remove(&pcb) else {
            return Ok(());
        };
        // Dropping the writer channel lets queued data drain before the FIN.
        p.writer = None;
        p.abort_readers();
        Ok(())
    }

    fn abort(&mut self, pcb: PcbId) {
        let Some(mut p) = self.pcbs.remove(&pcb) else {
            return;
        };
        if let Some(writer) = p.writer.take() {
            let _ = writer.send(WriterCmd::Reset);
        }
        p.abort_readers();
        if let Some(events) = p.events.take() {
            self.fail_later(events, ErrorCode::Abrt);
        }
    }

    fn sndbuf(&self, pcb: PcbId) -> usize {
        self.pcbs.get(&pcb).map_or(0, |p| {
            SEND_BUFFER.saturating_sub(p.staged.len() + p.in_flight.load(Ordering::Acquire))
        })
    }

    fn mss(&self, pcb: PcbId) -> u16 {
        if self.pcbs.contains_key(&pcb) {
            DEFAULT_MSS
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
            if let Some(writer) = &p.writer {
                let _ = writer.send(WriterCmd::NoDelay(nodelay));
            }
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

async fn accept_loop(shared: Weak<Shared>, listener_pcb: PcbId, listener: TcpListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let (accept, result) = {
            let mut core = shared.core.lock();
            let accept = core.pcbs.get(&listener_pcb).and_then(|p| p.accept.clone());
            let result = match accepted {
                Ok((stream, peer)) => {
                    let nodelay = core.pcbs.get(&listener_pcb).is_some_and(|p| p.nodelay);
                    let local = stream.local_addr().ok().and_then(v4);
                    Ok(core.insert(Pcb {
                        state: TcpState::SynReceived,
                        local,
                        remote: v4(peer),
                        nodelay,
                        pending: Some(stream),
                        ..Pcb::default()
                    }))
                }
                Err(e) => Err(io_error_code(&e)),
            };
            (accept, result)
        };

        match accept {
            Some(accept) => accept.accept(result),
            None => {
                if let Ok(pcb) = result {
                    shared.core.lock().pcbs.remove(&pcb);
                }
            }
        }
    }
}

async fn read_loop(shared: Weak<Shared>, pcb: PcbId, mut reader: OwnedReadHalf, window: Arc<RxWindow>) {
    let mut buf = vec![0u8; 2 * DEFAULT_MSS as usize];
    loop {
        let credit = window.credit().await;
        let max = credit.min(buf.len());
        let read = reader.read(&mut buf[..max]).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match read {
            Ok(0) => {
                let events = {
                    let mut core = shared.core.lock();
                    core.pcbs.get_mut(&pcb).and_then(|p| {
                        p.state = TcpState::CloseWait;
                        p.events.clone()
                    })
                };
                if let Some(events) = events {
                    events.recv(pcb, None);
                }
                return;
            }
            Ok(n) => {
                window.consume(n);
                if let Some(events) = shared.events_of(pcb) {
                    events.recv(pcb, Some(Segment::new(Bytes::copy_from_slice(&buf[..n]))));
                }
            }
            Err(e) => {
                shared.fail(pcb, io_error_code(&e));
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Weak<Shared>,
    pcb: PcbId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    in_flight: Arc<AtomicUsize>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Data(data) => {
                let result = writer.write_all(&data).await;
                in_flight.fetch_sub(data.len(), Ordering::AcqRel);
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if let Err(e) = result {
                    shared.fail(pcb, io_error_code(&e));
                    return;
                }
                if let Some(events) = shared.events_of(pcb) {
                    let mut left = data.len();
                    while left > 0 {
                        let chunk = left.min(u16::MAX as usize);
                        events.sent(pcb, chunk as u16);
                        left -= chunk;
                    }
                }
            }
            WriterCmd::NoDelay(on) => {
                let _ = writer.as_ref().set_nodelay(on);
            }
            WriterCmd::Reset => {
                let _ = SockRef::from(writer.as_ref()).set_linger(Some(Duration::ZERO));
                writer.forget();
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn poll_loop(shared: Weak<Shared>, pcb: PcbId) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.events_of(pcb) {
            Some(events) => events.poll(pcb),
            None => {
                if !shared.core.lock().pcbs.contains_key(&pcb) {
                    return;
                }
            }
        }
    }
}

/// A stack over real sockets, driven by one runtime thread.
pub struct SocketStack {
    shared: Arc<Shared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketStack {
    pub fn new() -> io::Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("socket-stack".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!("Socket stack stopped");
            })?;

        let shared = Arc::new_cyclic(|this| Shared {
            core: Mutex::new(Core {
                this: this.clone(),
                handle: handle.clone(),
                pcbs: HashMap::new(),
                next_pcb: 1,
            }),
            handle,
        });

        Ok(Arc::new(Self {
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }
}

impl Drop for SocketStack {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
            tracing::error!("Socket stack thread panicked");
        }
    }
}

impl NetStack for SocketStack {
    fn api_call(&self, call: &mut dyn FnMut(&mut dyn TcpApi)) {
        let mut core = self.shared.core.lock();
        call(&mut *core);
    }

    fn resolve(&self, host: &str, found: DnsCallback) -> Resolution {
        if host.is_empty() {
            return Resolution::Failed(ErrorCode::Arg);
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Resolution::Ready(ip);
        }
        let host = host.to_string();
        self.shared.handle.spawn(async move {
            let addr = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(mut addrs) => addrs.find_map(|a| v4(a).map(|v| *v.ip())),
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "Lookup failed");
                    None
                }
            };
            found(addr);
        });
        Resolution::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack;

    #[test]
    fn bind_and_listen_on_an_ephemeral_port() {
        let sockets = SocketStack::new().unwrap();
        let (state, port) = stack::call(sockets.as_ref(), |api| {
            let pcb = api.tcp_new().unwrap();
            api.bind(pcb, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
            let pcb = api.listen(pcb, 5).unwrap();
            (api.state(pcb), api.local_addr(pcb).map_or(0, |a| a.port()))
        })
        .unwrap();
        assert_eq!(state, TcpState::Listen);
        assert_ne!(port, 0);
    }

    #[test]
    fn unknown_handles_report_empty_values() {
        let sockets = SocketStack::new().unwrap();
        let outcome = stack::call(sockets.as_ref(), |api| {
            let pcb = PcbId(999);
            (api.sndbuf(pcb), api.mss(pcb), api.state(pcb), api.output(pcb))
        });
        assert_eq!(outcome, Some((0, 0, TcpState::Closed, Err(ErrorCode::Conn))));
    }
}

//! Connection state machine.
//!
//! # Responsibilities
//! - Bind a `Connection` to a raw handle (outbound connect or accept)
//! - Translate worker events into user callbacks, in stack order
//! - Wrap the raw send path in TLS for secure connections
//! - Enforce ack, idle and handshake timeouts on each poll tick
//!
//! # Design Decisions
//! - `Connection` is a cheap handle; while bound, the context registry keeps
//!   the binding alive so queued events always find their target
//! - Callbacks run on the worker with no internal lock held, so handlers may
//!   call back into the same connection
//! - The disconnect callback fires at most once per binding

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ServerConfig;

use crate::error::{ConnectionError, Error, ErrorCode};
use crate::net::context::Context;
use crate::net::event::{CorrelationId, Event, EventKind, EventSink};
use crate::net::raw::{guarded, ConnectionStub, RawHandle, RawTransmit};
use crate::net::tls::{
    server_name_for, ClientCredentials, PskCredentials, TlsOutput, TlsSession, TLS_HANDSHAKE_TIMEOUT_MS,
};
use crate::observability::metrics;
use crate::stack::{self, PcbEvents, PcbId, Resolution, Segment, TcpState, WriteFlags};

pub type ConnectHandler = Arc<dyn Fn(&Connection) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Receives the acknowledged length and the milliseconds since the last send.
pub type AckHandler = Arc<dyn Fn(&Connection, usize, u32) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Connection, ConnectionError) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&Connection, &[u8]) + Send + Sync>;
/// Takes ownership of a raw received segment.
pub type PacketHandler = Arc<dyn Fn(&Connection, Segment) + Send + Sync>;
/// Receives the milliseconds waited for the missing acknowledgement.
pub type TimeoutHandler = Arc<dyn Fn(&Connection, u32) + Send + Sync>;
pub type PollHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
    ack: Option<AckHandler>,
    error: Option<ErrorHandler>,
    data: Option<DataHandler>,
    packet: Option<PacketHandler>,
    timeout: Option<TimeoutHandler>,
    poll: Option<PollHandler>,
}

struct ConnState {
    raw: Option<RawHandle>,
    binding: Option<CorrelationId>,
    accepted_by: Option<CorrelationId>,
    peer: Option<SocketAddrV4>,
    hostname: Option<String>,
    /// Port remembered while name resolution is in flight.
    pending_port: u16,
    resolving: bool,
    secure: bool,
    handshake_done: bool,
    tls: Option<TlsSession>,
    credentials: ClientCredentials,
    busy: bool,
    sent_at: u64,
    rx_last_packet: u64,
    rx_ack_len: usize,
    ack_pcb: bool,
    ack_timeout_ms: u32,
    rx_timeout_secs: u32,
    no_delay: bool,
    disconnect_armed: bool,
}

impl ConnState {
    /// The raw handle, if it is the one `pcb` names.
    fn raw_for(&self, pcb: PcbId) -> Option<RawHandle> {
        self.raw.filter(|raw| raw.pcb == pcb)
    }
}

/// Coarse lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No raw handle and nothing in flight.
    Idle,
    /// Waiting for name resolution.
    Resolving,
    /// Raw handle exists, TCP not yet established.
    Connecting,
    /// TCP established, TLS handshake still running.
    Handshaking,
    Established,
    /// Shutting down, or aborted and waiting for the stack to confirm.
    Closing,
}

/// What the caller must do once the state lock is released.
#[must_use]
struct Teardown {
    binding: Option<CorrelationId>,
    disconnect: bool,
}

struct ConnInner {
    ctx: Context,
    state: Mutex<ConnState>,
    callbacks: Mutex<Callbacks>,
}

/// An asynchronous TCP connection, plain or TLS.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Create an unbound connection using the context's TCP defaults.
    pub fn new(ctx: &Context) -> Self {
        let tcp = &ctx.config().tcp;
        Self {
            inner: Arc::new(ConnInner {
                ctx: ctx.clone(),
                state: Mutex::new(ConnState {
                    raw: None,
                    binding: None,
                    accepted_by: None,
                    peer: None,
                    hostname: None,
                    pending_port: 0,
                    resolving: false,
                    secure: false,
                    handshake_done: true,
                    tls: None,
                    credentials: ClientCredentials::default(),
                    busy: false,
                    sent_at: 0,
                    rx_last_packet: 0,
                    rx_ack_len: 0,
                    ack_pcb: true,
                    ack_timeout_ms: tcp.ack_timeout_ms,
                    rx_timeout_secs: tcp.rx_timeout_secs,
                    no_delay: tcp.no_delay,
                    disconnect_armed: false,
                }),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Wrap a raw handle the stack just accepted. Runs on the stack context.
    pub(crate) fn accepted(
        ctx: &Context,
        pcb: PcbId,
        listener: CorrelationId,
        no_delay: bool,
        server_tls: Option<Arc<ServerConfig>>,
    ) -> Option<Self> {
        let tls = match server_tls {
            Some(config) => match TlsSession::begin_server(config) {
                Ok(session) => Some(session),
                Err(code) => {
                    tracing::warn!(%pcb, %listener, error = %code, "Rejecting accepted connection, TLS setup failed");
                    return None;
                }
            },
            None => None,
        };

        let conn = Connection::new(ctx);
        let binding = ctx.next_binding();
        let slot = ctx.slots().allocate();
        if slot.is_none() {
            tracing::warn!(%binding, "Slot registry exhausted, accepted connection runs unguarded");
            metrics::record_slot_exhausted();
        }

        let peer = stack::call(ctx.stack().as_ref(), |api| api.remote_addr(pcb)).flatten();
        {
            let mut st = conn.inner.state.lock();
            st.raw = Some(RawHandle { pcb, slot });
            st.binding = Some(binding);
            st.accepted_by = Some(listener);
            st.peer = peer;
            st.secure = tls.is_some();
            st.handshake_done = tls.is_none();
            st.tls = tls;
            st.rx_last_packet = ctx.now_ms();
            st.no_delay = no_delay;
            st.disconnect_armed = true;
        }

        ctx.register(binding, Arc::new(conn.clone()));
        let stub: Arc<dyn PcbEvents> = Arc::new(ConnectionStub::new(ctx.downgrade(), binding, slot));
        stack::call(ctx.stack().as_ref(), |api| {
            api.set_events(pcb, Some(stub));
            api.set_nodelay(pcb, no_delay);
        });

        tracing::debug!(%binding, %pcb, %listener, peer = ?peer, "Connection accepted");
        Some(conn)
    }

    fn ctx(&self) -> &Context {
        &self.inner.ctx
    }

    /// Correlation id of the current binding, if bound.
    pub fn binding(&self) -> Option<CorrelationId> {
        self.inner.state.lock().binding
    }

    /// True when this connection is the secure variant.
    pub fn is_secure(&self) -> bool {
        self.inner.state.lock().secure
    }

    // ---- Credentials -------------------------------------------------------

    /// Trust anchor for verifying the server. Without one, any certificate is accepted.
    pub fn set_root_ca(&self, pem: impl Into<Vec<u8>>) {
        self.inner.state.lock().credentials.root_ca = Some(pem.into());
    }

    /// Client certificate chain. Needs a matching `set_client_key`.
    pub fn set_client_cert(&self, pem: impl Into<Vec<u8>>) {
        self.inner.state.lock().credentials.client_cert = Some(pem.into());
    }

    pub fn set_client_key(&self, pem: impl Into<Vec<u8>>) {
        self.inner.state.lock().credentials.client_key = Some(pem.into());
    }

    /// Select pre-shared-key mode. The secret is hex-encoded.
    pub fn set_psk(&self, identity: &str, hex_secret: &str) -> Result<(), Error> {
        let psk = PskCredentials::new(identity, hex_secret)?;
        self.inner.state.lock().credentials.psk = Some(psk);
        Ok(())
    }

    // ---- Connect / close ---------------------------------------------------

    /// Start connecting to `addr`. Completion is reported through callbacks.
    pub fn connect(&self, addr: SocketAddrV4, secure: bool) -> Result<(), Error> {
        let mut st = self.inner.state.lock();
        if st.raw.is_some() || st.binding.is_some() {
            tracing::warn!(binding = ?st.binding, "connect() on a connection that is already bound");
            return Err(Error::AlreadyConnected);
        }
        self.ctx().ensure_worker()?;
        st.hostname = None;
        self.connect_locked(&mut st, None, addr, secure)
    }

    /// Resolve `host` and connect. A literal address skips resolution.
    pub fn connect_host(&self, host: &str, port: u16, secure: bool) -> Result<(), Error> {
        let mut st = self.inner.state.lock();
        if st.raw.is_some() || st.binding.is_some() {
            tracing::warn!(binding = ?st.binding, host, "connect() on a connection that is already bound");
            return Err(Error::AlreadyConnected);
        }
        let ctx = self.ctx().clone();
        ctx.ensure_worker()?;

        let binding = ctx.next_binding();
        ctx.register(binding, Arc::new(self.clone()));

        let weak = ctx.downgrade();
        let name = host.to_string();
        let found = Box::new(move |addr: Option<Ipv4Addr>| {
            if let Some(ctx) = weak.upgrade() {
                ctx.post(Event::new(binding, EventKind::NameResolved { host: name, addr }));
            }
        });

        st.hostname = Some(host.to_string());
        match ctx.stack().resolve(host, found) {
            Resolution::Ready(ip) => self.connect_locked(&mut st, Some(binding), SocketAddrV4::new(ip, port), secure),
            Resolution::Pending => {
                tracing::debug!(%binding, host, port, "Name resolution pending");
                st.binding = Some(binding);
                st.pending_port = port;
                st.resolving = true;
                st.secure = secure;
                Ok(())
            }
            Resolution::Failed(code) => {
                ctx.deregister(binding);
                tracing::error!(host, error = %code, "Name resolution could not start");
                Err(Error::Resolve {
                    host: host.to_string(),
                    code,
                })
            }
        }
    }

    fn connect_locked(
        &self,
        st: &mut ConnState,
        binding: Option<CorrelationId>,
        addr: SocketAddrV4,
        secure: bool,
    ) -> Result<(), Error> {
        let ctx = self.ctx();
        let binding = binding.unwrap_or_else(|| ctx.next_binding());
        ctx.register(binding, Arc::new(self.clone()));

        let slot = ctx.slots().allocate();
        if slot.is_none() {
            tracing::warn!(%binding, "Slot registry exhausted, connection runs unguarded");
            metrics::record_slot_exhausted();
        }

        let stub: Arc<dyn PcbEvents> = Arc::new(ConnectionStub::new(ctx.downgrade(), binding, slot));
        let no_delay = st.no_delay;
        let result = stack::call(ctx.stack().as_ref(), |api| {
            let pcb = api.tcp_new().ok_or(Error::NoPcb)?;
            api.set_events(pcb, Some(stub));
            api.set_nodelay(pcb, no_delay);
            if let Err(code) = api.connect(pcb, addr) {
                api.set_events(pcb, None);
                if api.close(pcb).is_err() {
                    api.abort(pcb);
                }
                return Err(Error::Stack(code));
            }
            Ok(pcb)
        })
        .unwrap_or(Err(Error::Stack(ErrorCode::If)));

        let pcb = match result {
            Ok(pcb) => pcb,
            Err(e) => {
                ctx.deregister(binding);
                if let Some(slot) = slot {
                    ctx.slots().reclaim(slot);
                }
                st.binding = None;
                tracing::error!(%addr, error = %e, "Connect failed");
                return Err(e);
            }
        };

        st.raw = Some(RawHandle { pcb, slot });
        st.binding = Some(binding);
        st.accepted_by = None;
        st.peer = Some(addr);
        st.secure = secure;
        st.handshake_done = !secure;
        st.tls = None;
        st.busy = false;
        st.rx_ack_len = 0;
        st.rx_last_packet = ctx.now_ms();
        st.disconnect_armed = true;

        tracing::debug!(%binding, %pcb, %addr, secure, "Connecting");
        Ok(())
    }

    /// Close gracefully: release deferred acks, then the raw handle.
    ///
    /// Pending writes are not flushed first; `_now` is kept for API symmetry.
    pub fn close(&self, _now: bool) {
        let mut st = self.inner.state.lock();
        if let Some(raw) = st.raw {
            if st.rx_ack_len > 0 {
                let len = st.rx_ack_len;
                let _ = guarded(self.ctx(), raw, |api, pcb| {
                    api.recved(pcb, len);
                    Ok(())
                });
            }
        }
        st.rx_ack_len = 0;
        let teardown = self.close_locked(&mut st, "local");
        drop(st);
        self.finish(teardown);
    }

    /// Same as `close(false)`.
    pub fn stop(&self) {
        self.close(false);
    }

    /// Forcefully terminate. The stack reports the abort through `on_error`
    /// followed by `on_disconnect`.
    pub fn abort(&self) {
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw.take() else {
            return;
        };
        if let Some(mut tls) = st.tls.take() {
            tls.teardown(None);
        }
        let _ = guarded(self.ctx(), raw, |api, pcb| {
            api.abort(pcb);
            Ok(())
        });
        metrics::record_close("abort");
        tracing::debug!(binding = ?st.binding, pcb = %raw.pcb, "Connection aborted");
    }

    fn close_locked(&self, st: &mut ConnState, reason: &'static str) -> Teardown {
        st.resolving = false;
        let binding = st.binding.take();
        let Some(raw) = st.raw.take() else {
            return Teardown {
                binding,
                disconnect: std::mem::take(&mut st.disconnect_armed),
            };
        };
        let ctx = self.ctx();

        stack::call(ctx.stack().as_ref(), |api| api.set_events(raw.pcb, None));
        if let Some(mut tls) = st.tls.take() {
            let mut transmit = RawTransmit { ctx, raw };
            tls.teardown(Some(&mut transmit));
        }
        if guarded(ctx, raw, |api, pcb| api.close(pcb)).is_err() {
            let _ = guarded(ctx, raw, |api, pcb| {
                api.abort(pcb);
                Ok(())
            });
        }
        if let Some(slot) = raw.slot {
            ctx.slots().reclaim(slot);
        }
        st.busy = false;

        metrics::record_close(reason);
        tracing::debug!(binding = ?binding, pcb = %raw.pcb, reason, "Connection closed");
        Teardown {
            binding,
            disconnect: std::mem::take(&mut st.disconnect_armed),
        }
    }

    fn finish(&self, teardown: Teardown) {
        if let Some(binding) = teardown.binding {
            self.ctx().clear_pending(binding);
        }
        if teardown.disconnect {
            self.fire_disconnect();
        }
    }

    // ---- Send path ---------------------------------------------------------

    /// Queue up to `space()` bytes without transmitting. Returns bytes taken.
    pub fn add(&self, data: &[u8], flags: WriteFlags) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw else {
            return 0;
        };
        let room = self.space_of(raw);
        if room == 0 {
            return 0;
        }

        if st.secure {
            let Some(tls) = st.tls.as_mut() else {
                return 0;
            };
            let mut transmit = RawTransmit { ctx: self.ctx(), raw };
            return match tls.encrypt_and_send(data, &mut transmit) {
                Ok(accepted) => accepted,
                Err(code) => {
                    tracing::info!(binding = ?st.binding, error = %code, "TLS write failed, closing");
                    let teardown = self.close_locked(&mut st, "tls_write");
                    drop(st);
                    self.finish(teardown);
                    0
                }
            };
        }

        let will_send = room.min(data.len());
        match guarded(self.ctx(), raw, |api, pcb| api.write(pcb, &data[..will_send], flags)) {
            Ok(()) => will_send,
            Err(code) => {
                tracing::debug!(binding = ?st.binding, error = %code, "Write refused");
                0
            }
        }
    }

    /// Push queued bytes onto the wire and start the ack timer.
    pub fn send(&self) -> bool {
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw else {
            return false;
        };
        match guarded(self.ctx(), raw, |api, pcb| api.output(pcb)) {
            Ok(()) => {
                st.busy = true;
                st.sent_at = self.ctx().now_ms();
                true
            }
            Err(_) => false,
        }
    }

    /// `add` followed by `send`. Returns 0 when either step fails.
    pub fn write(&self, data: &[u8]) -> usize {
        self.write_with(data, WriteFlags::COPY)
    }

    pub fn write_with(&self, data: &[u8], flags: WriteFlags) -> usize {
        let written = self.add(data, flags);
        if written == 0 || !self.send() {
            return 0;
        }
        written
    }

    // ---- Receive flow control ----------------------------------------------

    /// Acknowledge up to `len` deferred bytes. Returns the amount acknowledged.
    pub fn ack(&self, len: usize) -> usize {
        let mut st = self.inner.state.lock();
        let len = len.min(st.rx_ack_len);
        if len == 0 {
            return 0;
        }
        if let Some(raw) = st.raw {
            let _ = guarded(self.ctx(), raw, |api, pcb| {
                api.recved(pcb, len);
                Ok(())
            });
        }
        st.rx_ack_len -= len;
        len
    }

    /// Called from a data handler: leave the current segment unacknowledged.
    pub fn ack_later(&self) {
        self.inner.state.lock().ack_pcb = false;
    }

    /// Acknowledge a segment taken through the packet handler.
    pub fn ack_packet(&self, segment: &Segment) {
        let st = self.inner.state.lock();
        if let Some(raw) = st.raw {
            let len = segment.len();
            let _ = guarded(self.ctx(), raw, |api, pcb| {
                api.recved(pcb, len);
                Ok(())
            });
        }
    }

    // ---- Tuning ------------------------------------------------------------

    pub fn set_ack_timeout(&self, timeout_ms: u32) {
        self.inner.state.lock().ack_timeout_ms = timeout_ms;
    }

    pub fn ack_timeout(&self) -> u32 {
        self.inner.state.lock().ack_timeout_ms
    }

    /// Idle timeout in seconds. Zero disables it.
    pub fn set_rx_timeout(&self, timeout_secs: u32) {
        self.inner.state.lock().rx_timeout_secs = timeout_secs;
    }

    pub fn rx_timeout(&self) -> u32 {
        self.inner.state.lock().rx_timeout_secs
    }

    pub fn set_no_delay(&self, no_delay: bool) {
        let mut st = self.inner.state.lock();
        st.no_delay = no_delay;
        if let Some(raw) = st.raw {
            let _ = guarded(self.ctx(), raw, |api, pcb| {
                api.set_nodelay(pcb, no_delay);
                Ok(())
            });
        }
    }

    pub fn no_delay(&self) -> bool {
        match self.raw() {
            Some(raw) => guarded(self.ctx(), raw, |api, pcb| Ok(api.nodelay(pcb))).unwrap_or(false),
            None => false,
        }
    }

    // ---- Introspection -----------------------------------------------------

    fn raw(&self) -> Option<RawHandle> {
        self.inner.state.lock().raw
    }

    fn space_of(&self, raw: RawHandle) -> usize {
        guarded(self.ctx(), raw, |api, pcb| {
            Ok(if api.state(pcb) == TcpState::Established {
                api.sndbuf(pcb)
            } else {
                0
            })
        })
        .unwrap_or(0)
    }

    /// Stack state of the raw handle; `Closed` when unbound.
    pub fn state(&self) -> TcpState {
        match self.raw() {
            Some(raw) => guarded(self.ctx(), raw, |api, pcb| Ok(api.state(pcb))).unwrap_or(TcpState::Closed),
            None => TcpState::Closed,
        }
    }

    pub fn connected(&self) -> bool {
        self.state() == TcpState::Established
    }

    pub fn connecting(&self) -> bool {
        let state = self.state();
        state > TcpState::Closed && state < TcpState::Established
    }

    pub fn disconnecting(&self) -> bool {
        let state = self.state();
        state > TcpState::Established && state < TcpState::TimeWait
    }

    pub fn disconnected(&self) -> bool {
        if self.raw().is_none() {
            return true;
        }
        matches!(self.state(), TcpState::Closed | TcpState::TimeWait)
    }

    pub fn freeable(&self) -> bool {
        if self.raw().is_none() {
            return true;
        }
        let state = self.state();
        state == TcpState::Closed || state > TcpState::Established
    }

    pub fn is_free(&self) -> bool {
        self.freeable()
    }

    pub fn phase(&self) -> Phase {
        let (raw, resolving, binding, tls_pending) = {
            let st = self.inner.state.lock();
            (st.raw, st.resolving, st.binding, st.secure && !st.handshake_done)
        };
        let Some(raw) = raw else {
            return match (resolving, binding) {
                (true, _) => Phase::Resolving,
                (false, Some(_)) => Phase::Closing,
                (false, None) => Phase::Idle,
            };
        };
        let state = guarded(self.ctx(), raw, |api, pcb| Ok(api.state(pcb))).unwrap_or(TcpState::Closed);
        match state {
            TcpState::Established if tls_pending => Phase::Handshaking,
            TcpState::Established => Phase::Established,
            s if s > TcpState::Closed && s < TcpState::Established => Phase::Connecting,
            _ => Phase::Closing,
        }
    }

    /// True once TLS finished its handshake; always true for plain connections.
    pub fn handshake_complete(&self) -> bool {
        self.inner.state.lock().handshake_done
    }

    /// True while a sent segment waits for its acknowledgement.
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().busy
    }

    /// Send window; zero unless established.
    pub fn space(&self) -> usize {
        self.raw().map_or(0, |raw| self.space_of(raw))
    }

    pub fn can_send(&self) -> bool {
        self.space() > 0
    }

    pub fn mss(&self) -> u16 {
        match self.raw() {
            Some(raw) => guarded(self.ctx(), raw, |api, pcb| Ok(api.mss(pcb))).unwrap_or(0),
            None => 0,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        let raw = self.raw()?;
        guarded(self.ctx(), raw, |api, pcb| Ok(api.remote_addr(pcb))).ok().flatten()
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        let raw = self.raw()?;
        guarded(self.ctx(), raw, |api, pcb| Ok(api.local_addr(pcb))).ok().flatten()
    }

    pub fn remote_ip(&self) -> Ipv4Addr {
        self.remote_addr().map_or(Ipv4Addr::UNSPECIFIED, |a| *a.ip())
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr().map_or(0, |a| a.port())
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_addr().map_or(Ipv4Addr::UNSPECIFIED, |a| *a.ip())
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr().map_or(0, |a| a.port())
    }

    // ---- Callback registration ---------------------------------------------

    pub fn on_connect(&self, f: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.callbacks.lock().connect = Some(Arc::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.callbacks.lock().disconnect = Some(Arc::new(f));
    }

    pub fn on_ack(&self, f: impl Fn(&Connection, usize, u32) + Send + Sync + 'static) {
        self.inner.callbacks.lock().ack = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&Connection, ConnectionError) + Send + Sync + 'static) {
        self.inner.callbacks.lock().error = Some(Arc::new(f));
    }

    pub fn on_data(&self, f: impl Fn(&Connection, &[u8]) + Send + Sync + 'static) {
        self.inner.callbacks.lock().data = Some(Arc::new(f));
    }

    /// Takes precedence over `on_data` for plain connections.
    pub fn on_packet(&self, f: impl Fn(&Connection, Segment) + Send + Sync + 'static) {
        self.inner.callbacks.lock().packet = Some(Arc::new(f));
    }

    pub fn on_timeout(&self, f: impl Fn(&Connection, u32) + Send + Sync + 'static) {
        self.inner.callbacks.lock().timeout = Some(Arc::new(f));
    }

    pub fn on_poll(&self, f: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.callbacks.lock().poll = Some(Arc::new(f));
    }

    fn callbacks(&self) -> Callbacks {
        self.inner.callbacks.lock().clone()
    }

    fn fire_connect(&self) {
        if let Some(cb) = self.callbacks().connect {
            cb(self);
        }
    }

    fn fire_disconnect(&self) {
        if let Some(cb) = self.callbacks().disconnect {
            cb(self);
        }
    }

    fn fire_error(&self, err: ConnectionError) {
        match self.callbacks().error {
            Some(cb) => cb(self, err),
            None => tracing::debug!(error = %err, "Connection error with no handler"),
        }
    }

    fn fire_data(&self, data: &[u8]) {
        if let Some(cb) = self.callbacks().data {
            cb(self, data);
        }
    }

    // ---- Event handlers (worker) -------------------------------------------

    fn handle_connected(&self, pcb: PcbId) {
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw_for(pcb) else {
            tracing::trace!(%pcb, "Connected for stale handle ignored");
            return;
        };
        st.rx_last_packet = self.ctx().now_ms();
        st.busy = false;

        if st.secure {
            let ctx = self.ctx();
            let ip = st.peer.map_or(Ipv4Addr::UNSPECIFIED, |p| *p.ip());
            let started = server_name_for(st.hostname.as_deref(), ip)
                .map_err(|e| e.transport_code())
                .and_then(|name| {
                    let mut transmit = RawTransmit { ctx, raw };
                    TlsSession::begin_client(&st.credentials, name, &mut transmit)
                });
            match started {
                Ok(session) => {
                    tracing::debug!(binding = ?st.binding, %pcb, "TCP connected, TLS handshake started");
                    st.tls = Some(session);
                }
                Err(code) => {
                    tracing::error!(binding = ?st.binding, error = %code, "TLS setup failed");
                    metrics::record_handshake("setup_failed");
                    let teardown = self.close_locked(&mut st, "tls_setup");
                    drop(st);
                    self.fire_error(ConnectionError::Tls(code));
                    self.finish(teardown);
                }
            }
            return;
        }

        drop(st);
        self.fire_connect();
    }

    fn handle_data(&self, pcb: PcbId, segment: Segment) {
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw_for(pcb) else {
            return;
        };
        let ctx = self.ctx().clone();
        st.rx_last_packet = ctx.now_ms();

        if st.secure {
            self.handle_ciphertext(st, raw, segment);
            return;
        }

        st.ack_pcb = true;
        drop(st);

        let callbacks = self.callbacks();
        if let Some(cb) = callbacks.packet {
            cb(self, segment);
            return;
        }

        let len = segment.len();
        match callbacks.data {
            Some(cb) => cb(self, &segment[..]),
            None => tracing::trace!(%pcb, len, "Data with no handler"),
        }

        let mut st = self.inner.state.lock();
        if st.ack_pcb {
            drop(st);
            let _ = guarded(&ctx, raw, |api, pcb| {
                api.recved(pcb, len);
                Ok(())
            });
        } else {
            st.rx_ack_len += len;
        }
    }

    fn handle_ciphertext(&self, mut st: parking_lot::MutexGuard<'_, ConnState>, raw: RawHandle, segment: Segment) {
        let ctx = self.ctx();
        let Some(tls) = st.tls.as_mut() else {
            let _ = guarded(ctx, raw, |api, pcb| {
                api.recved(pcb, segment.len());
                Ok(())
            });
            return;
        };

        let mut transmit = RawTransmit { ctx, raw };
        let outputs = tls.feed_ciphertext(&segment, &mut transmit);
        let _ = guarded(ctx, raw, |api, pcb| {
            api.recved(pcb, segment.len());
            Ok(())
        });

        let mut failed = false;
        for output in &outputs {
            match output {
                TlsOutput::HandshakeComplete => st.handshake_done = true,
                TlsOutput::Failed(_) => failed = true,
                _ => {}
            }
        }
        let teardown = failed.then(|| self.close_locked(&mut st, "tls_error"));
        let binding = st.binding;
        drop(st);

        for output in outputs {
            match output {
                TlsOutput::HandshakeComplete => {
                    tracing::debug!(binding = ?binding, "TLS handshake complete");
                    self.fire_connect();
                }
                TlsOutput::Plaintext(bytes) => self.fire_data(&bytes),
                TlsOutput::PeerClosed => tracing::debug!(binding = ?binding, "Peer sent close notify"),
                TlsOutput::Failed(code) => {
                    tracing::info!(binding = ?binding, error = %code, "TLS failure, closing");
                    self.fire_error(ConnectionError::Tls(code));
                }
            }
        }
        if let Some(teardown) = teardown {
            self.finish(teardown);
        }
    }

    fn handle_sent(&self, pcb: PcbId, len: u16) {
        let mut st = self.inner.state.lock();
        let Some(raw) = st.raw_for(pcb) else {
            return;
        };
        let now = self.ctx().now_ms();
        st.rx_last_packet = now;
        st.busy = false;
        let elapsed = now.saturating_sub(st.sent_at);

        if let Some(tls) = st.tls.as_mut() {
            if tls.pending_outgoing() > 0 {
                let mut transmit = RawTransmit { ctx: self.ctx(), raw };
                if let Err(code) = tls.flush(&mut transmit) {
                    tracing::debug!(%pcb, error = %code, "Deferred TLS flush failed");
                }
            }
        }
        drop(st);

        if let Some(cb) = self.callbacks().ack {
            cb(self, len as usize, elapsed as u32);
        }
    }

    fn handle_closing(&self, pcb: PcbId) {
        let mut st = self.inner.state.lock();
        if st.raw_for(pcb).is_none() {
            return;
        }
        st.raw = None;
        if let Some(mut tls) = st.tls.take() {
            tls.teardown(None);
        }
        st.busy = false;
        metrics::record_close("remote");
        tracing::debug!(binding = ?st.binding, %pcb, "Remote closed");
        let teardown = Teardown {
            binding: st.binding.take(),
            disconnect: std::mem::take(&mut st.disconnect_armed),
        };
        drop(st);
        self.finish(teardown);
    }

    fn handle_error(&self, target: CorrelationId, err: ErrorCode) {
        let mut st = self.inner.state.lock();
        if st.binding != Some(target) {
            tracing::trace!(binding = %target, error = %err, "Error for a previous binding ignored");
            return;
        }
        st.raw = None;
        if let Some(mut tls) = st.tls.take() {
            tls.teardown(None);
        }
        st.busy = false;
        metrics::record_close("error");
        tracing::debug!(binding = ?st.binding, error = %err, "Stack reported error");
        let teardown = Teardown {
            binding: st.binding.take(),
            disconnect: std::mem::take(&mut st.disconnect_armed),
        };
        drop(st);
        self.fire_error(ConnectionError::Transport(err));
        self.finish(teardown);
    }

    fn handle_poll(&self, pcb: PcbId) {
        let mut st = self.inner.state.lock();
        if st.raw_for(pcb).is_none() {
            return;
        }
        let now = self.ctx().now_ms();

        let waited = now.saturating_sub(st.sent_at);
        if st.busy && st.ack_timeout_ms > 0 && waited >= u64::from(st.ack_timeout_ms) {
            st.busy = false;
            tracing::warn!(binding = ?st.binding, waited_ms = waited, "Ack timeout");
            drop(st);
            if let Some(cb) = self.callbacks().timeout {
                cb(self, waited as u32);
            }
            return;
        }

        let idle = now.saturating_sub(st.rx_last_packet);
        if st.rx_timeout_secs > 0 && idle >= u64::from(st.rx_timeout_secs) * 1000 {
            tracing::warn!(binding = ?st.binding, idle_ms = idle, "Receive timeout");
            let teardown = self.close_locked(&mut st, "rx_timeout");
            drop(st);
            self.finish(teardown);
            return;
        }

        if st.secure && !st.handshake_done && idle >= TLS_HANDSHAKE_TIMEOUT_MS {
            tracing::warn!(binding = ?st.binding, idle_ms = idle, "TLS handshake timeout");
            metrics::record_handshake("timeout");
            let teardown = self.close_locked(&mut st, "handshake_timeout");
            drop(st);
            self.finish(teardown);
            return;
        }

        drop(st);
        if let Some(cb) = self.callbacks().poll {
            cb(self);
        }
    }

    fn handle_resolved(&self, target: CorrelationId, host: String, addr: Option<Ipv4Addr>) {
        let mut st = self.inner.state.lock();
        if st.raw.is_some() || st.binding != Some(target) {
            return;
        }
        st.resolving = false;

        match addr.filter(|ip| !ip.is_unspecified()) {
            Some(ip) => {
                tracing::debug!(binding = %target, host, %ip, "Name resolved");
                let addr = SocketAddrV4::new(ip, st.pending_port);
                let secure = st.secure;
                if let Err(e) = self.connect_locked(&mut st, Some(target), addr, secure) {
                    drop(st);
                    let code = match e {
                        Error::Stack(code) => code,
                        _ => ErrorCode::Mem,
                    };
                    self.fire_error(ConnectionError::Transport(code));
                }
            }
            None => {
                tracing::error!(binding = %target, host, "Name resolution failed");
                st.binding = None;
                drop(st);
                self.ctx().clear_pending(target);
                self.fire_error(ConnectionError::DnsFailed);
            }
        }
    }
}

impl EventSink for Connection {
    fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Connected { pcb } => self.handle_connected(pcb),
            EventKind::DataReceived { pcb, segment } => self.handle_data(pcb, segment),
            EventKind::SendAcked { pcb, len } => self.handle_sent(pcb, len),
            EventKind::ConnectionClosing { pcb } => self.handle_closing(pcb),
            EventKind::Error { err } => self.handle_error(event.target, err),
            EventKind::PollTick { pcb } => self.handle_poll(pcb),
            EventKind::NameResolved { host, addr } => self.handle_resolved(event.target, host, addr),
            other => tracing::trace!(binding = %event.target, kind = other.name(), "Event not for a connection"),
        }
    }

    fn connection(&self) -> Option<Connection> {
        Some(self.clone())
    }

    fn accepted_by(&self) -> Option<CorrelationId> {
        self.inner.state.lock().accepted_by
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("binding", &st.binding)
            .field("pcb", &st.raw.map(|r| r.pcb))
            .field("secure", &st.secure)
            .field("busy", &st.busy)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

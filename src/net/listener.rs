//! Listening endpoint that hands accepted connections to the application.
//!
//! # Responsibilities
//! - Bind and listen on the configured address with a fixed backlog
//! - Wrap each accepted raw handle in a `Connection` (TLS optional)
//! - Deliver accepted connections through the worker
//!
//! # Design Decisions
//! - Without a client handler, accepted handles are closed immediately
//! - Stopping the listener leaves accepted connections running
//! - Each `begin` picks plain or TLS afresh

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ServerConfig;

use crate::error::{Error, ErrorCode};
use crate::net::connection::Connection;
use crate::net::context::{Context, WeakContext};
use crate::net::event::{CorrelationId, Event, EventKind, EventSink};
use crate::net::tls::ServerCredentials;
use crate::stack::{self, AcceptEvents, PcbId, TcpApi, TcpState};

/// Receives each accepted connection on the worker.
pub type ClientHandler = Arc<dyn Fn(Connection) + Send + Sync>;

struct ListenerState {
    pcb: Option<PcbId>,
    binding: Option<CorrelationId>,
    /// Binding of the most recent `begin`; kept after `end` for `clients()`.
    last_binding: Option<CorrelationId>,
    tls: Option<Arc<ServerConfig>>,
}

struct ListenerInner {
    ctx: Context,
    addr: SocketAddrV4,
    state: Mutex<ListenerState>,
    handler: Mutex<Option<ClientHandler>>,
    has_handler: Arc<AtomicBool>,
    no_delay: Arc<AtomicBool>,
}

/// A TCP listener, plain or TLS.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn new(ctx: &Context, addr: SocketAddrV4) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                ctx: ctx.clone(),
                addr,
                state: Mutex::new(ListenerState {
                    pcb: None,
                    binding: None,
                    last_binding: None,
                    tls: None,
                }),
                handler: Mutex::new(None),
                has_handler: Arc::new(AtomicBool::new(false)),
                no_delay: Arc::new(AtomicBool::new(ctx.config().tcp.no_delay)),
            }),
        }
    }

    /// Install the handler that receives accepted connections.
    pub fn on_client(&self, f: impl Fn(Connection) + Send + Sync + 'static) {
        *self.inner.handler.lock() = Some(Arc::new(f));
        self.inner.has_handler.store(true, Ordering::Release);
    }

    /// Applied to every connection accepted from now on.
    pub fn set_no_delay(&self, no_delay: bool) {
        self.inner.no_delay.store(no_delay, Ordering::Release);
    }

    pub fn no_delay(&self) -> bool {
        self.inner.no_delay.load(Ordering::Acquire)
    }

    /// Start listening without TLS. A second call while listening does nothing.
    pub fn begin(&self) -> Result<(), Error> {
        self.start(None)
    }

    /// Start listening with TLS on every accepted connection.
    pub fn begin_secure(&self, credentials: &ServerCredentials) -> Result<(), Error> {
        let config = credentials.server_config()?;
        self.start(Some(config))
    }

    fn start(&self, tls: Option<Arc<ServerConfig>>) -> Result<(), Error> {
        let ctx = &self.inner.ctx;
        let mut st = self.inner.state.lock();
        if st.pcb.is_some() {
            tracing::debug!(address = %self.inner.addr, "Listener already running");
            return Ok(());
        }
        ctx.ensure_worker()?;
        st.tls = tls;

        let binding = ctx.next_binding();
        ctx.register(binding, Arc::new(self.clone()));

        let stub: Arc<dyn AcceptEvents> = Arc::new(AcceptStub {
            ctx: ctx.downgrade(),
            listener: binding,
            has_handler: self.inner.has_handler.clone(),
            no_delay: self.inner.no_delay.clone(),
            tls: st.tls.clone(),
        });
        let addr = self.inner.addr;
        let backlog = ctx.config().tcp.listen_backlog;

        let result = stack::call(ctx.stack().as_ref(), |api| {
            let pcb = api.tcp_new().ok_or(Error::NoPcb)?;
            if let Err(code) = api.bind(pcb, addr) {
                close_or_abort(api, pcb);
                return Err(Error::Stack(code));
            }
            let listening = match api.listen(pcb, backlog) {
                Ok(listening) => listening,
                Err(code) => {
                    close_or_abort(api, pcb);
                    return Err(Error::Stack(code));
                }
            };
            api.set_accept(listening, Some(stub));
            Ok(listening)
        })
        .unwrap_or(Err(Error::Stack(ErrorCode::If)));

        match result {
            Ok(pcb) => {
                st.pcb = Some(pcb);
                st.binding = Some(binding);
                st.last_binding = Some(binding);
                tracing::info!(
                    address = %addr,
                    backlog,
                    secure = st.tls.is_some(),
                    "Listener bound"
                );
                Ok(())
            }
            Err(e) => {
                ctx.deregister(binding);
                tracing::error!(address = %addr, error = %e, "Listener failed to start");
                Err(e)
            }
        }
    }

    /// Stop accepting. Already accepted connections are unaffected, and
    /// accepts still queued for the worker are delivered to the handler.
    pub fn end(&self) {
        let mut st = self.inner.state.lock();
        let Some(pcb) = st.pcb.take() else {
            return;
        };
        let binding = st.binding.take();
        drop(st);

        let ctx = &self.inner.ctx;
        stack::call(ctx.stack().as_ref(), |api| {
            api.set_accept(pcb, None);
            close_or_abort(api, pcb);
        });
        if let Some(binding) = binding {
            ctx.clear_pending(binding);
        }
        tracing::info!(address = %self.inner.addr, "Listener stopped");
    }

    /// Stack state of the listening handle; `Closed` when stopped.
    pub fn status(&self) -> TcpState {
        match self.inner.state.lock().pcb {
            Some(pcb) => stack::call(self.inner.ctx.stack().as_ref(), |api| api.state(pcb)).unwrap_or(TcpState::Closed),
            None => TcpState::Closed,
        }
    }

    /// Bound port, which differs from the configured one when that was 0.
    pub fn local_port(&self) -> u16 {
        match self.inner.state.lock().pcb {
            Some(pcb) => stack::call(self.inner.ctx.stack().as_ref(), |api| api.local_addr(pcb))
                .flatten()
                .map_or(0, |a| a.port()),
            None => 0,
        }
    }

    /// Connections accepted by the most recent `begin` that are still bound.
    pub fn clients(&self) -> Vec<Connection> {
        match self.inner.state.lock().last_binding {
            Some(binding) => self.inner.ctx.accepted_by(binding),
            None => Vec::new(),
        }
    }
}

impl EventSink for Listener {
    fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::IncomingAccepted { connection } => {
                let handler = self.inner.handler.lock().clone();
                match handler {
                    Some(handler) => handler(connection),
                    None => connection.close(false),
                }
            }
            other => tracing::trace!(binding = %event.target, kind = other.name(), "Event not for a listener"),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("pcb", &st.pcb)
            .field("secure", &st.tls.is_some())
            .finish()
    }
}

fn close_or_abort(api: &mut dyn TcpApi, pcb: PcbId) {
    if api.close(pcb).is_err() {
        api.abort(pcb);
    }
}

/// Stack-facing half of a listener.
struct AcceptStub {
    ctx: WeakContext,
    listener: CorrelationId,
    has_handler: Arc<AtomicBool>,
    no_delay: Arc<AtomicBool>,
    tls: Option<Arc<ServerConfig>>,
}

impl AcceptEvents for AcceptStub {
    fn accept(&self, result: Result<PcbId, ErrorCode>) {
        let pcb = match result {
            Ok(pcb) => pcb,
            Err(code) => {
                tracing::warn!(listener = %self.listener, error = %code, "Accept failed");
                return;
            }
        };
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };

        if !self.has_handler.load(Ordering::Acquire) {
            tracing::debug!(listener = %self.listener, %pcb, "No client handler, closing accepted connection");
            stack::call(ctx.stack().as_ref(), |api| close_or_abort(api, pcb));
            return;
        }

        let no_delay = self.no_delay.load(Ordering::Acquire);
        match Connection::accepted(&ctx, pcb, self.listener, no_delay, self.tls.clone()) {
            Some(connection) => ctx.post(Event::new(self.listener, EventKind::IncomingAccepted { connection })),
            None => {
                stack::call(ctx.stack().as_ref(), |api| close_or_abort(api, pcb));
            }
        }
    }
}

//! Network stack capability surface.
//!
//! The raw TCP stack is an external collaborator. It runs on its own
//! execution context, is not reentrant, and reports connection events by
//! calling the stub interfaces below from that context.
//!
//! # Data Flow
//! ```text
//! worker / application
//!     → NetStack::api_call (serialized with the stack's own processing)
//!     → TcpApi primitives (write, output, recved, close, ...)
//!
//! stack context
//!     → PcbEvents / AcceptEvents stubs
//!     → typed Event records on the EventQueue
//! ```
//!
//! # Implementations
//! - `loopback`: deterministic in-memory stack for tests and self-checks
//! - `socket`: real TCP sockets driven by a dedicated tokio runtime thread

pub mod loopback;
pub mod socket;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{BitOr, Deref};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ErrorCode;

/// Handle naming one raw connection inside a stack. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PcbId(pub u64);

impl fmt::Display for PcbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb-{}", self.0)
    }
}

/// TCP state of a raw connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynReceived = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    CloseWait = 7,
    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

impl TcpState {
    pub fn as_str(self) -> &'static str {
        state_to_string(self)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(state_to_string(*self))
    }
}

/// Render a TCP state as text.
pub fn state_to_string(state: TcpState) -> &'static str {
    match state {
        TcpState::Closed => "Closed",
        TcpState::Listen => "Listen",
        TcpState::SynSent => "SYN Sent",
        TcpState::SynReceived => "SYN Received",
        TcpState::Established => "Established",
        TcpState::FinWait1 => "FIN Wait 1",
        TcpState::FinWait2 => "FIN Wait 2",
        TcpState::CloseWait => "Close Wait",
        TcpState::Closing => "Closing",
        TcpState::LastAck => "Last ACK",
        TcpState::TimeWait => "Time Wait",
    }
}

/// Flags accepted by `TcpApi::write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags(0x00);
    /// The stack copies the data instead of referencing it.
    pub const COPY: WriteFlags = WriteFlags(0x01);
    /// More data follows; the stack may delay pushing.
    pub const MORE: WriteFlags = WriteFlags(0x02);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags::COPY
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

/// One received segment. Owns its bytes so it can cross contexts.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment(Bytes);

impl Segment {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Segment(data.into())
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("len", &self.0.len()).finish()
    }
}

/// Callbacks a stack invokes, from its own context, for one raw connection.
pub trait PcbEvents: Send + Sync {
    /// Outbound connection established.
    fn connected(&self, pcb: PcbId);
    /// Data arrived; `None` means the peer sent FIN.
    fn recv(&self, pcb: PcbId, segment: Option<Segment>);
    /// The peer acknowledged `len` bytes.
    fn sent(&self, pcb: PcbId, len: u16);
    /// Fatal error. The stack has already released the raw connection.
    fn error(&self, err: ErrorCode);
    /// Periodic tick.
    fn poll(&self, pcb: PcbId);
}

/// Callback a stack invokes when a listening handle accepts a connection.
pub trait AcceptEvents: Send + Sync {
    fn accept(&self, result: Result<PcbId, ErrorCode>);
}

/// Primitive operations on raw connections.
///
/// Only reachable through `NetStack::api_call`, which serializes them with
/// the stack's own processing.
pub trait TcpApi {
    fn tcp_new(&mut self) -> Option<PcbId>;
    fn set_events(&mut self, pcb: PcbId, events: Option<Arc<dyn PcbEvents>>);
    fn set_accept(&mut self, pcb: PcbId, accept: Option<Arc<dyn AcceptEvents>>);
    fn connect(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode>;
    fn bind(&mut self, pcb: PcbId, addr: SocketAddrV4) -> Result<(), ErrorCode>;
    /// Turn a bound handle into a listening handle. The stack may return a new id.
    fn listen(&mut self, pcb: PcbId, backlog: u8) -> Result<PcbId, ErrorCode>;
    fn write(&mut self, pcb: PcbId, data: &[u8], flags: WriteFlags) -> Result<(), ErrorCode>;
    fn output(&mut self, pcb: PcbId) -> Result<(), ErrorCode>;
    /// Open the receive window by `len` bytes.
    fn recved(&mut self, pcb: PcbId, len: usize);
    fn close(&mut self, pcb: PcbId) -> Result<(), ErrorCode>;
    fn abort(&mut self, pcb: PcbId);
    fn sndbuf(&self, pcb: PcbId) -> usize;
    fn mss(&self, pcb: PcbId) -> u16;
    fn state(&self, pcb: PcbId) -> TcpState;
    fn set_nodelay(&mut self, pcb: PcbId, nodelay: bool);
    fn nodelay(&self, pcb: PcbId) -> bool;
    fn local_addr(&self, pcb: PcbId) -> Option<SocketAddrV4>;
    fn remote_addr(&self, pcb: PcbId) -> Option<SocketAddrV4>;
}

/// Result of starting a name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Answered from cache or literal.
    Ready(Ipv4Addr),
    /// The callback fires later on the stack context.
    Pending,
    Failed(ErrorCode),
}

/// Called on the stack context with the resolved address, if any.
pub type DnsCallback = Box<dyn FnOnce(Option<Ipv4Addr>) + Send>;

/// A network stack.
pub trait NetStack: Send + Sync {
    /// Run `call` on the stack context, blocking until it returns.
    fn api_call(&self, call: &mut dyn FnMut(&mut dyn TcpApi));

    fn resolve(&self, host: &str, found: DnsCallback) -> Resolution;
}

/// Run a closure through `api_call` and hand back its result.
///
/// `None` means the stack never ran the closure, which happens once it has
/// shut down.
pub fn call<R>(stack: &dyn NetStack, f: impl FnOnce(&mut dyn TcpApi) -> R) -> Option<R> {
    let mut f = Some(f);
    let mut out = None;
    stack.api_call(&mut |api| {
        if let Some(f) = f.take() {
            out = Some(f(api));
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(state_to_string(TcpState::SynSent), "SYN Sent");
        assert_eq!(TcpState::LastAck.to_string(), "Last ACK");
        assert_eq!(TcpState::TimeWait.as_str(), "Time Wait");
    }

    #[test]
    fn write_flags_combine() {
        let flags = WriteFlags::COPY | WriteFlags::MORE;
        assert_eq!(flags.bits(), 0x03);
        assert!(flags.contains(WriteFlags::MORE));
        assert!(!WriteFlags::default().contains(WriteFlags::MORE));
    }
}

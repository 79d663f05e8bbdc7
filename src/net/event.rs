//! Typed event records carried from the stack context to the worker.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::ErrorCode;
use crate::net::connection::Connection;
use crate::stack::{PcbId, Segment};

/// Identifies one binding (an outbound connect, an accepted connection, or a
/// running listener). Minted by the context, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind-{}", self.0)
    }
}

/// Queue position of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Appended to the tail.
    Normal,
    /// Inserted at the head, ahead of everything already queued.
    Urgent,
}

/// Payload of an event.
pub enum EventKind {
    DataReceived { pcb: PcbId, segment: Segment },
    SendAcked { pcb: PcbId, len: u16 },
    /// The peer sent FIN. The raw handle was already released on the stack context.
    ConnectionClosing { pcb: PcbId },
    /// Fatal stack error. The raw handle no longer exists.
    Error { err: ErrorCode },
    PollTick { pcb: PcbId },
    IncomingAccepted { connection: Connection },
    Connected { pcb: PcbId },
    NameResolved { host: String, addr: Option<Ipv4Addr> },
    /// Drop every queued event for the target and retire its registration.
    ClearPending,
}

impl EventKind {
    pub fn priority(&self) -> Priority {
        match self {
            EventKind::Connected { .. } | EventKind::IncomingAccepted { .. } | EventKind::ClearPending => {
                Priority::Urgent
            }
            _ => Priority::Normal,
        }
    }

    /// Stable label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DataReceived { .. } => "data_received",
            EventKind::SendAcked { .. } => "send_acked",
            EventKind::ConnectionClosing { .. } => "connection_closing",
            EventKind::Error { .. } => "error",
            EventKind::PollTick { .. } => "poll_tick",
            EventKind::IncomingAccepted { .. } => "incoming_accepted",
            EventKind::Connected { .. } => "connected",
            EventKind::NameResolved { .. } => "name_resolved",
            EventKind::ClearPending => "clear_pending",
        }
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::DataReceived { pcb, segment } => f
                .debug_struct("DataReceived")
                .field("pcb", pcb)
                .field("len", &segment.len())
                .finish(),
            EventKind::SendAcked { pcb, len } => {
                f.debug_struct("SendAcked").field("pcb", pcb).field("len", len).finish()
            }
            EventKind::ConnectionClosing { pcb } => f.debug_struct("ConnectionClosing").field("pcb", pcb).finish(),
            EventKind::Error { err } => f.debug_struct("Error").field("err", err).finish(),
            EventKind::PollTick { pcb } => f.debug_struct("PollTick").field("pcb", pcb).finish(),
            EventKind::IncomingAccepted { connection } => f
                .debug_struct("IncomingAccepted")
                .field("binding", &connection.binding())
                .finish(),
            EventKind::Connected { pcb } => f.debug_struct("Connected").field("pcb", pcb).finish(),
            EventKind::NameResolved { host, addr } => f
                .debug_struct("NameResolved")
                .field("host", host)
                .field("addr", addr)
                .finish(),
            EventKind::ClearPending => f.write_str("ClearPending"),
        }
    }
}

/// One queued notification.
#[derive(Debug)]
pub struct Event {
    pub target: CorrelationId,
    pub kind: EventKind,
}

impl Event {
    pub fn new(target: CorrelationId, kind: EventKind) -> Self {
        Self { target, kind }
    }

    pub fn priority(&self) -> Priority {
        self.kind.priority()
    }
}

/// Something the dispatcher can route events to.
///
/// Implemented by connections and listeners; the registry stores these.
pub trait EventSink: Send + Sync {
    fn handle_event(&self, event: Event);

    /// The connection behind this sink, if it is one.
    fn connection(&self) -> Option<Connection> {
        None
    }

    /// Listener binding that accepted this sink, if any.
    fn accepted_by(&self) -> Option<CorrelationId> {
        None
    }
}

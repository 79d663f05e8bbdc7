//! Raw-handle access from the worker, and the stub the stack calls back into.
//!
//! # Responsibilities
//! - Run slot-checked primitives on the stack context (`guarded`)
//! - Adapt a raw handle into the TLS `Transmit` interface
//! - Package stack callbacks into event records (`ConnectionStub`)
//!
//! # Design Decisions
//! - The slot check happens inside the stack call, so a handle cannot be
//!   reclaimed between the check and the primitive
//! - Stubs do a fixed amount of work and return; the only extra work is the
//!   FIN finalization and slot reclamation, which must happen on the stack
//!   context before the handle can be reused

use crate::error::ErrorCode;
use crate::net::context::{Context, WeakContext};
use crate::net::event::{CorrelationId, Event, EventKind};
use crate::net::slots::SlotToken;
use crate::net::tls::Transmit;
use crate::stack::{self, PcbEvents, PcbId, Segment, TcpApi, WriteFlags};

/// A raw connection handle together with the slot that vouches for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHandle {
    pub pcb: PcbId,
    pub slot: Option<SlotToken>,
}

/// Run `f` on the stack context unless the handle's slot went stale.
pub(crate) fn guarded<R>(
    ctx: &Context,
    raw: RawHandle,
    f: impl FnOnce(&mut dyn TcpApi, PcbId) -> Result<R, ErrorCode>,
) -> Result<R, ErrorCode> {
    let slots = ctx.slots().clone();
    stack::call(ctx.stack().as_ref(), |api| {
        if !slots.is_live(raw.slot) {
            return Err(ErrorCode::Conn);
        }
        f(api, raw.pcb)
    })
    .unwrap_or(Err(ErrorCode::If))
}

/// `Transmit` over a raw handle.
pub(crate) struct RawTransmit<'a> {
    pub ctx: &'a Context,
    pub raw: RawHandle,
}

impl Transmit for RawTransmit<'_> {
    fn sndbuf(&mut self) -> usize {
        guarded(self.ctx, self.raw, |api, pcb| Ok(api.sndbuf(pcb))).unwrap_or(0)
    }

    fn mss(&mut self) -> u16 {
        guarded(self.ctx, self.raw, |api, pcb| Ok(api.mss(pcb))).unwrap_or(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ErrorCode> {
        guarded(self.ctx, self.raw, |api, pcb| api.write(pcb, data, WriteFlags::COPY))
    }

    fn output(&mut self) -> Result<(), ErrorCode> {
        guarded(self.ctx, self.raw, |api, pcb| api.output(pcb))
    }
}

/// Stack-facing half of a connection binding.
pub(crate) struct ConnectionStub {
    ctx: WeakContext,
    binding: CorrelationId,
    slot: Option<SlotToken>,
}

impl ConnectionStub {
    pub fn new(ctx: WeakContext, binding: CorrelationId, slot: Option<SlotToken>) -> Self {
        Self { ctx, binding, slot }
    }

    fn post(&self, kind: EventKind) {
        match self.ctx.upgrade() {
            Some(ctx) => ctx.post(Event::new(self.binding, kind)),
            None => tracing::trace!(binding = %self.binding, "Context gone, stack event dropped"),
        }
    }

    fn reclaim_slot(&self, ctx: &Context) {
        if let Some(slot) = self.slot {
            ctx.slots().reclaim(slot);
        }
    }
}

impl PcbEvents for ConnectionStub {
    fn connected(&self, pcb: PcbId) {
        self.post(EventKind::Connected { pcb });
    }

    fn recv(&self, pcb: PcbId, segment: Option<Segment>) {
        match segment {
            Some(segment) => self.post(EventKind::DataReceived { pcb, segment }),
            None => {
                // FIN: release the handle here, on the stack context.
                if let Some(ctx) = self.ctx.upgrade() {
                    stack::call(ctx.stack().as_ref(), |api| {
                        api.set_events(pcb, None);
                        if api.close(pcb).is_err() {
                            api.abort(pcb);
                        }
                    });
                    self.reclaim_slot(&ctx);
                    tracing::debug!(binding = %self.binding, %pcb, "Peer closed, handle released");
                }
                self.post(EventKind::ConnectionClosing { pcb });
            }
        }
    }

    fn sent(&self, pcb: PcbId, len: u16) {
        self.post(EventKind::SendAcked { pcb, len });
    }

    fn error(&self, err: ErrorCode) {
        if let Some(ctx) = self.ctx.upgrade() {
            self.reclaim_slot(&ctx);
        }
        self.post(EventKind::Error { err });
    }

    fn poll(&self, pcb: PcbId) {
        self.post(EventKind::PollTick { pcb });
    }
}

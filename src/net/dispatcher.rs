//! Worker loop: dequeue, route, handle, repeat.
//!
//! # Data Flow
//! ```text
//! EventQueue::dequeue (blocks while idle)
//!     → ClearPending: cancel queued events for the target, retire it
//!         (queued accepts are still handed to the listener)
//!     → otherwise: registry lookup by correlation id
//!         → EventSink::handle_event (user callbacks run here)
//!         → unknown id: dropped, the binding already retired
//! ```
//!
//! # Design Decisions
//! - Exactly one worker per context; it is the only caller of user callbacks
//! - A panicking handler is logged and the loop continues with the next event
//! - The watchdog only reports; it never interrupts a handler

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::net::context::{Context, WeakContext};
use crate::net::event::{CorrelationId, Event, EventKind, EventSink};
use crate::net::queue::EventQueue;
use crate::observability::metrics;

pub(crate) fn spawn(
    name: &str,
    queue: Arc<EventQueue>,
    context: WeakContext,
    watchdog: Duration,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(queue, context, watchdog))
}

fn run(queue: Arc<EventQueue>, context: WeakContext, watchdog: Duration) {
    while let Some(event) = queue.dequeue() {
        let Some(ctx) = context.upgrade() else {
            break;
        };

        let kind = event.kind.name();
        let target = event.target;
        let started = Instant::now();

        dispatch(&ctx, event);

        let elapsed = started.elapsed();
        metrics::record_dispatch(kind, elapsed);
        metrics::record_queue_depth(queue.len());
        if elapsed > watchdog {
            tracing::warn!(
                binding = %target,
                kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "Event handler exceeded watchdog"
            );
        }
    }
    tracing::trace!("Event worker exiting");
}

fn dispatch(ctx: &Context, event: Event) {
    let target = event.target;

    if let EventKind::ClearPending = event.kind {
        clear_pending(ctx, target);
        return;
    }

    let Some(sink) = ctx.lookup(target) else {
        tracing::trace!(binding = %target, kind = event.kind.name(), "Event for retired binding dropped");
        metrics::record_dropped("retired", 1);
        return;
    };
    deliver(sink.as_ref(), event);
}

/// Retire `target`. Accepted connections still queued for it are handed
/// over, or closed when nobody can take them.
fn clear_pending(ctx: &Context, target: CorrelationId) {
    let sink = ctx.lookup(target);
    let pending = ctx.queue().take_pending(target);
    ctx.deregister(target);

    let mut removed = 0;
    for event in pending {
        match (event.kind, &sink) {
            (EventKind::IncomingAccepted { connection }, Some(sink)) => {
                deliver(sink.as_ref(), Event::new(target, EventKind::IncomingAccepted { connection }));
            }
            (EventKind::IncomingAccepted { connection }, None) => connection.close(false),
            _ => removed += 1,
        }
    }
    if removed > 0 {
        metrics::record_dropped("cleared", removed);
    }
    tracing::trace!(binding = %target, removed, "Pending events cleared");
}

fn deliver(sink: &dyn EventSink, event: Event) {
    let target = event.target;
    let kind = event.kind.name();
    if catch_unwind(AssertUnwindSafe(|| sink.handle_event(event))).is_err() {
        tracing::error!(binding = %target, kind, "Event handler panicked");
    }
}

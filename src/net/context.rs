//! Runtime context shared by every connection and listener.
//!
//! # Responsibilities
//! - Own the stack handle, event queue, slot registry and binding registry
//! - Mint correlation ids and route them to event sinks
//! - Start the worker thread on first use and stop it on teardown
//!
//! # Design Decisions
//! - One context per running instance, passed explicitly instead of globals
//! - The registry holds a strong reference to each bound sink until its
//!   `ClearPending` directive runs, so a binding outlives its user handles
//!   while events for it may still be queued
//! - Stack-side stubs hold a `WeakContext`; the stack never keeps the
//!   context alive
//! - Dropping the last handle closes the queue and joins the worker, except
//!   when that drop happens on the worker itself

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::net::clock::{Clock, MonotonicClock};
use crate::net::connection::Connection;
use crate::net::dispatcher;
use crate::net::event::{CorrelationId, Event, EventKind, EventSink};
use crate::net::queue::{EventQueue, QueueError};
use crate::net::slots::SlotRegistry;
use crate::observability::metrics;
use crate::stack::NetStack;

struct Worker {
    join: Option<JoinHandle<()>>,
    thread: ThreadId,
}

pub(crate) struct Shared {
    stack: Arc<dyn NetStack>,
    queue: Arc<EventQueue>,
    slots: Arc<SlotRegistry>,
    registry: Mutex<HashMap<CorrelationId, Arc<dyn EventSink>>>,
    clock: Arc<dyn Clock>,
    config: Arc<RuntimeConfig>,
    next_binding: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.queue.close();
        let Some(mut worker) = self.worker.get_mut().take() else {
            return;
        };
        if worker.thread == std::thread::current().id() {
            return;
        }
        if let Some(join) = worker.join.take() {
            if join.join().is_err() {
                tracing::error!("Event worker panicked");
            }
        }
        tracing::debug!("Event worker stopped");
    }
}

/// Handle to a running instance. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

/// Non-owning handle held by stack-side stubs.
#[derive(Clone)]
pub struct WeakContext {
    shared: Weak<Shared>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.shared.upgrade().map(|shared| Context { shared })
    }
}

impl Context {
    pub fn new(stack: Arc<dyn NetStack>, config: RuntimeConfig) -> Self {
        Self::with_clock(stack, config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(stack: Arc<dyn NetStack>, config: RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        if config.worker.priority != config.worker.effective_priority() {
            tracing::warn!(
                requested = config.worker.priority,
                effective = config.worker.effective_priority(),
                "Worker priority below minimum, raised"
            );
        }

        Self {
            shared: Arc::new(Shared {
                stack,
                queue: Arc::new(EventQueue::with_capacity(config.event_queue.capacity)),
                slots: Arc::new(SlotRegistry::new(config.tcp.max_slots)),
                registry: Mutex::new(HashMap::new()),
                clock,
                config: Arc::new(config),
                next_binding: AtomicU64::new(1),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn stack(&self) -> &Arc<dyn NetStack> {
        &self.shared.stack
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.shared.queue
    }

    pub fn slots(&self) -> &Arc<SlotRegistry> {
        &self.shared.slots
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Start the worker thread if it is not running yet.
    pub fn ensure_worker(&self) -> Result<(), Error> {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let config = &self.shared.config.worker;
        let join = dispatcher::spawn(
            &config.name,
            self.shared.queue.clone(),
            self.downgrade(),
            std::time::Duration::from_millis(config.watchdog_ms),
        )
        .map_err(Error::Worker)?;

        tracing::info!(
            name = %config.name,
            priority = config.effective_priority(),
            core = ?config.core,
            queue_capacity = self.shared.queue.capacity(),
            "Event worker started"
        );

        *worker = Some(Worker {
            thread: join.thread().id(),
            join: Some(join),
        });
        Ok(())
    }

    /// True when called from the worker thread.
    pub fn on_worker(&self) -> bool {
        self.shared
            .worker
            .lock()
            .as_ref()
            .is_some_and(|w| w.thread == std::thread::current().id())
    }

    /// Mint a correlation id without registering anything.
    pub(crate) fn next_binding(&self) -> CorrelationId {
        CorrelationId::from_raw(self.shared.next_binding.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, id: CorrelationId, sink: Arc<dyn EventSink>) {
        self.shared.registry.lock().insert(id, sink);
    }

    pub(crate) fn deregister(&self, id: CorrelationId) -> bool {
        self.shared.registry.lock().remove(&id).is_some()
    }

    pub(crate) fn lookup(&self, id: CorrelationId) -> Option<Arc<dyn EventSink>> {
        self.shared.registry.lock().get(&id).cloned()
    }

    /// Number of bindings with a live registration.
    pub fn active_bindings(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Connections accepted by the listener bound as `listener`.
    pub(crate) fn accepted_by(&self, listener: CorrelationId) -> Vec<Connection> {
        let sinks: Vec<Arc<dyn EventSink>> = self.shared.registry.lock().values().cloned().collect();
        sinks
            .into_iter()
            .filter(|sink| sink.accepted_by() == Some(listener))
            .filter_map(|sink| sink.connection())
            .collect()
    }

    /// Queue an event at the position its kind demands.
    ///
    /// From the worker thread this never blocks.
    pub(crate) fn post(&self, event: Event) {
        let priority = event.priority();
        let result = if self.on_worker() {
            self.shared.queue.enqueue_overflow(event, priority)
        } else {
            self.shared.queue.enqueue(event, priority)
        };
        if let Err(QueueError::Closed(event)) = result {
            tracing::debug!(binding = %event.target, kind = event.kind.name(), "Queue closed, event dropped");
            metrics::record_dropped("queue_closed", 1);
        }
    }

    /// Ask the worker to discard everything pending for `id` and retire it.
    pub(crate) fn clear_pending(&self, id: CorrelationId) {
        self.post(Event::new(id, EventKind::ClearPending));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::loopback::LoopbackStack;

    #[test]
    fn correlation_ids_are_unique() {
        let ctx = Context::new(LoopbackStack::new(), RuntimeConfig::default());
        let a = ctx.next_binding();
        let b = ctx.next_binding();
        assert_ne!(a, b);
    }

    #[test]
    fn worker_starts_once_and_stops_on_drop() {
        let ctx = Context::new(LoopbackStack::new(), RuntimeConfig::default());
        assert!(!ctx.on_worker());
        ctx.ensure_worker().unwrap();
        ctx.ensure_worker().unwrap();
        let queue = ctx.queue().clone();
        drop(ctx);
        assert!(queue.is_closed());
    }
}

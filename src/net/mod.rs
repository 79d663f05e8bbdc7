//! Connection layer.
//!
//! # Data Flow
//! ```text
//! Network stack (stack context)
//!     → raw.rs stubs (package callback into an Event)
//!     → queue.rs (urgent events at the head, others at the tail)
//!     → dispatcher.rs (single worker, registry lookup)
//!     → connection.rs / listener.rs (state machine, user callbacks)
//!     → tls.rs (secure connections only)
//!
//! Outbound:
//!     connection.rs → raw.rs guarded primitive → stack api_call
//! ```
//!
//! # Design Decisions
//! - User callbacks never run on the stack context
//! - Every raw-handle primitive from the worker is checked against the slot
//!   registry inside the stack call
//! - TLS is optional per connection and transparent to callbacks

pub mod clock;
pub mod connection;
pub mod context;
pub(crate) mod dispatcher;
pub mod event;
pub mod listener;
pub mod queue;
pub(crate) mod raw;
pub mod slots;
pub mod tls;

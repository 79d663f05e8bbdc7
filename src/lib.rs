//! Asynchronous event-driven TCP and TLS connections over a raw network stack.
//!
//! Stack callbacks are turned into typed events, queued, and handled by one
//! worker thread that runs the application's callbacks. Secure connections
//! run a TLS session between the raw stack and those callbacks.

pub mod config;
pub mod error;
pub mod net;
pub mod observability;
pub mod stack;

pub use config::RuntimeConfig;
pub use error::{error_to_string, ConnectionError, Error, ErrorCode};
pub use net::clock::{Clock, ManualClock, MonotonicClock};
pub use net::connection::{Connection, Phase};
pub use net::context::Context;
pub use net::listener::Listener;
pub use net::tls::{ClientCredentials, ServerCredentials};
pub use stack::{state_to_string, NetStack, Segment, TcpState, WriteFlags};

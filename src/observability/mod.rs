//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! stack stubs, dispatcher, connections, listeners produce:
//!     → tracing events with structured fields (binding, pcb, code)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;

//! Configuration schema definitions.
//!
//! This module defines the runtime configuration for the event worker, the
//! connection defaults, and observability. All types derive Serde traits for
//! deserialization from TOML files.

use serde::{Deserialize, Serialize};

/// Default depth of the event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// Default worker priority hint.
pub const DEFAULT_WORKER_PRIORITY: u8 = 10;

/// Lowest worker priority accepted; lower values are raised to this.
pub const MIN_WORKER_PRIORITY: u8 = 4;

/// Default number of slots, matching the stack's active connection limit.
pub const DEFAULT_MAX_SLOTS: usize = 16;

/// Default acknowledgement timeout in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u32 = 5000;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Event queue sizing.
    pub event_queue: QueueConfig,

    /// Worker thread settings.
    pub worker: WorkerConfig,

    /// Connection defaults and stack limits.
    pub tcp: TcpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Event queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued events before producers block.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Thread name.
    pub name: String,

    /// Scheduling priority hint. Values below 4 are raised to 4.
    pub priority: u8,

    /// CPU core hint (None = any core).
    pub core: Option<usize>,

    /// A handler running longer than this is reported.
    pub watchdog_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "async_tcp".to_string(),
            priority: DEFAULT_WORKER_PRIORITY,
            core: None,
            watchdog_ms: 1000,
        }
    }
}

impl WorkerConfig {
    /// Priority after applying the floor.
    pub fn effective_priority(&self) -> u8 {
        self.priority.max(MIN_WORKER_PRIORITY)
    }
}

/// TCP defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Slots available for stale-operation detection.
    pub max_slots: usize,

    /// Backlog passed to listening handles.
    pub listen_backlog: u8,

    /// Acknowledgement timeout for new connections (0 = disabled).
    pub ack_timeout_ms: u32,

    /// Idle receive timeout for new connections (0 = disabled).
    pub rx_timeout_secs: u32,

    /// Disable Nagle on new connections.
    pub no_delay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            listen_backlog: 5,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            rx_timeout_secs: 0,
            no_delay: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [worker]
            priority = 2

            [tcp]
            rx_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.event_queue.capacity, 512);
        assert_eq!(config.worker.name, "async_tcp");
        assert_eq!(config.worker.effective_priority(), MIN_WORKER_PRIORITY);
        assert_eq!(config.tcp.rx_timeout_secs, 30);
        assert_eq!(config.tcp.ack_timeout_ms, 5000);
        assert_eq!(config.tcp.listen_backlog, 5);
    }
}

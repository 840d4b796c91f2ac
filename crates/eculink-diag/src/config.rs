//! Driver configuration
//!
//! Behavioral knobs for the diagnostic driver plus per-dispatcher
//! transport settings. Topology and view descriptions live in
//! `eculink-core`; this module only configures how the driver runs
//! against them.

use serde::{Deserialize, Serialize};

/// Configuration for the diagnostic driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Keepalive interval while cycling, in milliseconds
    pub tester_present_interval_ms: u64,
    /// Per-request response timeout in milliseconds
    pub request_timeout_ms: u64,
    /// How long shutdown waits for the cycling task before proceeding (ms)
    pub shutdown_wait_ms: u64,
    /// Sleep between cycle passes in microseconds
    pub cycle_sleep_us: u64,
    /// Bounded queue depth per registered message consumer
    pub consumer_queue_depth: usize,
    /// Timeout for a single polled operation in milliseconds
    pub poll_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tester_present_interval_ms: default_tester_present_interval(),
            request_timeout_ms: default_request_timeout(),
            shutdown_wait_ms: default_shutdown_wait(),
            cycle_sleep_us: default_cycle_sleep(),
            consumer_queue_depth: default_consumer_queue_depth(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

fn default_tester_present_interval() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    1000
}

fn default_shutdown_wait() -> u64 {
    2000
}

fn default_cycle_sleep() -> u64 {
    2000
}

fn default_consumer_queue_depth() -> usize {
    256
}

fn default_poll_timeout() -> u64 {
    5000
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration for one node binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// SocketCAN with ISO-TP (Linux only)
    SocketCan(SocketCanDispatcherConfig),
    /// TCP for Ethernet-attached nodes
    Tcp(TcpDispatcherConfig),
    /// Mock dispatcher for testing
    Mock(MockDispatcherConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockDispatcherConfig::default())
    }
}

/// SocketCAN dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanDispatcherConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Transmit CAN ID (tester -> node), hex with 0x prefix or decimal
    pub tx_id: String,
    /// Receive CAN ID (node -> tester)
    pub rx_id: String,
}

/// TCP dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpDispatcherConfig {
    /// Node IP address or hostname
    pub host: String,
    /// Service TCP port
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_tcp_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for TcpDispatcherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_tcp_port(),
            connect_timeout_ms: default_tcp_connect_timeout(),
        }
    }
}

fn default_tcp_port() -> u16 {
    8855
}

fn default_tcp_connect_timeout() -> u64 {
    2000
}

/// Mock dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockDispatcherConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

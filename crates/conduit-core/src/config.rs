//! Centralized configuration for Conduit.
//!
//! Default constants are grouped per concern; the typed configuration structs
//! below fall back to them for every field missing from a config file.

use crate::error::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Process supervision defaults.
pub struct ProcessDefaults;

impl ProcessDefaults {
    pub const MAX_PROCESSES: usize = 100;
    pub const MAX_RESTARTS: u32 = 3;
    pub const RESTART_DELAY: Duration = Duration::from_millis(1000);
    pub const STOP_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const KILL_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const OUTPUT_BUFFER_LINES: usize = 1000;
    pub const LOG_LINES: usize = 100;
    pub const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_millis(5000);
    pub const RESOURCE_HISTORY: usize = 60;
    pub const OUTPUT_TAP_CAPACITY: usize = 256;
}

/// Transport channel defaults.
pub struct ChannelDefaults;

impl ChannelDefaults {
    pub const DELIMITER: &'static str = "\n";
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(30_000);
    pub const READ_BUFFER_SIZE: usize = 8192;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    pub const WRITE_QUEUE_CAPACITY: usize = 256;
    pub const INBOUND_CAPACITY: usize = 1024;
}

/// Message router defaults.
pub struct RouterDefaults;

impl RouterDefaults {
    pub const CORRELATION_TIMEOUT: Duration = Duration::from_millis(30_000);
    pub const SWEEP_INTERVAL: Duration = Duration::from_millis(60_000);
    pub const STALE_AFTER: Duration = Duration::from_millis(300_000);
    pub const MAX_QUEUE_SIZE: usize = 1000;
}

/// Orchestrator defaults.
pub struct BridgeDefaults;

impl BridgeDefaults {
    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(30_000);
    pub const PING_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const EVENT_CAPACITY: usize = 1024;
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Process Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Ceiling on live (non-terminal) processes.
    pub max_processes: usize,
    /// Auto-restart budget per process.
    pub max_restarts: u32,
    /// Base delay for linear restart backoff.
    pub restart_delay_ms: u64,
    /// Grace period between the stop signal and a forced kill.
    pub stop_timeout_ms: u64,
    /// Ring buffer size for each of stdout and stderr.
    pub output_buffer_lines: usize,
    pub resource_sample_interval_ms: u64,
    /// Number of resource samples kept per process.
    pub resource_history: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_processes: ProcessDefaults::MAX_PROCESSES,
            max_restarts: ProcessDefaults::MAX_RESTARTS,
            restart_delay_ms: millis(ProcessDefaults::RESTART_DELAY),
            stop_timeout_ms: millis(ProcessDefaults::STOP_TIMEOUT),
            output_buffer_lines: ProcessDefaults::OUTPUT_BUFFER_LINES,
            resource_sample_interval_ms: millis(ProcessDefaults::RESOURCE_SAMPLE_INTERVAL),
            resource_history: ProcessDefaults::RESOURCE_HISTORY,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn resource_sample_interval(&self) -> Duration {
        Duration::from_millis(self.resource_sample_interval_ms.max(1))
    }
}

/// Message Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Per-request correlation timeout.
    pub correlation_timeout_ms: u64,
    /// Interval of the stale-correlation sweep.
    pub sweep_interval_ms: u64,
    /// Age after which the sweep force-clears a correlation.
    pub stale_after_ms: u64,
    /// Per-destination queue ceiling.
    pub max_queue_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            correlation_timeout_ms: millis(RouterDefaults::CORRELATION_TIMEOUT),
            sweep_interval_ms: millis(RouterDefaults::SWEEP_INTERVAL),
            stale_after_ms: millis(RouterDefaults::STALE_AFTER),
            max_queue_size: RouterDefaults::MAX_QUEUE_SIZE,
        }
    }
}

impl RouterConfig {
    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.correlation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub health_check_interval_ms: u64,
    /// Send a JSON-RPC `ping` on every health tick instead of only
    /// inspecting connection state.
    pub health_ping: bool,
    pub ping_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            health_check_interval_ms: millis(BridgeDefaults::HEALTH_CHECK_INTERVAL),
            health_ping: false,
            ping_timeout_ms: millis(BridgeDefaults::PING_TIMEOUT),
            event_capacity: BridgeDefaults::EVENT_CAPACITY,
        }
    }
}

impl BridgeSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// A server declared in a bridge config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub id: String,
    /// Registered transport kind (`stdio`, `domain_socket`, `named_pipe`, `network`, ...).
    pub transport: String,
    /// Transport-specific settings, parsed by the transport itself.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Start the server as soon as the daemon is up.
    #[serde(default)]
    pub auto_start: bool,
}

/// A route declared in a bridge config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub priority: i32,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub supervisor: SupervisorConfig,
    pub router: RouterConfig,
    pub bridge: BridgeSettings,
    pub servers: Vec<ServerDefinition>,
    pub routes: Vec<RouteDefinition>,
}

impl BridgeConfig {
    /// Load a JSON bridge configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConduitError::io_with_path(e, path))?;
        Self::from_json(&raw)
    }

    /// Parse a JSON bridge configuration.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(raw).map_err(|e| ConduitError::Config {
            message: format!("invalid bridge config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(ConduitError::Validation {
                    field: "servers.id".to_string(),
                    message: "server id must not be empty".to_string(),
                });
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConduitError::DuplicateId {
                    id: server.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = SupervisorConfig::default();
        assert_eq!(config.max_processes, 100);
        assert_eq!(config.restart_delay(), ProcessDefaults::RESTART_DELAY);
        assert_eq!(config.output_buffer_lines, 1000);

        let router = RouterConfig::default();
        assert_eq!(router.correlation_timeout(), Duration::from_secs(30));
        assert!(router.stale_after() > router.correlation_timeout());
    }

    #[test]
    fn test_bridge_config_partial_json() {
        let config = BridgeConfig::from_json(
            r#"{
                "supervisor": { "maxRestarts": 5 },
                "servers": [
                    { "id": "echo", "transport": "stdio",
                      "settings": { "command": "cat" }, "autoStart": true }
                ],
                "routes": [ { "source": "api", "destination": "echo" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.supervisor.max_processes, 100);
        assert_eq!(config.servers.len(), 1);
        assert!(config.servers[0].auto_start);
        assert_eq!(config.routes[0].priority, 0);
    }

    #[test]
    fn test_bridge_config_rejects_duplicate_servers() {
        let result = BridgeConfig::from_json(
            r#"{ "servers": [
                { "id": "a", "transport": "stdio" },
                { "id": "a", "transport": "network" }
            ] }"#,
        );
        assert!(matches!(result, Err(ConduitError::DuplicateId { .. })));
    }

    #[test]
    fn test_bridge_config_invalid_json() {
        let result = BridgeConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConduitError::Config { .. })));
    }
}

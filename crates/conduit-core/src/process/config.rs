//! Spawn configuration for supervised processes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Advisory resource ceilings. Breaches only emit events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(rename = "maxMemoryMB", default)]
    pub max_memory_mb: Option<f64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f32>,
}

/// Configuration for spawning a managed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpawnConfig {
    /// Logical process id. Generated when empty.
    #[serde(default)]
    pub id: String,
    /// Executable to run.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables added on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Restart on unexpected (non-zero) exit.
    #[serde(default)]
    pub auto_restart: bool,
    /// Overrides the supervisor-wide restart budget.
    #[serde(default)]
    pub max_restarts: Option<u32>,
    /// Overrides the supervisor-wide restart backoff base.
    #[serde(default)]
    pub restart_delay_ms: Option<u64>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

impl ProcessSpawnConfig {
    /// Create a config for `command` under the logical id `id`.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = Some(max);
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Command line for display.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ProcessSpawnConfig::new("echo", "echo")
            .with_arg("ready")
            .with_env("MODE", "test")
            .with_auto_restart(true)
            .with_max_restarts(2)
            .with_restart_delay(Duration::from_millis(250));

        assert_eq!(config.args, vec!["ready".to_string()]);
        assert_eq!(config.env.get("MODE"), Some(&"test".to_string()));
        assert!(config.auto_restart);
        assert_eq!(config.max_restarts, Some(2));
        assert_eq!(config.restart_delay_ms, Some(250));
        assert_eq!(config.command_line(), "echo ready");
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: ProcessSpawnConfig = serde_json::from_value(serde_json::json!({
            "id": "fs",
            "command": "npx",
            "args": ["-y", "server-filesystem"],
            "workingDir": "/tmp",
            "autoRestart": true,
            "resourceLimits": { "maxMemoryMB": 512, "maxCpuPercent": 80.0 }
        }))
        .unwrap();

        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert!(config.auto_restart);
        assert_eq!(config.resource_limits.max_memory_mb, Some(512.0));
        assert_eq!(config.resource_limits.max_cpu_percent, Some(80.0));
    }
}

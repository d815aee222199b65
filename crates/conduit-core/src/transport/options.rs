//! Per-medium channel configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ChannelDefaults;
use crate::error::{ConduitError, Result};

/// Whether a channel dials out or listens for a single peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Client,
    Server,
}

/// Settings shared by every stream-backed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelOptions {
    /// Message delimiter on the byte stream.
    pub delimiter: String,
    /// Only `utf8` is supported.
    pub encoding: String,
    /// Reconnect automatically after an established connection drops.
    pub reconnect: bool,
    /// Base delay; attempt `n` waits `n × reconnectDelayMs`.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Bound on a single connect attempt.
    pub timeout_ms: u64,
    pub max_frame_size: usize,
    /// Pending writes accepted before `send` starts waiting.
    pub write_queue_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            delimiter: ChannelDefaults::DELIMITER.to_string(),
            encoding: "utf8".to_string(),
            reconnect: true,
            reconnect_delay_ms: ChannelDefaults::RECONNECT_DELAY.as_millis() as u64,
            max_reconnect_attempts: ChannelDefaults::MAX_RECONNECT_ATTEMPTS,
            timeout_ms: ChannelDefaults::CONNECT_TIMEOUT.as_millis() as u64,
            max_frame_size: ChannelDefaults::MAX_FRAME_SIZE,
            write_queue_capacity: ChannelDefaults::WRITE_QUEUE_CAPACITY,
        }
    }
}

impl ChannelOptions {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(ConduitError::Validation {
                field: "delimiter".into(),
                message: "delimiter must not be empty".into(),
            });
        }
        let encoding = self.encoding.to_ascii_lowercase();
        if encoding != "utf8" && encoding != "utf-8" {
            return Err(ConduitError::Validation {
                field: "encoding".into(),
                message: format!("unsupported encoding '{}'", self.encoding),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConduitError::Validation {
                field: "maxFrameSize".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Unix domain socket channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSocketConfig {
    pub path: PathBuf,
    /// Socket file mode applied after bind (server mode), e.g. `384` or `"600"`.
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(flatten)]
    pub options: ChannelOptions,
}

impl DomainSocketConfig {
    pub fn new(path: impl Into<PathBuf>, mode: ChannelMode) -> Self {
        Self {
            path: path.into(),
            permissions: None,
            mode,
            options: ChannelOptions::default(),
        }
    }
}

/// What a named-pipe channel does where native named pipes do not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipeFallback {
    /// Use a domain socket at `<tmp>/<name>.sock`.
    #[default]
    DomainSocket,
    /// Fail `connect()` with `Unsupported`.
    Error,
}

/// Named pipe channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedPipeConfig {
    pub name: String,
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(default)]
    pub fallback: PipeFallback,
    #[serde(flatten)]
    pub options: ChannelOptions,
}

impl NamedPipeConfig {
    pub fn new(name: impl Into<String>, mode: ChannelMode) -> Self {
        Self {
            name: name.into(),
            mode,
            fallback: PipeFallback::default(),
            options: ChannelOptions::default(),
        }
    }

    /// Native pipe path, `\\.\pipe\<name>`.
    pub fn pipe_path(&self) -> String {
        if self.name.starts_with(r"\\.\pipe\") {
            self.name.clone()
        } else {
            format!(r"\\.\pipe\{}", self.name)
        }
    }

    /// Domain socket path used by the `domainSocket` fallback.
    pub fn fallback_path(&self) -> PathBuf {
        let name = self
            .name
            .trim_start_matches(r"\\.\pipe\")
            .replace(['/', '\\'], "_");
        std::env::temp_dir().join(format!("{}.sock", name))
    }
}

/// Network stream channel settings: either `host`+`port` or `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(flatten)]
    pub options: ChannelOptions,
}

impl NetworkConfig {
    pub fn new(host: impl Into<String>, port: u16, mode: ChannelMode) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            url: None,
            mode,
            options: ChannelOptions::default(),
        }
    }

    /// Resolve to a `host:port` string.
    pub fn address(&self) -> Result<String> {
        if let Some(raw) = &self.url {
            let parsed = url::Url::parse(raw).map_err(|e| ConduitError::Validation {
                field: "url".into(),
                message: format!("invalid url '{}': {}", raw, e),
            })?;
            let host = parsed.host_str().ok_or_else(|| ConduitError::Validation {
                field: "url".into(),
                message: format!("url '{}' has no host", raw),
            })?;
            let port = parsed
                .port_or_known_default()
                .ok_or_else(|| ConduitError::Validation {
                    field: "url".into(),
                    message: format!("url '{}' has no port", raw),
                })?;
            return Ok(format_host_port(host, port));
        }

        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        let port = self.port.ok_or_else(|| ConduitError::Validation {
            field: "port".into(),
            message: "either url or port is required".into(),
        })?;
        Ok(format_host_port(host, port))
    }
}

fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => {
            let digits = s.trim().trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid octal mode '{}'", s)))
        }
    }
}

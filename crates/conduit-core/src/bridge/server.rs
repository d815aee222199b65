//! Registered server records and their public views.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::transport::{Channel, ChannelStats, ConnectionState};

/// Lifecycle of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Registered,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Registered => "registered",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the latest health probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub id: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

pub(crate) struct RegisteredServer {
    pub id: String,
    pub transport: String,
    pub settings: Value,
    pub status: ServerStatus,
    /// Active connections in insertion order.
    pub connections: Vec<Arc<dyn Channel>>,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub forwarder: Option<JoinHandle<()>>,
    pub last_health: Option<HealthReport>,
}

impl RegisteredServer {
    pub fn new(id: String, transport: String, settings: Value) -> Self {
        Self {
            id,
            transport,
            settings,
            status: ServerStatus::Registered,
            connections: Vec::new(),
            last_error: None,
            registered_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            forwarder: None,
            last_health: None,
        }
    }

    /// The connection outbound messages use: the first one registered.
    pub fn select_connection(&self) -> Option<Arc<dyn Channel>> {
        self.connections.first().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connections.iter().any(|c| c.is_connected())
    }

    pub fn report(&self, queued: usize) -> ServerStatusReport {
        ServerStatusReport {
            id: self.id.clone(),
            transport: self.transport.clone(),
            status: self.status,
            connections: self
                .connections
                .iter()
                .map(|c| ConnectionReport {
                    channel_id: c.id().to_string(),
                    kind: c.kind(),
                    state: c.state(),
                    stats: c.stats(),
                })
                .collect(),
            last_error: self.last_error.clone(),
            registered_at: self.registered_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            queued_messages: queued,
            last_health: self.last_health.clone(),
        }
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            transport: self.transport.clone(),
            status: self.status,
            connected: self.is_connected(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub channel_id: String,
    pub kind: &'static str,
    pub state: ConnectionState,
    pub stats: ChannelStats,
}

/// Full status of one server, as exposed to the administrative surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusReport {
    pub id: String,
    pub transport: String,
    pub status: ServerStatus,
    pub connections: Vec<ConnectionReport>,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub queued_messages: usize,
    pub last_health: Option<HealthReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub transport: String,
    pub status: ServerStatus,
    pub connected: bool,
}

//! Typed lifecycle events and the broadcast bus that carries them.
//!
//! Every component publishes onto one shared [`EventBus`]. Consumers (the
//! logging/metrics collaborator, tests, the rpc daemon) hold a
//! [`broadcast::Receiver`] and see events in publish order. A receiver that
//! falls more than the channel capacity behind loses the oldest events, so the
//! bus is for observation only: protocol payloads are also delivered on
//! dedicated bounded queues.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::BridgeDefaults;

/// Which resource ceiling a sample breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLimitKind {
    Memory,
    Cpu,
}

/// Every event emitted by the supervisor, channels, router and orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    // Process Supervisor
    ProcessSpawned {
        id: String,
        pid: u32,
    },
    ProcessStopped {
        id: String,
        forced: bool,
    },
    ProcessExited {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    ProcessError {
        id: String,
        message: String,
    },
    ProcessStdout {
        id: String,
        line: String,
    },
    ProcessStderr {
        id: String,
        line: String,
    },
    ProcessRestarting {
        id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Restart budget exhausted; auto-restart is now disabled for the process.
    ProcessFailed {
        id: String,
        restarts: u32,
    },
    ProcessResourceLimit {
        id: String,
        kind: ResourceLimitKind,
        value: f64,
        limit: f64,
    },

    // Transport channels
    ChannelConnected {
        channel_id: String,
    },
    ChannelMessage {
        channel_id: String,
        message: Value,
    },
    ChannelError {
        channel_id: String,
        message: String,
        /// True once the channel has given up reconnecting.
        fatal: bool,
    },
    ChannelParseError {
        channel_id: String,
        raw: String,
        message: String,
    },
    ChannelClosed {
        channel_id: String,
    },
    ChannelReconnecting {
        channel_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    // Bridge Orchestrator
    TransportRegistered {
        kind: String,
    },
    ServerRegistered {
        id: String,
        transport: String,
    },
    ServerStarted {
        id: String,
    },
    ServerStopped {
        id: String,
    },
    ServerError {
        id: String,
        message: String,
    },
    ServerMessage {
        id: String,
        message: Value,
    },
    HealthCheck {
        id: String,
        healthy: bool,
        detail: Option<String>,
    },

    // Message Router
    RouteRegistered {
        source: String,
        destination: String,
    },
    MessageRouted {
        source: String,
        destination: String,
        message_id: String,
    },
    MessageQueued {
        destination: String,
        depth: usize,
    },
    CorrelationMatched {
        correlation_id: String,
        elapsed_ms: u64,
    },
    CorrelationTimeout {
        correlation_id: String,
        request: Value,
    },
    CorrelationExpired {
        correlation_id: String,
    },
}

impl BridgeEvent {
    /// Colon-separated event name, e.g. `process:spawned`.
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::ProcessSpawned { .. } => "process:spawned",
            BridgeEvent::ProcessStopped { .. } => "process:stopped",
            BridgeEvent::ProcessExited { .. } => "process:exited",
            BridgeEvent::ProcessError { .. } => "process:error",
            BridgeEvent::ProcessStdout { .. } => "process:stdout",
            BridgeEvent::ProcessStderr { .. } => "process:stderr",
            BridgeEvent::ProcessRestarting { .. } => "process:restarting",
            BridgeEvent::ProcessFailed { .. } => "process:failed",
            BridgeEvent::ProcessResourceLimit { .. } => "process:resource-limit",
            BridgeEvent::ChannelConnected { .. } => "channel:connect",
            BridgeEvent::ChannelMessage { .. } => "channel:message",
            BridgeEvent::ChannelError { .. } => "channel:error",
            BridgeEvent::ChannelParseError { .. } => "channel:parse-error",
            BridgeEvent::ChannelClosed { .. } => "channel:close",
            BridgeEvent::ChannelReconnecting { .. } => "channel:reconnecting",
            BridgeEvent::TransportRegistered { .. } => "transport:registered",
            BridgeEvent::ServerRegistered { .. } => "server:registered",
            BridgeEvent::ServerStarted { .. } => "server:started",
            BridgeEvent::ServerStopped { .. } => "server:stopped",
            BridgeEvent::ServerError { .. } => "server:error",
            BridgeEvent::ServerMessage { .. } => "server:message",
            BridgeEvent::HealthCheck { .. } => "health:check",
            BridgeEvent::RouteRegistered { .. } => "route:registered",
            BridgeEvent::MessageRouted { .. } => "message:routed",
            BridgeEvent::MessageQueued { .. } => "message:queued",
            BridgeEvent::CorrelationMatched { .. } => "correlation:matched",
            BridgeEvent::CorrelationTimeout { .. } => "correlation:timeout",
            BridgeEvent::CorrelationExpired { .. } => "correlation:expired",
        }
    }
}

/// Broadcast bus for [`BridgeEvent`]s. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<BridgeEvent>>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BridgeDefaults::EVENT_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of receivers that got it.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        trace!(event = event.name(), "Publishing event");
        // No receivers is fine
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BridgeEvent>> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let delivered = bus.publish(BridgeEvent::ServerStarted { id: "a".into() });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BridgeEvent::ServerRegistered {
            id: "a".into(),
            transport: "stdio".into(),
        });
        bus.publish(BridgeEvent::ServerStarted { id: "a".into() });

        assert_eq!(rx.recv().await.unwrap().name(), "server:registered");
        assert_eq!(rx.recv().await.unwrap().name(), "server:started");
    }

    #[test]
    fn test_clones_share_channel() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let _rx = bus.subscribe();
        assert_eq!(clone.subscriber_count(), 1);
        assert_eq!(
            clone.publish(BridgeEvent::ChannelClosed {
                channel_id: "c".into()
            }),
            1
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = BridgeEvent::CorrelationTimeout {
            correlation_id: "c-1".into(),
            request: serde_json::json!({"method": "tools/list"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "correlation_timeout");
        assert_eq!(json["request"]["method"], "tools/list");
        assert_eq!(event.name(), "correlation:timeout");
    }
}

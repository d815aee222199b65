//! Transport implementations registered with the orchestrator.
//!
//! A transport turns a server's opaque `settings` object into a connected
//! [`Channel`]. It keeps the channels it opened so it can report aggregate
//! metrics and close them all on shutdown.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{ConduitError, Result};
use crate::process::{ProcessSpawnConfig, ProcessSupervisor};
use crate::transport::{
    domain_socket_channel, named_pipe_channel, network_channel, Channel, ChannelContext,
    ChannelStats, DomainSocketConfig, NamedPipeConfig, NetworkConfig, StdioChannel, StreamChannel,
};

/// Aggregate metrics of one transport.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetrics {
    pub kind: String,
    pub open_channels: usize,
    pub connected_channels: usize,
    #[serde(flatten)]
    pub totals: ChannelStats,
}

/// A channel factory for one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind name servers refer to, e.g. `stdio`.
    fn kind(&self) -> &str;

    /// Check server settings at registration time.
    fn validate(&self, settings: &Value) -> Result<()>;

    /// One-time bootstrap, run by the orchestrator's `start()`.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Build and connect a channel for `server_id`.
    async fn open(
        &self,
        server_id: &str,
        settings: &Value,
        ctx: ChannelContext,
    ) -> Result<Arc<dyn Channel>>;

    /// Close a channel opened by this transport and forget it.
    async fn close_channel(&self, channel_id: &str) -> Result<()>;

    /// Close every open channel.
    async fn shutdown(&self) -> Result<()>;

    fn metrics(&self) -> TransportMetrics;
}

/// Channels opened by a transport, in opening order.
#[derive(Default)]
pub(crate) struct OpenChannels {
    channels: Mutex<Vec<Arc<dyn Channel>>>,
}

impl OpenChannels {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Channel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track(&self, channel: Arc<dyn Channel>) {
        let mut channels = self.lock();
        channels.retain(|c| c.id() != channel.id());
        channels.push(channel);
    }

    pub fn take(&self, channel_id: &str) -> Option<Arc<dyn Channel>> {
        let mut channels = self.lock();
        let pos = channels.iter().position(|c| c.id() == channel_id)?;
        Some(channels.remove(pos))
    }

    pub fn take_all(&self) -> Vec<Arc<dyn Channel>> {
        std::mem::take(&mut *self.lock())
    }

    pub fn metrics(&self, kind: &str) -> TransportMetrics {
        let channels = self.lock();
        let mut metrics = TransportMetrics {
            kind: kind.to_string(),
            open_channels: channels.len(),
            ..TransportMetrics::default()
        };
        for channel in channels.iter() {
            if channel.is_connected() {
                metrics.connected_channels += 1;
            }
            metrics.totals.accumulate(&channel.stats());
        }
        metrics
    }

    /// Close and forget one channel.
    pub async fn close(&self, channel_id: &str) -> Result<()> {
        match self.take(channel_id) {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Close every channel, returning the first failure after trying all.
    pub async fn close_all(&self, kind: &str) -> Result<()> {
        let mut first_error = None;
        for channel in self.take_all() {
            if let Err(e) = channel.close().await {
                warn!("Transport {}: closing {} failed: {}", kind, channel.id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn parse_settings<C: DeserializeOwned>(kind: &str, settings: &Value) -> Result<C> {
    serde_json::from_value(settings.clone()).map_err(|e| ConduitError::Config {
        message: format!("invalid {} settings: {}", kind, e),
    })
}

/// Connect `channel`, releasing it again if the first connect fails.
async fn connect_new(channel: Arc<dyn Channel>) -> Result<Arc<dyn Channel>> {
    if let Err(e) = channel.connect().await {
        let _ = channel.close().await;
        return Err(e);
    }
    Ok(channel)
}

// ========================================
// stdio
// ========================================

/// Process-backed servers. Settings are a [`ProcessSpawnConfig`]; the
/// process id defaults to the server id.
pub struct StdioTransport {
    supervisor: Arc<ProcessSupervisor>,
    channels: OpenChannels,
}

impl StdioTransport {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            channels: OpenChannels::default(),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &str {
        crate::transport::stdio::KIND
    }

    fn validate(&self, settings: &Value) -> Result<()> {
        let config: ProcessSpawnConfig = parse_settings(self.kind(), settings)?;
        if config.command.trim().is_empty() {
            return Err(ConduitError::Validation {
                field: "command".to_string(),
                message: "command is required".to_string(),
            });
        }
        Ok(())
    }

    async fn open(
        &self,
        server_id: &str,
        settings: &Value,
        ctx: ChannelContext,
    ) -> Result<Arc<dyn Channel>> {
        let spawn: ProcessSpawnConfig = parse_settings(self.kind(), settings)?;
        let channel: Arc<dyn Channel> = Arc::new(StdioChannel::new(
            server_id,
            Arc::clone(&self.supervisor),
            spawn,
            ctx,
        ));
        let channel = connect_new(channel).await?;
        self.channels.track(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close_channel(&self, channel_id: &str) -> Result<()> {
        self.channels.close(channel_id).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.channels.close_all(self.kind()).await
    }

    fn metrics(&self) -> TransportMetrics {
        self.channels.metrics(self.kind())
    }
}

// ========================================
// Byte-stream media
// ========================================

type ChannelBuilder<C> = fn(String, &C, ChannelContext) -> Result<StreamChannel>;

/// Domain socket, named pipe and network transports.
pub struct StreamTransport<C> {
    kind: &'static str,
    build: ChannelBuilder<C>,
    channels: OpenChannels,
    _settings: PhantomData<fn() -> C>,
}

impl StreamTransport<DomainSocketConfig> {
    pub fn domain_socket() -> Self {
        Self::with_builder(crate::transport::domain_socket::KIND, |id, c, ctx| {
            domain_socket_channel(id, c, ctx)
        })
    }
}

impl StreamTransport<NamedPipeConfig> {
    pub fn named_pipe() -> Self {
        Self::with_builder(crate::transport::named_pipe::KIND, |id, c, ctx| {
            named_pipe_channel(id, c, ctx)
        })
    }
}

impl StreamTransport<NetworkConfig> {
    pub fn network() -> Self {
        Self::with_builder(crate::transport::network::KIND, |id, c, ctx| {
            network_channel(id, c, ctx)
        })
    }
}

impl<C> StreamTransport<C> {
    fn with_builder(kind: &'static str, build: ChannelBuilder<C>) -> Self {
        Self {
            kind,
            build,
            channels: OpenChannels::default(),
            _settings: PhantomData,
        }
    }
}

#[async_trait]
impl<C> Transport for StreamTransport<C>
where
    C: DeserializeOwned + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        self.kind
    }

    fn validate(&self, settings: &Value) -> Result<()> {
        let config: C = parse_settings(self.kind, settings)?;
        // Building checks addresses and options without touching the OS.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let probe = ChannelContext::new(crate::events::EventBus::with_capacity(1), tx);
        (self.build)("validate".to_string(), &config, probe).map(|_| ())
    }

    async fn open(
        &self,
        server_id: &str,
        settings: &Value,
        ctx: ChannelContext,
    ) -> Result<Arc<dyn Channel>> {
        let config: C = parse_settings(self.kind, settings)?;
        let channel: Arc<dyn Channel> = Arc::new((self.build)(server_id.to_string(), &config, ctx)?);
        let channel = connect_new(channel).await?;
        debug!("Transport {} opened channel {}", self.kind, server_id);
        self.channels.track(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close_channel(&self, channel_id: &str) -> Result<()> {
        self.channels.close(channel_id).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.channels.close_all(self.kind).await
    }

    fn metrics(&self) -> TransportMetrics {
        self.channels.metrics(self.kind)
    }
}

/// The four media every orchestrator starts with.
pub fn builtin_transports(supervisor: Arc<ProcessSupervisor>) -> Vec<Arc<dyn Transport>> {
    vec![
        Arc::new(StdioTransport::new(supervisor)),
        Arc::new(StreamTransport::domain_socket()),
        Arc::new(StreamTransport::named_pipe()),
        Arc::new(StreamTransport::network()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::events::EventBus;
    use serde_json::json;

    #[test]
    fn test_stdio_validation() {
        let transport = StdioTransport::new(ProcessSupervisor::new(
            SupervisorConfig::default(),
            EventBus::new(),
        ));
        assert!(transport.validate(&json!({"command": "cat"})).is_ok());
        assert!(matches!(
            transport.validate(&json!({"command": " "})),
            Err(ConduitError::Validation { .. })
        ));
        assert!(matches!(
            transport.validate(&json!({"args": []})),
            Err(ConduitError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_validation() {
        let network = StreamTransport::network();
        assert_eq!(network.kind(), "network");
        assert!(network.validate(&json!({"host": "127.0.0.1", "port": 9000})).is_ok());
        assert!(network.validate(&json!({"url": "not a url"})).is_err());

        let socket = StreamTransport::domain_socket();
        assert!(socket.validate(&json!({"path": "/tmp/x.sock"})).is_ok());
        assert!(socket.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_failed_open_is_not_tracked() {
        let socket = StreamTransport::domain_socket();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let ctx = ChannelContext::new(EventBus::new(), tx);
        let result = socket
            .open("ghost", &json!({"path": "/nonexistent/dir/ghost.sock", "reconnect": false}), ctx)
            .await;
        assert!(result.is_err());
        assert_eq!(socket.metrics().open_channels, 0);
    }
}

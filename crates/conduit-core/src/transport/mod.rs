//! Transport channels: one connect/send/close abstraction over process
//! stdio, Unix domain sockets, named pipes and network streams.
//!
//! Every channel frames JSON messages with a delimiter, delivers inbound
//! messages on the bounded queue of its [`ChannelContext`], and publishes
//! lifecycle events on the shared bus. Stream-backed media share one engine
//! ([`StreamChannel`]); only dialing and accepting differ per medium.

pub(crate) mod domain_socket;
pub mod framing;
pub(crate) mod named_pipe;
pub(crate) mod network;
mod options;
pub(crate) mod stdio;
mod stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::EventBus;

pub use domain_socket::domain_socket_channel;
pub use framing::{encode_frame, Frame, FrameDecoder};
pub use named_pipe::named_pipe_channel;
pub use network::network_channel;
pub use options::{
    ChannelMode, ChannelOptions, DomainSocketConfig, NamedPipeConfig, NetworkConfig, PipeFallback,
};
pub use stdio::StdioChannel;
pub use stream::StreamChannel;

/// Connection lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Dialing, reconnecting, or listening with no peer yet.
    Connecting,
    Connected,
    Closing,
}

/// A message received on a channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub payload: Value,
}

/// Where a channel delivers what it receives.
#[derive(Clone)]
pub struct ChannelContext {
    pub events: EventBus,
    pub inbound: mpsc::Sender<InboundMessage>,
}

impl ChannelContext {
    pub fn new(events: EventBus, inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self { events, inbound }
    }
}

/// Point-in-time counters of one channel.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub connected_since: Option<DateTime<Utc>>,
}

impl ChannelStats {
    /// Add `other`'s counters into `self`.
    pub fn accumulate(&mut self, other: &ChannelStats) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.parse_errors += other.parse_errors;
        self.reconnects += other.reconnects;
    }
}

/// Lock-free counters behind [`ChannelStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl StatsCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        let mut since = self.connected_since.lock().unwrap_or_else(|e| e.into_inner());
        *since = connected.then(Utc::now);
    }

    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected_since: *self.connected_since.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// A bidirectional, framed message channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    /// Medium name, e.g. `domain_socket`.
    fn kind(&self) -> &'static str;

    /// Dial (client mode) or start listening (server mode). A failure
    /// before the first established connection is returned here.
    async fn connect(&self) -> Result<()>;

    /// Frame and write one message. Waits while the write queue is full;
    /// fails with `NotConnected` unless the channel is connected.
    async fn send(&self, message: &Value) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn stats(&self) -> ChannelStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters_snapshot() {
        let counters = StatsCounters::default();
        counters.record_sent(10);
        counters.record_sent(5);
        counters.record_received();
        counters.record_bytes_received(42);
        counters.record_parse_error();
        counters.set_connected(true);

        let stats = counters.snapshot();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 42);
        assert_eq!(stats.parse_errors, 1);
        assert!(stats.connected_since.is_some());

        counters.set_connected(false);
        assert!(counters.snapshot().connected_since.is_none());
    }

    #[test]
    fn test_stats_accumulate() {
        let mut total = ChannelStats::default();
        let one = ChannelStats {
            messages_sent: 3,
            bytes_sent: 30,
            reconnects: 1,
            ..ChannelStats::default()
        };
        total.accumulate(&one);
        total.accumulate(&one);
        assert_eq!(total.messages_sent, 6);
        assert_eq!(total.bytes_sent, 60);
        assert_eq!(total.reconnects, 2);
    }
}

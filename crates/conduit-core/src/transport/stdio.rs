//! Process stdio channels.
//!
//! The channel does not own the child directly: it asks the supervisor to
//! spawn it, writes requests as stdin lines, and reads responses from the
//! supervisor's stdout tap. Crash/restart handling stays with the supervisor;
//! the tap survives restarts, so the channel reconnects implicitly when the
//! process comes back.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::framing::{Frame, FrameDecoder};
use super::{Channel, ChannelContext, ChannelStats, ConnectionState, InboundMessage, StatsCounters};
use crate::config::ChannelDefaults;
use crate::error::{ConduitError, Result};
use crate::events::BridgeEvent;
use crate::process::{ProcessSpawnConfig, ProcessStatus, ProcessSupervisor};

pub(crate) const KIND: &str = "stdio";

/// A channel to a supervised process's stdin/stdout.
pub struct StdioChannel {
    id: String,
    supervisor: Arc<ProcessSupervisor>,
    spawn: ProcessSpawnConfig,
    ctx: ChannelContext,
    connected: Mutex<bool>,
    stats: Arc<StatsCounters>,
    pump: Mutex<Option<JoinHandle<()>>>,
    lifecycle: AsyncMutex<()>,
}

impl StdioChannel {
    /// The process id defaults to the channel id.
    pub fn new(
        id: impl Into<String>,
        supervisor: Arc<ProcessSupervisor>,
        mut spawn: ProcessSpawnConfig,
        ctx: ChannelContext,
    ) -> Self {
        let id = id.into();
        if spawn.id.trim().is_empty() {
            spawn.id = id.clone();
        }
        Self {
            id,
            supervisor,
            spawn,
            ctx,
            connected: Mutex::new(false),
            stats: Arc::new(StatsCounters::default()),
            pump: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// Supervisor id of the backing process.
    pub fn process_id(&self) -> &str {
        &self.spawn.id
    }

    fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap_or_else(|e| e.into_inner()) = connected;
        self.stats.set_connected(connected);
    }

    fn is_open(&self) -> bool {
        *self.connected.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn attach(&self) -> Result<mpsc::Receiver<String>> {
        let pid = self.process_id();
        match self.supervisor.get_process_status(pid) {
            Ok(status) if status.status.is_live() => {
                debug!("Channel {} attaching to running process {}", self.id, pid);
                self.supervisor.subscribe_output(pid)
            }
            Ok(_) => {
                // A terminal record from an earlier session.
                self.supervisor.remove(pid)?;
                let (_, rx) = self.supervisor.spawn_with_output(self.spawn.clone()).await?;
                Ok(rx)
            }
            Err(ConduitError::ProcessNotFound { .. }) => {
                let (_, rx) = self.supervisor.spawn_with_output(self.spawn.clone()).await?;
                Ok(rx)
            }
            Err(e) => Err(e),
        }
    }
}

async fn pump(
    channel_id: String,
    mut lines: mpsc::Receiver<String>,
    ctx: ChannelContext,
    stats: Arc<StatsCounters>,
) {
    let mut decoder = FrameDecoder::new(ChannelDefaults::DELIMITER, ChannelDefaults::MAX_FRAME_SIZE);
    while let Some(line) = lines.recv().await {
        stats.record_bytes_received(line.len() + 1);
        decoder.extend(line.as_bytes());
        decoder.extend(b"\n");

        while let Some(frame) = decoder.next_frame() {
            match frame {
                Frame::Message(payload) => {
                    stats.record_received();
                    ctx.events.publish(BridgeEvent::ChannelMessage {
                        channel_id: channel_id.clone(),
                        message: payload.clone(),
                    });
                    let inbound = InboundMessage {
                        channel_id: channel_id.clone(),
                        payload,
                    };
                    if ctx.inbound.send(inbound).await.is_err() {
                        trace!("Channel {}: inbound consumer gone", channel_id);
                    }
                }
                Frame::Malformed { raw, error } => {
                    stats.record_parse_error();
                    debug!("Channel {}: non-JSON stdout line: {}", channel_id, error);
                    ctx.events.publish(BridgeEvent::ChannelParseError {
                        channel_id: channel_id.clone(),
                        raw,
                        message: error,
                    });
                }
            }
        }
    }
    debug!("Channel {}: stdout tap closed", channel_id);
}

#[async_trait]
impl Channel for StdioChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_open() && self.supervisor.is_running(self.process_id()) {
            return Ok(());
        }

        let lines = match self.attach().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Channel {} failed to start {}: {}", self.id, self.spawn.command, e);
                self.ctx.events.publish(BridgeEvent::ChannelError {
                    channel_id: self.id.clone(),
                    message: e.to_string(),
                    fatal: false,
                });
                return Err(e);
            }
        };

        let previous = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(tokio::spawn(pump(
                self.id.clone(),
                lines,
                self.ctx.clone(),
                Arc::clone(&self.stats),
            )));
        if let Some(previous) = previous {
            previous.abort();
        }

        self.set_connected(true);
        info!("Channel {} connected to process {}", self.id, self.process_id());
        self.ctx.events.publish(BridgeEvent::ChannelConnected {
            channel_id: self.id.clone(),
        });
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ConduitError::NotConnected {
                channel: self.id.clone(),
            });
        }
        let line = serde_json::to_string(message)?;
        self.supervisor.write_line(self.process_id(), &line).await?;
        self.stats.record_sent(line.len() + 1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if pump.is_none() && !self.is_open() {
            return Ok(());
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        match self.supervisor.stop_default(self.process_id()).await {
            Ok(()) | Err(ConduitError::ProcessNotFound { .. }) => {}
            Err(e) => warn!("Channel {}: stopping process failed: {}", self.id, e),
        }

        self.set_connected(false);
        info!("Channel {} closed", self.id);
        self.ctx.events.publish(BridgeEvent::ChannelClosed {
            channel_id: self.id.clone(),
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if !self.is_open() {
            return ConnectionState::Disconnected;
        }
        match self.supervisor.get_process_status(self.process_id()) {
            Ok(s) => match s.status {
                ProcessStatus::Running => ConnectionState::Connected,
                ProcessStatus::Starting => ConnectionState::Connecting,
                ProcessStatus::Stopping => ConnectionState::Closing,
                ProcessStatus::Exited if s.auto_restart && s.exit_code != Some(0) => {
                    ConnectionState::Connecting
                }
                _ => ConnectionState::Disconnected,
            },
            Err(_) => ConnectionState::Disconnected,
        }
    }

    fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::events::EventBus;
    use serde_json::json;
    use std::time::Duration;

    fn setup(
        spawn: ProcessSpawnConfig,
    ) -> (StdioChannel, Arc<ProcessSupervisor>, mpsc::Receiver<InboundMessage>) {
        let events = EventBus::new();
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default(), events.clone());
        let (tx, rx) = mpsc::channel(16);
        let channel = StdioChannel::new(
            "echo-server",
            Arc::clone(&supervisor),
            spawn,
            ChannelContext::new(events, tx),
        );
        (channel, supervisor, rx)
    }

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let (channel, supervisor, mut rx) = setup(ProcessSpawnConfig::new("", "cat"));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.connect().await.unwrap();
        assert_eq!(channel.process_id(), "echo-server");
        assert!(channel.is_connected());

        channel.send(&json!({"jsonrpc": "2.0", "id": 7})).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, json!({"jsonrpc": "2.0", "id": 7}));
        assert_eq!(msg.channel_id, "echo-server");

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(
            supervisor.get_process_status("echo-server").unwrap().status,
            ProcessStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_non_json_output_is_a_parse_error() {
        let (channel, _supervisor, mut rx) = setup(
            ProcessSpawnConfig::new("", "sh").with_args(["-c", "echo booting; echo '{\"ready\":true}'; cat"]),
        );
        channel.connect().await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, json!({"ready": true}));
        assert_eq!(channel.stats().parse_errors, 1);
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_close_spawns_fresh_process() {
        let (channel, supervisor, _rx) = setup(ProcessSpawnConfig::new("", "cat"));
        channel.connect().await.unwrap();
        let first = supervisor.get_process_status("echo-server").unwrap().pid;
        channel.close().await.unwrap();

        channel.connect().await.unwrap();
        let second = supervisor.get_process_status("echo-server").unwrap().pid;
        assert_ne!(first, second);
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_fails_connect() {
        let (channel, _supervisor, _rx) = setup(ProcessSpawnConfig::new("", "/no/such/binary"));
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::SpawnFailure { .. }));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}

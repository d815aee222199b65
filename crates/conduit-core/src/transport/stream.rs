//! Shared engine for byte-stream channels.
//!
//! A medium only supplies an [`Endpoint`] that can dial a peer or bind an
//! [`Acceptor`]. The engine owns the rest: framing, the writer task and its
//! bounded queue, reconnect with linear backoff (client mode), single-peer
//! replacement (server mode), stats and lifecycle events.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::framing::{encode_frame, Frame, FrameDecoder};
use super::options::{ChannelMode, ChannelOptions};
use super::{Channel, ChannelContext, ChannelStats, ConnectionState, InboundMessage, StatsCounters};
use crate::cancel::CancellationToken;
use crate::config::ChannelDefaults;
use crate::error::{ConduitError, Result};
use crate::events::BridgeEvent;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type Duplex = (BoxedReader, BoxedWriter);

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How a medium reaches its peer.
#[async_trait]
pub(crate) trait Endpoint: Send + Sync + 'static {
    /// Human-readable address for logs and errors.
    fn describe(&self) -> String;

    /// Reject the endpoint before any I/O is attempted.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn dial(&self) -> io::Result<Duplex>;

    async fn bind(&self) -> io::Result<Box<dyn Acceptor>>;

    /// Remove filesystem artifacts left by `bind`.
    fn cleanup(&self) {}
}

#[async_trait]
pub(crate) trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<Duplex>;
}

struct WriteRequest {
    bytes: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

struct ActiveLink {
    serial: u64,
    writer: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
}

struct InstalledLink {
    serial: u64,
    cancel: CancellationToken,
    reader: BoxedReader,
}

enum LinkEnd {
    Cancelled,
    Replaced,
    Eof,
    Failed(String),
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    id: String,
    options: ChannelOptions,
    ctx: ChannelContext,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<ActiveLink>>,
    stats: StatsCounters,
    next_serial: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn delimiter(&self) -> &[u8] {
        self.options.delimiter.as_bytes()
    }

    /// Make `duplex` the active connection, replacing any previous one.
    fn install(&self, duplex: Duplex) -> InstalledLink {
        let (reader, writer) = duplex;
        let capacity = self.options.write_queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        tokio::spawn(write_loop(writer, rx, cancel.clone()));

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ActiveLink {
                serial,
                writer: tx,
                cancel: cancel.clone(),
            });
        if let Some(previous) = previous {
            debug!("Channel {}: new peer replaces connection #{}", self.id, previous.serial);
            previous.cancel.cancel();
        }

        self.set_state(ConnectionState::Connected);
        self.stats.set_connected(true);
        info!("Channel {} connected", self.id);
        self.ctx.events.publish(BridgeEvent::ChannelConnected {
            channel_id: self.id.clone(),
        });

        InstalledLink {
            serial,
            cancel,
            reader,
        }
    }

    /// Drop the active link if it is still `serial`. Returns whether it was.
    fn release(&self, serial: u64) -> bool {
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        if link.as_ref().map(|l| l.serial) != Some(serial) {
            return false;
        }
        if let Some(active) = link.take() {
            active.cancel.cancel();
        }
        self.stats.set_connected(false);
        true
    }

    fn writer(&self) -> Option<mpsc::Sender<WriteRequest>> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.writer.clone())
    }

    async fn read_loop(&self, link: &mut InstalledLink, session: &CancellationToken) -> LinkEnd {
        let mut decoder = FrameDecoder::new(self.delimiter(), self.options.max_frame_size);
        let mut buf = vec![0u8; ChannelDefaults::READ_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = session.cancelled() => return LinkEnd::Cancelled,
                _ = link.cancel.cancelled() => return LinkEnd::Replaced,
                read = link.reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => return LinkEnd::Eof,
                Ok(n) => n,
                Err(e) => return LinkEnd::Failed(e.to_string()),
            };

            self.stats.record_bytes_received(n);
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                self.deliver(frame).await;
            }
        }
    }

    async fn deliver(&self, frame: Frame) {
        match frame {
            Frame::Message(payload) => {
                self.stats.record_received();
                self.ctx.events.publish(BridgeEvent::ChannelMessage {
                    channel_id: self.id.clone(),
                    message: payload.clone(),
                });
                let inbound = InboundMessage {
                    channel_id: self.id.clone(),
                    payload,
                };
                if self.ctx.inbound.send(inbound).await.is_err() {
                    trace!("Channel {}: inbound consumer gone", self.id);
                }
            }
            Frame::Malformed { raw, error } => {
                self.stats.record_parse_error();
                warn!("Channel {}: dropping malformed frame: {}", self.id, error);
                self.ctx.events.publish(BridgeEvent::ChannelParseError {
                    channel_id: self.id.clone(),
                    raw,
                    message: error,
                });
            }
        }
    }

    fn report_lost(&self, reason: &str) {
        warn!("Channel {} lost its connection: {}", self.id, reason);
        self.ctx.events.publish(BridgeEvent::ChannelError {
            channel_id: self.id.clone(),
            message: reason.to_string(),
            fatal: false,
        });
    }

    async fn reconnect(&self, endpoint: &dyn Endpoint, session: &CancellationToken) -> Option<Duplex> {
        let max = self.options.max_reconnect_attempts;
        for attempt in 1..=max {
            let delay = self.options.reconnect_delay() * attempt;
            info!(
                "Channel {} reconnecting in {:?} (attempt {}/{})",
                self.id, delay, attempt, max
            );
            self.ctx.events.publish(BridgeEvent::ChannelReconnecting {
                channel_id: self.id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = session.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match tokio::time::timeout(self.options.timeout(), endpoint.dial()).await {
                Ok(Ok(duplex)) => {
                    self.stats.record_reconnect();
                    return Some(duplex);
                }
                Ok(Err(e)) => debug!("Channel {} reconnect attempt {} failed: {}", self.id, attempt, e),
                Err(_) => debug!("Channel {} reconnect attempt {} timed out", self.id, attempt),
            }
        }
        None
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let result = match writer.write_all(&request.bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        let _ = request.done.send(result);
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_client(
    shared: Arc<Shared>,
    endpoint: Arc<dyn Endpoint>,
    first: InstalledLink,
    session: CancellationToken,
) {
    let mut current = first;
    loop {
        let end = shared.read_loop(&mut current, &session).await;
        shared.release(current.serial);

        let reason = match end {
            LinkEnd::Cancelled | LinkEnd::Replaced => return,
            LinkEnd::Eof => "peer closed the connection".to_string(),
            LinkEnd::Failed(e) => e,
        };
        if session.is_cancelled() {
            return;
        }
        shared.report_lost(&reason);

        if !shared.options.reconnect {
            shared.set_state(ConnectionState::Disconnected);
            shared.ctx.events.publish(BridgeEvent::ChannelClosed {
                channel_id: shared.id.clone(),
            });
            return;
        }

        shared.set_state(ConnectionState::Connecting);
        match shared.reconnect(endpoint.as_ref(), &session).await {
            Some(duplex) => current = shared.install(duplex),
            None => {
                if session.is_cancelled() {
                    return;
                }
                shared.set_state(ConnectionState::Disconnected);
                let message = format!(
                    "gave up reconnecting to {} after {} attempts",
                    endpoint.describe(),
                    shared.options.max_reconnect_attempts
                );
                error!("Channel {}: {}", shared.id, message);
                shared.ctx.events.publish(BridgeEvent::ChannelError {
                    channel_id: shared.id.clone(),
                    message,
                    fatal: true,
                });
                return;
            }
        }
    }
}

async fn run_listener(shared: Arc<Shared>, mut acceptor: Box<dyn Acceptor>, session: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = session.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        let duplex = match accepted {
            Ok(duplex) => duplex,
            Err(e) => {
                warn!("Channel {} accept error: {}", shared.id, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let mut link = shared.install(duplex);
        let shared = Arc::clone(&shared);
        let session = session.clone();
        tokio::spawn(async move {
            let end = shared.read_loop(&mut link, &session).await;
            let current = shared.release(link.serial);
            if current && !session.is_cancelled() {
                let reason = match end {
                    LinkEnd::Failed(e) => e,
                    _ => "peer disconnected".to_string(),
                };
                shared.set_state(ConnectionState::Connecting);
                shared.report_lost(&reason);
            }
        });
    }
    debug!("Channel {} stopped accepting", shared.id);
}

/// A channel over any dialable/bindable byte stream.
pub struct StreamChannel {
    kind: &'static str,
    mode: ChannelMode,
    endpoint: Arc<dyn Endpoint>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    /// Serializes connect and close.
    lifecycle: AsyncMutex<()>,
}

impl StreamChannel {
    pub(crate) fn new(
        id: impl Into<String>,
        kind: &'static str,
        mode: ChannelMode,
        options: ChannelOptions,
        endpoint: Arc<dyn Endpoint>,
        ctx: ChannelContext,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            kind,
            mode,
            endpoint,
            shared: Arc::new(Shared {
                id: id.into(),
                options,
                ctx,
                state: Mutex::new(ConnectionState::Disconnected),
                link: Mutex::new(None),
                stats: StatsCounters::default(),
                next_serial: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        })
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Address this channel dials or listens on.
    pub fn address(&self) -> String {
        self.endpoint.describe()
    }

    fn session_active(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    fn fail_connect(&self, err: ConduitError) -> ConduitError {
        self.shared.set_state(ConnectionState::Disconnected);
        warn!("Channel {} failed to connect: {}", self.shared.id, err);
        self.shared.ctx.events.publish(BridgeEvent::ChannelError {
            channel_id: self.shared.id.clone(),
            message: err.to_string(),
            fatal: false,
        });
        err
    }
}

#[async_trait]
impl Channel for StreamChannel {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.session_active() {
            return Ok(());
        }
        self.endpoint.check()?;
        self.shared.set_state(ConnectionState::Connecting);

        let session = CancellationToken::new();
        let task = match self.mode {
            ChannelMode::Client => {
                debug!("Channel {} dialing {}", self.shared.id, self.endpoint.describe());
                let timeout = self.shared.options.timeout();
                let duplex = match tokio::time::timeout(timeout, self.endpoint.dial()).await {
                    Ok(Ok(duplex)) => duplex,
                    Ok(Err(e)) => {
                        return Err(self.fail_connect(ConduitError::transport(format!(
                            "connect to {} failed: {}",
                            self.endpoint.describe(),
                            e
                        ))));
                    }
                    Err(_) => return Err(self.fail_connect(ConduitError::Timeout(timeout))),
                };
                let first = self.shared.install(duplex);
                tokio::spawn(run_client(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.endpoint),
                    first,
                    session.clone(),
                ))
            }
            ChannelMode::Server => {
                let acceptor = self.endpoint.bind().await.map_err(|e| {
                    self.fail_connect(ConduitError::transport(format!(
                        "listen on {} failed: {}",
                        self.endpoint.describe(),
                        e
                    )))
                })?;
                info!(
                    "Channel {} listening on {}",
                    self.shared.id,
                    self.endpoint.describe()
                );
                tokio::spawn(run_listener(
                    Arc::clone(&self.shared),
                    acceptor,
                    session.clone(),
                ))
            }
        };

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(Session {
            cancel: session,
            task,
        });
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<()> {
        let not_connected = || ConduitError::NotConnected {
            channel: self.shared.id.clone(),
        };
        if self.shared.state() != ConnectionState::Connected {
            return Err(not_connected());
        }
        let writer = self.shared.writer().ok_or_else(not_connected)?;

        let bytes = encode_frame(message, self.shared.delimiter())?;
        let len = bytes.len();
        let (done_tx, done_rx) = oneshot::channel();
        writer
            .send(WriteRequest {
                bytes,
                done: done_tx,
            })
            .await
            .map_err(|_| not_connected())?;

        match done_rx.await {
            Ok(Ok(())) => {
                self.shared.stats.record_sent(len);
                Ok(())
            }
            Ok(Err(e)) => Err(ConduitError::transport(format!(
                "write on {} failed: {}",
                self.shared.id, e
            ))),
            Err(_) => Err(ConduitError::transport(format!(
                "connection {} closed before the write completed",
                self.shared.id
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut session) = session else {
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        };

        self.shared.set_state(ConnectionState::Closing);
        session.cancel.cancel();
        let link = self.shared.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.cancel.cancel();
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut session.task).await.is_err() {
            session.task.abort();
        }

        self.shared.stats.set_connected(false);
        if self.mode == ChannelMode::Server {
            self.endpoint.cleanup();
        }
        self.shared.set_state(ConnectionState::Disconnected);

        info!("Channel {} closed", self.shared.id);
        self.shared.ctx.events.publish(BridgeEvent::ChannelClosed {
            channel_id: self.shared.id.clone(),
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn stats(&self) -> ChannelStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            session.cancel.cancel();
            session.task.abort();
            if self.mode == ChannelMode::Server {
                self.endpoint.cleanup();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use serde_json::json;
    use tokio::io::DuplexStream;

    /// Endpoint over in-memory pipes. Each dial hands the far end to the test.
    struct MemoryEndpoint {
        peers: mpsc::UnboundedSender<DuplexStream>,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Endpoint for MemoryEndpoint {
        fn describe(&self) -> String {
            "memory".into()
        }

        async fn dial(&self) -> io::Result<Duplex> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (near, far) = tokio::io::duplex(64);
            let _ = self.peers.send(far);
            let (r, w) = tokio::io::split(near);
            Ok((Box::new(r), Box::new(w)))
        }

        async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "client only"))
        }
    }

    fn channel(
        options: ChannelOptions,
        refuse: bool,
    ) -> (
        StreamChannel,
        mpsc::UnboundedReceiver<DuplexStream>,
        mpsc::Receiver<InboundMessage>,
        EventBus,
    ) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let events = EventBus::new();
        let endpoint = Arc::new(MemoryEndpoint {
            peers: peers_tx,
            refuse: std::sync::atomic::AtomicBool::new(refuse),
        });
        let ch = StreamChannel::new(
            "mem",
            "memory",
            ChannelMode::Client,
            options,
            endpoint,
            ChannelContext::new(events.clone(), inbound_tx),
        )
        .unwrap();
        (ch, peers_rx, inbound_rx, events)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (ch, _peers, _inbound, _events) = channel(ChannelOptions::default(), false);
        let err = ch.send(&json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, ConduitError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_returned() {
        let (ch, _peers, _inbound, _events) = channel(ChannelOptions::default(), true);
        let err = ch.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::TransportFailure { .. }));
        assert_eq!(ch.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_and_receive_frames() {
        let (ch, mut peers, mut inbound, _events) = channel(ChannelOptions::default(), false);
        ch.connect().await.unwrap();
        assert!(ch.is_connected());
        let mut peer = peers.recv().await.unwrap();

        ch.send(&json!({"id": 1})).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"id\":1}\n");

        peer.write_all(b"{\"id\":2}\n{\"id\"").await.unwrap();
        peer.write_all(b":3}\n").await.unwrap();
        let first = inbound.recv().await.unwrap();
        let second = inbound.recv().await.unwrap();
        assert_eq!(first.payload, json!({"id": 2}));
        assert_eq!(second.payload, json!({"id": 3}));
        assert_eq!(first.channel_id, "mem");

        let stats = ch.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 2);
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_error_keeps_channel_open() {
        let (ch, mut peers, mut inbound, events) = channel(ChannelOptions::default(), false);
        let mut rx = events.subscribe();
        ch.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        peer.write_all(b"garbage\n{\"ok\":true}\n").await.unwrap();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.payload, json!({"ok": true}));
        assert!(ch.is_connected());
        assert_eq!(ch.stats().parse_errors, 1);

        let mut saw_parse_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), BridgeEvent::ChannelParseError { .. }) {
                saw_parse_error = true;
            }
        }
        assert!(saw_parse_error);
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let options = ChannelOptions {
            reconnect_delay_ms: 10,
            ..ChannelOptions::default()
        };
        let (ch, mut peers, mut inbound, _events) = channel(options, false);
        ch.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        drop(first);

        let mut second = tokio::time::timeout(Duration::from_secs(5), peers.recv())
            .await
            .unwrap()
            .unwrap();
        second.write_all(b"{\"after\":\"reconnect\"}\n").await.unwrap();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.payload, json!({"after": "reconnect"}));
        assert_eq!(ch.stats().reconnects, 1);
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let options = ChannelOptions {
            reconnect_delay_ms: 5,
            max_reconnect_attempts: 2,
            ..ChannelOptions::default()
        };
        let (peers_tx, mut peers_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let endpoint = Arc::new(MemoryEndpoint {
            peers: peers_tx,
            refuse: std::sync::atomic::AtomicBool::new(false),
        });
        let ch = StreamChannel::new(
            "mem",
            "memory",
            ChannelMode::Client,
            options,
            Arc::clone(&endpoint) as Arc<dyn Endpoint>,
            ChannelContext::new(events.clone(), inbound_tx),
        )
        .unwrap();

        ch.connect().await.unwrap();
        endpoint.refuse.store(true, Ordering::SeqCst);
        drop(peers_rx.recv().await.unwrap());

        let fatal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if let BridgeEvent::ChannelError { fatal: true, .. } = event.as_ref() {
                    return true;
                }
            }
        })
        .await
        .unwrap();
        assert!(fatal);
        assert_eq!(ch.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ch, _peers, _inbound, _events) = channel(ChannelOptions::default(), false);
        ch.connect().await.unwrap();
        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert_eq!(ch.state(), ConnectionState::Disconnected);
        assert!(ch.send(&json!({})).await.is_err());
    }
}

//! The bridge orchestrator.
//!
//! Owns the transport registry and the server registry, drives server
//! lifecycles, and moves messages between callers, the router and server
//! channels. Per-server lifecycle transitions (start, stop, remove) are
//! serialized; message delivery is not.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::server::{HealthReport, RegisteredServer, ServerStatus, ServerStatusReport, ServerSummary};
use super::transports::{builtin_transports, Transport, TransportMetrics};
use crate::cancel::CancellationToken;
use crate::config::{BridgeConfig, BridgeSettings, ChannelDefaults};
use crate::error::{ConduitError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::process::ProcessSupervisor;
use crate::router::{MessageRouter, RouteOptions};
use crate::transport::{Channel, ChannelContext, InboundMessage};

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    Queued { depth: usize },
}

/// Snapshot for the administrative `getMetrics` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMetrics {
    pub servers: BTreeMap<String, usize>,
    pub processes: HashMap<String, usize>,
    pub transports: Vec<TransportMetrics>,
    pub routes: usize,
    pub pending_correlations: usize,
    pub queued_messages: HashMap<String, usize>,
}

pub struct BridgeOrchestrator {
    settings: BridgeSettings,
    events: EventBus,
    supervisor: Arc<ProcessSupervisor>,
    router: Arc<MessageRouter>,
    transports: RwLock<BTreeMap<String, Arc<dyn Transport>>>,
    servers: RwLock<HashMap<String, RegisteredServer>>,
    lifecycle: AsyncMutex<()>,
    started: AtomicBool,
    shutdown: CancellationToken,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeOrchestrator {
    /// Build an orchestrator, its supervisor and its router from `config`.
    /// Servers and routes in `config` are not registered; see
    /// [`BridgeOrchestrator::from_config`].
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        let events = EventBus::with_capacity(config.bridge.event_capacity);
        let supervisor = ProcessSupervisor::new(config.supervisor.clone(), events.clone());
        let router = Arc::new(MessageRouter::new(config.router.clone(), events.clone()));
        Self::with_components(config.bridge.clone(), events, supervisor, router)
    }

    /// Build from existing components. The built-in transports are registered.
    pub fn with_components(
        settings: BridgeSettings,
        events: EventBus,
        supervisor: Arc<ProcessSupervisor>,
        router: Arc<MessageRouter>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            settings,
            events,
            supervisor: Arc::clone(&supervisor),
            router,
            transports: RwLock::new(BTreeMap::new()),
            servers: RwLock::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            health: Mutex::new(None),
        });
        for transport in builtin_transports(supervisor) {
            bridge.register_transport(transport);
        }
        bridge
    }

    /// Build and register every server and route in `config`.
    pub fn from_config(config: &BridgeConfig) -> Result<Arc<Self>> {
        let bridge = Self::new(config);
        for server in &config.servers {
            bridge.register_server(&server.id, &server.transport, server.settings.clone())?;
        }
        for route in &config.routes {
            bridge.router.register_route(
                &route.source,
                &route.destination,
                RouteOptions::new().with_priority(route.priority),
            );
        }
        Ok(bridge)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    fn servers_read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredServer>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn servers_write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredServer>> {
        self.servers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn transport(&self, kind: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
            .ok_or_else(|| ConduitError::UnknownTransport {
                kind: kind.to_string(),
            })
    }

    fn all_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    // ========================================
    // Registration
    // ========================================

    /// Register a transport under its kind, replacing any previous one.
    /// Transports registered after `start()` are initialized in the
    /// background.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> bool {
        let kind = transport.kind().to_string();
        let replaced = self
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.clone(), Arc::clone(&transport))
            .is_some();

        if self.started.load(Ordering::SeqCst) {
            tokio::spawn(async move {
                if let Err(e) = transport.initialize().await {
                    warn!("Transport {} failed to initialize: {}", transport.kind(), e);
                }
            });
        }
        debug!("Registered transport {}", kind);
        self.events.publish(BridgeEvent::TransportRegistered { kind });
        replaced
    }

    pub fn transport_kinds(&self) -> Vec<String> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Register a server bound to a transport kind. Settings are checked by
    /// the transport now; nothing is connected until `start_server`.
    pub fn register_server(&self, id: &str, transport: &str, settings: Value) -> Result<()> {
        if id.trim().is_empty() {
            return Err(ConduitError::Validation {
                field: "id".to_string(),
                message: "server id must not be empty".to_string(),
            });
        }
        self.transport(transport)?.validate(&settings)?;

        {
            let mut servers = self.servers_write();
            if servers.contains_key(id) {
                return Err(ConduitError::DuplicateId { id: id.to_string() });
            }
            servers.insert(
                id.to_string(),
                RegisteredServer::new(id.to_string(), transport.to_string(), settings),
            );
        }

        info!("Registered server {} ({})", id, transport);
        self.events.publish(BridgeEvent::ServerRegistered {
            id: id.to_string(),
            transport: transport.to_string(),
        });
        Ok(())
    }

    /// Forget a server that is not running. Its queued messages are dropped.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        {
            let mut servers = self.servers_write();
            let server = servers
                .get(id)
                .ok_or_else(|| ConduitError::ServerNotFound { id: id.to_string() })?;
            if server.status == ServerStatus::Running {
                return Err(ConduitError::InvalidState {
                    id: id.to_string(),
                    message: "stop the server before removing it".to_string(),
                });
            }
            servers.remove(id);
        }
        let dropped = self.router.get_queued_messages(id, None).len();
        info!("Removed server {} ({} queued messages dropped)", id, dropped);
        Ok(())
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Initialize every registered transport, then start the resource
    /// sampler, the correlation sweep and health polling.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ConduitError::InvalidState {
                id: "bridge".to_string(),
                message: "orchestrator has been stopped".to_string(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for transport in self.all_transports() {
            match transport.initialize().await {
                Ok(()) => debug!("Transport {} initialized", transport.kind()),
                Err(e) => warn!("Transport {} failed to initialize: {}", transport.kind(), e),
            }
        }

        self.supervisor.start_resource_monitor();
        self.router.start_sweeper();
        self.start_health_loop();
        info!(
            "Bridge started ({} transports, health every {:?})",
            self.transport_kinds().len(),
            self.settings.health_check_interval()
        );
        Ok(())
    }

    fn start_health_loop(self: &Arc<Self>) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        let period = self.settings.health_check_interval();
        *health = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                bridge.check_health().await;
            }
            debug!("Health polling stopped");
        }));
    }

    /// Open the server's connection and start forwarding its inbound
    /// messages. Failure leaves the server in `error` with the reason
    /// recorded. Starting a running server is a no-op.
    pub async fn start_server(self: &Arc<Self>, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let (kind, settings) = {
            let servers = self.servers_read();
            let server = servers
                .get(id)
                .ok_or_else(|| ConduitError::ServerNotFound { id: id.to_string() })?;
            if server.status == ServerStatus::Running {
                return Ok(());
            }
            (server.transport.clone(), server.settings.clone())
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(ChannelDefaults::INBOUND_CAPACITY);
        let ctx = ChannelContext::new(self.events.clone(), inbound_tx);
        info!("Starting server {} via {}", id, kind);

        let opened = match self.transport(&kind) {
            Ok(transport) => transport.open(id, &settings, ctx).await,
            Err(e) => Err(e),
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                error!("Server {} failed to start: {}", id, e);
                if let Some(server) = self.servers_write().get_mut(id) {
                    server.status = ServerStatus::Error;
                    server.last_error = Some(e.to_string());
                }
                self.events.publish(BridgeEvent::ServerError {
                    id: id.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let forwarder = tokio::spawn(forward_inbound(
            Arc::downgrade(self),
            id.to_string(),
            inbound_rx,
        ));
        {
            let mut servers = self.servers_write();
            let Some(server) = servers.get_mut(id) else {
                forwarder.abort();
                return Err(ConduitError::ServerNotFound { id: id.to_string() });
            };
            server.status = ServerStatus::Running;
            server.connections = vec![channel];
            server.forwarder = Some(forwarder);
            server.last_error = None;
            server.started_at = Some(chrono::Utc::now());
            server.stopped_at = None;
        }

        info!("Server {} running", id);
        self.events
            .publish(BridgeEvent::ServerStarted { id: id.to_string() });
        self.flush_queue(id).await;
        Ok(())
    }

    /// Close the server's connections and mark it stopped. Stopping a
    /// stopped server is a no-op.
    pub async fn stop_server(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_server_locked(id).await
    }

    async fn stop_server_locked(&self, id: &str) -> Result<()> {
        let (kind, connections, forwarder) = {
            let mut servers = self.servers_write();
            let server = servers
                .get_mut(id)
                .ok_or_else(|| ConduitError::ServerNotFound { id: id.to_string() })?;
            if server.status == ServerStatus::Stopped {
                return Ok(());
            }
            server.status = ServerStatus::Stopped;
            server.stopped_at = Some(chrono::Utc::now());
            (
                server.transport.clone(),
                std::mem::take(&mut server.connections),
                server.forwarder.take(),
            )
        };

        let transport = self.transport(&kind).ok();
        for channel in &connections {
            let closed = match &transport {
                Some(transport) => transport.close_channel(channel.id()).await,
                None => channel.close().await,
            };
            if let Err(e) = closed {
                warn!("Server {}: closing channel {} failed: {}", id, channel.id(), e);
            }
        }
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        info!("Stopped server {}", id);
        self.events
            .publish(BridgeEvent::ServerStopped { id: id.to_string() });
        Ok(())
    }

    /// Stop polling, every server, every transport, the router and the
    /// supervisor. Individual failures are logged and never stop the rest.
    pub async fn stop(&self) {
        info!("Stopping bridge");
        self.shutdown.cancel();
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = health {
            handle.abort();
            let _ = handle.await;
        }

        let mut ids: Vec<String> = self
            .servers_read()
            .values()
            .filter(|s| s.status == ServerStatus::Running)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        for id in ids {
            if let Err(e) = self.stop_server(&id).await {
                warn!("Failed to stop server {}: {}", id, e);
            }
        }

        for transport in self.all_transports() {
            if let Err(e) = transport.shutdown().await {
                warn!("Transport {} failed to stop: {}", transport.kind(), e);
            }
        }

        self.router.shutdown().await;
        self.supervisor.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
        info!("Bridge stopped");
    }

    // ========================================
    // Messaging
    // ========================================

    /// Send `message` over the server's selected connection.
    pub async fn send_to_server(&self, id: &str, message: &Value) -> Result<()> {
        let channel = {
            let servers = self.servers_read();
            let server = servers
                .get(id)
                .ok_or_else(|| ConduitError::ServerNotFound { id: id.to_string() })?;
            if server.status != ServerStatus::Running {
                return Err(ConduitError::ServerNotRunning { id: id.to_string() });
            }
            server
                .select_connection()
                .ok_or_else(|| ConduitError::ServerNotRunning { id: id.to_string() })?
        };
        channel.send(message).await
    }

    /// Send a JSON-RPC request and wait for its response.
    ///
    /// The request `id` is replaced by a fresh correlation id on the wire
    /// and the caller's id is put back on the response.
    pub async fn request(&self, id: &str, message: Value, timeout: Option<Duration>) -> Result<Value> {
        let request = message.clone();
        let Value::Object(mut fields) = message else {
            return Err(ConduitError::InvalidParams {
                message: "request must be a JSON object".to_string(),
            });
        };
        let caller_id = fields.remove("id");
        let correlation_id = self.router.next_correlation_id();
        fields.insert("id".to_string(), Value::String(correlation_id.clone()));
        let outbound = Value::Object(fields);

        let pending = self.router.track_request(request, &correlation_id, timeout)?;
        if let Err(e) = self.send_to_server(id, &outbound).await {
            self.router
                .cancel_correlation(&correlation_id, ConduitError::Cancelled);
            return Err(e);
        }

        let mut response = pending.await.map_err(|_| ConduitError::Cancelled)??;
        if let Some(fields) = response.as_object_mut() {
            match caller_id {
                Some(caller_id) => {
                    fields.insert("id".to_string(), caller_id);
                }
                None => {
                    fields.remove("id");
                }
            }
        }
        Ok(response)
    }

    fn connected_channel(&self, id: &str) -> Option<Arc<dyn Channel>> {
        let servers = self.servers_read();
        let server = servers.get(id)?;
        if server.status != ServerStatus::Running {
            return None;
        }
        server.select_connection().filter(|c| c.is_connected())
    }

    /// Route `message` from `source` to a server and deliver it, queueing
    /// it when the server cannot take it right now.
    pub async fn route_to_server(&self, source: &str, server_id: &str, message: Value) -> Result<Delivery> {
        if !self.servers_read().contains_key(server_id) {
            return Err(ConduitError::ServerNotFound {
                id: server_id.to_string(),
            });
        }
        let routed = self.router.route_message(source, server_id, message).await?;

        // Older queued messages go first.
        if self.router.queue_depth(server_id) > 0 {
            self.flush_queue(server_id).await;
        }
        if self.router.queue_depth(server_id) == 0 {
            if let Some(channel) = self.connected_channel(server_id) {
                match channel.send(&routed).await {
                    Ok(()) => return Ok(Delivery::Sent),
                    Err(e) if e.is_retryable() => {
                        debug!("Delivery to {} failed ({}), queueing", server_id, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let depth = self.router.queue_message(server_id, routed)?;
        Ok(Delivery::Queued { depth })
    }

    /// Deliver queued messages for a connected server, oldest first.
    /// Returns how many were sent; the rest stay queued in order.
    pub async fn flush_queue(&self, server_id: &str) -> usize {
        let Some(channel) = self.connected_channel(server_id) else {
            return 0;
        };
        let mut pending = self.router.get_queued_messages(server_id, None).into_iter();
        let mut sent = 0;
        while let Some(message) = pending.next() {
            if let Err(e) = channel.send(&message).await {
                warn!("Flushing queue for {} stopped: {}", server_id, e);
                let mut rest = vec![message];
                rest.extend(pending);
                self.router.requeue_messages(server_id, rest);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            info!("Delivered {} queued messages to {}", sent, server_id);
        }
        sent
    }

    fn handle_inbound(&self, server_id: &str, payload: Value) {
        if let Some(correlation_id) = payload.get("id").and_then(Value::as_str) {
            if self.router.is_pending(correlation_id) {
                let correlation_id = correlation_id.to_string();
                if let Err(e) = self.router.correlate_response(payload.clone(), &correlation_id) {
                    debug!("Late response from {}: {}", server_id, e);
                }
            }
        }
        self.events.publish(BridgeEvent::ServerMessage {
            id: server_id.to_string(),
            message: payload,
        });
    }

    // ========================================
    // Health
    // ========================================

    /// Probe every running server once.
    pub async fn check_health(&self) -> Vec<HealthReport> {
        let mut ids: Vec<String> = self
            .servers_read()
            .values()
            .filter(|s| s.status == ServerStatus::Running)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.check_server_health(&id).await);
        }
        reports
    }

    async fn check_server_health(&self, id: &str) -> HealthReport {
        let connected = self
            .servers_read()
            .get(id)
            .map(|s| s.is_connected())
            .unwrap_or(false);

        let (healthy, detail, latency_ms) = if !connected {
            (false, Some("no connected channel".to_string()), None)
        } else if self.settings.health_ping {
            let started = Instant::now();
            let ping = json!({"jsonrpc": "2.0", "method": "ping"});
            match self.request(id, ping, Some(self.settings.ping_timeout())).await {
                Ok(_) => (true, None, Some(started.elapsed().as_millis() as u64)),
                Err(e) => (false, Some(e.to_string()), None),
            }
        } else {
            (true, None, None)
        };

        if healthy {
            debug!("Server {} healthy", id);
        } else {
            warn!(
                "Health check failed for {}: {}",
                id,
                detail.as_deref().unwrap_or("unknown")
            );
        }

        let report = HealthReport {
            id: id.to_string(),
            healthy,
            detail: detail.clone(),
            latency_ms,
            checked_at: chrono::Utc::now(),
        };
        if let Some(server) = self.servers_write().get_mut(id) {
            server.last_health = Some(report.clone());
        }
        self.events.publish(BridgeEvent::HealthCheck {
            id: id.to_string(),
            healthy,
            detail,
        });

        if healthy {
            self.flush_queue(id).await;
        }
        report
    }

    // ========================================
    // Status
    // ========================================

    pub fn get_server_status(&self, id: &str) -> Result<ServerStatusReport> {
        let queued = self.router.queue_depth(id);
        self.servers_read()
            .get(id)
            .map(|s| s.report(queued))
            .ok_or_else(|| ConduitError::ServerNotFound { id: id.to_string() })
    }

    pub fn get_all_servers_status(&self) -> Vec<ServerStatusReport> {
        let depths = self.router.queue_depths();
        let mut reports: Vec<_> = self
            .servers_read()
            .values()
            .map(|s| s.report(depths.get(&s.id).copied().unwrap_or(0)))
            .collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        let mut servers: Vec<_> = self.servers_read().values().map(|s| s.summary()).collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub fn get_metrics(&self) -> BridgeMetrics {
        let mut servers = BTreeMap::new();
        for server in self.servers_read().values() {
            *servers.entry(server.status.as_str().to_string()).or_insert(0) += 1;
        }
        BridgeMetrics {
            servers,
            processes: self.supervisor.status_counts(),
            transports: self.all_transports().iter().map(|t| t.metrics()).collect(),
            routes: self.router.route_count(),
            pending_correlations: self.router.pending_correlations(),
            queued_messages: self.router.queue_depths(),
        }
    }
}

async fn forward_inbound(
    bridge: Weak<BridgeOrchestrator>,
    server_id: String,
    mut inbound: mpsc::Receiver<InboundMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(bridge) = bridge.upgrade() else {
            break;
        };
        bridge.handle_inbound(&server_id, message.payload);
    }
    debug!("Inbound forwarding for {} ended", server_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn bridge() -> Arc<BridgeOrchestrator> {
        BridgeOrchestrator::new(&BridgeConfig::default())
    }

    /// A transport that only counts shutdowns and can be told to fail them.
    struct CountingTransport {
        kind: &'static str,
        fail: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> &str {
            self.kind
        }

        fn validate(&self, _settings: &Value) -> Result<()> {
            Ok(())
        }

        async fn open(&self, _id: &str, _settings: &Value, _ctx: ChannelContext) -> Result<Arc<dyn Channel>> {
            Err(ConduitError::transport("refused"))
        }

        async fn close_channel(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ConduitError::transport("stuck"))
            } else {
                Ok(())
            }
        }

        fn metrics(&self) -> TransportMetrics {
            TransportMetrics {
                kind: self.kind.to_string(),
                ..TransportMetrics::default()
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_transport_rejected() {
        let bridge = bridge();
        let err = bridge
            .register_server("s1", "carrier-pigeon", json!({}))
            .unwrap_err();
        assert!(matches!(err, ConduitError::UnknownTransport { .. }));
        assert!(bridge.list_servers().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_server_rejected() {
        let bridge = bridge();
        bridge.register_server("s1", "stdio", json!({"command": "cat"})).unwrap();
        assert!(matches!(
            bridge.register_server("s1", "stdio", json!({"command": "cat"})),
            Err(ConduitError::DuplicateId { .. })
        ));
        assert_eq!(bridge.get_server_status("s1").unwrap().status, ServerStatus::Registered);
    }

    #[tokio::test]
    async fn test_failed_start_records_error() {
        let bridge = bridge();
        let mut rx = bridge.events().subscribe();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        bridge.register_transport(Arc::new(CountingTransport {
            kind: "refusing",
            fail: false,
            shutdowns,
        }));
        bridge.register_server("s1", "refusing", json!({})).unwrap();

        assert!(bridge.start_server("s1").await.is_err());
        let status = bridge.get_server_status("s1").unwrap();
        assert_eq!(status.status, ServerStatus::Error);
        assert!(status.last_error.unwrap().contains("refused"));

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), BridgeEvent::ServerError { id, .. } if id == "s1") {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_send_requires_running_server() {
        let bridge = bridge();
        bridge.register_server("s1", "stdio", json!({"command": "cat"})).unwrap();
        assert!(matches!(
            bridge.send_to_server("s1", &json!({})).await,
            Err(ConduitError::ServerNotRunning { .. })
        ));
        assert!(matches!(
            bridge.send_to_server("nope", &json!({})).await,
            Err(ConduitError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_is_best_effort_across_transports() {
        let bridge = bridge();
        let failing = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));
        bridge.register_transport(Arc::new(CountingTransport {
            kind: "a-failing",
            fail: true,
            shutdowns: Arc::clone(&failing),
        }));
        bridge.register_transport(Arc::new(CountingTransport {
            kind: "z-healthy",
            fail: false,
            shutdowns: Arc::clone(&healthy),
        }));
        bridge.start().await.unwrap();

        bridge.stop().await;
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
        assert!(bridge.start().await.is_err());
    }

    #[tokio::test]
    async fn test_route_to_stopped_server_queues() {
        let bridge = bridge();
        bridge.register_server("worker", "stdio", json!({"command": "cat"})).unwrap();
        bridge.router().register_route("api", "worker", RouteOptions::new());

        let delivery = bridge
            .route_to_server("api", "worker", json!({"task": "x"}))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Queued { depth: 1 });
        assert_eq!(bridge.get_server_status("worker").unwrap().queued_messages, 1);
        assert_eq!(bridge.flush_queue("worker").await, 0);

        let metrics = bridge.get_metrics();
        assert_eq!(metrics.routes, 1);
        assert_eq!(metrics.queued_messages.get("worker"), Some(&1));
        assert_eq!(metrics.servers.get("registered"), Some(&1));
    }

    #[tokio::test]
    async fn test_remove_server() {
        let bridge = bridge();
        bridge.register_server("s1", "stdio", json!({"command": "cat"})).unwrap();
        bridge.remove_server("s1").await.unwrap();
        assert!(matches!(
            bridge.get_server_status("s1"),
            Err(ConduitError::ServerNotFound { .. })
        ));
    }

    #[cfg(unix)]
    mod with_processes {
        use super::*;

        #[tokio::test]
        async fn test_request_round_trip_restores_caller_id() {
            let bridge = bridge();
            bridge.register_server("echo", "stdio", json!({"command": "cat"})).unwrap();
            bridge.start_server("echo").await.unwrap();
            assert_eq!(bridge.get_server_status("echo").unwrap().status, ServerStatus::Running);

            let response = bridge
                .request(
                    "echo",
                    json!({"jsonrpc": "2.0", "id": 42, "method": "tools/list"}),
                    Some(Duration::from_secs(5)),
                )
                .await
                .unwrap();
            assert_eq!(response["id"], 42);
            assert_eq!(response["method"], "tools/list");
            assert_eq!(bridge.router().pending_correlations(), 0);

            bridge.stop_server("echo").await.unwrap();
            bridge.stop_server("echo").await.unwrap();
            assert_eq!(bridge.get_server_status("echo").unwrap().status, ServerStatus::Stopped);
            assert!(matches!(
                bridge.send_to_server("echo", &json!({})).await,
                Err(ConduitError::ServerNotRunning { .. })
            ));
            bridge.stop().await;
        }

        #[tokio::test]
        async fn test_request_times_out_on_silent_server() {
            let bridge = bridge();
            bridge
                .register_server(
                    "sink",
                    "stdio",
                    json!({"command": "sh", "args": ["-c", "cat > /dev/null"]}),
                )
                .unwrap();
            bridge.start_server("sink").await.unwrap();

            let err = bridge
                .request("sink", json!({"method": "ping"}), Some(Duration::from_millis(200)))
                .await
                .unwrap_err();
            assert!(matches!(err, ConduitError::Timeout(_)));
            assert_eq!(bridge.router().pending_correlations(), 0);
            bridge.stop().await;
        }

        #[tokio::test]
        async fn test_queued_messages_flush_on_start() {
            let bridge = bridge();
            let mut rx = bridge.events().subscribe();
            bridge.register_server("worker", "stdio", json!({"command": "cat"})).unwrap();
            bridge.router().register_route("api", "worker", RouteOptions::new());
            bridge
                .route_to_server("api", "worker", json!({"task": "x"}))
                .await
                .unwrap();

            bridge.start_server("worker").await.unwrap();
            assert_eq!(bridge.router().queue_depth("worker"), 0);

            let echoed = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let event = rx.recv().await.unwrap();
                    if let BridgeEvent::ServerMessage { id, message } = event.as_ref() {
                        if id == "worker" {
                            return message.clone();
                        }
                    }
                }
            })
            .await
            .unwrap();
            assert_eq!(echoed["task"], "x");
            assert_eq!(echoed["_routing"]["source"], "api");

            assert_eq!(
                bridge
                    .route_to_server("api", "worker", json!({"task": "y"}))
                    .await
                    .unwrap(),
                Delivery::Sent
            );
            bridge.stop().await;
        }

        #[tokio::test]
        async fn test_health_ping_against_echo() {
            let mut config = BridgeConfig::default();
            config.bridge.health_ping = true;
            let bridge = BridgeOrchestrator::new(&config);
            bridge.register_server("echo", "stdio", json!({"command": "cat"})).unwrap();
            bridge.start_server("echo").await.unwrap();

            let reports = bridge.check_health().await;
            assert_eq!(reports.len(), 1);
            assert!(reports[0].healthy);
            assert!(reports[0].latency_ms.is_some());
            assert!(bridge.get_server_status("echo").unwrap().last_health.is_some());

            let metrics = bridge.get_metrics();
            let stdio = metrics.transports.iter().find(|t| t.kind == "stdio").unwrap();
            assert_eq!(stdio.open_channels, 1);
            assert_eq!(stdio.connected_channels, 1);
            bridge.stop().await;
        }
    }
}

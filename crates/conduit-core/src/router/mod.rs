//! Message routing, transformation and request/response correlation.
//!
//! The router holds no per-message state beyond pending correlations and
//! per-destination queues. Routing a message is a pure function of the
//! registered route and the input, apart from the stamped timestamp and
//! message id.

mod correlation;
mod format;
mod queue;
mod routes;

pub use correlation::CorrelatedExchange;
pub use format::{transform_format, WireFormat};
pub use routes::{FnTransform, MessageFilter, MessageTransform, Route, RouteInfo, RouteOptions};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::RouterConfig;
use crate::error::{ConduitError, Result};
use crate::events::{BridgeEvent, EventBus};
use correlation::CorrelationTable;
use queue::MessageQueues;
use routes::RouteTable;

/// Key under which routing metadata is stamped on routed messages.
pub const ROUTING_KEY: &str = "_routing";

/// Routes messages between named endpoints and pairs responses with requests.
pub struct MessageRouter {
    config: RouterConfig,
    events: EventBus,
    routes: RwLock<RouteTable>,
    correlations: CorrelationTable,
    queues: MessageQueues,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, events: EventBus) -> Self {
        let queues = MessageQueues::new(config.max_queue_size);
        Self {
            correlations: CorrelationTable::new(events.clone()),
            queues,
            config,
            events,
            routes: RwLock::new(RouteTable::default()),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // ========================================
    // Routes
    // ========================================

    /// Register a route. An existing route for the same pair is replaced;
    /// the return value says whether that happened.
    pub fn register_route(
        &self,
        source: impl Into<String>,
        destination: impl Into<String>,
        options: RouteOptions,
    ) -> bool {
        let route = Route {
            source: source.into(),
            destination: destination.into(),
            transform: options.transform,
            filter: options.filter,
            priority: options.priority,
            registered_at: Utc::now(),
        };
        let (source, destination) = (route.source.clone(), route.destination.clone());

        let replaced = self
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(route);
        info!(
            "Registered route {} -> {}{}",
            source,
            destination,
            if replaced { " (replaced)" } else { "" }
        );
        self.events
            .publish(BridgeEvent::RouteRegistered { source, destination });
        replaced
    }

    /// Drop the `(source, destination)` route. Returns whether one existed.
    pub fn unregister_route(&self, source: &str, destination: &str) -> bool {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source, destination);
        if removed {
            info!("Unregistered route {} -> {}", source, destination);
        }
        removed
    }

    /// Routes leaving `source`, highest priority first.
    pub fn routes_from(&self, source: &str) -> Vec<RouteInfo> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .from_source(source)
            .iter()
            .map(|r| r.info())
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn list_routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .all()
            .iter()
            .map(|r| r.info())
            .collect()
    }

    /// Run `message` through the `(source, destination)` route.
    ///
    /// The filter runs first, then the transform, then `_routing` metadata
    /// is stamped. Non-object results are wrapped as `{"payload": ...}`.
    pub async fn route_message(&self, source: &str, destination: &str, message: Value) -> Result<Value> {
        let route = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source, destination)
            .ok_or_else(|| ConduitError::RouteNotFound {
                source_id: source.to_string(),
                destination: destination.to_string(),
            })?;

        if let Some(filter) = &route.filter {
            if !filter.accept(&message) {
                debug!("Route {} -> {} filtered a message", source, destination);
                return Err(ConduitError::MessageFiltered {
                    source_id: source.to_string(),
                    destination: destination.to_string(),
                });
            }
        }

        let transformed = match &route.transform {
            Some(transform) => transform.transform(message).await?,
            None => message,
        };

        let message_id = Uuid::new_v4().simple().to_string();
        let mut fields = match transformed {
            Value::Object(fields) => fields,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("payload".to_string(), other);
                wrapped
            }
        };
        fields.insert(
            ROUTING_KEY.to_string(),
            json!({
                "source": source,
                "destination": destination,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "messageId": message_id,
            }),
        );

        debug!("Routed message {} {} -> {}", message_id, source, destination);
        self.events.publish(BridgeEvent::MessageRouted {
            source: source.to_string(),
            destination: destination.to_string(),
            message_id,
        });
        Ok(Value::Object(fields))
    }

    // ========================================
    // Correlation
    // ========================================

    /// A fresh correlation id, unique for the process lifetime.
    pub fn next_correlation_id(&self) -> String {
        format!("corr-{}", Uuid::new_v4().simple())
    }

    /// Register a pending correlation with the default timeout.
    pub fn correlate_request(&self, request: Value, correlation_id: &str) -> Result<()> {
        self.correlations.register(
            correlation_id,
            request,
            self.config.correlation_timeout(),
            None,
        )
    }

    /// Register a pending correlation and return a receiver resolved with
    /// the response, or with `Timeout` when the entry expires.
    pub fn track_request(
        &self,
        request: Value,
        correlation_id: &str,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.correlations.register(
            correlation_id,
            request,
            timeout.unwrap_or_else(|| self.config.correlation_timeout()),
            Some(tx),
        )?;
        Ok(rx)
    }

    /// Match `response` with its pending request.
    pub fn correlate_response(&self, response: Value, correlation_id: &str) -> Result<CorrelatedExchange> {
        let exchange = self.correlations.resolve(correlation_id, response)?;
        debug!(
            "Correlation {} matched after {:?}",
            correlation_id, exchange.elapsed
        );
        Ok(exchange)
    }

    /// Abandon a pending correlation, failing any waiter with `error`.
    pub fn cancel_correlation(&self, correlation_id: &str, error: ConduitError) -> bool {
        self.correlations.cancel(correlation_id, error)
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.correlations.contains(correlation_id)
    }

    pub fn pending_correlations(&self) -> usize {
        self.correlations.len()
    }

    /// Clear correlations older than the staleness window.
    pub fn sweep_stale(&self) -> usize {
        let swept = self.correlations.sweep(self.config.stale_after());
        if swept > 0 {
            info!("Swept {} stale correlations", swept);
        }
        swept
    }

    // ========================================
    // Queues
    // ========================================

    /// Buffer `message` for `destination`. Returns the queue depth.
    pub fn queue_message(&self, destination: &str, message: Value) -> Result<usize> {
        let depth = self.queues.enqueue(destination, message)?;
        debug!("Queued message for {} (depth {})", destination, depth);
        self.events.publish(BridgeEvent::MessageQueued {
            destination: destination.to_string(),
            depth,
        });
        Ok(depth)
    }

    /// Drain up to `limit` queued messages for `destination`, oldest first.
    pub fn get_queued_messages(&self, destination: &str, limit: Option<usize>) -> Vec<Value> {
        self.queues.drain(destination, limit)
    }

    /// Return undelivered messages to the head of the queue.
    pub fn requeue_messages(&self, destination: &str, messages: Vec<Value>) {
        self.queues.requeue_front(destination, messages);
    }

    pub fn queue_depth(&self, destination: &str) -> usize {
        self.queues.depth(destination)
    }

    pub fn queue_depths(&self) -> HashMap<String, usize> {
        self.queues.depths()
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Start the periodic staleness sweep. Calling twice is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        let period = self.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.sweep_stale();
            }
            debug!("Correlation sweeper stopped");
        }));
    }

    /// Stop the sweeper and fail every pending correlation with `Cancelled`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        let cleared = self.correlations.clear();
        if cleared > 0 {
            info!("Cancelled {} pending correlations on shutdown", cleared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MessageRouter {
        MessageRouter::new(RouterConfig::default(), EventBus::new())
    }

    fn strip_routing(mut value: Value) -> Value {
        if let Some(fields) = value.as_object_mut() {
            if let Some(Value::Object(routing)) = fields.get_mut(ROUTING_KEY) {
                routing.remove("timestamp");
                routing.remove("messageId");
            }
        }
        value
    }

    #[tokio::test]
    async fn test_route_stamps_metadata() {
        let router = router();
        router.register_route("api", "worker", RouteOptions::new());

        let out = router
            .route_message("api", "worker", json!({"task": "x"}))
            .await
            .unwrap();
        assert_eq!(out["task"], "x");
        assert_eq!(out[ROUTING_KEY]["source"], "api");
        assert_eq!(out[ROUTING_KEY]["destination"], "worker");
        assert!(out[ROUTING_KEY]["messageId"].as_str().is_some());
        assert!(out[ROUTING_KEY]["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_route_is_deterministic_apart_from_stamp() {
        let router = router();
        router.register_route(
            "api",
            "worker",
            RouteOptions::new().with_transform(FnTransform::new(|mut m: Value| {
                m["seen"] = json!(true);
                Ok(m)
            })),
        );

        let a = router.route_message("api", "worker", json!({"n": 1})).await.unwrap();
        let b = router.route_message("api", "worker", json!({"n": 1})).await.unwrap();
        assert_ne!(a[ROUTING_KEY]["messageId"], b[ROUTING_KEY]["messageId"]);
        assert_eq!(strip_routing(a.clone()), strip_routing(b));
        assert_eq!(a["seen"], true);
    }

    #[tokio::test]
    async fn test_missing_route() {
        let router = router();
        router.register_route("api", "worker", RouteOptions::new());
        let err = router.route_message("worker", "api", json!({})).await.unwrap_err();
        assert!(matches!(err, ConduitError::RouteNotFound { .. }));
    }

    #[tokio::test]
    async fn test_filter_rejects_without_queueing() {
        let router = router();
        router.register_route(
            "api",
            "worker",
            RouteOptions::new().with_filter(|m: &Value| m.get("secret").is_none()),
        );

        let err = router
            .route_message("api", "worker", json!({"secret": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::MessageFiltered { .. }));
        assert_eq!(router.queue_depth("worker"), 0);
        assert!(router.route_message("api", "worker", json!({"ok": 1})).await.is_ok());
    }

    #[tokio::test]
    async fn test_transform_error_propagates() {
        let router = router();
        router.register_route(
            "a",
            "b",
            RouteOptions::new().with_transform(FnTransform::new(|_m: Value| {
                Err(ConduitError::Other("bad payload".into()))
            })),
        );
        assert!(router.route_message("a", "b", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_scalar_payload_is_wrapped() {
        let router = router();
        router.register_route("a", "b", RouteOptions::new());
        let out = router.route_message("a", "b", json!("hello")).await.unwrap();
        assert_eq!(out["payload"], "hello");
        assert_eq!(out[ROUTING_KEY]["source"], "a");
    }

    #[tokio::test]
    async fn test_reregistration_replaces_route() {
        let router = router();
        assert!(!router.register_route("a", "b", RouteOptions::new().with_priority(1)));
        assert!(router.register_route("a", "b", RouteOptions::new().with_priority(9)));
        let routes = router.routes_from("a");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].priority, 9);
    }

    #[tokio::test]
    async fn test_unregister_route_stops_routing() {
        let router = router();
        router.register_route("a", "b", RouteOptions::new());
        assert_eq!(router.route_count(), 1);

        assert!(router.unregister_route("a", "b"));
        assert!(!router.unregister_route("a", "b"));
        assert_eq!(router.route_count(), 0);
        let err = router.route_message("a", "b", json!({})).await.unwrap_err();
        assert!(matches!(err, ConduitError::RouteNotFound { .. }));
    }

    #[tokio::test]
    async fn test_tracked_request_resolves_with_response() {
        let router = router();
        let id = router.next_correlation_id();
        let rx = router
            .track_request(json!({"method": "ping"}), &id, None)
            .unwrap();

        let exchange = router.correlate_response(json!({"result": {}}), &id).unwrap();
        assert_eq!(exchange.request, json!({"method": "ping"}));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"result": {}}));
        assert!(matches!(
            router.correlate_response(json!({}), &id),
            Err(ConduitError::CorrelationNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_request_times_out() {
        let router = router();
        let rx = router
            .track_request(json!({}), "slow", Some(Duration::from_millis(50)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(rx.await.unwrap(), Err(ConduitError::Timeout(_))));
        assert_eq!(router.pending_correlations(), 0);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let router = router();
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| router.next_correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_queue_roundtrip_and_events() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let router = MessageRouter::new(RouterConfig::default(), events);

        assert_eq!(router.queue_message("worker", json!({"n": 1})).unwrap(), 1);
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            BridgeEvent::MessageQueued { depth: 1, .. }
        ));
        assert_eq!(router.get_queued_messages("worker", Some(10)), vec![json!({"n": 1})]);
        assert!(router.queue_depths().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let router = Arc::new(router());
        router.start_sweeper();
        let rx = router.track_request(json!({}), "pending", None).unwrap();
        router.shutdown().await;
        assert!(matches!(rx.await.unwrap(), Err(ConduitError::Cancelled)));
    }
}

//! Route table and the transform/filter seams attached to routes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Rewrites a message before routing metadata is stamped on it.
#[async_trait]
pub trait MessageTransform: Send + Sync {
    async fn transform(&self, message: Value) -> Result<Value>;
}

/// Wraps a synchronous closure as a [`MessageTransform`].
pub struct FnTransform<F>(pub F);

impl<F> FnTransform<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> MessageTransform for FnTransform<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    async fn transform(&self, message: Value) -> Result<Value> {
        (self.0)(message)
    }
}

/// Decides whether a message may travel a route.
pub trait MessageFilter: Send + Sync {
    fn accept(&self, message: &Value) -> bool;
}

impl<F> MessageFilter for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn accept(&self, message: &Value) -> bool {
        self(message)
    }
}

/// Optional behavior of a route.
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub transform: Option<Arc<dyn MessageTransform>>,
    pub filter: Option<Arc<dyn MessageFilter>>,
    pub priority: i32,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transform(mut self, transform: impl MessageTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// An immutable registered route.
pub struct Route {
    pub source: String,
    pub destination: String,
    pub transform: Option<Arc<dyn MessageTransform>>,
    pub filter: Option<Arc<dyn MessageFilter>>,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("has_transform", &self.transform.is_some())
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

impl Route {
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            source: self.source.clone(),
            destination: self.destination.clone(),
            priority: self.priority,
            has_transform: self.transform.is_some(),
            has_filter: self.filter.is_some(),
            registered_at: self.registered_at,
        }
    }
}

/// Serializable description of a route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub source: String,
    pub destination: String,
    pub priority: i32,
    pub has_transform: bool,
    pub has_filter: bool,
    pub registered_at: DateTime<Utc>,
}

/// Routes keyed by `(source, destination)`.
#[derive(Debug, Default)]
pub(crate) struct RouteTable {
    routes: HashMap<(String, String), Arc<Route>>,
}

impl RouteTable {
    /// Insert or replace. Returns `true` when a route was replaced.
    pub fn insert(&mut self, route: Route) -> bool {
        let key = (route.source.clone(), route.destination.clone());
        self.routes.insert(key, Arc::new(route)).is_some()
    }

    pub fn get(&self, source: &str, destination: &str) -> Option<Arc<Route>> {
        self.routes
            .get(&(source.to_string(), destination.to_string()))
            .cloned()
    }

    pub fn remove(&mut self, source: &str, destination: &str) -> bool {
        self.routes
            .remove(&(source.to_string(), destination.to_string()))
            .is_some()
    }

    /// Routes leaving `source`, highest priority first.
    pub fn from_source(&self, source: &str) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self
            .routes
            .values()
            .filter(|r| r.source == source)
            .cloned()
            .collect();
        sort_routes(&mut routes);
        routes
    }

    pub fn all(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        sort_routes(&mut routes);
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

fn sort_routes(routes: &mut [Arc<Route>]) {
    routes.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.destination.cmp(&b.destination))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(source: &str, destination: &str, priority: i32) -> Route {
        Route {
            source: source.into(),
            destination: destination.into(),
            transform: None,
            filter: None,
            priority,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_replaces_same_key() {
        let mut table = RouteTable::default();
        assert!(!table.insert(route("api", "worker", 0)));
        assert!(table.insert(route("api", "worker", 5)));
        assert_eq!(table.all().len(), 1);
        assert_eq!(table.get("api", "worker").unwrap().priority, 5);
    }

    #[test]
    fn test_from_source_orders_by_priority() {
        let mut table = RouteTable::default();
        table.insert(route("api", "low", 1));
        table.insert(route("api", "high", 10));
        table.insert(route("other", "x", 100));

        let names: Vec<_> = table
            .from_source("api")
            .iter()
            .map(|r| r.destination.clone())
            .collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[test]
    fn test_closure_filter() {
        let options = RouteOptions::new().with_filter(|m: &Value| m.get("allowed").is_some());
        let filter = options.filter.unwrap();
        assert!(filter.accept(&json!({"allowed": true})));
        assert!(!filter.accept(&json!({})));
    }
}

//! Request/response correlation.
//!
//! Each pending entry resolves exactly once. The response path and the
//! timeout path both resolve by removing the entry under the table lock, so
//! whichever removes it first wins and the other finds nothing.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ConduitError, Result};
use crate::events::{BridgeEvent, EventBus};

/// A matched request/response pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedExchange {
    pub correlation_id: String,
    pub request: Value,
    pub response: Value,
    #[serde(rename = "elapsedMs", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub(crate) type Waiter = oneshot::Sender<Result<Value>>;

struct Pending {
    request: Value,
    created_at: Instant,
    timer: JoinHandle<()>,
    waiter: Option<Waiter>,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

pub(crate) struct CorrelationTable {
    pending: PendingMap,
    events: EventBus,
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, Pending>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl CorrelationTable {
    pub fn new(events: EventBus) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Register `id` with a timer that expires it after `timeout`.
    pub fn register(
        &self,
        id: &str,
        request: Value,
        timeout: Duration,
        waiter: Option<Waiter>,
    ) -> Result<()> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(id) {
            return Err(ConduitError::DuplicateId { id: id.to_string() });
        }

        // The timer cannot observe the map before this insert: it needs the
        // lock held here.
        let timer = tokio::spawn(expire_after(
            Arc::clone(&self.pending),
            self.events.clone(),
            id.to_string(),
            timeout,
        ));
        pending.insert(
            id.to_string(),
            Pending {
                request,
                created_at: Instant::now(),
                timer,
                waiter,
            },
        );
        debug!("Correlation {} pending (timeout {:?})", id, timeout);
        Ok(())
    }

    pub fn resolve(&self, id: &str, response: Value) -> Result<CorrelatedExchange> {
        let entry = lock(&self.pending)
            .remove(id)
            .ok_or_else(|| ConduitError::CorrelationNotFound { id: id.to_string() })?;
        entry.timer.abort();

        let elapsed = entry.created_at.elapsed();
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Ok(response.clone()));
        }
        self.events.publish(BridgeEvent::CorrelationMatched {
            correlation_id: id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        Ok(CorrelatedExchange {
            correlation_id: id.to_string(),
            request: entry.request,
            response,
            elapsed,
        })
    }

    /// Drop `id` without resolving it, failing its waiter with `error`.
    pub fn cancel(&self, id: &str, error: ConduitError) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };
        entry.timer.abort();
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Err(error));
        }
        true
    }

    /// Force-clear entries older than `stale_after`.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        let stale: Vec<(String, Pending)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.created_at.elapsed() >= stale_after)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = stale.len();
        for (id, entry) in stale {
            entry.timer.abort();
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(ConduitError::Timeout(stale_after)));
            }
            warn!("Correlation {} expired by sweep", id);
            self.events.publish(BridgeEvent::CorrelationExpired { correlation_id: id });
        }
        count
    }

    /// Cancel every pending entry.
    pub fn clear(&self) -> usize {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(ConduitError::Cancelled));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.pending).contains_key(id)
    }
}

async fn expire_after(pending: PendingMap, events: EventBus, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(entry) = lock(&pending).remove(&id) else {
        return;
    };
    warn!("Correlation {} timed out after {:?}", id, timeout);
    if let Some(waiter) = entry.waiter {
        let _ = waiter.send(Err(ConduitError::Timeout(timeout)));
    }
    events.publish(BridgeEvent::CorrelationTimeout {
        correlation_id: id,
        request: entry.request,
    });
}

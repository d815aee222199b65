//! Per-process resource sampling.
//!
//! A single `sysinfo::System` is shared by all samples and refreshed at most
//! once per refresh interval, so sampling many processes on one tick costs a
//! single process-table scan.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One CPU/memory measurement of a process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    /// CPU usage percentage (can exceed 100 on multi-core).
    pub cpu_percent: f32,
    /// Resident memory in MB.
    pub memory_mb: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Resource tracker backed by `sysinfo`.
pub struct ResourceTracker {
    /// Minimum time between process-table refreshes.
    refresh_interval: Duration,
    system: RwLock<System>,
    last_refresh: Mutex<Option<Instant>>,
}

impl ResourceTracker {
    /// Create a new resource tracker.
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            system: RwLock::new(System::new()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Sample CPU and memory for `pid`. `None` if the process is gone.
    pub fn sample(&self, pid: u32) -> Option<ResourceSample> {
        self.maybe_refresh();

        let system = self.system.read().unwrap_or_else(|e| e.into_inner());
        let process = system.process(Pid::from_u32(pid))?;

        Some(ResourceSample {
            cpu_percent: (process.cpu_usage() * 10.0).round() / 10.0,
            memory_mb: ((process.memory() as f64 / 1_048_576.0) * 100.0).round() / 100.0,
            sampled_at: Utc::now(),
        })
    }

    fn maybe_refresh(&self) {
        let mut last = self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        let due = last
            .map(|t| t.elapsed() >= self.refresh_interval)
            .unwrap_or(true);
        if !due {
            return;
        }

        let mut system = self.system.write().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        *last = Some(Instant::now());
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

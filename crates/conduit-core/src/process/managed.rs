//! Per-process record kept by the supervisor, plus the read-only views
//! handed out to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use super::config::ProcessSpawnConfig;
use super::output::OutputBuffer;
use crate::system::ResourceSample;

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Error,
}

impl ProcessStatus {
    /// Starting, Running or Stopping.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles to one running OS process.
pub(crate) struct ProcessRuntime {
    pub pid: u32,
    pub stdin: Option<Arc<AsyncMutex<ChildStdin>>>,
    /// Asks the monitor task to force-kill the child.
    pub kill_tx: Option<oneshot::Sender<()>>,
    /// Flips to `true` once the child has been reaped.
    pub exited: watch::Receiver<bool>,
}

pub(crate) struct ManagedProcess {
    pub config: ProcessSpawnConfig,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub started_instant: Option<Instant>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// Cleared permanently once the restart budget is exhausted.
    pub auto_restart: bool,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pub resources: VecDeque<ResourceSample>,
    pub runtime: Option<ProcessRuntime>,
    /// Bumped on every launch; stale monitors and pending restarts compare
    /// against it.
    pub generation: u64,
    pub stop_requested: bool,
    /// Line subscribers. They survive restarts of the same logical process.
    pub taps: Vec<mpsc::Sender<String>>,
}

impl ManagedProcess {
    pub fn new(config: ProcessSpawnConfig, buffer_lines: usize) -> Self {
        let auto_restart = config.auto_restart;
        Self {
            config,
            status: ProcessStatus::Starting,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            started_instant: None,
            ended_at: None,
            exit_code: None,
            exit_signal: None,
            auto_restart,
            restart_count: 0,
            last_error: None,
            stdout: OutputBuffer::new(buffer_lines),
            stderr: OutputBuffer::new(buffer_lines),
            resources: VecDeque::new(),
            runtime: None,
            generation: 0,
            stop_requested: false,
            taps: Vec::new(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        match (self.status.is_live(), self.started_instant) {
            (true, Some(started)) => started.elapsed().as_secs(),
            _ => 0,
        }
    }

    pub fn record_sample(&mut self, sample: ResourceSample, history: usize) {
        if self.resources.len() >= history.max(1) {
            self.resources.pop_front();
        }
        self.resources.push_back(sample);
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let latest = self.resources.back();
        ProcessSnapshot {
            id: self.config.id.clone(),
            pid: self.pid,
            status: self.status,
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            auto_restart: self.auto_restart,
            restart_count: self.restart_count,
            exit_code: self.exit_code,
            exit_signal: self.exit_signal,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            uptime_secs: self.uptime_secs(),
            cpu_percent: latest.map(|s| s.cpu_percent).unwrap_or(0.0),
            memory_mb: latest.map(|s| s.memory_mb).unwrap_or(0.0),
            last_error: self.last_error.clone(),
        }
    }

    pub fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            id: self.config.id.clone(),
            pid: self.pid,
            status: self.status,
            command: self.config.command_line(),
            restart_count: self.restart_count,
        }
    }
}

/// Full status of one managed process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub command: String,
    pub args: Vec<String>,
    pub auto_restart: bool,
    #[serde(rename = "restarts")]
    pub restart_count: u32,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds since the current OS process started; 0 when not live.
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
    /// Latest sampled CPU usage.
    #[serde(rename = "cpu")]
    pub cpu_percent: f32,
    /// Latest sampled resident memory in MB.
    #[serde(rename = "memory")]
    pub memory_mb: f64,
    pub last_error: Option<String>,
}

/// One line of `list_processes`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub id: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub command: String,
    pub restart_count: u32,
}

/// Recent output of a process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLogs {
    pub id: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

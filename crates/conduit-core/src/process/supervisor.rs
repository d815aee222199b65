//! Process Supervisor.
//!
//! Owns every managed child process: spawning, output capture, graceful
//! stop with forced-kill fallback, linear-backoff auto-restart, and periodic
//! resource sampling. The process table sits behind a synchronous lock that
//! is never held across an `.await`; each OS process gets a monitor task that
//! reaps it and reports back through [`ProcessSupervisor::handle_exit`].

use chrono::Utc;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::ProcessSpawnConfig;
use super::managed::{
    ManagedProcess, ProcessLogs, ProcessRuntime, ProcessSnapshot, ProcessStatus, ProcessSummary,
};
use crate::cancel::CancellationToken;
use crate::config::{ProcessDefaults, SupervisorConfig};
use crate::error::{ConduitError, Result};
use crate::events::{BridgeEvent, EventBus, ResourceLimitKind};
use crate::platform::{self, StopSignal};
use crate::system::{ResourceSample, ResourceTracker};

/// Upper bound on waiting for output readers to drain after the child exits.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

enum StopTarget {
    Live {
        pid: u32,
        exited: watch::Receiver<bool>,
        kill_tx: Option<oneshot::Sender<()>>,
    },
    Idle {
        already_stopped: bool,
    },
}

/// Supervisor for a bounded set of child processes.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    events: EventBus,
    processes: RwLock<HashMap<String, ManagedProcess>>,
    tracker: ResourceTracker,
    shutdown: CancellationToken,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor publishing onto `events`.
    pub fn new(config: SupervisorConfig, events: EventBus) -> Arc<Self> {
        let refresh = (config.resource_sample_interval() / 2).max(Duration::from_millis(100));
        Arc::new(Self {
            config,
            events,
            processes: RwLock::new(HashMap::new()),
            tracker: ResourceTracker::new(refresh),
            shutdown: CancellationToken::new(),
            sampler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ManagedProcess>> {
        self.processes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ManagedProcess>> {
        self.processes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a new managed process and return its logical id.
    ///
    /// Fails with `Validation` for an empty command, `DuplicateId` when the
    /// id is already tracked (in any state), `CapacityExceeded` when the live
    /// process ceiling is reached, and `SpawnFailure` when the OS refuses to
    /// start the executable. A failed spawn leaves no record behind.
    pub async fn spawn(self: &Arc<Self>, config: ProcessSpawnConfig) -> Result<String> {
        self.spawn_inner(config, None)
    }

    /// Like [`spawn`](Self::spawn), also returning a stdout line stream that
    /// is attached before the process starts, so no line is missed.
    pub async fn spawn_with_output(
        self: &Arc<Self>,
        config: ProcessSpawnConfig,
    ) -> Result<(String, mpsc::Receiver<String>)> {
        let (tx, rx) = mpsc::channel(ProcessDefaults::OUTPUT_TAP_CAPACITY);
        let id = self.spawn_inner(config, Some(tx))?;
        Ok((id, rx))
    }

    fn spawn_inner(
        self: &Arc<Self>,
        mut config: ProcessSpawnConfig,
        tap: Option<mpsc::Sender<String>>,
    ) -> Result<String> {
        if config.command.trim().is_empty() {
            return Err(ConduitError::Validation {
                field: "command".into(),
                message: "command is required".into(),
            });
        }
        if config.id.trim().is_empty() {
            config.id = format!("proc-{}", Uuid::new_v4().simple());
        }
        let id = config.id.clone();

        {
            let mut processes = self.write();
            if processes.contains_key(&id) {
                return Err(ConduitError::DuplicateId { id });
            }
            let live = processes.values().filter(|p| p.status.is_live()).count();
            if live >= self.config.max_processes {
                return Err(ConduitError::CapacityExceeded {
                    what: "processes".into(),
                    limit: self.config.max_processes,
                });
            }
            let mut record = ManagedProcess::new(config.clone(), self.config.output_buffer_lines);
            record.generation = 1;
            record.taps.extend(tap);
            processes.insert(id.clone(), record);
        }

        match self.launch(&id, &config, 1) {
            Ok(_) => Ok(id),
            Err(e) => {
                self.write().remove(&id);
                error!("Failed to spawn process {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Start one OS process for the record `id` at `generation`.
    fn launch(
        self: &Arc<Self>,
        id: &str,
        config: &ProcessSpawnConfig,
        generation: u64,
    ) -> Result<u32> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        info!("Spawning process {}: {}", id, config.command_line());

        let mut child = cmd.spawn().map_err(|e| spawn_failure(config, e))?;
        let pid = child.id().ok_or_else(|| ConduitError::SpawnFailure {
            command: config.command.clone(),
            message: "process exited before a pid was assigned".into(),
            source: None,
        })?;

        let stdin = child.stdin.take().map(|s| Arc::new(AsyncMutex::new(s)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        {
            let mut processes = self.write();
            let current = processes
                .get_mut(id)
                .filter(|r| r.generation == generation && !r.stop_requested);
            let Some(record) = current else {
                let _ = child.start_kill();
                return Err(ConduitError::InvalidState {
                    id: id.to_string(),
                    message: "process was stopped while starting".into(),
                });
            };
            record.pid = Some(pid);
            record.status = ProcessStatus::Running;
            record.started_at = Some(Utc::now());
            record.started_instant = Some(Instant::now());
            record.ended_at = None;
            record.exit_code = None;
            record.exit_signal = None;
            record.runtime = Some(ProcessRuntime {
                pid,
                stdin,
                kill_tx: Some(kill_tx),
                exited: exit_rx,
            });
        }

        info!("Process {} started with PID {}", id, pid);
        self.events.publish(BridgeEvent::ProcessSpawned {
            id: id.to_string(),
            pid,
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = stdout {
            readers.push(self.spawn_reader(id, OutputStream::Stdout, out));
        }
        if let Some(err) = stderr {
            readers.push(self.spawn_reader(id, OutputStream::Stderr, err));
        }

        let supervisor = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let status = wait_or_kill(&mut child, kill_rx).await;
            for reader in readers {
                let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
            }
            let _ = exit_tx.send(true);
            supervisor.handle_exit(&id, generation, status);
        });

        Ok(pid)
    }

    fn spawn_reader<R>(self: &Arc<Self>, id: &str, stream: OutputStream, pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(|c: char| c == '\r' || c == '\n')
                            .to_string();
                        supervisor.record_output(&id, stream, line).await;
                    }
                    Err(e) => {
                        debug!("{} reader for {} closed: {}", stream, id, e);
                        break;
                    }
                }
            }
        })
    }

    async fn record_output(&self, id: &str, stream: OutputStream, line: String) {
        let taps = {
            let mut processes = self.write();
            let Some(record) = processes.get_mut(id) else {
                return;
            };
            match stream {
                OutputStream::Stdout => {
                    record.stdout.push(line.clone());
                    record.taps.retain(|tap| !tap.is_closed());
                    record.taps.clone()
                }
                OutputStream::Stderr => {
                    record.stderr.push(line.clone());
                    Vec::new()
                }
            }
        };

        let event = match stream {
            OutputStream::Stdout => BridgeEvent::ProcessStdout {
                id: id.to_string(),
                line: line.clone(),
            },
            OutputStream::Stderr => BridgeEvent::ProcessStderr {
                id: id.to_string(),
                line: line.clone(),
            },
        };
        self.events.publish(event);

        // Awaiting the send propagates backpressure to the child's pipe.
        for tap in taps {
            let _ = tap.send(line.clone()).await;
        }
    }

    /// Called by the monitor task once the child has been reaped.
    fn handle_exit(self: &Arc<Self>, id: &str, generation: u64, status: std::io::Result<ExitStatus>) {
        let (code, signal, wait_error) = match &status {
            Ok(s) => (s.code(), exit_signal(s), None),
            Err(e) => (None, None, Some(e.to_string())),
        };

        let mut events = Vec::new();
        let mut restart = None;
        {
            let mut processes = self.write();
            let Some(record) = processes.get_mut(id) else {
                return;
            };
            if record.generation != generation {
                return;
            }
            record.runtime = None;
            record.exit_code = code;
            record.exit_signal = signal;
            record.ended_at = Some(Utc::now());
            if record.stop_requested {
                // stop() owns the transition to Stopped.
                return;
            }

            match wait_error {
                Some(message) => {
                    record.status = ProcessStatus::Error;
                    record.last_error = Some(message.clone());
                    events.push(BridgeEvent::ProcessError {
                        id: id.to_string(),
                        message,
                    });
                }
                None => {
                    record.status = ProcessStatus::Exited;
                    events.push(BridgeEvent::ProcessExited {
                        id: id.to_string(),
                        code,
                        signal,
                    });
                }
            }

            if code != Some(0) && record.auto_restart {
                let max = record.config.max_restarts.unwrap_or(self.config.max_restarts);
                if record.restart_count < max {
                    record.restart_count += 1;
                    let base = record
                        .config
                        .restart_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| self.config.restart_delay());
                    let delay = base * record.restart_count;
                    restart = Some(delay);
                    events.push(BridgeEvent::ProcessRestarting {
                        id: id.to_string(),
                        attempt: record.restart_count,
                        delay_ms: delay.as_millis() as u64,
                    });
                } else {
                    record.auto_restart = false;
                    record.status = ProcessStatus::Error;
                    record.last_error = Some(format!("restart budget of {} exhausted", max));
                    events.push(BridgeEvent::ProcessFailed {
                        id: id.to_string(),
                        restarts: record.restart_count,
                    });
                }
            }
        }

        for event in events {
            match &event {
                BridgeEvent::ProcessExited { code, signal, .. } => {
                    info!("Process {} exited (code {:?}, signal {:?})", id, code, signal)
                }
                BridgeEvent::ProcessRestarting { attempt, delay_ms, .. } => {
                    warn!("Restarting process {} in {}ms (attempt {})", id, delay_ms, attempt)
                }
                BridgeEvent::ProcessFailed { restarts, .. } => {
                    error!("Process {} failed after {} restarts", id, restarts)
                }
                BridgeEvent::ProcessError { message, .. } => {
                    error!("Process {} wait failed: {}", id, message)
                }
                _ => {}
            }
            self.events.publish(event);
        }

        if let Some(delay) = restart {
            let supervisor = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = supervisor.relaunch(&id, Some(generation)) {
                    warn!("Auto-restart of {} failed: {}", id, e);
                }
            });
        }
    }

    /// Relaunch the record `id` with its stored config.
    ///
    /// With `expected` set this is a scheduled auto-restart and silently
    /// does nothing when the record moved on (stopped, removed, relaunched).
    /// Without it this is an explicit restart, which resets the restart
    /// budget.
    fn relaunch(self: &Arc<Self>, id: &str, expected: Option<u64>) -> Result<()> {
        let (config, generation) = {
            let mut processes = self.write();
            let record = match processes.get_mut(id) {
                Some(record) => record,
                None if expected.is_some() => return Ok(()),
                None => return Err(ConduitError::ProcessNotFound { id: id.to_string() }),
            };
            match expected {
                Some(expected) => {
                    if record.generation != expected
                        || record.stop_requested
                        || record.status.is_live()
                    {
                        debug!("Skipping stale restart of {}", id);
                        return Ok(());
                    }
                }
                None => {
                    if record.status.is_live() {
                        return Err(ConduitError::InvalidState {
                            id: id.to_string(),
                            message: "process is still running".into(),
                        });
                    }
                    record.restart_count = 0;
                    record.auto_restart = record.config.auto_restart;
                }
            }
            record.generation += 1;
            record.stop_requested = false;
            record.status = ProcessStatus::Starting;
            record.last_error = None;
            (record.config.clone(), record.generation)
        };

        match self.launch(id, &config, generation) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.record_launch_failure(id, generation, &e);
                Err(e)
            }
        }
    }

    /// Mark a failed relaunch as `Error` unless a concurrent `stop()` already
    /// settled the record. Returns whether the failure was recorded.
    fn record_launch_failure(&self, id: &str, generation: u64, error: &ConduitError) -> bool {
        {
            let mut processes = self.write();
            match processes.get_mut(id) {
                // A stop() that landed while spawning owns the final state.
                Some(record) if record.stop_requested => {
                    debug!("Relaunch of {} superseded by stop", id);
                    return false;
                }
                Some(record) if record.generation == generation => {
                    record.status = ProcessStatus::Error;
                    record.last_error = Some(error.to_string());
                }
                _ => {}
            }
        }
        self.events.publish(BridgeEvent::ProcessError {
            id: id.to_string(),
            message: error.to_string(),
        });
        true
    }

    /// Stop a process: send `signal`, wait up to `timeout`, then force-kill.
    ///
    /// Always ends with the record in `Stopped`. Stopping a process that is
    /// not running just marks it stopped.
    pub async fn stop(&self, id: &str, signal: StopSignal, timeout: Duration) -> Result<()> {
        let target = {
            let mut processes = self.write();
            let record = processes
                .get_mut(id)
                .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
            record.stop_requested = true;
            match record.runtime.as_mut() {
                Some(runtime) => {
                    record.status = ProcessStatus::Stopping;
                    StopTarget::Live {
                        pid: runtime.pid,
                        exited: runtime.exited.clone(),
                        kill_tx: runtime.kill_tx.take(),
                    }
                }
                None => {
                    let already_stopped = record.status == ProcessStatus::Stopped;
                    record.status = ProcessStatus::Stopped;
                    record.ended_at.get_or_insert_with(Utc::now);
                    StopTarget::Idle { already_stopped }
                }
            }
        };

        let (pid, mut exited, mut kill_tx) = match target {
            StopTarget::Live {
                pid,
                exited,
                kill_tx,
            } => (pid, exited, kill_tx),
            StopTarget::Idle { already_stopped } => {
                if !already_stopped {
                    self.events.publish(BridgeEvent::ProcessStopped {
                        id: id.to_string(),
                        forced: false,
                    });
                }
                return Ok(());
            }
        };

        info!(
            "Stopping process {} (PID {}, {}, timeout: {:?})",
            id, pid, signal, timeout
        );

        let mut forced = false;
        if signal == StopSignal::Kill {
            forced = true;
            request_kill(&mut kill_tx);
        } else if let Err(e) = platform::send_signal(pid, signal) {
            debug!("Could not deliver {} to {}: {}; killing instead", signal, pid, e);
            forced = true;
            request_kill(&mut kill_tx);
        }

        if !wait_for_exit(&mut exited, timeout).await {
            warn!("Process {} did not exit within {:?}, killing", id, timeout);
            forced = true;
            request_kill(&mut kill_tx);
            if !wait_for_exit(&mut exited, ProcessDefaults::KILL_TIMEOUT).await {
                warn!("Process {} was not reaped after kill", id);
            }
        }

        {
            let mut processes = self.write();
            if let Some(record) = processes.get_mut(id) {
                record.status = ProcessStatus::Stopped;
                record.runtime = None;
                record.ended_at.get_or_insert_with(Utc::now);
            }
        }

        info!("Process {} stopped (forced: {})", id, forced);
        self.events.publish(BridgeEvent::ProcessStopped {
            id: id.to_string(),
            forced,
        });
        Ok(())
    }

    /// Stop with the default signal and grace period.
    pub async fn stop_default(&self, id: &str) -> Result<()> {
        self.stop(id, StopSignal::default(), self.config.stop_timeout())
            .await
    }

    /// Stop, wait the restart delay, and launch the same config again.
    ///
    /// The logical id is preserved and the auto-restart budget is reset.
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<String> {
        let (live, delay) = {
            let processes = self.read();
            let record = processes
                .get(id)
                .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
            let delay = record
                .config
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.restart_delay());
            (record.status.is_live(), delay)
        };

        if live {
            self.stop_default(id).await?;
            tokio::time::sleep(delay).await;
        }

        info!("Restarting process {}", id);
        self.relaunch(id, None)?;
        Ok(id.to_string())
    }

    /// Forget a process that is no longer live.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut processes = self.write();
        let record = processes
            .get(id)
            .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
        if record.status.is_live() {
            return Err(ConduitError::InvalidState {
                id: id.to_string(),
                message: format!("cannot remove a {} process", record.status),
            });
        }
        processes.remove(id);
        debug!("Removed process record {}", id);
        Ok(())
    }

    /// Write one line to the process's stdin. A trailing newline is added
    /// when missing.
    pub async fn write_line(&self, id: &str, line: &str) -> Result<()> {
        let stdin = {
            let processes = self.read();
            let record = processes
                .get(id)
                .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
            record
                .runtime
                .as_ref()
                .and_then(|runtime| runtime.stdin.clone())
                .ok_or_else(|| ConduitError::InvalidState {
                    id: id.to_string(),
                    message: "process is not running".into(),
                })?
        };

        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        if !line.ends_with('\n') {
            data.push('\n');
        }

        let mut stdin = stdin.lock().await;
        stdin.write_all(data.as_bytes()).await.map_err(|e| {
            ConduitError::transport(format!("write to {} stdin failed: {}", id, e))
        })?;
        stdin
            .flush()
            .await
            .map_err(|e| ConduitError::transport(format!("flush of {} stdin failed: {}", id, e)))
    }

    /// Receive every future stdout line of `id`, across restarts.
    pub fn subscribe_output(&self, id: &str) -> Result<mpsc::Receiver<String>> {
        let mut processes = self.write();
        let record = processes
            .get_mut(id)
            .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
        let (tx, rx) = mpsc::channel(ProcessDefaults::OUTPUT_TAP_CAPACITY);
        record.taps.push(tx);
        Ok(rx)
    }

    pub fn get_process_status(&self, id: &str) -> Result<ProcessSnapshot> {
        self.read()
            .get(id)
            .map(ManagedProcess::snapshot)
            .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })
    }

    /// Status of every tracked process, ordered by id.
    pub fn get_all_processes_status(&self) -> Vec<ProcessSnapshot> {
        let mut all: Vec<_> = self.read().values().map(ManagedProcess::snapshot).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_processes(&self) -> Vec<ProcessSummary> {
        let mut all: Vec<_> = self.read().values().map(ManagedProcess::summary).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The last `lines` lines (default 100) of stdout and stderr.
    pub fn get_process_logs(&self, id: &str, lines: Option<usize>) -> Result<ProcessLogs> {
        let lines = lines.unwrap_or(ProcessDefaults::LOG_LINES);
        let processes = self.read();
        let record = processes
            .get(id)
            .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
        Ok(ProcessLogs {
            id: id.to_string(),
            stdout: record.stdout.tail(lines),
            stderr: record.stderr.tail(lines),
        })
    }

    pub fn resource_history(&self, id: &str) -> Result<Vec<ResourceSample>> {
        let processes = self.read();
        let record = processes
            .get(id)
            .ok_or_else(|| ConduitError::ProcessNotFound { id: id.to_string() })?;
        Ok(record.resources.iter().cloned().collect())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.read()
            .get(id)
            .map(|r| r.status == ProcessStatus::Running)
            .unwrap_or(false)
    }

    /// Number of processes in a live state.
    pub fn live_count(&self) -> usize {
        self.read().values().filter(|p| p.status.is_live()).count()
    }

    /// Count of tracked processes per status.
    pub fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in self.read().values() {
            *counts.entry(record.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Stop every live process concurrently. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, p)| p.status.is_live())
            .map(|(id, _)| id.clone())
            .collect();

        let results = futures::future::join_all(ids.iter().map(|id| self.stop_default(id))).await;

        let mut stopped = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => warn!("Failed to stop {}: {}", id, e),
            }
        }
        info!("stop_all completed, stopped {} processes", stopped);
        stopped
    }

    /// Start the periodic resource sampler. Calling it twice is a no-op.
    pub fn start_resource_monitor(self: &Arc<Self>) {
        let mut sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        if sampler.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        let period = self.config.resource_sample_interval();
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                supervisor.sample_resources();
            }
            debug!("Resource sampler stopped");
        }));
    }

    /// Take one resource sample of every running process. Limit breaches
    /// are reported as events only.
    pub fn sample_resources(&self) -> usize {
        let targets: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, p)| p.status == ProcessStatus::Running)
            .filter_map(|(id, p)| p.pid.map(|pid| (id.clone(), pid, p.config.resource_limits.clone())))
            .collect();

        let samples: Vec<_> = targets
            .into_iter()
            .filter_map(|(id, pid, limits)| self.tracker.sample(pid).map(|s| (id, s, limits)))
            .collect();

        let mut breaches = Vec::new();
        {
            let mut processes = self.write();
            for (id, sample, limits) in &samples {
                let Some(record) = processes.get_mut(id) else {
                    continue;
                };
                record.record_sample(sample.clone(), self.config.resource_history);
                if let Some(max) = limits.max_memory_mb {
                    if sample.memory_mb > max {
                        breaches.push((id.clone(), ResourceLimitKind::Memory, sample.memory_mb, max));
                    }
                }
                if let Some(max) = limits.max_cpu_percent {
                    if sample.cpu_percent > max {
                        breaches.push((
                            id.clone(),
                            ResourceLimitKind::Cpu,
                            sample.cpu_percent as f64,
                            max as f64,
                        ));
                    }
                }
            }
        }

        for (id, kind, value, limit) in breaches {
            warn!(
                "Process {} exceeded {:?} limit: {:.1} > {:.1}",
                id, kind, value, limit
            );
            self.events.publish(BridgeEvent::ProcessResourceLimit {
                id,
                kind,
                value,
                limit,
            });
        }
        samples.len()
    }

    /// Stop background work and every live process.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sampler = self
            .sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sampler {
            handle.abort();
        }
        self.stop_all().await;
    }
}

async fn wait_or_kill(child: &mut Child, kill_rx: oneshot::Receiver<()>) -> std::io::Result<ExitStatus> {
    let mut kill_rx = kill_rx;
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill_rx => None,
    };
    match exited {
        Some(status) => status,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

/// `true` once the monitor reports exit (or is gone), `false` on timeout.
async fn wait_for_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

fn request_kill(kill_tx: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = kill_tx.take() {
        let _ = tx.send(());
    }
}

fn spawn_failure(config: &ProcessSpawnConfig, err: std::io::Error) -> ConduitError {
    let message = match err.kind() {
        std::io::ErrorKind::NotFound => "executable not found".to_string(),
        std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => err.to_string(),
    };
    ConduitError::SpawnFailure {
        command: config.command.clone(),
        message,
        source: Some(err),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

//! Process Supervisor: spawn, monitor, restart and stop child processes.

mod config;
mod managed;
mod output;
mod supervisor;

pub use config::{ProcessSpawnConfig, ResourceLimits};
pub use managed::{ProcessLogs, ProcessSnapshot, ProcessStatus, ProcessSummary};
pub use output::OutputBuffer;
pub use supervisor::ProcessSupervisor;

//! Platform-specific process signalling.
//!
//! The supervisor owns every child through its tokio `Child` handle; this
//! module only covers what tokio does not: delivering a graceful signal.

use crate::error::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Signal used to ask a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    #[default]
    Term,
    Int,
    Hup,
    Kill,
}

impl StopSignal {
    /// Parse `SIGTERM`, `term`, `sigint`, ... (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.trim_start_matches("sig") {
            "term" => Some(StopSignal::Term),
            "int" => Some(StopSignal::Int),
            "hup" => Some(StopSignal::Hup),
            "kill" => Some(StopSignal::Kill),
            _ => None,
        }
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Int => "SIGINT",
            StopSignal::Hup => "SIGHUP",
            StopSignal::Kill => "SIGKILL",
        };
        f.write_str(name)
    }
}

/// Deliver `signal` to `pid`.
///
/// Returns `Ok(false)` when the process no longer exists.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(2)` with the mapped signal
/// - **Other**: `Unsupported`; callers fall back to a forced kill through the
///   child handle
pub fn send_signal(pid: u32, signal: StopSignal) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| ConduitError::Validation {
            field: "pid".to_string(),
            message: format!("pid {} out of range", pid),
        })?;
        let nix_signal = match signal {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Kill => Signal::SIGKILL,
        };

        debug!("Sending {} to process {}", signal, pid);
        match kill(Pid::from_raw(raw), nix_signal) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(ConduitError::Other(format!(
                "Failed to send {} to {}: {}",
                signal, pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    {
        debug!("Signal {} for process {} not deliverable on this platform", signal, pid);
        Err(ConduitError::Unsupported {
            message: format!("cannot deliver {} on this platform", signal),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_parse() {
        assert_eq!(StopSignal::parse("SIGTERM"), Some(StopSignal::Term));
        assert_eq!(StopSignal::parse("kill"), Some(StopSignal::Kill));
        assert_eq!(StopSignal::parse("SigInt"), Some(StopSignal::Int));
        assert_eq!(StopSignal::parse("usr1"), None);
        assert_eq!(StopSignal::Hup.to_string(), "SIGHUP");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_nonexistent_returns_false() {
        let result = send_signal(2_000_000_000, StopSignal::Term).unwrap();
        assert!(!result);
    }
}

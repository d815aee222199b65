//! Platform abstraction layer.

mod process;

pub use process::{send_signal, StopSignal};

//! Conduit Core - process supervision, IPC channels and message routing for
//! bridging local protocol servers.
//!
//! The crate has three layers:
//!
//! - [`process`]: the Process Supervisor, which spawns, watches, restarts and
//!   stops external commands.
//! - [`transport`]: uniform framed channels over process stdio, domain
//!   sockets, named pipes and TCP.
//! - [`router`] and [`bridge`]: routing, request/response correlation and the
//!   orchestrator that ties servers to transports.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_core::{BridgeConfig, BridgeOrchestrator};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> conduit_core::Result<()> {
//!     let bridge = BridgeOrchestrator::new(&BridgeConfig::default());
//!     bridge.register_server("echo", "stdio", json!({"command": "cat"}))?;
//!     bridge.start().await?;
//!     bridge.start_server("echo").await?;
//!
//!     let reply = bridge
//!         .request("echo", json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
//!         .await?;
//!     println!("{}", reply);
//!
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod platform;
pub mod process;
pub mod router;
pub mod system;
pub mod transport;

pub use bridge::{BridgeOrchestrator, Delivery, ServerStatus, Transport};
pub use cancel::CancellationToken;
pub use config::{BridgeConfig, BridgeSettings, RouterConfig, SupervisorConfig};
pub use error::{ConduitError, Result};
pub use events::{BridgeEvent, EventBus};
pub use process::{ProcessSpawnConfig, ProcessStatus, ProcessSupervisor};
pub use router::{MessageRouter, RouteOptions};
pub use transport::{Channel, ChannelContext, ConnectionState};

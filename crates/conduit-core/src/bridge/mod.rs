//! Bridge orchestration: transports, registered servers and their
//! lifecycles, health polling and routed delivery.

mod orchestrator;
mod server;
mod transports;

pub use orchestrator::{BridgeMetrics, BridgeOrchestrator, Delivery};
pub use server::{ConnectionReport, HealthReport, ServerStatus, ServerStatusReport, ServerSummary};
pub use transports::{builtin_transports, StdioTransport, StreamTransport, Transport, TransportMetrics};

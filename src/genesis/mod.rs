// src/genesis/mod.rs

pub mod advertisement;
pub mod classifier;
pub mod clients;
pub mod config;
pub mod error;
pub mod graph;
pub mod interface;
pub mod llm_adapter;
pub mod memory;
pub mod monitoring;
pub mod orchestrator;
pub mod participant;
pub mod rpc;
pub mod service;
pub mod tools;
pub mod transport;

// Export the main runtime entry points at the module level so callers can
// reach them as genesis::Participant instead of the full path.
pub use interface::InterfaceClient;
pub use orchestrator::AgentOrchestrator;
pub use participant::Participant;
pub use service::FunctionService;

/// Wall-clock now as unix nanoseconds, the timestamp unit of every wire
/// record.
pub(crate) fn now_unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

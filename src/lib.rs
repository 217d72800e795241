// src/lib.rs

// Import the top-level `genesis` module.
pub mod genesis;

// Re-export the plane modules at the crate root so callers address them as
// genesis::transport, genesis::rpc, and so on.
pub use genesis::{
    advertisement, classifier, clients, config, error, graph, interface, llm_adapter, memory,
    monitoring, orchestrator, participant, rpc, service, tools, transport,
};

// Re-exporting key items for easier external access.
pub use genesis::advertisement::{Advertisement, AdvertisementKind, CapabilityCache};
pub use genesis::config::GenesisConfig;
pub use genesis::error::GenesisError;
pub use genesis::graph::GraphService;
pub use genesis::interface::InterfaceClient;
pub use genesis::llm_adapter::LlmAdapter;
pub use genesis::orchestrator::AgentOrchestrator;
pub use genesis::participant::{Participant, ParticipantKind, ParticipantState};
pub use genesis::service::FunctionService;
pub use genesis::transport::{InProcessTransport, Transport};

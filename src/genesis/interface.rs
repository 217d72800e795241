//! Human-facing interface participants.
//!
//! An [`InterfaceClient`] is the entry point of a chain: it discovers a
//! capable agent from its cache, issues the request on the `Agent` RPC
//! class, and owns the interface-side chain events and topology edge for
//! the exchange. UIs and CLIs wrap this; rendering is out of scope here.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::genesis::advertisement::Advertisement;
use crate::genesis::error::GenesisError;
use crate::genesis::monitoring::{ChainHop, ChainPhase};
use crate::genesis::orchestrator::{AGENT_SERVICE_CLASS, PROCESS_REQUEST_OPERATION};
use crate::genesis::participant::{Participant, ParticipantKind};
use crate::genesis::rpc::RpcClient;
use crate::genesis::transport::Transport;

/// A terminal agent answer.
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub text: String,
    pub conversation_id: String,
    /// The full JSON result for callers that need more than the text.
    pub raw: serde_json::Value,
}

/// INTERFACE participant issuing requests into the agent plane.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use genesis::transport::{InProcessTransport, Transport};
/// use genesis::InterfaceClient;
///
/// # async {
/// let transport: Arc<dyn Transport> = InProcessTransport::new(0);
/// let interface = InterfaceClient::connect(transport, "CLI").await.unwrap();
/// let answer = interface.ask("what is 2+3?", Duration::from_secs(10)).await.unwrap();
/// println!("{}", answer.text);
/// # };
/// ```
pub struct InterfaceClient {
    participant: Participant,
    rpc: RpcClient,
}

impl InterfaceClient {
    /// Join the plane as an interface. Ready as soon as this returns.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        display_name: impl Into<String>,
    ) -> Result<Self, GenesisError> {
        let participant = Participant::new(ParticipantKind::Interface, display_name, transport);
        participant.start().await?;
        let rpc = RpcClient::new(participant.transport().clone(), participant.id());
        Ok(Self { participant, rpc })
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Ask any capable agent. Specialized agents are preferred only through
    /// their own delegation; the entry point goes to a default-capable agent
    /// when one exists, otherwise to the deterministically first agent.
    pub async fn ask(
        &self,
        message: &str,
        deadline: Duration,
    ) -> Result<AgentAnswer, GenesisError> {
        let agents = self.participant.cache().agents();
        if agents.is_empty() {
            return Err(GenesisError::NoCapableProvider(
                "no agent is advertising".to_string(),
            ));
        }
        let default_capable: Vec<Advertisement> = agents
            .iter()
            .filter(|ad| {
                ad.agent_payload()
                    .map(|payload| payload.default_capable)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let pool = if default_capable.is_empty() {
            agents
        } else {
            default_capable
        };
        let target = crate::genesis::orchestrator::select_provider(pool).ok_or_else(|| {
            GenesisError::NoCapableProvider("no agent is advertising".to_string())
        })?;
        self.ask_provider(&target, message, deadline, None).await
    }

    /// Ask the agent advertising `agent_name`.
    pub async fn ask_agent(
        &self,
        agent_name: &str,
        message: &str,
        deadline: Duration,
    ) -> Result<AgentAnswer, GenesisError> {
        let candidates: Vec<Advertisement> = self
            .participant
            .cache()
            .agents()
            .into_iter()
            .filter(|ad| ad.name == agent_name)
            .collect();
        let target = crate::genesis::orchestrator::select_provider(candidates).ok_or_else(|| {
            GenesisError::NoCapableProvider(format!("no agent named '{}'", agent_name))
        })?;
        self.ask_provider(&target, message, deadline, None).await
    }

    /// Continue an existing conversation with the same agent.
    pub async fn ask_again(
        &self,
        agent_name: &str,
        message: &str,
        deadline: Duration,
        conversation_id: &str,
    ) -> Result<AgentAnswer, GenesisError> {
        let candidates: Vec<Advertisement> = self
            .participant
            .cache()
            .agents()
            .into_iter()
            .filter(|ad| ad.name == agent_name)
            .collect();
        let target = crate::genesis::orchestrator::select_provider(candidates).ok_or_else(|| {
            GenesisError::NoCapableProvider(format!("no agent named '{}'", agent_name))
        })?;
        self.ask_provider(&target, message, deadline, Some(conversation_id))
            .await
    }

    async fn ask_provider(
        &self,
        target: &Advertisement,
        message: &str,
        deadline: Duration,
        conversation_id: Option<&str>,
    ) -> Result<AgentAnswer, GenesisError> {
        let conversation_id = conversation_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let chain_id = conversation_id.clone();
        let call_id = Uuid::new_v4().to_string();
        let monitoring = self.participant.monitoring();

        let _ = monitoring
            .publish_edge(&target.provider_id, "INTERFACE_TO_AGENT", serde_json::json!({}))
            .await;
        let _ = monitoring
            .chain(&ChainHop {
                chain_id: chain_id.clone(),
                call_id: call_id.clone(),
                source: self.participant.id().to_string(),
                target: target.provider_id.clone(),
                phase: ChainPhase::Start.as_str().to_string(),
                reason: None,
            })
            .await;

        let reply = self
            .rpc
            .call(
                AGENT_SERVICE_CLASS,
                Some(target.provider_id.as_str()),
                PROCESS_REQUEST_OPERATION,
                &serde_json::json!({ "message": message }),
                deadline,
                Some(conversation_id.as_str()),
            )
            .await;

        let outcome = match reply {
            Ok(reply) => match reply.to_error() {
                Some(e) => Err(e),
                None => reply.result_json(),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(raw) => {
                let _ = monitoring
                    .chain(&ChainHop {
                        chain_id,
                        call_id,
                        source: self.participant.id().to_string(),
                        target: target.provider_id.clone(),
                        phase: ChainPhase::Complete.as_str().to_string(),
                        reason: None,
                    })
                    .await;
                let text = raw
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let conversation_id = raw
                    .get("conversation_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(AgentAnswer {
                    text,
                    conversation_id,
                    raw,
                })
            }
            Err(e) => {
                let _ = monitoring
                    .chain(&ChainHop {
                        chain_id,
                        call_id,
                        source: self.participant.id().to_string(),
                        target: target.provider_id.clone(),
                        phase: ChainPhase::Error.as_str().to_string(),
                        reason: Some(e.kind().to_string()),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Leave the plane cleanly.
    pub async fn close(&self) -> Result<(), GenesisError> {
        self.participant.close().await
    }
}

//! The agent orchestrator: one unified toolset, one tool-call loop.
//!
//! An [`AgentOrchestrator`] turns a participant of kind AGENT into a served
//! RPC endpoint on the shared `Agent` class. For every incoming request it:
//!
//! 1. Snapshots the capability cache into the tool universe: external
//!    FUNCTION advertisements, peer AGENT advertisements (each presented as
//!    an `ask_<name>` tool), and the process's own internal tools.
//! 2. Asks the classifier for a bounded candidate set.
//! 3. Calls the LLM adapter with the candidate toolset.
//! 4. Dispatches every tool call the model requests (RPC to a service, RPC
//!    to a peer agent preserving the conversation id, or an in-process
//!    invoke) and feeds results back as tool messages.
//! 5. Repeats until the model produces terminal text, the hop cap trips
//!    (`ToolLoopExceeded`, failing closed), or the turn deadline expires.
//!
//! Tool selection among same-name providers is deterministic: freshest
//! `last_seen` first, then the lowest SHA-256 digest of the provider id.
//! Providers are re-resolved at dispatch time, so a provider that went
//! OFFLINE mid-conversation is skipped and its calls fail with
//! `NoCapableProvider`.
//!
//! Cycles in the delegation graph (agent A asking agent B asking A) are
//! tolerated; containment is the hop cap, not a topology restriction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::genesis::advertisement::{
    Advertisement, AdvertisementKind, AgentPayload, FunctionPayload,
};
use crate::genesis::classifier::{LlmClassifier, ToolClassifier, ToolDescriptor};
use crate::genesis::config::ToolChoiceMode;
use crate::genesis::error::{CircuitBreaker, GenesisError, RetryPolicy};
use crate::genesis::llm_adapter::{ChatMessage, LlmAdapter, NativeToolCall, ToolDefinition};
use crate::genesis::memory::{MemoryAdapter, RetrievalPolicy};
use crate::genesis::monitoring::{ChainHop, ChainPhase};
use crate::genesis::participant::Participant;
use crate::genesis::rpc::{serve, RequestEnvelope, RpcClient, RpcHandler, ServeHandle};
use crate::genesis::tools::{InternalTool, InternalToolSet};

/// The shared RPC class every agent serves.
pub const AGENT_SERVICE_CLASS: &str = "Agent";
/// The single operation on the agent class.
pub const PROCESS_REQUEST_OPERATION: &str = "process_request";

/// Retained conversation length per conversation id.
const MAX_CONVERSATION_MESSAGES: usize = 40;

/// One entry of the unified toolset.
enum UnifiedTool {
    Function {
        ad: Advertisement,
        payload: FunctionPayload,
    },
    PeerAgent {
        ad: Advertisement,
        payload: AgentPayload,
    },
    Internal(Arc<dyn InternalTool>),
}

impl UnifiedTool {
    /// The name this tool is presented under to the LLM.
    fn tool_name(&self) -> String {
        match self {
            UnifiedTool::Function { ad, .. } => ad.name.clone(),
            UnifiedTool::PeerAgent { ad, .. } => format!("ask_{}", sanitize_tool_name(&ad.name)),
            UnifiedTool::Internal(tool) => tool.name().to_string(),
        }
    }

    fn definition(&self) -> ToolDefinition {
        match self {
            UnifiedTool::Function { ad, payload } => ToolDefinition {
                name: self.tool_name(),
                description: ad.description.clone(),
                parameters_schema: payload.parameter_schema.clone(),
            },
            UnifiedTool::PeerAgent { ad, payload } => {
                let mut schema = serde_json::json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The request to hand to this agent."
                        }
                    },
                    "required": ["message"]
                });
                if !payload.specializations.is_empty() {
                    schema["properties"]["specialization"] = serde_json::json!({
                        "type": "string",
                        "enum": payload.specializations.clone(),
                    });
                }
                ToolDefinition {
                    name: self.tool_name(),
                    description: ad.description.clone(),
                    parameters_schema: schema,
                }
            }
            UnifiedTool::Internal(tool) => ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters_schema: tool.parameters_schema(),
            },
        }
    }

    fn descriptor(&self) -> ToolDescriptor {
        match self {
            UnifiedTool::Function { ad, payload } => ToolDescriptor {
                name: self.tool_name(),
                description: ad.description.clone(),
                classification_tags: payload.classification_tags.clone(),
                default_capable: false,
            },
            UnifiedTool::PeerAgent { ad, payload } => ToolDescriptor {
                name: self.tool_name(),
                description: ad.description.clone(),
                classification_tags: payload.classification_tags.clone(),
                default_capable: payload.default_capable,
            },
            UnifiedTool::Internal(tool) => ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                classification_tags: tool.classification_tags(),
                default_capable: false,
            },
        }
    }
}

/// Restrict a display name to LLM-safe tool-name characters.
fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic choice among same-name providers: freshest `last_seen`
/// first, ties broken by ascending SHA-256 digest of the provider id.
pub(crate) fn select_provider(mut candidates: Vec<Advertisement>) -> Option<Advertisement> {
    candidates.sort_by(|a, b| {
        b.last_seen.cmp(&a.last_seen).then_with(|| {
            let da = Sha256::digest(a.provider_id.as_bytes());
            let db = Sha256::digest(b.provider_id.as_bytes());
            da.as_slice().cmp(db.as_slice())
        })
    });
    candidates.into_iter().next()
}

struct OrchestratorInner {
    participant: Participant,
    llm: Arc<dyn LlmAdapter>,
    classifier: Arc<dyn ToolClassifier>,
    memory: Option<Arc<dyn MemoryAdapter>>,
    internal_tools: InternalToolSet,
    rpc: RpcClient,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    system_prompt: String,
    description: String,
    profile: AgentPayload,
    conversations: tokio::sync::Mutex<HashMap<String, Vec<ChatMessage>>>,
    serve_handle: Mutex<Option<ServeHandle>>,
}

/// LLM-backed agent serving the `Agent` RPC class.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis::advertisement::AgentPayload;
/// use genesis::clients::openai::OpenAiCompatClient;
/// use genesis::orchestrator::AgentOrchestrator;
/// use genesis::participant::{Participant, ParticipantKind};
/// use genesis::transport::{InProcessTransport, Transport};
///
/// # async {
/// let transport: Arc<dyn Transport> = InProcessTransport::new(0);
/// let llm = Arc::new(OpenAiCompatClient::new("key", "gpt-4o"));
/// let agent = AgentOrchestrator::new(
///     Participant::new(ParticipantKind::Agent, "Primary", transport),
///     llm,
/// )
/// .with_description("General-purpose assistant.")
/// .with_profile(AgentPayload {
///     default_capable: true,
///     ..AgentPayload::default()
/// });
/// agent.start().await.unwrap();
/// # };
/// ```
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl AgentOrchestrator {
    /// Wrap an AGENT participant around an LLM adapter. The classifier
    /// defaults to [`LlmClassifier`] over the same adapter.
    pub fn new(participant: Participant, llm: Arc<dyn LlmAdapter>) -> Self {
        let rpc = RpcClient::new(participant.transport().clone(), participant.id());
        let classifier: Arc<dyn ToolClassifier> = Arc::new(LlmClassifier::new(llm.clone()));
        Self {
            inner: Arc::new(OrchestratorInner {
                participant,
                llm,
                classifier,
                memory: None,
                internal_tools: InternalToolSet::new(),
                rpc,
                breaker: CircuitBreaker::default(),
                retry: RetryPolicy::default(),
                system_prompt: "You are a helpful agent. Use the available tools when they \
                                apply, then answer the user directly."
                    .to_string(),
                description: "LLM agent".to_string(),
                profile: AgentPayload::default(),
                conversations: tokio::sync::Mutex::new(HashMap::new()),
                serve_handle: Mutex::new(None),
            }),
        }
    }

    fn rebuild<F: FnOnce(&mut OrchestratorInner)>(self, mutate: F) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                mutate(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                log::warn!("orchestrator builder method called after sharing; ignored");
                Self { inner }
            }
        }
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.rebuild(move |inner| inner.system_prompt = prompt)
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.rebuild(move |inner| inner.description = description)
    }

    /// The AGENT payload advertised on start (specializations, tags,
    /// default capability).
    pub fn with_profile(self, profile: AgentPayload) -> Self {
        self.rebuild(move |inner| inner.profile = profile)
    }

    pub fn with_classifier(self, classifier: Arc<dyn ToolClassifier>) -> Self {
        self.rebuild(move |inner| inner.classifier = classifier)
    }

    pub fn with_memory(self, memory: Arc<dyn MemoryAdapter>) -> Self {
        self.rebuild(move |inner| inner.memory = Some(memory))
    }

    pub fn with_internal_tool(self, tool: Arc<dyn InternalTool>) -> Self {
        self.rebuild(move |inner| inner.internal_tools.register(tool))
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        self.rebuild(move |inner| inner.retry = retry)
    }

    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    /// Join the plane, advertise this agent, and serve the `Agent` class.
    pub async fn start(&self) -> Result<(), GenesisError> {
        self.inner.participant.start().await?;

        let ad = Advertisement::new(
            AdvertisementKind::Agent,
            self.inner.participant.display_name(),
            "",
        )
        .with_description(self.inner.description.as_str())
        .with_service_name(AGENT_SERVICE_CLASS)
        .with_payload(&self.inner.profile);
        self.inner.participant.advertise(ad).await?;

        let handle = serve(
            self.inner.participant.transport().clone(),
            self.inner.participant.id(),
            AGENT_SERVICE_CLASS,
            Arc::new(self.clone()),
        )
        .await?;
        *self.inner.serve_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop serving and leave the plane cleanly.
    pub async fn stop(&self) -> Result<(), GenesisError> {
        if let Some(handle) = self.inner.serve_handle.lock().unwrap().take() {
            handle.stop();
        }
        self.inner.participant.close().await
    }

    /// Handle one request end to end. Exposed for in-process callers; RPC
    /// traffic arrives here through the served `Agent` class.
    pub async fn process_request(
        &self,
        request: RequestEnvelope,
    ) -> Result<serde_json::Value, GenesisError> {
        self.inner.participant.begin_request().await;
        let outcome = self.run_turn(&request).await;
        self.inner.participant.end_request().await;
        outcome
    }

    async fn run_turn(
        &self,
        request: &RequestEnvelope,
    ) -> Result<serde_json::Value, GenesisError> {
        let arguments = request.arguments_json()?;
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GenesisError::SchemaViolation("'message' must be a string".to_string())
            })?;

        // The turn budget is the tighter of the caller's deadline and the
        // configured cap.
        let budget = request
            .remaining()
            .min(self.inner.participant.config().max_turn_time);
        if budget.as_nanos() == 0 {
            return Err(GenesisError::Timeout("request deadline already passed".to_string()));
        }
        let deadline_at = Instant::now() + budget;

        let conversation_id = if request.conversation_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.conversation_id.clone()
        };
        let chain_id = conversation_id.clone();

        let memory_items = self.recall(message).await;

        // Tool universe from the cache snapshot at arrival, windowed by the
        // classifier.
        let universe = self.tool_universe();
        let descriptors: Vec<ToolDescriptor> =
            universe.iter().map(|tool| tool.descriptor()).collect();
        let window = self.inner.participant.config().classifier_window;
        let selected = self
            .inner
            .classifier
            .classify(message, &descriptors, window)
            .await;
        let candidates: Vec<&UnifiedTool> = selected
            .iter()
            .filter_map(|name| universe.iter().find(|tool| &tool.tool_name() == name))
            .collect();
        let tools: Vec<ToolDefinition> =
            candidates.iter().map(|tool| tool.definition()).collect();

        let tool_choice = self.inner.participant.config().tool_choice;
        if tools.is_empty() && tool_choice == ToolChoiceMode::Required {
            return Err(GenesisError::NoCapableProvider(
                "no function, agent, or internal tool is available".to_string(),
            ));
        }

        let mut messages = {
            let conversations = self.inner.conversations.lock().await;
            match conversations.get(&conversation_id) {
                Some(history) => {
                    let mut messages = history.clone();
                    messages.push(ChatMessage::user(message));
                    messages
                }
                None => self
                    .inner
                    .llm
                    .format_messages(message, &self.inner.system_prompt, &memory_items),
            }
        };

        let max_hops = self.inner.participant.config().max_tool_hops;
        let mut hops = 0usize;

        loop {
            if deadline_at.saturating_duration_since(Instant::now()).as_nanos() == 0 {
                return Err(GenesisError::Timeout(format!(
                    "turn budget {:?} exhausted after {} hops",
                    budget, hops
                )));
            }

            let response = match self.inner.llm.call(&messages, &tools, tool_choice).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = self
                        .inner
                        .participant
                        .monitoring()
                        .general(
                            "LLM_CALL_FAILED",
                            "ERROR",
                            &format!("LLM adapter failure: {}", e),
                            serde_json::json!({}),
                        )
                        .await;
                    return Err(GenesisError::LlmUnavailable(e.to_string()));
                }
            };

            let tool_calls = self.inner.llm.extract_tool_calls(&response);
            if tool_calls.is_empty() {
                let text = self.inner.llm.extract_text(&response).unwrap_or_default();
                messages.push(self.inner.llm.create_assistant_message(&response));
                self.store_conversation(&conversation_id, messages).await;
                self.remember(message, &text).await;
                return Ok(serde_json::json!({
                    "text": text,
                    "conversation_id": conversation_id,
                }));
            }

            if hops >= max_hops {
                return Err(GenesisError::ToolLoopExceeded(hops));
            }
            hops += 1;

            messages.push(self.inner.llm.create_assistant_message(&response));
            for call in &tool_calls {
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                let outcome = self
                    .dispatch(call, remaining, &conversation_id, &chain_id)
                    .await;
                let content = match outcome {
                    Ok(result) => {
                        serde_json::json!({"status": "ok", "result": result}).to_string()
                    }
                    Err(e) => {
                        if tool_choice == ToolChoiceMode::Required
                            && matches!(
                                e,
                                GenesisError::ToolCallFailed(_)
                                    | GenesisError::TransportUnavailable(_)
                            )
                        {
                            // A required tool that cannot be reached fails
                            // the whole turn.
                            return Err(GenesisError::ToolCallFailed(e.to_string()));
                        }
                        serde_json::json!({
                            "status": "error",
                            "error": e.kind(),
                            "message": e.to_string(),
                        })
                        .to_string()
                    }
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), content));
            }
        }
    }

    /// Snapshot the unified tool universe: internal tools, then external
    /// functions (deduplicated by deterministic provider selection, and
    /// shadowing same-name internal tools), then peer agents.
    fn tool_universe(&self) -> Vec<UnifiedTool> {
        let cache = self.inner.participant.cache();
        let mut universe: Vec<UnifiedTool> = Vec::new();
        let mut names: Vec<String> = Vec::new();

        let mut by_function_name: HashMap<String, Vec<Advertisement>> = HashMap::new();
        for ad in cache.functions() {
            by_function_name.entry(ad.name.clone()).or_default().push(ad);
        }
        for (name, group) in by_function_name {
            let selected = match select_provider(group) {
                Some(selected) => selected,
                None => continue,
            };
            match selected.function_payload() {
                Ok(payload) => {
                    names.push(name);
                    universe.push(UnifiedTool::Function {
                        ad: selected,
                        payload,
                    });
                }
                Err(e) => log::warn!("skipping function '{}': {}", name, e),
            }
        }

        for tool in self.inner.internal_tools.list() {
            if names.iter().any(|name| name == tool.name()) {
                log::info!(
                    "external function '{}' shadows the internal tool of the same name",
                    tool.name()
                );
                continue;
            }
            names.push(tool.name().to_string());
            universe.push(UnifiedTool::Internal(tool));
        }

        for ad in cache.agents() {
            if ad.provider_id == self.inner.participant.id() {
                continue;
            }
            match ad.agent_payload() {
                Ok(payload) => {
                    let tool = UnifiedTool::PeerAgent { ad, payload };
                    if !names.contains(&tool.tool_name()) {
                        names.push(tool.tool_name());
                        universe.push(tool);
                    }
                }
                Err(e) => log::warn!("skipping agent '{}': {}", ad.name, e),
            }
        }

        universe
    }

    /// Dispatch one tool call, re-resolving the provider against the live
    /// cache and emitting CHAIN events around the exchange.
    async fn dispatch(
        &self,
        call: &NativeToolCall,
        remaining: Duration,
        conversation_id: &str,
        chain_id: &str,
    ) -> Result<serde_json::Value, GenesisError> {
        // Internal tools resolve first unless an external function shadows
        // the name.
        let function = select_provider(
            self.inner
                .participant
                .cache()
                .functions_named(&call.name),
        );
        if function.is_none() {
            if let Some(tool) = self.inner.internal_tools.get(&call.name) {
                return tool.invoke(call.arguments.clone()).await;
            }
        }

        if let Some(ad) = function {
            let payload = ad.function_payload()?;
            let idempotent = payload.capabilities.iter().any(|c| c == "idempotent");
            return self
                .call_remote(
                    &payload.service_name,
                    &ad.provider_id,
                    &call.name,
                    &call.arguments,
                    remaining,
                    conversation_id,
                    chain_id,
                    "AGENT_TO_SERVICE",
                    idempotent,
                )
                .await;
        }

        // Peer agent?
        if let Some(agent_name) = call.name.strip_prefix("ask_") {
            let target = self
                .inner
                .participant
                .cache()
                .agents()
                .into_iter()
                .filter(|ad| {
                    sanitize_tool_name(&ad.name) == agent_name
                        && ad.provider_id != self.inner.participant.id()
                })
                .collect::<Vec<_>>();
            if let Some(ad) = select_provider(target) {
                // Preserve the conversation across the hop; forward only the
                // message envelope.
                let message = call
                    .arguments
                    .get("message")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let arguments = serde_json::json!({ "message": message });
                return self
                    .call_remote(
                        AGENT_SERVICE_CLASS,
                        &ad.provider_id,
                        PROCESS_REQUEST_OPERATION,
                        &arguments,
                        remaining,
                        conversation_id,
                        chain_id,
                        "AGENT_TO_AGENT",
                        false,
                    )
                    .await;
            }
        }

        Err(GenesisError::NoCapableProvider(format!(
            "no live provider for tool '{}'",
            call.name
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_remote(
        &self,
        service_class: &str,
        provider_id: &str,
        operation: &str,
        arguments: &serde_json::Value,
        remaining: Duration,
        conversation_id: &str,
        chain_id: &str,
        edge_type: &str,
        idempotent: bool,
    ) -> Result<serde_json::Value, GenesisError> {
        if self.inner.breaker.is_open(provider_id) {
            return Err(GenesisError::NoCapableProvider(format!(
                "provider '{}' is circuit-broken",
                provider_id
            )));
        }
        // Fail closed: the class/provider pair must still be known to the
        // plane at dispatch time.
        let known = self
            .inner
            .participant
            .cache()
            .providers_of_class(service_class);
        if !known.iter().any(|provider| provider == provider_id) {
            return Err(GenesisError::NotRouted(format!(
                "service class '{}' at '{}' is not currently known",
                service_class, provider_id
            )));
        }

        let monitoring = self.inner.participant.monitoring();
        let call_id = Uuid::new_v4().to_string();
        let _ = monitoring.publish_edge(provider_id, edge_type, serde_json::json!({})).await;
        let _ = monitoring
            .chain(&ChainHop {
                chain_id: chain_id.to_string(),
                call_id: call_id.clone(),
                source: self.inner.participant.id().to_string(),
                target: provider_id.to_string(),
                phase: ChainPhase::Start.as_str().to_string(),
                reason: None,
            })
            .await;

        let policy = if idempotent {
            self.inner.retry.clone()
        } else {
            RetryPolicy::no_retry()
        };
        let reply = self
            .inner
            .rpc
            .call_with_retry(
                service_class,
                Some(provider_id),
                operation,
                arguments,
                remaining,
                Some(conversation_id),
                &policy,
            )
            .await;

        let outcome = match reply {
            Ok(reply) => match reply.to_error() {
                Some(e) => Err(e),
                None => reply.result_json(),
            },
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => {
                self.inner.breaker.record_success(provider_id);
                let _ = monitoring
                    .chain(&ChainHop {
                        chain_id: chain_id.to_string(),
                        call_id: call_id.clone(),
                        source: self.inner.participant.id().to_string(),
                        target: provider_id.to_string(),
                        phase: ChainPhase::Complete.as_str().to_string(),
                        reason: None,
                    })
                    .await;
            }
            Err(e) => {
                if matches!(
                    e,
                    GenesisError::Timeout(_)
                        | GenesisError::ToolCallFailed(_)
                        | GenesisError::TransportUnavailable(_)
                ) && self.inner.breaker.record_failure(provider_id)
                {
                    log::warn!("circuit opened for provider '{}'", provider_id);
                }
                let _ = monitoring
                    .chain(&ChainHop {
                        chain_id: chain_id.to_string(),
                        call_id: call_id.clone(),
                        source: self.inner.participant.id().to_string(),
                        target: provider_id.to_string(),
                        phase: ChainPhase::Error.as_str().to_string(),
                        reason: Some(e.kind().to_string()),
                    })
                    .await;
            }
        }
        outcome
    }

    async fn recall(&self, query: &str) -> Vec<String> {
        let memory = match &self.inner.memory {
            Some(memory) => memory,
            None => return Vec::new(),
        };
        match memory.retrieve(query, 5, RetrievalPolicy::Relevance).await {
            Ok(items) => items.into_iter().map(|item| item.content).collect(),
            Err(e) => {
                let _ = self
                    .inner
                    .participant
                    .monitoring()
                    .general(
                        "MEMORY_RETRIEVE_FAILED",
                        "WARN",
                        &format!("memory retrieve failed: {}", e),
                        serde_json::json!({}),
                    )
                    .await;
                Vec::new()
            }
        }
    }

    async fn remember(&self, question: &str, answer: &str) {
        let memory = match &self.inner.memory {
            Some(memory) => memory,
            None => return,
        };
        let note = format!("Q: {} -> A: {}", question, answer);
        if let Err(e) = memory.write(&note, serde_json::json!({"source": "turn"})).await {
            let _ = self
                .inner
                .participant
                .monitoring()
                .general(
                    "MEMORY_WRITE_FAILED",
                    "WARN",
                    &format!("memory write failed: {}", e),
                    serde_json::json!({}),
                )
                .await;
        }
    }

    async fn store_conversation(&self, conversation_id: &str, mut messages: Vec<ChatMessage>) {
        if messages.len() > MAX_CONVERSATION_MESSAGES {
            let excess = messages.len() - MAX_CONVERSATION_MESSAGES;
            messages.drain(1..1 + excess);
        }
        let mut conversations = self.inner.conversations.lock().await;
        conversations.insert(conversation_id.to_string(), messages);
    }
}

#[async_trait]
impl RpcHandler for AgentOrchestrator {
    async fn handle(&self, request: RequestEnvelope) -> Result<serde_json::Value, GenesisError> {
        if request.operation != PROCESS_REQUEST_OPERATION {
            return Err(GenesisError::NotRouted(format!(
                "unknown agent operation '{}'",
                request.operation
            )));
        }
        self.process_request(request).await
    }
}

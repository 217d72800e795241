use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use genesis::advertisement::AgentPayload;
use genesis::config::ToolChoiceMode;
use genesis::graph::GraphService;
use genesis::llm_adapter::{
    ChatMessage, LlmAdapter, LlmResponse, NativeToolCall, Role, ToolDefinition,
};
use genesis::monitoring::{event_kind_filter, event_qos, ChainHop, EventKind, EventRecord};
use genesis::orchestrator::AgentOrchestrator;
use genesis::participant::{Participant, ParticipantKind};
use genesis::transport::{InProcessTransport, Transport, EVENT_TOPIC};
use genesis::InterfaceClient;

enum ScriptStep {
    ToolCall(&'static str, serde_json::Value),
    Text(&'static str),
    EchoLastToolResult,
}

struct ScriptedLlm {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedLlm {
    fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
        })
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn call(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _tool_choice: ToolChoiceMode,
    ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
        let step = self.steps.lock().unwrap().pop_front();
        let message = match step {
            Some(ScriptStep::ToolCall(name, arguments)) => ChatMessage {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![NativeToolCall {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    arguments,
                }],
            },
            Some(ScriptStep::Text(text)) => ChatMessage::assistant(text),
            Some(ScriptStep::EchoLastToolResult) => {
                let last = messages
                    .iter()
                    .rev()
                    .find(|m| matches!(m.role, Role::Tool { .. }))
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| "no tool result".to_string());
                ChatMessage::assistant(last)
            }
            None => ChatMessage::assistant("done"),
        };
        Ok(LlmResponse {
            message,
            finish_reason: Some("stop".to_string()),
            raw: json!({}),
        })
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Agent-as-tool delegation: the primary agent hands the request to the
/// weather specialist over the agent RPC class, preserving the conversation
/// id, and the topology shows both delegation edges.
#[tokio::test]
async fn primary_delegates_to_weather_agent() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let mut chain_sub = transport
        .subscribe(
            EVENT_TOPIC,
            &event_qos(),
            Some(event_kind_filter(&[EventKind::Chain])),
        )
        .await
        .unwrap();
    let graph = GraphService::new();
    let _graph_tasks = graph.attach(&transport, false).await.unwrap();

    let weather_llm = ScriptedLlm::new(vec![ScriptStep::Text("Sunny in Tokyo, 25C")]);
    let weather = AgentOrchestrator::new(
        Participant::new(ParticipantKind::Agent, "WeatherAgent", transport.clone()),
        weather_llm,
    )
    .with_description("Answers weather questions.")
    .with_profile(AgentPayload {
        specializations: vec!["weather".to_string()],
        classification_tags: vec!["weather".to_string()],
        default_capable: false,
        ..AgentPayload::default()
    });
    weather.start().await.unwrap();

    let primary_llm = ScriptedLlm::new(vec![
        ScriptStep::ToolCall("ask_weatheragent", json!({"message": "weather in Tokyo"})),
        ScriptStep::EchoLastToolResult,
    ]);
    let primary = AgentOrchestrator::new(
        Participant::new(ParticipantKind::Agent, "Primary", transport.clone()),
        primary_llm,
    )
    .with_profile(AgentPayload {
        default_capable: true,
        ..AgentPayload::default()
    });
    primary.start().await.unwrap();
    wait_until(
        || primary.participant().cache().agents().len() == 2,
        "primary to discover the weather agent",
    )
    .await;

    let iface = InterfaceClient::connect(transport.clone(), "CLI").await.unwrap();
    wait_until(
        || iface.participant().cache().agents().len() == 2,
        "interface to discover both agents",
    )
    .await;

    // The default-capable primary is the entry point.
    let answer = iface
        .ask("weather in Tokyo", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(answer.text.contains("Sunny in Tokyo"));

    // The conversation id survives the hop: the delegated reply carries the
    // same conversation the interface opened.
    let parsed: serde_json::Value = serde_json::from_str(&answer.text).unwrap();
    assert_eq!(
        parsed["result"]["conversation_id"].as_str().unwrap(),
        answer.conversation_id
    );

    // Both delegation edges appear in the topology.
    let iface_id = iface.participant().id().to_string();
    let primary_id = primary.participant().id().to_string();
    let weather_id = weather.participant().id().to_string();
    wait_until(|| graph.edge_count() >= 2, "both edges to be published").await;
    let snapshot = graph.snapshot();
    assert!(snapshot.edges.iter().any(|e| {
        e.source == iface_id && e.target == primary_id && e.element_type == "INTERFACE_TO_AGENT"
    }));
    assert!(snapshot.edges.iter().any(|e| {
        e.source == primary_id && e.target == weather_id && e.element_type == "AGENT_TO_AGENT"
    }));

    // Chain visibility for a filtered subscriber: only CHAIN events, with
    // START before COMPLETE per call id, across both hops.
    let mut hops: Vec<ChainHop> = Vec::new();
    for _ in 0..500 {
        while let Some(sample) = chain_sub.try_recv() {
            let record: EventRecord = serde_json::from_value(sample.data).unwrap();
            assert_eq!(record.kind, EventKind::Chain);
            hops.push(serde_json::from_str(&record.payload).unwrap());
        }
        if hops.len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(hops.iter().any(|h| h.source == iface_id && h.target == primary_id));
    assert!(hops.iter().any(|h| h.source == primary_id && h.target == weather_id));
    for hop in hops.iter().filter(|h| h.phase == "COMPLETE") {
        let start = hops
            .iter()
            .position(|h| h.call_id == hop.call_id && h.phase == "START")
            .expect("START precedes COMPLETE for the same call");
        let complete = hops
            .iter()
            .position(|h| h.call_id == hop.call_id && h.phase == "COMPLETE")
            .unwrap();
        assert!(start < complete);
        // Every hop of the workflow shares the chain id the interface
        // opened.
        assert_eq!(hop.chain_id, hops[start].chain_id);
    }
}

//! The monitoring plane: durable topology records and the volatile event
//! stream.
//!
//! Two topics carry everything an observer needs. `GraphTopology` is durable
//! and keyed by `element_id`, so a late subscriber reconstructs the whole
//! graph from the retained set. `Event` is volatile and unkeyed: lifecycle
//! transitions, chain hops, and general diagnostics, fire-and-forget.
//!
//! Each participant owns a [`MonitoringPublisher`] and publishes only its own
//! node state, its outgoing edges, and its own events. Subscribers only ever
//! project (see [`GraphService`](crate::genesis::graph::GraphService)); they
//! never publish back.
//!
//! Both topics support content-filtered subscription on the `kind` field, so
//! a renderer that only wants chain activity never deserializes lifecycle
//! traffic.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::genesis::error::GenesisError;
use crate::genesis::now_unix_nanos;
use crate::genesis::transport::{
    Sample, SampleFilter, TopicQos, Transport, EVENT_TOPIC, GRAPH_TOPOLOGY_TOPIC,
};

/// Maximum byte length of `element_id` and `component_id`.
pub const MAX_ELEMENT_ID_LEN: usize = 256;
/// Maximum byte length of `element_type`, `component_type`, and `event_type`.
pub const MAX_TYPE_LEN: usize = 128;
/// Maximum byte length of a node `state`.
pub const MAX_STATE_LEN: usize = 64;
/// Maximum byte length of `severity`.
pub const MAX_SEVERITY_LEN: usize = 32;
/// Maximum byte length of `message`.
pub const MAX_MESSAGE_LEN: usize = 2048;
/// Maximum byte length of JSON `metadata`/`payload` fields.
pub const MAX_PAYLOAD_LEN: usize = 8192;

/// Keep-last depth for the topology topic.
pub const GRAPH_HISTORY_DEPTH: usize = 4096;

/// QoS of the `GraphTopology` topic.
pub fn graph_topology_qos() -> TopicQos {
    TopicQos::durable_keyed(GRAPH_HISTORY_DEPTH)
}

/// QoS of the `Event` topic.
pub fn event_qos() -> TopicQos {
    TopicQos::volatile()
}

/// Topology record kind. Wire values: NODE=0, EDGE=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphKind {
    Node = 0,
    Edge = 1,
}

impl Serialize for GraphKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for GraphKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(GraphKind::Node),
            1 => Ok(GraphKind::Edge),
            other => Err(D::Error::custom(format!("invalid graph kind {}", other))),
        }
    }
}

/// Event stream kind. Wire values: LIFECYCLE=0, CHAIN=1, GENERAL=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Lifecycle = 0,
    Chain = 1,
    General = 2,
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(EventKind::Lifecycle),
            1 => Ok(EventKind::Chain),
            2 => Ok(EventKind::General),
            other => Err(D::Error::custom(format!("invalid event kind {}", other))),
        }
    }
}

/// Durable topology record, keyed by `element_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphRecord {
    pub element_id: String,
    pub kind: GraphKind,
    /// e.g. `"Agent"`, `"Service"`, `"INTERFACE_TO_AGENT"`.
    pub element_type: String,
    /// For nodes only; empty for edges.
    pub state: String,
    /// JSON; for edges includes `source` and `target`.
    pub metadata: String,
    pub timestamp: i64,
}

impl GraphRecord {
    pub fn validate(&self) -> Result<(), GenesisError> {
        check_len("element_id", &self.element_id, MAX_ELEMENT_ID_LEN)?;
        check_len("element_type", &self.element_type, MAX_TYPE_LEN)?;
        check_len("state", &self.state, MAX_STATE_LEN)?;
        check_len("metadata", &self.metadata, MAX_PAYLOAD_LEN)?;
        Ok(())
    }

    /// Composite element id for an edge.
    pub fn edge_id(source: &str, target: &str, edge_type: &str) -> String {
        format!("{}->{}:{}", source, target, edge_type)
    }
}

/// Volatile activity record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub kind: EventKind,
    pub component_id: String,
    pub component_type: String,
    /// e.g. `"STARTED"`, `"CHAIN_START"`.
    pub event_type: String,
    pub severity: String,
    pub message: String,
    /// UTF-8 JSON.
    pub payload: String,
    pub timestamp: i64,
}

impl EventRecord {
    pub fn validate(&self) -> Result<(), GenesisError> {
        check_len("event_id", &self.event_id, MAX_ELEMENT_ID_LEN)?;
        check_len("component_id", &self.component_id, MAX_ELEMENT_ID_LEN)?;
        check_len("component_type", &self.component_type, MAX_TYPE_LEN)?;
        check_len("event_type", &self.event_type, MAX_TYPE_LEN)?;
        check_len("severity", &self.severity, MAX_SEVERITY_LEN)?;
        check_len("message", &self.message, MAX_MESSAGE_LEN)?;
        check_len("payload", &self.payload, MAX_PAYLOAD_LEN)?;
        Ok(())
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), GenesisError> {
    if value.len() > max {
        Err(GenesisError::SchemaViolation(format!(
            "{} is {} bytes, limit is {}",
            field,
            value.len(),
            max
        )))
    } else {
        Ok(())
    }
}

/// Content filter selecting only the given event kinds.
pub fn event_kind_filter(kinds: &[EventKind]) -> SampleFilter {
    let wanted: HashSet<u64> = kinds.iter().map(|k| *k as u64).collect();
    Arc::new(move |sample: &Sample| {
        sample
            .data
            .get("kind")
            .and_then(|v| v.as_u64())
            .map(|k| wanted.contains(&k))
            .unwrap_or(false)
    })
}

/// Content filter selecting only the given topology record kinds.
pub fn graph_kind_filter(kinds: &[GraphKind]) -> SampleFilter {
    let wanted: HashSet<u64> = kinds.iter().map(|k| *k as u64).collect();
    Arc::new(move |sample: &Sample| {
        sample
            .data
            .get("kind")
            .and_then(|v| v.as_u64())
            .map(|k| wanted.contains(&k))
            .unwrap_or(false)
    })
}

/// Phase of one chain hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Start,
    Complete,
    Error,
}

impl ChainPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainPhase::Start => "START",
            ChainPhase::Complete => "COMPLETE",
            ChainPhase::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One hop of a multi-hop workflow, as carried in a CHAIN event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainHop {
    pub chain_id: String,
    pub call_id: String,
    pub source: String,
    pub target: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A participant's handle for publishing its own monitoring records.
pub struct MonitoringPublisher {
    transport: Arc<dyn Transport>,
    component_id: String,
    component_type: String,
}

impl MonitoringPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        component_id: impl Into<String>,
        component_type: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            component_id: component_id.into(),
            component_type: component_type.into(),
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Publish this participant's NODE record with the given state.
    pub async fn publish_node(
        &self,
        state: &str,
        metadata: serde_json::Value,
    ) -> Result<(), GenesisError> {
        let record = GraphRecord {
            element_id: self.component_id.clone(),
            kind: GraphKind::Node,
            element_type: self.component_type.clone(),
            state: state.to_string(),
            metadata: metadata.to_string(),
            timestamp: now_unix_nanos(),
        };
        self.publish_graph(record).await
    }

    /// Publish an outgoing edge from this participant to `target`.
    pub async fn publish_edge(
        &self,
        target: &str,
        edge_type: &str,
        mut metadata: serde_json::Value,
    ) -> Result<(), GenesisError> {
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                "source".to_string(),
                serde_json::Value::String(self.component_id.clone()),
            );
            map.insert(
                "target".to_string(),
                serde_json::Value::String(target.to_string()),
            );
        }
        let record = GraphRecord {
            element_id: GraphRecord::edge_id(&self.component_id, target, edge_type),
            kind: GraphKind::Edge,
            element_type: edge_type.to_string(),
            state: String::new(),
            metadata: metadata.to_string(),
            timestamp: now_unix_nanos(),
        };
        self.publish_graph(record).await
    }

    async fn publish_graph(&self, record: GraphRecord) -> Result<(), GenesisError> {
        record.validate()?;
        let data = serde_json::to_value(&record)
            .map_err(|e| GenesisError::SchemaViolation(e.to_string()))?;
        self.transport
            .publish(
                GRAPH_TOPOLOGY_TOPIC,
                &graph_topology_qos(),
                Sample::keyed(record.element_id.clone(), data),
            )
            .await
    }

    /// Emit a LIFECYCLE event.
    pub async fn lifecycle(
        &self,
        event_type: &str,
        severity: &str,
        message: &str,
        payload: serde_json::Value,
    ) -> Result<(), GenesisError> {
        self.emit(EventKind::Lifecycle, event_type, severity, message, payload)
            .await
    }

    /// Emit a GENERAL event.
    pub async fn general(
        &self,
        event_type: &str,
        severity: &str,
        message: &str,
        payload: serde_json::Value,
    ) -> Result<(), GenesisError> {
        self.emit(EventKind::General, event_type, severity, message, payload)
            .await
    }

    /// Emit a CHAIN event for one hop phase.
    pub async fn chain(&self, hop: &ChainHop) -> Result<(), GenesisError> {
        let event_type = format!("CHAIN_{}", hop.phase);
        let message = match &hop.reason {
            Some(reason) => format!(
                "{} -> {} {} ({})",
                hop.source, hop.target, hop.phase, reason
            ),
            None => format!("{} -> {} {}", hop.source, hop.target, hop.phase),
        };
        let payload = serde_json::to_value(hop)
            .map_err(|e| GenesisError::SchemaViolation(e.to_string()))?;
        let severity = if hop.phase == "ERROR" { "WARN" } else { "INFO" };
        self.emit(EventKind::Chain, &event_type, severity, &message, payload)
            .await
    }

    async fn emit(
        &self,
        kind: EventKind,
        event_type: &str,
        severity: &str,
        message: &str,
        payload: serde_json::Value,
    ) -> Result<(), GenesisError> {
        let record = EventRecord {
            event_id: Uuid::new_v4().to_string(),
            kind,
            component_id: self.component_id.clone(),
            component_type: self.component_type.clone(),
            event_type: event_type.to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
            payload: payload.to_string(),
            timestamp: now_unix_nanos(),
        };
        record.validate()?;
        let data = serde_json::to_value(&record)
            .map_err(|e| GenesisError::SchemaViolation(e.to_string()))?;
        self.transport
            .publish(EVENT_TOPIC, &event_qos(), Sample::unkeyed(data))
            .await
    }
}

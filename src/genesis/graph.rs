//! In-process graph projection for monitoring subscribers.
//!
//! [`GraphService`] consumes the durable `GraphTopology` topic (and
//! optionally the volatile `Event` topic) and maintains an in-memory
//! `{nodes, edges}` model. Downstream consumers such as a UI bridge or a
//! CLI renderer receive [`GraphDelta`]s over a channel and can take a
//! consistent [`GraphSnapshot`] at any time.
//!
//! The service is strictly a projection: it never publishes back to the
//! transport.
//!
//! OFFLINE retention: nodes that report `state=OFFLINE` stay in the model
//! (and in the durable topic) so observers can see that a provider died.
//! Removal is operator-driven via [`GraphService::purge_offline`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::genesis::error::GenesisError;
use crate::genesis::monitoring::{
    event_qos, graph_topology_qos, EventRecord, GraphKind, GraphRecord,
};
use crate::genesis::participant::OFFLINE_STATE;
use crate::genesis::transport::{Transport, EVENT_TOPIC, GRAPH_TOPOLOGY_TOPIC};

/// Projected node.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub element_id: String,
    pub element_type: String,
    pub state: String,
    pub metadata: serde_json::Value,
    pub timestamp: i64,
}

/// Projected edge. `source`/`target` are lifted out of the record metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub element_id: String,
    pub element_type: String,
    pub source: String,
    pub target: String,
    pub metadata: serde_json::Value,
    pub timestamp: i64,
}

/// Incremental change pushed to downstream consumers.
#[derive(Debug, Clone)]
pub enum GraphDelta {
    NodeUpdate(GraphNode),
    EdgeUpdate(GraphEdge),
    NodeRemove(String),
    EdgeRemove(String),
    /// An activity event observed on the volatile stream.
    Activity(EventRecord),
}

/// Point-in-time copy of the projected model.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Default)]
struct GraphModel {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,
}

/// Projection of the monitoring plane for one subscriber process.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis::graph::GraphService;
/// use genesis::transport::{InProcessTransport, Transport};
///
/// # async {
/// let transport: Arc<dyn Transport> = InProcessTransport::new(0);
/// let graph = GraphService::new();
/// graph.attach(&transport, true).await.unwrap();
///
/// let snapshot = graph.snapshot();
/// println!("{} nodes, {} edges", snapshot.nodes.len(), snapshot.edges.len());
/// # };
/// ```
#[derive(Clone)]
pub struct GraphService {
    model: Arc<RwLock<GraphModel>>,
    consumers: Arc<Mutex<Vec<mpsc::UnboundedSender<GraphDelta>>>>,
}

impl GraphService {
    pub fn new() -> Self {
        Self {
            model: Arc::new(RwLock::new(GraphModel::default())),
            consumers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to the topology topic (and, when `with_activity`, the event
    /// topic) and spawn the consumer tasks feeding this projection.
    ///
    /// A late-attaching service reconstructs the whole graph from the
    /// durable retained set before observing live updates.
    pub async fn attach(
        &self,
        transport: &Arc<dyn Transport>,
        with_activity: bool,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, GenesisError> {
        let mut handles = Vec::new();

        let mut topology = transport
            .subscribe(GRAPH_TOPOLOGY_TOPIC, &graph_topology_qos(), None)
            .await?;
        let service = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(sample) = topology.recv().await {
                if sample.disposed {
                    if let Some(key) = &sample.key {
                        service.remove_element(key);
                    }
                    continue;
                }
                match serde_json::from_value::<GraphRecord>(sample.data) {
                    Ok(record) => service.apply_record(&record),
                    Err(e) => log::warn!("dropping malformed topology record: {}", e),
                }
            }
        }));

        if with_activity {
            let mut events = transport.subscribe(EVENT_TOPIC, &event_qos(), None).await?;
            let service = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(sample) = events.recv().await {
                    match serde_json::from_value::<EventRecord>(sample.data) {
                        Ok(record) => service.emit(GraphDelta::Activity(record)),
                        Err(e) => log::warn!("dropping malformed event record: {}", e),
                    }
                }
            }));
        }

        Ok(handles)
    }

    /// Apply one topology record to the model.
    pub fn apply_record(&self, record: &GraphRecord) {
        match record.kind {
            GraphKind::Node => {
                let node = GraphNode {
                    element_id: record.element_id.clone(),
                    element_type: record.element_type.clone(),
                    state: record.state.clone(),
                    metadata: serde_json::from_str(&record.metadata)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: record.timestamp,
                };
                {
                    let mut model = self.model.write().unwrap();
                    model.nodes.insert(node.element_id.clone(), node.clone());
                }
                self.emit(GraphDelta::NodeUpdate(node));
            }
            GraphKind::Edge => {
                let metadata: serde_json::Value =
                    serde_json::from_str(&record.metadata).unwrap_or(serde_json::Value::Null);
                let source = metadata["source"].as_str().unwrap_or("").to_string();
                let target = metadata["target"].as_str().unwrap_or("").to_string();
                if source.is_empty() || target.is_empty() {
                    log::warn!(
                        "edge record '{}' is missing endpoints, dropped",
                        record.element_id
                    );
                    return;
                }
                let edge = GraphEdge {
                    element_id: record.element_id.clone(),
                    element_type: record.element_type.clone(),
                    source,
                    target,
                    metadata,
                    timestamp: record.timestamp,
                };
                {
                    let mut model = self.model.write().unwrap();
                    model.edges.insert(edge.element_id.clone(), edge.clone());
                }
                self.emit(GraphDelta::EdgeUpdate(edge));
            }
        }
    }

    fn remove_element(&self, element_id: &str) {
        let mut model = self.model.write().unwrap();
        if model.nodes.remove(element_id).is_some() {
            drop(model);
            self.emit(GraphDelta::NodeRemove(element_id.to_string()));
        } else if model.edges.remove(element_id).is_some() {
            drop(model);
            self.emit(GraphDelta::EdgeRemove(element_id.to_string()));
        }
    }

    /// Register a downstream consumer. Deltas observed after this call are
    /// pushed to the returned receiver.
    pub fn subscribe_deltas(&self) -> mpsc::UnboundedReceiver<GraphDelta> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, delta: GraphDelta) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|tx| tx.send(delta.clone()).is_ok());
    }

    /// Consistent point-in-time copy of the model.
    pub fn snapshot(&self) -> GraphSnapshot {
        let model = self.model.read().unwrap();
        GraphSnapshot {
            nodes: model.nodes.values().cloned().collect(),
            edges: model.edges.values().cloned().collect(),
        }
    }

    pub fn node(&self, element_id: &str) -> Option<GraphNode> {
        let model = self.model.read().unwrap();
        model.nodes.get(element_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.model.read().unwrap().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.model.read().unwrap().edges.len()
    }

    /// Drop every OFFLINE node and the edges touching it, emitting removal
    /// deltas. Returns the number of elements removed. This is the
    /// operator-driven half of the OFFLINE retention policy.
    pub fn purge_offline(&self) -> usize {
        let (removed_nodes, removed_edges) = {
            let mut model = self.model.write().unwrap();
            let offline: Vec<String> = model
                .nodes
                .values()
                .filter(|n| n.state == OFFLINE_STATE)
                .map(|n| n.element_id.clone())
                .collect();
            for id in &offline {
                model.nodes.remove(id);
            }
            let dead_edges: Vec<String> = model
                .edges
                .values()
                .filter(|e| offline.contains(&e.source) || offline.contains(&e.target))
                .map(|e| e.element_id.clone())
                .collect();
            for id in &dead_edges {
                model.edges.remove(id);
            }
            (offline, dead_edges)
        };
        for id in &removed_nodes {
            self.emit(GraphDelta::NodeRemove(id.clone()));
        }
        for id in &removed_edges {
            self.emit(GraphDelta::EdgeRemove(id.clone()));
        }
        removed_nodes.len() + removed_edges.len()
    }
}

impl Default for GraphService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::monitoring::MonitoringPublisher;
    use crate::genesis::transport::InProcessTransport;
    use serde_json::json;
    use std::time::Duration;

    async fn settle(service: &GraphService, nodes: usize, edges: usize) {
        for _ in 0..200 {
            if service.node_count() == nodes && service.edge_count() == edges {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn late_subscriber_reconstructs_graph() {
        let transport = InProcessTransport::new(0);
        let as_dyn: Arc<dyn Transport> = transport.clone();

        let agent = MonitoringPublisher::new(as_dyn.clone(), "agent-1", "Agent");
        agent.publish_node("READY", json!({})).await.unwrap();
        let iface = MonitoringPublisher::new(as_dyn.clone(), "iface-1", "Interface");
        iface.publish_node("READY", json!({})).await.unwrap();
        iface
            .publish_edge("agent-1", "INTERFACE_TO_AGENT", json!({}))
            .await
            .unwrap();

        let service = GraphService::new();
        let _tasks = service.attach(&as_dyn, false).await.unwrap();
        settle(&service, 2, 1).await;

        let snapshot = service.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].source, "iface-1");
        assert_eq!(snapshot.edges[0].target, "agent-1");
    }

    #[tokio::test]
    async fn purge_offline_removes_node_and_touching_edges() {
        let transport = InProcessTransport::new(0);
        let as_dyn: Arc<dyn Transport> = transport.clone();
        let service = GraphService::new();
        let _tasks = service.attach(&as_dyn, false).await.unwrap();
        let mut deltas = service.subscribe_deltas();

        let agent = MonitoringPublisher::new(as_dyn.clone(), "agent-1", "Agent");
        agent.publish_node("READY", json!({})).await.unwrap();
        let svc = MonitoringPublisher::new(as_dyn.clone(), "svc-1", "Service");
        svc.publish_node("READY", json!({})).await.unwrap();
        agent
            .publish_edge("svc-1", "AGENT_TO_SERVICE", json!({}))
            .await
            .unwrap();
        settle(&service, 2, 1).await;

        svc.publish_node(OFFLINE_STATE, json!({})).await.unwrap();
        for _ in 0..200 {
            if service
                .node("svc-1")
                .map(|n| n.state == OFFLINE_STATE)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Retention: the OFFLINE node is still present until purged.
        assert_eq!(service.node_count(), 2);
        let removed = service.purge_offline();
        assert_eq!(removed, 2);
        assert_eq!(service.node_count(), 1);
        assert_eq!(service.edge_count(), 0);

        // Consumers saw updates followed by the purge removals.
        let mut saw_node_remove = false;
        let mut saw_edge_remove = false;
        while let Ok(delta) = deltas.try_recv() {
            match delta {
                GraphDelta::NodeRemove(id) => saw_node_remove = saw_node_remove || id == "svc-1",
                GraphDelta::EdgeRemove(_) => saw_edge_remove = true,
                _ => {}
            }
        }
        assert!(saw_node_remove);
        assert!(saw_edge_remove);
    }
}

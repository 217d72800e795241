//! Pub/sub transport abstraction.
//!
//! Everything in Genesis moves over topics: durable keyed topics for the
//! capability and topology planes, volatile topics for RPC traffic and the
//! activity stream. The [`Transport`] trait is the seam between the runtime
//! and a concrete data bus; [`InProcessTransport`] is the in-process
//! implementation used by the runtime and the test suite. A binding to an
//! external DDS bus implements the same trait and reuses the topic names
//! below unchanged; they are part of the discovery contract and must match
//! byte for byte.
//!
//! # QoS model
//!
//! Two durabilities exist:
//!
//! - **Transient-local** topics retain the last sample per key and replay the
//!   retained set to every late-joining subscriber before any live sample.
//! - **Volatile** topics are fire-and-forget; a late joiner sees only samples
//!   published after it subscribed.
//!
//! Subscriptions take an optional [`SampleFilter`]; the predicate runs at the
//! source, before the sample is queued, so a subscriber that filters on one
//! record kind never pays deserialization cost for the rest.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::Stream;
use tokio::sync::mpsc;

use crate::genesis::error::GenesisError;

/// Durable capability advertisements. Keyed by `advertisement_id`.
pub const ADVERTISEMENT_TOPIC: &str = "rti/connext/genesis/Advertisement";
/// Durable topology records. Keyed by `element_id`.
pub const GRAPH_TOPOLOGY_TOPIC: &str = "rti/connext/genesis/monitoring/GraphTopology";
/// Volatile lifecycle/chain/general events. Unkeyed.
pub const EVENT_TOPIC: &str = "rti/connext/genesis/monitoring/Event";

/// Request topic for a service class.
pub fn rpc_request_topic(service_class: &str) -> String {
    format!("rti/connext/genesis/rpc/{}Request", service_class)
}

/// Reply topic for a service class.
pub fn rpc_reply_topic(service_class: &str) -> String {
    format!("rti/connext/genesis/rpc/{}Reply", service_class)
}

/// Topic durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Last value per key is retained and replayed to late joiners.
    TransientLocal,
    /// Fire-and-forget.
    Volatile,
}

/// Per-topic quality of service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQos {
    pub durability: Durability,
    /// For transient-local topics, the minimum number of keyed instances
    /// retained before the oldest is evicted.
    pub history_depth: usize,
    pub reliable: bool,
}

impl TopicQos {
    /// Transient-local, reliable, keep-last with the given instance depth.
    pub fn durable_keyed(history_depth: usize) -> Self {
        Self {
            durability: Durability::TransientLocal,
            history_depth,
            reliable: true,
        }
    }

    /// Volatile, reliable.
    pub fn volatile() -> Self {
        Self {
            durability: Durability::Volatile,
            history_depth: 1,
            reliable: true,
        }
    }
}

/// One published record.
///
/// `key` identifies the instance on keyed (durable) topics; `disposed` marks
/// a tombstone telling subscribers the instance was withdrawn.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: Option<String>,
    pub data: serde_json::Value,
    pub disposed: bool,
}

impl Sample {
    /// A keyed data sample.
    pub fn keyed(key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            key: Some(key.into()),
            data,
            disposed: false,
        }
    }

    /// An unkeyed data sample.
    pub fn unkeyed(data: serde_json::Value) -> Self {
        Self {
            key: None,
            data,
            disposed: false,
        }
    }

    fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            data: serde_json::Value::Null,
            disposed: true,
        }
    }
}

/// Content filter applied at the source, before a sample reaches the
/// subscriber's queue.
pub type SampleFilter = Arc<dyn Fn(&Sample) -> bool + Send + Sync>;

/// Receiving half of a subscription.
///
/// Dropping the subscription detaches it; the transport prunes the dead
/// queue on the next publish to the topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Sample>,
}

impl Subscription {
    /// Await the next sample. `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for draining in tests.
    pub fn try_recv(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }

    /// Topic this subscription is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for Subscription {
    type Item = Sample;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Sample>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Pub/sub primitives every Genesis plane is built on.
///
/// Implementations must deliver retained samples to late joiners of
/// transient-local topics before any subsequent live sample, and must apply
/// subscription filters before queueing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one sample. Keyed durable topics retain it last-value-wins.
    async fn publish(&self, topic: &str, qos: &TopicQos, sample: Sample)
        -> Result<(), GenesisError>;

    /// Withdraw a keyed instance: drop the retained value and deliver a
    /// tombstone to current subscribers.
    async fn dispose(&self, topic: &str, qos: &TopicQos, key: &str) -> Result<(), GenesisError>;

    /// Subscribe, optionally with a content filter.
    async fn subscribe(
        &self,
        topic: &str,
        qos: &TopicQos,
        filter: Option<SampleFilter>,
    ) -> Result<Subscription, GenesisError>;

    /// Logical discovery domain id this transport is attached to.
    fn domain(&self) -> u32;
}

struct SubscriberEntry {
    tx: mpsc::UnboundedSender<Sample>,
    filter: Option<SampleFilter>,
}

impl SubscriberEntry {
    /// Returns `false` when the subscriber is gone and should be pruned.
    fn offer(&self, sample: &Sample) -> bool {
        if let Some(filter) = &self.filter {
            // Tombstones always pass; the subscriber must learn about
            // withdrawal of instances it accepted earlier.
            if !sample.disposed && !filter(sample) {
                return true;
            }
        }
        self.tx.send(sample.clone()).is_ok()
    }
}

struct TopicState {
    qos: TopicQos,
    retained: HashMap<String, Sample>,
    retained_order: Vec<String>,
    subscribers: Vec<SubscriberEntry>,
}

impl TopicState {
    fn new(qos: TopicQos) -> Self {
        Self {
            qos,
            retained: HashMap::new(),
            retained_order: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn retain(&mut self, sample: &Sample) {
        let key = match &sample.key {
            Some(key) => key.clone(),
            None => return,
        };
        if self.retained.insert(key.clone(), sample.clone()).is_none() {
            self.retained_order.push(key);
            if self.retained_order.len() > self.qos.history_depth {
                let evicted = self.retained_order.remove(0);
                self.retained.remove(&evicted);
                log::warn!(
                    "topic history depth {} exceeded, evicted instance '{}'",
                    self.qos.history_depth,
                    evicted
                );
            }
        }
    }

    fn fan_out(&mut self, sample: &Sample) {
        self.subscribers.retain(|entry| entry.offer(sample));
    }
}

/// In-process [`Transport`] implementation.
///
/// One instance is one discovery domain: participants sharing the `Arc`
/// discover each other, participants on separate instances never do. All
/// state is scoped to the instance; there are no process-wide singletons.
///
/// For failure-path testing, [`InProcessTransport::induce_failure`] makes
/// every subsequent publish/subscribe fail with
/// [`GenesisError::TransportUnavailable`] until cleared.
pub struct InProcessTransport {
    domain: u32,
    topics: Mutex<HashMap<String, TopicState>>,
    faulted: AtomicBool,
}

impl InProcessTransport {
    pub fn new(domain: u32) -> Arc<Self> {
        Arc::new(Self {
            domain,
            topics: Mutex::new(HashMap::new()),
            faulted: AtomicBool::new(false),
        })
    }

    /// Test hook: force transport operations to fail (or recover).
    pub fn induce_failure(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::SeqCst);
    }

    /// Number of retained instances on a durable topic.
    pub fn retained_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap();
        topics.get(topic).map(|t| t.retained.len()).unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), GenesisError> {
        if self.faulted.load(Ordering::SeqCst) {
            Err(GenesisError::TransportUnavailable(
                "transport fault induced".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(
        &self,
        topic: &str,
        qos: &TopicQos,
        sample: Sample,
    ) -> Result<(), GenesisError> {
        self.check_available()?;
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(qos.clone()));
        if state.qos.durability == Durability::TransientLocal {
            state.retain(&sample);
        }
        state.fan_out(&sample);
        Ok(())
    }

    async fn dispose(&self, topic: &str, qos: &TopicQos, key: &str) -> Result<(), GenesisError> {
        self.check_available()?;
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(qos.clone()));
        if state.retained.remove(key).is_some() {
            state.retained_order.retain(|k| k != key);
        }
        state.fan_out(&Sample::tombstone(key));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: &TopicQos,
        filter: Option<SampleFilter>,
    ) -> Result<Subscription, GenesisError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(qos.clone()));
        let entry = SubscriberEntry { tx, filter };
        // Durability: replay the retained set, in instance insertion order,
        // before the subscriber can observe any live sample.
        if state.qos.durability == Durability::TransientLocal {
            for key in &state.retained_order {
                if let Some(sample) = state.retained.get(key) {
                    if !entry.offer(sample) {
                        break;
                    }
                }
            }
        }
        state.subscribers.push(entry);
        Ok(Subscription {
            topic: topic.to_string(),
            rx,
        })
    }

    fn domain(&self) -> u32 {
        self.domain
    }
}

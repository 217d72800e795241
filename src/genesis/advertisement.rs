//! The advertisement plane: durable capability records and the local cache.
//!
//! Every provider publishes [`Advertisement`] records on one durable topic.
//! An advertisement declares either a callable FUNCTION, an AGENT that can be
//! delegated to, or the presence of a SERVICE (the wire calls the latter
//! REGISTRATION). The record envelope is fixed; everything that evolves lives
//! in the opaque JSON `payload`, so new capability attributes never change
//! the base type.
//!
//! Readers keep a [`CapabilityCache`]: a local projection of the current
//! advertisement set, fed by a single writer task attached to a
//! content-filtered subscription. Reads are snapshot clones and never hold
//! the writer up for long.
//!
//! # Identity
//!
//! `advertisement_id` is derived as `"{provider_id}/{kind}/{name}"`, which
//! makes "exactly one live advertisement per (provider, kind, name)" a
//! property of the key space: re-publishing replaces the previous payload
//! atomically (last-value-wins on the durable topic).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::genesis::error::GenesisError;
use crate::genesis::now_unix_nanos;
use crate::genesis::transport::{
    Sample, SampleFilter, TopicQos, Transport, ADVERTISEMENT_TOPIC,
};

/// Maximum byte length of `advertisement_id` and `provider_id`.
pub const MAX_ID_LEN: usize = 128;
/// Maximum byte length of `name` and `service_name`.
pub const MAX_NAME_LEN: usize = 256;
/// Maximum byte length of `description`.
pub const MAX_DESCRIPTION_LEN: usize = 2048;
/// Maximum byte length of the JSON `payload`.
pub const MAX_PAYLOAD_LEN: usize = 8192;

/// Minimum keep-last depth for the advertisement topic.
pub const ADVERTISEMENT_HISTORY_DEPTH: usize = 500;

/// QoS of the advertisement topic: transient-local, reliable, keep-last.
pub fn advertisement_qos() -> TopicQos {
    TopicQos::durable_keyed(ADVERTISEMENT_HISTORY_DEPTH)
}

/// What an advertisement declares.
///
/// Wire values are fixed: FUNCTION=0, AGENT=1, REGISTRATION=2. REGISTRATION
/// is the wire name for service-presence records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisementKind {
    Function = 0,
    Agent = 1,
    Registration = 2,
}

impl AdvertisementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvertisementKind::Function => "FUNCTION",
            AdvertisementKind::Agent => "AGENT",
            AdvertisementKind::Registration => "REGISTRATION",
        }
    }
}

impl fmt::Display for AdvertisementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for AdvertisementKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for AdvertisementKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(AdvertisementKind::Function),
            1 => Ok(AdvertisementKind::Agent),
            2 => Ok(AdvertisementKind::Registration),
            other => Err(D::Error::custom(format!(
                "invalid advertisement kind {}",
                other
            ))),
        }
    }
}

/// Recognized payload fields for FUNCTION advertisements.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionPayload {
    /// JSON-Schema object describing the accepted arguments.
    #[serde(default)]
    pub parameter_schema: serde_json::Value,
    /// Capability tags; the `idempotent` tag opts the function into automatic
    /// retries.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub classification_tags: Vec<String>,
    /// The RPC channel family that handles this function.
    #[serde(default)]
    pub service_name: String,
}

/// Recognized payload fields for AGENT advertisements.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentPayload {
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub classification_tags: Vec<String>,
    #[serde(default)]
    pub model_info: Option<serde_json::Value>,
    /// Whether this agent accepts requests no specialization matched.
    #[serde(default)]
    pub default_capable: bool,
}

/// Recognized payload fields for REGISTRATION (service presence) records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServicePayload {
    /// Names of the functions this service hosts.
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Durable capability record.
///
/// Built with the `with_*` helpers, validated and stamped by
/// [`AdvertisementWriter::publish`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advertisement {
    pub advertisement_id: String,
    pub kind: AdvertisementKind,
    pub name: String,
    pub description: String,
    pub service_name: String,
    pub provider_id: String,
    /// Unix nanos; monotonic within one provider.
    pub last_seen: i64,
    /// UTF-8 JSON; recognized fields depend on `kind`.
    pub payload: String,
}

impl Advertisement {
    /// Derive the advertisement key for `(provider, kind, name)`.
    pub fn id_for(provider_id: &str, kind: AdvertisementKind, name: &str) -> String {
        format!("{}/{}/{}", provider_id, kind.as_str(), name)
    }

    pub fn new(
        kind: AdvertisementKind,
        name: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let provider_id = provider_id.into();
        Self {
            advertisement_id: Self::id_for(&provider_id, kind, &name),
            kind,
            name,
            description: String::new(),
            service_name: String::new(),
            provider_id,
            last_seen: 0,
            payload: "{}".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Serialize a payload struct into the opaque JSON field.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
        self
    }

    /// Enforce the wire limits and require the payload to be valid JSON.
    ///
    /// A record at a limit is accepted; one byte over is refused with
    /// [`GenesisError::SchemaViolation`].
    pub fn validate(&self) -> Result<(), GenesisError> {
        check_len("advertisement_id", &self.advertisement_id, MAX_ID_LEN)?;
        check_len("provider_id", &self.provider_id, MAX_ID_LEN)?;
        check_len("name", &self.name, MAX_NAME_LEN)?;
        check_len("service_name", &self.service_name, MAX_NAME_LEN)?;
        check_len("description", &self.description, MAX_DESCRIPTION_LEN)?;
        check_len("payload", &self.payload, MAX_PAYLOAD_LEN)?;
        serde_json::from_str::<serde_json::Value>(&self.payload).map_err(|e| {
            GenesisError::SchemaViolation(format!("payload is not valid JSON: {}", e))
        })?;
        Ok(())
    }

    /// Parse the payload as a FUNCTION payload.
    pub fn function_payload(&self) -> Result<FunctionPayload, GenesisError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| GenesisError::SchemaViolation(format!("function payload: {}", e)))
    }

    /// Parse the payload as an AGENT payload.
    pub fn agent_payload(&self) -> Result<AgentPayload, GenesisError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| GenesisError::SchemaViolation(format!("agent payload: {}", e)))
    }

    /// Parse the payload as a REGISTRATION payload.
    pub fn service_payload(&self) -> Result<ServicePayload, GenesisError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| GenesisError::SchemaViolation(format!("service payload: {}", e)))
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

/// Content filter selecting only the given advertisement kinds.
///
/// Inspects the single `kind` field of the raw sample, so filtered-out
/// records are never fully deserialized by the subscriber.
pub fn kind_filter(kinds: &[AdvertisementKind]) -> SampleFilter {
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

/// Publishing half of the advertisement plane.
///
/// Owned by one participant; stamps `last_seen` monotonically within the
/// provider before publishing last-value-wins.
pub struct AdvertisementWriter {
    transport: Arc<dyn Transport>,
    qos: TopicQos,
    last_stamp: AtomicI64,
}

impl AdvertisementWriter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            qos: advertisement_qos(),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Validate, stamp, and publish. Returns the stamped record.
    pub async fn publish(&self, mut ad: Advertisement) -> Result<Advertisement, GenesisError> {
        ad.validate()?;
        ad.last_seen = self.next_stamp();
        let data = serde_json::to_value(&ad)
            .map_err(|e| GenesisError::SchemaViolation(e.to_string()))?;
        self.transport
            .publish(
                ADVERTISEMENT_TOPIC,
                &self.qos,
                Sample::keyed(ad.advertisement_id.clone(), data),
            )
            .await?;
        log::debug!(
            "advertised {} '{}' from {}",
            ad.kind,
            ad.name,
            ad.provider_id
        );
        Ok(ad)
    }

    /// Withdraw an advertisement by id.
    pub async fn dispose(&self, advertisement_id: &str) -> Result<(), GenesisError> {
        self.transport
            .dispose(ADVERTISEMENT_TOPIC, &self.qos, advertisement_id)
            .await
    }

    fn next_stamp(&self) -> i64 {
        let now = now_unix_nanos();
        loop {
            let prev = self.last_stamp.load(Ordering::SeqCst);
            let next = now.max(prev + 1);
            if self
                .last_stamp
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[derive(Default)]
struct CacheInner {
    ads: HashMap<String, Advertisement>,
}

/// A participant's local projection of the current advertisement set.
///
/// Single writer (the updater task spawned by [`CapabilityCache::attach`]),
/// many snapshot readers. Cloning the cache clones the handle, not the data.
#[derive(Clone, Default)]
pub struct CapabilityCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the advertisement topic (optionally restricted to some
    /// kinds) and spawn the updater task feeding this cache.
    pub async fn attach(
        &self,
        transport: &Arc<dyn Transport>,
        kinds: Option<&[AdvertisementKind]>,
    ) -> Result<tokio::task::JoinHandle<()>, GenesisError> {
        let filter = kinds.map(kind_filter);
        let mut subscription = transport
            .subscribe(ADVERTISEMENT_TOPIC, &advertisement_qos(), filter)
            .await?;
        let cache = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(sample) = subscription.recv().await {
                cache.apply(&sample);
            }
        }))
    }

    /// Apply one advertisement-topic sample to the cache.
    pub fn apply(&self, sample: &Sample) {
        if sample.disposed {
            if let Some(key) = &sample.key {
                let mut inner = self.inner.write().unwrap();
                inner.ads.remove(key);
            }
            return;
        }
        match serde_json::from_value::<Advertisement>(sample.data.clone()) {
            Ok(ad) => {
                let mut inner = self.inner.write().unwrap();
                inner.ads.insert(ad.advertisement_id.clone(), ad);
            }
            Err(e) => {
                // Refused at the boundary; malformed records never reach
                // readers.
                log::warn!("dropping malformed advertisement sample: {}", e);
            }
        }
    }

    /// Snapshot of every cached advertisement.
    pub fn snapshot(&self) -> Vec<Advertisement> {
        let inner = self.inner.read().unwrap();
        inner.ads.values().cloned().collect()
    }

    fn of_kind(&self, kind: AdvertisementKind) -> Vec<Advertisement> {
        let inner = self.inner.read().unwrap();
        inner
            .ads
            .values()
            .filter(|ad| ad.kind == kind)
            .cloned()
            .collect()
    }

    pub fn functions(&self) -> Vec<Advertisement> {
        self.of_kind(AdvertisementKind::Function)
    }

    pub fn agents(&self) -> Vec<Advertisement> {
        self.of_kind(AdvertisementKind::Agent)
    }

    pub fn services(&self) -> Vec<Advertisement> {
        self.of_kind(AdvertisementKind::Registration)
    }

    /// All providers currently advertising a FUNCTION with this name.
    pub fn functions_named(&self, name: &str) -> Vec<Advertisement> {
        let inner = self.inner.read().unwrap();
        inner
            .ads
            .values()
            .filter(|ad| ad.kind == AdvertisementKind::Function && ad.name == name)
            .cloned()
            .collect()
    }

    pub fn get(&self, advertisement_id: &str) -> Option<Advertisement> {
        let inner = self.inner.read().unwrap();
        inner.ads.get(advertisement_id).cloned()
    }

    /// Provider ids currently serving `service_class`, from REGISTRATION
    /// records and FUNCTION records naming the class.
    pub fn providers_of_class(&self, service_class: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut providers: Vec<String> = Vec::new();
        for ad in inner.ads.values() {
            let matches = match ad.kind {
                AdvertisementKind::Registration => ad.name == service_class,
                AdvertisementKind::Function | AdvertisementKind::Agent => {
                    ad.service_name == service_class
                }
            };
            if matches && !providers.contains(&ad.provider_id) {
                providers.push(ad.provider_id.clone());
            }
        }
        providers
    }

    /// Drop every advertisement owned by `provider_id`. Returns the number
    /// removed. Used when a lifecycle OFFLINE is observed for the provider.
    pub fn remove_provider(&self, provider_id: &str) -> usize {
        let mut inner = self.inner.write().unwrap();
        let before = inner.ads.len();
        inner.ads.retain(|_, ad| ad.provider_id != provider_id);
        before - inner.ads.len()
    }

    /// Drop advertisements whose `last_seen` is older than `max_age`,
    /// mirroring discovery liveliness timeout. Returns the number removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let cutoff = now_unix_nanos() - max_age.as_nanos() as i64;
        let mut inner = self.inner.write().unwrap();
        let before = inner.ads.len();
        inner.ads.retain(|_, ad| ad.last_seen >= cutoff);
        let removed = before - inner.ads.len();
        if removed > 0 {
            log::info!("swept {} stale advertisements", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.ads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn function_ad(provider: &str, name: &str) -> Advertisement {
        Advertisement::new(AdvertisementKind::Function, name, provider)
            .with_description("test function")
            .with_service_name("TestService")
            .with_payload(&FunctionPayload {
                parameter_schema: json!({"type": "object"}),
                capabilities: vec!["idempotent".to_string()],
                classification_tags: vec!["test".to_string()],
                service_name: "TestService".to_string(),
            })
    }

    #[test]
    fn id_encodes_provider_kind_name() {
        let ad = function_ad("p-1", "add");
        assert_eq!(ad.advertisement_id, "p-1/FUNCTION/add");
    }

    #[test]
    fn kind_serializes_as_wire_integer() {
        let ad = function_ad("p-1", "add");
        let value = serde_json::to_value(&ad).unwrap();
        assert_eq!(value["kind"], json!(0));
        let back: Advertisement = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind, AdvertisementKind::Function);
    }

    #[test]
    fn payload_at_limit_accepted_one_byte_over_refused() {
        let mut ad = function_ad("p-1", "add");
        let body = "x".repeat(MAX_PAYLOAD_LEN - 2);
        ad.payload = format!("\"{}\"", body);
        assert_eq!(ad.payload.len(), MAX_PAYLOAD_LEN);
        assert!(ad.validate().is_ok());

        let body = "x".repeat(MAX_PAYLOAD_LEN - 1);
        ad.payload = format!("\"{}\"", body);
        assert_eq!(ad.payload.len(), MAX_PAYLOAD_LEN + 1);
        match ad.validate() {
            Err(GenesisError::SchemaViolation(m)) => assert!(m.contains("payload")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn writer_stamps_monotonically() {
        let transport: Arc<dyn Transport> =
            crate::genesis::transport::InProcessTransport::new(0);
        let writer = AdvertisementWriter::new(transport);
        let first = writer.publish(function_ad("p-1", "add")).await.unwrap();
        let second = writer.publish(function_ad("p-1", "add")).await.unwrap();
        assert!(second.last_seen > first.last_seen);
    }

    #[tokio::test]
    async fn cache_sees_current_set_and_tombstones() {
        let transport: Arc<dyn Transport> =
            crate::genesis::transport::InProcessTransport::new(0);
        let writer = AdvertisementWriter::new(transport.clone());
        writer.publish(function_ad("p-1", "add")).await.unwrap();

        let cache = CapabilityCache::new();
        let _task = cache.attach(&transport, None).await.unwrap();
        tokio::task::yield_now().await;

        // Late joiner sees the pre-existing record.
        let mut tries = 0;
        while cache.len() == 0 && tries < 100 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tries += 1;
        }
        assert_eq!(cache.functions_named("add").len(), 1);

        writer.dispose("p-1/FUNCTION/add").await.unwrap();
        tries = 0;
        while cache.len() > 0 && tries < 100 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tries += 1;
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_stale_records() {
        let cache = CapabilityCache::new();
        let mut fresh = function_ad("p-1", "add");
        fresh.last_seen = crate::genesis::now_unix_nanos();
        let mut stale = function_ad("p-2", "add");
        stale.last_seen = fresh.last_seen - 60_000_000_000;
        cache.apply(&Sample::keyed(
            fresh.advertisement_id.clone(),
            serde_json::to_value(&fresh).unwrap(),
        ));
        cache.apply(&Sample::keyed(
            stale.advertisement_id.clone(),
            serde_json::to_value(&stale).unwrap(),
        ));

        let removed = cache.sweep_stale(Duration::from_secs(30));
        assert_eq!(removed, 1);
        let left = cache.functions_named("add");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].provider_id, "p-1");
    }

    #[test]
    fn kind_filter_selects_only_wanted_kinds() {
        let filter = kind_filter(&[AdvertisementKind::Function]);
        let function = Sample::keyed("a", json!({"kind": 0}));
        let agent = Sample::keyed("b", json!({"kind": 1}));
        assert!(filter(&function));
        assert!(!filter(&agent));
    }
}

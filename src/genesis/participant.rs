//! Participant lifecycle and identity.
//!
//! A [`Participant`] is one live process instance on the discovery plane: an
//! interface, an agent, or a service. It owns its advertisements, its node
//! record in the topology, and its lifecycle events. Nothing here is
//! process-global; the transport handle is passed in explicitly and all
//! state is scoped to the participant.
//!
//! # Lifecycle
//!
//! ```text
//! JOINING -> DISCOVERING -> READY <-> BUSY
//!                  |          |
//!                  v          v
//!               DEGRADED   DEGRADED
//!                  \          /
//!                   \--> OFFLINE
//! ```
//!
//! Every transition emits one LIFECYCLE event and one NODE topology update.
//! OFFLINE is terminal: the participant withdraws its advertisements and a
//! new identity is required to rejoin.
//!
//! DEGRADED is entered after the advertisement retry budget is exhausted (or
//! on declared upstream unavailability via [`Participant::set_state`]). A
//! degraded participant keeps serving already-matched peers, but every
//! re-advertisement it publishes carries `default_capable=false` and a
//! `degraded` capability tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use crate::genesis::advertisement::{
    Advertisement, AdvertisementKind, AdvertisementWriter, CapabilityCache,
};
use crate::genesis::config::GenesisConfig;
use crate::genesis::error::{GenesisError, RetryPolicy};
use crate::genesis::monitoring::{event_kind_filter, event_qos, EventKind, MonitoringPublisher};
use crate::genesis::transport::{Transport, EVENT_TOPIC};

/// Node state string published for terminal participants.
pub const OFFLINE_STATE: &str = "OFFLINE";

/// What role a participant plays on the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Interface,
    Agent,
    Service,
}

impl ParticipantKind {
    /// Node `element_type` for the topology topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantKind::Interface => "Interface",
            ParticipantKind::Agent => "Agent",
            ParticipantKind::Service => "Service",
        }
    }
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Joining,
    Discovering,
    Ready,
    Busy,
    Degraded,
    Offline,
}

impl ParticipantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantState::Joining => "JOINING",
            ParticipantState::Discovering => "DISCOVERING",
            ParticipantState::Ready => "READY",
            ParticipantState::Busy => "BUSY",
            ParticipantState::Degraded => "DEGRADED",
            ParticipantState::Offline => OFFLINE_STATE,
        }
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// OFFLINE is terminal; DEGRADED is reachable from every live state and
    /// leads only to OFFLINE.
    pub fn can_transition_to(&self, next: ParticipantState) -> bool {
        use ParticipantState::*;
        if *self == Offline {
            return false;
        }
        match (*self, next) {
            (_, Offline) => true,
            (Degraded, Degraded) => false,
            (_, Degraded) => true,
            (Joining, Discovering) => true,
            (Discovering, Ready) => true,
            (Ready, Busy) => true,
            (Busy, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct ParticipantInner {
    id: String,
    kind: ParticipantKind,
    display_name: String,
    transport: Arc<dyn Transport>,
    config: GenesisConfig,
    retry: RetryPolicy,
    state: RwLock<ParticipantState>,
    ads: tokio::sync::Mutex<HashMap<String, Advertisement>>,
    writer: AdvertisementWriter,
    monitoring: MonitoringPublisher,
    cache: CapabilityCache,
    in_flight: AtomicUsize,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A live process instance on the discovery plane.
///
/// Cloning clones the handle; all clones share one identity and state
/// machine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis::advertisement::{Advertisement, AdvertisementKind, AgentPayload};
/// use genesis::participant::{Participant, ParticipantKind};
/// use genesis::transport::{InProcessTransport, Transport};
///
/// # async {
/// let transport: Arc<dyn Transport> = InProcessTransport::new(0);
/// let agent = Participant::new(ParticipantKind::Agent, "Primary", transport);
/// agent.start().await.unwrap();
///
/// let ad = Advertisement::new(AdvertisementKind::Agent, "Primary", agent.id())
///     .with_service_name("Agent")
///     .with_payload(&AgentPayload {
///         default_capable: true,
///         ..AgentPayload::default()
///     });
/// agent.advertise(ad).await.unwrap();
/// // ... serve requests ...
/// agent.close().await.unwrap();
/// # };
/// ```
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

impl Participant {
    /// Create a participant with a fresh UUID identity. It starts in JOINING
    /// and does nothing on the wire until [`Participant::start`].
    pub fn new(
        kind: ParticipantKind,
        display_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, display_name, transport)
    }

    /// Create a participant with an explicit identity (tests, resumption of
    /// externally assigned ids).
    pub fn with_id(
        id: impl Into<String>,
        kind: ParticipantKind,
        display_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let id = id.into();
        let monitoring = MonitoringPublisher::new(transport.clone(), id.clone(), kind.as_str());
        Self {
            inner: Arc::new(ParticipantInner {
                id,
                kind,
                display_name: display_name.into(),
                transport: transport.clone(),
                config: GenesisConfig::default(),
                retry: RetryPolicy::default(),
                state: RwLock::new(ParticipantState::Joining),
                ads: tokio::sync::Mutex::new(HashMap::new()),
                writer: AdvertisementWriter::new(transport),
                monitoring,
                cache: CapabilityCache::new(),
                in_flight: AtomicUsize::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the default configuration. Must be called before
    /// [`Participant::start`]; the builder consumes and returns `self`.
    pub fn with_config(self, config: GenesisConfig) -> Self {
        // The inner Arc has not been shared yet during construction.
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.config = config;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                log::warn!("with_config called on a shared participant; ignored");
                Self { inner }
            }
        }
    }

    /// Replace the advertisement retry policy (builder).
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.retry = retry;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                log::warn!("with_retry_policy called on a shared participant; ignored");
                Self { inner }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> ParticipantKind {
        self.inner.kind
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn state(&self) -> ParticipantState {
        *self.inner.state.read().unwrap()
    }

    /// This participant's projection of the advertisement plane.
    pub fn cache(&self) -> &CapabilityCache {
        &self.inner.cache
    }

    pub fn monitoring(&self) -> &MonitoringPublisher {
        &self.inner.monitoring
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &GenesisConfig {
        &self.inner.config
    }

    /// Join the plane: publish identity, subscribe to the advertisement
    /// topic, and move to DISCOVERING (interfaces continue straight to
    /// READY; providers reach READY on their first acknowledged
    /// advertisement).
    pub async fn start(&self) -> Result<(), GenesisError> {
        if self.state() != ParticipantState::Joining {
            return Err(GenesisError::IllegalTransition {
                from: self.state().as_str().to_string(),
                to: ParticipantState::Discovering.as_str().to_string(),
            });
        }

        self.inner
            .monitoring
            .lifecycle(
                "STARTED",
                "INFO",
                &format!("{} '{}' starting", self.inner.kind, self.inner.display_name),
                self.identity_metadata(),
            )
            .await?;
        self.inner
            .monitoring
            .publish_node(ParticipantState::Joining.as_str(), self.identity_metadata())
            .await?;

        let updater = self.inner.cache.attach(&self.inner.transport, None).await?;
        self.inner.tasks.lock().unwrap().push(updater);
        self.spawn_lifecycle_watcher().await?;
        self.spawn_liveliness_task();

        self.set_state(ParticipantState::Discovering, None).await?;
        if self.inner.kind == ParticipantKind::Interface {
            self.set_state(ParticipantState::Ready, None).await?;
        }
        Ok(())
    }

    /// Watch the event stream for peers reporting OFFLINE and drop their
    /// cached advertisements. This covers providers whose tombstones never
    /// arrive (a crash reported by another observer, for instance).
    async fn spawn_lifecycle_watcher(&self) -> Result<(), GenesisError> {
        let mut lifecycle = self
            .inner
            .transport
            .subscribe(
                EVENT_TOPIC,
                &event_qos(),
                Some(event_kind_filter(&[EventKind::Lifecycle])),
            )
            .await?;
        let cache = self.inner.cache.clone();
        let me = self.inner.id.clone();
        let task = tokio::spawn(async move {
            while let Some(sample) = lifecycle.recv().await {
                let event_type = sample.data.get("event_type").and_then(|v| v.as_str());
                let component = sample.data.get("component_id").and_then(|v| v.as_str());
                if let (Some(OFFLINE_STATE), Some(component)) = (event_type, component) {
                    if component == me {
                        continue;
                    }
                    let removed = cache.remove_provider(component);
                    if removed > 0 {
                        log::info!(
                            "dropped {} advertisements from offline provider '{}'",
                            removed,
                            component
                        );
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Periodically re-stamp this participant's advertisements and sweep
    /// cached peers that missed their refresh deadline. This is the
    /// discovery-timeout half of liveliness; clean shutdown still withdraws
    /// eagerly via tombstones.
    fn spawn_liveliness_task(&self) {
        let participant = self.clone();
        let interval = self.inner.config.liveliness_interval;
        let timeout = self.inner.config.liveliness_timeout;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if participant.state() == ParticipantState::Offline {
                    break;
                }
                if let Err(e) = participant.re_advertise_all().await {
                    log::warn!("liveliness re-advertisement failed: {}", e);
                }
                participant.cache().sweep_stale(timeout);
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
    }

    /// Transition the lifecycle state, emitting the LIFECYCLE event and NODE
    /// update the monitoring contract requires.
    pub async fn set_state(
        &self,
        next: ParticipantState,
        reason: Option<&str>,
    ) -> Result<(), GenesisError> {
        let previous = {
            let mut state = self.inner.state.write().unwrap();
            if !state.can_transition_to(next) {
                return Err(GenesisError::IllegalTransition {
                    from: state.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            let previous = *state;
            *state = next;
            previous
        };

        let severity = if next == ParticipantState::Degraded {
            "WARN"
        } else {
            "INFO"
        };
        let message = match reason {
            Some(reason) => format!(
                "'{}' {} -> {} ({})",
                self.inner.display_name, previous, next, reason
            ),
            None => format!("'{}' {} -> {}", self.inner.display_name, previous, next),
        };
        self.inner
            .monitoring
            .lifecycle(next.as_str(), severity, &message, self.identity_metadata())
            .await?;
        self.inner
            .monitoring
            .publish_node(next.as_str(), self.identity_metadata())
            .await?;
        log::info!("participant {}: {}", self.inner.id, message);
        Ok(())
    }

    /// Publish (or replace) one of this participant's advertisements.
    ///
    /// The provider id and advertisement key are forced to this identity.
    /// Transport failures are retried with exponential backoff; when the
    /// budget is exhausted the participant transitions to DEGRADED and the
    /// error is returned. The first acknowledged advertisement moves a
    /// DISCOVERING provider to READY.
    pub async fn advertise(&self, mut ad: Advertisement) -> Result<String, GenesisError> {
        if self.state() == ParticipantState::Offline {
            return Err(GenesisError::IllegalTransition {
                from: OFFLINE_STATE.to_string(),
                to: "advertise".to_string(),
            });
        }
        ad.provider_id = self.inner.id.clone();
        ad.advertisement_id = Advertisement::id_for(&ad.provider_id, ad.kind, &ad.name);
        if self.state() == ParticipantState::Degraded {
            ad = self.degrade_advertisement(ad);
        }

        let mut attempt = 0;
        let stamped = loop {
            match self.inner.writer.publish(ad.clone()).await {
                Ok(stamped) => break stamped,
                Err(e @ GenesisError::SchemaViolation(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.inner.retry.max_attempts {
                        let _ = self
                            .set_state(
                                ParticipantState::Degraded,
                                Some("advertisement retry budget exhausted"),
                            )
                            .await;
                        return Err(e);
                    }
                    log::warn!(
                        "advertise attempt {}/{} failed for '{}': {}",
                        attempt,
                        self.inner.retry.max_attempts,
                        ad.name,
                        e
                    );
                    tokio::time::sleep(self.inner.retry.delay_for(attempt - 1)).await;
                }
            }
        };

        let id = stamped.advertisement_id.clone();
        self.inner.ads.lock().await.insert(id.clone(), stamped);
        if self.state() == ParticipantState::Discovering {
            self.set_state(ParticipantState::Ready, None).await?;
        }
        Ok(id)
    }

    /// Withdraw one advertisement by id.
    pub async fn withdraw(&self, advertisement_id: &str) -> Result<(), GenesisError> {
        self.inner.writer.dispose(advertisement_id).await?;
        self.inner.ads.lock().await.remove(advertisement_id);
        Ok(())
    }

    /// Re-publish every advertisement this participant owns, refreshing
    /// `last_seen` (liveliness) and applying the DEGRADED rewrite when
    /// applicable.
    pub async fn re_advertise_all(&self) -> Result<(), GenesisError> {
        let ads: Vec<Advertisement> = {
            let ads = self.inner.ads.lock().await;
            ads.values().cloned().collect()
        };
        for ad in ads {
            self.advertise(ad).await?;
        }
        Ok(())
    }

    /// Mark entry into request handling. Requests are reference-counted:
    /// the first in-flight request transitions READY to BUSY, overlapping
    /// requests only bump the count. BUSY does not stop advertisement
    /// processing; it only reflects on the topology.
    pub async fn begin_request(&self) {
        let previous = self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && self.state() == ParticipantState::Ready {
            let _ = self.set_state(ParticipantState::Busy, None).await;
        }
    }

    /// Mark exit from request handling. The participant returns to READY
    /// only when the last in-flight request completes.
    pub async fn end_request(&self) {
        let previous = self
            .inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 && self.state() == ParticipantState::Busy {
            let _ = self.set_state(ParticipantState::Ready, None).await;
        }
    }

    /// Clean shutdown: stop background tasks, publish the final LIFECYCLE
    /// event and NODE state, and withdraw every advertisement. Terminal.
    pub async fn close(&self) -> Result<(), GenesisError> {
        if self.state() == ParticipantState::Offline {
            return Ok(());
        }
        // Tasks go first so a concurrent liveliness tick cannot re-publish
        // an advertisement after it is withdrawn below.
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.set_state(ParticipantState::Offline, Some("clean shutdown"))
            .await?;

        let ids: Vec<String> = {
            let ads = self.inner.ads.lock().await;
            ads.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.inner.writer.dispose(&id).await {
                log::warn!("could not withdraw '{}' during close: {}", id, e);
            }
        }
        self.inner.ads.lock().await.clear();
        Ok(())
    }

    fn identity_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "display_name": self.inner.display_name.clone(),
            "kind": self.inner.kind.as_str(),
        })
    }

    /// Rewrite an AGENT advertisement for DEGRADED operation.
    fn degrade_advertisement(&self, mut ad: Advertisement) -> Advertisement {
        if ad.kind != AdvertisementKind::Agent {
            return ad;
        }
        match ad.agent_payload() {
            Ok(mut payload) => {
                payload.default_capable = false;
                if !payload.capabilities.iter().any(|c| c == "degraded") {
                    payload.capabilities.push("degraded".to_string());
                }
                ad.with_payload(&payload)
            }
            Err(_) => ad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::advertisement::AgentPayload;
    use crate::genesis::transport::InProcessTransport;

    #[test]
    fn offline_is_terminal() {
        use ParticipantState::*;
        assert!(!Offline.can_transition_to(Ready));
        assert!(!Offline.can_transition_to(Degraded));
        assert!(Busy.can_transition_to(Offline));
        assert!(Degraded.can_transition_to(Offline));
    }

    #[test]
    fn ready_busy_round_trip_is_legal() {
        use ParticipantState::*;
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(!Busy.can_transition_to(Discovering));
        assert!(!Joining.can_transition_to(Ready));
    }

    #[tokio::test]
    async fn interface_reaches_ready_on_start() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let iface = Participant::new(ParticipantKind::Interface, "UI", transport);
        iface.start().await.unwrap();
        assert_eq!(iface.state(), ParticipantState::Ready);
    }

    #[tokio::test]
    async fn provider_reaches_ready_on_first_advertisement() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let agent = Participant::new(ParticipantKind::Agent, "Primary", transport);
        agent.start().await.unwrap();
        assert_eq!(agent.state(), ParticipantState::Discovering);

        let ad = Advertisement::new(AdvertisementKind::Agent, "Primary", agent.id())
            .with_service_name("Agent")
            .with_payload(&AgentPayload {
                default_capable: true,
                ..AgentPayload::default()
            });
        agent.advertise(ad).await.unwrap();
        assert_eq!(agent.state(), ParticipantState::Ready);
    }

    #[tokio::test]
    async fn withdraw_removes_the_durable_record() {
        let transport = InProcessTransport::new(0);
        let as_dyn: Arc<dyn Transport> = transport.clone();
        let svc = Participant::new(ParticipantKind::Service, "Calc", as_dyn);
        svc.start().await.unwrap();
        let ad = Advertisement::new(AdvertisementKind::Registration, "Calculator", svc.id())
            .with_payload(&crate::genesis::advertisement::ServicePayload::default());
        let id = svc.advertise(ad).await.unwrap();
        assert_eq!(
            transport.retained_count(crate::genesis::transport::ADVERTISEMENT_TOPIC),
            1
        );
        svc.withdraw(&id).await.unwrap();
        assert_eq!(
            transport.retained_count(crate::genesis::transport::ADVERTISEMENT_TOPIC),
            0
        );
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_and_rewrite_payload() {
        let transport = InProcessTransport::new(0);
        let as_dyn: Arc<dyn Transport> = transport.clone();
        let agent = Participant::new(ParticipantKind::Agent, "Primary", as_dyn)
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            });
        agent.start().await.unwrap();

        let ad = Advertisement::new(AdvertisementKind::Agent, "Primary", agent.id())
            .with_service_name("Agent")
            .with_payload(&AgentPayload {
                default_capable: true,
                ..AgentPayload::default()
            });

        transport.induce_failure(true);
        let err = agent.advertise(ad.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "TransportUnavailable");
        assert_eq!(agent.state(), ParticipantState::Degraded);

        // While DEGRADED, re-advertisements must not claim default
        // capability.
        transport.induce_failure(false);
        agent.advertise(ad).await.unwrap();
        // Read back what was actually published through a fresh cache.
        let cache = crate::genesis::advertisement::CapabilityCache::new();
        let _task = cache.attach(agent.transport(), None).await.unwrap();
        let mut tries = 0;
        while cache.is_empty() && tries < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            tries += 1;
        }
        let ads = cache.agents();
        assert_eq!(ads.len(), 1);
        let payload = ads[0].agent_payload().unwrap();
        assert!(!payload.default_capable);
        assert!(payload.capabilities.contains(&"degraded".to_string()));
    }

    #[tokio::test]
    async fn overlapping_requests_stay_busy_until_last_completes() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let iface = Participant::new(ParticipantKind::Interface, "UI", transport);
        iface.start().await.unwrap();
        assert_eq!(iface.state(), ParticipantState::Ready);

        iface.begin_request().await;
        assert_eq!(iface.state(), ParticipantState::Busy);
        iface.begin_request().await;

        // The first completion must not flip the node back to READY while
        // the second request is still in flight.
        iface.end_request().await;
        assert_eq!(iface.state(), ParticipantState::Busy);
        iface.end_request().await;
        assert_eq!(iface.state(), ParticipantState::Ready);

        // An unmatched completion is a no-op, not an underflow.
        iface.end_request().await;
        assert_eq!(iface.state(), ParticipantState::Ready);
    }

    #[tokio::test]
    async fn liveliness_refreshes_last_seen() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let config = GenesisConfig {
            liveliness_interval: std::time::Duration::from_millis(20),
            ..GenesisConfig::default()
        };
        let agent = Participant::new(ParticipantKind::Agent, "Primary", transport.clone())
            .with_config(config);
        agent.start().await.unwrap();
        let ad = Advertisement::new(AdvertisementKind::Agent, "Primary", agent.id())
            .with_service_name("Agent")
            .with_payload(&AgentPayload::default());
        agent.advertise(ad).await.unwrap();

        let observer = crate::genesis::advertisement::CapabilityCache::new();
        let _task = observer.attach(agent.transport(), None).await.unwrap();
        let mut tries = 0;
        while observer.is_empty() && tries < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            tries += 1;
        }
        let first = observer.agents()[0].last_seen;

        // The periodic refresh re-stamps the record without any new
        // advertise() call.
        tries = 0;
        loop {
            let ads = observer.agents();
            if !ads.is_empty() && ads[0].last_seen > first {
                break;
            }
            assert!(tries < 500, "last_seen was never refreshed");
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            tries += 1;
        }
    }

    #[tokio::test]
    async fn offline_lifecycle_event_purges_provider_from_cache() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let agent = Participant::new(ParticipantKind::Agent, "Primary", transport.clone());
        agent.start().await.unwrap();

        let provider = Participant::new(ParticipantKind::Service, "Calc", transport.clone());
        provider.start().await.unwrap();
        let ad = Advertisement::new(AdvertisementKind::Registration, "Calculator", provider.id())
            .with_payload(&crate::genesis::advertisement::ServicePayload::default());
        provider.advertise(ad).await.unwrap();

        let mut tries = 0;
        while agent.cache().services().is_empty() && tries < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            tries += 1;
        }
        assert_eq!(agent.cache().services().len(), 1);

        // The provider crashes without tombstoning; a peer reports the
        // OFFLINE transition on the event stream.
        let reporter =
            MonitoringPublisher::new(transport.clone(), provider.id(), "Service");
        reporter
            .lifecycle(OFFLINE_STATE, "WARN", "missed liveliness", serde_json::json!({}))
            .await
            .unwrap();

        tries = 0;
        while !agent.cache().services().is_empty() && tries < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            tries += 1;
        }
        assert!(agent.cache().services().is_empty());
    }

    #[tokio::test]
    async fn stale_peers_are_swept_after_liveliness_timeout() {
        let transport: Arc<dyn Transport> = InProcessTransport::new(0);
        let config = GenesisConfig {
            liveliness_interval: std::time::Duration::from_millis(10),
            liveliness_timeout: std::time::Duration::from_millis(50),
            ..GenesisConfig::default()
        };
        let agent = Participant::new(ParticipantKind::Agent, "Primary", transport)
            .with_config(config);
        agent.start().await.unwrap();

        // A record from a provider that stopped refreshing long ago.
        let mut stale = Advertisement::new(AdvertisementKind::Registration, "Ghost", "p-ghost");
        stale.last_seen = crate::genesis::now_unix_nanos() - 60_000_000_000;
        agent.cache().apply(&crate::genesis::transport::Sample::keyed(
            stale.advertisement_id.clone(),
            serde_json::to_value(&stale).unwrap(),
        ));
        assert_eq!(agent.cache().len(), 1);

        let mut tries = 0;
        while !agent.cache().is_empty() && tries < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            tries += 1;
        }
        assert!(agent.cache().is_empty());
    }

    #[tokio::test]
    async fn close_is_terminal_and_withdraws() {
        let transport = InProcessTransport::new(0);
        let as_dyn: Arc<dyn Transport> = transport.clone();
        let svc = Participant::new(ParticipantKind::Service, "Calc", as_dyn);
        svc.start().await.unwrap();
        let ad = Advertisement::new(AdvertisementKind::Registration, "Calculator", svc.id())
            .with_payload(&crate::genesis::advertisement::ServicePayload::default());
        svc.advertise(ad).await.unwrap();
        assert_eq!(
            transport.retained_count(crate::genesis::transport::ADVERTISEMENT_TOPIC),
            1
        );

        svc.close().await.unwrap();
        assert_eq!(svc.state(), ParticipantState::Offline);
        assert_eq!(
            transport.retained_count(crate::genesis::transport::ADVERTISEMENT_TOPIC),
            0
        );
        assert!(svc
            .set_state(ParticipantState::Ready, None)
            .await
            .is_err());
    }
}

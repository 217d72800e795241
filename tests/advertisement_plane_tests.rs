use std::sync::Arc;
use std::time::Duration;

use genesis::advertisement::{
    advertisement_qos, kind_filter, Advertisement, AdvertisementKind, AgentPayload,
    CapabilityCache, FunctionPayload, ServicePayload,
};
use genesis::participant::{Participant, ParticipantKind};
use genesis::transport::{InProcessTransport, Transport, ADVERTISEMENT_TOPIC};

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn function_ad(name: &str, service: &str) -> Advertisement {
    Advertisement::new(AdvertisementKind::Function, name, "")
        .with_description("a function")
        .with_service_name(service)
        .with_payload(&FunctionPayload {
            parameter_schema: serde_json::json!({"type": "object"}),
            capabilities: vec![],
            classification_tags: vec![],
            service_name: service.to_string(),
        })
}

#[tokio::test]
async fn late_joining_reader_observes_current_set() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);

    let alpha = Participant::new(ParticipantKind::Service, "Alpha", transport.clone());
    alpha.start().await.unwrap();
    alpha.advertise(function_ad("alpha_fn", "Alpha")).await.unwrap();

    let beta = Participant::new(ParticipantKind::Service, "Beta", transport.clone());
    beta.start().await.unwrap();
    beta.advertise(function_ad("beta_fn", "Beta")).await.unwrap();

    // A reader attaching well after both providers still converges on the
    // full current set.
    let cache = CapabilityCache::new();
    let _task = cache.attach(&transport, None).await.unwrap();
    wait_until(
        || cache.functions_named("alpha_fn").len() == 1 && cache.functions_named("beta_fn").len() == 1,
        "late cache to see both functions",
    )
    .await;
}

#[tokio::test]
async fn function_filter_sees_every_function_and_nothing_else() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let mut sub = transport
        .subscribe(
            ADVERTISEMENT_TOPIC,
            &advertisement_qos(),
            Some(kind_filter(&[AdvertisementKind::Function])),
        )
        .await
        .unwrap();

    let provider = Participant::new(ParticipantKind::Service, "Mixed", transport.clone());
    provider.start().await.unwrap();
    provider
        .advertise(
            Advertisement::new(AdvertisementKind::Registration, "Mixed", "")
                .with_payload(&ServicePayload::default()),
        )
        .await
        .unwrap();
    provider.advertise(function_ad("f1", "Mixed")).await.unwrap();
    provider.advertise(function_ad("f2", "Mixed")).await.unwrap();

    let agent = Participant::new(ParticipantKind::Agent, "A", transport.clone());
    agent.start().await.unwrap();
    agent
        .advertise(
            Advertisement::new(AdvertisementKind::Agent, "A", "")
                .with_service_name("Agent")
                .with_payload(&AgentPayload::default()),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..200 {
        if seen.len() >= 2 {
            break;
        }
        if let Some(sample) = sub.try_recv() {
            if !sample.disposed {
                let ad: Advertisement = serde_json::from_value(sample.data).unwrap();
                seen.push(ad);
            }
            continue;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|ad| ad.kind == AdvertisementKind::Function));
    // Nothing else arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn republishing_replaces_payload_last_value_wins() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let provider = Participant::new(ParticipantKind::Service, "Calc", transport.clone());
    provider.start().await.unwrap();

    provider.advertise(function_ad("add", "CalcV1")).await.unwrap();
    provider.advertise(function_ad("add", "CalcV2")).await.unwrap();

    let cache = CapabilityCache::new();
    let _task = cache.attach(&transport, None).await.unwrap();
    wait_until(|| cache.functions_named("add").len() == 1, "one add record").await;

    let ads = cache.functions_named("add");
    assert_eq!(ads.len(), 1);
    assert_eq!(ads[0].service_name, "CalcV2");
}

#[tokio::test]
async fn new_provider_is_discovered_without_restart() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);

    // The agent joins first and is READY.
    let agent = Participant::new(ParticipantKind::Agent, "Primary", transport.clone());
    agent.start().await.unwrap();
    agent
        .advertise(
            Advertisement::new(AdvertisementKind::Agent, "Primary", "")
                .with_service_name("Agent")
                .with_payload(&AgentPayload::default()),
        )
        .await
        .unwrap();
    assert!(agent.cache().functions_named("to_upper").is_empty());

    // A text-processing service appears later.
    let text = Participant::new(ParticipantKind::Service, "TextProcessor", transport.clone());
    text.start().await.unwrap();
    text.advertise(function_ad("to_upper", "TextProcessor"))
        .await
        .unwrap();

    // The running agent's cache converges within the join budget.
    wait_until(
        || agent.cache().functions_named("to_upper").len() == 1,
        "agent cache to discover to_upper",
    )
    .await;
}

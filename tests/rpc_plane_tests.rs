use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use genesis::error::{GenesisError, RetryPolicy};
use genesis::rpc::{serve, RequestEnvelope, RpcClient, RpcHandler};
use genesis::transport::{InProcessTransport, Transport};

struct Adder;

#[async_trait]
impl RpcHandler for Adder {
    async fn handle(&self, request: RequestEnvelope) -> Result<serde_json::Value, GenesisError> {
        let args = request.arguments_json()?;
        let x = args["x"].as_f64().unwrap_or(0.0);
        let y = args["y"].as_f64().unwrap_or(0.0);
        Ok(json!(x + y))
    }
}

#[tokio::test]
async fn exactly_one_reply_is_accepted_with_multiple_providers() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    // Two providers of the same class both answer untargeted requests; the
    // caller accepts exactly one reply per correlation.
    let _a = serve(transport.clone(), "svc-a", "Math", Arc::new(Adder))
        .await
        .unwrap();
    let _b = serve(transport.clone(), "svc-b", "Math", Arc::new(Adder))
        .await
        .unwrap();

    let client = RpcClient::new(transport, "caller");
    let reply = client
        .call(
            "Math",
            None,
            "add",
            &json!({"x": 1, "y": 2}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap();
    assert_eq!(reply.result_json().unwrap(), json!(3.0));

    // The second provider's reply for the same correlation was discarded;
    // a follow-up call still works normally.
    let reply = client
        .call(
            "Math",
            None,
            "add",
            &json!({"x": 2, "y": 2}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap();
    assert_eq!(reply.result_json().unwrap(), json!(4.0));
}

#[tokio::test]
async fn idempotent_replay_yields_byte_equal_results() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let _server = serve(transport.clone(), "svc-1", "Math", Arc::new(Adder))
        .await
        .unwrap();
    let client = RpcClient::new(transport, "caller");

    let args = json!({"x": 2, "y": 3});
    let first = client
        .call("Math", Some("svc-1"), "add", &args, Duration::from_secs(1), None)
        .await
        .unwrap();
    let second = client
        .call("Math", Some("svc-1"), "add", &args, Duration::from_secs(1), None)
        .await
        .unwrap();

    // Canonical JSON equality and byte equality of the result field.
    assert_eq!(first.result_json().unwrap(), second.result_json().unwrap());
    assert_eq!(first.result, second.result);
}

struct FlakyFirst {
    calls: Mutex<Vec<String>>,
    served: AtomicUsize,
}

#[async_trait]
impl RpcHandler for FlakyFirst {
    async fn handle(&self, request: RequestEnvelope) -> Result<serde_json::Value, GenesisError> {
        self.calls.lock().unwrap().push(request.correlation_id.clone());
        if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
            // Outlive the caller's deadline so the first attempt times out.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(json!("ok"))
    }
}

#[tokio::test]
async fn retries_are_distinct_correlations() {
    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let handler = Arc::new(FlakyFirst {
        calls: Mutex::new(Vec::new()),
        served: AtomicUsize::new(0),
    });
    let _server = serve(transport.clone(), "svc-1", "Flaky", handler.clone())
        .await
        .unwrap();

    let client = RpcClient::new(transport, "caller");
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let reply = client
        .call_with_retry(
            "Flaky",
            Some("svc-1"),
            "work",
            &json!({}),
            Duration::from_millis(60),
            None,
            &policy,
        )
        .await
        .unwrap();
    assert_eq!(reply.result_json().unwrap(), json!("ok"));

    let calls = handler.calls.lock().unwrap();
    assert!(calls.len() >= 2, "expected at least two attempts");
    assert_ne!(calls[0], calls[1], "each retry must be a fresh correlation");
}

#[tokio::test]
async fn error_replies_carry_the_error_kind() {
    struct Refusing;

    #[async_trait]
    impl RpcHandler for Refusing {
        async fn handle(
            &self,
            _request: RequestEnvelope,
        ) -> Result<serde_json::Value, GenesisError> {
            Err(GenesisError::SchemaViolation("bad arguments".to_string()))
        }
    }

    let transport: Arc<dyn Transport> = InProcessTransport::new(0);
    let _server = serve(transport.clone(), "svc-1", "Strict", Arc::new(Refusing))
        .await
        .unwrap();
    let client = RpcClient::new(transport, "caller");
    let reply = client
        .call(
            "Strict",
            Some("svc-1"),
            "anything",
            &json!({}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap();
    assert!(!reply.is_ok());
    match reply.to_error() {
        Some(GenesisError::SchemaViolation(message)) => {
            assert!(message.contains("bad arguments"))
        }
        other => panic!("unexpected: {:?}", other),
    }
}

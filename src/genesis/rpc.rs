//! Request/reply messaging over the volatile topic pair of a service class.
//!
//! Every service class `C` owns two topics, `rti/connext/genesis/rpc/CRequest`
//! and `...CReply`. The channel is multi-producer multi-consumer on the
//! service side; a request may carry a `to_participant` hint that restricts
//! delivery to one provider (enforced by a content filter at the source).
//! Replies are addressed back to the requester the same way and matched to
//! the in-flight call through the correlation id.
//!
//! Guarantees, as implemented here:
//!
//! - **At most one accepted reply per correlation.** The caller holds a
//!   one-shot slot per correlation id; the first matching reply consumes it
//!   and later replies are discarded with a debug log.
//! - **Caller-side deadlines.** A deadline of zero fails immediately with
//!   `Timeout` and publishes nothing. On expiry the slot is released before
//!   the error is returned, so a late reply cannot be accepted.
//! - **Retries are new calls.** [`RpcClient::call_with_retry`] mints a fresh
//!   correlation id per attempt; each attempt is a distinct, observable hop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::genesis::error::{GenesisError, RetryPolicy};
use crate::genesis::now_unix_nanos;
use crate::genesis::transport::{
    rpc_reply_topic, rpc_request_topic, Sample, SampleFilter, TopicQos, Transport,
};

/// Maximum byte length of `correlation_id`.
pub const MAX_CORRELATION_ID_LEN: usize = 64;
/// Maximum byte length of participant ids in the envelope.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;
/// Maximum byte length of `operation`.
pub const MAX_OPERATION_LEN: usize = 128;
/// Maximum byte length of the JSON `arguments`.
pub const MAX_ARGUMENTS_LEN: usize = 65536;
/// Maximum byte length of `conversation_id`.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

/// QoS of both RPC topics.
pub fn rpc_qos() -> TopicQos {
    TopicQos::volatile()
}

/// One RPC request. `to_participant` empty means "any capable provider";
/// `conversation_id` empty means none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub from: String,
    pub to_participant: String,
    pub operation: String,
    /// UTF-8 JSON.
    pub arguments: String,
    pub deadline_unix_ns: i64,
    pub conversation_id: String,
}

impl RequestEnvelope {
    /// Parse the JSON arguments.
    pub fn arguments_json(&self) -> Result<serde_json::Value, GenesisError> {
        serde_json::from_str(&self.arguments)
            .map_err(|e| GenesisError::SchemaViolation(format!("arguments: {}", e)))
    }

    /// Wall-clock budget left before the caller's deadline.
    pub fn remaining(&self) -> Duration {
        let nanos = self.deadline_unix_ns.saturating_sub(now_unix_nanos());
        if nanos <= 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    pub fn validate(&self) -> Result<(), GenesisError> {
        check_len("correlation_id", &self.correlation_id, MAX_CORRELATION_ID_LEN)?;
        check_len("from", &self.from, MAX_PARTICIPANT_ID_LEN)?;
        check_len("to_participant", &self.to_participant, MAX_PARTICIPANT_ID_LEN)?;
        check_len("operation", &self.operation, MAX_OPERATION_LEN)?;
        check_len("arguments", &self.arguments, MAX_ARGUMENTS_LEN)?;
        check_len(
            "conversation_id",
            &self.conversation_id,
            MAX_CONVERSATION_ID_LEN,
        )?;
        Ok(())
    }
}

/// One RPC reply. `status` zero is success with `result` set; non-zero
/// carries a `"Kind: message"` string in `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub correlation_id: String,
    pub from: String,
    pub to_participant: String,
    pub status: i32,
    pub result: String,
    pub error: String,
    pub conversation_id: String,
}

impl ReplyEnvelope {
    /// Successful reply carrying a JSON result.
    pub fn ok(request: &RequestEnvelope, from: &str, result: &serde_json::Value) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            from: from.to_string(),
            to_participant: request.from.clone(),
            status: 0,
            result: result.to_string(),
            error: String::new(),
            conversation_id: request.conversation_id.clone(),
        }
    }

    /// Failed reply carrying an error kind.
    pub fn fail(request: &RequestEnvelope, from: &str, error: &GenesisError) -> Self {
        let (status, wire) = error.to_wire();
        Self {
            correlation_id: request.correlation_id.clone(),
            from: from.to_string(),
            to_participant: request.from.clone(),
            status,
            result: String::new(),
            error: wire,
            conversation_id: request.conversation_id.clone(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// Parse the JSON result of a successful reply.
    pub fn result_json(&self) -> Result<serde_json::Value, GenesisError> {
        serde_json::from_str(&self.result)
            .map_err(|e| GenesisError::SchemaViolation(format!("result: {}", e)))
    }

    /// Decode the carried error, if any.
    pub fn to_error(&self) -> Option<GenesisError> {
        if self.is_ok() {
            None
        } else {
            Some(GenesisError::from_wire(&self.error))
        }
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

/// Filter: samples addressed to this participant, or to anyone.
fn addressed_to(participant_id: &str) -> SampleFilter {
    let me = participant_id.to_string();
    Arc::new(move |sample: &Sample| {
        match sample.data.get("to_participant").and_then(|v| v.as_str()) {
            Some("") | None => true,
            Some(target) => target == me,
        }
    })
}

/// Filter: replies addressed to this participant only.
fn replies_for(participant_id: &str) -> SampleFilter {
    let me = participant_id.to_string();
    Arc::new(move |sample: &Sample| {
        sample
            .data
            .get("to_participant")
            .and_then(|v| v.as_str())
            .map(|target| target == me)
            .unwrap_or(false)
    })
}

struct RpcClientInner {
    transport: Arc<dyn Transport>,
    participant_id: String,
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyEnvelope>>>,
    listeners: tokio::sync::Mutex<HashSet<String>>,
    listener_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Caller half of the RPC plane, owned by one participant.
///
/// One reply listener task runs per service class the client has called;
/// correlation slots are a single O(1) map shared across classes.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcClientInner>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, participant_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RpcClientInner {
                transport,
                participant_id: participant_id.into(),
                pending: Mutex::new(HashMap::new()),
                listeners: tokio::sync::Mutex::new(HashSet::new()),
                listener_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.inner.participant_id
    }

    /// Issue one call and await the reply within `deadline`.
    ///
    /// A zero deadline returns `Timeout` immediately without publishing.
    pub async fn call(
        &self,
        service_class: &str,
        to_participant: Option<&str>,
        operation: &str,
        arguments: &serde_json::Value,
        deadline: Duration,
        conversation_id: Option<&str>,
    ) -> Result<ReplyEnvelope, GenesisError> {
        if deadline.as_nanos() == 0 {
            return Err(GenesisError::Timeout(
                "deadline was zero; request not issued".to_string(),
            ));
        }
        self.ensure_reply_listener(service_class).await?;

        let request = RequestEnvelope {
            correlation_id: Uuid::new_v4().to_string(),
            from: self.inner.participant_id.clone(),
            to_participant: to_participant.unwrap_or("").to_string(),
            operation: operation.to_string(),
            arguments: arguments.to_string(),
            deadline_unix_ns: now_unix_nanos() + deadline.as_nanos() as i64,
            conversation_id: conversation_id.unwrap_or("").to_string(),
        };
        request.validate()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.insert(request.correlation_id.clone(), tx);
        }

        let data = serde_json::to_value(&request)
            .map_err(|e| GenesisError::SchemaViolation(e.to_string()))?;
        let published = self
            .inner
            .transport
            .publish(
                &rpc_request_topic(service_class),
                &rpc_qos(),
                Sample::unkeyed(data),
            )
            .await;
        if let Err(e) = published {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.remove(&request.correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // Slot dropped without a reply: client is shutting down.
                Err(GenesisError::ToolCallFailed(
                    "reply channel closed".to_string(),
                ))
            }
            Err(_) => {
                // Release the correlation slot so any late reply is
                // discarded, then surface the timeout.
                let mut pending = self.inner.pending.lock().unwrap();
                pending.remove(&request.correlation_id);
                Err(GenesisError::Timeout(format!(
                    "no reply from '{}' operation '{}' within {:?}",
                    service_class, operation, deadline
                )))
            }
        }
    }

    /// Call with the given retry budget. Every attempt is a fresh
    /// correlation id. Only use for operations declared idempotent.
    pub async fn call_with_retry(
        &self,
        service_class: &str,
        to_participant: Option<&str>,
        operation: &str,
        arguments: &serde_json::Value,
        deadline: Duration,
        conversation_id: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<ReplyEnvelope, GenesisError> {
        let mut last_err = GenesisError::ToolCallFailed("no attempts made".to_string());
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }
            match self
                .call(
                    service_class,
                    to_participant,
                    operation,
                    arguments,
                    deadline,
                    conversation_id,
                )
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    log::debug!(
                        "rpc attempt {}/{} to '{}' failed: {}",
                        attempt + 1,
                        policy.max_attempts,
                        service_class,
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn ensure_reply_listener(&self, service_class: &str) -> Result<(), GenesisError> {
        let mut listeners = self.inner.listeners.lock().await;
        if listeners.contains(service_class) {
            return Ok(());
        }
        let mut subscription = self
            .inner
            .transport
            .subscribe(
                &rpc_reply_topic(service_class),
                &rpc_qos(),
                Some(replies_for(&self.inner.participant_id)),
            )
            .await?;
        listeners.insert(service_class.to_string());
        drop(listeners);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(sample) = subscription.recv().await {
                let reply: ReplyEnvelope = match serde_json::from_value(sample.data) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("dropping malformed reply: {}", e);
                        continue;
                    }
                };
                let slot = {
                    let mut pending = inner.pending.lock().unwrap();
                    pending.remove(&reply.correlation_id)
                };
                match slot {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        log::debug!(
                            "discarding late reply for correlation '{}'",
                            reply.correlation_id
                        );
                    }
                }
            }
        });
        self.inner.listener_tasks.lock().unwrap().push(task);
        Ok(())
    }
}

impl Drop for RpcClientInner {
    fn drop(&mut self) {
        for task in self.listener_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Service-side request handler for one service class.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one request, returning the JSON result or an error to embed in
    /// the reply. Work past the caller's deadline is advisory-cancellable:
    /// use [`RequestEnvelope::remaining`] to bail out early.
    async fn handle(&self, request: RequestEnvelope) -> Result<serde_json::Value, GenesisError>;
}

/// Running serve loop; aborts the loop task when stopped or dropped.
pub struct ServeHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ServeHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve `service_class` with `handler` on behalf of `participant_id`.
///
/// Each inbound request runs on its own task so a slow handler never blocks
/// the class.
pub async fn serve(
    transport: Arc<dyn Transport>,
    participant_id: &str,
    service_class: &str,
    handler: Arc<dyn RpcHandler>,
) -> Result<ServeHandle, GenesisError> {
    let mut subscription = transport
        .subscribe(
            &rpc_request_topic(service_class),
            &rpc_qos(),
            Some(addressed_to(participant_id)),
        )
        .await?;
    let reply_topic = rpc_reply_topic(service_class);
    let me = participant_id.to_string();

    let task = tokio::spawn(async move {
        while let Some(sample) = subscription.recv().await {
            let request: RequestEnvelope = match serde_json::from_value(sample.data) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("dropping malformed request: {}", e);
                    continue;
                }
            };
            let transport = transport.clone();
            let handler = handler.clone();
            let reply_topic = reply_topic.clone();
            let me = me.clone();
            tokio::spawn(async move {
                let reply = match handler.handle(request.clone()).await {
                    Ok(result) => ReplyEnvelope::ok(&request, &me, &result),
                    Err(e) => ReplyEnvelope::fail(&request, &me, &e),
                };
                let data = match serde_json::to_value(&reply) {
                    Ok(data) => data,
                    Err(e) => {
                        log::error!("could not encode reply: {}", e);
                        return;
                    }
                };
                if let Err(e) = transport
                    .publish(&reply_topic, &rpc_qos(), Sample::unkeyed(data))
                    .await
                {
                    log::error!("could not publish reply: {}", e);
                }
            });
        }
    });

    Ok(ServeHandle { task })
}

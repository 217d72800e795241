//! Function-providing services.
//!
//! A [`FunctionService`] is a SERVICE participant hosting named functions.
//! On start it advertises one FUNCTION record per registered function plus a
//! REGISTRATION record for its own presence, then serves the RPC class named
//! after itself. Arguments are validated against the function's JSON-Schema
//! before the handler runs; a violation is refused at the boundary and never
//! reaches handler code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::genesis::advertisement::{
    Advertisement, AdvertisementKind, FunctionPayload, ServicePayload,
};
use crate::genesis::error::GenesisError;
use crate::genesis::participant::Participant;
use crate::genesis::rpc::{serve, RequestEnvelope, RpcHandler, ServeHandle};

/// Async handler for one function.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(
        &self,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GenesisError>;
}

struct ClosureHandler<F> {
    f: F,
}

#[async_trait]
impl<F> FunctionHandler for ClosureHandler<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, GenesisError> + Send + Sync,
{
    async fn call(
        &self,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GenesisError> {
        (self.f)(arguments)
    }
}

/// Wrap a synchronous closure as a [`FunctionHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn FunctionHandler>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, GenesisError> + Send + Sync + 'static,
{
    Arc::new(ClosureHandler { f })
}

/// One hosted function: identity, schema, tags, and the handler.
#[derive(Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameter_schema: serde_json::Value,
    pub capabilities: Vec<String>,
    pub classification_tags: Vec<String>,
    handler: Arc<dyn FunctionHandler>,
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn FunctionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: serde_json::json!({"type": "object"}),
            capabilities: Vec::new(),
            classification_tags: Vec::new(),
            handler,
        }
    }

    /// JSON-Schema object the arguments must satisfy.
    pub fn with_parameter_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameter_schema = schema;
        self
    }

    /// Add a capability tag. `idempotent` opts the function into automatic
    /// retries by callers.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_classification_tag(mut self, tag: impl Into<String>) -> Self {
        self.classification_tags.push(tag.into());
        self
    }
}

/// Structural JSON-Schema check: object shape, required properties, and
/// primitive property types. Refuses with [`GenesisError::SchemaViolation`].
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), GenesisError> {
    if schema.get("type").and_then(|v| v.as_str()) == Some("object") && !arguments.is_object() {
        return Err(GenesisError::SchemaViolation(
            "arguments must be a JSON object".to_string(),
        ));
    }
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required {
            if let Some(name) = name.as_str() {
                if arguments.get(name).is_none() {
                    return Err(GenesisError::SchemaViolation(format!(
                        "missing required argument '{}'",
                        name
                    )));
                }
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (name, spec) in properties {
            let value = match arguments.get(name) {
                Some(value) => value,
                None => continue,
            };
            let expected = match spec.get("type").and_then(|v| v.as_str()) {
                Some(expected) => expected,
                None => continue,
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(GenesisError::SchemaViolation(format!(
                    "argument '{}' must be of type {}",
                    name, expected
                )));
            }
        }
    }
    Ok(())
}

struct ServiceRpcHandler {
    participant: Participant,
    functions: Arc<HashMap<String, FunctionSpec>>,
}

#[async_trait]
impl RpcHandler for ServiceRpcHandler {
    async fn handle(&self, request: RequestEnvelope) -> Result<serde_json::Value, GenesisError> {
        self.participant.begin_request().await;
        let outcome = self.dispatch(&request).await;
        self.participant.end_request().await;
        // The service reports its own completion on the event stream. A
        // caller that already gave up on its deadline will see this event as
        // uncorrelated activity.
        let (event_type, severity) = match &outcome {
            Ok(_) => ("REQUEST_COMPLETED", "INFO"),
            Err(_) => ("REQUEST_FAILED", "WARN"),
        };
        let _ = self
            .participant
            .monitoring()
            .general(
                event_type,
                severity,
                &format!("operation '{}' finished", request.operation),
                serde_json::json!({ "operation": request.operation.clone() }),
            )
            .await;
        outcome
    }
}

impl ServiceRpcHandler {
    async fn dispatch(&self, request: &RequestEnvelope) -> Result<serde_json::Value, GenesisError> {
        let spec = self.functions.get(&request.operation).ok_or_else(|| {
            GenesisError::NotRouted(format!(
                "no function '{}' on this service",
                request.operation
            ))
        })?;
        let arguments = request.arguments_json()?;
        validate_arguments(&spec.parameter_schema, &arguments).map_err(|e| {
            log::warn!("refused '{}' call: {}", spec.name, e);
            e
        })?;
        spec.handler.call(arguments).await
    }
}

/// A SERVICE participant hosting named functions behind one RPC class.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis::participant::{Participant, ParticipantKind};
/// use genesis::service::{handler_fn, FunctionService, FunctionSpec};
/// use genesis::transport::{InProcessTransport, Transport};
/// use serde_json::json;
///
/// # async {
/// let transport: Arc<dyn Transport> = InProcessTransport::new(0);
/// let participant = Participant::new(ParticipantKind::Service, "Calculator", transport);
/// let mut service = FunctionService::new(participant, "Calculator");
/// service.register(
///     FunctionSpec::new(
///         "add",
///         "Adds two numbers.",
///         handler_fn(|args| {
///             let x = args["x"].as_f64().unwrap_or(0.0);
///             let y = args["y"].as_f64().unwrap_or(0.0);
///             Ok(json!(x + y))
///         }),
///     )
///     .with_parameter_schema(json!({
///         "type": "object",
///         "properties": {
///             "x": {"type": "number"},
///             "y": {"type": "number"}
///         },
///         "required": ["x", "y"]
///     }))
///     .with_capability("idempotent"),
/// );
/// service.start().await.unwrap();
/// # };
/// ```
pub struct FunctionService {
    participant: Participant,
    service_name: String,
    functions: HashMap<String, FunctionSpec>,
    serve_handle: Option<ServeHandle>,
}

impl FunctionService {
    /// Wrap a (not yet started) participant as a service named
    /// `service_name`; the name is also the RPC class functions are invoked
    /// on.
    pub fn new(participant: Participant, service_name: impl Into<String>) -> Self {
        Self {
            participant,
            service_name: service_name.into(),
            functions: HashMap::new(),
            serve_handle: None,
        }
    }

    /// Register one function. Must be called before [`FunctionService::start`].
    pub fn register(&mut self, spec: FunctionSpec) {
        self.functions.insert(spec.name.clone(), spec);
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Join the plane, advertise presence and every function, and begin
    /// serving the RPC class.
    pub async fn start(&mut self) -> Result<(), GenesisError> {
        self.participant.start().await?;

        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        let mut capabilities: Vec<String> = Vec::new();
        for spec in self.functions.values() {
            for capability in &spec.capabilities {
                if !capabilities.contains(capability) {
                    capabilities.push(capability.clone());
                }
            }
        }
        let registration =
            Advertisement::new(AdvertisementKind::Registration, self.service_name.as_str(), "")
                .with_description(format!("service hosting {} functions", names.len()))
                .with_service_name(self.service_name.as_str())
                .with_payload(&ServicePayload {
                    functions: names,
                    capabilities,
                });
        self.participant.advertise(registration).await?;

        for spec in self.functions.values() {
            let ad = Advertisement::new(AdvertisementKind::Function, spec.name.as_str(), "")
                .with_description(spec.description.as_str())
                .with_service_name(self.service_name.as_str())
                .with_payload(&FunctionPayload {
                    parameter_schema: spec.parameter_schema.clone(),
                    capabilities: spec.capabilities.clone(),
                    classification_tags: spec.classification_tags.clone(),
                    service_name: self.service_name.clone(),
                });
            self.participant.advertise(ad).await?;
        }

        let handler = Arc::new(ServiceRpcHandler {
            participant: self.participant.clone(),
            functions: Arc::new(self.functions.clone()),
        });
        let handle = serve(
            self.participant.transport().clone(),
            self.participant.id(),
            &self.service_name,
            handler,
        )
        .await?;
        self.serve_handle = Some(handle);
        Ok(())
    }

    /// Stop serving and leave the plane cleanly.
    pub async fn stop(&mut self) -> Result<(), GenesisError> {
        if let Some(handle) = self.serve_handle.take() {
            handle.stop();
        }
        self.participant.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_arguments_are_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {
                "x": {"type": "number"},
                "y": {"type": "number"}
            },
            "required": ["x", "y"]
        });
        assert!(validate_arguments(&schema, &json!({"x": 1, "y": 2})).is_ok());
        let err = validate_arguments(&schema, &json!({"x": 1})).unwrap_err();
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn property_types_are_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {"x": {"type": "number"}}
        });
        assert!(validate_arguments(&schema, &json!({"x": "two"})).is_err());
        assert!(validate_arguments(&schema, &json!({})).is_ok());
    }
}

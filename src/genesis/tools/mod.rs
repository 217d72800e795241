//! Internal tools: capabilities a process declares for itself.
//!
//! Internal tools sit alongside external FUNCTION and AGENT advertisements
//! in the orchestrator's unified toolset, but they never touch the wire:
//! the dispatcher invokes them in-process. An external function advertising
//! the same name shadows an internal tool, so a locally bundled capability
//! can be upgraded to a shared service without changing prompts.

mod calculator;

pub use calculator::Calculator;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::genesis::error::GenesisError;

/// A capability invoked in-process.
#[async_trait]
pub trait InternalTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema object describing the accepted arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Tags used by the classifier when windowing the toolset.
    fn classification_tags(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GenesisError>;
}

/// The internal tools one process declares.
#[derive(Default, Clone)]
pub struct InternalToolSet {
    tools: HashMap<String, Arc<dyn InternalTool>>,
}

impl InternalToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn InternalTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InternalTool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn InternalTool>> {
        self.tools.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

//! Built-in calculator tool.
//!
//! Evaluates arithmetic expressions with `evalexpr`. Deterministic and free
//! of side effects, so results are safely retryable and byte-stable for the
//! same input.

use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;
use serde_json::json;

use crate::genesis::error::GenesisError;
use crate::genesis::tools::InternalTool;

/// Expression calculator exposed as an internal tool.
#[derive(Default)]
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one expression to a JSON value.
    pub fn evaluate(expression: &str) -> Result<serde_json::Value, GenesisError> {
        let mut context: evalexpr::HashMapContext<evalexpr::DefaultNumericTypes> =
            evalexpr::HashMapContext::new();
        let _ = context.set_value(
            "pi".to_string(),
            evalexpr::Value::Float(std::f64::consts::PI),
        );
        let _ = context.set_value(
            "e".to_string(),
            evalexpr::Value::Float(std::f64::consts::E),
        );

        match evalexpr::eval_with_context(expression, &context) {
            Ok(evalexpr::Value::Int(n)) => Ok(json!(n)),
            Ok(evalexpr::Value::Float(x)) => Ok(json!(x)),
            Ok(evalexpr::Value::Boolean(b)) => Ok(json!(b)),
            Ok(evalexpr::Value::String(s)) => Ok(json!(s)),
            Ok(other) => Ok(json!(format!("{}", other))),
            Err(e) => Err(GenesisError::ToolCallFailed(format!(
                "could not evaluate '{}': {}",
                expression, e
            ))),
        }
    }
}

#[async_trait]
impl InternalTool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates a mathematical expression and returns the numeric result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. \"2 + 3 * 4\"."
                }
            },
            "required": ["expression"]
        })
    }

    fn classification_tags(&self) -> Vec<String> {
        vec!["math".to_string(), "calculation".to_string()]
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GenesisError> {
        let expression = arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GenesisError::SchemaViolation("'expression' must be a string".to_string())
            })?;
        let value = Self::evaluate(expression)?;
        Ok(json!({ "result": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evaluates_arithmetic() {
        let calc = Calculator::new();
        let out = calc.invoke(json!({"expression": "2 + 3"})).await.unwrap();
        assert_eq!(out["result"], json!(5));
    }

    #[test]
    fn rejects_missing_expression() {
        let err = Calculator::evaluate("2 +").unwrap_err();
        assert_eq!(err.kind(), "ToolCallFailed");
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let a = Calculator::evaluate("7 * 6").unwrap();
        let b = Calculator::evaluate("7 * 6").unwrap();
        assert_eq!(a, b);
    }
}

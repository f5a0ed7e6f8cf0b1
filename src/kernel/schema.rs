//! Schema validator — declarative contract enforcement on tool I/O.
//!
//! Compiles every registered contract's input and output JSON Schemas once
//! at kernel assembly, then validates each call's input before dispatch and
//! each result before post-conditions run. The first violation is surfaced
//! with its JSON pointer path.

use std::collections::HashMap;

use jsonschema::Validator;
use thiserror::Error;

use crate::kernel::registry::ToolRegistry;
use crate::types::ToolCall;

/// Schema compilation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A contract carries a schema that does not compile.
    #[error("tool '{tool}' has invalid {which} schema: {reason}")]
    InvalidSchema {
        tool: String,
        which: &'static str,
        reason: String,
    },
}

/// Validation failures surfaced to the pipeline.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// No contract registered under this ID.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Call input violates the contract's input schema.
    #[error("input schema violation at '{path}': {reason}")]
    InputSchemaViolation { path: String, reason: String },
    /// Tool output violates the contract's output schema.
    #[error("output schema violation at '{path}': {reason}")]
    OutputSchemaViolation { path: String, reason: String },
}

struct CompiledContract {
    input: Validator,
    output: Validator,
}

/// Validates tool calls and results against registered contracts.
pub struct SchemaValidator {
    compiled: HashMap<String, CompiledContract>,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("contract_count", &self.compiled.len())
            .finish()
    }
}

impl SchemaValidator {
    /// Compile every contract in the registry.
    pub fn new(registry: &ToolRegistry) -> Result<Self, SchemaError> {
        let mut compiled = HashMap::new();
        for contract in registry.list() {
            let input = jsonschema::validator_for(&contract.input_schema).map_err(|e| {
                SchemaError::InvalidSchema {
                    tool: contract.id.clone(),
                    which: "input",
                    reason: e.to_string(),
                }
            })?;
            let output = jsonschema::validator_for(&contract.output_schema).map_err(|e| {
                SchemaError::InvalidSchema {
                    tool: contract.id.clone(),
                    which: "output",
                    reason: e.to_string(),
                }
            })?;
            compiled.insert(contract.id.clone(), CompiledContract { input, output });
        }
        Ok(Self { compiled })
    }

    /// Validate a call's input against its contract.
    pub fn validate_input(&self, call: &ToolCall) -> Result<(), ValidationError> {
        let contract = self
            .compiled
            .get(&call.tool_id)
            .ok_or_else(|| ValidationError::UnknownTool(call.tool_id.clone()))?;

        match contract.input.validate(&call.input) {
            Ok(()) => Ok(()),
            Err(e) => Err(ValidationError::InputSchemaViolation {
                path: e.instance_path().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Validate a tool's output against its contract.
    pub fn validate_output(
        &self,
        tool_id: &str,
        output: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        let contract = self
            .compiled
            .get(tool_id)
            .ok_or_else(|| ValidationError::UnknownTool(tool_id.to_owned()))?;

        match contract.output.validate(output) {
            Ok(()) => Ok(()),
            Err(e) => Err(ValidationError::OutputSchemaViolation {
                path: e.instance_path().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::postcond::PostConditionVerifier;
    use crate::kernel::registry::{ToolError, ToolHandler};
    use crate::types::{ApprovalPolicy, CallSource, ToolContract};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn invoke(&self, _call: &ToolCall) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn echo_contract() -> ToolContract {
        ToolContract {
            id: "echo".to_owned(),
            version: 1,
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"],
                "additionalProperties": false
            }),
            output_schema: serde_json::json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"]
            }),
            read_only: true,
            approval_policy: ApprovalPolicy::AutoIfReadOnly,
            post_conditions: vec![],
            compensation_id: None,
            timeout_ms: 1_000,
        }
    }

    fn validator_with_echo() -> SchemaValidator {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        registry
            .register(echo_contract(), Arc::new(NoopHandler), &verifier)
            .expect("register");
        SchemaValidator::new(&registry).expect("schemas compile")
    }

    fn call_with_input(input: serde_json::Value) -> ToolCall {
        ToolCall {
            call_id: Uuid::new_v4(),
            tool_id: "echo".to_owned(),
            input,
            source: CallSource::Planner,
            episode_id: Uuid::new_v4(),
            step_index: 0,
            created_at: Utc::now(),
        }
    }

    // ── Input validation ──

    #[test]
    fn test_valid_input_passes() {
        let validator = validator_with_echo();
        let call = call_with_input(serde_json::json!({"msg": "hi"}));
        validator.validate_input(&call).expect("valid input");
    }

    #[test]
    fn test_missing_required_field_fails() {
        let validator = validator_with_echo();
        let call = call_with_input(serde_json::json!({}));
        let err = validator
            .validate_input(&call)
            .expect_err("missing field must fail");
        assert!(matches!(
            err,
            ValidationError::InputSchemaViolation { .. }
        ));
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let validator = validator_with_echo();
        let call = call_with_input(serde_json::json!({"msg": 42}));
        let err = validator
            .validate_input(&call)
            .expect_err("wrong type must fail");
        match err {
            ValidationError::InputSchemaViolation { path, .. } => {
                assert_eq!(path, "/msg");
            }
            other => panic!("expected InputSchemaViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tool() {
        let validator = validator_with_echo();
        let mut call = call_with_input(serde_json::json!({"msg": "hi"}));
        call.tool_id = "missing".to_owned();
        let err = validator
            .validate_input(&call)
            .expect_err("unknown tool must fail");
        assert!(matches!(err, ValidationError::UnknownTool(ref t) if t == "missing"));
    }

    // ── Output validation ──

    #[test]
    fn test_valid_output_passes() {
        let validator = validator_with_echo();
        validator
            .validate_output("echo", &serde_json::json!({"msg": "hi"}))
            .expect("valid output");
    }

    #[test]
    fn test_invalid_output_fails() {
        let validator = validator_with_echo();
        let err = validator
            .validate_output("echo", &serde_json::json!({"other": 1}))
            .expect_err("invalid output must fail");
        assert!(matches!(
            err,
            ValidationError::OutputSchemaViolation { .. }
        ));
    }

    // ── Compilation ──

    #[test]
    fn test_bad_schema_fails_at_build() {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        let mut contract = echo_contract();
        contract.input_schema = serde_json::json!({"type": "not-a-type"});
        registry
            .register(contract, Arc::new(NoopHandler), &verifier)
            .expect("registration itself succeeds");

        let err = SchemaValidator::new(&registry).expect_err("bad schema must fail to compile");
        assert!(matches!(
            err,
            SchemaError::InvalidSchema { which: "input", .. }
        ));
    }
}

//! Tool registry — contracts and handlers for every callable tool.
//!
//! Tools are tagged variants resolved by `tool_id`, never by subtyping a
//! base class: the contract is declarative data and the handler is a boxed
//! [`ToolHandler`]. The registry is populated during kernel assembly and
//! immutable afterwards, so reads are lock-free behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::kernel::postcond::PostConditionVerifier;
use crate::types::{ToolCall, ToolContract};

/// Tool invocation failure reported by a handler.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool ran and failed.
    #[error("tool execution failed: {0}")]
    Failed(String),
    /// The tool refused the input.
    #[error("unsupported input: {0}")]
    Unsupported(String),
}

/// Registration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A contract with this ID is already registered.
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),
    /// A contract names a post-condition the verifier does not know.
    #[error("tool '{tool}' names unknown post-condition '{check}'")]
    UnknownPostCondition { tool: String, check: String },
}

/// Executable side of a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Invoke the tool. Input has already passed the contract's input
    /// schema; output is schema-validated after return.
    async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError>;
}

/// A contract paired with its handler.
pub struct RegisteredTool {
    pub contract: ToolContract,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("contract", &self.contract)
            .field("handler", &"<dyn ToolHandler>")
            .finish()
    }
}

/// Registry of tool contracts, keyed by tool ID.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract and its handler.
    ///
    /// Fails if the ID is taken or a named post-condition does not resolve
    /// in the verifier.
    pub fn register(
        &mut self,
        contract: ToolContract,
        handler: Arc<dyn ToolHandler>,
        verifier: &PostConditionVerifier,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&contract.id) {
            return Err(RegistryError::DuplicateTool(contract.id));
        }
        for check in &contract.post_conditions {
            if !verifier.contains(check) {
                return Err(RegistryError::UnknownPostCondition {
                    tool: contract.id,
                    check: check.clone(),
                });
            }
        }

        info!(
            tool = %contract.id,
            read_only = contract.read_only,
            policy = ?contract.approval_policy,
            "tool registered"
        );
        self.tools
            .insert(contract.id.clone(), RegisteredTool { contract, handler });
        Ok(())
    }

    /// Look up a registered tool.
    pub fn get(&self, id: &str) -> Option<&RegisteredTool> {
        self.tools.get(id)
    }

    /// Look up a contract.
    pub fn contract(&self, id: &str) -> Option<&ToolContract> {
        self.tools.get(id).map(|t| &t.contract)
    }

    /// All contracts, sorted by ID for stable listings.
    pub fn list(&self) -> Vec<&ToolContract> {
        let mut contracts: Vec<&ToolContract> = self.tools.values().map(|t| &t.contract).collect();
        contracts.sort_by(|a, b| a.id.cmp(&b.id));
        contracts
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::postcond::CheckOutcome;
    use crate::types::ApprovalPolicy;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn invoke(&self, _call: &ToolCall) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"status": "ok"}))
        }
    }

    fn contract(id: &str, post_conditions: Vec<String>) -> ToolContract {
        ToolContract {
            id: id.to_owned(),
            version: 1,
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
            read_only: true,
            approval_policy: ApprovalPolicy::AutoIfReadOnly,
            post_conditions,
            compensation_id: None,
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_register_and_get() {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        registry
            .register(contract("echo", vec![]), Arc::new(NoopHandler), &verifier)
            .expect("register");

        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.contract("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        registry
            .register(contract("echo", vec![]), Arc::new(NoopHandler), &verifier)
            .expect("first registration");

        let err = registry
            .register(contract("echo", vec![]), Arc::new(NoopHandler), &verifier)
            .expect_err("duplicate must fail");
        assert!(matches!(err, RegistryError::DuplicateTool(ref id) if id == "echo"));
    }

    #[test]
    fn test_unknown_post_condition_rejected() {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        let err = registry
            .register(
                contract("send_tx", vec!["tx.confirmed".to_owned()]),
                Arc::new(NoopHandler),
                &verifier,
            )
            .expect_err("unknown check must fail");
        assert!(matches!(
            err,
            RegistryError::UnknownPostCondition { ref check, .. } if check == "tx.confirmed"
        ));
    }

    #[test]
    fn test_known_post_condition_accepted() {
        let mut verifier = PostConditionVerifier::new(1_000);
        verifier
            .register_fn("tx.confirmed", |_, _| CheckOutcome::pass())
            .expect("register check");
        let mut registry = ToolRegistry::new();
        registry
            .register(
                contract("send_tx", vec!["tx.confirmed".to_owned()]),
                Arc::new(NoopHandler),
                &verifier,
            )
            .expect("contract with known check should register");
    }

    #[test]
    fn test_list_sorted_by_id() {
        let verifier = PostConditionVerifier::new(1_000);
        let mut registry = ToolRegistry::new();
        registry
            .register(contract("zeta", vec![]), Arc::new(NoopHandler), &verifier)
            .expect("register");
        registry
            .register(contract("alpha", vec![]), Arc::new(NoopHandler), &verifier)
            .expect("register");

        let ids: Vec<&str> = registry.list().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}

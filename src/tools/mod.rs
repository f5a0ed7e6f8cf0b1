//! Built-in tools registered at kernel startup.
//!
//! Each builtin is a (contract, handler) pair; the kernel builder registers
//! them before user-supplied tools. They are deliberately small: `echo` for
//! liveness checks, `restart_agent` as the canonical always-approved write,
//! `plugin.toggle` with a real compensation, and `memory.write` as the
//! gated path into agent memory.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::kernel::memory::MemoryGate;
use crate::kernel::registry::{ToolError, ToolHandler};
use crate::types::{
    ApprovalPolicy, CallSource, MemoryCandidate, Provenance, ToolCall, ToolContract,
};

/// Compensation ID for `plugin.toggle`.
pub const PLUGIN_TOGGLE_REVERT: &str = "plugin.toggle.revert";

// ── echo ────────────────────────────────────────────────────────

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        let msg = call
            .input
            .get("msg")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Unsupported("missing msg".to_owned()))?;
        Ok(serde_json::json!({"msg": msg}))
    }
}

/// Read-only liveness tool.
pub fn echo() -> (ToolContract, Arc<dyn ToolHandler>) {
    let contract = ToolContract {
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
    };
    (contract, Arc::new(EchoTool))
}

// ── restart_agent ───────────────────────────────────────────────

struct RestartAgentTool;

#[async_trait]
impl ToolHandler for RestartAgentTool {
    async fn invoke(&self, _call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        // The launcher owns the actual process restart; the tool records the
        // acknowledged request.
        Ok(serde_json::json!({"restarted": true}))
    }
}

/// Always-approved restart request.
pub fn restart_agent() -> (ToolContract, Arc<dyn ToolHandler>) {
    let contract = ToolContract {
        id: "restart_agent".to_owned(),
        version: 1,
        input_schema: serde_json::json!({
            "type": "object",
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "properties": {"restarted": {"type": "boolean"}},
            "required": ["restarted"]
        }),
        read_only: false,
        approval_policy: ApprovalPolicy::Always,
        post_conditions: vec![],
        compensation_id: None,
        timeout_ms: 5_000,
    };
    (contract, Arc::new(RestartAgentTool))
}

// ── plugin.toggle ───────────────────────────────────────────────

/// Shared enabled-plugin set, visible to the toggle handler and its
/// compensation.
#[derive(Clone, Default)]
pub struct PluginState(Arc<Mutex<HashSet<String>>>);

impl PluginState {
    /// Fresh state with nothing enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a plugin is currently enabled.
    pub fn is_enabled(&self, plugin: &str) -> bool {
        self.lock().contains(plugin)
    }

    fn set(&self, plugin: &str, enabled: bool) {
        let mut plugins = self.lock();
        if enabled {
            plugins.insert(plugin.to_owned());
        } else {
            plugins.remove(plugin);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct PluginToggleTool {
    state: PluginState,
}

#[async_trait]
impl ToolHandler for PluginToggleTool {
    async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        let plugin = call
            .input
            .get("plugin")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Unsupported("missing plugin".to_owned()))?;
        let enabled = call
            .input
            .get("enabled")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| ToolError::Unsupported("missing enabled".to_owned()))?;

        self.state.set(plugin, enabled);
        Ok(serde_json::json!({"plugin": plugin, "enabled": enabled}))
    }
}

/// Plugin enable/disable with a revert compensation over shared state.
///
/// Returns the contract/handler pair plus the state handle; pass the state
/// to [`plugin_toggle_revert`] when registering the compensation.
pub fn plugin_toggle(state: PluginState) -> (ToolContract, Arc<dyn ToolHandler>) {
    let contract = ToolContract {
        id: "plugin.toggle".to_owned(),
        version: 1,
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "plugin": {"type": "string"},
                "enabled": {"type": "boolean"}
            },
            "required": ["plugin", "enabled"],
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "plugin": {"type": "string"},
                "enabled": {"type": "boolean"}
            },
            "required": ["plugin", "enabled"]
        }),
        read_only: false,
        approval_policy: ApprovalPolicy::Always,
        post_conditions: vec![],
        compensation_id: Some(PLUGIN_TOGGLE_REVERT.to_owned()),
        timeout_ms: 5_000,
    };
    (contract, Arc::new(PluginToggleTool { state }))
}

/// Compensation closure for `plugin.toggle`: flip the plugin back.
pub fn plugin_toggle_revert(
    state: PluginState,
) -> impl Fn(&ToolCall, &crate::types::ToolCallResult) -> Result<(), ToolError> + Send + Sync {
    move |call, _result| {
        let plugin = call
            .input
            .get("plugin")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Unsupported("missing plugin".to_owned()))?;
        let was_enabled = call
            .input
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        state.set(plugin, !was_enabled);
        Ok(())
    }
}

// ── memory.write ────────────────────────────────────────────────

struct MemoryWriteTool {
    gate: Arc<MemoryGate>,
}

#[async_trait]
impl ToolHandler for MemoryWriteTool {
    async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        let kind = call
            .input
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("fact");
        let content = call
            .input
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Unsupported("missing content".to_owned()))?;

        let provenance = match &call.source {
            CallSource::User => Provenance::UserTyped,
            CallSource::Subsystem(_) => Provenance::KnownPlugin,
            CallSource::Planner => Provenance::ModelInferred,
        };

        let outcome = self.gate.admit(MemoryCandidate {
            kind: kind.to_owned(),
            content: content.to_owned(),
            embedding: None,
            source: call.source.to_string(),
            provenance,
            corroboration: 0,
            observed_at: Utc::now(),
        });

        Ok(serde_json::json!({
            "state": outcome.state.to_string(),
            "id": outcome.id,
            "reason": outcome.reason,
        }))
    }
}

/// The gated write path into agent memory.
pub fn memory_write(gate: Arc<MemoryGate>) -> (ToolContract, Arc<dyn ToolHandler>) {
    let contract = ToolContract {
        id: "memory.write".to_owned(),
        version: 1,
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["content"],
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "properties": {"state": {"type": "string"}},
            "required": ["state"]
        }),
        read_only: false,
        approval_policy: ApprovalPolicy::SourceTrusted,
        post_conditions: vec![],
        compensation_id: None,
        timeout_ms: 5_000,
    };
    (contract, Arc::new(MemoryWriteTool { gate }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventStoreSection, TrustSection};
    use crate::kernel::event_store::EventStore;
    use crate::kernel::trust::TrustScorer;
    use crate::types::{MemoryState, TrustTier};
    use uuid::Uuid;

    fn call(tool_id: &str, input: serde_json::Value, source: CallSource) -> ToolCall {
        ToolCall {
            call_id: Uuid::new_v4(),
            tool_id: tool_id.to_owned(),
            input,
            source,
            episode_id: Uuid::new_v4(),
            step_index: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrips_message() {
        let (_, handler) = echo();
        let output = handler
            .invoke(&call(
                "echo",
                serde_json::json!({"msg": "hi"}),
                CallSource::Planner,
            ))
            .await
            .expect("echo succeeds");
        assert_eq!(output["msg"], "hi");
    }

    #[tokio::test]
    async fn test_plugin_toggle_and_revert() {
        let state = PluginState::new();
        let (_, handler) = plugin_toggle(state.clone());

        let the_call = call(
            "plugin.toggle",
            serde_json::json!({"plugin": "weather", "enabled": true}),
            CallSource::User,
        );
        handler.invoke(&the_call).await.expect("toggle succeeds");
        assert!(state.is_enabled("weather"));

        let revert = plugin_toggle_revert(state.clone());
        let result = crate::types::ToolCallResult {
            call_id: the_call.call_id,
            ok: true,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            compensated: false,
        };
        revert(&the_call, &result).expect("revert succeeds");
        assert!(!state.is_enabled("weather"));
    }

    #[tokio::test]
    async fn test_memory_write_provenance_follows_source() {
        let events = Arc::new(EventStore::new(EventStoreSection::default()));
        let gate = Arc::new(MemoryGate::new(
            TrustScorer::new(&TrustSection::default()),
            TrustTier::Medium,
            events,
        ));
        let (_, handler) = memory_write(gate.clone());

        // User-typed content commits.
        let output = handler
            .invoke(&call(
                "memory.write",
                serde_json::json!({"content": "the user is vegetarian"}),
                CallSource::User,
            ))
            .await
            .expect("write succeeds");
        assert_eq!(output["state"], MemoryState::Committed.to_string());

        // Planner-originated content scores as model-inferred and is held
        // back in quarantine.
        let output = handler
            .invoke(&call(
                "memory.write",
                serde_json::json!({"content": "the user probably likes jazz"}),
                CallSource::Planner,
            ))
            .await
            .expect("write succeeds");
        assert_eq!(output["state"], MemoryState::Quarantined.to_string());
    }
}

//! Compensation registry — inverse actions for rolling back failed calls.
//!
//! Handlers are registered once at kernel assembly under the compensation ID
//! a contract names, and must be idempotent: the pipeline may run them for a
//! call that never produced side effects (denied before execution). Every
//! run is recorded in the event store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::kernel::event_store::EventStore;
use crate::kernel::registry::ToolError;
use crate::types::{EventKind, ToolCall, ToolCallResult};

/// Registration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum CompensationError {
    /// A handler with this ID is already registered.
    #[error("duplicate compensation: {0}")]
    Duplicate(String),
}

/// The inverse action for a tool.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    /// Undo the call's effect. Must be idempotent.
    async fn run(&self, call: &ToolCall, result: &ToolCallResult) -> Result<(), ToolError>;
}

/// Adapter for synchronous closure compensations.
struct FnCompensation<F>(F);

#[async_trait]
impl<F> CompensationHandler for FnCompensation<F>
where
    F: Fn(&ToolCall, &ToolCallResult) -> Result<(), ToolError> + Send + Sync,
{
    async fn run(&self, call: &ToolCall, result: &ToolCallResult) -> Result<(), ToolError> {
        (self.0)(call, result)
    }
}

/// Wrap a synchronous closure as a compensation handle.
pub fn fn_compensation<F>(f: F) -> Arc<dyn CompensationHandler>
where
    F: Fn(&ToolCall, &ToolCallResult) -> Result<(), ToolError> + Send + Sync + 'static,
{
    Arc::new(FnCompensation(f))
}

/// Result of running one compensation.
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

/// Maps compensation IDs to handlers. Immutable after startup.
pub struct CompensationRegistry {
    handlers: HashMap<String, Arc<dyn CompensationHandler>>,
    events: Arc<EventStore>,
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationRegistry")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

impl CompensationRegistry {
    /// Create an empty registry.
    pub fn new(events: Arc<EventStore>) -> Self {
        Self {
            handlers: HashMap::new(),
            events,
        }
    }

    /// Register a handler under a compensation ID.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn CompensationHandler>,
    ) -> Result<(), CompensationError> {
        let id = id.into();
        if self.handlers.contains_key(&id) {
            return Err(CompensationError::Duplicate(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Register a synchronous closure as a compensation.
    pub fn register_fn<F>(&mut self, id: impl Into<String>, f: F) -> Result<(), CompensationError>
    where
        F: Fn(&ToolCall, &ToolCallResult) -> Result<(), ToolError> + Send + Sync + 'static,
    {
        self.register(id, Arc::new(FnCompensation(f)))
    }

    /// Whether a compensation ID resolves.
    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Look up a handler by ID.
    pub fn get(&self, id: &str) -> Option<Arc<dyn CompensationHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Run the named compensation and record the run.
    ///
    /// An unknown ID returns a failed outcome without recording a run; the
    /// pipeline surfaces that as `NoCompensation` before ever calling here.
    pub async fn run(
        &self,
        id: &str,
        call: &ToolCall,
        result: &ToolCallResult,
    ) -> CompensationOutcome {
        let Some(handler) = self.handlers.get(id) else {
            warn!(compensation = %id, call_id = %call.call_id, "no such compensation");
            return CompensationOutcome {
                ok: false,
                error: Some(format!("no compensation registered: {id}")),
            };
        };

        let outcome = match handler.run(call, result).await {
            Ok(()) => CompensationOutcome {
                ok: true,
                error: None,
            },
            Err(e) => CompensationOutcome {
                ok: false,
                error: Some(e.to_string()),
            },
        };

        info!(
            compensation = %id,
            call_id = %call.call_id,
            ok = outcome.ok,
            "compensation run"
        );
        self.events.append(
            EventKind::CompensationRun,
            Some(call.episode_id),
            serde_json::json!({
                "compensation_id": id,
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "ok": outcome.ok,
                "error": outcome.error,
            }),
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventStoreSection;
    use crate::kernel::event_store::EventQuery;
    use crate::types::CallSource;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn registry() -> (CompensationRegistry, Arc<EventStore>) {
        let events = Arc::new(EventStore::new(EventStoreSection::default()));
        (CompensationRegistry::new(events.clone()), events)
    }

    fn call() -> ToolCall {
        ToolCall {
            call_id: Uuid::new_v4(),
            tool_id: "send_tx".to_owned(),
            input: serde_json::json!({"amount": 5}),
            source: CallSource::Planner,
            episode_id: Uuid::new_v4(),
            step_index: 0,
            created_at: Utc::now(),
        }
    }

    fn result(call: &ToolCall) -> ToolCallResult {
        ToolCallResult {
            call_id: call.call_id,
            ok: true,
            output: Some(serde_json::json!({"tx": "0xabc"})),
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            compensated: false,
        }
    }

    #[tokio::test]
    async fn test_run_records_event() {
        let (mut registry, events) = registry();
        registry
            .register_fn("refund_tx", |_, _| Ok(()))
            .expect("register");

        let c = call();
        let outcome = registry.run("refund_tx", &c, &result(&c)).await;
        assert!(outcome.ok);

        let runs = events.query(&EventQuery {
            kinds: Some(vec![EventKind::CompensationRun]),
            ..EventQuery::default()
        });
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].payload["compensation_id"], "refund_tx");
        assert_eq!(runs[0].payload["ok"], serde_json::Value::Bool(true));
        assert_eq!(runs[0].episode_id, Some(c.episode_id));
    }

    #[tokio::test]
    async fn test_failing_compensation_still_recorded() {
        let (mut registry, events) = registry();
        registry
            .register_fn("refund_tx", |_, _| {
                Err(ToolError::Failed("refund rejected".to_owned()))
            })
            .expect("register");

        let c = call();
        let outcome = registry.run("refund_tx", &c, &result(&c)).await;
        assert!(!outcome.ok);
        assert!(outcome.error.as_deref().unwrap_or("").contains("refund"));

        let runs = events.query(&EventQuery {
            kinds: Some(vec![EventKind::CompensationRun]),
            ..EventQuery::default()
        });
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].payload["ok"], serde_json::Value::Bool(false));
    }

    #[tokio::test]
    async fn test_unknown_compensation_records_nothing() {
        let (registry, events) = registry();
        let c = call();
        let outcome = registry.run("missing", &c, &result(&c)).await;
        assert!(!outcome.ok);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_reruns_each_recorded() {
        let (mut registry, events) = registry();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = counter.clone();
        registry
            .register_fn("refund_tx", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("register");

        let c = call();
        let r = result(&c);
        registry.run("refund_tx", &c, &r).await;
        registry.run("refund_tx", &c, &r).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (mut registry, _events) = registry();
        registry.register_fn("refund_tx", |_, _| Ok(())).expect("ok");
        let err = registry
            .register_fn("refund_tx", |_, _| Ok(()))
            .expect_err("duplicate");
        assert!(matches!(err, CompensationError::Duplicate(_)));
    }
}

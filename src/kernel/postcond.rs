//! Post-condition verifier — semantic checks run after a tool returns.
//!
//! Checks are named and registered once at startup; a tool contract names
//! the subset that must pass for its calls. Each check is bounded by the
//! configured timeout, and a timeout counts as a failure. The aggregated
//! verdict is the conjunction, with the first failing check providing the
//! surfaced reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::types::{ToolCall, ToolCallResult};

/// Outcome of a single check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

impl CheckOutcome {
    /// A passing outcome.
    pub fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    /// A failing outcome with a reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// A named semantic check over a call and its result.
#[async_trait]
pub trait PostCondition: Send + Sync {
    /// Evaluate the check. Must not mutate kernel state.
    async fn check(&self, call: &ToolCall, result: &ToolCallResult) -> CheckOutcome;
}

/// Adapter for synchronous closure checks.
struct FnCheck<F>(F);

#[async_trait]
impl<F> PostCondition for FnCheck<F>
where
    F: Fn(&ToolCall, &ToolCallResult) -> CheckOutcome + Send + Sync,
{
    async fn check(&self, call: &ToolCall, result: &ToolCallResult) -> CheckOutcome {
        (self.0)(call, result)
    }
}

/// Wrap a synchronous closure as a check handle.
pub fn fn_check<F>(f: F) -> Arc<dyn PostCondition>
where
    F: Fn(&ToolCall, &ToolCallResult) -> CheckOutcome + Send + Sync + 'static,
{
    Arc::new(FnCheck(f))
}

/// Verifier registration errors.
#[derive(Debug, Error)]
pub enum VerifierError {
    /// A check with this ID is already registered.
    #[error("post-condition check already registered: {0}")]
    DuplicateCheck(String),
}

/// Aggregated verdict over a contract's named checks.
#[derive(Debug, Clone)]
pub struct PostConditionVerdict {
    pub ok: bool,
    /// First failing check, if any.
    pub failed_check: Option<String>,
    /// Reason surfaced from the first failing check.
    pub reason: Option<String>,
}

impl PostConditionVerdict {
    fn pass() -> Self {
        Self {
            ok: true,
            failed_check: None,
            reason: None,
        }
    }

    fn fail(check_id: &str, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            failed_check: Some(check_id.to_owned()),
            reason: Some(reason.into()),
        }
    }
}

/// Registry of named post-condition checks. Immutable after startup.
pub struct PostConditionVerifier {
    checks: HashMap<String, Arc<dyn PostCondition>>,
    check_timeout: Duration,
}

impl std::fmt::Debug for PostConditionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostConditionVerifier")
            .field("check_count", &self.checks.len())
            .field("check_timeout", &self.check_timeout)
            .finish()
    }
}

impl PostConditionVerifier {
    /// Create a verifier whose individual checks are bounded by
    /// `check_timeout_ms`.
    pub fn new(check_timeout_ms: u64) -> Self {
        Self {
            checks: HashMap::new(),
            check_timeout: Duration::from_millis(check_timeout_ms),
        }
    }

    /// Register a named check.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        check: Arc<dyn PostCondition>,
    ) -> Result<(), VerifierError> {
        let id = id.into();
        if self.checks.contains_key(&id) {
            return Err(VerifierError::DuplicateCheck(id));
        }
        self.checks.insert(id, check);
        Ok(())
    }

    /// Register a synchronous closure as a named check.
    pub fn register_fn<F>(&mut self, id: impl Into<String>, f: F) -> Result<(), VerifierError>
    where
        F: Fn(&ToolCall, &ToolCallResult) -> CheckOutcome + Send + Sync + 'static,
    {
        self.register(id, Arc::new(FnCheck(f)))
    }

    /// Whether a check ID resolves. Contract registration uses this.
    pub fn contains(&self, id: &str) -> bool {
        self.checks.contains_key(id)
    }

    /// Run the named checks in order and aggregate the verdict.
    ///
    /// The conjunction short-circuits on the first failure; a check that
    /// exceeds the timeout fails with reason `check_timeout`.
    pub async fn verify(
        &self,
        check_ids: &[String],
        call: &ToolCall,
        result: &ToolCallResult,
    ) -> PostConditionVerdict {
        for id in check_ids {
            let Some(check) = self.checks.get(id) else {
                // Registration validates IDs; reaching this means the
                // contract bypassed the registry.
                warn!(check = %id, "post-condition check not registered");
                return PostConditionVerdict::fail(id, "check not registered");
            };

            match tokio::time::timeout(self.check_timeout, check.check(call, result)).await {
                Ok(outcome) if outcome.ok => {}
                Ok(outcome) => {
                    let reason = outcome.reason.unwrap_or_else(|| "check failed".to_owned());
                    return PostConditionVerdict::fail(id, reason);
                }
                Err(_elapsed) => {
                    return PostConditionVerdict::fail(id, "check_timeout");
                }
            }
        }
        PostConditionVerdict::pass()
    }
}

//! Control surface — typed request/response commands over channels.
//!
//! The transport that binds this (HTTP, WebSocket, a chat adapter) lives
//! outside the kernel; it serializes [`ControlRequest`] values as JSON,
//! sends them down an mpsc channel paired with a oneshot for the response,
//! and forwards the event broadcast as its push stream. [`serve`] is the
//! dispatcher loop; [`ControlClient`] is the in-process caller.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::kernel::goals::{GoalPatch, NewGoal, NewTodo};
use crate::kernel::handle::{KernelError, KernelHandle, KernelStatus};
use crate::kernel::invariants::InvariantViolation;
use crate::kernel::memory::RetrieveOptions;
use crate::types::{
    CallSource, Event, Goal, IdentityDescriptor, IdentityPatch, MemoryEntry, PlanStep, Todo,
    TrustTier,
};

/// Buffered in-flight control requests.
const CHANNEL_BUFFER_SIZE: usize = 64;

/// A control request plus its response slot.
pub type ControlEnvelope = (ControlRequest, oneshot::Sender<ControlResponse>);

/// Commands accepted by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    Reset,
    SubmitPlan {
        steps: Vec<PlanStep>,
        #[serde(default = "default_source")]
        source: CallSource,
    },
    GetEpisode {
        episode_id: Uuid,
    },
    ListPending,
    Approve {
        call_id: Uuid,
        actor: String,
    },
    Deny {
        call_id: Uuid,
        actor: String,
        reason: String,
    },
    CreateGoal {
        name: String,
        description: String,
        #[serde(default)]
        tags: Vec<String>,
        priority: u8,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    UpdateGoal {
        id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        priority: Option<u8>,
    },
    CompleteGoal {
        id: Uuid,
    },
    ReopenGoal {
        id: Uuid,
    },
    DeleteGoal {
        id: Uuid,
    },
    ListGoals,
    CreateTodo {
        name: String,
        description: String,
        priority: u8,
        #[serde(default)]
        urgent: bool,
        #[serde(default)]
        parent_goal_id: Option<Uuid>,
    },
    CompleteTodo {
        id: Uuid,
    },
    ListTodos,
    Retrieve {
        #[serde(default)]
        query: String,
        #[serde(default)]
        include_quarantined: bool,
        #[serde(default = "default_min_tier")]
        min_tier: TrustTier,
    },
    Rehabilitate {
        id: Uuid,
    },
    QuarantineList,
    GetIdentity,
    UpdateIdentity {
        patch: IdentityPatch,
    },
    CheckInvariants,
    EnterSafeMode {
        reason: String,
    },
    ExitSafeMode,
}

fn default_source() -> CallSource {
    CallSource::User
}

fn default_min_tier() -> TrustTier {
    TrustTier::Low
}

/// A pending approval, flattened for transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    pub call_id: Uuid,
    pub tool_id: String,
    pub justification: String,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub timeout_ms: u64,
}

/// Responses returned by the kernel.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Status { status: KernelStatus },
    Episode { episode_id: Uuid },
    Events { events: Vec<Event> },
    Pending { requests: Vec<PendingSummary> },
    Goal { goal: Goal },
    Goals { goals: Vec<Goal> },
    Todo { todo: Todo },
    Todos { todos: Vec<Todo> },
    Memory { entries: Vec<MemoryEntry> },
    Quarantine { ids: Vec<Uuid> },
    Identity { identity: IdentityDescriptor },
    Violations { violations: Vec<InvariantViolation> },
    Error { kind: String, reason: String },
}

/// Create the control channel pair.
pub fn channel() -> (ControlClient, mpsc::Receiver<ControlEnvelope>) {
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    (ControlClient { tx }, rx)
}

/// In-process caller over the control channel.
#[derive(Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<ControlEnvelope>,
}

impl ControlClient {
    /// Send one request and await its response.
    pub async fn call(&self, request: ControlRequest) -> ControlResponse {
        let (tx, rx) = oneshot::channel();
        if self.tx.send((request, tx)).await.is_err() {
            return ControlResponse::Error {
                kind: "KernelGone".to_owned(),
                reason: "control channel closed".to_owned(),
            };
        }
        rx.await.unwrap_or(ControlResponse::Error {
            kind: "KernelGone".to_owned(),
            reason: "kernel dropped the request".to_owned(),
        })
    }
}

/// Dispatcher loop: drain the channel until every client is gone.
pub async fn serve(kernel: KernelHandle, mut rx: mpsc::Receiver<ControlEnvelope>) {
    while let Some((request, reply)) = rx.recv().await {
        let response = dispatch(&kernel, request);
        if reply.send(response).is_err() {
            warn!("control client went away before its response");
        }
    }
}

/// Map one request onto the kernel handle.
pub fn dispatch(kernel: &KernelHandle, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Status => ControlResponse::Status {
            status: kernel.status(),
        },
        ControlRequest::Start => {
            kernel.start();
            ControlResponse::Ok
        }
        ControlRequest::Stop => {
            kernel.stop();
            ControlResponse::Ok
        }
        ControlRequest::Pause => {
            kernel.pause();
            ControlResponse::Ok
        }
        ControlRequest::Resume => {
            kernel.resume();
            ControlResponse::Ok
        }
        ControlRequest::Restart => {
            kernel.restart();
            ControlResponse::Ok
        }
        ControlRequest::Reset => {
            kernel.reset();
            ControlResponse::Ok
        }
        ControlRequest::SubmitPlan { steps, source } => {
            match kernel.submit_plan(steps, source) {
                Ok(episode_id) => ControlResponse::Episode { episode_id },
                Err(e) => error_response(&e),
            }
        }
        ControlRequest::GetEpisode { episode_id } => ControlResponse::Events {
            events: kernel.get_episode(episode_id),
        },
        ControlRequest::ListPending => ControlResponse::Pending {
            requests: kernel
                .list_pending()
                .into_iter()
                .map(|p| PendingSummary {
                    call_id: p.call.call_id,
                    tool_id: p.call.tool_id,
                    justification: p.justification,
                    requested_at: p.requested_at,
                    timeout_ms: u64::try_from(p.timeout.as_millis()).unwrap_or(u64::MAX),
                })
                .collect(),
        },
        ControlRequest::Approve { call_id, actor } => {
            result_response(kernel.approve(call_id, &actor))
        }
        ControlRequest::Deny {
            call_id,
            actor,
            reason,
        } => result_response(kernel.deny(call_id, &actor, &reason)),
        ControlRequest::CreateGoal {
            name,
            description,
            tags,
            priority,
            metadata,
        } => match kernel.create_goal(NewGoal {
            name,
            description,
            tags,
            priority,
            metadata,
        }) {
            Ok(goal) => ControlResponse::Goal { goal },
            Err(e) => error_response(&e),
        },
        ControlRequest::UpdateGoal {
            id,
            name,
            description,
            priority,
        } => match kernel.update_goal(
            id,
            GoalPatch {
                name,
                description,
                priority,
                ..GoalPatch::default()
            },
        ) {
            Ok(goal) => ControlResponse::Goal { goal },
            Err(e) => error_response(&e),
        },
        ControlRequest::CompleteGoal { id } => match kernel.complete_goal(id) {
            Ok(goal) => ControlResponse::Goal { goal },
            Err(e) => error_response(&e),
        },
        ControlRequest::ReopenGoal { id } => match kernel.reopen_goal(id) {
            Ok(goal) => ControlResponse::Goal { goal },
            Err(e) => error_response(&e),
        },
        ControlRequest::DeleteGoal { id } => result_response(kernel.delete_goal(id)),
        ControlRequest::ListGoals => ControlResponse::Goals {
            goals: kernel.list_goals(),
        },
        ControlRequest::CreateTodo {
            name,
            description,
            priority,
            urgent,
            parent_goal_id,
        } => match kernel.create_todo(NewTodo {
            name,
            description,
            tags: Vec::new(),
            priority,
            urgent,
            parent_goal_id,
            metadata: serde_json::Value::Null,
        }) {
            Ok(todo) => ControlResponse::Todo { todo },
            Err(e) => error_response(&e),
        },
        ControlRequest::CompleteTodo { id } => match kernel.complete_todo(id) {
            Ok(todo) => ControlResponse::Todo { todo },
            Err(e) => error_response(&e),
        },
        ControlRequest::ListTodos => ControlResponse::Todos {
            todos: kernel.list_todos(),
        },
        ControlRequest::Retrieve {
            query,
            include_quarantined,
            min_tier,
        } => ControlResponse::Memory {
            entries: kernel.retrieve(
                &query,
                RetrieveOptions {
                    include_quarantined,
                    min_tier,
                },
            ),
        },
        ControlRequest::Rehabilitate { id } => match kernel.rehabilitate(id) {
            Ok(_entry) => ControlResponse::Ok,
            Err(e) => error_response(&e),
        },
        ControlRequest::QuarantineList => ControlResponse::Quarantine {
            ids: kernel.quarantine_list(),
        },
        ControlRequest::GetIdentity => ControlResponse::Identity {
            identity: kernel.get_identity(),
        },
        ControlRequest::UpdateIdentity { patch } => ControlResponse::Identity {
            identity: kernel.update_identity(patch),
        },
        ControlRequest::CheckInvariants => ControlResponse::Violations {
            violations: kernel.check_now(),
        },
        ControlRequest::EnterSafeMode { reason } => {
            kernel.enter_safe_mode(&reason);
            ControlResponse::Ok
        }
        ControlRequest::ExitSafeMode => {
            kernel.exit_safe_mode();
            ControlResponse::Ok
        }
    }
}

fn result_response(result: Result<(), KernelError>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::Ok,
        Err(e) => error_response(&e),
    }
}

/// Map kernel errors onto the wire error kinds.
fn error_response(error: &KernelError) -> ControlResponse {
    let kind = match error {
        KernelError::ConfigInvalid(_) => "ConfigInvalid",
        KernelError::PersistenceUnavailable(_) => "PersistenceUnavailable",
        KernelError::Registry(e) => match e {
            crate::kernel::registry::RegistryError::DuplicateTool(_) => "DuplicateTool",
            crate::kernel::registry::RegistryError::UnknownPostCondition { .. } => "ConfigInvalid",
        },
        KernelError::Schema(_) => "ConfigInvalid",
        KernelError::Verifier(_) => "ConfigInvalid",
        KernelError::Compensation(_) => "ConfigInvalid",
        KernelError::Memory(e) => match e {
            crate::kernel::memory::MemoryError::NotFound(_) => "NotFound",
            crate::kernel::memory::MemoryError::Conflict { .. } => "Conflict",
        },
        KernelError::Goals(e) => match e {
            crate::kernel::goals::GoalError::NotFound(_) => "NotFound",
            crate::kernel::goals::GoalError::ParentNotFound(_) => "NotFound",
            crate::kernel::goals::GoalError::BadPriority(_) => "ConfigInvalid",
        },
        KernelError::Approval(_) => "NotFound",
        KernelError::NotRunning => "Conflict",
    };
    ControlResponse::Error {
        kind: kind.to_owned(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn kernel() -> KernelHandle {
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds")
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let kernel = kernel();
        let response = dispatch(&kernel, ControlRequest::Status);
        match response {
            ControlResponse::Status { status } => {
                assert_eq!(status.agent_name, "straylight");
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_goal_crud_over_dispatch() {
        let kernel = kernel();
        let response = dispatch(
            &kernel,
            ControlRequest::CreateGoal {
                name: "ship".to_owned(),
                description: "cut the release".to_owned(),
                tags: vec![],
                priority: 1,
                metadata: serde_json::Value::Null,
            },
        );
        let goal_id = match response {
            ControlResponse::Goal { goal } => goal.id,
            other => panic!("expected goal, got {other:?}"),
        };

        let response = dispatch(&kernel, ControlRequest::CompleteGoal { id: goal_id });
        match response {
            ControlResponse::Goal { goal } => assert!(goal.completed),
            other => panic!("expected goal, got {other:?}"),
        }

        match dispatch(&kernel, ControlRequest::ListGoals) {
            ControlResponse::Goals { goals } => assert_eq!(goals.len(), 1),
            other => panic!("expected goals, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_goal_maps_to_not_found() {
        let kernel = kernel();
        let response = dispatch(
            &kernel,
            ControlRequest::CompleteGoal { id: Uuid::new_v4() },
        );
        match response {
            ControlResponse::Error { kind, .. } => assert_eq!(kind, "NotFound"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requests_deserialize_from_json() {
        let raw = r#"{"op": "submit_plan", "steps": [{"step_index": 0, "tool_id": "echo",
            "input": {"msg": "hi"}, "justification": "test", "rollback_policy": "skip"}]}"#;
        let request: ControlRequest = serde_json::from_str(raw).expect("parses");
        match request {
            ControlRequest::SubmitPlan { steps, source } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].tool_id, "echo");
                assert_eq!(source, CallSource::User, "source defaults to user");
            }
            other => panic!("expected submit_plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_loop_end_to_end() {
        let kernel = kernel();
        let (client, rx) = channel();
        let server = tokio::spawn(serve(kernel, rx));

        let response = client.call(ControlRequest::Start).await;
        assert!(matches!(response, ControlResponse::Ok));

        let response = client.call(ControlRequest::Status).await;
        match response {
            ControlResponse::Status { status } => {
                assert_eq!(status.state.to_string(), "running");
            }
            other => panic!("expected status, got {other:?}"),
        }

        drop(client);
        server.await.expect("server loop exits cleanly");
    }
}

//! Per-episode state machine.
//!
//! One machine per episode, linearizable behind a mutex. Illegal transition
//! attempts fail without mutating state; every legal transition emits an
//! `episode.state` event so the log alone reconstructs the episode.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::kernel::event_store::EventStore;
use crate::types::{EpisodeState, EventKind};

/// State machine errors.
#[derive(Debug, Error)]
pub enum FsmError {
    /// The requested transition is not in the table.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: EpisodeState,
        to: EpisodeState,
    },
}

/// Every state, for reachability walks.
const ALL_STATES: [EpisodeState; 10] = [
    EpisodeState::Idle,
    EpisodeState::Planning,
    EpisodeState::AwaitingApproval,
    EpisodeState::Executing,
    EpisodeState::Verifying,
    EpisodeState::Committing,
    EpisodeState::Compensating,
    EpisodeState::Done,
    EpisodeState::Failed,
    EpisodeState::SafeMode,
];

/// The transition table.
///
/// Beyond the happy path, three failure branches exist: `planning → failed`
/// (input rejected before any side effect), `executing → compensating`
/// (tool error or timeout), and `committing → compensating` (invariants
/// failed after the memory write landed). Multi-step episodes loop
/// `committing → planning` between steps; only the last step closes with
/// `committing → done`. Safe mode is reachable from everywhere; operator
/// reset returns terminal states to idle.
pub fn allowed(from: EpisodeState, to: EpisodeState) -> bool {
    use EpisodeState::*;
    if to == SafeMode {
        return true;
    }
    matches!(
        (from, to),
        (Idle, Planning)
            | (Planning, AwaitingApproval)
            | (Planning, Executing)
            | (Planning, Failed)
            | (AwaitingApproval, Executing)
            | (AwaitingApproval, Failed)
            | (Executing, Verifying)
            | (Executing, Compensating)
            | (Verifying, Committing)
            | (Verifying, Compensating)
            | (Committing, Done)
            | (Committing, Planning)
            | (Committing, Compensating)
            | (Compensating, Failed)
            | (Done, Idle)
            | (Failed, Idle)
            | (SafeMode, Idle)
    )
}

/// Whether a terminal state (`done` or `failed`) is reachable from `state`
/// through legal transitions, excluding the safe-mode escape hatch.
pub fn reachable_terminal(state: EpisodeState) -> bool {
    let mut visited = vec![state];
    let mut frontier = vec![state];
    while let Some(current) = frontier.pop() {
        if matches!(current, EpisodeState::Done | EpisodeState::Failed) {
            return true;
        }
        for next in ALL_STATES {
            if next == EpisodeState::SafeMode {
                continue;
            }
            if allowed(current, next) && !visited.contains(&next) {
                visited.push(next);
                frontier.push(next);
            }
        }
    }
    false
}

/// Linearizable per-episode state cell.
pub struct EpisodeStateMachine {
    episode_id: Uuid,
    state: Mutex<EpisodeState>,
    events: Arc<EventStore>,
}

impl std::fmt::Debug for EpisodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeStateMachine")
            .field("episode_id", &self.episode_id)
            .field("state", &self.state())
            .finish()
    }
}

impl EpisodeStateMachine {
    /// Create a machine in `idle`.
    pub fn new(episode_id: Uuid, events: Arc<EventStore>) -> Self {
        Self {
            episode_id,
            state: Mutex::new(EpisodeState::Idle),
            events,
        }
    }

    /// The episode this machine belongs to.
    pub fn episode_id(&self) -> Uuid {
        self.episode_id
    }

    /// Current state.
    pub fn state(&self) -> EpisodeState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Attempt a transition. Illegal attempts leave the state untouched.
    pub fn transition(&self, to: EpisodeState) -> Result<EpisodeState, FsmError> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = *state;
        if !allowed(from, to) {
            return Err(FsmError::IllegalTransition { from, to });
        }
        *state = to;
        drop(state);

        debug!(episode_id = %self.episode_id, %from, %to, "episode transition");
        self.events.append(
            EventKind::EpisodeStateChanged,
            Some(self.episode_id),
            serde_json::json!({
                "from": from,
                "to": to,
            }),
        );
        Ok(to)
    }
}

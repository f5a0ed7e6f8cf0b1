//! Safe-mode controller.
//!
//! When tripped, the execution pipeline refuses every call whose contract is
//! not read-only until an operator exits safe mode. Entry is idempotent:
//! repeated `enter` updates the reason but keeps the original `entered_at`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::kernel::event_store::EventStore;
use crate::types::EventKind;

/// Safe-mode snapshot.
#[derive(Debug, Clone, Default)]
pub struct SafeModeState {
    pub active: bool,
    pub entered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Controls the kernel-wide safe-mode latch.
pub struct SafeModeController {
    state: Mutex<SafeModeState>,
    events: Arc<EventStore>,
}

impl std::fmt::Debug for SafeModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeModeController")
            .field("state", &self.state())
            .finish()
    }
}

impl SafeModeController {
    /// Create an inactive controller.
    pub fn new(events: Arc<EventStore>) -> Self {
        Self {
            state: Mutex::new(SafeModeState::default()),
            events,
        }
    }

    /// Trip safe mode. Returns true when this call activated it.
    pub fn enter(&self, reason: &str) -> bool {
        let mut state = self.lock_state();
        if state.active {
            // Idempotent: refresh the reason, keep entered_at.
            state.reason = Some(reason.to_owned());
            return false;
        }
        state.active = true;
        state.entered_at = Some(Utc::now());
        state.reason = Some(reason.to_owned());
        drop(state);

        warn!(%reason, "safe mode entered");
        self.events.append(
            EventKind::SafeModeEntered,
            None,
            serde_json::json!({"reason": reason}),
        );
        true
    }

    /// Restore normal operation. Returns true when this call deactivated it.
    pub fn exit(&self, actor: &str) -> bool {
        let mut state = self.lock_state();
        if !state.active {
            return false;
        }
        *state = SafeModeState::default();
        drop(state);

        info!(%actor, "safe mode exited");
        self.events.append(
            EventKind::SafeModeExited,
            None,
            serde_json::json!({"actor": actor}),
        );
        true
    }

    /// Whether safe mode is active.
    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    /// Current snapshot.
    pub fn state(&self) -> SafeModeState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SafeModeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

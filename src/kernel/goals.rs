//! Goal manager — goals and derived todos with priority-aware ordering.
//!
//! Updates are serialized behind one mutex. Completion stamps
//! `completed_at`; reopening clears it. Listings are sorted the way the
//! control surface presents them: goals by (priority asc, created_at desc),
//! todos by (urgent desc, priority asc, name asc).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::journal::Journal;
use crate::types::{Goal, Todo};

/// Goal manager errors.
#[derive(Debug, Error)]
pub enum GoalError {
    /// No goal or todo with this ID.
    #[error("not found: {0}")]
    NotFound(Uuid),
    /// Priority outside 1..=5.
    #[error("priority must be between 1 and 5, got {0}")]
    BadPriority(u8),
    /// A todo references a parent goal that does not exist.
    #[error("parent goal not found: {0}")]
    ParentNotFound(Uuid),
}

/// Fields for a new goal.
#[derive(Debug, Clone)]
pub struct NewGoal {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub priority: u8,
    pub metadata: serde_json::Value,
}

/// Fields for a new todo.
#[derive(Debug, Clone)]
pub struct NewTodo {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub priority: u8,
    pub urgent: bool,
    pub parent_goal_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

/// Partial update for a goal or todo.
#[derive(Debug, Clone, Default)]
pub struct GoalPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<u8>,
    pub metadata: Option<serde_json::Value>,
}

struct Store {
    goals: HashMap<Uuid, Goal>,
    todos: HashMap<Uuid, Todo>,
}

/// Tracks goals and todos for the agent.
pub struct GoalManager {
    store: Mutex<Store>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for GoalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (goals, todos) = self
            .store
            .lock()
            .map(|s| (s.goals.len(), s.todos.len()))
            .unwrap_or((0, 0));
        f.debug_struct("GoalManager")
            .field("goal_count", &goals)
            .field("todo_count", &todos)
            .finish()
    }
}

impl Default for GoalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GoalManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                goals: HashMap::new(),
                todos: HashMap::new(),
            }),
            journal: None,
        }
    }

    /// Attach the journal so goals persist.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reload goals from the journal at startup.
    pub fn restore(&self, goals: Vec<Goal>) {
        let mut store = self.lock_store();
        for goal in goals {
            store.goals.insert(goal.id, goal);
        }
    }

    // ── Goals ──

    /// Create a goal.
    pub fn create_goal(&self, new: NewGoal) -> Result<Goal, GoalError> {
        check_priority(new.priority)?;
        let goal = Goal {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            tags: new.tags,
            priority: new.priority,
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
            metadata: new.metadata,
        };

        let mut store = self.lock_store();
        store.goals.insert(goal.id, goal.clone());
        self.persist_goal(&goal);
        info!(id = %goal.id, name = %goal.name, priority = goal.priority, "goal created");
        Ok(goal)
    }

    /// Apply a partial update to a goal.
    pub fn update_goal(&self, id: Uuid, patch: GoalPatch) -> Result<Goal, GoalError> {
        if let Some(priority) = patch.priority {
            check_priority(priority)?;
        }
        let mut store = self.lock_store();
        let goal = store.goals.get_mut(&id).ok_or(GoalError::NotFound(id))?;
        if let Some(name) = patch.name {
            goal.name = name;
        }
        if let Some(description) = patch.description {
            goal.description = description;
        }
        if let Some(tags) = patch.tags {
            goal.tags = tags;
        }
        if let Some(priority) = patch.priority {
            goal.priority = priority;
        }
        if let Some(metadata) = patch.metadata {
            goal.metadata = metadata;
        }
        let snapshot = goal.clone();
        self.persist_goal(&snapshot);
        Ok(snapshot)
    }

    /// Mark a goal completed, stamping `completed_at`.
    pub fn complete_goal(&self, id: Uuid) -> Result<Goal, GoalError> {
        let mut store = self.lock_store();
        let goal = store.goals.get_mut(&id).ok_or(GoalError::NotFound(id))?;
        goal.completed = true;
        goal.completed_at = Some(Utc::now());
        let snapshot = goal.clone();
        self.persist_goal(&snapshot);
        Ok(snapshot)
    }

    /// Reopen a completed goal, clearing both completion fields.
    pub fn reopen_goal(&self, id: Uuid) -> Result<Goal, GoalError> {
        let mut store = self.lock_store();
        let goal = store.goals.get_mut(&id).ok_or(GoalError::NotFound(id))?;
        goal.completed = false;
        goal.completed_at = None;
        let snapshot = goal.clone();
        self.persist_goal(&snapshot);
        Ok(snapshot)
    }

    /// Delete a goal. Todos keep their dangling parent reference.
    pub fn delete_goal(&self, id: Uuid) -> Result<(), GoalError> {
        let mut store = self.lock_store();
        store
            .goals
            .remove(&id)
            .map(|_| ())
            .ok_or(GoalError::NotFound(id))
    }

    /// Fetch one goal.
    pub fn get_goal(&self, id: Uuid) -> Option<Goal> {
        self.lock_store().goals.get(&id).cloned()
    }

    /// All goals sorted by (priority asc, created_at desc).
    pub fn list_goals(&self) -> Vec<Goal> {
        let store = self.lock_store();
        let mut goals: Vec<Goal> = store.goals.values().cloned().collect();
        goals.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.created_at.cmp(&a.created_at))
        });
        goals
    }

    // ── Todos ──

    /// Create a todo, optionally attached to a parent goal.
    pub fn create_todo(&self, new: NewTodo) -> Result<Todo, GoalError> {
        check_priority(new.priority)?;
        let mut store = self.lock_store();
        if let Some(parent) = new.parent_goal_id {
            if !store.goals.contains_key(&parent) {
                return Err(GoalError::ParentNotFound(parent));
            }
        }

        let todo = Todo {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            tags: new.tags,
            priority: new.priority,
            urgent: new.urgent,
            parent_goal_id: new.parent_goal_id,
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
            metadata: new.metadata,
        };
        store.todos.insert(todo.id, todo.clone());
        Ok(todo)
    }

    /// Mark a todo completed.
    pub fn complete_todo(&self, id: Uuid) -> Result<Todo, GoalError> {
        let mut store = self.lock_store();
        let todo = store.todos.get_mut(&id).ok_or(GoalError::NotFound(id))?;
        todo.completed = true;
        todo.completed_at = Some(Utc::now());
        Ok(todo.clone())
    }

    /// Reopen a completed todo.
    pub fn reopen_todo(&self, id: Uuid) -> Result<Todo, GoalError> {
        let mut store = self.lock_store();
        let todo = store.todos.get_mut(&id).ok_or(GoalError::NotFound(id))?;
        todo.completed = false;
        todo.completed_at = None;
        Ok(todo.clone())
    }

    /// Delete a todo.
    pub fn delete_todo(&self, id: Uuid) -> Result<(), GoalError> {
        let mut store = self.lock_store();
        store
            .todos
            .remove(&id)
            .map(|_| ())
            .ok_or(GoalError::NotFound(id))
    }

    /// All todos sorted by (urgent desc, priority asc, name asc).
    pub fn list_todos(&self) -> Vec<Todo> {
        let store = self.lock_store();
        let mut todos: Vec<Todo> = store.todos.values().cloned().collect();
        todos.sort_by(|a, b| {
            b.urgent
                .cmp(&a.urgent)
                .then(a.priority.cmp(&b.priority))
                .then(a.name.cmp(&b.name))
        });
        todos
    }

    fn persist_goal(&self, goal: &Goal) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.upsert_goal(goal) {
                warn!(id = %goal.id, error = %e, "failed to journal goal");
            }
        }
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn check_priority(priority: u8) -> Result<(), GoalError> {
    if (1..=5).contains(&priority) {
        Ok(())
    } else {
        Err(GoalError::BadPriority(priority))
    }
}

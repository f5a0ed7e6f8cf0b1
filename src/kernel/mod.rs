// Kernel core — the trusted control plane between planner and tools.
//
// - event_store:  append-only ordered log, broadcast push, sinks
// - registry:     tool contracts and handlers
// - trust:        pure trust scoring
// - memory:       memory gate and store
// - drift:        identity descriptor and persona-drift monitor
// - goals:        goals and todos
// - schema:       declarative input/output validation
// - postcond:     semantic checks after tool return
// - invariants:   whole-kernel checkpoint invariants
// - approval:     human-in-the-loop gate with timeouts
// - compensation: inverse actions for rollback
// - fsm:          per-episode state machine
// - pipeline:     per-step execution gauntlet
// - orchestrator: per-episode role loop
// - safe_mode:    kernel-wide read-only latch
// - journal:      bundled SQLite persistence
// - handle:       assembly and the explicit kernel handle

pub mod approval;
pub mod compensation;
pub mod drift;
pub mod event_store;
pub mod fsm;
pub mod goals;
pub mod handle;
pub mod invariants;
pub mod journal;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod postcond;
pub mod registry;
pub mod safe_mode;
pub mod schema;
pub mod trust;

//! HTTP control/status surface wrapping the planning core's database-facing
//! components (C9 dispatcher, C10 guardian). Orchestrator cycle triggering
//! (C8) is not wired here yet — it needs a repository-backed `ContextBuilder`
//! that this daemon does not own (see `hplan-orchestrator`'s hook traits).

pub mod api_types;
pub mod routes;
pub mod state;

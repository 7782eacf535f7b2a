//! ADW drives a source reference (an issue, ticket or spec) through an
//! ordered pipeline of agent phases. Each run gets its own git worktree, a
//! durable checkpoint log and an explicit state machine, so an interrupted
//! run resumes from its last completed phase.

pub mod config;
pub mod delegate;
pub mod doctor;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod queue;
pub mod state;
pub mod worktree;

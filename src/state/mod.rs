//! Checkpointed run state.
//!
//! - `model`: `ExecutionState`, `Checkpoint` and failure reports
//! - `store`: atomic JSON persistence, recovery scan and change events
//! - `lock`: the exclusive per-run lock file

mod lock;
mod model;
mod store;

pub use lock::RunLock;
pub use model::{
    AppendOutcome, Checkpoint, ExecutionState, FailureReport, STATE_VERSION, new_run_id,
};
pub use store::{Scan, StateStore, StoreEvent, write_atomic};

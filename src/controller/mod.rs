//! Loop controller: one state machine per run.

mod loop_controller;
mod state;

pub use loop_controller::{LoopController, RunSpec, STALL_REASON_INFRA};
pub use state::RunProjection;

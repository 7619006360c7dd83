//! Run manager: concurrent runs, each on its own controller task.

mod run_manager;

pub use run_manager::{RunManager, VerifierFactory};

//! Storage layer for vloop - append-only event logs.
//!
//! Each run's events are persisted on every publish and read back once at
//! run start, which is all that resume and audit need.

mod jsonl;
mod memory;
mod traits;

pub use jsonl::JsonlEventLog;
pub use memory::MemoryEventLog;
pub use traits::EventSink;

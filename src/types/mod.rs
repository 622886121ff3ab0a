//! Shared data structures for coincidence event acquisition
//!
//! - `EventRecord`: one parsed detector event
//! - `AnomalyFlag` / `Decision`: per-cycle rate comparison outcome
//! - `BufferSnapshot`: immutable buffer capture handed to persistence

mod event;
mod snapshot;

pub use event::*;
pub use snapshot::*;

//! Phase 3: The Engine
//!
//! Runs the graph, the detector and the tracker behind one async worker.

mod coalescer;
mod worker;

pub use coalescer::UpdateCoalescer;
pub use worker::{EngineError, EngineStats, GraphHandle, GraphWorker, ShutdownHandle, WorkerMessage};

//! Phase 1: The Cartographer
//!
//! Turns price ticks into a log-weighted currency graph.

mod graph;
mod update;

pub use graph::{
    log_weight, CurrencyNode, GraphError, GraphSnapshot, RateEdge, RateGraph, SnapshotEdge, Timestamp,
};
pub use update::{split_pair, FeeSchedule, RateUpdate};

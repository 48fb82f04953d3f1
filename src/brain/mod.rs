//! Phase 2: The Brain
//!
//! Responsible for:
//! - Finding negative cycles (arbitrage opportunities) using Bellman-Ford
//! - Tracking, ranking and expiring the opportunities they describe

mod bellman_ford;
mod tracker;

pub use bellman_ford::{format_cycle_path, is_close, CycleDetector, RawCycle, Tolerance};
pub use tracker::{Hop, Opportunity, OpportunityTracker};

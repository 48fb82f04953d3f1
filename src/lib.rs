//! arbgraph - currency arbitrage detection over a log-weighted rate graph
//!
//! Price ticks become a directed graph of `currency_exchange` nodes whose
//! edges carry `-ln(rate)`. Negative cycles found by Bellman-Ford are
//! arbitrage opportunities, tracked and ranked until they go stale.

pub mod brain;
pub mod cartographer;
pub mod config;
pub mod engine;

pub use brain::{CycleDetector, Opportunity, OpportunityTracker, RawCycle, Tolerance};
pub use cartographer::{FeeSchedule, GraphError, GraphSnapshot, RateGraph, RateUpdate};
pub use config::Config;
pub use engine::{GraphHandle, GraphWorker};

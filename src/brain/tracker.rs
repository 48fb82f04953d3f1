//! Opportunity Tracker
//!
//! Step 2.2: The Filter
//!
//! Prices each detected cycle against the graph, keeps one record per
//! distinct opportunity, refreshes it when it is seen again and drops it once
//! it has not been seen for `expire_time` milliseconds.

use console::style;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use super::RawCycle;
use crate::cartographer::{RateGraph, Timestamp};

/// One conversion step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub from: String,
    pub to: String,
    pub price: f64,
}

/// A tracked arbitrage cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub start_currency: String,
    pub hops: Vec<Hop>,
    /// Product of hop prices; above 1.0 is profitable before slippage
    pub gain: f64,
    pub discovered_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(skip)]
    pub venue: String,
    /// Times this record was seen again after discovery
    #[serde(skip)]
    pub refreshes: u32,
}

/// Same ordered hops and same gain
impl PartialEq for Opportunity {
    fn eq(&self, other: &Self) -> bool {
        self.hops == other.hops && self.gain == other.gain
    }
}

impl Opportunity {
    /// Price every hop of `cycle` from the graph
    pub fn from_cycle(cycle: &RawCycle, graph: &RateGraph, venue: &str, now: Timestamp) -> Option<Self> {
        if cycle.nodes.is_empty() {
            return None;
        }

        let path = cycle.closed_path();
        let mut hops = Vec::with_capacity(cycle.hop_count());
        let mut gain = 1.0;

        for step in path.windows(2) {
            let price = match graph.get_edge_price(&step[0], &step[1]) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Cannot price hop {} -> {}: {}", step[0], step[1], e);
                    return None;
                }
            };
            gain *= price;
            hops.push(Hop {
                from: step[0].clone(),
                to: step[1].clone(),
                price,
            });
        }

        if !gain.is_finite() {
            return None;
        }

        let start_currency = graph
            .node_index(&path[0])
            .and_then(|idx| graph.node(idx))
            .map(|node| node.currency.clone())?;

        Some(Self {
            start_currency,
            hops,
            gain,
            discovered_at: now,
            updated_at: now,
            venue: venue.to_string(),
            refreshes: 0,
        })
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn gain_pct(&self) -> f64 {
        (self.gain - 1.0) * 100.0
    }

    /// Node ids in order, start repeated at the end
    pub fn path(&self) -> Vec<String> {
        let mut path: Vec<String> = self.hops.iter().map(|h| h.from.clone()).collect();
        if let Some(last) = self.hops.last() {
            path.push(last.to.clone());
        }
        path
    }

    pub fn format_path(&self) -> String {
        self.path().join(" → ")
    }

    pub fn is_expired(&self, now: Timestamp, expire_time: i64) -> bool {
        self.updated_at + expire_time < now
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Ranked queue of live opportunities
#[derive(Debug, Clone)]
pub struct OpportunityTracker {
    op_queue: Vec<Opportunity>,
    expire_time: i64,
    min_gain: f64,
}

impl OpportunityTracker {
    pub fn new(expire_time: i64, min_gain: f64) -> Self {
        Self {
            op_queue: Vec::new(),
            expire_time,
            min_gain,
        }
    }

    pub fn expire_time(&self) -> i64 {
        self.expire_time
    }

    /// Turn detected cycles into opportunities and merge them into the
    /// queue. Returns the merged records for this batch.
    pub fn handle_cycles(
        &mut self,
        raw: Vec<RawCycle>,
        graph: &RateGraph,
        venue: &str,
        now: Timestamp,
    ) -> Vec<Opportunity> {
        let mut batch = Vec::with_capacity(raw.len());

        for cycle in raw {
            let Some(op) = Opportunity::from_cycle(&cycle, graph, venue, now) else {
                continue;
            };

            if op.gain <= self.min_gain {
                debug!("Below min gain: {} ({:.6}x)", op.format_path(), op.gain);
                continue;
            }

            batch.push(self.merge(op));
        }

        self.sort();
        batch
    }

    fn merge(&mut self, op: Opportunity) -> Opportunity {
        if let Some(existing) = self.op_queue.iter_mut().find(|o| **o == op) {
            existing.updated_at = op.updated_at;
            existing.gain = op.gain;
            existing.refreshes += 1;
            return existing.clone();
        }

        info!(
            "{}",
            style(format!(
                "💰 NEW: {} | {:.6}x ({:+.4}%)",
                op.format_path(),
                op.gain,
                op.gain_pct()
            ))
            .green()
            .bold()
        );
        self.op_queue.push(op.clone());
        op
    }

    /// Best gain first; on equal gain the shorter cycle wins
    pub fn sort(&mut self) {
        self.op_queue.sort_by(|a, b| {
            b.gain
                .partial_cmp(&a.gain)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.hop_count().cmp(&b.hop_count()))
        });
    }

    /// Remove everything not refreshed within `expire_time` of `now`
    pub fn purge(&mut self, now: Timestamp, expire_time: i64) -> usize {
        let before = self.op_queue.len();
        self.op_queue.retain(|o| !o.is_expired(now, expire_time));

        let purged = before - self.op_queue.len();
        if purged > 0 {
            debug!("Purged {} expired opportunities", purged);
        }
        purged
    }

    /// [`OpportunityTracker::purge`] with the configured expiry
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        self.purge(now, self.expire_time)
    }

    pub fn queue(&self) -> &[Opportunity] {
        &self.op_queue
    }

    pub fn top(&self, n: usize) -> &[Opportunity] {
        &self.op_queue[..n.min(self.op_queue.len())]
    }

    pub fn len(&self) -> usize {
        self.op_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op_queue.is_empty()
    }

    #[cfg(test)]
    fn push(&mut self, op: Opportunity) {
        self.op_queue.push(op);
    }
}

impl Default for OpportunityTracker {
    fn default() -> Self {
        Self::new(20_000, 1.0)
    }
}

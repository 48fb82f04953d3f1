//! Rate Graph - Streaming Edition
//!
//! Step 1.2: The Map Maker
//!
//! One node per (currency, exchange), one directed edge per ordered node pair.
//! Edge weights are `-ln(price * (1 + fee))` so that a profitable loop of
//! conversions shows up as a negative-weight cycle.
//!
//! Nodes and edges live in a `StableDiGraph` arena; the two lookup maps give
//! O(1) access by node id and by (tail, head) pair. Every mutating method keeps
//! the arena and both maps in lock-step.

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{FeeSchedule, RateUpdate};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("invalid price {price} with fee {fee}: log-rate is not finite")]
    InvalidPrice { price: f64, fee: f64 },

    #[error("node {0} is not present in the graph")]
    NodeNotFound(String),

    #[error("edge {tail} -> {head} is not present in the graph")]
    EdgeNotFound { tail: String, head: String },

    #[error("graph structures out of sync: {0}")]
    GraphInconsistency(String),

    #[error("invalid pair {0:?}: expected BASE/QUOTE")]
    InvalidPair(String),
}

/// A currency as listed on one exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyNode {
    pub currency: String,
    pub exchange: String,
    id: String,
}

impl CurrencyNode {
    pub fn new(currency: &str, exchange: &str) -> Self {
        Self {
            currency: currency.to_string(),
            exchange: exchange.to_string(),
            id: Self::make_id(currency, exchange),
        }
    }

    /// `"{currency}_{exchange}"`
    pub fn make_id(currency: &str, exchange: &str) -> String {
        format!("{}_{}", currency, exchange)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CurrencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Directed exchange-rate edge
#[derive(Debug, Clone)]
pub struct RateEdge {
    pub id: String,
    /// `-ln(effective rate)`
    pub weight: f64,
    pub observed_at: Option<Timestamp>,
}

impl RateEdge {
    fn new(tail: &CurrencyNode, head: &CurrencyNode, weight: f64, observed_at: Option<Timestamp>) -> Self {
        Self {
            id: format!("{}_{}", tail.id(), head.id()),
            weight,
            observed_at,
        }
    }

    /// Effective rate in linear (non-log) space
    pub fn price(&self) -> f64 {
        (-self.weight).exp()
    }
}

impl PartialEq for RateEdge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.weight == other.weight
    }
}

/// Read-only export of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<String>,
    pub edges: Vec<SnapshotEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub from: String,
    pub to: String,
    pub price: f64,
}

/// Log weight of one conversion direction.
///
/// Rejects anything that would put a NaN or infinity into the graph.
pub fn log_weight(price: f64, fee: f64) -> Result<f64, GraphError> {
    let invalid = GraphError::InvalidPrice { price, fee };

    if price.is_nan() || price <= 0.0 || !price.is_finite() {
        return Err(invalid);
    }
    if fee.is_nan() || fee <= -1.0 {
        return Err(invalid);
    }

    let effective = price * (1.0 + fee);
    if effective <= 0.0 {
        return Err(invalid);
    }

    let weight = -effective.ln();
    if !weight.is_finite() {
        return Err(invalid);
    }
    Ok(weight)
}

/// Forward and reverse weights for one BASE/QUOTE price
fn pair_weights(price: f64, fee: f64) -> Result<(f64, f64), GraphError> {
    let forward = log_weight(price, fee)?;
    let reverse = log_weight(1.0 / price, fee).map_err(|_| GraphError::InvalidPrice { price, fee })?;
    Ok((forward, reverse))
}

/// The currency rate graph
#[derive(Debug, Default)]
pub struct RateGraph {
    graph: StableDiGraph<CurrencyNode, RateEdge>,
    node_map: HashMap<String, NodeIndex>,
    edge_map: HashMap<(NodeIndex, NodeIndex), EdgeIndex>,
}

impl RateGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_map: HashMap::new(),
            edge_map: HashMap::new(),
        }
    }

    /// Build a graph from a batch of updates. Invalid ticks are skipped.
    pub fn from_updates(updates: &[RateUpdate], fees: &FeeSchedule) -> Self {
        let mut graph = Self::new();
        let mut skipped_invalid = 0;

        for update in updates {
            let fee = fees.resolve(update);
            if let Err(e) = graph.apply_update(update, fee) {
                debug!("Skipping {} {}/{}: {}", update.exchange, update.base, update.quote, e);
                skipped_invalid += 1;
            }
        }

        info!(
            "Graph built: {} Nodes, {} Edges",
            graph.node_count(),
            graph.len()
        );

        if skipped_invalid > 0 {
            warn!("  Skipped {} ticks with invalid prices", skipped_invalid);
        }

        graph
    }

    /// Insert both directions of a BASE/QUOTE price.
    ///
    /// A complete pair is left untouched; refreshing it goes through
    /// [`RateGraph::update_pair`]. If only one direction survives, both are
    /// rewritten at the new price so the pair stays inverse-consistent.
    pub fn add_pair(
        &mut self,
        base: &str,
        quote: &str,
        exchange: &str,
        price: f64,
        fee: f64,
        observed_at: Option<Timestamp>,
    ) -> Result<(), GraphError> {
        if base == quote {
            return Err(GraphError::InvalidPair(format!("{}/{}", base, quote)));
        }
        let (forward, reverse) = pair_weights(price, fee)?;

        let b = self.get_or_create_node(base, exchange);
        let q = self.get_or_create_node(quote, exchange);

        if self.edge_map.contains_key(&(b, q)) && self.edge_map.contains_key(&(q, b)) {
            debug!("Pair {}/{} on {} already present, not re-added", base, quote, exchange);
            return Ok(());
        }

        // A half-present pair gets both directions at the new price
        self.set_edge(b, q, forward, observed_at);
        self.set_edge(q, b, reverse, observed_at);
        Ok(())
    }

    /// Refresh both directions of an existing pair.
    ///
    /// Leaves the graph unchanged and returns `EdgeNotFound` unless both
    /// directions already exist.
    pub fn update_pair(
        &mut self,
        base: &str,
        quote: &str,
        exchange: &str,
        price: f64,
        fee: f64,
        observed_at: Option<Timestamp>,
    ) -> Result<(), GraphError> {
        if base == quote {
            return Err(GraphError::InvalidPair(format!("{}/{}", base, quote)));
        }
        let (forward, reverse) = pair_weights(price, fee)?;

        let b_id = CurrencyNode::make_id(base, exchange);
        let q_id = CurrencyNode::make_id(quote, exchange);

        let edges = match (self.node_map.get(&b_id), self.node_map.get(&q_id)) {
            (Some(&b), Some(&q)) => self
                .edge_map
                .get(&(b, q))
                .copied()
                .zip(self.edge_map.get(&(q, b)).copied()),
            _ => None,
        };

        let Some((fwd_edge, rev_edge)) = edges else {
            debug!("update_pair: {} <-> {} not in graph", b_id, q_id);
            return Err(GraphError::EdgeNotFound { tail: b_id, head: q_id });
        };

        for (edge, weight) in [(fwd_edge, forward), (rev_edge, reverse)] {
            if let Some(data) = self.graph.edge_weight_mut(edge) {
                data.weight = weight;
                data.observed_at = observed_at;
            }
        }

        debug!("Updated {} <-> {} @ {:.8}", b_id, q_id, price);
        Ok(())
    }

    /// Upsert entry point for the feed: update in place, add if absent.
    pub fn apply_update(&mut self, update: &RateUpdate, fee: f64) -> Result<(), GraphError> {
        match self.update_pair(
            &update.base,
            &update.quote,
            &update.exchange,
            update.price,
            fee,
            update.timestamp,
        ) {
            Err(GraphError::EdgeNotFound { .. }) => self.add_pair(
                &update.base,
                &update.quote,
                &update.exchange,
                update.price,
                fee,
                update.timestamp,
            ),
            other => other,
        }
    }

    /// Remove a node along with every edge touching it
    pub fn remove_node(&mut self, node_id: &str) -> Result<(), GraphError> {
        let Some(idx) = self.node_map.remove(node_id) else {
            return Err(GraphError::NodeNotFound(node_id.to_string()));
        };

        let incident: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .chain(self.graph.edges_directed(idx, Direction::Incoming))
            .filter_map(|e| self.graph.edge_endpoints(e.id()))
            .collect();

        for key in &incident {
            self.edge_map.remove(key);
        }

        // petgraph drops the incident edges together with the node
        self.graph.remove_node(idx);

        debug!("Removed node {} and {} incident edges", node_id, incident.len());
        Ok(())
    }

    /// Remove one directed edge
    pub fn remove_edge(&mut self, tail_id: &str, head_id: &str) -> Result<(), GraphError> {
        let not_found = || GraphError::EdgeNotFound {
            tail: tail_id.to_string(),
            head: head_id.to_string(),
        };

        let tail = *self.node_map.get(tail_id).ok_or_else(not_found)?;
        let head = *self.node_map.get(head_id).ok_or_else(not_found)?;
        let edge = self.edge_map.remove(&(tail, head)).ok_or_else(not_found)?;

        self.graph.remove_edge(edge);
        Ok(())
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.node_map.contains_key(node_id)
    }

    pub fn has_edge(&self, tail_id: &str, head_id: &str) -> bool {
        match (self.node_map.get(tail_id), self.node_map.get(head_id)) {
            (Some(&t), Some(&h)) => self.edge_map.contains_key(&(t, h)),
            _ => false,
        }
    }

    fn edge_data(&self, tail_id: &str, head_id: &str) -> Result<&RateEdge, GraphError> {
        let tail = *self
            .node_map
            .get(tail_id)
            .ok_or_else(|| GraphError::NodeNotFound(tail_id.to_string()))?;
        let head = *self
            .node_map
            .get(head_id)
            .ok_or_else(|| GraphError::NodeNotFound(head_id.to_string()))?;

        self.edge_map
            .get(&(tail, head))
            .and_then(|&e| self.graph.edge_weight(e))
            .ok_or_else(|| GraphError::EdgeNotFound {
                tail: tail_id.to_string(),
                head: head_id.to_string(),
            })
    }

    /// Log-space weight of an edge
    pub fn get_edge_weight(&self, tail_id: &str, head_id: &str) -> Result<f64, GraphError> {
        self.edge_data(tail_id, head_id).map(|e| e.weight)
    }

    /// Effective rate of an edge, `exp(-weight)`
    pub fn get_edge_price(&self, tail_id: &str, head_id: &str) -> Result<f64, GraphError> {
        self.edge_data(tail_id, head_id).map(RateEdge::price)
    }

    pub fn edge_observed_at(&self, tail_id: &str, head_id: &str) -> Result<Option<Timestamp>, GraphError> {
        self.edge_data(tail_id, head_id).map(|e| e.observed_at)
    }

    /// Heads of all edges leaving `node_id`. Unknown nodes have no children.
    pub fn children_of(&self, node_id: &str) -> Vec<String> {
        self.neighbours(node_id, Direction::Outgoing)
    }

    /// Tails of all edges entering `node_id`. Unknown nodes have no parents.
    pub fn parents_of(&self, node_id: &str) -> Vec<String> {
        self.neighbours(node_id, Direction::Incoming)
    }

    fn neighbours(&self, node_id: &str, dir: Direction) -> Vec<String> {
        let Some(&idx) = self.node_map.get(node_id) else {
            return Vec::new();
        };

        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(idx, dir)
            .filter_map(|n| self.graph.node_weight(n))
            .map(|n| n.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Number of directed edges (a pair contributes two)
    pub fn len(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.edge_count() == 0
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// All node ids, sorted
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.node_map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn node_index(&self, node_id: &str) -> Option<NodeIndex> {
        self.node_map.get(node_id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&CurrencyNode> {
        self.graph.node_weight(idx)
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Weight of the edge `tail -> head` by arena index
    pub fn weight_between(&self, tail: NodeIndex, head: NodeIndex) -> Option<f64> {
        self.edge_map
            .get(&(tail, head))
            .and_then(|&e| self.graph.edge_weight(e))
            .map(|e| e.weight)
    }

    /// Every edge as `(tail, head, weight)`
    pub fn weighted_edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, f64)> + '_ {
        self.graph.node_indices().flat_map(move |n| {
            self.graph
                .edges(n)
                .map(|e| (e.source(), e.target(), e.weight().weight))
        })
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.graph.clear();
        self.node_map.clear();
        self.edge_map.clear();
    }

    /// Verify that the arena and both lookup maps agree
    pub fn check_consistency(&self) -> Result<(), GraphError> {
        if self.node_map.len() != self.graph.node_count() {
            return Err(GraphError::GraphInconsistency(format!(
                "{} node ids but {} nodes",
                self.node_map.len(),
                self.graph.node_count()
            )));
        }

        for (id, &idx) in &self.node_map {
            match self.graph.node_weight(idx) {
                Some(node) if node.id() == id => {}
                _ => {
                    return Err(GraphError::GraphInconsistency(format!(
                        "node id {} points at a missing or different node",
                        id
                    )))
                }
            }
        }

        if self.edge_map.len() != self.graph.edge_count() {
            return Err(GraphError::GraphInconsistency(format!(
                "{} edge keys but {} edges",
                self.edge_map.len(),
                self.graph.edge_count()
            )));
        }

        for (&(tail, head), &edge) in &self.edge_map {
            if self.graph.edge_endpoints(edge) != Some((tail, head)) {
                return Err(GraphError::GraphInconsistency(format!(
                    "edge key {:?} -> {:?} points at wrong endpoints",
                    tail, head
                )));
            }
        }

        Ok(())
    }

    /// Read-only export with prices in linear space
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut edges: Vec<SnapshotEdge> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (tail, head) = self.graph.edge_endpoints(e)?;
                Some(SnapshotEdge {
                    from: self.graph.node_weight(tail)?.id().to_string(),
                    to: self.graph.node_weight(head)?.id().to_string(),
                    price: self.graph.edge_weight(e)?.price(),
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        GraphSnapshot {
            nodes: self.node_ids(),
            edges,
        }
    }

    fn get_or_create_node(&mut self, currency: &str, exchange: &str) -> NodeIndex {
        let node = CurrencyNode::new(currency, exchange);
        if let Some(&idx) = self.node_map.get(node.id()) {
            return idx;
        }

        let id = node.id().to_string();
        let idx = self.graph.add_node(node);
        self.node_map.insert(id, idx);
        idx
    }

    fn set_edge(&mut self, tail: NodeIndex, head: NodeIndex, weight: f64, observed_at: Option<Timestamp>) {
        if let Some(data) = self
            .edge_map
            .get(&(tail, head))
            .and_then(|&e| self.graph.edge_weight_mut(e))
        {
            data.weight = weight;
            data.observed_at = observed_at;
            debug!("Overwrote edge {} (weight {:.8})", data.id, weight);
            return;
        }

        let (Some(t), Some(h)) = (self.graph.node_weight(tail), self.graph.node_weight(head)) else {
            return;
        };
        let edge = RateEdge::new(t, h, weight, observed_at);

        debug!("Added edge {} (rate {:.8}, weight {:.8})", edge.id, edge.price(), weight);
        let idx = self.graph.add_edge(tail, head, edge);
        self.edge_map.insert((tail, head), idx);
    }
}

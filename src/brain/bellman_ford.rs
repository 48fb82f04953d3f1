//! Bellman-Ford Negative Cycle Search
//!
//! Step 2.1: The Pathfinder
//!
//! Runs one single-source Bellman-Ford per node and retraces the predecessor
//! chain of any edge that still relaxes after |V|-1 rounds. A relaxation only
//! counts when the improvement is outside a float tolerance, both in the
//! rounds and in the detection scan, so converged markets do not flicker
//! between "cycle" and "no cycle".

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::cartographer::{GraphError, RateGraph};

/// `isclose`-style comparison bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rel: f64,
    pub abs: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { rel: 1e-9, abs: 1e-12 }
    }
}

pub fn is_close(a: f64, b: f64, tol: Tolerance) -> bool {
    if a == b {
        return true;
    }
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= f64::max(tol.rel * f64::max(a.abs(), b.abs()), tol.abs)
}

/// A negative cycle as an ordered list of node ids.
///
/// The closing hop back to `nodes[0]` is implied.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCycle {
    pub nodes: Vec<String>,
    /// Sum of edge weights around the loop (negative)
    pub total_weight: f64,
}

impl RawCycle {
    pub fn hop_count(&self) -> usize {
        self.nodes.len()
    }

    /// Compounded rate around the loop
    pub fn gain(&self) -> f64 {
        (-self.total_weight).exp()
    }

    /// Node ids with the start repeated at the end
    pub fn closed_path(&self) -> Vec<String> {
        let mut path = self.nodes.clone();
        if let Some(first) = self.nodes.first() {
            path.push(first.clone());
        }
        path
    }

    /// Same loop found from a different start gives the same signature.
    /// Direction is kept: the reverse loop is a different trade.
    pub fn signature(&self) -> String {
        let Some(start) = self
            .nodes
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i)
        else {
            return String::new();
        };

        let mut rotated = self.nodes.clone();
        rotated.rotate_left(start);
        rotated.join(">")
    }
}

pub fn format_cycle_path(cycle: &RawCycle) -> String {
    cycle.closed_path().join(" → ")
}

/// Negative cycle detector over a [`RateGraph`]
#[derive(Debug, Clone)]
pub struct CycleDetector {
    tolerance: Tolerance,
    min_hops: usize,
}

impl Default for CycleDetector {
    fn default() -> Self {
        Self::new(Tolerance::default(), 3)
    }
}

impl CycleDetector {
    /// `min_hops` below 3 would let plain A -> B -> A round trips through.
    pub fn new(tolerance: Tolerance, min_hops: usize) -> Self {
        Self {
            tolerance,
            min_hops: min_hops.max(3),
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    pub fn min_hops(&self) -> usize {
        self.min_hops
    }

    /// Single-source search. Returns the first negative cycle found, of any
    /// length, or `None`.
    pub fn bellman_ford(&self, graph: &RateGraph, source: &str) -> Result<Option<RawCycle>, GraphError> {
        let start = graph
            .node_index(source)
            .ok_or_else(|| GraphError::NodeNotFound(source.to_string()))?;
        Ok(self.search(graph, start, 0))
    }

    /// Run Bellman-Ford from every node and collect the distinct cycles of at
    /// least `min_hops` hops.
    pub fn find_all_opportunities(&self, graph: &RateGraph) -> Vec<RawCycle> {
        self.find_all_opportunities_until(graph, &AtomicBool::new(false))
    }

    /// Like [`CycleDetector::find_all_opportunities`], checking `stop` between
    /// sources. A run that has started always completes.
    pub fn find_all_opportunities_until(&self, graph: &RateGraph, stop: &AtomicBool) -> Vec<RawCycle> {
        let mut cycles = Vec::new();
        let mut seen_signatures: HashSet<String> = HashSet::new();
        let sources: Vec<NodeIndex> = graph.node_indices().collect();

        for source in sources {
            if stop.load(Ordering::Relaxed) {
                debug!("Detection pass stopped before source {:?}", source);
                break;
            }

            let Some(cycle) = self.search(graph, source, self.min_hops) else {
                continue;
            };

            if seen_signatures.insert(cycle.signature()) {
                cycles.push(cycle);
            }
        }

        if !cycles.is_empty() {
            info!("Found {} unique negative cycles", cycles.len());
        }

        cycles
    }

    fn relaxes(&self, current: f64, candidate: f64) -> bool {
        candidate < current && !is_close(current, candidate, self.tolerance)
    }

    /// Core Bellman-Ford from `source`. Cycles shorter than `min_hops` are
    /// skipped and the scan keeps looking.
    fn search(&self, graph: &RateGraph, source: NodeIndex, min_hops: usize) -> Option<RawCycle> {
        let node_count = graph.node_count();
        if node_count < 2 {
            return None;
        }

        let edges: Vec<(NodeIndex, NodeIndex, f64)> = graph.weighted_edges().collect();

        let mut dist: HashMap<NodeIndex, f64> = graph.node_indices().map(|n| (n, f64::INFINITY)).collect();
        let mut pred: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        dist.insert(source, 0.0);

        for _ in 0..node_count - 1 {
            if !self.relax_round(&edges, &mut dist, &mut pred, |_| {}) {
                break;
            }
        }

        // Detection. The first scan is the classic |V|-th check; further scans
        // only run when every cycle retraced so far was too short or could not
        // be closed, and they stop as soon as nothing relaxes.
        let mut tried: HashSet<String> = HashSet::new();
        for _ in 0..node_count {
            let mut relaxed_nodes = Vec::new();
            let relaxed = self.relax_round(&edges, &mut dist, &mut pred, |v| relaxed_nodes.push(v));
            if !relaxed {
                return None;
            }

            let all_nodes = graph.node_indices();
            for v in relaxed_nodes.into_iter().chain(all_nodes) {
                let Some(nodes) = retrace_negative_loop(&pred, v) else {
                    continue;
                };
                let Some(cycle) = self.build_cycle(graph, &nodes) else {
                    continue;
                };
                if cycle.hop_count() >= min_hops {
                    return Some(cycle);
                }
                if tried.insert(cycle.signature()) {
                    debug!("Skipping {}-hop cycle {}", cycle.hop_count(), format_cycle_path(&cycle));
                }
            }
        }

        None
    }

    /// One pass over every edge. Returns whether anything relaxed.
    fn relax_round(
        &self,
        edges: &[(NodeIndex, NodeIndex, f64)],
        dist: &mut HashMap<NodeIndex, f64>,
        pred: &mut HashMap<NodeIndex, NodeIndex>,
        mut on_relax: impl FnMut(NodeIndex),
    ) -> bool {
        let mut changed = false;

        for &(u, v, w) in edges {
            let du = dist.get(&u).copied().unwrap_or(f64::INFINITY);
            if !du.is_finite() {
                continue;
            }
            let dv = dist.get(&v).copied().unwrap_or(f64::INFINITY);
            let candidate = du + w;

            if self.relaxes(dv, candidate) {
                dist.insert(v, candidate);
                pred.insert(v, u);
                on_relax(v);
                changed = true;
            }
        }

        changed
    }

    /// Resolve ids and verify the loop really is negative
    fn build_cycle(&self, graph: &RateGraph, nodes: &[NodeIndex]) -> Option<RawCycle> {
        let mut total_weight = 0.0;
        for (i, &tail) in nodes.iter().enumerate() {
            let head = nodes[(i + 1) % nodes.len()];
            total_weight += graph.weight_between(tail, head)?;
        }

        if total_weight >= 0.0 || is_close(total_weight, 0.0, self.tolerance) {
            return None;
        }

        let mut ids = nodes
            .iter()
            .map(|&n| graph.node(n).map(|node| node.id().to_string()))
            .collect::<Option<Vec<_>>>()?;

        // Start at the smallest id so a loop reads the same whichever node
        // the retrace entered it from
        if let Some(start) = ids.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) {
            ids.rotate_left(start);
        }

        Some(RawCycle {
            nodes: ids,
            total_weight,
        })
    }
}

/// Follow predecessors from `start` until a node repeats, keep the loop and
/// put it in traversal order starting from the repeated node.
fn retrace_negative_loop(pred: &HashMap<NodeIndex, NodeIndex>, start: NodeIndex) -> Option<Vec<NodeIndex>> {
    let mut walk: Vec<NodeIndex> = Vec::new();
    let mut position: HashMap<NodeIndex, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&first) = position.get(&current) {
            let mut cycle = walk.split_off(first);
            cycle.reverse();
            cycle.rotate_right(1);
            return Some(cycle);
        }
        position.insert(current, walk.len());
        walk.push(current);
        current = *pred.get(&current)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn fixture_graph() -> RateGraph {
        let mut graph = RateGraph::new();
        for (pair, price) in [
            ("ETH/BTC", 0.01),
            ("ETH/USD", 1.00),
            ("LTC/USD", 1.00),
            ("BTC/MON", 1.00),
            ("MON/LTC", 1.00),
        ] {
            let (base, quote) = pair.split_once('/').unwrap();
            assert_ok!(graph.add_pair(base, quote, "synthetic", price, 0.0, None));
        }
        graph
    }

    fn triangle(eth_usd: f64, fee: f64) -> RateGraph {
        let mut graph = RateGraph::new();
        assert_ok!(graph.add_pair("ETH", "BTC", "gemini", 0.05, fee, None));
        assert_ok!(graph.add_pair("BTC", "USD", "gemini", 20000.0, fee, None));
        assert_ok!(graph.add_pair("ETH", "USD", "gemini", eth_usd, fee, None));
        graph
    }

    #[test]
    fn test_is_close() {
        let tol = Tolerance::default();
        assert!(is_close(1.0, 1.0 + 1e-12, tol));
        assert!(!is_close(1.0, 1.001, tol));
        assert!(is_close(0.0, 1e-13, tol));
        assert!(!is_close(f64::INFINITY, 1.0, tol));
        assert!(is_close(f64::INFINITY, f64::INFINITY, tol));
    }

    #[test]
    fn test_known_arbitrage_fixture() {
        let graph = fixture_graph();
        let cycles = CycleDetector::default().find_all_opportunities(&graph);

        assert!(!cycles.is_empty());
        let cycle = &cycles[0];
        assert!(cycle.hop_count() > 2);
        assert_eq!(cycle.hop_count(), 5);
        assert!((cycle.gain() - 100.0).abs() < 1e-6);
        for id in ["ETH_synthetic", "BTC_synthetic", "MON_synthetic", "LTC_synthetic", "USD_synthetic"] {
            assert!(cycle.nodes.contains(&id.to_string()));
        }
    }

    #[test]
    fn test_cycle_is_in_traversal_order() {
        let graph = fixture_graph();
        let cycles = CycleDetector::default().find_all_opportunities(&graph);

        for cycle in &cycles {
            let path = cycle.closed_path();
            let mut product = 1.0;
            for hop in path.windows(2) {
                product *= graph.get_edge_price(&hop[0], &hop[1]).unwrap();
            }
            assert!((product - cycle.gain()).abs() < 1e-6);
            assert!(product > 1.0);
        }
    }

    #[test]
    fn test_no_cycle_on_tree() {
        let mut graph = RateGraph::new();
        assert_ok!(graph.add_pair("A", "B", "x", 0.5, 0.0, None));
        assert_ok!(graph.add_pair("B", "C", "x", 3.0, 0.0, None));
        assert_ok!(graph.add_pair("C", "D", "x", 7.0, -0.001, None));

        let detector = CycleDetector::default();
        for id in graph.node_ids() {
            assert_eq!(detector.bellman_ford(&graph, &id).unwrap(), None, "source {}", id);
        }
        assert!(detector.find_all_opportunities(&graph).is_empty());
    }

    #[test]
    fn test_consistent_triangle_has_no_cycle() {
        // 0.05 * 20000 == 1000: prices agree, only float noise remains
        let graph = triangle(1000.0, 0.0);
        let detector = CycleDetector::default();
        assert!(detector.find_all_opportunities(&graph).is_empty());
        for id in graph.node_ids() {
            assert_eq!(detector.bellman_ford(&graph, &id).unwrap(), None);
        }
    }

    #[test]
    fn test_mispriced_triangle() {
        let graph = triangle(1100.0, 0.0);
        let cycles = CycleDetector::default().find_all_opportunities(&graph);

        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.hop_count(), 3);
        assert!((cycle.gain() - 1.1).abs() < 1e-9);

        // ETH is sold for USD directly, never bought with it
        let path = cycle.closed_path();
        let eth = path.iter().position(|n| n == "ETH_gemini").unwrap();
        assert_eq!(path[eth + 1], "USD_gemini");
    }

    #[test]
    fn test_cycle_starts_at_smallest_id() {
        let mut graph = triangle(1100.0, 0.0);
        let detector = CycleDetector::default();

        for (base, quote, price) in [("DOGE", "USD", 0.1), ("ADA", "ETH", 0.0005), ("ZZZ", "BTC", 3.0), ("AAA", "USD", 2.0)] {
            assert_ok!(graph.add_pair(base, quote, "gemini", price, 0.0, None));

            for id in graph.node_ids() {
                if let Some(cycle) = detector.bellman_ford(&graph, &id).unwrap() {
                    let smallest = cycle.nodes.iter().min().unwrap();
                    assert_eq!(&cycle.nodes[0], smallest, "source {}", id);
                }
            }

            let cycles = detector.find_all_opportunities(&graph);
            assert_eq!(cycles.len(), 1);
            assert_eq!(cycles[0].nodes, vec!["BTC_gemini", "ETH_gemini", "USD_gemini"]);
        }
    }

    #[test]
    fn test_fees_can_kill_an_opportunity() {
        // 1% edge, 0.5% deducted on each of three legs leaves ~-0.5%
        let graph = triangle(1010.0, -0.005);
        assert!(CycleDetector::default().find_all_opportunities(&graph).is_empty());
    }

    #[test]
    fn test_round_trip_cycles_are_discarded() {
        // A positive fee inflates both directions, so every pair is a 2-hop
        // "cycle". Only the real triangle should come out.
        let graph = triangle(1100.0, 0.001);
        let cycles = CycleDetector::default().find_all_opportunities(&graph);
        assert!(!cycles.is_empty());
        assert!(cycles.iter().all(|c| c.hop_count() >= 3));
    }

    #[test]
    fn test_bellman_ford_reports_short_cycles() {
        let graph = triangle(1000.0, 0.001);
        let found = CycleDetector::default()
            .bellman_ford(&graph, "ETH_gemini")
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_empty_and_single_pair_graphs() {
        let detector = CycleDetector::default();
        let graph = RateGraph::new();
        assert!(detector.find_all_opportunities(&graph).is_empty());

        let mut graph = RateGraph::new();
        assert_ok!(graph.add_pair("A", "B", "x", 2.0, 0.0, None));
        assert_eq!(detector.bellman_ford(&graph, "A_x").unwrap(), None);
    }

    #[test]
    fn test_unknown_source() {
        let graph = triangle(1000.0, 0.0);
        let err = CycleDetector::default().bellman_ford(&graph, "DOGE_gemini");
        assert_eq!(err, Err(GraphError::NodeNotFound("DOGE_gemini".into())));
    }

    #[test]
    fn test_stop_flag_halts_between_sources() {
        let graph = fixture_graph();
        let stop = AtomicBool::new(true);
        assert!(CycleDetector::default()
            .find_all_opportunities_until(&graph, &stop)
            .is_empty());
    }

    #[test]
    fn test_signature_ignores_rotation() {
        let a = RawCycle {
            nodes: vec!["B".into(), "C".into(), "A".into()],
            total_weight: -0.1,
        };
        let b = RawCycle {
            nodes: vec!["A".into(), "B".into(), "C".into()],
            total_weight: -0.1,
        };
        let reversed = RawCycle {
            nodes: vec!["A".into(), "C".into(), "B".into()],
            total_weight: -0.1,
        };
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), reversed.signature());
        assert_eq!(format_cycle_path(&b), "A → B → C → A");
    }

    #[test]
    fn test_retrace_order() {
        // pred: 1 <- 0, 2 <- 1, 0 <- 2 means edges 0->1->2->0
        let n = |i: usize| -> NodeIndex { NodeIndex::new(i) };
        let pred: HashMap<_, _> = [(n(1), n(0)), (n(2), n(1)), (n(0), n(2))].into_iter().collect();
        let cycle = retrace_negative_loop(&pred, n(1)).unwrap();
        assert_eq!(cycle, vec![n(1), n(2), n(0)]);

        let chain: HashMap<_, _> = [(n(1), n(0))].into_iter().collect();
        assert_eq!(retrace_negative_loop(&chain, n(1)), None);
    }
}

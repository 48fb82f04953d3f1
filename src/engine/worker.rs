//! Graph Worker
//!
//! One task owns the graph and is the only writer. Producers talk to it
//! through a bounded channel; readers get snapshots on request or follow the
//! ranked queue through a watch channel.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::UpdateCoalescer;
use crate::brain::{CycleDetector, Opportunity, OpportunityTracker};
use crate::cartographer::{FeeSchedule, GraphSnapshot, RateGraph, RateUpdate, Timestamp};
use crate::config::{Config, OpportunityLog};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("graph worker has stopped")]
    WorkerStopped,
}

/// Requests accepted by the worker
#[derive(Debug)]
pub enum WorkerMessage {
    Update(RateUpdate),
    Snapshot(oneshot::Sender<GraphSnapshot>),
    Opportunities(oneshot::Sender<Vec<Opportunity>>),
}

/// Counters returned when the worker exits
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub updates_received: u64,
    pub updates_coalesced: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub passes: u64,
    pub cycles_found: u64,
    pub graph_resets: u64,
}

/// Stop switch for a worker. Holds no channel sender, so keeping one alive
/// does not keep the worker alive.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(signal),
        }
    }

    /// Ask the worker to stop without flushing pending ticks
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.signal.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Resolves once [`ShutdownHandle::shutdown`] has been called
    pub async fn stopped(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so this only ends when the flag is set
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Cloneable client of a running [`GraphWorker`]
#[derive(Debug, Clone)]
pub struct GraphHandle {
    tx: mpsc::Sender<WorkerMessage>,
    ranked: watch::Receiver<Vec<Opportunity>>,
    shutdown: ShutdownHandle,
}

impl GraphHandle {
    /// Queue a tick. Waits when the channel is full.
    pub async fn send_update(&self, update: RateUpdate) -> Result<(), EngineError> {
        self.tx
            .send(WorkerMessage::Update(update))
            .await
            .map_err(|_| EngineError::WorkerStopped)
    }

    /// Graph state after every tick sent before this call
    pub async fn snapshot(&self) -> Result<GraphSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Snapshot(reply))
            .await
            .map_err(|_| EngineError::WorkerStopped)?;
        rx.await.map_err(|_| EngineError::WorkerStopped)
    }

    /// Ranked queue after every tick sent before this call
    pub async fn opportunities(&self) -> Result<Vec<Opportunity>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Opportunities(reply))
            .await
            .map_err(|_| EngineError::WorkerStopped)?;
        rx.await.map_err(|_| EngineError::WorkerStopped)
    }

    /// Follow the ranked queue as each pass publishes it
    pub fn subscribe(&self) -> watch::Receiver<Vec<Opportunity>> {
        self.ranked.clone()
    }

    /// Ask the worker to stop without flushing pending ticks
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_stopped()
    }

    /// Stop switch for signal handlers and other tasks that must not keep
    /// the worker's channel open
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}

/// Single writer over one [`RateGraph`]
pub struct GraphWorker {
    graph: RateGraph,
    detector: CycleDetector,
    tracker: OpportunityTracker,
    fees: FeeSchedule,
    venue: String,
    opportunity_log: Option<PathBuf>,

    rx: mpsc::Receiver<WorkerMessage>,
    ranked: watch::Sender<Vec<Opportunity>>,
    shutdown: ShutdownHandle,

    coalescer: UpdateCoalescer,
    stats: EngineStats,
}

impl GraphWorker {
    pub fn new(config: &Config) -> (Self, GraphHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (ranked_tx, ranked_rx) = watch::channel(Vec::new());
        let shutdown = ShutdownHandle::new();

        let worker = Self {
            graph: RateGraph::new(),
            detector: CycleDetector::new(config.tolerance(), config.min_cycle_hops),
            tracker: OpportunityTracker::new(config.expire_time_ms, config.min_gain),
            fees: config.fee_schedule(),
            venue: config.venue.clone(),
            opportunity_log: config.opportunity_log_path.as_ref().map(PathBuf::from),
            rx,
            ranked: ranked_tx,
            shutdown: shutdown.clone(),
            coalescer: UpdateCoalescer::new(),
            stats: EngineStats::default(),
        };

        let handle = GraphHandle {
            tx,
            ranked: ranked_rx,
            shutdown,
        };

        (worker, handle)
    }

    /// Build a worker and run it on the tokio runtime
    pub fn spawn(config: &Config) -> (GraphHandle, JoinHandle<EngineStats>) {
        let (worker, handle) = Self::new(config);
        let task = tokio::spawn(worker.run());
        (handle, task)
    }

    /// Serve messages until every handle is dropped or a stop is requested
    pub async fn run(mut self) -> EngineStats {
        info!("Graph worker started (venue: {})", self.venue);

        loop {
            if self.shutdown.is_stopped() {
                info!("Stop requested, leaving {} ticks unapplied", self.coalescer.len());
                break;
            }

            let msg = tokio::select! {
                msg = self.rx.recv() => msg,
                _ = self.shutdown.stopped() => continue,
            };

            let Some(msg) = msg else {
                if !self.coalescer.is_empty() {
                    self.run_pass(now_ms());
                }
                debug!("All handles dropped");
                break;
            };
            self.handle_message(msg);

            // Fold whatever queued up behind it into one pass
            while let Ok(msg) = self.rx.try_recv() {
                self.handle_message(msg);
            }

            if !self.coalescer.is_empty() && !self.shutdown.is_stopped() {
                self.run_pass(now_ms());
            }
        }

        self.stats.updates_coalesced = self.coalescer.replaced();
        info!(
            "Graph worker stopped: {} passes, {} ticks applied, {} rejected, {} cycles",
            self.stats.passes,
            self.stats.updates_applied,
            self.stats.updates_rejected,
            self.stats.cycles_found
        );
        self.stats
    }

    fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Update(update) => self.queue_update(update),
            WorkerMessage::Snapshot(reply) => {
                self.flush();
                if reply.send(self.graph.snapshot()).is_err() {
                    debug!("Snapshot requester went away");
                }
            }
            WorkerMessage::Opportunities(reply) => {
                self.flush();
                if reply.send(self.tracker.queue().to_vec()).is_err() {
                    debug!("Opportunity requester went away");
                }
            }
        }
    }

    pub fn queue_update(&mut self, update: RateUpdate) {
        self.stats.updates_received += 1;
        self.coalescer.push(update);
    }

    fn flush(&mut self) {
        if !self.coalescer.is_empty() {
            self.run_pass(now_ms());
        }
    }

    /// Apply pending ticks, detect, merge and publish
    pub fn run_pass(&mut self, now: Timestamp) {
        let start = Instant::now();

        for update in self.coalescer.drain() {
            let fee = self.fees.resolve(&update);
            match self.graph.apply_update(&update, fee) {
                Ok(()) => self.stats.updates_applied += 1,
                Err(e) => {
                    self.stats.updates_rejected += 1;
                    warn!("Rejected {} {}: {}", update.exchange, update.pair(), e);
                }
            }
        }

        if let Err(e) = self.graph.check_consistency() {
            error!("{} - resetting graph", e);
            self.graph.clear();
            self.stats.graph_resets += 1;
        }

        let cycles = self.detector.find_all_opportunities_until(&self.graph, &self.shutdown.stop);
        self.stats.cycles_found += cycles.len() as u64;

        let merged = self.tracker.handle_cycles(cycles, &self.graph, &self.venue, now);
        if let Some(path) = &self.opportunity_log {
            for op in merged.iter().filter(|op| op.refreshes == 0) {
                if let Err(e) = OpportunityLog::from_opportunity(op).append_to_file(path) {
                    warn!("Failed to log opportunity: {}", e);
                }
            }
        }

        self.tracker.purge_expired(now);
        self.tracker.sort();
        self.ranked.send_replace(self.tracker.queue().to_vec());

        self.stats.passes += 1;
        debug!(
            "Pass {} done in {:?}: {} nodes, {} edges, {} live opportunities",
            self.stats.passes,
            start.elapsed(),
            self.graph.node_count(),
            self.graph.len(),
            self.tracker.len()
        );
    }

    pub fn graph(&self) -> &RateGraph {
        &self.graph
    }

    pub fn tracker(&self) -> &OpportunityTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mispriced_triangle() -> Vec<RateUpdate> {
        vec![
            RateUpdate::new("gemini", "ETH", "BTC", 0.05, None),
            RateUpdate::new("gemini", "BTC", "USD", 20000.0, None),
            RateUpdate::new("gemini", "ETH", "USD", 1100.0, None),
        ]
    }

    #[test]
    fn test_pass_finds_and_expires_opportunity() {
        let (mut worker, handle) = GraphWorker::new(&Config::default());
        let ranked = handle.subscribe();

        for update in mispriced_triangle() {
            worker.queue_update(update);
        }
        worker.run_pass(1_000);

        assert_eq!(worker.graph().len(), 6);
        assert_eq!(worker.tracker().len(), 1);
        let op = &worker.tracker().queue()[0];
        assert!((op.gain - 1.1).abs() < 1e-9);
        assert_eq!(op.venue, "all");
        assert_eq!(ranked.borrow().len(), 1);

        // Seen again: refreshed, not duplicated
        worker.run_pass(2_000);
        assert_eq!(worker.tracker().len(), 1);
        assert_eq!(worker.tracker().queue()[0].updated_at, 2_000);
        assert_eq!(worker.tracker().queue()[0].discovered_at, 1_000);

        // Price corrected: the old record lingers until it expires
        worker.queue_update(RateUpdate::new("gemini", "ETH", "USD", 1000.0, None));
        worker.run_pass(3_000);
        assert_eq!(worker.tracker().len(), 1);
        worker.run_pass(2_000 + 20_001);
        assert!(worker.tracker().is_empty());
        assert!(ranked.borrow().is_empty());

        let stats = worker.stats();
        assert_eq!(stats.updates_applied, 4);
        assert_eq!(stats.passes, 4);
        assert_eq!(stats.cycles_found, 2);
    }

    #[test]
    fn test_bad_ticks_are_counted_not_fatal() {
        let (mut worker, _handle) = GraphWorker::new(&Config::default());
        worker.queue_update(RateUpdate::new("gemini", "ETH", "BTC", 0.0, None));
        worker.queue_update(RateUpdate::new("gemini", "ETH", "ETH", 1.0, None));
        worker.queue_update(RateUpdate::new("gemini", "BTC", "USD", 20000.0, None));
        worker.run_pass(0);

        assert_eq!(worker.stats().updates_rejected, 2);
        assert_eq!(worker.stats().updates_applied, 1);
        assert_eq!(worker.graph().len(), 2);
    }

    #[test]
    fn test_fee_schedule_applies_per_exchange() {
        let mut config = Config::default();
        config.exchange_fees.insert("gemini".to_string(), -0.05);
        let (mut worker, _handle) = GraphWorker::new(&config);

        for update in mispriced_triangle() {
            worker.queue_update(update);
        }
        worker.run_pass(0);

        // 1.1 * 0.95^3 < 1
        assert!(worker.tracker().is_empty());
        let price = worker.graph().get_edge_price("ETH_gemini", "BTC_gemini").unwrap();
        assert!((price - 0.05 * 0.95).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (handle, task) = GraphWorker::spawn(&Config::default());

        for update in mispriced_triangle() {
            handle.send_update(update).await.unwrap();
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes, vec!["BTC_gemini", "ETH_gemini", "USD_gemini"]);
        assert_eq!(snapshot.edges.len(), 6);

        let ops = handle.opportunities().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].hop_count(), 3);
        assert_eq!(handle.subscribe().borrow().len(), 1);

        drop(handle);
        let stats = task.await.unwrap();
        assert_eq!(stats.updates_received, 3);
        assert_eq!(stats.updates_applied, 3);
    }

    #[tokio::test]
    async fn test_later_tick_wins() {
        let (handle, task) = GraphWorker::spawn(&Config::default());

        handle.send_update(RateUpdate::new("kraken", "ETH", "BTC", 0.05, None)).await.unwrap();
        handle.send_update(RateUpdate::new("kraken", "ETH", "BTC", 0.08, None)).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        let edge = snapshot
            .edges
            .iter()
            .find(|e| e.from == "ETH_kraken" && e.to == "BTC_kraken")
            .unwrap();
        assert!((edge.price - 0.08).abs() < 1e-12);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_exits_when_only_shutdown_handle_remains() {
        let (handle, task) = GraphWorker::spawn(&Config::default());
        let stopper = handle.shutdown_handle();

        for update in mispriced_triangle() {
            handle.send_update(update).await.unwrap();
        }
        drop(handle);

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should exit once every GraphHandle is dropped")
            .unwrap();
        assert_eq!(stats.updates_applied, 3);
        assert!(!stopper.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_shutdown() {
        let (handle, task) = GraphWorker::spawn(&Config::default());
        let waiter = handle.shutdown_handle();
        let stopper = handle.shutdown_handle();

        let wait = tokio::spawn(async move { waiter.stopped().await });
        stopper.shutdown();

        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap().unwrap();
        // Already stopped: returns straight away
        tokio::time::timeout(Duration::from_secs(5), stopper.stopped()).await.unwrap();

        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (handle, task) = GraphWorker::spawn(&Config::default());
        let other = handle.clone();

        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.passes, 0);

        assert!(other.is_stopped());
        assert_eq!(other.snapshot().await, Err(EngineError::WorkerStopped));
    }
}

//! Update coalescing
//!
//! Between detection passes many ticks can arrive for the same pair. Only the
//! most recent one matters, so pending ticks are folded into one slot per
//! exchange and directed pair before the graph is touched.

use std::collections::HashMap;

use crate::cartographer::RateUpdate;

type PairKey = (String, String, String);

/// Last-value-wins buffer of pending ticks
#[derive(Debug, Default)]
pub struct UpdateCoalescer {
    pending: HashMap<PairKey, (u64, RateUpdate)>,
    seq: u64,
    replaced: u64,
}

impl UpdateCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: RateUpdate) {
        let key = (update.exchange.clone(), update.base.clone(), update.quote.clone());
        self.seq += 1;
        if self.pending.insert(key, (self.seq, update)).is_some() {
            self.replaced += 1;
        }
    }

    /// Take the pending ticks in order of their latest arrival.
    ///
    /// ETH/BTC and BTC/ETH on one exchange write the same two edges, so the
    /// order still matters after folding.
    pub fn drain(&mut self) -> Vec<RateUpdate> {
        let mut pending: Vec<(u64, RateUpdate)> = self.pending.drain().map(|(_, v)| v).collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, update)| update).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ticks dropped because a newer one for the same slot arrived
    pub fn replaced(&self) -> u64 {
        self.replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_value_wins() {
        let mut coalescer = UpdateCoalescer::new();
        coalescer.push(RateUpdate::new("gemini", "ETH", "BTC", 0.05, Some(1)));
        coalescer.push(RateUpdate::new("gemini", "ETH", "BTC", 0.06, Some(2)));
        coalescer.push(RateUpdate::new("kraken", "ETH", "BTC", 0.07, Some(3)));

        assert_eq!(coalescer.len(), 2);
        assert_eq!(coalescer.replaced(), 1);

        let drained = coalescer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].price, 0.06);
        assert_eq!(drained[1].exchange, "kraken");
        assert!(coalescer.is_empty());
    }

    #[test]
    fn test_directions_are_separate_slots_in_arrival_order() {
        let mut coalescer = UpdateCoalescer::new();
        coalescer.push(RateUpdate::new("gemini", "ETH", "BTC", 0.05, None));
        coalescer.push(RateUpdate::new("gemini", "BTC", "ETH", 21.0, None));
        coalescer.push(RateUpdate::new("gemini", "ETH", "BTC", 0.04, None));

        let drained = coalescer.drain();
        assert_eq!(drained.len(), 2);
        // The refreshed ETH/BTC moved behind BTC/ETH
        assert_eq!(drained[0].base, "BTC");
        assert_eq!(drained[1].base, "ETH");
        assert_eq!(drained[1].price, 0.04);
    }
}

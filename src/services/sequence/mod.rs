//! Sequence Oracle
//!
//! Per-symbol monotonically increasing sequence numbers for published trades.
//! Subscribers detect backpressure drops by gaps in the sequence.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Default)]
pub struct SequenceOracle {
    counters: DashMap<String, AtomicU64>,
}

impl SequenceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence for a symbol; the first call returns 1.
    pub fn next(&self, symbol: &str) -> u64 {
        if let Some(counter) = self.counters.get(symbol) {
            return counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.counters
            .entry(symbol.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sequences_start_at_one_per_symbol() {
        let oracle = SequenceOracle::new();
        assert_eq!(oracle.next("AUSD"), 1);
        assert_eq!(oracle.next("AUSD"), 2);
        assert_eq!(oracle.next("BUSD"), 1);
        assert_eq!(oracle.next("AUSD"), 3);
    }

    #[test]
    fn concurrent_callers_never_skip_or_repeat() {
        let oracle = Arc::new(SequenceOracle::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let oracle = Arc::clone(&oracle);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| oracle.next("AUSD")).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=8000).collect::<Vec<_>>());
    }
}

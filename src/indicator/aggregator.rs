//! Per-(user, symbol) result aggregation for one K-line tick.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;

use crate::domain::IndicatorResult;

#[derive(Debug)]
struct Slot {
    /// Close time of the candle this slot is collecting for.
    tick: i64,
    expected: BTreeSet<String>,
    results: BTreeMap<String, IndicatorResult>,
}

impl Slot {
    fn new(tick: i64, expected: BTreeSet<String>) -> Self {
        Self { tick, expected, results: BTreeMap::new() }
    }

    fn is_complete(&self) -> bool {
        self.expected.iter().all(|name| self.results.contains_key(name))
    }
}

/// Collects per-indicator results until every registered indicator has
/// deposited for the current tick, then releases the full map exactly
/// once. Keys are sharded, so concurrent deposits for different
/// (user, symbol) pairs never contend.
#[derive(Default)]
pub struct Aggregator {
    slots: DashMap<(String, String), Slot>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit one result. Returns the completed map when this deposit
    /// was the last one expected for the tick.
    pub fn deposit(
        &self,
        user_id: &str,
        symbol: &str,
        tick: i64,
        expected: &BTreeSet<String>,
        name: &str,
        result: IndicatorResult,
    ) -> Option<BTreeMap<String, IndicatorResult>> {
        let key = (user_id.to_string(), symbol.to_string());
        let mut slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(tick, expected.clone()));

        // A newer candle invalidates anything still pending.
        if slot.tick != tick {
            *slot = Slot::new(tick, expected.clone());
        }
        slot.results.insert(name.to_string(), result);

        if !slot.is_complete() {
            return None;
        }
        let results = std::mem::take(&mut slot.results);
        drop(slot);
        self.slots.remove(&key);
        Some(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Signal;
    use serde_json::json;

    fn result(signal: Signal) -> IndicatorResult {
        IndicatorResult { signal, data: json!({}) }
    }

    fn expected(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn completes_exactly_once_when_all_deposit() {
        let agg = Aggregator::new();
        let exp = expected(&["ma", "rsi"]);
        assert!(agg.deposit("u1", "XRP", 1, &exp, "ma", result(Signal::Long)).is_none());
        let done = agg
            .deposit("u1", "XRP", 1, &exp, "rsi", result(Signal::Long))
            .expect("second deposit completes the tick");
        assert_eq!(done.len(), 2);
        assert!(done.contains_key("ma") && done.contains_key("rsi"));

        // The slot is cleared; the next tick starts fresh.
        assert!(agg.deposit("u1", "XRP", 2, &exp, "ma", result(Signal::None)).is_none());
    }

    #[test]
    fn stale_tick_results_are_discarded() {
        let agg = Aggregator::new();
        let exp = expected(&["ma", "rsi"]);
        assert!(agg.deposit("u1", "XRP", 1, &exp, "ma", result(Signal::Long)).is_none());
        // Candle 2 arrives before rsi reported for candle 1.
        assert!(agg.deposit("u1", "XRP", 2, &exp, "ma", result(Signal::Short)).is_none());
        let done = agg
            .deposit("u1", "XRP", 2, &exp, "rsi", result(Signal::Short))
            .expect("tick 2 completes");
        assert_eq!(done["ma"].signal, Signal::Short);
    }

    #[test]
    fn duplicate_deposit_does_not_double_complete() {
        let agg = Aggregator::new();
        let exp = expected(&["ma", "rsi"]);
        assert!(agg.deposit("u1", "XRP", 1, &exp, "ma", result(Signal::Long)).is_none());
        assert!(agg.deposit("u1", "XRP", 1, &exp, "ma", result(Signal::Long)).is_none());
        assert!(agg.deposit("u1", "XRP", 1, &exp, "rsi", result(Signal::Long)).is_some());
    }

    #[test]
    fn keys_are_independent() {
        let agg = Aggregator::new();
        let exp = expected(&["ma"]);
        assert!(agg.deposit("u1", "XRP", 1, &exp, "ma", result(Signal::Long)).is_some());
        assert!(agg.deposit("u2", "XRP", 1, &exp, "ma", result(Signal::Long)).is_some());
        assert!(agg.deposit("u1", "BTC", 1, &exp, "ma", result(Signal::Long)).is_some());
    }
}

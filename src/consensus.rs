use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{CandidateSignal, GroupKey, Position};

/// Rolling per-(market, outcome, direction) grouping of observed positions.
///
/// Groups shrink as members age out of the window; eviction happens lazily
/// on every access, never from a background task. Groups have no terminal
/// state — an empty group is simply dropped during evaluation.
pub struct ConsensusDetector {
    window: Duration,
    min_consensus: usize,
    groups: HashMap<GroupKey, Vec<Position>>,
}

impl ConsensusDetector {
    pub fn new(window: Duration, min_consensus: usize) -> Self {
        Self {
            window,
            min_consensus,
            groups: HashMap::new(),
        }
    }

    /// Insert a position into its group, evicting stale members first.
    /// Members are kept ordered by observation time.
    pub fn ingest(&mut self, position: Position, now: DateTime<Utc>) {
        let key = GroupKey {
            market: position.market.clone(),
            outcome: position.outcome,
            direction: position.direction,
        };
        let members = self.groups.entry(key).or_default();
        evict(members, now, self.window);
        let at = members
            .partition_point(|m| m.observed_at <= position.observed_at);
        members.insert(at, position);
    }

    /// Return one candidate signal per group whose distinct-wallet count
    /// meets the consensus threshold, computed over the current
    /// (already-evicted) member set only. Empty groups are dropped.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<CandidateSignal> {
        let mut signals = Vec::new();

        self.groups.retain(|key, members| {
            evict(members, now, self.window);
            if members.is_empty() {
                return false;
            }

            // Distinct wallets in order of first appearance, each with the
            // entry price of its first trade in the window.
            let mut wallets: Vec<String> = Vec::new();
            let mut entry_prices: Vec<Decimal> = Vec::new();
            for member in members.iter() {
                if !wallets.contains(&member.wallet) {
                    wallets.push(member.wallet.clone());
                    entry_prices.push(member.price);
                }
            }

            if wallets.len() >= self.min_consensus {
                let total_usd: Decimal = members.iter().map(|m| m.usd).sum();
                let priced: Vec<Decimal> = entry_prices
                    .iter()
                    .copied()
                    .filter(|p| *p > Decimal::ZERO)
                    .collect();
                let avg_price = if priced.is_empty() {
                    Decimal::ZERO
                } else {
                    priced.iter().copied().sum::<Decimal>() / Decimal::from(priced.len())
                };
                debug!(
                    "consensus reached for {key}: {} wallets, {} trades in window",
                    wallets.len(),
                    members.len(),
                );
                signals.push(CandidateSignal {
                    key: key.clone(),
                    wallets,
                    total_usd,
                    avg_price,
                    first_seen: members.first().map(|m| m.observed_at).unwrap_or(now),
                    last_seen: members.last().map(|m| m.observed_at).unwrap_or(now),
                    entry_prices,
                });
            }
            true
        });

        signals
    }

    /// Number of live groups, for heartbeat diagnostics.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

fn evict(members: &mut Vec<Position>, now: DateTime<Utc>, window: Duration) {
    members.retain(|m| now - m.observed_at <= window);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn position(
        wallet: &str,
        market: &str,
        outcome: u32,
        direction: Direction,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Position {
        Position {
            wallet: wallet.to_string(),
            market: market.to_string(),
            outcome,
            direction,
            size: dec!(100),
            price,
            usd: dec!(100) * price,
            observed_at,
        }
    }

    fn detector() -> ConsensusDetector {
        ConsensusDetector::new(Duration::minutes(15), 3)
    }

    #[test]
    fn three_wallets_within_window_form_one_signal() {
        let mut det = detector();
        let now = t0() + Duration::minutes(6);
        det.ingest(position("0xa", "m", 1, Direction::Buy, dec!(0.40), t0()), now);
        det.ingest(
            position("0xb", "m", 1, Direction::Buy, dec!(0.42), t0() + Duration::minutes(2)),
            now,
        );
        det.ingest(
            position("0xc", "m", 1, Direction::Buy, dec!(0.44), t0() + Duration::minutes(5)),
            now,
        );

        let signals = det.evaluate(now);
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.wallets.len(), 3);
        assert_eq!(signal.key.market, "m");
        assert_eq!(signal.key.outcome, 1);
        assert_eq!(signal.key.direction, Direction::Buy);
        assert_eq!(signal.avg_price, dec!(0.42));
        assert_eq!(signal.total_usd, dec!(126.00));
        assert_eq!(signal.first_seen, t0());
        assert_eq!(signal.last_seen, t0() + Duration::minutes(5));
    }

    #[test]
    fn repeat_trades_from_one_wallet_count_once() {
        let mut det = detector();
        let now = t0();
        for i in 0..5 {
            det.ingest(
                position("0xa", "m", 0, Direction::Buy, dec!(0.5), now - Duration::minutes(i)),
                now,
            );
        }
        det.ingest(position("0xb", "m", 0, Direction::Buy, dec!(0.5), now), now);
        assert!(det.evaluate(now).is_empty());
    }

    #[test]
    fn direction_isolation() {
        // Two buys and one sell on the same outcome never meet a
        // three-wallet threshold on either side.
        let mut det = detector();
        let now = t0();
        det.ingest(position("0xa", "m", 0, Direction::Buy, dec!(0.5), now), now);
        det.ingest(position("0xb", "m", 0, Direction::Buy, dec!(0.5), now), now);
        det.ingest(position("0xc", "m", 0, Direction::Sell, dec!(0.5), now), now);
        assert!(det.evaluate(now).is_empty());
        assert_eq!(det.group_count(), 2);
    }

    #[test]
    fn outcome_isolation() {
        let mut det = detector();
        let now = t0();
        det.ingest(position("0xa", "m", 0, Direction::Buy, dec!(0.5), now), now);
        det.ingest(position("0xb", "m", 1, Direction::Buy, dec!(0.5), now), now);
        det.ingest(position("0xc", "m", 0, Direction::Buy, dec!(0.5), now), now);
        assert!(det.evaluate(now).is_empty());
    }

    #[test]
    fn window_eviction_boundary() {
        let window = Duration::minutes(15);
        let epsilon = Duration::seconds(1);
        let mut det = ConsensusDetector::new(window, 2);
        let now = t0();

        // Just outside the window: must not count.
        det.ingest(
            position("0xa", "m", 0, Direction::Buy, dec!(0.5), now - window - epsilon),
            now,
        );
        det.ingest(position("0xb", "m", 0, Direction::Buy, dec!(0.5), now), now);
        assert!(det.evaluate(now).is_empty());

        // Just inside the window: must count.
        det.ingest(
            position("0xc", "m", 0, Direction::Buy, dec!(0.5), now - window + epsilon),
            now,
        );
        let signals = det.evaluate(now);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].wallets.len(), 2);
    }

    #[test]
    fn empty_groups_are_dropped() {
        let mut det = detector();
        let now = t0();
        det.ingest(position("0xa", "m", 0, Direction::Buy, dec!(0.5), now), now);
        assert_eq!(det.group_count(), 1);
        det.evaluate(now + Duration::minutes(16));
        assert_eq!(det.group_count(), 0);
    }

    #[test]
    fn wallets_ordered_by_first_appearance() {
        let mut det = ConsensusDetector::new(Duration::minutes(15), 2);
        let now = t0();
        det.ingest(
            position("0xb", "m", 0, Direction::Buy, dec!(0.60), now - Duration::minutes(1)),
            now,
        );
        det.ingest(
            position("0xa", "m", 0, Direction::Buy, dec!(0.50), now - Duration::minutes(3)),
            now,
        );
        let signals = det.evaluate(now);
        assert_eq!(signals[0].wallets, vec!["0xa", "0xb"]);
        assert_eq!(signals[0].entry_prices, vec![dec!(0.50), dec!(0.60)]);
    }

    #[test]
    fn separate_markets_yield_separate_signals() {
        let mut det = ConsensusDetector::new(Duration::minutes(15), 2);
        let now = t0();
        for market in ["m1", "m2"] {
            det.ingest(position("0xa", market, 0, Direction::Buy, dec!(0.5), now), now);
            det.ingest(position("0xb", market, 0, Direction::Buy, dec!(0.5), now), now);
        }
        let signals = det.evaluate(now);
        assert_eq!(signals.len(), 2);
    }
}

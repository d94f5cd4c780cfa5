use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use crate::types::{CandidateSignal, Decision, PriceQuote, SuppressReason};

/// Prices within this distance of 0 or 1 mean the outcome has settled.
const RESOLVED_BAND: Decimal = dec!(0.001);

/// Prices at or beyond this band mean the market is effectively decided.
const EXTREME_LOW: Decimal = dec!(0.02);
const EXTREME_HIGH: Decimal = dec!(0.98);

/// How often the same (group, reason) may produce an audit message, in minutes.
const AUDIT_THROTTLE_MIN: i64 = 30;

/// Facts gathered for one gate decision. The orchestrating loop fills
/// these lazily: the quote is only resolved when the lifecycle check
/// passes, and the open check only runs when no quote resolved.
#[derive(Debug, Clone, Default)]
pub struct GateFacts {
    /// Market's scheduled end time, when known.
    pub end_time: Option<DateTime<Utc>>,
    /// Best-available price for the signal's (market, outcome).
    pub quote: Option<PriceQuote>,
    /// Result of the independent open check, when it was performed.
    /// Only `Some(true)` confirms activity.
    pub market_open: Option<bool>,
}

/// Deduplication ledger: at most one live record per dedup key, bounded
/// capacity with FIFO eviction, entries expire after the cooldown.
pub struct AlertLedger {
    capacity: usize,
    cooldown: Duration,
    records: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
}

impl AlertLedger {
    pub fn new(capacity: usize, cooldown: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            cooldown,
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Is there an unexpired record for this key? Expired records are
    /// purged on the way.
    pub fn contains_live(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let Some(sent_at) = self.records.get(key).copied() else {
            return false;
        };
        if now - sent_at <= self.cooldown {
            true
        } else {
            self.remove(key);
            false
        }
    }

    /// Record a dispatch. Re-recording a key refreshes its position;
    /// the oldest record is evicted once the ledger exceeds capacity.
    pub fn record(&mut self, key: &str, now: DateTime<Utc>) {
        if self.records.contains_key(key) {
            self.order.retain(|k| k != key);
        }
        self.records.insert(key.to_string(), now);
        self.order.push_back(key.to_string());
        while self.records.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.records.remove(key);
        self.order.retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-reason suppression counters, reported with the heartbeat.
#[derive(Debug, Default, Clone)]
pub struct SuppressionStats {
    pub emitted: u64,
    pub market_closed: u64,
    pub resolved: u64,
    pub price_extreme: u64,
    pub price_divergence: u64,
    pub duplicate: u64,
}

impl SuppressionStats {
    fn bump(&mut self, reason: SuppressReason) {
        match reason {
            SuppressReason::MarketClosed => self.market_closed += 1,
            SuppressReason::Resolved => self.resolved += 1,
            SuppressReason::PriceExtreme => self.price_extreme += 1,
            SuppressReason::PriceDivergence => self.price_divergence += 1,
            SuppressReason::Duplicate => self.duplicate += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "emitted={} market_closed={} resolved={} price_extreme={} divergence={} duplicate={}",
            self.emitted,
            self.market_closed,
            self.resolved,
            self.price_extreme,
            self.price_divergence,
            self.duplicate,
        )
    }
}

/// Decides whether a candidate signal may be dispatched.
///
/// Checks run in order and short-circuit: market lifecycle, price verdict,
/// entry-price divergence, deduplication. An `Emit` writes the alert
/// record immediately, so evaluating the same unchanged signal twice
/// yields `Emit` then `Suppress(Duplicate)`. Suppressions never write a
/// record — the next cycle re-evaluates them from scratch.
pub struct SuppressionGate {
    ledger: AlertLedger,
    max_entry_divergence: Decimal,
    audit_sent: HashMap<(String, SuppressReason), DateTime<Utc>>,
    pub stats: SuppressionStats,
}

impl SuppressionGate {
    pub fn new(capacity: usize, cooldown: Duration, max_entry_divergence: Decimal) -> Self {
        Self {
            ledger: AlertLedger::new(capacity, cooldown),
            max_entry_divergence,
            audit_sent: HashMap::new(),
            stats: SuppressionStats::default(),
        }
    }

    pub fn decide(
        &mut self,
        signal: &CandidateSignal,
        facts: &GateFacts,
        now: DateTime<Utc>,
    ) -> Decision {
        // 1. Market lifecycle. A missing or unparseable end time never
        //    suppresses on its own.
        if let Some(end_time) = facts.end_time {
            if end_time <= now {
                return self.suppress(signal, SuppressReason::MarketClosed);
            }
        }

        // 2. Price verdict.
        match facts.quote {
            Some(quote) => {
                let price = quote.value;
                if price <= RESOLVED_BAND || price >= Decimal::ONE - RESOLVED_BAND {
                    return self.suppress(signal, SuppressReason::Resolved);
                }
                if price <= EXTREME_LOW || price >= EXTREME_HIGH {
                    return self.suppress(signal, SuppressReason::PriceExtreme);
                }
            }
            None => {
                // Fail-open only when the independent check confirmed the
                // market is still trading.
                if facts.market_open != Some(true) {
                    return self.suppress(signal, SuppressReason::MarketClosed);
                }
            }
        }

        // 3. Entry-price divergence across the first three wallets.
        if self.entry_prices_diverge(signal) {
            return self.suppress(signal, SuppressReason::PriceDivergence);
        }

        // 4. Deduplication.
        let key = signal.dedup_key();
        if self.ledger.contains_live(&key, now) {
            return self.suppress(signal, SuppressReason::Duplicate);
        }
        self.ledger.record(&key, now);
        self.stats.emitted += 1;
        Decision::Emit { price: facts.quote }
    }

    fn suppress(&mut self, signal: &CandidateSignal, reason: SuppressReason) -> Decision {
        self.stats.bump(reason);
        info!(
            "suppressed {} ({} wallets): {}",
            signal.key,
            signal.wallets.len(),
            reason.label(),
        );
        Decision::Suppress(reason)
    }

    /// Wallets acting on the same information enter at similar prices; if
    /// the first three distinct entries spread more than the configured
    /// fraction, this is coincidence, not consensus.
    fn entry_prices_diverge(&self, signal: &CandidateSignal) -> bool {
        let prices: Vec<Decimal> = signal
            .entry_prices
            .iter()
            .copied()
            .filter(|p| *p > Decimal::ZERO)
            .take(3)
            .collect();
        if prices.len() < 3 {
            return false;
        }
        let max = prices.iter().copied().max().unwrap_or_default();
        let min = prices.iter().copied().min().unwrap_or_default();
        if max <= Decimal::ZERO {
            return false;
        }
        (max - min) / max > self.max_entry_divergence
    }

    /// Throttle for audit messages: at most one per (group, reason) per
    /// half hour, so a persistently suppressed group does not spam the
    /// operational channel.
    pub fn should_audit(
        &mut self,
        signal: &CandidateSignal,
        reason: SuppressReason,
        now: DateTime<Utc>,
    ) -> bool {
        // The duplicate reason is pure bookkeeping, never worth a message.
        if reason == SuppressReason::Duplicate {
            return false;
        }
        let key = (signal.key.to_string(), reason);
        match self.audit_sent.get(&key) {
            Some(last) if now - *last < Duration::minutes(AUDIT_THROTTLE_MIN) => false,
            _ => {
                self.audit_sent.insert(key, now);
                true
            }
        }
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }
}

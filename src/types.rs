use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trade direction. Raw trades with any other side token are discarded at
/// extraction and never reach the consensus stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Parse a raw side token ("buy"/"BUY"/"sell"/...). Unknown tokens map
    /// to `None`, not to a default.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("buy") {
            Some(Direction::Buy)
        } else if token.eq_ignore_ascii_case("sell") {
            Some(Direction::Sell)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One raw trade record as returned by the trade feed.
///
/// Field names vary across feed versions (and the fallback providers), so
/// every field is optional and aliased; `extract::extract` is the single
/// place that turns this into a normalized `Position` or rejects it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrade {
    #[serde(
        default,
        alias = "tradeId",
        alias = "transactionHash",
        alias = "txHash"
    )]
    pub id: Option<String>,
    #[serde(default, alias = "conditionId", alias = "marketId")]
    pub market: Option<String>,
    #[serde(default, alias = "outcomeIndex")]
    pub outcome_index: Option<Value>,
    #[serde(default, alias = "direction")]
    pub side: Option<String>,
    /// Share quantity; numeric or string-encoded depending on the source.
    #[serde(default, alias = "quantity", alias = "shares")]
    pub size: Option<Value>,
    #[serde(default)]
    pub price: Option<Value>,
    /// Epoch seconds, epoch milliseconds, or ISO-8601 string.
    #[serde(default, alias = "createdAt")]
    pub timestamp: Option<Value>,
    #[serde(default, alias = "question")]
    pub title: Option<String>,
    #[serde(default, alias = "usdValue", alias = "amountUsd")]
    pub usd: Option<Value>,
}

/// One observed trade, normalized for comparison. Immutable; lives for a
/// single poll cycle and is discarded after grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Wallet address, lowercased so comparison is case-insensitive.
    pub wallet: String,
    pub market: String,
    pub outcome: u32,
    pub direction: Direction,
    /// Share quantity, always > 0.
    pub size: Decimal,
    /// Entry price in [0, 1].
    pub price: Decimal,
    /// USD notional (direct field when the feed provides one, else size * price).
    pub usd: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Grouping key for consensus detection. Direction is part of the key:
/// opposite sides of the same outcome never share a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub market: String,
    pub outcome: u32,
    pub direction: Direction,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.market, self.outcome, self.direction)
    }
}

/// A consensus group that has crossed the wallet threshold. Derived from
/// the group's current (window-filtered) members; not stored across cycles.
#[derive(Debug, Clone)]
pub struct CandidateSignal {
    pub key: GroupKey,
    /// Distinct wallets, ordered by first appearance in the window.
    pub wallets: Vec<String>,
    pub total_usd: Decimal,
    pub avg_price: Decimal,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Each wallet's first entry price within the window, in time order.
    /// Feeds the peer-average price source and the divergence check.
    pub entry_prices: Vec<Decimal>,
}

impl CandidateSignal {
    /// Dedup ledger key. Includes the wallet count so a consensus that
    /// grows (more wallets joining inside the window) can alert again.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.key, self.wallets.len())
    }
}

/// Which source of the resolution chain produced a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    Clob,
    Gamma,
    TradeHistory,
    #[serde(rename = "hashdive")]
    HashDive,
    #[serde(rename = "finfeed")]
    FinFeed,
    PeerAverage,
}

impl PriceSource {
    pub fn label(self) -> &'static str {
        match self {
            PriceSource::Clob => "clob",
            PriceSource::Gamma => "gamma",
            PriceSource::TradeHistory => "trade-history",
            PriceSource::HashDive => "hashdive",
            PriceSource::FinFeed => "finfeed",
            PriceSource::PeerAverage => "peer-average",
        }
    }
}

/// Result of the price resolution chain. Consumed once per gate decision.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PriceQuote {
    pub value: Decimal,
    pub source: PriceSource,
    pub resolved_at: DateTime<Utc>,
}

/// Why a candidate signal was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuppressReason {
    /// Market ended, or activity could not be confirmed with no price.
    MarketClosed,
    /// Outcome already settled (price within 0.001 of 0 or 1).
    Resolved,
    /// Price at or beyond the extreme band (<= 0.02 or >= 0.98).
    PriceExtreme,
    /// Entry prices of the first wallets diverge too far to be one signal.
    PriceDivergence,
    /// An unexpired alert record already exists for the dedup key.
    Duplicate,
}

impl SuppressReason {
    pub fn label(self) -> &'static str {
        match self {
            SuppressReason::MarketClosed => "market-closed",
            SuppressReason::Resolved => "resolved",
            SuppressReason::PriceExtreme => "price-extreme",
            SuppressReason::PriceDivergence => "price-divergence",
            SuppressReason::Duplicate => "duplicate",
        }
    }
}

/// Outcome of the suppression gate for one candidate signal.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Dispatch the alert. `price` is `None` on the fail-open path where no
    /// source resolved but the market was confirmed open.
    Emit { price: Option<PriceQuote> },
    Suppress(SuppressReason),
}

/// Market metadata from the external lookup. Absence of `end_time` must
/// never be read as "closed".
#[derive(Debug, Clone, Default)]
pub struct MarketInfo {
    pub title: String,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome_prices: Option<Vec<Decimal>>,
    pub closed: Option<bool>,
    pub active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parse_tokens() {
        assert_eq!(Direction::parse("BUY"), Some(Direction::Buy));
        assert_eq!(Direction::parse("buy"), Some(Direction::Buy));
        assert_eq!(Direction::parse(" Sell "), Some(Direction::Sell));
        assert_eq!(Direction::parse("MERGE"), None);
        assert_eq!(Direction::parse(""), None);
    }

    #[test]
    fn raw_trade_field_aliases() {
        let json = serde_json::json!({
            "transactionHash": "0xabc",
            "conditionId": "0xmarket",
            "outcomeIndex": 1,
            "side": "BUY",
            "size": "12.5",
            "price": 0.42,
            "timestamp": 1700000000,
            "question": "Will it happen?"
        });
        let raw: RawTrade = serde_json::from_value(json).unwrap();
        assert_eq!(raw.id.as_deref(), Some("0xabc"));
        assert_eq!(raw.market.as_deref(), Some("0xmarket"));
        assert_eq!(raw.title.as_deref(), Some("Will it happen?"));
        assert!(raw.size.is_some());
    }

    #[test]
    fn dedup_key_includes_direction_and_count() {
        let signal = CandidateSignal {
            key: GroupKey {
                market: "0xm".into(),
                outcome: 1,
                direction: Direction::Buy,
            },
            wallets: vec!["0xa".into(), "0xb".into(), "0xc".into()],
            total_usd: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            entry_prices: vec![],
        };
        assert_eq!(signal.dedup_key(), "0xm:1:BUY:3");
    }
}

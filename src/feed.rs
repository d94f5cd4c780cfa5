use std::time::Duration;

use chrono::DateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::debug;

use crate::client::{ClientError, RateLimitedClient};
use crate::config::RateLimitConfig;
use crate::types::{MarketInfo, RawTrade};
use crate::{CLOB_API_BASE, DATA_API_BASE};

/// Trades per page; the feed returns newest-first.
const TRADES_PAGE_SIZE: usize = 50;

/// Trade data moves fast; cache barely longer than a poll interval.
const TRADES_TTL: Duration = Duration::from_secs(5);

/// Market metadata is comparatively static.
const MARKET_TTL: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome prices at these bounds mean the market has settled.
const SETTLED_LOW: Decimal = dec!(0.001);
const SETTLED_HIGH: Decimal = dec!(0.999);

/// Band beyond which a single outcome is effectively decided.
const DECIDED_LOW: Decimal = dec!(0.02);
const DECIDED_HIGH: Decimal = dec!(0.98);

/// Read-only client for the wallet trade feed.
pub struct TradeFeed {
    client: RateLimitedClient,
}

impl TradeFeed {
    pub fn new(limits: &RateLimitConfig) -> Self {
        Self {
            client: RateLimitedClient::new(limits, REQUEST_TIMEOUT, TRADES_TTL),
        }
    }

    /// Fetch the most recent trades for a wallet, newest first.
    pub async fn fetch_trades(&self, wallet: &str) -> Result<Vec<RawTrade>, ClientError> {
        let url = format!("{DATA_API_BASE}/trades");
        let params = [
            ("user", wallet.to_string()),
            ("limit", TRADES_PAGE_SIZE.to_string()),
            ("sort", "timestamp".to_string()),
            ("order", "desc".to_string()),
        ];
        let body = self
            .client
            .get_json(&url, &params, &[], Some(TRADES_TTL))
            .await?;
        let trades = parse_trade_list(body);
        debug!("fetched {} raw trades for {wallet}", trades.len());
        Ok(trades)
    }
}

/// The feed may return a bare array or wrap it in a `trades`/`data` field.
fn parse_trade_list(body: Value) -> Vec<RawTrade> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("trades").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Split a newest-first trade list at the last-seen cursor.
///
/// On first sight of a wallet nothing is processed: the cursor seeds to the
/// newest trade id so history is never replayed. Afterwards, only trades
/// ahead of the cursor are returned, and the newest id becomes the new
/// cursor — the cursor advances monotonically and trades are never
/// reprocessed. Trades without any id are skipped (they cannot be deduped).
pub fn collect_new(trades: &[RawTrade], cursor: Option<&str>) -> (Vec<RawTrade>, Option<String>) {
    let newest_id = trades.iter().find_map(|t| t.id.clone());

    let Some(cursor) = cursor else {
        return (Vec::new(), newest_id);
    };

    let mut fresh = Vec::new();
    for trade in trades {
        let Some(id) = trade.id.as_deref() else {
            continue;
        };
        if id == cursor {
            break;
        }
        fresh.push(trade.clone());
    }

    let next = newest_id.or_else(|| Some(cursor.to_string()));
    (fresh, next)
}

/// Read-only client for market metadata (title, end time, outcome prices).
pub struct MarketClient {
    client: RateLimitedClient,
}

impl MarketClient {
    pub fn new(limits: &RateLimitConfig) -> Self {
        Self {
            client: RateLimitedClient::new(limits, REQUEST_TIMEOUT, MARKET_TTL),
        }
    }

    /// Look up market metadata. Absence of an end time is preserved as
    /// `None` — it must never be read as "closed".
    pub async fn lookup_market(&self, market: &str) -> Result<MarketInfo, ClientError> {
        let url = format!("{CLOB_API_BASE}/markets/{market}");
        let body = self
            .client
            .get_json(&url, &[], &[], Some(MARKET_TTL))
            .await?;
        Ok(parse_market_info(&body))
    }

    /// Independent "is the market still trading" check, used when no price
    /// source resolves. Only `Ok(true)` confirms activity.
    pub async fn is_market_open(&self, market: &str, outcome: u32) -> Result<bool, ClientError> {
        let info = self.lookup_market(market).await?;
        Ok(market_open_from_info(&info, outcome))
    }
}

fn parse_market_info(body: &Value) -> MarketInfo {
    let title = body
        .get("question")
        .or_else(|| body.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let end_time = body
        .get("end_date_iso")
        .or_else(|| body.get("endDate"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    let outcome_prices = body
        .get("tokens")
        .and_then(Value::as_array)
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|token| {
                    token
                        .get("price")
                        .or_else(|| token.get("last_price"))
                        .or_else(|| token.get("mark_price"))
                        .and_then(value_to_decimal)
                })
                .collect::<Vec<_>>()
        })
        .filter(|prices| !prices.is_empty());

    MarketInfo {
        title,
        end_time,
        outcome_prices,
        closed: body.get("closed").and_then(Value::as_bool),
        active: body.get("active").and_then(Value::as_bool),
    }
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        // Via the string form so binary floats don't leak imprecision.
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decide openness from metadata. Live token prices are the most reliable
/// signal and override a stale `closed` flag; an explicit `active = false`
/// is final.
pub fn market_open_from_info(info: &MarketInfo, outcome: u32) -> bool {
    if info.active == Some(false) {
        return false;
    }

    if let Some(prices) = &info.outcome_prices {
        let all_settled = prices
            .iter()
            .all(|p| *p <= SETTLED_LOW || *p >= SETTLED_HIGH);
        if all_settled {
            return false;
        }
        if let Some(price) = prices.get(outcome as usize) {
            if *price <= DECIDED_LOW || *price >= DECIDED_HIGH {
                return false;
            }
        }
        return true;
    }

    info.closed != Some(true)
}

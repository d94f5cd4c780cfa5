use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::debug;

use crate::client::RateLimitedClient;
use crate::config::RateLimitConfig;
use crate::extract;
use crate::types::{PriceQuote, PriceSource};
use crate::{CLOB_API_BASE, DATA_API_BASE, FINFEED_API_BASE, GAMMA_API_BASE, HASHDIVE_API_BASE};

/// Price sources time out fast; the chain has fallbacks.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Quotes are cached only briefly.
const QUOTE_TTL: Duration = Duration::from_secs(10);

/// Trades considered by the history average.
const HISTORY_TRADES: usize = 10;

/// History trades outside this band are not plausible for an active market.
const PLAUSIBLE_LOW: Decimal = dec!(0.001);
const PLAUSIBLE_HIGH: Decimal = dec!(0.999);

/// Credentials for the primary exchange quote endpoint. Optional; the
/// chain skips the step entirely when unconfigured.
#[derive(Debug, Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

impl ClobCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PM_API_KEY").ok()?.trim().to_string();
        if api_key.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            api_secret: std::env::var("PM_API_SECRET").ok().filter(|s| !s.is_empty()),
            api_passphrase: std::env::var("PM_API_PASSPHRASE")
                .ok()
                .filter(|s| !s.is_empty()),
        })
    }
}

/// Multi-source price resolution for a (market, outcome) pair.
///
/// Sources are tried strictly in priority order; the first well-formed
/// value in [0, 1] wins. Every step's failure is caught locally and means
/// "try the next source" — the chain never raises past its own boundary.
pub struct PriceChain {
    client: RateLimitedClient,
    clob: Option<ClobCredentials>,
    hashdive_key: Option<String>,
    finfeed_key: Option<String>,
    staleness: chrono::Duration,
}

impl PriceChain {
    pub fn new(limits: &RateLimitConfig, staleness: chrono::Duration) -> Self {
        Self {
            client: RateLimitedClient::new(limits, REQUEST_TIMEOUT, QUOTE_TTL),
            clob: ClobCredentials::from_env(),
            hashdive_key: std::env::var("HASHDIVE_API_KEY").ok().filter(|s| !s.is_empty()),
            finfeed_key: std::env::var("FINFEED_API_KEY").ok().filter(|s| !s.is_empty()),
            staleness,
        }
    }

    /// Resolve the best-available price. `peer_prices` are the entry prices
    /// of the wallets forming the signal; they back the final source, which
    /// only fails when none are supplied or none are positive.
    pub async fn resolve(
        &self,
        market: &str,
        outcome: u32,
        peer_prices: &[Decimal],
    ) -> Option<PriceQuote> {
        let token_id = format!("{market}:{outcome}");

        if self.clob.is_some() {
            if let Some(value) = self.clob_quote(&token_id).await {
                return Some(quote(value, PriceSource::Clob));
            }
        } else {
            debug!("clob quote skipped: PM_API_KEY not configured");
        }

        if let Some(value) = self.gamma_quote(market, outcome).await {
            return Some(quote(value, PriceSource::Gamma));
        }

        if let Some(value) = self.history_average(market).await {
            return Some(quote(value, PriceSource::TradeHistory));
        }

        if self.hashdive_key.is_some() {
            if let Some(value) = self.hashdive_quote(&token_id).await {
                return Some(quote(value, PriceSource::HashDive));
            }
        }

        if self.finfeed_key.is_some() {
            if let Some(value) = self.finfeed_quote(&token_id).await {
                return Some(quote(value, PriceSource::FinFeed));
            }
        }

        if let Some(value) = peer_average(peer_prices) {
            return Some(quote(value, PriceSource::PeerAverage));
        }

        debug!("all price sources exhausted for {market} outcome {outcome}");
        None
    }

    async fn clob_quote(&self, token_id: &str) -> Option<Decimal> {
        let creds = self.clob.as_ref()?;
        let url = format!("{CLOB_API_BASE}/price");
        let params = [
            ("token_id", token_id.to_string()),
            ("side", "BUY".to_string()),
        ];
        let mut headers: Vec<(&str, &str)> = vec![("X-API-KEY", creds.api_key.as_str())];
        if let (Some(secret), Some(passphrase)) =
            (creds.api_secret.as_deref(), creds.api_passphrase.as_deref())
        {
            headers.push(("X-API-SECRET", secret));
            headers.push(("X-API-PASSPHRASE", passphrase));
        }
        let body = match self
            .client
            .get_json(&url, &params, &headers, Some(QUOTE_TTL))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!("clob price failed: {e}");
                return None;
            }
        };
        let value = body.get("price").or_else(|| body.get("last_price"))?;
        valid_unit_price(value_to_decimal(value)?)
    }

    async fn gamma_quote(&self, market: &str, outcome: u32) -> Option<Decimal> {
        let url = format!("{GAMMA_API_BASE}/events");
        let params = [("condition_ids", market.to_string())];
        let body = match self
            .client
            .get_json(&url, &params, &[], Some(QUOTE_TTL))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!("gamma events failed: {e}");
                return None;
            }
        };
        let value = gamma_outcome_price(&body, market, outcome)?;
        valid_unit_price(value)
    }

    async fn history_average(&self, market: &str) -> Option<Decimal> {
        let url = format!("{DATA_API_BASE}/trades");
        let params = [
            ("market", market.to_string()),
            ("limit", HISTORY_TRADES.to_string()),
        ];
        let body = match self
            .client
            .get_json(&url, &params, &[], Some(QUOTE_TTL))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!("trade history failed: {e}");
                return None;
            }
        };
        let value = history_average_from(&body, Utc::now(), self.staleness)?;
        valid_unit_price(value)
    }

    async fn hashdive_quote(&self, token_id: &str) -> Option<Decimal> {
        let key = self.hashdive_key.as_deref()?;
        let url = format!("{HASHDIVE_API_BASE}/get_last_price");
        let params = [("asset_id", token_id.to_string())];
        let headers = [("x-api-key", key)];
        let body = match self
            .client
            .get_json(&url, &params, &headers, Some(QUOTE_TTL))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!("hashdive price failed: {e}");
                return None;
            }
        };
        let value = body.get("last_price").or_else(|| body.get("price"))?;
        valid_unit_price(value_to_decimal(value)?)
    }

    async fn finfeed_quote(&self, token_id: &str) -> Option<Decimal> {
        let key = self.finfeed_key.as_deref()?;
        let url = format!("{FINFEED_API_BASE}/prediction-markets/last-price");
        let params = [("market", token_id.to_string())];
        let bearer = format!("Bearer {key}");
        let headers = [("Authorization", bearer.as_str())];
        let body = match self
            .client
            .get_json(&url, &params, &headers, Some(QUOTE_TTL))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!("finfeed price failed: {e}");
                return None;
            }
        };
        let value = body
            .get("last_price")
            .or_else(|| body.get("price"))
            .or_else(|| body.get("value"))?;
        valid_unit_price(value_to_decimal(value)?)
    }
}

fn quote(value: Decimal, source: PriceSource) -> PriceQuote {
    PriceQuote {
        value,
        source,
        resolved_at: Utc::now(),
    }
}

/// Average of the positive peer entry prices, if any.
pub fn peer_average(peer_prices: &[Decimal]) -> Option<Decimal> {
    let positive: Vec<Decimal> = peer_prices
        .iter()
        .copied()
        .filter(|p| *p > Decimal::ZERO)
        .collect();
    if positive.is_empty() {
        return None;
    }
    Some(positive.iter().copied().sum::<Decimal>() / Decimal::from(positive.len()))
}

fn valid_unit_price(value: Decimal) -> Option<Decimal> {
    (value >= Decimal::ZERO && value <= Decimal::ONE).then_some(value)
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        // Via the string form so binary floats don't leak imprecision.
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Pull the outcome price out of a Gamma events payload.
///
/// Events carry a `markets` array; each market has a `conditionId` and an
/// `outcomePrices` field that is usually a JSON-encoded string array
/// (`"[\"0.12\", \"0.88\"]"`), occasionally a plain array.
fn gamma_outcome_price(body: &Value, market: &str, outcome: u32) -> Option<Decimal> {
    let events = body.as_array()?;
    for event in events {
        let Some(markets) = event.get("markets").and_then(Value::as_array) else {
            continue;
        };
        let matched = markets
            .iter()
            .find(|m| {
                m.get("conditionId")
                    .or_else(|| m.get("condition_id"))
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.eq_ignore_ascii_case(market))
            })
            .or_else(|| markets.first());
        let Some(matched) = matched else { continue };

        let raw = matched
            .get("outcomePrices")
            .or_else(|| matched.get("outcome_prices"))?;
        let prices: Vec<Value> = match raw {
            Value::String(s) => serde_json::from_str(s).ok()?,
            Value::Array(items) => items.clone(),
            _ => return None,
        };
        return prices
            .get(outcome as usize)
            .and_then(value_to_decimal);
    }
    None
}

/// Average recent trade prices, dropping stale or implausible entries.
fn history_average_from(
    body: &Value,
    now: DateTime<Utc>,
    staleness: chrono::Duration,
) -> Option<Decimal> {
    let trades = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("trades")
            .or_else(|| map.get("data"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    let mut prices = Vec::new();
    for trade in trades.iter().take(HISTORY_TRADES) {
        let Some(price) = trade
            .get("price")
            .or_else(|| trade.get("last_price"))
            .and_then(value_to_decimal)
        else {
            continue;
        };
        // A trade with no readable timestamp still counts; one known to be
        // stale does not.
        if let Some(at) = trade.get("timestamp").and_then(extract::parse_timestamp) {
            if now - at > staleness {
                continue;
            }
        }
        if price < PLAUSIBLE_LOW || price > PLAUSIBLE_HIGH {
            continue;
        }
        prices.push(price);
    }

    if prices.is_empty() {
        return None;
    }
    Some(prices.iter().copied().sum::<Decimal>() / Decimal::from(prices.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn peer_average_uses_only_positive_prices() {
        let avg = peer_average(&[dec!(0.40), dec!(0), dec!(0.60)]).unwrap();
        assert_eq!(avg, dec!(0.50));
    }

    #[test]
    fn peer_average_fails_only_when_nothing_usable() {
        assert!(peer_average(&[]).is_none());
        assert!(peer_average(&[dec!(0)]).is_none());
    }

    #[test]
    fn unit_range_validation() {
        assert_eq!(valid_unit_price(dec!(0.5)), Some(dec!(0.5)));
        assert_eq!(valid_unit_price(dec!(0)), Some(dec!(0)));
        assert_eq!(valid_unit_price(dec!(1)), Some(dec!(1)));
        assert!(valid_unit_price(dec!(1.2)).is_none());
        assert!(valid_unit_price(dec!(-0.1)).is_none());
    }

    #[test]
    fn gamma_outcome_prices_string_encoded() {
        let body = json!([{
            "markets": [{
                "conditionId": "0xABC",
                "outcomePrices": "[\"0.12\", \"0.88\"]"
            }]
        }]);
        assert_eq!(gamma_outcome_price(&body, "0xabc", 0), Some(dec!(0.12)));
        assert_eq!(gamma_outcome_price(&body, "0xabc", 1), Some(dec!(0.88)));
        assert_eq!(gamma_outcome_price(&body, "0xabc", 2), None);
    }

    #[test]
    fn gamma_matches_market_among_several() {
        let body = json!([{
            "markets": [
                {"conditionId": "0xother", "outcomePrices": "[\"0.99\"]"},
                {"conditionId": "0xwanted", "outcomePrices": ["0.33", "0.67"]}
            ]
        }]);
        assert_eq!(gamma_outcome_price(&body, "0xwanted", 0), Some(dec!(0.33)));
    }

    #[test]
    fn gamma_malformed_payload_is_none() {
        assert!(gamma_outcome_price(&json!({"events": []}), "0xm", 0).is_none());
        let bad = json!([{"markets": [{"conditionId": "0xm", "outcomePrices": "not json"}]}]);
        assert!(gamma_outcome_price(&bad, "0xm", 0).is_none());
    }

    #[test]
    fn history_average_filters_stale_and_implausible() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = json!([
            {"price": 0.40, "timestamp": 1_700_000_000 - 60},
            {"price": 0.60, "timestamp": 1_700_000_000 - 120},
            // Stale: two hours old.
            {"price": 0.10, "timestamp": 1_700_000_000 - 7200},
            // Implausible for an active market.
            {"price": 0.9999, "timestamp": 1_700_000_000 - 60},
        ]);
        let avg = history_average_from(&body, now, chrono::Duration::hours(1)).unwrap();
        assert_eq!(avg, dec!(0.50));
    }

    #[test]
    fn history_average_empty_is_none() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(history_average_from(&json!([]), now, chrono::Duration::hours(1)).is_none());
        let all_stale = json!([{"price": 0.5, "timestamp": 1_600_000_000}]);
        assert!(history_average_from(&all_stale, now, chrono::Duration::hours(1)).is_none());
    }

    #[test]
    fn history_average_accepts_wrapped_payloads() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = json!({"data": [{"price": "0.25", "timestamp": 1_700_000_000 - 10}]});
        let avg = history_average_from(&body, now, chrono::Duration::hours(1)).unwrap();
        assert_eq!(avg, dec!(0.25));
    }
}

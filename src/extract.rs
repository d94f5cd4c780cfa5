use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;

use crate::types::{Direction, Position, RawTrade};

/// Numeric timestamps above this are epoch milliseconds, not seconds.
const MILLIS_CUTOFF: f64 = 1e10;

/// Epoch seconds below this (pre-2001) are not plausible trade times.
const MIN_PLAUSIBLE_SECS: f64 = 1e9;

/// Epoch seconds past 2100-01-01 are not plausible either.
const MAX_PLAUSIBLE_SECS: f64 = 4_102_444_800.0;

/// Entry prices at or beyond this band mean the market was effectively
/// decided when the trade happened; such trades never enter grouping.
const ENTRY_PRICE_FLOOR: Decimal = dec!(0.02);
const ENTRY_PRICE_CEIL: Decimal = dec!(0.98);

/// Turn a raw trade record into a normalized `Position`, or reject it.
///
/// Rejects when the side token is not an explicit buy/sell, the market id
/// is absent, size or price cannot be parsed into their domains, or the
/// timestamp is missing/implausible. A missing outcome index defaults to 0
/// (single-outcome feeds omit it). No side effects.
pub fn extract(raw: &RawTrade, wallet: &str) -> Option<Position> {
    let market = raw.market.as_deref()?.trim();
    if market.is_empty() {
        return None;
    }

    let direction = Direction::parse(raw.side.as_deref()?)?;

    let size = decimal_field(raw.size.as_ref()?)?;
    if size <= Decimal::ZERO {
        return None;
    }

    let price = decimal_field(raw.price.as_ref()?)?;
    if price < Decimal::ZERO || price > Decimal::ONE {
        return None;
    }

    let observed_at = parse_timestamp(raw.timestamp.as_ref()?)?;

    let outcome = match raw.outcome_index.as_ref() {
        Some(value) => outcome_field(value)?,
        None => 0,
    };

    let usd = raw
        .usd
        .as_ref()
        .and_then(decimal_field)
        .filter(|v| *v > Decimal::ZERO)
        .unwrap_or(size * price);

    Some(Position {
        wallet: wallet.trim().to_lowercase(),
        market: market.to_string(),
        outcome,
        direction,
        size,
        price,
        usd,
        observed_at,
    })
}

/// Entry-price prefilter: a trade priced at or beyond the extreme band was
/// made on an effectively decided market and is dropped before grouping.
pub fn entry_price_extreme(price: Decimal) -> bool {
    price <= ENTRY_PRICE_FLOOR || price >= ENTRY_PRICE_CEIL
}

/// Age prefilter applied before ingestion.
pub fn too_old(observed_at: DateTime<Utc>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now - observed_at > max_age
}

/// Parse a numeric-or-string JSON field into a `Decimal`. Numbers go
/// through their decimal string form so 0.45 stays 0.45, not the nearest
/// binary float.
fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn outcome_field(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => u32::try_from(n.as_i64()?).ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize a feed timestamp to UTC.
///
/// Accepts epoch seconds, epoch milliseconds (disambiguated by magnitude),
/// and ISO-8601 strings with a trailing "Z" or explicit offset.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => epoch_to_datetime(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            // Some providers string-encode the epoch value.
            epoch_to_datetime(s.parse().ok()?)
        }
        _ => None,
    }
}

fn epoch_to_datetime(raw: f64) -> Option<DateTime<Utc>> {
    let secs = if raw > MILLIS_CUTOFF { raw / 1000.0 } else { raw };
    if !(MIN_PLAUSIBLE_SECS..=MAX_PLAUSIBLE_SECS).contains(&secs) {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(overrides: Value) -> RawTrade {
        let mut base = json!({
            "id": "t1",
            "conditionId": "0xmarket",
            "outcomeIndex": 1,
            "side": "BUY",
            "size": 100.0,
            "price": 0.45,
            "timestamp": 1_700_000_000
        });
        base.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn extracts_normalized_position() {
        let position = extract(&raw(json!({})), "0xWALLET").unwrap();
        assert_eq!(position.wallet, "0xwallet");
        assert_eq!(position.market, "0xmarket");
        assert_eq!(position.outcome, 1);
        assert_eq!(position.direction, Direction::Buy);
        assert_eq!(position.size, dec!(100));
        assert_eq!(position.price, dec!(0.45));
        assert_eq!(position.usd, dec!(45.00));
        assert_eq!(position.observed_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn unknown_direction_is_rejected() {
        assert!(extract(&raw(json!({"side": "MERGE"})), "0xa").is_none());
        assert!(extract(&raw(json!({"side": ""})), "0xa").is_none());
        let mut no_side = raw(json!({}));
        no_side.side = None;
        assert!(extract(&no_side, "0xa").is_none());
    }

    #[test]
    fn missing_market_is_rejected() {
        let mut no_market = raw(json!({}));
        no_market.market = None;
        assert!(extract(&no_market, "0xa").is_none());
        assert!(extract(&raw(json!({"conditionId": "  "})), "0xa").is_none());
    }

    #[test]
    fn bad_size_or_price_is_rejected() {
        assert!(extract(&raw(json!({"size": 0})), "0xa").is_none());
        assert!(extract(&raw(json!({"size": -3})), "0xa").is_none());
        assert!(extract(&raw(json!({"size": "abc"})), "0xa").is_none());
        assert!(extract(&raw(json!({"price": -0.1})), "0xa").is_none());
        assert!(extract(&raw(json!({"price": 1.5})), "0xa").is_none());
    }

    #[test]
    fn string_encoded_numbers_parse() {
        let position =
            extract(&raw(json!({"size": "12.5", "price": "0.60"})), "0xa").unwrap();
        assert_eq!(position.size, dec!(12.5));
        assert_eq!(position.price, dec!(0.60));
        assert_eq!(position.usd, dec!(7.500));
    }

    #[test]
    fn millisecond_timestamps_are_detected_by_magnitude() {
        let position = extract(&raw(json!({"timestamp": 1_700_000_000_000i64})), "0xa").unwrap();
        assert_eq!(position.observed_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn iso_timestamps_with_z_suffix_parse() {
        let position =
            extract(&raw(json!({"timestamp": "2024-05-01T12:30:00Z"})), "0xa").unwrap();
        assert_eq!(
            position.observed_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn implausible_timestamps_are_rejected() {
        assert!(extract(&raw(json!({"timestamp": 12345})), "0xa").is_none());
        assert!(extract(&raw(json!({"timestamp": "not a date"})), "0xa").is_none());
        let mut no_ts = raw(json!({}));
        no_ts.timestamp = None;
        assert!(extract(&no_ts, "0xa").is_none());
    }

    #[test]
    fn direct_usd_field_wins_over_derived_notional() {
        let position = extract(&raw(json!({"usd": 250.0})), "0xa").unwrap();
        assert_eq!(position.usd, dec!(250));
    }

    #[test]
    fn entry_price_band() {
        assert!(entry_price_extreme(dec!(0.01)));
        assert!(entry_price_extreme(dec!(0.02)));
        assert!(entry_price_extreme(dec!(0.98)));
        assert!(entry_price_extreme(dec!(0.995)));
        assert!(!entry_price_extreme(dec!(0.03)));
        assert!(!entry_price_extreme(dec!(0.50)));
    }

    #[test]
    fn age_prefilter() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let max_age = chrono::Duration::hours(48);
        assert!(too_old(now - chrono::Duration::hours(49), now, max_age));
        assert!(!too_old(now - chrono::Duration::hours(47), now, max_age));
    }
}

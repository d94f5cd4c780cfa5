use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::{CandidateSignal, Decision, PriceQuote, SuppressReason};

/// One gate decision, reportable as a JSON line.
#[derive(Debug, Serialize)]
pub struct SignalEvent {
    pub timestamp: String,
    pub market: String,
    pub outcome: u32,
    pub direction: String,
    pub wallets: Vec<String>,
    pub total_usd: Decimal,
    pub avg_entry_price: Decimal,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_reason: Option<SuppressReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceQuote>,
}

impl SignalEvent {
    pub fn from_decision(signal: &CandidateSignal, decision: &Decision) -> Self {
        let (label, reason, price) = match decision {
            Decision::Emit { price } => ("emit", None, *price),
            Decision::Suppress(reason) => ("suppress", Some(*reason), None),
        };
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            market: signal.key.market.clone(),
            outcome: signal.key.outcome,
            direction: signal.key.direction.label().to_string(),
            wallets: signal.wallets.clone(),
            total_usd: signal.total_usd,
            avg_entry_price: signal.avg_price,
            decision: label.to_string(),
            suppress_reason: reason,
            price,
        }
    }
}

/// Emit a signal event as a single JSON line to stdout (logging stays on
/// stderr).
pub fn report_event(event: &SignalEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

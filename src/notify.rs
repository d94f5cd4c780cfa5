use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::TELEGRAM_API_BASE;
use crate::config::{SettingsConfig, TelegramConfig};
use crate::types::{CandidateSignal, PriceQuote, SuppressReason};

/// Attempts per message, counting rate-limit waits.
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Fallback wait when a 429 carries no retry_after.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Wallets shown by address in one alert.
const MAX_WALLETS_SHOWN: usize = 4;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Provider asked us to slow down. Retried internally with the
    /// advertised delay; surfaces only after attempts are exhausted.
    #[error("telegram rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Anything else. Never retried.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound notification channel (Telegram Bot API).
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
    audit_chat_id: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        let audit = config.audit_chat_id.trim();
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            bot_token: config.bot_token.trim().to_string(),
            chat_id: config.chat_id.trim().to_string(),
            audit_chat_id: (!audit.is_empty()).then(|| audit.to_string()),
        }
    }

    /// Send the end-user consensus alert.
    pub async fn send_alert(&self, text: &str) -> Result<(), NotifyError> {
        self.send_with_retry(&self.chat_id, text).await
    }

    /// Send an operational audit message; silently skipped when no audit
    /// channel is configured.
    pub async fn send_audit(&self, text: &str) -> Result<(), NotifyError> {
        match &self.audit_chat_id {
            Some(chat_id) => self.send_with_retry(chat_id, text).await,
            None => Ok(()),
        }
    }

    async fn send_with_retry(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let mut last_wait = DEFAULT_RETRY_AFTER;
        for attempt in 0..MAX_SEND_ATTEMPTS {
            match self.send_once(chat_id, text).await {
                Ok(()) => {
                    info!("telegram message sent to chat {chat_id}");
                    return Ok(());
                }
                Err(NotifyError::RateLimited { retry_after }) if attempt + 1 < MAX_SEND_ATTEMPTS => {
                    warn!(
                        "telegram rate limited (attempt {}/{}), waiting {:?}",
                        attempt + 1,
                        MAX_SEND_ATTEMPTS,
                        retry_after,
                    );
                    last_wait = retry_after;
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(NotifyError::RateLimited {
            retry_after: last_wait,
        })
    }

    async fn send_once(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!("{TELEGRAM_API_BASE}/bot{}/sendMessage", self.bot_token);
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(NotifyError::RateLimited {
                retry_after: parse_retry_after(&body),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Delivery(format!(
            "HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        )))
    }
}

/// Telegram reports the wait in `parameters.retry_after` (seconds).
fn parse_retry_after(body: &Value) -> Duration {
    body.get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// "0x12345678…abcd" — enough to recognize, short enough to scan.
pub fn short_address(address: &str) -> String {
    if address.len() <= 14 {
        return address.to_string();
    }
    format!("{}…{}", &address[..8], &address[address.len() - 4..])
}

fn format_price(price: Option<&PriceQuote>) -> String {
    match price {
        Some(quote) => format!("{} ({})", quote.value.round_dp(3), quote.source.label()),
        None => "n/a".to_string(),
    }
}

/// End-user consensus alert body (HTML).
pub fn format_alert(
    signal: &CandidateSignal,
    market_title: &str,
    price: Option<&PriceQuote>,
    display_names: &std::collections::HashMap<String, String>,
) -> String {
    let title = if market_title.is_empty() {
        signal.key.market.as_str()
    } else {
        market_title
    };

    let mut traders = String::new();
    for (i, wallet) in signal.wallets.iter().take(MAX_WALLETS_SHOWN).enumerate() {
        let line = match display_names.get(wallet).filter(|n| !n.is_empty()) {
            Some(name) => format!(
                "{}. <code>{}</code> — {name}\n",
                i + 1,
                short_address(wallet)
            ),
            None => format!("{}. <code>{}</code>\n", i + 1, short_address(wallet)),
        };
        traders.push_str(&line);
    }
    if signal.wallets.len() > MAX_WALLETS_SHOWN {
        traders.push_str(&format!(
            "…and {} more\n",
            signal.wallets.len() - MAX_WALLETS_SHOWN
        ));
    }

    format!(
        "🔥 <b>Consensus Signal Detected ({count} wallets)</b>\n\
         \n\
         🎯 <b>Market:</b> {title}\n\
         \n\
         🛒 <b>Position:</b> {direction} @ {price}\n\
         <b>Outcome:</b> #{outcome}\n\
         💵 <b>Combined Size:</b> ${size} USDC\n\
         \n\
         👤 <b>Traders involved:</b>\n\
         \n\
         {traders}\
         \n\
         📅 {now} UTC",
        count = signal.wallets.len(),
        title = title,
        direction = signal.key.direction,
        price = format_price(price),
        outcome = signal.key.outcome,
        size = signal.total_usd.round_dp(0),
        traders = traders,
        now = Utc::now().format("%Y-%m-%d %H:%M:%S"),
    )
}

/// Operational audit message for a suppressed signal.
pub fn format_audit(
    signal: &CandidateSignal,
    market_title: &str,
    reason: SuppressReason,
    price: Option<&PriceQuote>,
) -> String {
    let title = if market_title.is_empty() {
        signal.key.market.as_str()
    } else {
        market_title
    };
    format!(
        "🤫 <b>Signal suppressed:</b> {reason}\n\
         \n\
         🎯 {title}\n\
         {direction} #{outcome} — {count} wallets, ${size} combined\n\
         Price: {price}, avg entry: {entry}",
        reason = reason.label(),
        title = title,
        direction = signal.key.direction,
        outcome = signal.key.outcome,
        count = signal.wallets.len(),
        size = signal.total_usd.round_dp(0),
        price = format_price(price),
        entry = signal.avg_price.round_dp(3),
    )
}

/// Startup summary sent when monitoring begins.
pub fn format_startup(wallet_count: usize, settings: &SettingsConfig) -> String {
    format!(
        "🤖 <b>Consensus Monitor Started</b>\n\
         \n\
         👥 Monitoring: {wallet_count} wallets\n\
         🎯 Min Consensus: {min_consensus} wallets\n\
         ⏰ Alert Window: {window} minutes\n\
         🔄 Poll Interval: {poll} seconds",
        wallet_count = wallet_count,
        min_consensus = settings.min_consensus,
        window = settings.window_min,
        poll = settings.poll_interval_secs,
    )
}

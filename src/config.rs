use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
///
/// Secrets (Telegram token, price-provider API keys) may be left empty in
/// the file and supplied through the environment instead; `load` applies
/// the overrides after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Read-only wallet roster the polling loop iterates.
    #[serde(default)]
    pub wallets: Vec<WalletEntry>,
}

/// Notification channel credentials and routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    /// Optional operational channel for suppression audit messages.
    #[serde(default)]
    pub audit_chat_id: String,
}

/// One tracked wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Minimum distinct wallets for a consensus signal (floor of 2).
    #[serde(default = "default_min_consensus")]
    pub min_consensus: usize,
    /// Rolling consensus window in minutes.
    #[serde(default = "default_window_min")]
    pub window_min: f64,
    /// Alert record lifetime in minutes; the same dedup key cannot alert
    /// again until its record expires or is evicted.
    #[serde(default = "default_cooldown_min")]
    pub cooldown_min: f64,
    /// Dedup ledger capacity; oldest records evicted FIFO once over cap.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    /// Max simultaneous wallet trade fetches per cycle.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Minimum combined USD size for a signal to be worth alerting.
    #[serde(default = "default_min_total_size")]
    pub min_total_size_usd: Decimal,
    /// Max allowed (max-min)/max divergence across the first three entry prices.
    #[serde(default = "default_max_entry_divergence")]
    pub max_entry_divergence: Decimal,
    /// Trades older than this are ignored by the trade-history price source.
    #[serde(default = "default_trade_staleness")]
    pub trade_staleness_secs: u64,
    /// Trades older than this never enter extraction at all.
    #[serde(default = "default_max_trade_age_hours")]
    pub max_trade_age_hours: u64,
}

fn default_poll_interval() -> u64 {
    7
}

fn default_min_consensus() -> usize {
    3
}

fn default_window_min() -> f64 {
    15.0
}

fn default_cooldown_min() -> f64 {
    30.0
}

fn default_ledger_capacity() -> usize {
    100
}

fn default_fetch_concurrency() -> usize {
    10
}

fn default_min_total_size() -> Decimal {
    dec!(2000)
}

fn default_max_entry_divergence() -> Decimal {
    dec!(0.25)
}

fn default_trade_staleness() -> u64 {
    3600
}

fn default_max_trade_age_hours() -> u64 {
    48
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            min_consensus: default_min_consensus(),
            window_min: default_window_min(),
            cooldown_min: default_cooldown_min(),
            ledger_capacity: default_ledger_capacity(),
            fetch_concurrency: default_fetch_concurrency(),
            min_total_size_usd: default_min_total_size(),
            max_entry_divergence: default_max_entry_divergence(),
            trade_staleness_secs: default_trade_staleness(),
            max_trade_age_hours: default_max_trade_age_hours(),
        }
    }
}

/// Local sliding-window rate limiter ceilings, applied per data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_minute_ceiling")]
    pub minute_ceiling: usize,
    #[serde(default = "default_day_ceiling")]
    pub day_ceiling: usize,
}

fn default_minute_ceiling() -> usize {
    300
}

fn default_day_ceiling() -> usize {
    25_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            minute_ceiling: default_minute_ceiling(),
            day_ceiling: default_day_ceiling(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path, apply env overrides, and
    /// enforce invariants.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.bot_token = token;
            }
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            if !chat.trim().is_empty() {
                self.telegram.chat_id = chat;
            }
        }
        if let Ok(chat) = std::env::var("TELEGRAM_AUDIT_CHAT_ID") {
            if !chat.trim().is_empty() {
                self.telegram.audit_chat_id = chat;
            }
        }
    }

    fn normalize(&mut self) {
        if self.settings.min_consensus < 2 {
            tracing::warn!(
                "min_consensus is {}, forcing to 2",
                self.settings.min_consensus
            );
            self.settings.min_consensus = 2;
        }
        for wallet in &mut self.wallets {
            wallet.address = wallet.address.trim().to_lowercase();
        }
    }

    /// Validate the parts that are fatal at startup.
    pub fn validate(&self, dry_run: bool) -> Result<()> {
        if self.wallets.is_empty() {
            anyhow::bail!("wallet roster is empty — add [[wallets]] entries to the config");
        }
        if !dry_run
            && (self.telegram.bot_token.trim().is_empty()
                || self.telegram.chat_id.trim().is_empty())
        {
            anyhow::bail!(
                "Telegram is not configured — set telegram.bot_token and telegram.chat_id \
                 (or TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID), or run with --dry-run"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_on_minimal_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [[wallets]]
            address = "0xABCDEF"
            name = "whale"
            "#,
        )
        .unwrap();
        assert_eq!(config.settings.poll_interval_secs, 7);
        assert_eq!(config.settings.min_consensus, 3);
        assert_eq!(config.settings.ledger_capacity, 100);
        assert_eq!(config.rate_limit.minute_ceiling, 300);
        assert_eq!(config.wallets.len(), 1);
    }

    #[test]
    fn consensus_floor_forced_to_two() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [settings]
            min_consensus = 1

            [[wallets]]
            address = "0xAA"
            "#,
        )
        .unwrap();
        config.normalize();
        assert_eq!(config.settings.min_consensus, 2);
        assert_eq!(config.wallets[0].address, "0xaa");
    }

    #[test]
    fn validate_requires_telegram_unless_dry_run() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [[wallets]]
            address = "0xAA"
            "#,
        )
        .unwrap();
        config.normalize();
        assert!(config.validate(false).is_err());
        assert!(config.validate(true).is_ok());

        config.telegram.bot_token = "token".into();
        config.telegram.chat_id = "42".into();
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn validate_requires_roster() {
        let config = AppConfig {
            telegram: TelegramConfig {
                bot_token: "t".into(),
                chat_id: "c".into(),
                audit_chat_id: String::new(),
            },
            settings: SettingsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            wallets: vec![],
        };
        assert!(config.validate(false).is_err());
    }
}

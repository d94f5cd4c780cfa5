pub mod client;
pub mod config;
pub mod consensus;
pub mod extract;
pub mod feed;
pub mod gate;
pub mod notify;
pub mod price;
pub mod reporter;
pub mod types;

/// Polymarket data API base URL (public, no auth required)
pub const DATA_API_BASE: &str = "https://data-api.polymarket.com";

/// CLOB REST API base URL (Central Limit Order Book)
pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Gamma REST API base URL (market/event metadata)
pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// HashDive API base URL (secondary price provider, requires API key)
pub const HASHDIVE_API_BASE: &str = "https://hashdive.com/api";

/// FinFeed API base URL (tertiary price provider, requires API key)
pub const FINFEED_API_BASE: &str = "https://api.finfeedapi.com/v1";

/// Telegram Bot API base URL
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

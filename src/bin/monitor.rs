use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use polymarket_consensus::config::{AppConfig, CONFIG_PATH};
use polymarket_consensus::consensus::ConsensusDetector;
use polymarket_consensus::extract;
use polymarket_consensus::feed::{MarketClient, TradeFeed, collect_new};
use polymarket_consensus::gate::{GateFacts, SuppressionGate};
use polymarket_consensus::notify::{self, TelegramNotifier};
use polymarket_consensus::price::PriceChain;
use polymarket_consensus::reporter::{self, SignalEvent};
use polymarket_consensus::types::{CandidateSignal, Decision};

/// Heartbeat log cadence, in poll cycles.
const HEARTBEAT_EVERY: u64 = 10;

#[derive(Parser)]
#[command(name = "monitor", about = "Polymarket wallet-consensus alert monitor")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Evaluate and report signals without dispatching any Telegram message
    #[arg(long)]
    dry_run: bool,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

/// Everything one poll cycle needs.
struct Monitor {
    config: AppConfig,
    feed: TradeFeed,
    market: MarketClient,
    prices: PriceChain,
    detector: ConsensusDetector,
    gate: SuppressionGate,
    notifier: TelegramNotifier,
    /// Last-seen trade id per wallet; advances monotonically.
    cursors: HashMap<String, String>,
    /// Wallet address -> display name, from the roster.
    display_names: HashMap<String, String>,
    dry_run: bool,
    cycle_count: u64,
    trades_seen: u64,
    positions_ingested: u64,
    candidates_seen: u64,
}

impl Monitor {
    fn new(config: AppConfig, dry_run: bool) -> Self {
        let settings = &config.settings;
        let window = chrono::Duration::seconds((settings.window_min * 60.0) as i64);
        let cooldown = chrono::Duration::seconds((settings.cooldown_min * 60.0) as i64);
        let staleness = chrono::Duration::seconds(settings.trade_staleness_secs as i64);

        let feed = TradeFeed::new(&config.rate_limit);
        let market = MarketClient::new(&config.rate_limit);
        let prices = PriceChain::new(&config.rate_limit, staleness);
        let detector = ConsensusDetector::new(window, settings.min_consensus);
        let gate = SuppressionGate::new(
            settings.ledger_capacity,
            cooldown,
            settings.max_entry_divergence,
        );
        let notifier = TelegramNotifier::new(&config.telegram);
        let display_names = config
            .wallets
            .iter()
            .map(|w| (w.address.clone(), w.name.clone()))
            .collect();

        Self {
            feed,
            market,
            prices,
            detector,
            gate,
            notifier,
            cursors: HashMap::new(),
            display_names,
            dry_run,
            cycle_count: 0,
            trades_seen: 0,
            positions_ingested: 0,
            candidates_seen: 0,
            config,
        }
    }

    /// One polling cycle: bounded fan-out over the roster, then
    /// single-threaded ingestion, evaluation, gating and dispatch.
    async fn poll_cycle(&mut self) {
        self.cycle_count += 1;
        let now = Utc::now();
        let max_age = chrono::Duration::hours(self.config.settings.max_trade_age_hours as i64);

        // Fan out trade fetches, capped so we neither overrun the limiter
        // nor the remote service. Results are collected before ingestion.
        let semaphore = Arc::new(Semaphore::new(self.config.settings.fetch_concurrency.max(1)));
        let feed = &self.feed;
        let fetches = self.config.wallets.iter().map(|wallet| {
            let semaphore = semaphore.clone();
            let address = wallet.address.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = feed.fetch_trades(&address).await;
                (address, result)
            }
        });
        let results = join_all(fetches).await;

        for (address, result) in results {
            let trades = match result {
                Ok(trades) => trades,
                Err(e) if e.is_rate_limited() => {
                    debug!("skipping {address} this cycle: {e}");
                    continue;
                }
                Err(e) => {
                    warn!("trade fetch failed for {address}: {e}");
                    continue;
                }
            };

            let (fresh, next_cursor) = collect_new(&trades, self.cursors.get(&address).map(String::as_str));
            if let Some(cursor) = next_cursor {
                self.cursors.insert(address.clone(), cursor);
            }
            if fresh.is_empty() {
                continue;
            }
            self.trades_seen += fresh.len() as u64;
            info!("{address}: {} new trade(s)", fresh.len());

            for raw in &fresh {
                let Some(position) = extract::extract(raw, &address) else {
                    continue;
                };
                if extract::entry_price_extreme(position.price) {
                    debug!(
                        "dropping trade on {} at entry price {} (market effectively decided)",
                        position.market, position.price,
                    );
                    continue;
                }
                if extract::too_old(position.observed_at, now, max_age) {
                    continue;
                }
                self.positions_ingested += 1;
                self.detector.ingest(position, now);
            }
        }

        // Evaluate and gate, one signal at a time.
        let signals = self.detector.evaluate(now);
        for signal in signals {
            self.candidates_seen += 1;
            info!(
                "consensus candidate: {} — {} wallets, ${} combined",
                signal.key,
                signal.wallets.len(),
                signal.total_usd.round_dp(0),
            );

            if signal.total_usd < self.config.settings.min_total_size_usd {
                debug!(
                    "candidate {} below size floor (${} < ${})",
                    signal.key,
                    signal.total_usd.round_dp(0),
                    self.config.settings.min_total_size_usd,
                );
                continue;
            }

            let (facts, title) = self.gather_facts(&signal).await;
            let decision = self.gate.decide(&signal, &facts, Utc::now());
            reporter::report_event(&SignalEvent::from_decision(&signal, &decision));

            match decision {
                Decision::Emit { price } => {
                    info!("dispatching alert for {} ({title})", signal.key);
                    if !self.dry_run {
                        let text = notify::format_alert(
                            &signal,
                            &title,
                            price.as_ref(),
                            &self.display_names,
                        );
                        if let Err(e) = self.notifier.send_alert(&text).await {
                            warn!("alert delivery failed for {}: {e}", signal.key);
                        }
                    }
                }
                Decision::Suppress(reason) => {
                    if self.gate.should_audit(&signal, reason, Utc::now()) && !self.dry_run {
                        let text = notify::format_audit(&signal, &title, reason, facts.quote.as_ref());
                        if let Err(e) = self.notifier.send_audit(&text).await {
                            warn!("audit delivery failed for {}: {e}", signal.key);
                        }
                    }
                }
            }
        }

        if self.cycle_count % HEARTBEAT_EVERY == 0 {
            info!(
                "[HB] cycle={} trades={} positions={} candidates={} groups={} ledger={} {}",
                self.cycle_count,
                self.trades_seen,
                self.positions_ingested,
                self.candidates_seen,
                self.detector.group_count(),
                self.gate.ledger_len(),
                self.gate.stats.summary(),
            );
        }
    }

    /// Gather gate facts lazily: metadata first; price resolution only when
    /// the market hasn't already ended; the independent open check only
    /// when no price source resolved.
    async fn gather_facts(&self, signal: &CandidateSignal) -> (GateFacts, String) {
        let market = &signal.key.market;
        let info = match self.market.lookup_market(market).await {
            Ok(info) => info,
            Err(e) => {
                // A missing lookup never suppresses by itself; the gate
                // still sees end_time = None and decides from the price.
                warn!("market lookup failed for {market}: {e}");
                Default::default()
            }
        };

        let mut facts = GateFacts {
            end_time: info.end_time,
            quote: None,
            market_open: None,
        };

        let ended = info.end_time.is_some_and(|end| end <= Utc::now());
        if ended {
            return (facts, info.title);
        }

        facts.quote = self
            .prices
            .resolve(market, signal.key.outcome, &signal.entry_prices)
            .await;

        if facts.quote.is_none() {
            facts.market_open = match self.market.is_market_open(market, signal.key.outcome).await {
                Ok(open) => Some(open),
                Err(e) => {
                    warn!("open check failed for {market}: {e}");
                    None
                }
            };
        }

        (facts, info.title)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    config.validate(args.dry_run)?;
    info!(
        "loaded config from {} — {} wallets, min_consensus={}, window={}min, poll={}s",
        args.config.display(),
        config.wallets.len(),
        config.settings.min_consensus,
        config.settings.window_min,
        config.settings.poll_interval_secs,
    );

    let poll_duration = Duration::from_secs(config.settings.poll_interval_secs.max(1));
    let mut monitor = Monitor::new(config, args.dry_run);

    if !args.dry_run {
        let startup = notify::format_startup(
            monitor.config.wallets.len(),
            &monitor.config.settings,
        );
        if let Err(e) = monitor.notifier.send_alert(&startup).await {
            warn!("startup message failed: {e}");
        }
    }

    if args.once {
        monitor.poll_cycle().await;
        info!("single cycle complete");
        return Ok(());
    }

    info!(
        "entering polling loop (interval: {}s). Press Ctrl+C to stop.",
        poll_duration.as_secs()
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(poll_duration) => {
                monitor.poll_cycle().await;
            }
        }
    }

    info!(
        "final stats: cycles={} trades={} positions={} candidates={} {}",
        monitor.cycle_count,
        monitor.trades_seen,
        monitor.positions_ingested,
        monitor.candidates_seen,
        monitor.gate.stats.summary(),
    );
    Ok(())
}

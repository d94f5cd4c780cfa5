use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Maximum retry attempts for transient transport errors.
const MAX_RETRIES: u32 = 3;

/// Base backoff delay for retries (doubles each attempt).
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Which sliding window rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Minute,
    Day,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LimitScope::Minute => "per-minute",
            LimitScope::Day => "per-day",
        })
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// The local limiter refused the call. Expected and frequent; callers
    /// skip the call for this cycle rather than treating it as a failure.
    #[error("{scope} rate limit exceeded, retry in {wait_secs:.1}s")]
    RateLimited { wait_secs: f64, scope: LimitScope },
    /// Non-2xx application response. Never retried by this component.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Transport-level failure after retry exhaustion.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::RateLimited { .. })
    }
}

/// Time-ordered queue of admitted call timestamps.
struct SlidingWindow {
    scope: LimitScope,
    length: chrono::Duration,
    ceiling: usize,
    calls: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn new(scope: LimitScope, length: chrono::Duration, ceiling: usize) -> Self {
        Self {
            scope,
            length,
            ceiling,
            calls: VecDeque::new(),
        }
    }

    /// Evict entries older than the window, then report how long the caller
    /// must wait if the window is at its ceiling.
    fn check(&mut self, now: DateTime<Utc>) -> Result<(), ClientError> {
        while let Some(oldest) = self.calls.front() {
            if now - *oldest > self.length {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.calls.len() >= self.ceiling {
            let oldest = self.calls[0];
            let wait = (self.length - (now - oldest)).num_milliseconds() as f64 / 1000.0;
            return Err(ClientError::RateLimited {
                wait_secs: wait.max(0.0),
                scope: self.scope,
            });
        }
        Ok(())
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.calls.push_back(now);
    }
}

struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

struct ClientState {
    minute: SlidingWindow,
    day: SlidingWindow,
    cache: HashMap<u64, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Gates and memoizes outbound calls to one external data source.
///
/// Two independent sliding windows (per-minute and per-day) must both be
/// under their ceiling for a call to be admitted. Responses are cached
/// under a fingerprint of endpoint + sorted parameters with a per-entry
/// TTL. State is process-local; the interior mutex makes the limiter and
/// cache safe to touch from the concurrent wallet fan-out.
pub struct RateLimitedClient {
    http: reqwest::Client,
    default_ttl: Duration,
    state: Mutex<ClientState>,
}

impl RateLimitedClient {
    pub fn new(limits: &RateLimitConfig, timeout: Duration, default_ttl: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            default_ttl,
            state: Mutex::new(ClientState {
                minute: SlidingWindow::new(
                    LimitScope::Minute,
                    chrono::Duration::seconds(60),
                    limits.minute_ceiling,
                ),
                day: SlidingWindow::new(
                    LimitScope::Day,
                    chrono::Duration::seconds(86_400),
                    limits.day_ceiling,
                ),
                cache: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Stable fingerprint of endpoint + sorted query parameters.
    pub fn fingerprint(endpoint: &str, params: &[(&str, String)]) -> u64 {
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort();
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        sorted.hash(&mut hasher);
        hasher.finish()
    }

    /// Admit a call through both windows, recording it on success.
    pub fn check_and_record(&self) -> Result<(), ClientError> {
        self.check_and_record_at(Utc::now())
    }

    pub(crate) fn check_and_record_at(&self, now: DateTime<Utc>) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.minute.check(now)?;
        state.day.check(now)?;
        state.minute.record(now);
        state.day.record(now);
        Ok(())
    }

    /// Cache lookup; an expired entry counts as a miss and is purged.
    pub fn lookup(&self, fingerprint: u64) -> Option<Value> {
        self.lookup_at(fingerprint, Utc::now())
    }

    pub(crate) fn lookup_at(&self, fingerprint: u64, now: DateTime<Utc>) -> Option<Value> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        // Fresh hit, expired entry, or plain miss.
        let found: Option<Option<Value>> = state
            .cache
            .get(&fingerprint)
            .map(|entry| (now < entry.expires_at).then(|| entry.value.clone()));
        match found {
            Some(Some(value)) => {
                state.hits += 1;
                Some(value)
            }
            Some(None) => {
                state.cache.remove(&fingerprint);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Store a value under the fingerprint. `ttl = None` uses the source's
    /// default; callers override per call for faster- or slower-moving data.
    pub fn store(&self, fingerprint: u64, value: Value, ttl: Option<Duration>) {
        self.store_at(fingerprint, value, ttl, Utc::now());
    }

    pub(crate) fn store_at(
        &self,
        fingerprint: u64,
        value: Value,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.cache.insert(fingerprint, CacheEntry { value, expires_at });
    }

    /// Cache hit/miss counters for diagnostics.
    pub fn cache_stats(&self) -> (u64, u64) {
        let state = self.state.lock().expect("cache lock poisoned");
        (state.hits, state.misses)
    }

    /// GET a JSON document through the cache and limiter.
    ///
    /// Transient transport failures (timeout, connection) are retried with
    /// bounded exponential backoff; application errors surface immediately
    /// as `ClientError::Status` and are never retried here.
    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let fingerprint = Self::fingerprint(url, params);
        if let Some(cached) = self.lookup(fingerprint) {
            debug!("cache hit for {url}");
            return Ok(cached);
        }

        self.check_and_record()?;

        let mut last_err: Option<reqwest::Error> = None;
        for attempt in 0..MAX_RETRIES {
            let mut request = self.http.get(url).query(params);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ClientError::Status {
                            status: status.as_u16(),
                            body: body.chars().take(200).collect(),
                        });
                    }
                    let value: Value = response.json().await?;
                    self.store(fingerprint, value.clone(), ttl);
                    return Ok(value);
                }
                Err(e) if is_transient(&e) && attempt + 1 < MAX_RETRIES => {
                    let delay = (BASE_BACKOFF * 2u32.pow(attempt)).min(MAX_BACKOFF);
                    warn!(
                        "transient error fetching {url} (attempt {}/{}): {e} — retrying in {:?}",
                        attempt + 1,
                        MAX_RETRIES,
                        delay,
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }

        Err(ClientError::Transport(last_err.expect("retry loop ran at least once")))
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn test_client(minute: usize, day: usize) -> RateLimitedClient {
        RateLimitedClient::new(
            &RateLimitConfig {
                minute_ceiling: minute,
                day_ceiling: day,
            },
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    // ── sliding windows ────────────────────────────────────────────

    #[test]
    fn limiter_admits_up_to_ceiling() {
        let client = test_client(3, 100);
        for i in 0..3 {
            assert!(client.check_and_record_at(at(i)).is_ok());
        }
        let err = client.check_and_record_at(at(3)).unwrap_err();
        match err {
            ClientError::RateLimited { scope, wait_secs } => {
                assert_eq!(scope, LimitScope::Minute);
                assert!(wait_secs > 0.0 && wait_secs <= 60.0);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn limiter_resets_once_oldest_call_ages_out() {
        let client = test_client(2, 100);
        assert!(client.check_and_record_at(at(0)).is_ok());
        assert!(client.check_and_record_at(at(1)).is_ok());
        assert!(client.check_and_record_at(at(30)).is_err());
        // Oldest call (t=0) ages past the 60s window at t=61.
        assert!(client.check_and_record_at(at(61)).is_ok());
    }

    #[test]
    fn day_window_is_independent_of_minute_window() {
        let client = test_client(100, 2);
        assert!(client.check_and_record_at(at(0)).is_ok());
        assert!(client.check_and_record_at(at(120)).is_ok());
        // Minute window is clear at t=300, but the day window is full.
        let err = client.check_and_record_at(at(300)).unwrap_err();
        match err {
            ClientError::RateLimited { scope, .. } => assert_eq!(scope, LimitScope::Day),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn rejected_call_is_not_recorded() {
        let client = test_client(1, 100);
        assert!(client.check_and_record_at(at(0)).is_ok());
        assert!(client.check_and_record_at(at(1)).is_err());
        assert!(client.check_and_record_at(at(2)).is_err());
        // Only the admitted call occupies the window, so it clears at t=61.
        assert!(client.check_and_record_at(at(61)).is_ok());
    }

    // ── cache ──────────────────────────────────────────────────────

    #[test]
    fn cache_hit_within_ttl() {
        let client = test_client(10, 10);
        let fp = RateLimitedClient::fingerprint("/trades", &[("user", "0xa".into())]);
        client.store_at(fp, json!({"ok": true}), Some(Duration::from_secs(30)), at(0));
        assert_eq!(client.lookup_at(fp, at(29)), Some(json!({"ok": true})));
    }

    #[test]
    fn expired_entry_is_a_miss_and_purged() {
        let client = test_client(10, 10);
        let fp = RateLimitedClient::fingerprint("/trades", &[]);
        client.store_at(fp, json!(1), Some(Duration::from_secs(10)), at(0));
        assert_eq!(client.lookup_at(fp, at(11)), None);
        // Entry was purged, so a second lookup is a plain miss.
        assert_eq!(client.lookup_at(fp, at(5)), None);
        let (hits, misses) = client.cache_stats();
        assert_eq!(hits, 0);
        assert_eq!(misses, 2);
    }

    #[test]
    fn per_call_ttl_overrides_default() {
        let client = test_client(10, 10);
        let fp = RateLimitedClient::fingerprint("/markets", &[]);
        // Default TTL is 60s; override down to 5s.
        client.store_at(fp, json!(1), Some(Duration::from_secs(5)), at(0));
        assert_eq!(client.lookup_at(fp, at(6)), None);
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let a = RateLimitedClient::fingerprint(
            "/trades",
            &[("user", "0xa".into()), ("limit", "50".into())],
        );
        let b = RateLimitedClient::fingerprint(
            "/trades",
            &[("limit", "50".into()), ("user", "0xa".into())],
        );
        assert_eq!(a, b);
        let c = RateLimitedClient::fingerprint("/positions", &[("user", "0xa".into())]);
        assert_ne!(a, c);
    }
}

use std::time::Duration;

use anyhow::{bail, Context};
use rand::Rng;
use url::Url;

use crate::util::env::{env_opt, env_parse_opt, env_secs};

pub const DEFAULT_STORE_API: &str = "https://store.steampowered.com/api/appdetails";
pub const DEFAULT_APP_LIST_API: &str = "https://api.steampowered.com/ISteamApps/GetAppList/v2/";

/// Multiply `base` by a factor drawn uniformly from `[low, high]`.
pub fn jittered(base: Duration, low: f64, high: f64) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let factor = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    };
    base.mul_f64(factor.max(0.0))
}

/// A fixed delay with multiplicative jitter, slept before a unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub base: Duration,
    pub jitter_low: f64,
    pub jitter_high: f64,
}

impl Pacing {
    pub const fn new(base: Duration, jitter_low: f64, jitter_high: f64) -> Self {
        Self {
            base,
            jitter_low,
            jitter_high,
        }
    }

    pub const fn none() -> Self {
        Self::new(Duration::ZERO, 1.0, 1.0)
    }

    pub fn with_base(self, base: Duration) -> Self {
        Self { base, ..self }
    }

    pub fn sample(&self) -> Duration {
        jittered(self.base, self.jitter_low, self.jitter_high)
    }

    /// Sleep for one jittered interval; returns what was slept.
    pub async fn pause(&self) -> Duration {
        let d = self.sample();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
        d
    }
}

/// Retry schedule for a single store request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always >= 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Cap for rate-limit (429) backoff.
    pub max_delay: Duration,
    /// Cap for every other transient failure.
    pub transient_cap: Duration,
    /// Delays are multiplied by a factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            transient_cap: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Un-jittered 429 delay before retry number `attempt` (1-based):
    /// `min(max_delay, initial_delay * 2^(attempt-1))`.
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Un-jittered delay for other transient failures: `min(transient_cap, initial_delay * attempt)`.
    pub fn transient_delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .checked_mul(attempt.max(1))
            .unwrap_or(self.transient_cap)
            .min(self.transient_cap)
    }

    /// Longest server-requested `Retry-After` honored: five times `max_delay`.
    pub fn retry_after_cap(&self) -> Duration {
        self.max_delay.saturating_mul(5)
    }

    pub fn jitter(&self, base: Duration) -> Duration {
        let j = self.jitter.clamp(0.0, 1.0);
        jittered(base, 1.0 - j, 1.0 + j)
    }
}

/// Every timing and sizing knob of a fetch run.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retry: RetryPolicy,
    /// Slept before every price request.
    pub request_pacing: Pacing,
    /// Slept before every detail lookup made by the probe filters.
    pub detail_pacing: Pacing,
    /// Slept between batches.
    pub batch_pacing: Pacing,
    pub batch_size: usize,
    pub http_timeout: Duration,
    pub language: String,
    pub store_api: String,
    pub app_list_api: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_pacing: Pacing::new(Duration::from_secs(3), 0.5, 1.5),
            detail_pacing: Pacing::new(Duration::from_secs(3), 0.8, 1.2),
            batch_pacing: Pacing::new(Duration::from_secs(30), 0.9, 1.1),
            batch_size: 25,
            http_timeout: Duration::from_secs(10),
            language: "english".to_string(),
            store_api: DEFAULT_STORE_API.to_string(),
            app_list_api: DEFAULT_APP_LIST_API.to_string(),
        }
    }
}

impl FetchSettings {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(d) = env_secs("STEAM_REQUEST_DELAY_SECS") {
            cfg.request_pacing = cfg.request_pacing.with_base(d);
        }
        if let Some(d) = env_secs("STEAM_DETAIL_DELAY_SECS") {
            cfg.detail_pacing = cfg.detail_pacing.with_base(d);
        }
        if let Some(d) = env_secs("STEAM_BATCH_DELAY_SECS") {
            cfg.batch_pacing = cfg.batch_pacing.with_base(d);
        }
        if let Some(n) = env_parse_opt::<u32>("STEAM_MAX_RETRIES") {
            cfg.retry.max_attempts = n.max(1);
        }
        if let Some(d) = env_secs("STEAM_RETRY_INITIAL_SECS") {
            cfg.retry.initial_delay = d;
        }
        if let Some(d) = env_secs("STEAM_RETRY_MAX_SECS") {
            cfg.retry.max_delay = d;
        }
        if let Some(d) = env_secs("STEAM_HTTP_TIMEOUT_SECS") {
            if !d.is_zero() {
                cfg.http_timeout = d;
            }
        }
        if let Some(n) = env_parse_opt::<usize>("STEAM_BATCH_SIZE") {
            cfg.batch_size = n.max(1);
        }
        if let Some(lang) = env_opt("STEAM_LANGUAGE") {
            cfg.language = normalize_language(&lang);
        }
        if let Some(url) = env_opt("STEAM_STORE_API") {
            cfg.store_api = url.trim().to_string();
        }
        if let Some(url) = env_opt("STEAM_APP_LIST_API") {
            cfg.app_list_api = url.trim().to_string();
        }
        cfg
    }

    /// Both endpoints must be absolute http(s) URLs.
    pub fn validate(&self) -> anyhow::Result<()> {
        let endpoints = [
            ("store_api", &self.store_api),
            ("app_list_api", &self.app_list_api),
        ];
        for (name, raw) in endpoints {
            let url = Url::parse(raw).with_context(|| format!("invalid {name} url {raw:?}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("{name} must be http(s), got {raw:?}");
            }
        }
        Ok(())
    }

    /// Apply the same per-request delay to price and detail requests.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_pacing = self.request_pacing.with_base(delay);
        self.detail_pacing = self.detail_pacing.with_base(delay);
        self
    }
}

pub fn normalize_language(lang: &str) -> String {
    let s = lang.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    if s.is_empty() {
        "english".into()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=8).map(|a| policy.rate_limit_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[3], Duration::from_secs(40));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
        assert_eq!(delays[7], policy.max_delay);
        // absurd attempt numbers must not overflow
        assert_eq!(policy.rate_limit_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn transient_backoff_is_linear_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient_delay(1), Duration::from_secs(5));
        assert_eq!(policy.transient_delay(3), Duration::from_secs(15));
        assert_eq!(policy.transient_delay(9), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let d = policy.jitter(base);
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(15));
        }
        let pacing = Pacing::new(Duration::from_secs(30), 0.9, 1.1);
        for _ in 0..200 {
            let d = pacing.sample();
            assert!(d >= Duration::from_secs(27) && d <= Duration::from_secs(33));
        }
    }

    #[test]
    fn zero_pacing_never_sleeps() {
        assert_eq!(Pacing::none().sample(), Duration::ZERO);
        assert_eq!(RetryPolicy::immediate().rate_limit_delay(4), Duration::ZERO);
    }

    #[test]
    fn endpoints_are_validated() {
        assert!(FetchSettings::default().validate().is_ok());
        let bad = FetchSettings {
            store_api: "store.steampowered.com/api".into(),
            ..FetchSettings::default()
        };
        assert!(bad.validate().is_err());
        let ftp = FetchSettings {
            app_list_api: "ftp://example.com/list".into(),
            ..FetchSettings::default()
        };
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn language_is_normalized() {
        assert_eq!(normalize_language(" Brazilian Portuguese"), "brazilian_portuguese");
        assert_eq!(normalize_language(""), "english");
    }
}

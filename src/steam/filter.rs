//! Narrowing a raw catalog to the entries worth pricing.
//!
//! Two strategies: keyword and id-range heuristics (no network), and a probe
//! that looks up each candidate's details once and keeps real, released,
//! priced games.
use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::http::{RetryingClient, StoreRequest};
use super::models::{AppDetailsEnvelope, CatalogEntry};

/// Id ranges where most priced games live (inclusive).
pub const LIKELY_PRICED_ID_RANGES: &[(u64, u64)] =
    &[(0, 100_000), (200_000, 400_000), (500_000, 1_000_000)];

const GAME_KEYWORDS: &[&str] = &[
    "game",
    "rpg",
    "action",
    "adventure",
    "strategy",
    "shooter",
    "puzzle",
    "simulation",
    "sports",
    "racing",
    "indie",
];

const EXCLUDED_KEYWORDS: &[&str] = &[
    "demo",
    "beta",
    "test",
    "server",
    "dedicated",
    "soundtrack",
    "sdk",
    "dlc",
    "tool",
    "content pack",
    "artbook",
    "manual",
];

pub fn in_likely_range(id: u64) -> bool {
    LIKELY_PRICED_ID_RANGES
        .iter()
        .any(|(start, end)| (*start..=*end).contains(&id))
}

#[async_trait]
pub trait CatalogFilter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn select(&self, entries: &[CatalogEntry]) -> Vec<CatalogEntry>;
}

/// Keyword / id-range rules. Deterministic and offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicFilter;

impl HeuristicFilter {
    pub fn keep(&self, entry: &CatalogEntry) -> bool {
        let name = entry.name.to_lowercase();
        if EXCLUDED_KEYWORDS.iter().any(|k| name.contains(k)) {
            return false;
        }
        GAME_KEYWORDS.iter().any(|k| name.contains(k)) || in_likely_range(entry.id)
    }
}

#[async_trait]
impl CatalogFilter for HeuristicFilter {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn select(&self, entries: &[CatalogEntry]) -> Vec<CatalogEntry> {
        info!(apps = entries.len(), "filter: applying heuristics");
        let kept: Vec<CatalogEntry> = entries.iter().filter(|e| self.keep(e)).cloned().collect();
        info!(
            kept = kept.len(),
            removed = entries.len() - kept.len(),
            "filter: heuristics done"
        );
        kept
    }
}

/// What a detail lookup says an app is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCategory {
    PricedGame,
    FreeGame,
    Demo,
    Dlc,
    Unreleased,
    Other,
    /// Lookup failed or returned nothing usable.
    Invalid,
}

impl AppCategory {
    pub fn classify(entry: &CatalogEntry, details: Option<&Value>) -> Self {
        let Some(details) = details else {
            return Self::Invalid;
        };
        let app_type = details
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let name = entry.name.to_lowercase();
        let coming_soon = details
            .pointer("/release_date/coming_soon")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let is_free = details
            .get("is_free")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if app_type.contains("demo") || name.contains("demo") {
            Self::Demo
        } else if app_type == "dlc" || name.contains("dlc") {
            Self::Dlc
        } else if coming_soon {
            Self::Unreleased
        } else if app_type == "game" {
            if details.get("price_overview").is_some() {
                Self::PricedGame
            } else if is_free {
                Self::FreeGame
            } else {
                Self::Other
            }
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryTally {
    pub priced: usize,
    pub free: usize,
    pub demo: usize,
    pub dlc: usize,
    pub unreleased: usize,
    pub other: usize,
    pub invalid: usize,
}

impl CategoryTally {
    pub fn add(&mut self, category: AppCategory) {
        match category {
            AppCategory::PricedGame => self.priced += 1,
            AppCategory::FreeGame => self.free += 1,
            AppCategory::Demo => self.demo += 1,
            AppCategory::Dlc => self.dlc += 1,
            AppCategory::Unreleased => self.unreleased += 1,
            AppCategory::Other => self.other += 1,
            AppCategory::Invalid => self.invalid += 1,
        }
    }

    /// Priced share among priced + free games, if any were seen.
    pub fn priced_ratio(&self) -> Option<f64> {
        let valid = self.priced + self.free;
        (valid > 0).then(|| self.priced as f64 / valid as f64)
    }

    pub fn log(&self) {
        info!(
            priced = self.priced,
            free = self.free,
            demo = self.demo,
            dlc = self.dlc,
            unreleased = self.unreleased,
            other = self.other,
            invalid = self.invalid,
            "filter: app type distribution"
        );
        if let Some(ratio) = self.priced_ratio() {
            info!(ratio = %format!("{ratio:.2}"), "filter: ratio of priced to free games");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Up to `sample_size` ids, likely id ranges first.
    Sampled { sample_size: usize },
    /// The first `limit` entries, looked up in batches of `batch_size`.
    Exhaustive { limit: usize, batch_size: usize },
}

/// Pick up to `sample_size` entries, preferring the likely id ranges and
/// padding with the rest in catalog order.
pub fn sample_entries(entries: &[CatalogEntry], sample_size: usize) -> Vec<CatalogEntry> {
    let sample_size = sample_size.min(entries.len());
    let mut picked: Vec<CatalogEntry> = entries
        .iter()
        .filter(|e| in_likely_range(e.id))
        .take(sample_size)
        .cloned()
        .collect();
    let chosen: HashSet<u64> = picked.iter().map(|e| e.id).collect();
    let missing = sample_size - picked.len();
    picked.extend(
        entries
            .iter()
            .filter(|e| !chosen.contains(&e.id))
            .take(missing)
            .cloned(),
    );
    picked
}

/// Classifies candidates with one detail lookup each, in a single region.
pub struct DetailProbeFilter {
    client: RetryingClient,
    store_api: String,
    country: String,
    language: String,
    include_free: bool,
    mode: ProbeMode,
}

impl DetailProbeFilter {
    pub fn new(client: RetryingClient, store_api: &str, language: &str, mode: ProbeMode) -> Self {
        Self {
            client,
            store_api: store_api.to_string(),
            country: "US".to_string(),
            language: language.to_string(),
            include_free: false,
            mode,
        }
    }

    pub fn include_free(mut self, include_free: bool) -> Self {
        self.include_free = include_free;
        self
    }

    async fn details(&self, entry: &CatalogEntry) -> Option<Value> {
        let req = StoreRequest::app_details(&self.store_api, entry.id, &self.country, &self.language);
        match self.client.fetch(&req).await {
            Ok(body) => {
                let details = AppDetailsEnvelope::from_body(&body, &entry.key())
                    .and_then(|env| env.details().cloned());
                if details.is_none() {
                    debug!(app_id = entry.id, "filter: details not found or not successful");
                }
                details
            }
            Err(err) => {
                debug!(app_id = entry.id, error = %err, "filter: detail lookup failed");
                None
            }
        }
    }

    async fn classify_all(
        &self,
        candidates: &[CatalogEntry],
        batch_size: usize,
    ) -> Vec<(CatalogEntry, AppCategory)> {
        let batch_size = batch_size.max(1);
        let total_batches = candidates.len().div_ceil(batch_size);
        let mut out = Vec::with_capacity(candidates.len());
        let mut found = 0usize;
        for (i, batch) in candidates.chunks(batch_size).enumerate() {
            info!(
                batch = i + 1,
                total_batches,
                apps = batch.len(),
                "filter: fetching app details"
            );
            for entry in batch {
                let details = self.details(entry).await;
                if details.is_some() {
                    found += 1;
                }
                let category = AppCategory::classify(entry, details.as_ref());
                out.push((entry.clone(), category));
            }
            info!(retrieved = found, "filter: details retrieved so far");
        }
        out
    }
}

#[async_trait]
impl CatalogFilter for DetailProbeFilter {
    fn name(&self) -> &'static str {
        match self.mode {
            ProbeMode::Sampled { .. } => "sampled-probe",
            ProbeMode::Exhaustive { .. } => "exhaustive-probe",
        }
    }

    async fn select(&self, entries: &[CatalogEntry]) -> Vec<CatalogEntry> {
        let (candidates, batch_size) = match self.mode {
            ProbeMode::Sampled { sample_size } => (sample_entries(entries, sample_size), 10),
            ProbeMode::Exhaustive { limit, batch_size } => (
                entries.iter().take(limit).cloned().collect::<Vec<_>>(),
                batch_size,
            ),
        };
        info!(
            filter = self.name(),
            candidates = candidates.len(),
            country = %self.country,
            "filter: checking app details"
        );

        let mut tally = CategoryTally::default();
        let mut priced = Vec::new();
        let mut free = Vec::new();
        for (entry, category) in self.classify_all(&candidates, batch_size).await {
            tally.add(category);
            match category {
                AppCategory::PricedGame => priced.push(entry),
                AppCategory::FreeGame => free.push(entry),
                _ => {}
            }
        }
        tally.log();

        if self.include_free {
            priced.extend(free);
            info!(apps = priced.len(), "filter: returning priced and free apps");
        } else {
            info!(apps = priced.len(), "filter: returning priced apps only");
        }
        priced
    }
}

use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::http::{FetchError, RetryingClient, StoreRequest};
use super::models::{
    AppDetailsEnvelope, CatalogEntry, EntryPriceProfile, PriceOverview, Region, RegionPriceRecord,
};

/// Result of one (entry, region) price request.
#[derive(Debug)]
pub enum RegionOutcome {
    Priced(RegionPriceRecord),
    /// Lookup succeeded but the app has no price in this region (free, unavailable, removed).
    NoPrice,
    /// A price_overview was present but missing fields, or the body was not JSON.
    Malformed(String),
    /// Retries exhausted.
    Failed(FetchError),
}

/// Per-batch counters, reported after every batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub entries: usize,
    pub priced_entries: usize,
    pub region_hits: usize,
    pub no_price: usize,
    pub malformed: usize,
    pub failures: usize,
    pub rate_limited_failures: usize,
}

impl BatchStats {
    pub fn errors(&self) -> usize {
        self.failures + self.malformed
    }

    pub fn absorb(&mut self, other: &BatchStats) {
        self.entries += other.entries;
        self.priced_entries += other.priced_entries;
        self.region_hits += other.region_hits;
        self.no_price += other.no_price;
        self.malformed += other.malformed;
        self.failures += other.failures;
        self.rate_limited_failures += other.rate_limited_failures;
    }

    fn record(&mut self, outcome: &RegionOutcome) {
        match outcome {
            RegionOutcome::Priced(_) => self.region_hits += 1,
            RegionOutcome::NoPrice => self.no_price += 1,
            RegionOutcome::Malformed(_) => self.malformed += 1,
            RegionOutcome::Failed(err) => {
                self.failures += 1;
                if err.is_rate_limited() {
                    self.rate_limited_failures += 1;
                }
            }
        }
    }
}

/// Priced profiles of one batch, keyed by app id, plus its counters.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub profiles: IndexMap<String, EntryPriceProfile>,
    pub stats: BatchStats,
}

/// Interpret an appdetails body for one app and region.
pub fn parse_price_body(body: &Value, app_id: &str, region: &Region) -> RegionOutcome {
    let Some(envelope) = AppDetailsEnvelope::from_body(body, app_id) else {
        return RegionOutcome::Malformed(format!("no entry for app {app_id} in response"));
    };
    let Some(details) = envelope.details() else {
        return RegionOutcome::NoPrice;
    };
    let Some(raw) = details.get("price_overview") else {
        return RegionOutcome::NoPrice;
    };
    match serde_json::from_value::<PriceOverview>(raw.clone()) {
        Ok(overview) => RegionOutcome::Priced(RegionPriceRecord::from_overview(region, &overview)),
        Err(err) => RegionOutcome::Malformed(format!("price_overview: {err}")),
    }
}

/// Queries price data per (entry, region) pair, strictly in order.
pub struct RegionPriceFetcher {
    client: RetryingClient,
    store_api: String,
    language: String,
}

impl RegionPriceFetcher {
    pub fn new(client: RetryingClient, store_api: &str, language: &str) -> Self {
        Self {
            client,
            store_api: store_api.to_string(),
            language: language.to_string(),
        }
    }

    pub async fn fetch_region(&self, entry: &CatalogEntry, region: &Region) -> RegionOutcome {
        let req = StoreRequest::price_overview(
            &self.store_api,
            entry.id,
            &region.country_code,
            &self.language,
        );
        match self.client.fetch(&req).await {
            Ok(body) => parse_price_body(&body, &entry.key(), region),
            Err(err) if err.is_malformed() => RegionOutcome::Malformed(err.to_string()),
            Err(err) => RegionOutcome::Failed(err),
        }
    }

    /// Profile for one entry across `regions`. A failed region never stops the others.
    pub async fn fetch_entry(
        &self,
        entry: &CatalogEntry,
        regions: &[Region],
        stats: &mut BatchStats,
    ) -> EntryPriceProfile {
        let mut profile = EntryPriceProfile::new(entry.name.clone());
        for region in regions {
            let outcome = self.fetch_region(entry, region).await;
            stats.record(&outcome);
            match outcome {
                RegionOutcome::Priced(record) => {
                    debug!(
                        app_id = entry.id,
                        country = %region.country_code,
                        price = %record.formatted_display,
                        discount = record.discount_percent,
                        "steam: got price"
                    );
                    profile.insert_region(&region.country_code, record);
                }
                RegionOutcome::NoPrice => {
                    debug!(app_id = entry.id, country = %region.country_code, "steam: no price data");
                }
                RegionOutcome::Malformed(reason) => {
                    warn!(
                        app_id = entry.id,
                        country = %region.country_code,
                        reason = %reason,
                        "steam: malformed price response; skipping region"
                    );
                }
                RegionOutcome::Failed(err) => {
                    warn!(
                        app_id = entry.id,
                        country = %region.country_code,
                        error = %err,
                        "steam: price request failed; skipping region"
                    );
                }
            }
        }
        profile
    }

    /// Fetch a batch. Only entries priced in at least one region are returned.
    pub async fn fetch_batch(
        &self,
        batch_index: usize,
        entries: &[CatalogEntry],
        regions: &[Region],
    ) -> BatchOutcome {
        info!(
            batch = batch_index + 1,
            apps = entries.len(),
            regions = regions.len(),
            "steam: processing batch"
        );
        let started = Instant::now();
        let mut out = BatchOutcome::default();
        for (i, entry) in entries.iter().enumerate() {
            let profile = self.fetch_entry(entry, regions, &mut out.stats).await;
            out.stats.entries += 1;
            if profile.is_priced() {
                out.stats.priced_entries += 1;
                out.profiles.insert(entry.key(), profile);
            }
            if i % 5 == 0 || i + 1 == entries.len() {
                info!(
                    batch = batch_index + 1,
                    processed = i + 1,
                    total = entries.len(),
                    priced = out.stats.priced_entries,
                    errors = out.stats.errors(),
                    "steam: batch progress"
                );
            }
        }
        info!(
            batch = batch_index + 1,
            elapsed_secs = started.elapsed().as_secs_f64(),
            priced = out.stats.priced_entries,
            total = entries.len(),
            errors = out.stats.errors(),
            "steam: batch complete"
        );
        out
    }
}

/// Price of one app in every region, for the `probe` command.
pub async fn probe_app(
    fetcher: &RegionPriceFetcher,
    entry: &CatalogEntry,
    regions: &[Region],
) -> Vec<(Region, RegionOutcome)> {
    let mut out = Vec::with_capacity(regions.len());
    for region in regions {
        let outcome = fetcher.fetch_region(entry, region).await;
        out.push((region.clone(), outcome));
    }
    out
}

/// Compact table for [`probe_app`] output.
pub fn format_probe_table(app_id: u64, rows: &[(Region, RegionOutcome)]) -> String {
    let mut out = format!("prices for app {} across {} regions:\n", app_id, rows.len());
    out.push_str("cc  currency  final      initial    discount_pct  display\n");
    for (region, outcome) in rows {
        let line = match outcome {
            RegionOutcome::Priced(r) => format!(
                "{:<3} {:<8} {:>10.2} {:>10.2} {:>12}  {}",
                region.country_code,
                r.currency_code,
                r.final_amount,
                r.initial_amount,
                r.discount_percent,
                r.formatted_display
            ),
            RegionOutcome::NoPrice => format!("{:<3} {:<8} {:>10}", region.country_code, "-", "-"),
            RegionOutcome::Malformed(_) => {
                format!("{:<3} {:<8} {:>10}", region.country_code, "-", "malformed")
            }
            RegionOutcome::Failed(_) => {
                format!("{:<3} {:<8} {:>10}", region.country_code, "-", "failed")
            }
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pacing, RetryPolicy};
    use crate::steam::http::{StoreTransport, TransportError};
    use crate::steam::regions::default_regions;
    use crate::steam::testing::{price_body, query_value, wrap, FnTransport};
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::Arc;

    fn fetcher(transport: Arc<dyn StoreTransport>) -> RegionPriceFetcher {
        let client = RetryingClient::new(transport, RetryPolicy::immediate(), Pacing::none());
        RegionPriceFetcher::new(client, "http://store", "english")
    }

    fn three_regions() -> Vec<Region> {
        default_regions()
            .into_iter()
            .filter(|r| ["US", "GB", "JP"].contains(&r.country_code.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn failing_region_does_not_drop_the_others() {
        let transport = FnTransport::new(|_, query| {
            let id = query_value(query, "appids").unwrap();
            match query_value(query, "cc").unwrap() {
                "GB" => Err(TransportError::Status {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    retry_after: None,
                }),
                "JP" => Ok(price_body(id, 198000, 198000, 0)),
                _ => Ok(price_body(id, 1999, 1999, 0)),
            }
        });
        let entries = vec![CatalogEntry::new(620, "Portal 2")];
        let out = fetcher(transport.clone())
            .fetch_batch(0, &entries, &three_regions())
            .await;

        let profile = &out.profiles["620"];
        assert!(profile.has_price);
        assert_eq!(
            profile.regions.keys().collect::<Vec<_>>(),
            vec!["US", "JP"]
        );
        assert_eq!(profile.regions["US"].final_amount, 19.99);
        assert_eq!(profile.regions["JP"].final_amount, 1980.0);
        assert_eq!(out.stats.failures, 1);
        assert_eq!(out.stats.region_hits, 2);
        // 1 US + 5 GB attempts + 1 JP
        assert_eq!(transport.calls(), 7);
    }

    #[tokio::test]
    async fn entries_without_any_price_are_left_out() {
        let transport = FnTransport::new(|_, query| {
            let id = query_value(query, "appids").unwrap();
            if id == "1" {
                Ok(price_body(id, 999, 499, 50))
            } else {
                Ok(wrap(id, json!({"success": true, "data": []})))
            }
        });
        let entries = vec![
            CatalogEntry::new(1, "Paid"),
            CatalogEntry::new(2, "Free To Play"),
        ];
        let out = fetcher(transport)
            .fetch_batch(0, &entries, &three_regions())
            .await;
        assert_eq!(out.profiles.len(), 1);
        assert!(out.profiles.contains_key("1"));
        assert_eq!(out.stats.entries, 2);
        assert_eq!(out.stats.priced_entries, 1);
        assert_eq!(out.stats.no_price, 3);
        assert!(out.profiles.values().all(|p| p.is_priced()));
        assert_eq!(out.profiles["1"].regions["US"].savings_amount, 5.0);
    }

    #[test]
    fn parses_price_body_variants() {
        let us = Region::new("US", "USD", "$");
        assert!(matches!(
            parse_price_body(&price_body("5", 1999, 1999, 0), "5", &us),
            RegionOutcome::Priced(r) if r.final_amount == 19.99
        ));
        assert!(matches!(
            parse_price_body(&wrap("5", json!({"success": false})), "5", &us),
            RegionOutcome::NoPrice
        ));
        assert!(matches!(
            parse_price_body(&json!({}), "5", &us),
            RegionOutcome::Malformed(_)
        ));
        let missing_final = wrap(
            "5",
            json!({"success": true, "data": {"price_overview": {"initial": 100}}}),
        );
        assert!(matches!(
            parse_price_body(&missing_final, "5", &us),
            RegionOutcome::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn undecodable_body_counts_as_malformed_without_retry() {
        let transport = FnTransport::new(|_, _| Err(TransportError::Decode("bad json".into())));
        let entries = vec![CatalogEntry::new(3, "Broken")];
        let regions = vec![Region::new("US", "USD", "$")];
        let out = fetcher(transport.clone())
            .fetch_batch(0, &entries, &regions)
            .await;
        assert!(out.profiles.is_empty());
        assert_eq!(out.stats.malformed, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn probe_table_lists_every_region() {
        let transport = FnTransport::new(|_, query| {
            let id = query_value(query, "appids").unwrap();
            match query_value(query, "cc").unwrap() {
                "US" => Ok(price_body(id, 5999, 2999, 50)),
                _ => Ok(wrap(id, json!({"success": false}))),
            }
        });
        let f = fetcher(transport);
        let rows = probe_app(&f, &CatalogEntry::new(42, "Probe"), &three_regions()).await;
        let table = format_probe_table(42, &rows);
        assert!(table.contains("across 3 regions"));
        assert!(table.lines().any(|l| l.starts_with("US ") && l.contains("29.99")));
        assert!(table.lines().any(|l| l.starts_with("GB ")));
    }
}

//! Batch-level driver: slices the catalog, prices each batch, merges it into
//! the accumulator and persists after every batch so a run can resume.
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use itertools::Itertools;
use tracing::{error, info, warn};

use crate::config::Pacing;
use crate::steam::models::{CatalogEntry, MergeStats, PriceAccumulator, Region};
use crate::steam::prices::{BatchStats, RegionPriceFetcher};
use crate::store::{PriceStore, SnapshotWriter};

/// Counters summed over every completed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub stats: BatchStats,
    pub added: usize,
    pub overwritten: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub accumulator: PriceAccumulator,
    pub batches_completed: usize,
    pub total_batches: usize,
    pub totals: RunTotals,
    /// Set when the run stopped early and the last persisted state was returned.
    pub interrupted: Option<String>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none() && self.batches_completed == self.total_batches
    }

    /// Error when persistence failed mid-run, even though the fallback
    /// accumulator was recovered.
    pub fn ensure_persisted(&self) -> Result<()> {
        match &self.interrupted {
            Some(reason) => anyhow::bail!(
                "run stopped after {}/{} batches: {reason}",
                self.batches_completed,
                self.total_batches
            ),
            None => Ok(()),
        }
    }
}

/// `XmYs`, truncated to whole seconds.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}m{}s", secs / 60, secs % 60)
}

/// Remaining and total time, extrapolated from the mean batch duration so far.
pub fn estimate_remaining(
    elapsed: Duration,
    completed: usize,
    total: usize,
) -> (Duration, Duration) {
    if completed == 0 {
        return (Duration::ZERO, elapsed);
    }
    let per_batch = elapsed.div_f64(completed as f64);
    let remaining = per_batch.mul_f64(total.saturating_sub(completed) as f64);
    (remaining, elapsed + remaining)
}

pub struct BatchOrchestrator {
    fetcher: RegionPriceFetcher,
    store: Arc<dyn PriceStore>,
    snapshots: Option<SnapshotWriter>,
    batch_pacing: Pacing,
}

impl BatchOrchestrator {
    pub fn new(
        fetcher: RegionPriceFetcher,
        store: Arc<dyn PriceStore>,
        batch_pacing: Pacing,
    ) -> Self {
        Self {
            fetcher,
            store,
            snapshots: None,
            batch_pacing,
        }
    }

    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Price `entries` in batches of `batch_size` across `regions`.
    ///
    /// Starts from whatever the store already holds. A failed (entry, region)
    /// pair never stops a batch; only a failing store stops the run, in which
    /// case the last persisted accumulator is returned if there is one.
    pub async fn run(
        &self,
        entries: &[CatalogEntry],
        batch_size: usize,
        regions: &[Region],
    ) -> Result<RunReport> {
        let batch_size = batch_size.max(1);
        let total_batches = entries.len().div_ceil(batch_size);
        info!(
            apps = entries.len(),
            batch_size,
            total_batches,
            regions = %regions.iter().map(|r| r.country_code.as_str()).join(","),
            "orchestrator: starting multi-region price fetch"
        );

        let mut acc = self
            .store
            .load()
            .context("failed to load existing prices")?;
        if !acc.is_empty() {
            info!(existing = acc.len(), "orchestrator: resuming from saved prices");
        }

        let started = Instant::now();
        let mut totals = RunTotals::default();

        for (i, batch) in entries.chunks(batch_size).enumerate() {
            let batch_number = i + 1;
            info!(batch = batch_number, total_batches, "orchestrator: starting batch");
            let outcome = self.fetcher.fetch_batch(i, batch, regions).await;

            if let Some(writer) = &self.snapshots {
                writer.write(batch_number, &outcome.profiles);
            }

            let merged: MergeStats = acc.merge(outcome.profiles);
            totals.stats.absorb(&outcome.stats);
            totals.added += merged.added;
            totals.overwritten += merged.overwritten;

            if let Err(err) = self.store.save(&acc) {
                return self.fall_back(err, i, total_batches, totals);
            }

            let elapsed = started.elapsed();
            let (remaining, estimated_total) =
                estimate_remaining(elapsed, batch_number, total_batches);
            info!(
                batch = batch_number,
                total_batches,
                added = merged.added,
                overwritten = merged.overwritten,
                priced = outcome.stats.priced_entries,
                region_hits = outcome.stats.region_hits,
                no_price = outcome.stats.no_price,
                malformed = outcome.stats.malformed,
                failures = outcome.stats.failures,
                saved = acc.len(),
                "orchestrator: batch merged and saved"
            );
            info!(
                completed = batch_number,
                total_batches,
                elapsed = %format_duration(elapsed),
                remaining = %format_duration(remaining),
                estimated_total = %format_duration(estimated_total),
                "orchestrator: progress"
            );

            if batch_number < total_batches {
                let wait = self.batch_pacing.sample();
                if !wait.is_zero() {
                    info!(wait_secs = wait.as_secs_f64(), "orchestrator: waiting before next batch");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        info!(
            elapsed = %format_duration(started.elapsed()),
            entries = acc.len(),
            failures = totals.stats.failures,
            "orchestrator: multi-region price fetching complete"
        );
        Ok(RunReport {
            accumulator: acc,
            batches_completed: total_batches,
            total_batches,
            totals,
            interrupted: None,
        })
    }

    fn fall_back(
        &self,
        err: anyhow::Error,
        batches_completed: usize,
        total_batches: usize,
        totals: RunTotals,
    ) -> Result<RunReport> {
        error!(
            batch = batches_completed + 1,
            error = %format!("{err:#}"),
            "orchestrator: failed to save prices"
        );
        if !self.store.exists() {
            error!("orchestrator: no saved prices to fall back to");
            return Err(err.context("failed to save prices"));
        }
        match self.store.load() {
            Ok(accumulator) => {
                warn!(
                    entries = accumulator.len(),
                    "orchestrator: falling back to last saved prices"
                );
                Ok(RunReport {
                    accumulator,
                    batches_completed,
                    total_batches,
                    totals,
                    interrupted: Some(format!("{err:#}")),
                })
            }
            Err(load_err) => {
                error!(error = %format!("{load_err:#}"), "orchestrator: saved prices unreadable");
                Err(err.context("failed to save prices"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::steam::http::{RetryingClient, StoreTransport};
    use crate::steam::testing::{price_body, priced_profile, query_value, wrap, FnTransport};
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fetcher(transport: Arc<dyn StoreTransport>) -> RegionPriceFetcher {
        let client = RetryingClient::new(transport, RetryPolicy::immediate(), Pacing::none());
        RegionPriceFetcher::new(client, "http://store", "english")
    }

    /// Prices every app at `id` cents, except ids listed as free.
    fn store_api(free: &'static [&'static str]) -> Arc<dyn StoreTransport> {
        FnTransport::new(move |_, query| {
            let id = query_value(query, "appids").unwrap_or_default();
            if free.iter().any(|f| *f == id) {
                return Ok(wrap(id, json!({"success": true, "data": []})));
            }
            let cents: i64 = id.parse().unwrap_or(0);
            Ok(price_body(id, cents, cents, 0))
        })
    }

    fn regions() -> Vec<Region> {
        vec![Region::new("US", "USD", "$"), Region::new("JP", "JPY", "¥")]
    }

    fn entries(ids: &[u64]) -> Vec<CatalogEntry> {
        ids.iter()
            .map(|id| CatalogEntry::new(*id, format!("App {id}")))
            .collect()
    }

    /// Records the accumulator size at every save; fails after `ok_saves`.
    struct RecordingStore {
        inner: MemoryStore,
        sizes: Mutex<Vec<Vec<String>>>,
        ok_saves: usize,
        saves: AtomicUsize,
    }

    impl RecordingStore {
        fn new(ok_saves: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                sizes: Mutex::new(Vec::new()),
                ok_saves,
                saves: AtomicUsize::new(0),
            }
        }
    }

    impl PriceStore for RecordingStore {
        fn load(&self) -> Result<PriceAccumulator> {
            self.inner.load()
        }

        fn save(&self, acc: &PriceAccumulator) -> Result<()> {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.ok_saves {
                return Err(anyhow!("disk full"));
            }
            self.sizes
                .lock()
                .unwrap()
                .push(acc.ids().map(str::to_string).collect());
            self.inner.save(acc)
        }

        fn exists(&self) -> bool {
            self.inner.exists()
        }
    }

    #[tokio::test]
    async fn persists_after_every_batch_and_never_shrinks() {
        let store = Arc::new(RecordingStore::new(usize::MAX));
        let orch = BatchOrchestrator::new(fetcher(store_api(&["20"])), store.clone(), Pacing::none());
        let report = orch
            .run(&entries(&[10, 20, 30, 40, 50]), 2, &regions())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert!(report.ensure_persisted().is_ok());
        assert_eq!(report.total_batches, 3);
        assert_eq!(report.accumulator.ids().collect::<Vec<_>>(), vec!["10", "30", "40", "50"]);
        assert_eq!(report.totals.added, 4);
        assert_eq!(report.totals.stats.no_price, 2);

        let saves = store.sizes.lock().unwrap().clone();
        assert_eq!(saves.len(), 3);
        for pair in saves.windows(2) {
            assert!(pair[0].iter().all(|id| pair[1].contains(id)));
        }
    }

    #[tokio::test]
    async fn resumes_from_saved_prices() {
        let saved: PriceAccumulator = vec![
            ("1".to_string(), priced_profile("Old One", "US", 100)),
            ("2".to_string(), priced_profile("Old Two", "US", 200)),
        ]
        .into_iter()
        .collect();
        let store = Arc::new(MemoryStore::with(saved));
        let orch = BatchOrchestrator::new(fetcher(store_api(&[])), store.clone(), Pacing::none());
        let report = orch.run(&entries(&[2, 3]), 5, &regions()).await.unwrap();

        let acc = &report.accumulator;
        assert_eq!(acc.ids().collect::<Vec<_>>(), vec!["1", "2", "3"]);
        assert_eq!(acc.get("1").unwrap().entry_name, "Old One");
        // re-fetched entry is overwritten with the fresh profile
        assert_eq!(acc.get("2").unwrap().entry_name, "App 2");
        assert_eq!(acc.get("2").unwrap().regions.len(), 2);
        assert_eq!(report.totals.overwritten, 1);
        assert_eq!(store.snapshot().unwrap(), report.accumulator);
    }

    #[tokio::test]
    async fn save_failure_falls_back_to_last_saved_state() {
        let store = Arc::new(RecordingStore::new(1));
        let orch = BatchOrchestrator::new(fetcher(store_api(&[])), store.clone(), Pacing::none());
        let report = orch
            .run(&entries(&[10, 20, 30]), 1, &regions())
            .await
            .unwrap();

        assert_eq!(report.batches_completed, 1);
        assert_eq!(report.total_batches, 3);
        assert!(report.interrupted.as_deref().unwrap().contains("disk full"));
        assert_eq!(report.accumulator.ids().collect::<Vec<_>>(), vec!["10"]);
        assert!(!report.is_complete());

        let err = report.ensure_persisted().unwrap_err();
        assert!(err.to_string().contains("1/3 batches"));
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn save_failure_without_saved_state_is_fatal() {
        let store = Arc::new(MemoryStore::failing());
        let orch = BatchOrchestrator::new(fetcher(store_api(&[])), store, Pacing::none());
        let err = orch.run(&entries(&[10]), 1, &regions()).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to save prices"));
    }

    #[tokio::test]
    async fn empty_catalog_is_a_complete_noop() {
        let store = Arc::new(MemoryStore::new());
        let orch = BatchOrchestrator::new(fetcher(store_api(&[])), store.clone(), Pacing::none());
        let report = orch.run(&[], 0, &regions()).await.unwrap();
        assert_eq!(report.total_batches, 0);
        assert!(report.is_complete());
        assert!(store.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_batches_but_not_after_the_last() {
        let wait = Duration::from_millis(300);
        let orch = BatchOrchestrator::new(
            fetcher(store_api(&[])),
            Arc::new(MemoryStore::new()),
            Pacing::new(wait, 1.0, 1.0),
        );

        let started = tokio::time::Instant::now();
        orch.run(&entries(&[10, 20]), 1, &regions()).await.unwrap();
        assert_eq!(started.elapsed(), wait);

        let started = tokio::time::Instant::now();
        orch.run(&entries(&[10, 20, 30]), 1, &regions()).await.unwrap();
        assert_eq!(started.elapsed(), wait * 2);

        let started = tokio::time::Instant::now();
        orch.run(&entries(&[10, 20, 30]), 5, &regions()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn eta_math() {
        let (remaining, total) = estimate_remaining(Duration::from_secs(120), 2, 5);
        assert_eq!(remaining, Duration::from_secs(180));
        assert_eq!(total, Duration::from_secs(300));
        assert_eq!(estimate_remaining(Duration::from_secs(9), 3, 3).0, Duration::ZERO);
        assert_eq!(format_duration(Duration::from_secs(305)), "5m5s");
        assert_eq!(format_duration(Duration::from_millis(59_900)), "0m59s");
    }
}

//! Steam app catalog: the live app list with an on-disk cache fallback, and
//! the id-based selection rules applied before pricing.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::http::{RetryingClient, StoreRequest};
use super::models::CatalogEntry;
use crate::store::write_json_atomic;

// Well-known titles that carry a price in every region.
const POPULAR_APP_IDS: &[u64] = &[
    730, 570, 578080, 252490, 1172470, 359550, 1938090, 271590, 1086940, 1222670, 292030,
    1091500, 2050650, 1811260, 1245620, 440, 230410, 550, 105600, 620, 1172620, 1293830,
    1240440, 1506830, 361420, 431960, 582010, 594570, 289070, 477160, 291550, 227300, 374320,
    391540, 8930, 218620, 236390, 377160, 736260, 381210, 1446780, 435150, 646570, 1174180,
    1174370, 814380, 306130, 240, 219990, 648800, 322330, 311210, 252950, 312060, 1281930,
];

pub fn popular_app_ids() -> Vec<u64> {
    POPULAR_APP_IDS.iter().copied().unique().collect()
}

#[derive(Debug, Deserialize)]
struct AppListResponse {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<CatalogEntry>,
}

pub fn read_entries(path: &Path) -> Result<Vec<CatalogEntry>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read app list {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse app list JSON {}", path.display()))?;
    Ok(entries)
}

pub fn write_entries(path: &Path, entries: &[CatalogEntry]) -> Result<()> {
    write_json_atomic(path, &entries)
}

/// The live app list, cached to `apps.json` after every successful fetch.
pub struct CatalogSource {
    client: RetryingClient,
    app_list_api: String,
    cache_path: PathBuf,
}

impl CatalogSource {
    pub fn new(client: RetryingClient, app_list_api: &str, cache_path: PathBuf) -> Self {
        Self {
            client,
            app_list_api: app_list_api.to_string(),
            cache_path,
        }
    }

    async fn fetch_live(&self) -> Result<Vec<CatalogEntry>> {
        let body = self
            .client
            .fetch(&StoreRequest::app_list(&self.app_list_api))
            .await?;
        let parsed: AppListResponse =
            serde_json::from_value(body).context("invalid response format from app list API")?;
        Ok(parsed.applist.apps)
    }

    /// Fetch the catalog, falling back to the cache when the live list is
    /// unavailable. Fails only when both are.
    pub async fn load(&self) -> Result<Vec<CatalogEntry>> {
        info!(url = %self.app_list_api, "catalog: fetching app list");
        match self.fetch_live().await {
            Ok(entries) => {
                info!(apps = entries.len(), "catalog: retrieved app list");
                if let Err(err) = write_entries(&self.cache_path, &entries) {
                    warn!(
                        path = %self.cache_path.display(),
                        error = %err,
                        "catalog: failed to cache app list"
                    );
                } else {
                    debug!(path = %self.cache_path.display(), "catalog: app list cached");
                }
                Ok(entries)
            }
            Err(err) if self.cache_path.exists() => {
                warn!(error = %err, "catalog: using cached app list due to API error");
                let cached = read_entries(&self.cache_path)?;
                info!(apps = cached.len(), "catalog: loaded app list from cache");
                Ok(cached)
            }
            Err(err) => Err(err.context("app list unavailable and no cached copy exists")),
        }
    }
}

/// Caller-side narrowing of the catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogSelection {
    pub min_id: Option<u64>,
    pub max_id: Option<u64>,
    pub popular_only: bool,
    pub full: bool,
    pub max_apps: Option<usize>,
    pub limit: Option<usize>,
}

impl CatalogSelection {
    /// Id bounds, applied before any filtering.
    pub fn apply_bounds(&self, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        if self.min_id.is_none() && self.max_id.is_none() {
            return entries;
        }
        let before = entries.len();
        let kept: Vec<CatalogEntry> = entries
            .into_iter()
            .filter(|e| self.min_id.map_or(true, |min| e.id >= min))
            .filter(|e| self.max_id.map_or(true, |max| e.id <= max))
            .collect();
        info!(
            min_id = ?self.min_id,
            max_id = ?self.max_id,
            kept = kept.len(),
            removed = before - kept.len(),
            "catalog: applied id bounds"
        );
        kept
    }

    /// Popular-only / full / limit, applied after filtering.
    pub fn apply_scope(&self, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        let mut out = if self.popular_only {
            let popular: HashSet<u64> = popular_app_ids().into_iter().collect();
            let picked: Vec<CatalogEntry> = entries
                .into_iter()
                .filter(|e| popular.contains(&e.id))
                .collect();
            info!(apps = picked.len(), "catalog: selected popular apps");
            picked
        } else if self.full {
            let mut sorted = entries;
            sorted.sort_by_key(|e| e.id);
            match self.max_apps.filter(|n| *n > 0) {
                Some(n) => {
                    info!(max_apps = n, "catalog: processing all apps with limit");
                    sorted.truncate(n);
                }
                None => info!("catalog: processing all apps (no limit)"),
            }
            warn!("catalog: processing all apps may take a very long time and hit API rate limits");
            sorted
        } else {
            entries
        };
        if let Some(n) = self.limit.filter(|n| *n > 0) {
            if !self.full {
                info!(limit = n, "catalog: limiting apps");
                out.truncate(n);
            }
        }
        out
    }

    pub fn apply(&self, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        self.apply_scope(self.apply_bounds(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pacing, RetryPolicy};
    use crate::steam::http::TransportError;
    use crate::steam::testing::FnTransport;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("catalog-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entries(ids: &[u64]) -> Vec<CatalogEntry> {
        ids.iter()
            .map(|id| CatalogEntry::new(*id, format!("App {id}")))
            .collect()
    }

    fn ids(entries: &[CatalogEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn live_list_is_cached_then_used_as_fallback() {
        let dir = temp_dir();
        let cache = dir.join("apps.json");

        let ok = FnTransport::new(|_, _| {
            Ok(json!({"applist": {"apps": [
                {"appid": 10, "name": "Counter-Strike"},
                {"appid": 20}
            ]}}))
        });
        let client = RetryingClient::new(ok, RetryPolicy::immediate(), Pacing::none());
        let live = CatalogSource::new(client, "http://list", cache.clone())
            .load()
            .await
            .unwrap();
        assert_eq!(ids(&live), vec![10, 20]);
        assert_eq!(live[1].name, "");
        assert!(cache.exists());

        let down = FnTransport::new(|_, _| Err(TransportError::Timeout));
        let client = RetryingClient::new(down, RetryPolicy::immediate(), Pacing::none());
        let cached = CatalogSource::new(client, "http://list", cache.clone())
            .load()
            .await
            .unwrap();
        assert_eq!(cached, live);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn bad_shape_without_cache_is_an_error() {
        let dir = temp_dir();
        let t = FnTransport::new(|_, _| Ok(json!({"response": {}})));
        let client = RetryingClient::new(t, RetryPolicy::immediate(), Pacing::none());
        let err = CatalogSource::new(client, "http://list", dir.join("apps.json"))
            .load()
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("no cached copy"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn popular_list_has_no_duplicates() {
        let ids = popular_app_ids();
        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(ids.contains(&730));
    }

    #[test]
    fn bounds_then_scope() {
        let sel = CatalogSelection {
            min_id: Some(100),
            max_id: Some(600),
            limit: Some(2),
            ..Default::default()
        };
        let out = sel.apply(entries(&[50, 620, 440, 550, 570, 700]));
        assert_eq!(ids(&out), vec![440, 550]);
    }

    #[test]
    fn full_sorts_and_ignores_limit() {
        let sel = CatalogSelection {
            full: true,
            max_apps: Some(3),
            limit: Some(1),
            ..Default::default()
        };
        let out = sel.apply(entries(&[900, 10, 500, 30]));
        assert_eq!(ids(&out), vec![10, 30, 500]);
    }

    #[test]
    fn popular_only_keeps_catalog_order() {
        let sel = CatalogSelection {
            popular_only: true,
            ..Default::default()
        };
        let out = sel.apply(entries(&[620, 12345, 730, 999_999_999, 570]));
        assert_eq!(ids(&out), vec![620, 730, 570]);
    }
}

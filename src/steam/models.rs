use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One app from the Steam catalog listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "appid")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

impl CatalogEntry {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Accumulator key; ids are stored as strings like the appdetails payload keys.
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A pricing jurisdiction (country code + currency).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub country_code: String,
    pub currency_code: String,
    pub currency_symbol: String,
}

impl Region {
    pub fn new(country_code: &str, currency_code: &str, currency_symbol: &str) -> Self {
        Self {
            country_code: country_code.trim().to_ascii_uppercase(),
            currency_code: currency_code.trim().to_ascii_uppercase(),
            currency_symbol: currency_symbol.trim().to_string(),
        }
    }
}

/// `price_overview` object of an appdetails response. Amounts are minor units.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceOverview {
    #[serde(default)]
    pub currency: Option<String>,
    pub initial: i64,
    #[serde(rename = "final")]
    pub final_price: i64,
    pub discount_percent: i64,
    #[serde(default)]
    pub initial_formatted: Option<String>,
    pub final_formatted: String,
}

/// One `{"<appid>": {...}}` member of an appdetails response.
#[derive(Debug, Deserialize)]
pub struct AppDetailsEnvelope {
    pub success: bool,
    // Steam sends `[]` instead of an object when a filtered request has nothing to return.
    #[serde(default)]
    pub data: Option<Value>,
}

impl AppDetailsEnvelope {
    /// Pull the envelope for `app_id` out of a raw appdetails body.
    pub fn from_body(body: &Value, app_id: &str) -> Option<Self> {
        let entry = body.get(app_id)?;
        serde_json::from_value(entry.clone()).ok()
    }

    /// The `data` object when the lookup succeeded and returned one.
    pub fn details(&self) -> Option<&Value> {
        if !self.success {
            return None;
        }
        self.data.as_ref().filter(|d| d.is_object())
    }
}

/// Price of one entry in one region, in major currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPriceRecord {
    #[serde(rename = "currency")]
    pub currency_code: String,
    #[serde(rename = "symbol")]
    pub currency_symbol: String,
    #[serde(rename = "initial")]
    pub initial_amount: f64,
    #[serde(rename = "final")]
    pub final_amount: f64,
    pub discount_percent: u8,
    #[serde(rename = "formatted")]
    pub formatted_display: String,
    #[serde(rename = "savings")]
    pub savings_amount: f64,
}

impl RegionPriceRecord {
    pub fn from_overview(region: &Region, overview: &PriceOverview) -> Self {
        let discount_percent = overview.discount_percent.clamp(0, 100) as u8;
        let savings_minor = if discount_percent > 0 {
            overview.initial - overview.final_price
        } else {
            0
        };
        Self {
            currency_code: region.currency_code.clone(),
            currency_symbol: region.currency_symbol.clone(),
            initial_amount: minor_to_major(overview.initial),
            final_amount: minor_to_major(overview.final_price),
            discount_percent,
            formatted_display: overview.final_formatted.clone(),
            savings_amount: minor_to_major(savings_minor),
        }
    }

    pub fn is_discounted(&self) -> bool {
        self.discount_percent > 0
    }

    pub fn is_free(&self) -> bool {
        self.final_amount == 0.0
    }
}

pub fn minor_to_major(minor: i64) -> f64 {
    minor as f64 / 100.0
}

/// All region prices collected for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPriceProfile {
    #[serde(rename = "name")]
    pub entry_name: String,
    #[serde(default)]
    pub regions: IndexMap<String, RegionPriceRecord>,
    #[serde(default)]
    pub has_price: bool,
}

impl EntryPriceProfile {
    pub fn new(entry_name: impl Into<String>) -> Self {
        Self {
            entry_name: entry_name.into(),
            regions: IndexMap::new(),
            has_price: false,
        }
    }

    pub fn insert_region(&mut self, country_code: &str, record: RegionPriceRecord) {
        self.regions.insert(country_code.to_string(), record);
        self.has_price = true;
    }

    /// Worth persisting: flagged priced and actually holding a region.
    pub fn is_priced(&self) -> bool {
        self.has_price && !self.regions.is_empty()
    }
}

/// Persisted map of app id to price profile.
///
/// Only priced profiles are ever admitted, so an unpriced profile can never
/// reach disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceAccumulator(IndexMap<String, EntryPriceProfile>);

/// Counts from merging one batch into the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub overwritten: usize,
    pub rejected: usize,
}

impl PriceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&EntryPriceProfile> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntryPriceProfile)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert or overwrite one profile. Returns false when the profile is unpriced.
    pub fn insert(&mut self, id: impl Into<String>, profile: EntryPriceProfile) -> bool {
        if !profile.is_priced() {
            return false;
        }
        self.0.insert(id.into(), profile);
        true
    }

    /// Merge a batch: new ids are appended, existing ids overwritten, nothing removed.
    pub fn merge<I>(&mut self, batch: I) -> MergeStats
    where
        I: IntoIterator<Item = (String, EntryPriceProfile)>,
    {
        let mut stats = MergeStats::default();
        for (id, profile) in batch {
            let existed = self.contains(&id);
            if !self.insert(id, profile) {
                stats.rejected += 1;
            } else if existed {
                stats.overwritten += 1;
            } else {
                stats.added += 1;
            }
        }
        stats
    }

    /// Drop unpriced profiles (e.g. from a hand-edited file). Returns how many were dropped.
    pub fn retain_priced(&mut self) -> usize {
        let before = self.0.len();
        self.0.retain(|_, p| p.is_priced());
        before - self.0.len()
    }
}

impl FromIterator<(String, EntryPriceProfile)> for PriceAccumulator {
    fn from_iter<T: IntoIterator<Item = (String, EntryPriceProfile)>>(iter: T) -> Self {
        let mut acc = Self::new();
        acc.merge(iter);
        acc
    }
}

//! Durable storage for the price accumulator.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::steam::models::{EntryPriceProfile, PriceAccumulator};

pub const ACCUMULATOR_DIR: &str = "multi_region";
pub const ACCUMULATOR_FILE: &str = "multi_region_prices.json";

/// Serialize `value` as pretty JSON and move it into place atomically:
/// temp sibling, fsync, rename. A crash leaves either the old or the new file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid output path {}", path.display()))?;
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    let written = (|| -> Result<()> {
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create temp file {}", tmp.display()))?;
        f.write_all(&bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Where the accumulator lives between batches and across runs.
pub trait PriceStore: Send + Sync {
    /// Previously persisted accumulator; empty when nothing was saved yet.
    fn load(&self) -> Result<PriceAccumulator>;
    fn save(&self, acc: &PriceAccumulator) -> Result<()>;
    fn exists(&self) -> bool;
}

/// Pretty JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<output_dir>/multi_region/multi_region_prices.json`
    pub fn in_output_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(ACCUMULATOR_DIR).join(ACCUMULATOR_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PriceStore for JsonFileStore {
    fn load(&self) -> Result<PriceAccumulator> {
        if !self.path.exists() {
            return Ok(PriceAccumulator::new());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut acc: PriceAccumulator = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        let dropped = acc.retain_priced();
        if dropped > 0 {
            warn!(
                path = %self.path.display(),
                dropped,
                "store: dropped unpriced entries from saved prices"
            );
        }
        info!(
            path = %self.path.display(),
            entries = acc.len(),
            "store: loaded existing prices"
        );
        Ok(acc)
    }

    fn save(&self, acc: &PriceAccumulator) -> Result<()> {
        write_json_atomic(&self.path, acc)?;
        debug!(path = %self.path.display(), entries = acc.len(), "store: saved prices");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// In-process store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<PriceAccumulator>>,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(acc: PriceAccumulator) -> Self {
        Self {
            saved: Mutex::new(Some(acc)),
            fail_saves: false,
        }
    }

    /// A store whose `save` always errors (simulates a full disk).
    pub fn failing() -> Self {
        Self {
            saved: Mutex::new(None),
            fail_saves: true,
        }
    }

    pub fn snapshot(&self) -> Option<PriceAccumulator> {
        self.saved.lock().ok().and_then(|g| g.clone())
    }
}

impl PriceStore for MemoryStore {
    fn load(&self) -> Result<PriceAccumulator> {
        let guard = self
            .saved
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let mut acc = guard.clone().unwrap_or_default();
        acc.retain_priced();
        Ok(acc)
    }

    fn save(&self, acc: &PriceAccumulator) -> Result<()> {
        if self.fail_saves {
            return Err(anyhow!("memory store refuses writes"));
        }
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        *guard = Some(acc.clone());
        Ok(())
    }

    fn exists(&self) -> bool {
        self.saved.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

/// Per-batch audit files: `multi_region_prices_batch_<n>.json`.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn in_output_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(ACCUMULATOR_DIR))
    }

    pub fn path_for(&self, batch_number: usize) -> PathBuf {
        self.dir
            .join(format!("multi_region_prices_batch_{batch_number}.json"))
    }

    /// Best effort; failures are only logged.
    pub fn write<'a, I>(&self, batch_number: usize, profiles: I)
    where
        I: IntoIterator<Item = (&'a String, &'a EntryPriceProfile)>,
    {
        let path = self.path_for(batch_number);
        let batch: indexmap::IndexMap<&String, &EntryPriceProfile> = profiles.into_iter().collect();
        match write_json_atomic(&path, &batch) {
            Ok(()) => debug!(path = %path.display(), entries = batch.len(), "store: wrote batch snapshot"),
            Err(err) => warn!(path = %path.display(), error = %err, "store: failed to write batch snapshot"),
        }
    }
}

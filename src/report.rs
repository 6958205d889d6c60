//! CSV exports and a console summary built from a saved accumulator.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use tracing::{info, warn};

use crate::steam::models::PriceAccumulator;

pub const FLAT_CSV: &str = "multi_region_prices.csv";
pub const COMPARISON_CSV: &str = "region_price_comparison.csv";
const BASE_COUNTRY: &str = "US";

/// One (app, region) price row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRow {
    pub app_id: String,
    pub name: String,
    pub country: String,
    pub currency: String,
    pub currency_symbol: String,
    pub initial_price: f64,
    pub final_price: f64,
    pub discount_percent: u8,
    pub formatted_price: String,
    pub savings: f64,
    pub is_free: bool,
    pub is_discounted: bool,
}

pub fn price_rows(acc: &PriceAccumulator) -> Vec<PriceRow> {
    acc.iter()
        .filter(|(_, p)| p.is_priced())
        .flat_map(|(id, p)| {
            p.regions.iter().map(move |(cc, r)| PriceRow {
                app_id: id.to_string(),
                name: p.entry_name.clone(),
                country: cc.clone(),
                currency: r.currency_code.clone(),
                currency_symbol: r.currency_symbol.clone(),
                initial_price: r.initial_amount,
                final_price: r.final_amount,
                discount_percent: r.discount_percent,
                formatted_price: r.formatted_display.clone(),
                savings: r.savings_amount,
                is_free: r.is_free(),
                is_discounted: r.is_discounted(),
            })
        })
        .collect()
}

/// Countries in first-seen order.
fn countries(rows: &[PriceRow]) -> Vec<String> {
    rows.iter().map(|r| r.country.clone()).unique().collect()
}

/// `(cc / base - 1) * 100`, when both prices exist and the base is non-zero.
pub fn diff_pct(price: Option<f64>, base: Option<f64>) -> Option<f64> {
    match (price, base) {
        (Some(p), Some(b)) if b != 0.0 => Some((p / b - 1.0) * 100.0),
        _ => None,
    }
}

/// One row of the comparison table: final price per country plus the
/// difference against the US price.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    pub app_id: String,
    pub name: String,
    pub prices: IndexMap<String, f64>,
    pub diffs: IndexMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonTable {
    pub countries: Vec<String>,
    /// Countries with a `<CC>_vs_US_diff_pct` column; empty when no US prices exist.
    pub diff_countries: Vec<String>,
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    pub fn build(rows: &[PriceRow]) -> Self {
        let countries = countries(rows);
        let diff_countries: Vec<String> = if countries.iter().any(|c| c == BASE_COUNTRY) {
            countries
                .iter()
                .filter(|c| *c != BASE_COUNTRY)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut by_app: IndexMap<(String, String), IndexMap<String, f64>> = IndexMap::new();
        for r in rows {
            by_app
                .entry((r.app_id.clone(), r.name.clone()))
                .or_default()
                .entry(r.country.clone())
                .or_insert(r.final_price);
        }

        let rows = by_app
            .into_iter()
            .map(|((app_id, name), prices)| {
                let base = prices.get(BASE_COUNTRY).copied();
                let diffs = diff_countries
                    .iter()
                    .map(|cc| (cc.clone(), diff_pct(prices.get(cc).copied(), base)))
                    .collect();
                ComparisonRow {
                    app_id,
                    name,
                    prices,
                    diffs,
                }
            })
            .collect();

        Self {
            countries,
            diff_countries,
            rows,
        }
    }

    pub fn header(&self) -> Vec<String> {
        let mut h = vec!["app_id".to_string(), "name".to_string()];
        h.extend(self.countries.iter().cloned());
        h.extend(
            self.diff_countries
                .iter()
                .map(|cc| format!("{cc}_vs_US_diff_pct")),
        );
        h
    }

    pub fn records(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.rows.iter().map(|row| {
            let mut rec = vec![row.app_id.clone(), row.name.clone()];
            rec.extend(
                self.countries
                    .iter()
                    .map(|cc| row.prices.get(cc).map(|p| p.to_string()).unwrap_or_default()),
            );
            rec.extend(self.diff_countries.iter().map(|cc| {
                row.diffs
                    .get(cc)
                    .copied()
                    .flatten()
                    .map(|d| format!("{d:.2}"))
                    .unwrap_or_default()
            }));
            rec
        })
    }
}

/// Per-country averages for the console summary.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    pub country: String,
    pub apps: usize,
    pub avg_final_price: f64,
    pub mean_diff_vs_us: Option<f64>,
}

/// Sorted by average final price, highest first.
pub fn summarize(rows: &[PriceRow], table: &ComparisonTable) -> Vec<RegionSummary> {
    let mut out: Vec<RegionSummary> = rows
        .iter()
        .into_group_map_by(|r| r.country.clone())
        .into_iter()
        .map(|(country, group)| {
            let avg_final_price =
                group.iter().map(|r| r.final_price).sum::<f64>() / group.len() as f64;
            let diffs: Vec<f64> = table
                .rows
                .iter()
                .filter_map(|row| row.diffs.get(&country).copied().flatten())
                .collect();
            let mean_diff_vs_us =
                (!diffs.is_empty()).then(|| diffs.iter().sum::<f64>() / diffs.len() as f64);
            RegionSummary {
                country,
                apps: group.len(),
                avg_final_price,
                mean_diff_vs_us,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.avg_final_price
            .total_cmp(&a.avg_final_price)
            .then_with(|| a.country.cmp(&b.country))
    });
    out
}

pub fn write_flat_csv(rows: &[PriceRow], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("open {}", path.display()))?;
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_comparison_csv(table: &ComparisonTable, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("open {}", path.display()))?;
    wtr.write_record(table.header())?;
    for rec in table.records() {
        wtr.write_record(&rec)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn print_summary(summary: &[RegionSummary]) {
    println!("average final price by region (local currency):");
    for s in summary {
        let diff = s
            .mean_diff_vs_us
            .map(|d| format!("{d:+.1}% vs US"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<3} {:>5} apps  avg {:>12.2}  {}",
            s.country, s.apps, s.avg_final_price, diff
        );
    }
}

#[derive(Debug)]
pub struct ReportOutput {
    pub flat_csv: PathBuf,
    pub comparison_csv: PathBuf,
    pub rows: usize,
    pub summary: Vec<RegionSummary>,
}

/// Write both CSVs into `output_dir` and compute the summary.
pub fn generate(acc: &PriceAccumulator, output_dir: &Path) -> Result<Option<ReportOutput>> {
    let rows = price_rows(acc);
    if rows.is_empty() {
        warn!("report: no priced entries to report on");
        return Ok(None);
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let table = ComparisonTable::build(&rows);
    let flat_csv = output_dir.join(FLAT_CSV);
    let comparison_csv = output_dir.join(COMPARISON_CSV);
    write_flat_csv(&rows, &flat_csv)?;
    write_comparison_csv(&table, &comparison_csv)?;
    info!(
        rows = rows.len(),
        apps = table.rows.len(),
        countries = %table.countries.iter().join(","),
        flat = %flat_csv.display(),
        comparison = %comparison_csv.display(),
        "report: wrote price reports"
    );

    Ok(Some(ReportOutput {
        flat_csv,
        comparison_csv,
        rows: rows.len(),
        summary: summarize(&rows, &table),
    }))
}

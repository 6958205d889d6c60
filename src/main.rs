use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use itertools::Itertools;
use steam_region_prices::{
    config::{FetchSettings, Pacing},
    logging::init_tracing,
    orchestrator::{format_duration, BatchOrchestrator},
    report,
    steam::{
        catalog::{read_entries, write_entries, CatalogSelection, CatalogSource},
        filter::{CatalogFilter, DetailProbeFilter, HeuristicFilter, ProbeMode},
        models::{CatalogEntry, Region},
        prices::{format_probe_table, probe_app, RegionPriceFetcher},
        regions::{regions_from_env, select_regions},
        ReqwestTransport, RetryingClient, StoreTransport,
    },
    store::{JsonFileStore, PriceStore, SnapshotWriter},
    util::env as env_util,
};
use tracing::{info, warn};

const CATALOG_CACHE_FILE: &str = "apps.json";
const FILTERED_CACHE_FILE: &str = "filtered_apps.json";

const CONFIG_KEYS: &[&str] = &[
    "STEAM_REQUEST_DELAY_SECS",
    "STEAM_DETAIL_DELAY_SECS",
    "STEAM_BATCH_DELAY_SECS",
    "STEAM_MAX_RETRIES",
    "STEAM_RETRY_INITIAL_SECS",
    "STEAM_RETRY_MAX_SECS",
    "STEAM_HTTP_TIMEOUT_SECS",
    "STEAM_BATCH_SIZE",
    "STEAM_LANGUAGE",
    "STEAM_REGIONS",
    "STEAM_STORE_API",
    "STEAM_APP_LIST_API",
];

#[derive(Parser, Debug)]
#[command(
    name = "steam-region-prices",
    version,
    about = "Harvest Steam store prices across currency regions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory for apps.json, the price map and CSV reports
    #[arg(long, global = true, default_value = "data")]
    output_dir: PathBuf,

    /// Also write a debug-level log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch multi-region prices for the (filtered) catalog
    Fetch(FetchArgs),
    /// Print one app's price in every region
    Probe(ProbeArgs),
    /// Write CSV reports from the saved price map
    Report,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Apps per batch (default 25 or STEAM_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,
    /// Seconds slept before every request
    #[arg(long)]
    delay: Option<f64>,
    /// Seconds slept between batches
    #[arg(long)]
    batch_delay: Option<f64>,
    /// Country codes to fetch (comma-separated); defaults to US,JP
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,
    /// Only fetch a curated list of popular, priced games
    #[arg(long, action = ArgAction::SetTrue)]
    popular_only: bool,
    /// Process at most this many apps (ignored with --full)
    #[arg(long)]
    limit: Option<usize>,
    /// Process every app, lowest ids first
    #[arg(long, action = ArgAction::SetTrue)]
    full: bool,
    /// Cap for --full
    #[arg(long)]
    max_apps: Option<usize>,
    /// Skip catalog filtering entirely
    #[arg(long, action = ArgAction::SetTrue)]
    no_filter: bool,
    /// Look up details for every candidate up to --detailed-limit (slowest, cached)
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "heuristic")]
    filter_detailed: bool,
    /// Use offline keyword / id-range heuristics instead of detail lookups
    #[arg(long, action = ArgAction::SetTrue)]
    heuristic: bool,
    /// Apps sampled by the default detail-lookup filter
    #[arg(long, default_value_t = 1000)]
    api_sample: usize,
    /// Apps checked by --filter-detailed
    #[arg(long, default_value_t = 2000)]
    detailed_limit: usize,
    #[arg(long)]
    min_appid: Option<u64>,
    #[arg(long)]
    max_appid: Option<u64>,
    /// Keep free games when filtering by details
    #[arg(long, action = ArgAction::SetTrue)]
    include_free: bool,
    /// Write a JSON snapshot of every batch next to the price map
    #[arg(long, action = ArgAction::SetTrue)]
    snapshots: bool,
}

#[derive(Debug, Args)]
struct ProbeArgs {
    #[arg(long)]
    app_id: u64,
    /// Country codes (comma-separated); defaults to STEAM_REGIONS or every known region
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let cli = Cli::parse();
    if let Some(path) = init_tracing("info", cli.log_dir.as_deref())? {
        info!(path = %path.display(), "logging to file");
    }
    env_util::log_config_snapshot("steam-region-prices", CONFIG_KEYS);

    let settings = FetchSettings::from_env();
    settings.validate()?;

    match &cli.command {
        Command::Fetch(args) => run_fetch(args, settings, &cli.output_dir).await,
        Command::Probe(args) => run_probe(args, &settings).await,
        Command::Report => run_report(&cli.output_dir),
    }
}

fn apply_overrides(mut settings: FetchSettings, args: &FetchArgs) -> FetchSettings {
    if let Some(n) = args.batch_size {
        settings.batch_size = n.max(1);
    }
    if let Some(raw) = args.delay {
        match env_util::secs_from_f64(raw) {
            Some(d) => settings = settings.with_request_delay(d),
            None => warn!(delay = raw, "ignoring out-of-range --delay"),
        }
    }
    if let Some(raw) = args.batch_delay {
        match env_util::secs_from_f64(raw) {
            Some(d) => settings.batch_pacing = settings.batch_pacing.with_base(d),
            None => warn!(batch_delay = raw, "ignoring out-of-range --batch-delay"),
        }
    }
    settings
}

fn fetch_regions(codes: &[String]) -> Vec<Region> {
    if !codes.is_empty() {
        return select_regions(codes);
    }
    if env_util::env_opt("STEAM_REGIONS").is_some() {
        return regions_from_env();
    }
    select_regions(&[])
}

fn transport(settings: &FetchSettings) -> Result<Arc<dyn StoreTransport>> {
    let transport: Arc<dyn StoreTransport> = Arc::new(ReqwestTransport::new(settings.http_timeout)?);
    Ok(transport)
}

async fn filter_catalog(
    args: &FetchArgs,
    settings: &FetchSettings,
    transport: Arc<dyn StoreTransport>,
    output_dir: &Path,
    entries: Vec<CatalogEntry>,
) -> Result<Vec<CatalogEntry>> {
    if args.no_filter {
        info!("filtering disabled");
        return Ok(entries);
    }
    if args.heuristic {
        return Ok(HeuristicFilter.select(&entries).await);
    }

    let details = RetryingClient::for_details(transport, settings);
    if args.filter_detailed {
        let cache = output_dir.join(FILTERED_CACHE_FILE);
        if cache.exists() {
            let cached = read_entries(&cache)?;
            info!(path = %cache.display(), apps = cached.len(), "loaded pre-filtered apps");
            return Ok(cached);
        }
        let filter = DetailProbeFilter::new(
            details,
            &settings.store_api,
            &settings.language,
            ProbeMode::Exhaustive {
                limit: args.detailed_limit,
                batch_size: settings.batch_size,
            },
        )
        .include_free(args.include_free);
        let kept = filter.select(&entries).await;
        write_entries(&cache, &kept)?;
        info!(path = %cache.display(), apps = kept.len(), "saved filtered apps");
        return Ok(kept);
    }

    let filter = DetailProbeFilter::new(
        details,
        &settings.store_api,
        &settings.language,
        ProbeMode::Sampled {
            sample_size: args.api_sample,
        },
    )
    .include_free(args.include_free);
    Ok(filter.select(&entries).await)
}

async fn run_fetch(args: &FetchArgs, settings: FetchSettings, output_dir: &Path) -> Result<()> {
    let started = Instant::now();
    let settings = apply_overrides(settings, args);
    let regions = fetch_regions(&args.regions);
    info!(
        regions = %regions.iter().map(|r| r.country_code.as_str()).join(","),
        batch_size = settings.batch_size,
        request_delay_secs = settings.request_pacing.base.as_secs_f64(),
        batch_delay_secs = settings.batch_pacing.base.as_secs_f64(),
        "fetch settings"
    );

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let transport = transport(&settings)?;

    let catalog = CatalogSource::new(
        RetryingClient::new(transport.clone(), settings.retry, Pacing::none()),
        &settings.app_list_api,
        output_dir.join(CATALOG_CACHE_FILE),
    );
    let selection = CatalogSelection {
        min_id: args.min_appid,
        max_id: args.max_appid,
        popular_only: args.popular_only,
        full: args.full,
        max_apps: args.max_apps,
        limit: args.limit,
    };

    let entries = selection.apply_bounds(catalog.load().await?);
    let entries = filter_catalog(args, &settings, transport.clone(), output_dir, entries).await?;
    let entries = selection.apply_scope(entries);
    info!(apps = entries.len(), "processing apps in total");

    let fetcher = RegionPriceFetcher::new(
        RetryingClient::for_prices(transport, &settings),
        &settings.store_api,
        &settings.language,
    );
    let store: Arc<dyn PriceStore> = Arc::new(JsonFileStore::in_output_dir(output_dir));
    let mut orchestrator = BatchOrchestrator::new(fetcher, store, settings.batch_pacing);
    if args.snapshots {
        orchestrator = orchestrator.with_snapshots(SnapshotWriter::in_output_dir(output_dir));
    }

    let run = orchestrator
        .run(&entries, settings.batch_size, &regions)
        .await?;
    if let Some(reason) = &run.interrupted {
        warn!(
            completed = run.batches_completed,
            total = run.total_batches,
            reason = %reason,
            "run stopped early; kept last saved prices"
        );
    }
    info!(
        apps = run.accumulator.len(),
        added = run.totals.added,
        overwritten = run.totals.overwritten,
        failures = run.totals.stats.failures,
        rate_limited = run.totals.stats.rate_limited_failures,
        elapsed = %format_duration(started.elapsed()),
        "fetch finished"
    );
    run.ensure_persisted()
}

async fn run_probe(args: &ProbeArgs, settings: &FetchSettings) -> Result<()> {
    let regions = if args.regions.is_empty() {
        regions_from_env()
    } else {
        select_regions(&args.regions)
    };
    let fetcher = RegionPriceFetcher::new(
        RetryingClient::for_prices(transport(settings)?, settings),
        &settings.store_api,
        &settings.language,
    );
    let entry = CatalogEntry::new(args.app_id, String::new());
    let rows = probe_app(&fetcher, &entry, &regions).await;
    print!("{}", format_probe_table(args.app_id, &rows));
    Ok(())
}

fn run_report(output_dir: &Path) -> Result<()> {
    let store = JsonFileStore::in_output_dir(output_dir);
    if !store.exists() {
        anyhow::bail!("no saved prices at {}", store.path().display());
    }
    let acc = store.load()?;
    match report::generate(&acc, output_dir)? {
        Some(out) => {
            println!(
                "wrote {} rows to {} and {}",
                out.rows,
                out.flat_csv.display(),
                out.comparison_csv.display()
            );
            report::print_summary(&out.summary);
        }
        None => warn!("saved price map is empty; nothing to report"),
    }
    Ok(())
}

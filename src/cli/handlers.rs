use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::harvest::backoff::ThreadSleeper;
use crate::harvest::session::SessionManager;
use crate::harvest::{HarvestFilters, HarvestReport, HarvestRequest, Harvester, IdList};
use crate::listings::{self, Listing};
use crate::semantic::{
    HttpImageFetcher, IndexOptions, IndexReport, SearchRequest, SemanticService, ServicePaths,
};

use super::HarvestArgs;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_request(config: &Config, args: &HarvestArgs) -> Result<HarvestRequest> {
    let catalog = match &args.catalog {
        Some(value) => match config.resolve_catalog(value) {
            Some(id) => id,
            None => bail!(
                "unknown catalog '{value}', expected an id or one of: {}",
                config.catalogs.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        },
        None => config.harvest.catalog_id,
    };

    let filters = HarvestFilters {
        catalog: Some(IdList::One(catalog)),
        search_text: args.search_text.clone(),
        price_from: args.price_from,
        price_to: args.price_to,
        brand_ids: args.brand_ids.clone(),
        size_ids: args.size_ids.clone(),
        color_ids: args.color_ids.clone(),
    };

    let mut request = HarvestRequest::from_config(filters, &config.harvest);
    if let Some(max_pages) = args.max_pages {
        request.max_pages = max_pages;
    }
    if let Some(per_page) = args.per_page {
        request.per_page = per_page;
    }

    Ok(request)
}

fn run_harvest(config: &Config, args: &HarvestArgs) -> Result<HarvestReport> {
    let request = build_request(config, args)?;
    let sleeper = ThreadSleeper;
    let sessions = SessionManager::new(config.harvest.clone(), &sleeper);

    log::info!(
        "Harvesting up to {} pages of {} from {}",
        request.max_pages,
        request.per_page,
        config.harvest.api_url()
    );

    let report = Harvester::new(&sessions, &sleeper)
        .fetch(&request)
        .context("harvest failed to start")?;

    if report.is_degraded() {
        log::warn!("Harvest ended early: {:?}", report.stop);
    }
    log::info!(
        "Harvested {} items over {} pages ({} sessions)",
        report.items.len(),
        report.pages_fetched,
        report.sessions_created
    );

    Ok(report)
}

fn write_dataset(path: &Path, listings: &[Listing]) -> Result<()> {
    listings::write_csv(path, listings)
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}

fn ensure_listings(listings: &[Listing]) -> Result<()> {
    if listings.is_empty() {
        bail!("no listings to index, nothing was refreshed");
    }
    Ok(())
}

fn initialized_service(config: &Config) -> Result<SemanticService> {
    let service = SemanticService::new(
        config.index.clone(),
        ServicePaths::from_config(config),
    );
    service
        .initialize()
        .context("semantic service could not be initialized")?;
    Ok(service)
}

fn index_listings(
    config: &Config,
    service: &SemanticService,
    listings: &[Listing],
    options: IndexOptions,
) -> Result<IndexReport> {
    let fetcher = HttpImageFetcher::new(Duration::from_secs(config.index.image_timeout_secs))
        .context("could not build image client")?;

    let report = service.index(listings, &fetcher, options)?;
    log::debug!("index report: {report:?}");
    if report.save_failed {
        bail!("{} listings were embedded but the index could not be saved", report.added);
    }
    Ok(report)
}

pub fn handle_harvest(
    config: &Config,
    args: HarvestArgs,
    raw_json: Option<PathBuf>,
    csv: PathBuf,
) -> Result<()> {
    let report = run_harvest(config, &args)?;

    if let Some(path) = raw_json {
        listings::save_raw_json(&path, &report.items)
            .with_context(|| format!("could not write {}", path.display()))?;
    }

    let normalized = listings::normalize_all(&report.items);
    write_dataset(&csv, &normalized)?;

    print_json(&serde_json::json!({
        "items": report.items.len(),
        "pages": report.pages_fetched,
        "stop": report.stop,
        "csv": csv,
    }))
}

pub fn handle_index(
    config: &Config,
    csv: Option<PathBuf>,
    raw_json: Option<PathBuf>,
    batch_size: Option<usize>,
    force: bool,
) -> Result<()> {
    let listings = match (csv, raw_json) {
        (Some(path), _) => listings::read_csv(&path)
            .with_context(|| format!("could not read {}", path.display()))?,
        (None, Some(path)) => {
            let raw = listings::load_raw_json(&path)
                .with_context(|| format!("could not read {}", path.display()))?;
            listings::normalize_all(&raw)
        }
        (None, None) => bail!("either --csv or --raw-json is required"),
    };

    let mut options = IndexOptions::from_config(&config.index);
    if let Some(batch_size) = batch_size {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        options.batch_size = batch_size;
    }
    if force {
        options.skip_existing = false;
    }

    let service = initialized_service(config)?;
    let report = index_listings(config, &service, &listings, options)?;

    print_json(&report)
}

pub fn handle_refresh(
    config: &Config,
    csv: Option<PathBuf>,
    save_csv: Option<PathBuf>,
    args: HarvestArgs,
) -> Result<()> {
    // load the model before spending minutes harvesting
    let service = initialized_service(config)?;
    let initial = service.count()?;
    log::info!("Index holds {initial} items before refresh");

    let listings = match csv {
        Some(path) => listings::read_csv(&path)
            .with_context(|| format!("could not read {}", path.display()))?,
        None => {
            let report = run_harvest(config, &args)?;
            let normalized = listings::normalize_all(&report.items);
            if let Some(path) = &save_csv {
                write_dataset(path, &normalized)?;
            }
            normalized
        }
    };

    ensure_listings(&listings)?;

    let added = index_listings(config, &service, &listings, IndexOptions::from_config(&config.index))?.added;
    let total = service.count()?;
    log::info!("Refresh done: {added} added, index holds {total} items");

    print_json(&serde_json::json!({
        "initial_items": initial,
        "added": added,
        "total_items": total,
    }))
}

pub fn handle_search(config: &Config, query: String, top_k: usize) -> Result<()> {
    let service = initialized_service(config)?;
    let response = service.search(&SearchRequest { query, top_k })?;
    print_json(&response)
}

pub fn handle_stats(config: &Config) -> Result<()> {
    let service = initialized_service(config)?;
    print_json(&service.stats()?)
}

pub fn handle_health(config: &Config) -> Result<()> {
    let service = SemanticService::new(
        config.index.clone(),
        ServicePaths::from_config(config),
    );
    if let Err(err) = service.initialize() {
        log::warn!("{err}");
    }
    print_json(&service.health())
}

//! Batch image indexing: listing photos in, vectors out.
//!
//! Invalid listings never reach the network. Within one input the first
//! occurrence of an id wins. Failures are contained at the smallest unit that
//! failed: a bad image drops one listing, a failed embed or upsert drops one
//! batch, and the run always continues.

use std::collections::HashSet;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::IndexConfig;
use crate::listings::Listing;
use crate::semantic::embeddings::Embedder;
use crate::semantic::index::{EmbeddingRecord, ItemMetadata};
use crate::semantic::preprocess::prepare_image;
use crate::semantic::store::VectorStore;

/// Batches between two flushes of the store during a long run.
const CHECKPOINT_BATCHES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),
}

/// Downloads listing photos.
pub trait ImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vinted-lens/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(FetchError::Status(status));
        }
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub batch_size: usize,
    /// Square side length images are resized to
    pub image_size: u32,
    /// Leave ids already in the store alone
    pub skip_existing: bool,
    pub show_progress: bool,
}

impl IndexOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            image_size: config.image_size,
            skip_existing: config.skip_existing,
            show_progress: true,
        }
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self::from_config(&IndexConfig::default())
    }
}

/// What happened to every listing handed to one index run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub received: usize,
    /// Missing id or photo url
    pub invalid: usize,
    pub duplicates: usize,
    pub already_indexed: usize,
    pub attempted: usize,
    pub failed_images: usize,
    pub failed_batches: usize,
    pub added: usize,
    /// The store could not make the added records durable
    pub save_failed: bool,
}

pub struct Indexer<'a> {
    embedder: &'a dyn Embedder,
    fetcher: &'a dyn ImageFetcher,
    options: IndexOptions,
}

impl<'a> Indexer<'a> {
    pub fn new(embedder: &'a dyn Embedder, fetcher: &'a dyn ImageFetcher, options: IndexOptions) -> Self {
        Self {
            embedder,
            fetcher,
            options,
        }
    }

    /// Embed and store every new listing. `IndexReport::added` counts
    /// records actually upserted.
    pub fn run(&self, store: &mut dyn VectorStore, listings: &[Listing]) -> IndexReport {
        let mut report = IndexReport {
            received: listings.len(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let mut candidates: Vec<&Listing> = Vec::with_capacity(listings.len());
        for listing in listings {
            if !listing.is_indexable() {
                report.invalid += 1;
                continue;
            }
            let Some(id) = listing.key() else { continue };
            if !seen.insert(id) {
                report.duplicates += 1;
                continue;
            }
            candidates.push(listing);
        }

        if report.invalid > 0 {
            log::warn!("Dropped {} listings without id or photo url", report.invalid);
        }
        if report.duplicates > 0 {
            log::info!("Ignored {} duplicate ids in input", report.duplicates);
        }

        if self.options.skip_existing && !candidates.is_empty() {
            candidates = self.drop_existing(store, candidates, &mut report);
        }

        report.attempted = candidates.len();
        if candidates.is_empty() {
            log::info!("Nothing new to index");
            return report;
        }

        let batch_size = self.options.batch_size.max(1);
        let batches = candidates.len().div_ceil(batch_size);
        log::info!(
            "Indexing {} listings in {} batches of {}",
            candidates.len(),
            batches,
            batch_size
        );

        let progress = self.progress_bar(batches as u64);

        for (batch_no, batch) in candidates.chunks(batch_size).enumerate() {
            progress.set_message(format!("batch {}/{}", batch_no + 1, batches));
            self.index_batch(store, batch, batch_no + 1, &mut report);
            progress.inc(1);

            if (batch_no + 1) % CHECKPOINT_BATCHES == 0 {
                Self::flush(store, &mut report);
            }
        }

        progress.finish_and_clear();
        Self::flush(store, &mut report);

        log::info!(
            "Indexed {} new listings ({} images failed, {} batches failed)",
            report.added,
            report.failed_images,
            report.failed_batches
        );

        report
    }

    fn drop_existing<'l>(
        &self,
        store: &dyn VectorStore,
        candidates: Vec<&'l Listing>,
        report: &mut IndexReport,
    ) -> Vec<&'l Listing> {
        let ids: Vec<&str> = candidates.iter().filter_map(|l| l.key()).collect();

        match store.existing_ids(&ids) {
            Ok(existing) if existing.is_empty() => candidates,
            Ok(existing) => {
                let fresh: Vec<&Listing> = candidates
                    .into_iter()
                    .filter(|l| l.key().is_some_and(|id| !existing.contains(id)))
                    .collect();
                report.already_indexed = existing.len();
                log::info!("{} listings already indexed, skipping them", existing.len());
                fresh
            }
            Err(err) => {
                log::warn!("Could not check existing ids ({err}), indexing everything");
                candidates
            }
        }
    }

    fn index_batch(
        &self,
        store: &mut dyn VectorStore,
        batch: &[&Listing],
        batch_no: usize,
        report: &mut IndexReport,
    ) {
        let mut images = Vec::with_capacity(batch.len());
        let mut kept = Vec::with_capacity(batch.len());

        for listing in batch {
            let (Some(id), Some(url)) = (listing.key(), listing.photo()) else {
                continue;
            };

            let prepared = self
                .fetcher
                .fetch(url)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    prepare_image(&bytes, self.options.image_size).map_err(|e| e.to_string())
                });

            match prepared {
                Ok(img) => {
                    images.push(img);
                    kept.push((id, *listing));
                }
                Err(err) => {
                    log::warn!("Skipping listing {id}: image {url}: {err}");
                    report.failed_images += 1;
                }
            }
        }

        if images.is_empty() {
            log::warn!("Batch {batch_no}: no usable images, skipping");
            report.failed_batches += 1;
            return;
        }

        let embeddings = match self.embedder.embed_images(&images) {
            Ok(embeddings) => embeddings,
            Err(err) => {
                log::error!("Batch {batch_no}: embedding failed: {err}");
                report.failed_batches += 1;
                return;
            }
        };

        let records: Vec<EmbeddingRecord> = kept
            .into_iter()
            .zip(embeddings)
            .map(|((id, listing), embedding)| EmbeddingRecord {
                id: id.to_string(),
                embedding,
                metadata: ItemMetadata::from(listing),
            })
            .collect();

        match store.upsert(records) {
            Ok(written) => {
                log::debug!("Batch {batch_no}: stored {written} vectors");
                report.added += written;
            }
            Err(err) => {
                log::error!("Batch {batch_no}: upsert failed: {err}");
                report.failed_batches += 1;
            }
        }
    }

    fn flush(store: &mut dyn VectorStore, report: &mut IndexReport) {
        if let Err(err) = store.flush() {
            log::error!("Could not save the vector index: {err}");
            report.save_failed = true;
        }
    }

    fn progress_bar(&self, batches: u64) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(batches);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

use std::collections::HashSet;

use super::*;
use crate::semantic::index::{EmbeddingRecord, IndexError, Neighbor, VectorIndex};
use crate::semantic::indexer::{IndexOptions, Indexer};
use crate::semantic::store::{StoreError, VectorStore};

fn options(batch_size: usize) -> IndexOptions {
    IndexOptions {
        batch_size,
        image_size: 32,
        skip_existing: true,
        show_progress: false,
    }
}

fn url(id: &str) -> String {
    format!("https://images.vinted.net/{id}.jpg")
}

/// Six listings, photos for all but 2 and 5.
fn six_listings() -> (Vec<Listing>, MapImageFetcher) {
    let ids = ["1", "2", "3", "4", "5", "6"];
    let listings = ids.iter().map(|id| listing(id, Some(&url(id)))).collect();
    let fetcher = MapImageFetcher::default()
        .with_image(&url("1"), [200, 10, 10])
        .with_image(&url("3"), [10, 200, 10])
        .with_image(&url("4"), [10, 10, 200])
        .with_image(&url("6"), [120, 120, 120]);
    (listings, fetcher)
}

#[test]
fn test_unreachable_images_are_skipped_individually() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);

    let report = Indexer::new(&embedder, &fetcher, options(3)).run(&mut store, &listings);

    assert_eq!(report.added, 4);
    assert_eq!(report.failed_images, 2);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(store.count().unwrap(), 4);
    assert!(!store.contains("2") && !store.contains("5"));

    // one model call per batch, with only the usable images
    assert_eq!(*embedder.image_calls.borrow(), vec![2, 2]);
}

#[test]
fn test_reindex_is_idempotent() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);
    let indexer = Indexer::new(&embedder, &fetcher, options(4));

    let first = indexer.run(&mut store, &listings);
    let fetched_first = fetcher.fetched.borrow().len();
    let second = indexer.run(&mut store, &listings);

    assert_eq!(first.added, 4);
    assert_eq!(second.added, 0);
    assert_eq!(second.already_indexed, 4);
    assert_eq!(store.count().unwrap(), 4);

    // only the two never-indexed listings are retried
    let retried: Vec<String> = fetcher.fetched.borrow()[fetched_first..].to_vec();
    assert_eq!(retried, vec![url("2"), url("5")]);
}

#[test]
fn test_force_reembeds_existing() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);

    Indexer::new(&embedder, &fetcher, options(6)).run(&mut store, &listings);

    let forced = IndexOptions {
        skip_existing: false,
        ..options(6)
    };
    let report = Indexer::new(&embedder, &fetcher, forced).run(&mut store, &listings);

    assert_eq!(report.added, 4);
    assert_eq!(report.already_indexed, 0);
    assert_eq!(store.count().unwrap(), 4);
}

#[test]
fn test_invalid_listings_are_never_fetched() {
    let mut no_id = listing("x", Some(&url("x")));
    no_id.id = None;
    let mut blank_id = listing("y", Some(&url("y")));
    blank_id.id = Some("  ".into());

    let listings = vec![
        no_id,
        blank_id,
        listing("7", None),
        listing("8", Some("   ")),
        listing("9", Some(&url("9"))),
    ];
    let fetcher = MapImageFetcher::default()
        .with_image(&url("x"), [1, 2, 3])
        .with_image(&url("y"), [1, 2, 3])
        .with_image(&url("9"), [9, 9, 9]);
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);

    let report = Indexer::new(&embedder, &fetcher, options(6)).run(&mut store, &listings);

    assert_eq!(report.invalid, 4);
    assert_eq!(report.added, 1);
    assert_eq!(*fetcher.fetched.borrow(), vec![url("9")]);
}

#[test]
fn test_duplicate_ids_first_wins() {
    let listings = vec![
        listing("1", Some("https://img/red.jpg")),
        listing("1", Some("https://img/blue.jpg")),
    ];
    let fetcher = MapImageFetcher::default()
        .with_image("https://img/red.jpg", [250, 0, 0])
        .with_image("https://img/blue.jpg", [0, 0, 250]);
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);

    let report = Indexer::new(&embedder, &fetcher, options(6)).run(&mut store, &listings);

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.added, 1);
    assert_eq!(*fetcher.fetched.borrow(), vec!["https://img/red.jpg".to_string()]);
    assert_eq!(store.get("1").unwrap().metadata.image_url, "https://img/red.jpg");
}

#[test]
fn test_empty_batch_does_not_stop_the_run() {
    let listings = vec![
        listing("1", Some(&url("1"))),
        listing("2", Some(&url("2"))),
        listing("3", Some(&url("3"))),
        listing("4", Some(&url("4"))),
    ];
    let fetcher = MapImageFetcher::default()
        .with_bytes(&url("1"), b"<html><body>blocked</body></html>")
        .with_image(&url("3"), [5, 50, 5])
        .with_image(&url("4"), [5, 5, 50]);
    let embedder = ColourEmbedder::default();
    let mut store = VectorIndex::new(3);

    let report = Indexer::new(&embedder, &fetcher, options(2)).run(&mut store, &listings);

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.failed_images, 2);
    assert_eq!(report.added, 2);
    // the empty batch never reaches the model
    assert_eq!(*embedder.image_calls.borrow(), vec![2]);
}

#[test]
fn test_embedding_failure_skips_batches() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::failing();
    let mut store = VectorIndex::new(3);

    let report = Indexer::new(&embedder, &fetcher, options(3)).run(&mut store, &listings);

    assert_eq!(report.added, 0);
    assert_eq!(report.failed_batches, 2);
    assert_eq!(embedder.image_calls.borrow().len(), 2);
    assert_eq!(store.count().unwrap(), 0);
}

/// A store whose existence check, writes or flushes can be made to fail.
struct FlakyStore {
    inner: VectorIndex,
    fail_lookup: bool,
    fail_upsert_calls: Vec<usize>,
    fail_flush: bool,
    upsert_calls: usize,
    flushes: usize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: VectorIndex::new(3),
            fail_lookup: false,
            fail_upsert_calls: vec![],
            fail_flush: false,
            upsert_calls: 0,
            flushes: 0,
        }
    }
}

impl VectorStore for FlakyStore {
    fn upsert(&mut self, records: Vec<EmbeddingRecord>) -> Result<usize, StoreError> {
        self.upsert_calls += 1;
        if self.fail_upsert_calls.contains(&self.upsert_calls) {
            return Err(StoreError::Index(IndexError::ZeroNormVector));
        }
        self.inner.upsert(records)
    }

    fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>, StoreError> {
        if self.fail_lookup {
            return Err(StoreError::Index(IndexError::DimensionMismatch {
                expected: 3,
                got: 0,
            }));
        }
        self.inner.existing_ids(ids)
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError> {
        self.inner.query(embedding, k)
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.inner.count()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.flushes += 1;
        if self.fail_flush {
            return Err(StoreError::Index(IndexError::ZeroNormVector));
        }
        Ok(())
    }
}

#[test]
fn test_failed_upsert_skips_only_that_batch() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = FlakyStore::new();
    store.fail_upsert_calls = vec![1];

    let report = Indexer::new(&embedder, &fetcher, options(3)).run(&mut store, &listings);

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.added, 2);
    assert_eq!(store.upsert_calls, 2);
    assert!(store.inner.contains("4") && store.inner.contains("6"));
}

#[test]
fn test_failed_existence_check_indexes_everything() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = FlakyStore::new();
    store.fail_lookup = true;

    let report = Indexer::new(&embedder, &fetcher, options(6)).run(&mut store, &listings);

    assert_eq!(report.already_indexed, 0);
    assert_eq!(report.attempted, 6);
    assert_eq!(report.added, 4);
}

#[test]
fn test_store_is_flushed_once_per_run() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = FlakyStore::new();

    let report = Indexer::new(&embedder, &fetcher, options(1)).run(&mut store, &listings);

    assert_eq!(report.added, 4);
    assert_eq!(store.upsert_calls, 4);
    assert_eq!(store.flushes, 1);
    assert!(!report.save_failed);

    // nothing new: no batches and no save
    Indexer::new(&embedder, &fetcher, options(1)).run(&mut store, &listings);
    assert_eq!(store.flushes, 1);
}

#[test]
fn test_long_runs_checkpoint_the_store() {
    let photo = url("same");
    let fetcher = MapImageFetcher::default().with_image(&photo, [40, 80, 120]);
    let listings: Vec<Listing> = (0..101).map(|i| listing(&i.to_string(), Some(&photo))).collect();
    let embedder = ColourEmbedder::default();
    let mut store = FlakyStore::new();

    let report = Indexer::new(&embedder, &fetcher, options(1)).run(&mut store, &listings);

    assert_eq!(report.added, 101);
    assert_eq!(store.upsert_calls, 101);
    // after batch 50, after batch 100, and at the end
    assert_eq!(store.flushes, 3);
}

#[test]
fn test_failed_save_is_reported() {
    let (listings, fetcher) = six_listings();
    let embedder = ColourEmbedder::default();
    let mut store = FlakyStore::new();
    store.fail_flush = true;

    let report = Indexer::new(&embedder, &fetcher, options(3)).run(&mut store, &listings);

    assert_eq!(report.added, 4);
    assert!(report.save_failed);
}

//! The vector store seam: upsert by id, existence check, nearest-neighbour
//! query and count.

use std::collections::HashSet;

use crate::semantic::index::{EmbeddingRecord, IndexError, Neighbor, VectorIndex};
use crate::semantic::storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

pub trait VectorStore {
    /// Insert records, replacing any with the same id. Returns how many were written.
    fn upsert(&mut self, records: Vec<EmbeddingRecord>) -> Result<usize, StoreError>;

    /// The subset of `ids` already present.
    fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>, StoreError>;

    /// Up to `k` nearest entries, nearest first.
    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Make every upsert so far durable. Stores without a backing file have
    /// nothing to do.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Validates every record before touching the index so a batch lands whole or not at all.
fn upsert_into(index: &mut VectorIndex, records: Vec<EmbeddingRecord>) -> Result<usize, StoreError> {
    let mut staged = VectorIndex::with_capacity(index.dimensions(), records.len());
    for record in &records {
        staged.insert(record.clone())?;
    }

    let written = records.len();
    for record in records {
        index.insert(record)?;
    }
    Ok(written)
}

impl VectorStore for VectorIndex {
    fn upsert(&mut self, records: Vec<EmbeddingRecord>) -> Result<usize, StoreError> {
        upsert_into(self, records)
    }

    fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>, StoreError> {
        Ok(ids
            .iter()
            .filter(|id| self.contains(id))
            .map(|id| id.to_string())
            .collect())
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError> {
        Ok(self.nearest(embedding, k)?)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.len())
    }
}

/// A [`VectorIndex`] backed by `vectors.bin`. Upserts only touch memory
/// until [`VectorStore::flush`] rewrites the file.
pub struct LocalVectorStore {
    index: VectorIndex,
    storage: VectorStorage,
    model_id: [u8; 32],
    dirty: bool,
}

impl LocalVectorStore {
    /// Load the index for this model, or start a fresh one.
    ///
    /// A file written by another model, with other dimensions, or by a newer
    /// format version is left alone until the next save replaces it.
    pub fn open(
        storage: VectorStorage,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, StoreError> {
        let index = if storage.exists() {
            match storage.load(&model_id, dimensions) {
                Ok(idx) => {
                    log::info!("Loaded {} vectors from {}", idx.len(), storage.path().display());
                    idx
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("Model changed, creating fresh index");
                    VectorIndex::new(dimensions)
                }
                Err(VectorStorageError::DimensionMismatch { expected, got }) => {
                    log::warn!(
                        "Stored vectors have {got} dimensions, model has {expected}, creating fresh index"
                    );
                    VectorIndex::new(dimensions)
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!(
                        "Storage version {} unsupported, creating fresh index",
                        file_ver
                    );
                    VectorIndex::new(dimensions)
                }
                Err(e) => {
                    log::error!("Failed to load vectors: {}", e);
                    return Err(e.into());
                }
            }
        } else {
            log::info!("No existing index, starting fresh");
            VectorIndex::new(dimensions)
        };

        Ok(Self {
            index,
            storage,
            model_id,
            dirty: false,
        })
    }
}

impl VectorStore for LocalVectorStore {
    fn upsert(&mut self, records: Vec<EmbeddingRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let written = upsert_into(&mut self.index, records)?;
        self.dirty = true;
        Ok(written)
    }

    fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>, StoreError> {
        self.index.existing_ids(ids)
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError> {
        self.index.query(embedding, k)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.index.len())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        self.storage.save(&self.index, &self.model_id)?;
        self.dirty = false;
        log::debug!("Saved {} vectors to {}", self.index.len(), self.storage.path().display());
        Ok(())
    }
}

//! In-memory vector index with cosine distance search.
//!
//! Stores listing embeddings together with the metadata needed to render a
//! search hit without a second lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::listings::{Listing, DEFAULT_CURRENCY};

/// Display fields kept next to each vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub brand: String,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

impl From<&Listing> for ItemMetadata {
    fn from(listing: &Listing) -> Self {
        Self {
            title: listing.title.clone().unwrap_or_default(),
            price: listing.price_amount,
            currency: listing.currency().to_string(),
            url: listing.url.clone().unwrap_or_default(),
            image_url: listing.photo_url.clone().unwrap_or_default(),
            size: listing.size.clone().unwrap_or_default(),
            brand: listing.brand.clone().unwrap_or_default(),
        }
    }
}

/// One vector to be written: the listing id is the primary key.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: ItemMetadata,
}

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub embedding: Vec<f32>,
    pub metadata: ItemMetadata,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    /// Cosine distance, `1 - cos(query, entry)`, in [0, 2]
    pub distance: f32,
    pub metadata: ItemMetadata,
}

/// In-memory vector index keyed by listing id.
pub struct VectorIndex {
    entries: HashMap<String, VectorEntry>,
    /// Expected embedding dimensions
    dimensions: usize,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry.
    ///
    /// Returns an error if the embedding has the wrong length or zero norm.
    pub fn insert(&mut self, record: EmbeddingRecord) -> Result<(), IndexError> {
        self.check_vector(&record.embedding)?;

        self.entries.insert(
            record.id,
            VectorEntry {
                embedding: record.embedding,
                metadata: record.metadata,
            },
        );

        Ok(())
    }

    fn check_vector(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        let norm = Self::l2_norm(embedding);
        if !norm.is_finite() {
            return Err(IndexError::NonFiniteVector);
        }
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The `k` entries closest to `query`, nearest first.
    ///
    /// Ties are broken by id so results are stable across runs.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_vector(query)?;
        let query_norm = Self::l2_norm(query);

        let mut scored: Vec<(&String, f32)> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let distance = 1.0 - Self::cosine_similarity(query, &entry.embedding, query_norm);
                (id, distance)
            })
            .collect();

        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(id, distance)| Neighbor {
                id: id.clone(),
                distance,
                metadata: self.entries[id].metadata.clone(),
            })
            .collect())
    }

    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Assumes query_norm is precomputed for efficiency.
    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        let target_norm = Self::l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot_product / (query_norm * target_norm)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector has NaN or infinite components")]
    NonFiniteVector,
}

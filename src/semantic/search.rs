//! Text-to-image similarity search.

use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::Neighbor;
use crate::semantic::store::{StoreError, VectorStore};

pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("query text is empty")]
    EmptyQuery,

    #[error("top_k must be positive")]
    InvalidTopK,

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub currency: String,
    pub url: String,
    pub image_url: String,
    /// In [0, 1], higher is more similar
    pub similarity: f32,
}

impl SearchResult {
    fn from_neighbor(neighbor: Neighbor) -> Self {
        let meta = neighbor.metadata;
        Self {
            id: neighbor.id,
            title: meta.title,
            price: meta.price,
            currency: meta.currency,
            url: meta.url,
            image_url: meta.image_url,
            similarity: distance_to_similarity(neighbor.distance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total_found: usize,
}

/// `1 - d` for `d <= 1`, else 0, rounded to 3 decimals.
pub fn distance_to_similarity(distance: f32) -> f32 {
    if distance.is_nan() || distance > 1.0 {
        return 0.0;
    }
    let similarity = (1.0 - distance).clamp(0.0, 1.0);
    (similarity * 1000.0).round() / 1000.0
}

/// Validated query text, trimmed.
pub fn check_request(query: &str, top_k: usize) -> Result<&str, SearchError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(SearchError::EmptyQuery);
    }
    if top_k == 0 {
        return Err(SearchError::InvalidTopK);
    }
    Ok(query)
}

pub struct SearchEngine<'a> {
    embedder: &'a dyn Embedder,
    store: &'a dyn VectorStore,
}

impl<'a> SearchEngine<'a> {
    pub fn new(embedder: &'a dyn Embedder, store: &'a dyn VectorStore) -> Self {
        Self { embedder, store }
    }

    /// Nearest listings to `query`, most similar first, at most `top_k`.
    pub fn search(&self, query: &str, top_k: usize) -> Result<SearchResponse, SearchError> {
        let query = check_request(query, top_k)?;

        let embedding = self.embedder.embed_text(query)?;
        let neighbors = self.store.query(&embedding, top_k)?;

        let results: Vec<SearchResult> = neighbors
            .into_iter()
            .take(top_k)
            .map(SearchResult::from_neighbor)
            .collect();

        log::debug!("query {query:?}: {} results", results.len());

        Ok(SearchResponse {
            total_found: results.len(),
            results,
        })
    }

    pub fn handle(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        self.search(&request.query, request.top_k)
    }
}

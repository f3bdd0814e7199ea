//! Image embedding index and text-to-image search.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed's CLIP image and text towers
//! - `preprocess`: Image decoding and normalization before embedding
//! - `index`: In-memory vector index with cosine distance search
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `store`: The vector store trait and its local implementation
//! - `indexer`: Batched fetch, embed and upsert of listing photos
//! - `search`: Query text to ranked listings
//! - `service`: Lifecycle owner of the model and the store

pub mod embeddings;
pub mod index;
pub mod indexer;
pub mod preprocess;
pub mod search;
pub mod service;
pub mod storage;
pub mod store;

pub use embeddings::{ClipModel, Embedder, EmbeddingError};
pub use index::{EmbeddingRecord, ItemMetadata, Neighbor, VectorIndex};
pub use indexer::{FetchError, HttpImageFetcher, ImageFetcher, IndexOptions, IndexReport, Indexer};
pub use search::{SearchEngine, SearchError, SearchRequest, SearchResponse, SearchResult};
pub use service::{CollectionStats, HealthStatus, SemanticService, ServiceError, ServicePaths};
pub use store::{LocalVectorStore, StoreError, VectorStore};

//! Semantic service: owns the one embedding model and the one vector store
//! of the process.
//!
//! Lifecycle: `Uninitialized -> Ready | Failed`. Nothing is loaded until
//! [`SemanticService::initialize`] runs; until it succeeds, indexing and
//! search refuse with [`ServiceError::Unavailable`]. A failed load is not
//! retried.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::config::{Config, IndexConfig};
use crate::listings::Listing;
use crate::semantic::embeddings::{ClipModel, Embedder, EmbeddingError};
use crate::semantic::indexer::{ImageFetcher, IndexOptions, IndexReport, Indexer};
use crate::semantic::search::{SearchEngine, SearchError, SearchRequest, SearchResponse};
use crate::semantic::storage::VectorStorage;
use crate::semantic::store::{LocalVectorStore, StoreError, VectorStore};

pub const COLLECTION_NAME: &str = "vinted_dresses_db";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Where the service keeps its files.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub model_cache_dir: PathBuf,
    pub vectors_path: PathBuf,
}

impl ServicePaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model_cache_dir: config.model_cache_dir(),
            vectors_path: config.vectors_path(),
        }
    }
}

struct Components {
    embedder: Box<dyn Embedder>,
    store: Box<dyn VectorStore>,
}

enum ServiceState {
    Uninitialized,
    Ready(Components),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: String,
    pub model_loaded: bool,
    pub database_connected: bool,
    pub total_items: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub total_items: usize,
    pub collection_name: String,
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct SemanticService {
    config: IndexConfig,
    paths: ServicePaths,
    state: Mutex<ServiceState>,
}

impl SemanticService {
    /// Create an uninitialized service. Nothing is loaded yet.
    pub fn new(config: IndexConfig, paths: ServicePaths) -> Self {
        Self {
            config,
            paths,
            state: Mutex::new(ServiceState::Uninitialized),
        }
    }

    /// A ready service over already-built components.
    #[cfg(test)]
    pub fn with_components(
        config: IndexConfig,
        embedder: Box<dyn Embedder>,
        store: Box<dyn VectorStore>,
    ) -> Self {
        let paths = ServicePaths {
            model_cache_dir: PathBuf::new(),
            vectors_path: PathBuf::new(),
        };
        Self {
            config,
            paths,
            state: Mutex::new(ServiceState::Ready(Components { embedder, store })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServiceState>, ServiceError> {
        self.state
            .lock()
            .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Load the model and open the store, once.
    pub fn initialize(&self) -> Result<(), ServiceError> {
        let mut guard = self.lock()?;

        match &*guard {
            ServiceState::Ready(_) => return Ok(()),
            ServiceState::Failed(reason) => return Err(ServiceError::Unavailable(reason.clone())),
            ServiceState::Uninitialized => {}
        }

        match self.load() {
            Ok(components) => {
                *guard = ServiceState::Ready(components);
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                log::error!("Failed to initialize semantic service: {reason}");
                *guard = ServiceState::Failed(reason.clone());
                Err(ServiceError::Unavailable(reason))
            }
        }
    }

    fn load(&self) -> Result<Components, ServiceError> {
        log::info!("Initializing semantic service with model '{}'", self.config.model);

        let timeout = Duration::from_secs(self.config.download_timeout_secs);
        let model = ClipModel::new(
            &self.config.model,
            self.paths.model_cache_dir.clone(),
            Some(timeout),
        )?;

        let storage = VectorStorage::new(self.paths.vectors_path.clone());
        let store = LocalVectorStore::open(storage, model.model_id(), model.dimensions())?;

        Ok(Components {
            embedder: Box::new(model),
            store: Box::new(store),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.lock()
            .map(|guard| matches!(*guard, ServiceState::Ready(_)))
            .unwrap_or(false)
    }

    fn with_ready<R>(
        &self,
        f: impl FnOnce(&mut Components) -> Result<R, ServiceError>,
    ) -> Result<R, ServiceError> {
        let mut guard = self.lock()?;
        match &mut *guard {
            ServiceState::Ready(components) => f(components),
            ServiceState::Failed(reason) => Err(ServiceError::Unavailable(reason.clone())),
            ServiceState::Uninitialized => Err(ServiceError::Unavailable(
                "model and vector store are not loaded".to_string(),
            )),
        }
    }

    pub fn index(
        &self,
        listings: &[Listing],
        fetcher: &dyn ImageFetcher,
        options: IndexOptions,
    ) -> Result<IndexReport, ServiceError> {
        self.with_ready(|c| {
            let indexer = Indexer::new(c.embedder.as_ref(), fetcher, options);
            Ok(indexer.run(c.store.as_mut(), listings))
        })
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ServiceError> {
        self.with_ready(|c| {
            let engine = SearchEngine::new(c.embedder.as_ref(), c.store.as_ref());
            Ok(engine.handle(request)?)
        })
    }

    pub fn count(&self) -> Result<usize, ServiceError> {
        self.with_ready(|c| Ok(c.store.count()?))
    }

    /// Never fails; an unready service reports itself unhealthy.
    pub fn health(&self) -> HealthStatus {
        let (ready, total_items) = match self.count() {
            Ok(count) => (true, count),
            Err(err) => {
                log::debug!("health check: {err}");
                (self.is_ready(), 0)
            }
        };

        HealthStatus {
            status: if ready { "healthy" } else { "unhealthy" }.to_string(),
            model_loaded: ready,
            database_connected: ready,
            total_items,
            timestamp: now_rfc3339(),
        }
    }

    pub fn stats(&self) -> Result<CollectionStats, ServiceError> {
        Ok(CollectionStats {
            total_items: self.count()?,
            collection_name: COLLECTION_NAME.to_string(),
            timestamp: now_rfc3339(),
        })
    }
}

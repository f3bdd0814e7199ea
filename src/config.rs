use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_BASE_URL: &str = "https://www.vinted.fr";
const DEFAULT_API_ENDPOINT: &str = "/api/v2/catalog/items";
/// Dresses
const DEFAULT_CATALOG_ID: u64 = 10;
const DEFAULT_MAX_PAGES: u32 = 20;
const DEFAULT_PER_PAGE: u32 = 96;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_ACCEPT_LANGUAGE: &str = "fr-FR,fr;q=0.9,en;q=0.8";

const DEFAULT_BATCH_SIZE: usize = 6;
const DEFAULT_IMAGE_SIZE: u32 = 224;
const DEFAULT_IMAGE_TIMEOUT_SECS: u64 = 8;
const DEFAULT_MODEL: &str = "clip-vit-b-32";
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Settings for talking to the marketplace catalog API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    #[serde(default = "default_catalog_id")]
    pub catalog_id: u64,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Attempts per page before the harvest stops
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Random pause between successful pages, in seconds
    #[serde(default = "default_pause_range")]
    pub pause_range: (f64, f64),

    /// Random pause before a fresh session issues its first request, in seconds
    #[serde(default = "default_warmup_delay_range")]
    pub warmup_delay_range: (f64, f64),

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Optional `name=value; name2=value2` cookie string seeded into every session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_endpoint: default_api_endpoint(),
            catalog_id: DEFAULT_CATALOG_ID,
            max_pages: DEFAULT_MAX_PAGES,
            per_page: DEFAULT_PER_PAGE,
            max_retries: DEFAULT_MAX_RETRIES,
            pause_range: default_pause_range(),
            warmup_delay_range: default_warmup_delay_range(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            user_agents: default_user_agents(),
            accept_language: default_accept_language(),
            cookies: None,
        }
    }
}

impl HarvestConfig {
    pub fn api_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_endpoint
        )
    }
}

/// Settings for image embedding and the vector index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Square edge, in pixels, images are resized to before embedding
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,

    /// Skip listings whose id is already in the index
    #[serde(default = "default_skip_existing")]
    pub skip_existing: bool,

    /// Image/text model pair, e.g. "clip-vit-b-32"
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_cache_dir: Option<PathBuf>,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            image_size: DEFAULT_IMAGE_SIZE,
            image_timeout_secs: DEFAULT_IMAGE_TIMEOUT_SECS,
            skip_existing: true,
            model: default_model(),
            model_cache_dir: None,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_catalog_id() -> u64 {
    DEFAULT_CATALOG_ID
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_pause_range() -> (f64, f64) {
    (1.0, 2.5)
}

fn default_warmup_delay_range() -> (f64, f64) {
    (2.5, 5.0)
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_user_agents() -> Vec<String> {
    DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect()
}

fn default_accept_language() -> String {
    DEFAULT_ACCEPT_LANGUAGE.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

fn default_image_timeout_secs() -> u64 {
    DEFAULT_IMAGE_TIMEOUT_SECS
}

fn default_skip_existing() -> bool {
    true
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_catalogs() -> BTreeMap<String, u64> {
    [
        ("dresses", 10),
        ("tops", 11),
        ("skirts", 12),
        ("pants", 13),
        ("shoes", 14),
        ("accessories", 15),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id))
    .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub harvest: HarvestConfig,

    #[serde(default)]
    pub index: IndexConfig,

    /// Named catalog ids accepted in place of numeric ones
    #[serde(default = "default_catalogs")]
    pub catalogs: BTreeMap<String, u64>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            harvest: HarvestConfig::default(),
            index: IndexConfig::default(),
            catalogs: default_catalogs(),
            base_path: String::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let harvest = &self.harvest;
        if harvest.max_pages == 0 {
            return Err(ConfigError::invalid("harvest.max_pages", "must be at least 1"));
        }
        if harvest.per_page == 0 {
            return Err(ConfigError::invalid("harvest.per_page", "must be at least 1"));
        }
        if harvest.max_retries == 0 {
            return Err(ConfigError::invalid("harvest.max_retries", "must be at least 1"));
        }
        validate_range("harvest.pause_range", harvest.pause_range)?;
        validate_range("harvest.warmup_delay_range", harvest.warmup_delay_range)?;
        if harvest.user_agents.iter().all(|ua| ua.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "harvest.user_agents",
                "at least one user agent is required",
            ));
        }
        if url::Url::parse(&harvest.base_url).is_err() {
            return Err(ConfigError::invalid(
                "harvest.base_url",
                format!("'{}' is not a valid url", harvest.base_url),
            ));
        }

        let index = &self.index;
        if index.batch_size == 0 {
            return Err(ConfigError::invalid("index.batch_size", "must be at least 1"));
        }
        if index.image_size == 0 {
            return Err(ConfigError::invalid("index.image_size", "must be at least 1"));
        }
        if index.download_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "index.download_timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_path)
    }

    /// Where downloaded model files live.
    pub fn model_cache_dir(&self) -> PathBuf {
        self.index
            .model_cache_dir
            .clone()
            .unwrap_or_else(|| self.base_path().join("models"))
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.base_path().join("vectors.bin")
    }

    /// Resolve a catalog given either as a numeric id or as a configured name.
    pub fn resolve_catalog(&self, value: &str) -> Option<u64> {
        let value = value.trim();
        value
            .parse::<u64>()
            .ok()
            .or_else(|| self.catalogs.get(&value.to_lowercase()).copied())
    }
}

fn validate_range(field: &'static str, (min, max): (f64, f64)) -> Result<(), ConfigError> {
    if !min.is_finite() || !max.is_finite() || min < 0.0 || min > max {
        return Err(ConfigError::invalid(
            field,
            format!("expected 0 <= min <= max, got ({min}, {max})"),
        ));
    }
    Ok(())
}

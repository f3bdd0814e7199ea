//! End-to-end tests over the harvest and semantic pipelines, with every
//! network, model and clock dependency replaced by an in-memory double.

mod indexer;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use image::{Rgb, RgbImage};

use crate::harvest::backoff::Sleeper;
use crate::harvest::session::{CatalogSession, PageResponse, SessionError, SessionProvider};
use crate::listings::Listing;
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::indexer::{FetchError, ImageFetcher};
use crate::semantic::preprocess::encode_png;

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: RefCell<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.borrow_mut().push(duration);
    }
}

/// One request as seen by the fake catalog.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub session: usize,
    pub page: u32,
}

type Script = Rc<RefCell<VecDeque<Result<PageResponse, SessionError>>>>;

/// Hands out sessions that all read from one shared response script.
pub struct ScriptedProvider {
    script: Script,
    fallback: PageResponse,
    pub requests: Rc<RefCell<Vec<SeenRequest>>>,
    pub sessions_created: RefCell<usize>,
}

impl ScriptedProvider {
    /// `fallback` is served once the script runs dry.
    pub fn new(script: Vec<Result<PageResponse, SessionError>>, fallback: PageResponse) -> Self {
        Self {
            script: Rc::new(RefCell::new(script.into())),
            fallback,
            requests: Rc::new(RefCell::new(vec![])),
            sessions_created: RefCell::new(0),
        }
    }

    pub fn pages_requested(&self) -> Vec<u32> {
        self.requests.borrow().iter().map(|r| r.page).collect()
    }
}

struct ScriptedSession {
    id: usize,
    script: Script,
    fallback: PageResponse,
    requests: Rc<RefCell<Vec<SeenRequest>>>,
}

impl CatalogSession for ScriptedSession {
    fn get_page(&self, params: &[(String, String)]) -> Result<PageResponse, SessionError> {
        let page = params
            .iter()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        self.requests.borrow_mut().push(SeenRequest {
            session: self.id,
            page,
        });

        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn has_token(&self) -> bool {
        true
    }
}

impl SessionProvider for ScriptedProvider {
    fn create_session(&self) -> Result<Box<dyn CatalogSession>, SessionError> {
        let mut created = self.sessions_created.borrow_mut();
        *created += 1;
        Ok(Box::new(ScriptedSession {
            id: *created,
            script: self.script.clone(),
            fallback: self.fallback.clone(),
            requests: self.requests.clone(),
        }))
    }
}

pub fn ok_page(first_id: u64, count: usize) -> Result<PageResponse, SessionError> {
    let items: Vec<_> = (0..count as u64)
        .map(|i| serde_json::json!({"id": first_id + i, "title": format!("Robe {}", first_id + i)}))
        .collect();
    Ok(PageResponse {
        status: 200,
        body: serde_json::json!({ "items": items }).to_string(),
    })
}

pub fn status(code: u16) -> PageResponse {
    PageResponse {
        status: code,
        body: String::new(),
    }
}

/// Serves PNG bytes per url; unknown urls fail with a 404.
#[derive(Default)]
pub struct MapImageFetcher {
    images: HashMap<String, Vec<u8>>,
    pub fetched: RefCell<Vec<String>>,
}

impl MapImageFetcher {
    pub fn with_image(mut self, url: &str, color: [u8; 3]) -> Self {
        let png = encode_png(&RgbImage::from_pixel(48, 64, Rgb(color))).unwrap();
        self.images.insert(url.to_string(), png);
        self
    }

    pub fn with_bytes(mut self, url: &str, bytes: &[u8]) -> Self {
        self.images.insert(url.to_string(), bytes.to_vec());
        self
    }
}

impl ImageFetcher for MapImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetched.borrow_mut().push(url.to_string());
        self.images.get(url).cloned().ok_or(FetchError::Status(404))
    }
}

/// Embeds an image as its mean colour and text by colour words, so that
/// "red" text lands next to red images.
#[derive(Default)]
pub struct ColourEmbedder {
    pub image_calls: RefCell<Vec<usize>>,
    pub fail_images: bool,
}

impl ColourEmbedder {
    pub fn failing() -> Self {
        Self {
            fail_images: true,
            ..Default::default()
        }
    }
}

impl Embedder for ColourEmbedder {
    fn model_name(&self) -> &str {
        "colour-test"
    }

    fn dimensions(&self) -> usize {
        3
    }

    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.image_calls.borrow_mut().push(images.len());
        if self.fail_images {
            return Err(EmbeddingError::EmbeddingFailed("model crashed".into()));
        }

        Ok(images
            .iter()
            .map(|img| {
                let n = (img.width() * img.height()) as f32;
                let mut sum = [0f32; 3];
                for px in img.pixels() {
                    for c in 0..3 {
                        sum[c] += px[c] as f32;
                    }
                }
                // offset keeps black images away from the zero vector
                sum.iter().map(|s| s / n / 255.0 + 0.01).collect()
            })
            .collect())
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.to_lowercase();
        let mut v = vec![0.01f32; 3];
        if text.contains("red") {
            v[0] += 1.0;
        }
        if text.contains("green") {
            v[1] += 1.0;
        }
        if text.contains("blue") {
            v[2] += 1.0;
        }
        Ok(v)
    }
}

pub fn listing(id: &str, photo_url: Option<&str>) -> Listing {
    Listing {
        id: Some(id.to_string()),
        title: Some(format!("Robe {id}")),
        url: Some(format!("https://www.vinted.fr/items/{id}")),
        photo_url: photo_url.map(str::to_string),
        price_amount: Some(10.0),
        price_currency: Some("EUR".to_string()),
        ..Default::default()
    }
}

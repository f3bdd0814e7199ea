//! Embedding model wrapper for fastembed.
//!
//! A CLIP-style model is two towers sharing one vector space: images go
//! through the vision tower at index time, query text through the text tower
//! at search time.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use image::RgbImage;

use crate::semantic::preprocess::encode_png;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Anything that maps images and text into one shared vector space.
pub trait Embedder {
    /// Name the model was loaded under, e.g. "clip-vit-b-32".
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per image, same order, in a single call.
    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 hash of the model name for storage identification.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// fastembed image and text towers loaded as a pair.
/// Uses Mutexes because fastembed's embed calls require &mut self.
pub struct ClipModel {
    vision: Mutex<ImageEmbedding>,
    text: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipModel {
    /// Load the model pair, downloading into `cache_dir` on first use.
    ///
    /// Loading runs on a helper thread so a stalled download can be bounded
    /// by `download_timeout`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let (vision_model, text_model) = parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(load_towers(vision_model, text_model, cache_dir));
        });

        let (mut vision, mut text) = match rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "model loader exited unexpectedly".to_string(),
                ))
            }
        };

        let text_dims = probe_text_dimensions(&mut text)?;
        let image_dims = probe_image_dimensions(&mut vision)?;
        if text_dims != image_dims {
            return Err(EmbeddingError::InitFailed(format!(
                "image tower produces {image_dims} dimensions, text tower {text_dims}"
            )));
        }

        log::info!("Loaded model '{model_name}' ({text_dims} dimensions)");

        Ok(Self {
            vision: Mutex::new(vision),
            text: Mutex::new(text),
            model_name: model_name.to_string(),
            dimensions: text_dims,
        })
    }
}

impl Embedder for ClipModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if images.is_empty() {
            return Ok(vec![]);
        }

        let encoded = images
            .iter()
            .map(encode_png)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
        let slices: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();

        let mut model = self.vision.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&slices, Some(slices.len()))
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != images.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                images.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

fn load_towers(
    vision_model: ImageEmbeddingModel,
    text_model: EmbeddingModel,
    cache_dir: PathBuf,
) -> Result<(ImageEmbedding, TextEmbedding), EmbeddingError> {
    let vision = ImageEmbedding::try_new(
        ImageInitOptions::new(vision_model)
            .with_cache_dir(cache_dir.clone())
            .with_show_download_progress(true),
    )
    .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

    let text = TextEmbedding::try_new(
        InitOptions::new(text_model)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true),
    )
    .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

    Ok((vision, text))
}

/// Parse model name string to the fastembed vision/text pair.
fn parse_model_name(name: &str) -> Result<(ImageEmbeddingModel, EmbeddingModel), EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => {
            Ok((ImageEmbeddingModel::ClipVitB32, EmbeddingModel::ClipVitB32))
        }
        "nomic-embed-v1.5" | "nomicembedv15" => Ok((
            ImageEmbeddingModel::NomicEmbedVisionV15,
            EmbeddingModel::NomicEmbedTextV15,
        )),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: clip-vit-b-32, nomic-embed-v1.5",
            name
        ))),
    }
}

fn probe_text_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    let test_embeddings = model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
}

fn probe_image_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbeddingError> {
    let probe = encode_png(&RgbImage::from_pixel(32, 32, image::Rgb([128, 128, 128])))
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

    let test_embeddings = model
        .embed_bytes(&[probe.as_slice()], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_clip_shared_space() {
        let dir = tempfile::tempdir().unwrap();
        let model = ClipModel::new("clip-vit-b-32", dir.path().to_path_buf(), None).unwrap();
        assert_eq!(model.dimensions(), 512);

        let red = RgbImage::from_pixel(224, 224, image::Rgb([220, 20, 20]));
        let blue = RgbImage::from_pixel(224, 224, image::Rgb([20, 20, 220]));
        let images = model.embed_images(&[red, blue]).unwrap();
        assert_eq!(images.len(), 2);

        let query = model.embed_text("a red square").unwrap();
        let cos = |a: &[f32], b: &[f32]| {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            dot / (na * nb)
        };
        assert!(cos(&query, &images[0]) > cos(&query, &images[1]));
    }

    #[test]
    fn test_invalid_model_name() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClipModel::new("all-MiniLM-L6-v2", dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_name_aliases() {
        assert!(parse_model_name("CLIP-ViT-B-32").is_ok());
        assert!(parse_model_name("clipvitb32").is_ok());
        assert!(parse_model_name("nomic-embed-v1.5").is_ok());
    }

    #[test]
    fn test_model_id_hash_is_stable_per_name() {
        assert_eq!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-b-32"));
        assert_ne!(model_id_hash("clip-vit-b-32"), model_id_hash("nomic-embed-v1.5"));
    }
}

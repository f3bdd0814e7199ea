//! Image preprocessing for embedding generation.
//!
//! Every listing photo is brought to the same shape before it reaches the
//! model:
//! 1. Sniff the bytes, rejecting anything that is not an image
//! 2. Decode and apply the EXIF orientation
//! 3. Convert to 8-bit RGB
//! 4. Resize to a fixed square

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("empty image body")]
    Empty,

    #[error("not an image (detected {0})")]
    NotAnImage(String),

    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode `bytes` and normalize them into a `size`×`size` RGB image.
pub fn prepare_image(bytes: &[u8], size: u32) -> Result<RgbImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Empty);
    }

    // challenge pages are sometimes served with a 200
    match infer::get(bytes) {
        Some(kind) if kind.matcher_type() != infer::MatcherType::Image => {
            return Err(PreprocessError::NotAnImage(kind.mime_type().to_string()));
        }
        None if looks_like_text(bytes) => {
            return Err(PreprocessError::NotAnImage("text".to_string()));
        }
        _ => {}
    }

    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;

    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);

    let rgb = img.to_rgb8();
    if rgb.width() == size && rgb.height() == size {
        return Ok(rgb);
    }

    Ok(image::imageops::resize(&rgb, size, size, FilterType::Triangle))
}

/// Lossless PNG encoding, the container handed to the image model.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

fn looks_like_text(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(64)];
    let trimmed = head.trim_ascii_start();
    trimmed.starts_with(b"<") || trimmed.starts_with(b"{") || trimmed.starts_with(b"[")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        encode_png(&RgbImage::from_pixel(width, height, Rgb(color))).unwrap()
    }

    #[test]
    fn test_resizes_to_square() {
        let img = prepare_image(&png_bytes(640, 480, [10, 200, 30]), 224).unwrap();

        assert_eq!(img.dimensions(), (224, 224));
        assert_eq!(img.get_pixel(100, 100), &Rgb([10, 200, 30]));
    }

    #[test]
    fn test_already_sized_image_is_untouched() {
        let img = prepare_image(&png_bytes(224, 224, [1, 2, 3]), 224).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_grayscale_and_alpha_become_rgb() {
        let gray = image::GrayImage::from_pixel(50, 50, image::Luma([90]));
        let mut buf = Cursor::new(Vec::new());
        gray.write_to(&mut buf, ImageFormat::Png).unwrap();

        let img = prepare_image(buf.get_ref(), 32).unwrap();
        assert_eq!(img.get_pixel(5, 5), &Rgb([90, 90, 90]));

        let rgba = image::RgbaImage::from_pixel(20, 20, image::Rgba([200, 100, 50, 128]));
        let mut buf = Cursor::new(Vec::new());
        rgba.write_to(&mut buf, ImageFormat::Png).unwrap();

        let img = prepare_image(buf.get_ref(), 20).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_rejects_html_and_empty() {
        let html = b"<!DOCTYPE html><html><body>Just a moment...</body></html>";
        assert!(matches!(
            prepare_image(html, 224),
            Err(PreprocessError::NotAnImage(_))
        ));
        assert!(matches!(prepare_image(b"", 224), Err(PreprocessError::Empty)));
    }

    #[test]
    fn test_rejects_non_image_binary() {
        // PDF magic
        let pdf = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n";
        assert!(matches!(
            prepare_image(pdf, 224),
            Err(PreprocessError::NotAnImage(_))
        ));
    }

    #[test]
    fn test_truncated_image_fails_to_decode() {
        let bytes = png_bytes(64, 64, [0, 0, 0]);
        let result = prepare_image(&bytes[..bytes.len() / 2], 224);
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }
}

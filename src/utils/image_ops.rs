use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Compute the dimensions an image should be scaled to so that its longest
/// side is exactly `max_dimension`, preserving aspect ratio. Returns `None`
/// when both sides already fit.
///
/// Both output dimensions are rounded to the nearest pixel; the longest side
/// lands on `max_dimension` exactly because its scale factor cancels.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_dimension {
        return None;
    }

    let scale = max_dimension as f64 / longest as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    Some((new_width, new_height))
}

/// Encode an image to PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    let mut cursor = Cursor::new(&mut png_bytes);
    img.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage> {
    let bytes = bytes.to_vec(); // Clone to move into blocking task
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Asynchronously encode an image to PNG bytes using spawn_blocking.
///
/// PNG encoding is CPU-intensive and can block the async runtime if done
/// synchronously.
pub async fn encode_png_async(img: DynamicImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        encode_png(&img).context("Failed to encode image as PNG")
    })
    .await
    .context("Failed to spawn blocking task for PNG encoding")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_fit_within_no_resize_needed() {
        assert_eq!(fit_within(800, 600, 2048), None);
        assert_eq!(fit_within(2048, 2048, 2048), None);
    }

    #[test]
    fn test_fit_within_longest_side_exact() {
        let (w, h) = fit_within(4096, 2048, 2048).unwrap();
        assert_eq!(w, 2048);
        assert_eq!(h, 1024);

        let (w, h) = fit_within(1000, 3000, 1500).unwrap();
        assert_eq!(h, 1500);
        assert_eq!(w, 500);
    }

    #[test]
    fn test_fit_within_aspect_preserved_within_rounding() {
        let (w, h) = fit_within(1920, 1337, 640).unwrap();
        assert_eq!(w, 640);
        // 1337 * (640/1920) = 445.67 -> 446
        assert_eq!(h, 446);
        let src_ratio = 1920.0 / 1337.0;
        let dst_ratio = w as f64 / h as f64;
        assert!((src_ratio - dst_ratio).abs() < 0.01);
    }

    #[test]
    fn test_fit_within_never_zero() {
        let (w, h) = fit_within(10_000, 1, 100).unwrap();
        assert_eq!(w, 100);
        assert_eq!(h, 1);
    }

    #[tokio::test]
    async fn test_encode_and_load_round_trip() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([255, 0, 0, 255]),
        ));

        let png_bytes = encode_png_async(img).await.unwrap();
        assert!(!png_bytes.is_empty());

        let loaded = load_image_from_memory_async(&png_bytes).await.unwrap();
        assert_eq!(loaded.width(), 4);
        assert_eq!(loaded.height(), 4);
    }
}

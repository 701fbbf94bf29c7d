// Image preparation: validation and normalization before an image may enter
// the queue.

use image::{ImageFormat, imageops::FilterType};
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{PrepareError, PrepareResult};
use crate::core::types::PreparedImage;
use crate::utils::image_ops;

/// MIME types accepted from the file picker / drag-drop surface.
pub const ACCEPTED_MIME: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

pub fn accepted_mime(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    ACCEPTED_MIME.contains(&essence.as_str())
}

fn accepted_format(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP
    )
}

/// Validate and normalize one uploaded file.
///
/// Downscales so the longest side is at most `max_dimension` (aspect ratio
/// preserved, nearest-pixel rounding); images already within bounds keep
/// their dimensions. The output is always re-encoded as PNG so every queue
/// item carries a uniform payload; the input buffer is never mutated.
pub fn prepare(
    file_name: &str,
    content_type: Option<&str>,
    bytes: &[u8],
    max_dimension: u32,
) -> PrepareResult<PreparedImage> {
    if let Some(content_type) = content_type {
        if !accepted_mime(content_type) {
            return Err(PrepareError::UnsupportedFormat {
                file_name: file_name.to_string(),
            });
        }
    }

    // Sniff the container from the payload; an extension or content type
    // header alone is not trusted.
    let format = image::guess_format(bytes).map_err(|_| PrepareError::UnsupportedFormat {
        file_name: file_name.to_string(),
    })?;
    if !accepted_format(format) {
        return Err(PrepareError::UnsupportedFormat {
            file_name: file_name.to_string(),
        });
    }

    let img = image::load_from_memory_with_format(bytes, format).map_err(|source| {
        PrepareError::Decode {
            file_name: file_name.to_string(),
            source,
        }
    })?;

    let (width, height) = (img.width(), img.height());
    let img = match image_ops::fit_within(width, height, max_dimension) {
        Some((new_width, new_height)) => {
            debug!(
                "Downscaling '{}' {}x{} -> {}x{}",
                file_name, width, height, new_width, new_height
            );
            img.resize_exact(new_width, new_height, FilterType::Triangle)
        }
        None => img,
    };

    let (width, height) = (img.width(), img.height());
    let png_bytes = image_ops::encode_png(&img).map_err(|source| PrepareError::Encode {
        file_name: file_name.to_string(),
        source,
    })?;

    Ok(PreparedImage {
        file_name: file_name.to_string(),
        png_bytes: Arc::new(png_bytes),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([10, 20, 30, 255]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_small_image_keeps_dimensions() {
        let bytes = png_fixture(640, 480);
        let prepared = prepare("photo.png", Some("image/png"), &bytes, 2048).unwrap();
        assert_eq!((prepared.width, prepared.height), (640, 480));
    }

    #[test]
    fn test_oversized_image_longest_side_hits_limit() {
        let bytes = png_fixture(4000, 1000);
        let prepared = prepare("wide.png", Some("image/png"), &bytes, 2000).unwrap();
        assert_eq!(prepared.width, 2000);
        assert_eq!(prepared.height, 500);
    }

    #[test]
    fn test_aspect_ratio_preserved_within_rounding() {
        let bytes = png_fixture(1920, 1337);
        let prepared = prepare("page.png", Some("image/png"), &bytes, 640).unwrap();
        assert_eq!(prepared.width, 640);
        let src = 1920.0 / 1337.0;
        let dst = prepared.width as f64 / prepared.height as f64;
        assert!((src - dst).abs() < 0.01);
    }

    #[test]
    fn test_rejected_mime_type() {
        let bytes = png_fixture(10, 10);
        let err = prepare("clip.gif", Some("image/gif"), &bytes, 2048).unwrap_err();
        assert!(matches!(err, PrepareError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_mime_with_parameters_accepted() {
        assert!(accepted_mime("image/png; charset=binary"));
        assert!(accepted_mime("IMAGE/JPEG"));
        assert!(!accepted_mime("image/gif"));
    }

    #[test]
    fn test_garbage_payload_is_unsupported() {
        let err = prepare("junk.png", Some("image/png"), b"not an image", 2048).unwrap_err();
        assert!(matches!(err, PrepareError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_output_is_png() {
        let bytes = png_fixture(32, 32);
        let prepared = prepare("a.png", Some("image/png"), &bytes, 2048).unwrap();
        assert_eq!(
            image::guess_format(&prepared.png_bytes).unwrap(),
            ImageFormat::Png
        );
    }
}

// Cutout compositing: apply a foreground alpha mask to the source image.

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, RgbaImage};
use rayon::prelude::*;

use crate::utils::image_ops;

/// Composite a cutout from the source image and a foreground mask.
///
/// Keeps the original pixels and intersects their alpha with the mask: the
/// output alpha is `min(source alpha, mask alpha)`, so background-classified
/// pixels go transparent and partially-classified edges stay soft. The mask
/// must match the image dimensions.
pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> Result<RgbaImage> {
    let (width, height) = (image.width(), image.height());
    if (mask.width(), mask.height()) != (width, height) {
        anyhow::bail!(
            "Mask dimensions {}x{} do not match image {}x{}",
            mask.width(),
            mask.height(),
            width,
            height
        );
    }

    let mut raw = image.to_rgba8().into_raw();
    let mask_raw = mask.as_raw();
    let row_stride = width as usize * 4;

    raw.par_chunks_exact_mut(row_stride)
        .enumerate()
        .for_each(|(y, row)| {
            let mask_row = &mask_raw[y * width as usize..(y + 1) * width as usize];
            for (pixel, &alpha) in row.chunks_exact_mut(4).zip(mask_row) {
                pixel[3] = pixel[3].min(alpha);
            }
        });

    RgbaImage::from_raw(width, height, raw)
        .context("Failed to reassemble composited image buffer")
}

/// Composite and encode in one step; the worker's final stage.
pub fn cutout_png(image: &DynamicImage, mask: &GrayImage) -> Result<Vec<u8>> {
    let composited = apply_mask(image, mask)?;
    image_ops::encode_png(&DynamicImage::ImageRgba8(composited))
        .context("Failed to encode cutout as PNG")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    fn checkerboard_mask(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }

    #[test]
    fn test_background_pixels_go_transparent() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([200, 100, 50, 255]),
        ));
        let mask = checkerboard_mask(4, 4);

        let out = apply_mask(&img, &mask).unwrap();
        assert_eq!(out.get_pixel(0, 0)[3], 255);
        assert_eq!(out.get_pixel(1, 0)[3], 0);
        // Color channels are untouched either way
        assert_eq!(&out.get_pixel(1, 0).0[..3], &[200, 100, 50]);
    }

    #[test]
    fn test_source_alpha_is_intersected_not_replaced() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            2,
            2,
            Rgba([10, 10, 10, 128]),
        ));
        let mask = GrayImage::from_pixel(2, 2, Luma([255u8]));

        let out = apply_mask(&img, &mask).unwrap();
        // Fully-foreground mask keeps the weaker source alpha
        assert_eq!(out.get_pixel(0, 0)[3], 128);
    }

    #[test]
    fn test_partial_mask_gives_soft_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            1,
            1,
            Rgba([0, 0, 0, 255]),
        ));
        let mask = GrayImage::from_pixel(1, 1, Luma([77u8]));

        let out = apply_mask(&img, &mask).unwrap();
        assert_eq!(out.get_pixel(0, 0)[3], 77);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(4, 4));
        let mask = GrayImage::new(2, 2);
        assert!(apply_mask(&img, &mask).is_err());
    }

    #[test]
    fn test_cutout_png_round_trip() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            8,
            8,
            Rgba([1, 2, 3, 255]),
        ));
        let mask = GrayImage::from_pixel(8, 8, Luma([0u8]));

        let png = cutout_png(&img, &mask).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(3, 3)[3], 0);
    }
}

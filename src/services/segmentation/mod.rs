// Segmentation seam: foreground/background matting behind a trait so the
// engine never depends on a concrete model runtime.
//
// The production implementation drives an ONNX matting model per quality
// tier. Model contract: input "image" is NCHW float32 [1, 3, S, S] in
// [0, 1]; output "alpha" is [1, 1, S, S] foreground logits.

pub mod session;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma};
use ndarray::Array4;
use ort::session::Session;
use tracing::{debug, info, instrument};

use crate::core::config::Config;
use crate::core::types::Quality;

/// A loaded segmentation model. One instance is owned by exactly one worker
/// and processes one image at a time, so `segment` takes `&mut self`.
pub trait Segmenter: Send {
    /// Produce a per-pixel foreground alpha mask at the image's dimensions.
    fn segment(&mut self, image: &DynamicImage) -> Result<GrayImage>;
}

/// Loads a [`Segmenter`] for a quality tier. Loading is blocking and may
/// take seconds; workers call it lazily on the first job and on quality
/// changes.
pub trait SegmenterProvider: Send + Sync {
    fn load(&self, quality: Quality) -> Result<Box<dyn Segmenter>>;
}

/// Production provider backed by ONNX Runtime matting models.
pub struct OnnxSegmenterProvider {
    general_model_path: String,
    landscape_model_path: String,
    input_size: u32,
    pool_size: usize,
}

impl OnnxSegmenterProvider {
    pub fn from_config(config: &Config) -> Self {
        Self {
            general_model_path: config.model.general_model_path.clone(),
            landscape_model_path: config.model.landscape_model_path.clone(),
            input_size: config.model.input_size,
            pool_size: config.pool_size(),
        }
    }

    fn model_path(&self, quality: Quality) -> &str {
        match quality {
            Quality::General => &self.general_model_path,
            Quality::Landscape => &self.landscape_model_path,
        }
    }
}

impl SegmenterProvider for OnnxSegmenterProvider {
    #[instrument(skip(self))]
    fn load(&self, quality: Quality) -> Result<Box<dyn Segmenter>> {
        let path = self.model_path(quality);
        let model_bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {} model from {}", quality.as_str(), path))?;

        // A tiny file is almost certainly a Git LFS stub, not a model
        if model_bytes.len() < 10_000 {
            anyhow::bail!(
                "Model file at {} is too small ({} bytes); is Git LFS checked out?",
                path,
                model_bytes.len()
            );
        }
        info!(
            "Loaded {} matting model ({:.1} MB)",
            quality.as_str(),
            model_bytes.len() as f64 / 1_048_576.0
        );

        let (backend, session) =
            session::build_session(&model_bytes, quality.as_str(), self.pool_size)?;

        Ok(Box::new(OnnxSegmenter {
            session,
            input_size: self.input_size,
            backend,
        }))
    }
}

/// One ONNX matting session.
pub struct OnnxSegmenter {
    session: Session,
    input_size: u32,
    backend: String,
}

impl Segmenter for OnnxSegmenter {
    fn segment(&mut self, image: &DynamicImage) -> Result<GrayImage> {
        let start = std::time::Instant::now();
        let orig_width = image.width();
        let orig_height = image.height();

        let input_tensor = self.preprocess(image);
        let input_value = ort::value::Value::from_array(input_tensor)?;

        let size = self.input_size as usize;
        let alpha = {
            let outputs = self.session.run(ort::inputs!["image" => input_value])?;
            let (_shape, data) = outputs["alpha"]
                .try_extract_tensor::<f32>()
                .context("Failed to extract alpha tensor")?;
            if data.len() != size * size {
                anyhow::bail!(
                    "Unexpected alpha tensor size: got {}, expected {}x{}",
                    data.len(),
                    size,
                    size
                );
            }
            data.to_vec()
        };

        // Logits -> [0, 255] alpha at model resolution
        let mask_pixels: Vec<u8> = alpha
            .iter()
            .map(|&v| {
                let sigmoid = 1.0 / (1.0 + (-v).exp());
                (sigmoid * 255.0).round() as u8
            })
            .collect();

        let mask_small =
            ImageBuffer::<Luma<u8>, Vec<u8>>::from_vec(self.input_size, self.input_size, mask_pixels)
                .context("Failed to assemble alpha mask buffer")?;

        // Soft-edge upscale back to the source dimensions
        let mask = image::imageops::resize(
            &mask_small,
            orig_width,
            orig_height,
            FilterType::Triangle,
        );

        debug!(
            "Segmented {}x{} image on {} in {:.2}ms",
            orig_width,
            orig_height,
            self.backend,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(mask)
    }
}

impl OnnxSegmenter {
    /// Resize and normalize into an NCHW [1, 3, S, S] tensor in [0, 1].
    fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let resized = image.resize_exact(self.input_size, self.input_size, FilterType::Triangle);
        let rgb = resized.to_rgb8();

        let size = self.input_size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }
        array
    }
}

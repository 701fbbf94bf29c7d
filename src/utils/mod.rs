// Utility modules

pub mod image_ops;
pub mod metrics;

pub use image_ops::{encode_png, fit_within, load_image_from_memory_async};
pub use metrics::{Metrics, MetricsSnapshot};

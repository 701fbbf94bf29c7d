// Service modules: preparation, inference, compositing, and external
// collaborators.

pub mod compositor;
pub mod export;
pub mod ledger;
pub mod prepare;
pub mod segmentation;
pub mod store;

pub use ledger::{HttpUsageGate, UnmeteredGate, UsageGate};
pub use segmentation::{OnnxSegmenterProvider, Segmenter, SegmenterProvider};
pub use store::{HttpResultStore, NoopResultStore, ResultStore, StoreRequest};

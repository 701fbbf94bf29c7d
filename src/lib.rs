// Library exports for the batch background-removal engine

// Core modules
pub mod core;
pub mod engine;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{ConfigError, ExportError, LedgerError, PrepareError, StartError},
    types::{
        IncomingFile, ItemId, ItemStatus, ItemView, Job, PreparedImage, Quality, QueueItem,
        QueueSnapshot, QueueTotals, StartReceipt,
    },
};

pub use crate::engine::{AddReport, BatchEngine, EngineHandle, EngineOptions, RejectedFile};

pub use crate::services::{
    HttpResultStore, HttpUsageGate, NoopResultStore, OnnxSegmenterProvider, ResultStore,
    Segmenter, SegmenterProvider, UnmeteredGate, UsageGate,
};

pub use crate::utils::{Metrics, MetricsSnapshot};

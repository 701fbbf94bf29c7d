// Shared types for the batch background-removal workflow

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque, stable identifier for one queue item. Assigned by the coordinator
/// and used for all worker correlation.
pub type ItemId = u64;

/// Quality tier for the segmentation model: a coarse speed/accuracy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Fast model, tuned for people and products.
    #[default]
    General,
    /// Slower model with better accuracy on non-human subjects.
    Landscape,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::General => "general",
            Quality::Landscape => "landscape",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "general" => Some(Quality::General),
            "landscape" => Some(Quality::Landscape),
            _ => None,
        }
    }
}

/// A raw uploaded file, prior to validation and preparation.
pub struct IncomingFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A prepared (validated, downscaled, PNG-normalized) image ready to enter
/// the queue.
#[derive(Clone, Debug)]
pub struct PreparedImage {
    pub file_name: String,
    pub png_bytes: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

/// Per-item lifecycle state.
///
/// Queued -> Processing -> Done | Error. Terminal states are never left;
/// items only disappear through an explicit clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error)
    }
}

/// One unit of work in the queue.
///
/// Invariant: exactly one of {result, error} is set, and only when status is
/// terminal. `progress` is monotonically non-decreasing while Processing and
/// pinned to 100 on Done.
#[derive(Clone)]
pub struct QueueItem {
    pub id: ItemId,
    pub file_name: String,
    pub source: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub status: ItemStatus,
    pub progress: u8,
    pub result: Option<Arc<Vec<u8>>>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(id: ItemId, prepared: PreparedImage) -> Self {
        Self {
            id,
            file_name: prepared.file_name,
            source: prepared.png_bytes,
            width: prepared.width,
            height: prepared.height,
            status: ItemStatus::Queued,
            progress: 0,
            result: None,
            error: None,
        }
    }
}

/// One job dispatched to an inference worker.
#[derive(Clone)]
pub struct Job {
    pub id: ItemId,
    pub image: Arc<Vec<u8>>,
    pub quality: Quality,
}

/// Payload of a message from an inference worker back to the coordinator.
pub enum WorkerReply {
    Progress { pct: u8 },
    Done { cutout: Vec<u8>, elapsed_ms: f64 },
    Error { message: String },
}

impl WorkerReply {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerReply::Done { .. } | WorkerReply::Error { .. })
    }
}

/// A worker message tagged with the slot it came from, so the pool can free
/// the right slot even when the item it references no longer exists.
pub struct WorkerEvent {
    pub worker_id: usize,
    pub item_id: ItemId,
    pub reply: WorkerReply,
}

/// Serializable view of one queue item for the surrounding UI.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub id: ItemId,
    pub file_name: String,
    pub status: ItemStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// PNG data URL, present only when status is Done (enables the per-item
    /// download action).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data_url: Option<String>,
}

/// Aggregate counters over the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueTotals {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    /// Credits a start() over the currently queued items would reserve.
    pub estimated_cost: u32,
}

/// Observable snapshot of the whole queue (insertion order preserved).
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub items: Vec<ItemView>,
    pub is_processing: bool,
    pub totals: QueueTotals,
}

/// Receipt for an accepted batch start.
#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub started: usize,
    pub reserved_credits: u32,
}

/// Credits required for `queued` images at `images_per_credit` images each.
pub fn batch_cost(queued: usize, images_per_credit: usize) -> u32 {
    debug_assert!(images_per_credit > 0);
    queued.div_ceil(images_per_credit) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_cost_two_images_per_credit() {
        assert_eq!(batch_cost(0, 2), 0);
        assert_eq!(batch_cost(1, 2), 1);
        assert_eq!(batch_cost(2, 2), 1);
        assert_eq!(batch_cost(3, 2), 2);
        assert_eq!(batch_cost(10, 2), 5);
        assert_eq!(batch_cost(11, 2), 6);
    }

    #[test]
    fn test_quality_parse_round_trip() {
        assert_eq!(Quality::parse("general"), Some(Quality::General));
        assert_eq!(Quality::parse("LANDSCAPE"), Some(Quality::Landscape));
        assert_eq!(Quality::parse("ultra"), None);
        assert_eq!(Quality::parse(Quality::General.as_str()), Some(Quality::General));
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ItemStatus::Queued.is_terminal());
        assert!(!ItemStatus::Processing.is_terminal());
        assert!(ItemStatus::Done.is_terminal());
        assert!(ItemStatus::Error.is_terminal());
    }
}

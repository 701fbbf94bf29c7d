// Worker pool manager: a fixed set of inference workers and their busy/idle
// bookkeeping.
//
// Each slot owns the sending side of its worker's job channel; every worker
// reports back through one shared event channel tagged with its slot index.
// The event route is established once at spawn and never reassigned.

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Sender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::core::types::{Job, WorkerEvent};
use crate::engine::worker;
use crate::services::segmentation::SegmenterProvider;

/// One pool member. `busy` is true exactly from a successful dispatch until
/// the worker's terminal message for that job is processed.
struct WorkerSlot {
    job_tx: Sender<Job>,
    busy: bool,
}

/// Fixed-size pool of inference workers. Membership is static for the pool's
/// lifetime; workers shut down when the pool (and with it every job sender)
/// is dropped.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    #[allow(dead_code)]
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers, each on its own OS thread with a single-slot
    /// job channel (a worker never holds more than one unresolved job).
    pub fn spawn(
        size: usize,
        provider: Arc<dyn SegmenterProvider>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Self> {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for worker_id in 0..size {
            let (job_tx, job_rx) = bounded::<Job>(1);
            let provider = Arc::clone(&provider);
            let events = events.clone();

            let handle = std::thread::Builder::new()
                .name(format!("inference-worker-{}", worker_id))
                .spawn(move || worker::run(worker_id, provider, job_rx, events))
                .context("Failed to spawn inference worker thread")?;

            slots.push(WorkerSlot { job_tx, busy: false });
            threads.push(handle);
        }

        info!("Worker pool ready with {} slot(s)", size);
        Ok(Self { slots, threads })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }

    /// Hand a job to an idle worker. Returns false when every slot is busy
    /// (or the chosen worker is gone); the caller must re-queue the job at
    /// the front of its pending sequence so nothing is lost.
    pub fn dispatch(&mut self, job: Job) -> bool {
        let Some((worker_id, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.busy)
        else {
            return false;
        };

        let item_id = job.id;
        match slot.job_tx.try_send(job) {
            Ok(()) => {
                slot.busy = true;
                debug!("Dispatched item {} to worker {}", item_id, worker_id);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                warn!("Worker {} rejected item {}; re-queueing", worker_id, item_id);
                false
            }
        }
    }

    /// Free a slot after its terminal message was processed.
    pub fn mark_idle(&mut self, worker_id: usize) {
        if let Some(slot) = self.slots.get_mut(worker_id) {
            slot.busy = false;
        } else {
            warn!("mark_idle for unknown worker {}", worker_id);
        }
    }
}

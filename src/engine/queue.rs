// Job queue / batch controller: the single-threaded coordinator that owns
// all queue state.
//
// Every state transition flows through one actor task reacting to explicit
// commands and worker events, so no transition is ever computed against a
// stale snapshot of the queue. The actor never blocks; the usage-ledger
// round-trip before a batch starts is its only await.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::errors::{ExportError, LedgerError, LedgerResult, StartError};
use crate::core::types::{
    batch_cost, IncomingFile, ItemId, ItemStatus, ItemView, Job, PreparedImage, Quality,
    QueueItem, QueueSnapshot, QueueTotals, StartReceipt, WorkerEvent, WorkerReply,
};
use crate::engine::pool::WorkerPool;
use crate::services::export;
use crate::services::ledger::UsageGate;
use crate::services::prepare;
use crate::services::segmentation::SegmenterProvider;
use crate::services::store::{self, ResultStore, StoreRequest};
use crate::utils::Metrics;

/// Feature tag sent to the ledger and the result store.
const FEATURE_TAG: &str = "batch-background-removal";

/// Engine sizing, separated from the full application config so tests and
/// embedders can construct it directly.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pool_size: usize,
    pub max_dimension: u32,
    pub images_per_credit: usize,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_size: config.pool_size(),
            max_dimension: config.max_dimension(),
            images_per_credit: config.images_per_credit(),
        }
    }
}

/// Outcome of one batch add: accepted files are queued, rejected files are
/// reported inline without blocking their siblings.
#[derive(Debug, Clone, Serialize)]
pub struct AddReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedFile {
    pub file_name: String,
    pub reason: String,
}

enum Command {
    Enqueue {
        prepared: Vec<PreparedImage>,
    },
    Start {
        owner: Option<String>,
        quality: Quality,
        respond: oneshot::Sender<Result<StartReceipt, StartError>>,
    },
    Clear,
    Snapshot {
        respond: oneshot::Sender<QueueSnapshot>,
    },
    DoneResults {
        respond: oneshot::Sender<Vec<(String, Arc<Vec<u8>>)>>,
    },
}

/// Spawns the coordinator actor plus its worker pool.
pub struct BatchEngine;

impl BatchEngine {
    pub fn spawn(
        options: EngineOptions,
        provider: Arc<dyn SegmenterProvider>,
        gate: Arc<dyn UsageGate>,
        result_store: Arc<dyn ResultStore>,
        metrics: Metrics,
    ) -> Result<EngineHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(options.pool_size, provider, event_tx)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            items: Vec::new(),
            pending: VecDeque::new(),
            is_processing: false,
            next_id: 1,
            run_quality: Quality::default(),
            owner: None,
            pool,
            gate: Arc::clone(&gate),
            result_store,
            metrics: metrics.clone(),
            images_per_credit: options.images_per_credit,
        };
        tokio::spawn(coordinator.run(cmd_rx, event_rx));

        Ok(EngineHandle {
            cmd_tx,
            gate,
            metrics,
            max_dimension: options.max_dimension,
        })
    }
}

/// Cloneable handle exposing the queue actions to the surrounding surface.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    gate: Arc<dyn UsageGate>,
    metrics: Metrics,
    max_dimension: u32,
}

impl EngineHandle {
    /// Validate and prepare a set of uploaded files, then enqueue the ones
    /// that survive. Preparation runs off the async runtime; one bad file
    /// never blocks the rest.
    pub async fn add_files(&self, files: Vec<IncomingFile>) -> Result<AddReport> {
        let tasks: Vec<_> = files
            .into_iter()
            .map(|file| {
                let max_dimension = self.max_dimension;
                tokio::task::spawn_blocking(move || {
                    prepare::prepare(
                        &file.file_name,
                        file.content_type.as_deref(),
                        &file.bytes,
                        max_dimension,
                    )
                })
            })
            .collect();

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for result in futures::future::join_all(tasks).await {
            match result.context("Image preparation task panicked")? {
                Ok(prepared) => accepted.push(prepared),
                Err(e) => {
                    self.metrics.record_image_rejected();
                    rejected.push(RejectedFile {
                        file_name: e.file_name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let count = accepted.len();
        if count > 0 {
            self.metrics.record_images_enqueued(count);
            self.cmd_tx
                .send(Command::Enqueue { prepared: accepted })
                .map_err(|_| anyhow!("batch engine is not running"))?;
        }

        Ok(AddReport {
            accepted: count,
            rejected,
        })
    }

    /// Start a batch over everything currently queued.
    pub async fn start(
        &self,
        owner: Option<String>,
        quality: Quality,
    ) -> Result<StartReceipt, StartError> {
        let (respond, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start {
                owner,
                quality,
                respond,
            })
            .map_err(|_| StartError::EngineGone)?;
        response.await.map_err(|_| StartError::EngineGone)?
    }

    /// Empty the queue. Allowed in any state; in-flight inference runs to
    /// completion and its late results are discarded.
    pub fn clear(&self) {
        let _ = self.cmd_tx.send(Command::Clear);
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (respond, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { respond })
            .map_err(|_| anyhow!("batch engine is not running"))?;
        response.await.context("batch engine is not running")
    }

    /// Bundle every Done item into a ZIP archive.
    pub async fn bundle(&self) -> Result<Vec<u8>, ExportError> {
        let (respond, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::DoneResults { respond })
            .map_err(|_| ExportError::EngineGone)?;
        let done = response.await.map_err(|_| ExportError::EngineGone)?;

        let archive = tokio::task::spawn_blocking(move || export::bundle(&done))
            .await
            .map_err(|e| ExportError::Io(std::io::Error::other(e)))??;
        self.metrics.record_archive_built();
        Ok(archive)
    }

    /// Current credit balance from the usage ledger.
    pub async fn balance(&self) -> LedgerResult<u32> {
        self.gate.balance().await
    }
}

/// The actor. Exclusive owner of the queue state; everything it touches is
/// mutated from its single task only.
struct Coordinator {
    items: Vec<QueueItem>,
    pending: VecDeque<ItemId>,
    is_processing: bool,
    next_id: ItemId,
    run_quality: Quality,
    owner: Option<String>,
    pool: WorkerPool,
    gate: Arc<dyn UsageGate>,
    result_store: Arc<dyn ResultStore>,
    metrics: Metrics,
    images_per_credit: usize,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle dropped: tear the engine down
                    None => break,
                },
                Some(event) = events.recv() => self.handle_worker_event(event),
            }
        }
        info!("Batch engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { prepared } => self.handle_enqueue(prepared),
            Command::Start {
                owner,
                quality,
                respond,
            } => {
                let result = self.handle_start(owner, quality).await;
                let _ = respond.send(result);
            }
            Command::Clear => self.handle_clear(),
            Command::Snapshot { respond } => {
                let _ = respond.send(self.snapshot());
            }
            Command::DoneResults { respond } => {
                let done = self
                    .items
                    .iter()
                    .filter(|item| item.status == ItemStatus::Done)
                    .filter_map(|item| {
                        item.result
                            .as_ref()
                            .map(|result| (item.file_name.clone(), Arc::clone(result)))
                    })
                    .collect();
                let _ = respond.send(done);
            }
        }
    }

    fn handle_enqueue(&mut self, prepared: Vec<PreparedImage>) {
        for image in prepared {
            let id = self.next_id;
            self.next_id += 1;
            debug!("Queued item {} ('{}')", id, image.file_name);
            self.items.push(QueueItem::new(id, image));
        }
    }

    /// Gate and launch a batch over the items currently Queued (and not
    /// already scheduled by an earlier start). The whole cost is reserved
    /// before any item leaves Queued; on any refusal nothing changes.
    async fn handle_start(
        &mut self,
        owner: Option<String>,
        quality: Quality,
    ) -> Result<StartReceipt, StartError> {
        let Some(owner) = owner else {
            return Err(StartError::Unauthenticated);
        };

        let ready: Vec<ItemId> = self
            .items
            .iter()
            .filter(|item| {
                item.status == ItemStatus::Queued && !self.pending.contains(&item.id)
            })
            .map(|item| item.id)
            .collect();

        if ready.is_empty() {
            return Err(StartError::EmptyQueue);
        }

        let cost = batch_cost(ready.len(), self.images_per_credit);
        if let Err(e) = self.gate.check_and_reserve(cost, FEATURE_TAG).await {
            self.metrics.record_ledger_rejection();
            match &e {
                LedgerError::InsufficientBalance { .. } => {
                    info!(
                        "Batch start refused: {} credit(s) needed for {} image(s)",
                        cost,
                        ready.len()
                    );
                }
                other => warn!("Batch start refused by ledger: {}", other),
            }
            return Err(e.into());
        }

        info!(
            "Batch started: {} image(s), {} credit(s) reserved, quality={}",
            ready.len(),
            cost,
            quality.as_str()
        );
        self.metrics.record_batch_started(cost);
        let started = ready.len();
        self.owner = Some(owner);
        self.run_quality = quality;
        self.pending.extend(ready);
        self.is_processing = true;
        self.fill_pool();

        Ok(StartReceipt {
            started,
            reserved_credits: cost,
        })
    }

    /// Keep the pool saturated: dispatch pending items in FIFO order until
    /// the pool refuses. A refused item goes back to the FRONT so relative
    /// order among still-pending items is preserved.
    fn fill_pool(&mut self) {
        while let Some(id) = self.pending.pop_front() {
            let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
                continue;
            };
            let job = Job {
                id,
                image: Arc::clone(&item.source),
                quality: self.run_quality,
            };
            if self.pool.dispatch(job) {
                item.status = ItemStatus::Processing;
            } else {
                self.pending.push_front(id);
                break;
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let WorkerEvent {
            worker_id,
            item_id,
            reply,
        } = event;

        // Free the slot on terminal messages even when the item has been
        // cleared away; the pool invariant is independent of the queue.
        let terminal = reply.is_terminal();
        if terminal {
            self.pool.mark_idle(worker_id);
        }

        match reply {
            WorkerReply::Progress { pct } => {
                if let Some(item) = self.items.iter_mut().find(|item| item.id == item_id) {
                    if item.status == ItemStatus::Processing {
                        // Progress never moves backwards
                        item.progress = item.progress.max(pct.min(100));
                    }
                }
            }
            WorkerReply::Done { cutout, elapsed_ms } => {
                let cutout = Arc::new(cutout);
                match self.items.iter_mut().find(|item| item.id == item_id) {
                    Some(item) if item.status == ItemStatus::Processing => {
                        item.status = ItemStatus::Done;
                        item.progress = 100;
                        item.result = Some(Arc::clone(&cutout));
                        self.metrics
                            .record_item_done(Duration::from_secs_f64(elapsed_ms / 1000.0));

                        if let Some(owner) = &self.owner {
                            store::store_best_effort(
                                Arc::clone(&self.result_store),
                                self.metrics.clone(),
                                StoreRequest {
                                    item_id,
                                    file_name: item.file_name.clone(),
                                    original: Arc::clone(&item.source),
                                    cutout,
                                    owner: owner.clone(),
                                    feature: FEATURE_TAG,
                                },
                            );
                        }
                    }
                    _ => debug!("Discarding late result for item {}", item_id),
                }
            }
            WorkerReply::Error { message } => {
                match self.items.iter_mut().find(|item| item.id == item_id) {
                    Some(item) if item.status == ItemStatus::Processing => {
                        item.status = ItemStatus::Error;
                        item.error = Some(message);
                        self.metrics.record_item_failed();
                    }
                    _ => debug!("Discarding late error for item {}", item_id),
                }
            }
        }

        if terminal {
            self.fill_pool();
        }
        self.update_processing_flag();
    }

    fn handle_clear(&mut self) {
        let in_flight = self.pool.busy_count();
        let dropped = self.items.len();
        self.items.clear();
        self.pending.clear();
        self.is_processing = false;
        self.owner = None;
        info!(
            "Queue cleared: {} item(s) removed, {} in-flight job(s) will be discarded",
            dropped, in_flight
        );
    }

    /// Re-evaluated after every transition: the batch is over exactly when
    /// no item remains in a non-terminal state.
    fn update_processing_flag(&mut self) {
        if self.is_processing && self.items.iter().all(|item| item.status.is_terminal()) {
            self.is_processing = false;
            let done = self
                .items
                .iter()
                .filter(|item| item.status == ItemStatus::Done)
                .count();
            info!(
                "Batch complete: {} done, {} failed",
                done,
                self.items.len() - done
            );
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let items: Vec<ItemView> = self
            .items
            .iter()
            .map(|item| ItemView {
                id: item.id,
                file_name: item.file_name.clone(),
                status: item.status,
                progress: item.progress,
                error: item.error.clone(),
                result_data_url: item.result.as_ref().map(|png| {
                    format!(
                        "data:image/png;base64,{}",
                        general_purpose::STANDARD.encode(png.as_slice())
                    )
                }),
            })
            .collect();

        let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count();
        let startable = self
            .items
            .iter()
            .filter(|item| {
                item.status == ItemStatus::Queued && !self.pending.contains(&item.id)
            })
            .count();

        QueueSnapshot {
            is_processing: self.is_processing,
            totals: QueueTotals {
                total: items.len(),
                queued: count(ItemStatus::Queued),
                processing: count(ItemStatus::Processing),
                done: count(ItemStatus::Done),
                failed: count(ItemStatus::Error),
                estimated_cost: batch_cost(startable, self.images_per_credit),
            },
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::PrepareError;
    use crate::engine::testing::{FakeProvider, RecordingStore, TestGate, FAIL_WIDTH};
    use crate::services::store::NoopResultStore;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    fn png_file(name: &str, width: u32, height: u32) -> IncomingFile {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([120, 130, 140, 255]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        IncomingFile {
            file_name: name.to_string(),
            content_type: Some("image/png".to_string()),
            bytes,
        }
    }

    fn options(pool_size: usize) -> EngineOptions {
        EngineOptions {
            pool_size,
            max_dimension: 2048,
            images_per_credit: 2,
        }
    }

    fn spawn_engine(
        pool_size: usize,
        provider: Arc<FakeProvider>,
        gate: Arc<TestGate>,
        result_store: Arc<dyn ResultStore>,
    ) -> EngineHandle {
        BatchEngine::spawn(
            options(pool_size),
            provider,
            gate,
            result_store,
            Metrics::new(),
        )
        .unwrap()
    }

    async fn wait_until<F>(handle: &EngineHandle, mut predicate: F) -> QueueSnapshot
    where
        F: FnMut(&QueueSnapshot) -> bool,
    {
        for _ in 0..500 {
            let snapshot = handle.snapshot().await.unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    async fn wait_until_idle(handle: &EngineHandle) -> QueueSnapshot {
        wait_until(handle, |s| !s.is_processing && s.totals.processing == 0).await
    }

    #[tokio::test]
    async fn test_start_requires_authentication() {
        let handle = spawn_engine(
            1,
            Arc::new(FakeProvider::instant()),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );
        handle.add_files(vec![png_file("a.png", 8, 8)]).await.unwrap();

        let err = handle.start(None, Quality::General).await.unwrap_err();
        assert!(matches!(err, StartError::Unauthenticated));

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.totals.queued, 1);
    }

    #[tokio::test]
    async fn test_start_with_empty_queue_rejected() {
        let handle = spawn_engine(
            1,
            Arc::new(FakeProvider::instant()),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        let err = handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::EmptyQueue));
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_queue_untouched() {
        let gate = Arc::new(TestGate::with_balance(2));
        let handle = spawn_engine(
            2,
            Arc::new(FakeProvider::instant()),
            Arc::clone(&gate),
            Arc::new(NoopResultStore),
        );

        let files = (0..5).map(|i| png_file(&format!("{i}.png"), 8, 8)).collect();
        handle.add_files(files).await.unwrap();

        // 5 images -> 3 credits, only 2 available
        let err = handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::InsufficientBalance { required: 3 }));

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.totals.queued, 5);
        assert_eq!(snapshot.totals.processing, 0);
        assert_eq!(gate.balance_now(), 2);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_generic_refusal() {
        let handle = spawn_engine(
            1,
            Arc::new(FakeProvider::instant()),
            Arc::new(TestGate::failing()),
            Arc::new(NoopResultStore),
        );
        handle.add_files(vec![png_file("a.png", 8, 8)]).await.unwrap();

        let err = handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::Ledger(_)));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.totals.queued, 1);
    }

    #[tokio::test]
    async fn test_batch_drains_with_bounded_parallelism() {
        let provider = Arc::new(FakeProvider::instant());
        let gate = Arc::new(TestGate::with_balance(10));
        let store = Arc::new(RecordingStore::default());
        let handle = spawn_engine(2, Arc::clone(&provider), Arc::clone(&gate), store.clone());

        let files = (0..5).map(|i| png_file(&format!("{i}.png"), 8, 8)).collect();
        let report = handle.add_files(files).await.unwrap();
        assert_eq!(report.accepted, 5);

        let receipt = handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        assert_eq!(receipt.started, 5);
        assert_eq!(receipt.reserved_credits, 3);
        assert_eq!(gate.balance_now(), 7);

        let snapshot = wait_until_idle(&handle).await;
        assert_eq!(snapshot.totals.done, 5);
        assert_eq!(snapshot.totals.queued, 0);
        assert_eq!(snapshot.totals.failed, 0);
        for item in &snapshot.items {
            assert_eq!(item.progress, 100);
            assert!(item.result_data_url.is_some());
            assert!(item.error.is_none());
        }

        // Best-effort persistence saw every finished item
        wait_until(&handle, |_| store.stored_count() == 5).await;
    }

    #[tokio::test]
    async fn test_at_most_pool_size_items_processing() {
        let provider = Arc::new(FakeProvider::held());
        let handle = spawn_engine(
            2,
            Arc::clone(&provider),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        let files = (0..5).map(|i| png_file(&format!("{i}.png"), 8, 8)).collect();
        handle.add_files(files).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();

        // The two slots saturate and nothing more is dispatched while they
        // are held
        let snapshot = wait_until(&handle, |s| s.totals.processing == 2).await;
        assert_eq!(snapshot.totals.queued, 3);
        assert!(snapshot.is_processing);

        // Progress checkpoint arrives before inference for in-flight items
        wait_until(&handle, |s| {
            s.items
                .iter()
                .filter(|i| i.status == ItemStatus::Processing)
                .all(|i| i.progress == 50)
        })
        .await;

        // Releasing one unblocks exactly one more dispatch
        provider.release(1);
        let snapshot = wait_until(&handle, |s| s.totals.done == 1).await;
        assert!(snapshot.totals.processing <= 2);

        provider.release(4);
        let snapshot = wait_until_idle(&handle).await;
        assert_eq!(snapshot.totals.done, 5);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_abort_siblings() {
        let provider = Arc::new(FakeProvider::instant());
        let handle = spawn_engine(
            2,
            provider,
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        // Item 3 carries the poison width the fake segmenter refuses
        let mut files: Vec<IncomingFile> = Vec::new();
        for i in 0..5 {
            let width = if i == 2 { FAIL_WIDTH } else { 8 };
            files.push(png_file(&format!("{i}.png"), width, 8));
        }
        handle.add_files(files).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();

        let snapshot = wait_until_idle(&handle).await;
        assert_eq!(snapshot.totals.done, 4);
        assert_eq!(snapshot.totals.failed, 1);

        let failed = snapshot
            .items
            .iter()
            .find(|i| i.status == ItemStatus::Error)
            .unwrap();
        assert_eq!(failed.file_name, "2.png");
        assert!(!failed.error.as_ref().unwrap().is_empty());
        assert!(failed.result_data_url.is_none());

        // No job lost: every id that was queued reached a terminal state
        assert!(snapshot
            .items
            .iter()
            .all(|i| matches!(i.status, ItemStatus::Done | ItemStatus::Error)));
        assert_eq!(snapshot.items.len(), 5);
    }

    #[tokio::test]
    async fn test_clear_mid_flight_discards_late_results() {
        let provider = Arc::new(FakeProvider::held());
        let handle = spawn_engine(
            2,
            Arc::clone(&provider),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        let files = (0..4).map(|i| png_file(&format!("{i}.png"), 8, 8)).collect();
        handle.add_files(files).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        wait_until(&handle, |s| s.totals.processing == 2).await;

        // Clearing empties the queue immediately
        handle.clear();
        let snapshot = wait_until(&handle, |s| s.items.is_empty()).await;
        assert!(!snapshot.is_processing);

        // Late results for the cleared ids are dropped without effect, and
        // the slots they occupied become usable again
        provider.release(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.items.is_empty());

        handle.add_files(vec![png_file("fresh.png", 8, 8)]).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        provider.release(2);
        let snapshot = wait_until_idle(&handle).await;
        assert_eq!(snapshot.totals.done, 1);
    }

    #[tokio::test]
    async fn test_items_added_mid_batch_need_second_start() {
        let provider = Arc::new(FakeProvider::held());
        let gate = Arc::new(TestGate::with_balance(10));
        let handle = spawn_engine(
            1,
            Arc::clone(&provider),
            Arc::clone(&gate),
            Arc::new(NoopResultStore),
        );

        handle.add_files(vec![png_file("first.png", 8, 8)]).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        wait_until(&handle, |s| s.totals.processing == 1).await;

        // Added after start: excluded from the running batch
        handle.add_files(vec![png_file("late.png", 8, 8)]).await.unwrap();
        provider.release(1);
        let snapshot = wait_until(&handle, |s| s.totals.done == 1).await;
        assert_eq!(snapshot.totals.queued, 1);

        // A second explicit start picks it up and reserves only its cost
        let receipt = handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        assert_eq!(receipt.started, 1);
        assert_eq!(receipt.reserved_credits, 1);

        provider.release(1);
        let snapshot = wait_until_idle(&handle).await;
        assert_eq!(snapshot.totals.done, 2);
        assert_eq!(gate.balance_now(), 8);
    }

    #[tokio::test]
    async fn test_model_cached_until_quality_changes() {
        let provider = Arc::new(FakeProvider::instant());
        let handle = spawn_engine(
            1,
            Arc::clone(&provider),
            Arc::new(TestGate::with_balance(100)),
            Arc::new(NoopResultStore),
        );

        let files = (0..3).map(|i| png_file(&format!("{i}.png"), 8, 8)).collect();
        handle.add_files(files).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        wait_until_idle(&handle).await;

        // One worker, one quality: a single load covers all three jobs
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);

        handle.add_files(vec![png_file("next.png", 8, 8)]).await.unwrap();
        handle
            .start(Some("user-1".into()), Quality::Landscape)
            .await
            .unwrap();
        wait_until(&handle, |s| s.totals.done == 4).await;

        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bundle_round_trip_and_empty_rejection() {
        let handle = spawn_engine(
            1,
            Arc::new(FakeProvider::instant()),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        // Nothing done yet
        let err = handle.bundle().await.unwrap_err();
        assert!(matches!(err, ExportError::NothingToExport));

        handle
            .add_files(vec![png_file("portrait.jpg.png", 8, 8)])
            .await
            .unwrap();
        handle
            .start(Some("user-1".into()), Quality::General)
            .await
            .unwrap();
        wait_until_idle(&handle).await;

        let archive = handle.bundle().await.unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 1);
        assert_eq!(zip.by_index(0).unwrap().name(), "portrait.jpg-processed.png");
    }

    #[tokio::test]
    async fn test_bad_file_rejected_without_blocking_siblings() {
        let handle = spawn_engine(
            1,
            Arc::new(FakeProvider::instant()),
            Arc::new(TestGate::with_balance(10)),
            Arc::new(NoopResultStore),
        );

        let report = handle
            .add_files(vec![
                png_file("good.png", 8, 8),
                IncomingFile {
                    file_name: "broken.png".to_string(),
                    content_type: Some("image/png".to_string()),
                    bytes: b"definitely not a png".to_vec(),
                },
                png_file("also-good.png", 8, 8),
            ])
            .await
            .unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].file_name, "broken.png");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.totals.queued, 2);
    }

    #[test]
    fn test_prepare_error_kinds_map_to_file_names() {
        let err = PrepareError::UnsupportedFormat {
            file_name: "x.gif".into(),
        };
        assert_eq!(err.file_name(), "x.gif");
    }
}

// Inference worker: an isolated execution unit that turns one queued image
// into a cutout.
//
// Each worker runs on its own OS thread and owns its loaded model, cached
// across jobs until a job requests a different quality tier. It processes
// strictly one job at a time: the blocking receive loop cannot accept a
// second job while one is unresolved.

use anyhow::{Context, Result};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::core::types::{Job, Quality, WorkerEvent, WorkerReply};
use crate::services::compositor;
use crate::services::segmentation::{Segmenter, SegmenterProvider};

pub(crate) fn run(
    worker_id: usize,
    provider: Arc<dyn SegmenterProvider>,
    jobs: Receiver<Job>,
    events: UnboundedSender<WorkerEvent>,
) {
    let mut loaded: Option<(Quality, Box<dyn Segmenter>)> = None;

    // Ends when the pool drops this worker's job sender
    for job in jobs.iter() {
        let item_id = job.id;
        let started = Instant::now();

        let send = |reply: WorkerReply| {
            // A closed channel means the coordinator is gone; nothing left
            // to report to.
            let _ = events.send(WorkerEvent {
                worker_id,
                item_id,
                reply,
            });
        };

        match process_job(worker_id, provider.as_ref(), &mut loaded, &job, &send) {
            Ok(cutout) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                debug!(
                    "Worker {} finished item {} in {:.2}ms",
                    worker_id, item_id, elapsed_ms
                );
                send(WorkerReply::Done { cutout, elapsed_ms });
            }
            Err(e) => {
                warn!("Worker {} failed item {}: {:#}", worker_id, item_id, e);
                send(WorkerReply::Error {
                    message: format!("{:#}", e),
                });
            }
        }
    }

    debug!("Worker {} shutting down", worker_id);
}

/// Run one job to completion: ensure the right model is loaded, decode,
/// segment, composite, encode.
///
/// No retry happens here; a failure surfaces once and retry policy stays
/// with the coordinator's caller.
fn process_job(
    worker_id: usize,
    provider: &dyn SegmenterProvider,
    loaded: &mut Option<(Quality, Box<dyn Segmenter>)>,
    job: &Job,
    send: &dyn Fn(WorkerReply),
) -> Result<Vec<u8>> {
    // Lazy (re)load: first job ever, or the quality tier changed. This is
    // blocking and may take seconds; it is allowed on the critical path.
    let needs_load = match loaded {
        Some((quality, _)) => *quality != job.quality,
        None => true,
    };
    if needs_load {
        info!(
            "Worker {} loading {} model",
            worker_id,
            job.quality.as_str()
        );
        let segmenter = provider.load(job.quality)?;
        *loaded = Some((job.quality, segmenter));
        send(WorkerReply::Progress { pct: 10 });
    }
    let (_, segmenter) = loaded.as_mut().expect("model loaded above");

    let image =
        image::load_from_memory(&job.image).context("Failed to decode queued image")?;

    // Mid-progress checkpoint before the (long) inference call, so the
    // coordinator gets partial-progress visibility.
    send(WorkerReply::Progress { pct: 50 });

    let mask = segmenter.segment(&image)?;
    compositor::cutout_png(&image, &mask)
}

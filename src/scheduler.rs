//! Polling scheduler.
//!
//! One loop per queue instance: sleep, run an iteration, adjust the interval.
//! Backoff is additive-increase on empty iterations and resets to the floor
//! whenever rows come through; at the ceiling the replica unregisters its
//! liveness node until work resumes, so long-idle replicas drop out of the
//! hash ring.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use snafu::prelude::*;
use tracing::{debug, trace, warn};

use crate::commit::{CommitCoordinator, IterationSummary};
use crate::emit;
use crate::error::{QueueError, TaskJoinSnafu};
use crate::iterator::FileIterator;
use crate::metrics::events::{IterationStarted, PollingInterval};
use crate::queue::QueueInner;
use crate::source::{CommitThresholds, ProcessingProgress, ProcessingSource};

/// Next polling interval: reset to the floor after a productive iteration,
/// otherwise one additive step up, capped at the ceiling.
pub(crate) fn next_interval(current: u64, rows: u64, min: u64, max: u64, step: u64) -> u64 {
    if rows > 0 {
        min
    } else {
        current.saturating_add(step).clamp(min, max.max(min))
    }
}

/// Run one full iteration: list, claim, process, commit.
pub(crate) async fn run_iteration(inner: &Arc<QueueInner>) -> Result<IterationSummary, QueueError> {
    emit!(IterationStarted {
        target: inner.target.clone(),
    });
    let settings = inner.metadata.settings();
    let listing = inner.store.list(settings.list_objects_batch_size).await?;
    if listing.is_empty() {
        trace!(target = %inner.target, "Listing empty");
        return Ok(IterationSummary::default());
    }

    let iterator = FileIterator::new(
        Arc::clone(&inner.metadata),
        listing,
        None,
        inner.shutdown.child_token(),
    )
    .await?;
    let iterator = Arc::new(tokio::sync::Mutex::new(iterator));
    let progress = Arc::new(ProcessingProgress::new());
    let thresholds = CommitThresholds::from_settings(&settings);

    // Fill phase: workers race on the shared iterator until it runs dry or
    // a threshold fires.
    let mut workers = Vec::with_capacity(settings.processing_threads_num);
    for worker_id in 0..settings.processing_threads_num {
        let mut source = ProcessingSource::new(
            worker_id,
            inner.target.clone(),
            Arc::clone(&iterator),
            Arc::clone(&inner.store),
            Arc::clone(&inner.parser),
            Arc::clone(&progress),
            thresholds,
            inner.shutdown.child_token(),
        );
        workers.push(tokio::spawn(async move {
            let result = source.run().await;
            (source, result)
        }));
    }

    let mut sources = Vec::with_capacity(workers.len());
    let mut worker_error = None;
    for worker in workers {
        let (source, result) = worker.await.context(TaskJoinSnafu)?;
        if let Err(err) = result {
            worker_error.get_or_insert(err);
        }
        sources.push(source);
    }

    // Commit phase: whatever the workers finished is committed even when one
    // of them hit a coordination error; unfinished claims just expire.
    let coordinator = CommitCoordinator::new(Arc::clone(&inner.metadata), Arc::clone(&inner.store));
    let mut iterator_guard = iterator.lock().await;
    let summary = coordinator
        .commit(&mut sources, &mut iterator_guard, &inner.sink)
        .await;
    iterator_guard.release_all_buckets().await;
    drop(iterator_guard);

    if let Some(err) = worker_error {
        warn!(target = %inner.target, error = %err, "Worker failed during iteration");
    }
    summary
}

/// The long-running polling loop of one queue instance.
pub(crate) async fn run_queue_loop(inner: Arc<QueueInner>) {
    let settings = inner.metadata.settings();
    // Jittered first poll so replicas started together do not stampede.
    let mut interval = if settings.polling_min_timeout_ms > 0 {
        rand::rng().random_range(0..=settings.polling_min_timeout_ms)
    } else {
        0
    };
    let mut registered = true;

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
        }
        let settings = inner.metadata.settings();
        if inner.dependents.load(Ordering::SeqCst) == 0 {
            trace!(target = %inner.target, "No dependents attached");
            interval = settings.polling_max_timeout_ms.min(
                interval.saturating_add(settings.polling_backoff_ms),
            );
            continue;
        }

        let rows = match run_iteration(&inner).await {
            Ok(summary) => summary.rows,
            Err(err) => {
                warn!(target = %inner.target, error = %err, "Iteration failed");
                0
            }
        };

        interval = next_interval(
            interval,
            rows,
            settings.polling_min_timeout_ms,
            settings.polling_max_timeout_ms,
            settings.polling_backoff_ms,
        );
        emit!(PollingInterval {
            interval_ms: interval,
            target: inner.target.clone(),
        });

        // Idle replicas leave the liveness set; the hash ring redistributes
        // their keys until they wake up again.
        if rows > 0 {
            if !registered {
                inner.metadata.register_replica().await;
                registered = true;
            }
        } else if registered && interval >= settings.polling_max_timeout_ms {
            debug!(target = %inner.target, "Idle at maximum backoff, unregistering");
            inner.metadata.unregister_replica().await;
            registered = false;
        }
    }
    debug!(target = %inner.target, "Polling loop stopped");
}

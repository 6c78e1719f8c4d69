use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::pipeline::Pipeline;
use crate::TARGET_PIPELINE;

/// Dedicated pipeline worker: pop one queued run descriptor at a time and
/// execute it to its terminal state. Runs until cancelled.
///
/// Triggers return to their caller after the synchronous status flip; this
/// loop is where the long-running work actually happens.
pub async fn pipeline_loop(pipeline: Arc<Pipeline>, worker_id: usize, mut cancel_rx: watch::Receiver<bool>) {
    info!(target: TARGET_PIPELINE, "[pipeline worker {}]: starting", worker_id);
    let poll_interval = Duration::from_secs(pipeline.config().poll_interval_secs);

    loop {
        if *cancel_rx.borrow() {
            break;
        }

        match pipeline.db().fetch_and_delete_queued_case().await {
            Ok(Some(case_id)) => {
                info!(target: TARGET_PIPELINE, "[pipeline worker {}]: picked up case {}", worker_id, case_id);
                pipeline.execute_case(&case_id).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                error!(target: TARGET_PIPELINE, "[pipeline worker {}]: queue fetch failed: {}", worker_id, e);
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }

    info!(target: TARGET_PIPELINE, "[pipeline worker {}]: stopped", worker_id);
}

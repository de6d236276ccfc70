//! Concurrent per-image association runner
//!
//! Images are processed as independent sessions on a tokio `JoinSet`,
//! bounded by a semaphore. A session that loses a commit race is re-run with
//! backoff; every image ends with exactly one [`ImageReport`].

use crate::models::{ImageBatch, ImageReport};
use crate::utils::retry_on_conflict;
use crate::workflow::SessionOrchestrator;
use skycat_common::Error;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs association sessions for many images concurrently
#[derive(Clone)]
pub struct AssociationRunner {
    orchestrator: Arc<SessionOrchestrator>,
    max_concurrent: usize,
    max_retries: u32,
}

impl AssociationRunner {
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        let max_concurrent = orchestrator.config().max_concurrent_images.max(1);
        let max_retries = orchestrator.config().max_conflict_retries;
        Self {
            orchestrator: Arc::new(orchestrator),
            max_concurrent,
            max_retries,
        }
    }

    /// Associate one image, retrying on write conflicts
    pub async fn process_one(&self, batch: &ImageBatch, cancel_token: &CancellationToken) -> ImageReport {
        process_image(&self.orchestrator, self.max_retries, batch, cancel_token).await
    }

    /// Associate all batches; reports are returned in input order
    pub async fn run(&self, batches: Vec<ImageBatch>, cancel_token: CancellationToken) -> Vec<ImageReport> {
        let total = batches.len();
        let image_ids: Vec<String> = batches.iter().map(|b| b.image_id().to_string()).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        tracing::info!(
            images = total,
            max_concurrent = self.max_concurrent,
            "Starting association run"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let cancel_token = cancel_token.clone();
            let max_retries = self.max_retries;

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            failed(batch.image_id(), &Error::Internal("worker pool closed".to_string()), 0),
                        )
                    }
                };
                let report = process_image(&orchestrator, max_retries, &batch, &cancel_token).await;
                (index, report)
            });
        }

        let mut slots: Vec<Option<ImageReport>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => tracing::error!(error = %e, "Association worker task failed"),
            }
        }

        let reports: Vec<ImageReport> = slots
            .into_iter()
            .zip(image_ids)
            .map(|(slot, image_id)| {
                slot.unwrap_or_else(|| {
                    failed(&image_id, &Error::Internal("worker task panicked".to_string()), 0)
                })
            })
            .collect();

        let committed = reports.iter().filter(|r| r.is_committed()).count();
        let skipped = reports
            .iter()
            .filter(|r| matches!(r, ImageReport::Skipped { .. }))
            .count();
        tracing::info!(
            images = total,
            committed,
            skipped,
            failed = total - committed - skipped,
            "Association run complete"
        );

        reports
    }
}

async fn process_image(
    orchestrator: &SessionOrchestrator,
    max_retries: u32,
    batch: &ImageBatch,
    cancel_token: &CancellationToken,
) -> ImageReport {
    let outcome = retry_on_conflict("associate_image", max_retries, move |attempt| {
        orchestrator.associate(batch, attempt, cancel_token)
    })
    .await;

    match outcome.result {
        Ok(session) => ImageReport::Committed(session),
        Err(Error::AlreadyProcessed(image_id)) => ImageReport::Skipped {
            image_id,
            reason: "image already processed".to_string(),
        },
        Err(err) => failed(batch.image_id(), &err, outcome.attempts),
    }
}

fn failed(image_id: &str, err: &Error, attempts: u32) -> ImageReport {
    ImageReport::Failed {
        image_id: image_id.to_string(),
        reason_code: err.reason_code().to_string(),
        message: err.to_string(),
        attempts,
    }
}

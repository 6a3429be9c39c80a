//! Streaming batch API: emit outcomes as documents finish.
//!
//! [`crate::process::Pipeline::process_batch`] collects everything into a
//! report; [`batch_stream`] yields `(job index, outcome)` pairs in
//! completion order instead, so callers can report or move files while the
//! rest of the batch is still running. Sort by index if order matters.

use crate::output::DocumentOutcome;
use crate::process::{DocumentJob, Pipeline};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// A boxed stream of `(job index, outcome)` pairs.
pub type OutcomeStream = Pin<Box<dyn Stream<Item = (usize, DocumentOutcome)> + Send>>;

/// Process `jobs` with `config.concurrency` documents in flight.
///
/// Cancelling `cancel` ends the source: jobs not yet started are dropped,
/// documents already in flight run to completion and are still yielded.
/// Progress callbacks fire per document.
pub fn batch_stream(pipeline: &Pipeline, jobs: Vec<DocumentJob>, cancel: CancellationToken) -> OutcomeStream {
    let concurrency = pipeline.config().concurrency.max(1);
    let pipeline = Arc::new(pipeline.clone());

    let s = stream::iter(jobs.into_iter().enumerate())
        .take_until(cancel.cancelled_owned())
        .map(move |(index, job)| {
            let pipeline = Arc::clone(&pipeline);
            async move {
                let cb = pipeline.config().progress_callback.clone();
                if let Some(ref cb) = cb {
                    cb.on_document_start(index, &job.input);
                }
                let outcome = pipeline.process_document(&job).await;
                if let Some(ref cb) = cb {
                    match &outcome {
                        DocumentOutcome::Stamped { artifact, .. } => {
                            cb.on_document_stamped(index, &job.input, &artifact.path)
                        }
                        DocumentOutcome::Rejected { reason, message, .. } => {
                            cb.on_document_rejected(index, &job.input, *reason, message)
                        }
                    }
                }
                (index, outcome)
            }
        })
        .buffer_unordered(concurrency);

    Box::pin(s)
}
